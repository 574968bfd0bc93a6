// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! serve-exec, the installed-command wrapper
//!
//! Commands installed by `served` are symlinks to this binary. When
//! invoked through one, it asks the daemon which container owns the
//! command, joins that container and execs the real executable. It can
//! also be driven explicitly with `--container`/`--path`.

use std::error::Error as StdError;
use std::path::PathBuf;

use clap::Parser;
use wire::{Address, Category, Connection, Fault, Packet, Procedure, Reply, Request, Response};

#[derive(Debug, Parser)]
#[command(name = "serve-exec", about = "Run an installed command inside its container")]
struct Args {
    /// Daemon address
    #[arg(long, default_value = "/run/chef/served.sock")]
    address: Address,

    /// Container id, bypassing the daemon lookup
    #[arg(long)]
    container: Option<String>,

    /// Executable path inside the container
    #[arg(long)]
    path: Option<PathBuf>,

    /// Working directory inside the container
    #[arg(long, default_value = "/")]
    wdir: PathBuf,

    /// Arguments handed to the command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() {
    let invoked = std::env::args().next().unwrap_or_default();

    if let Err(error) = run(&invoked) {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

fn run(invoked: &str) -> Result<(), Box<dyn StdError>> {
    let invoked_path = PathBuf::from(invoked);
    let wrapped = invoked_path.file_name().and_then(|n| n.to_str()) != Some("serve-exec");

    let args = if wrapped {
        // Symlink invocation: everything after argv[0] goes to the command
        Args {
            address: "/run/chef/served.sock".parse()?,
            container: None,
            path: None,
            wdir: "/".into(),
            args: std::env::args().skip(1).collect(),
        }
    } else {
        Args::parse()
    };

    let (container_id, path, wdir, command_args) = match (&args.container, &args.path) {
        (Some(container), Some(path)) => (container.clone(), path.clone(), args.wdir.clone(), args.args.clone()),
        _ => {
            let record = lookup(&args.address, &invoked_path)?;
            let mut full_args = record.arguments;
            full_args.extend(args.args.clone());
            (record.container_id, record.path, record.cwd, full_args)
        }
    };

    // On success this never returns
    container::join::join(&container_id, &path.to_string_lossy(), &command_args, &wdir)?;

    unreachable!("join returned without error");
}

/// Ask served which container and executable own the invoked path
fn lookup(address: &Address, invoked_path: &PathBuf) -> Result<wire::CommandRecord, Box<dyn StdError>> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;

    runtime.block_on(async {
        let mut connection = Connection::connect(address).await?;

        connection
            .send(&Packet::Request(Request {
                id: 1,
                procedure: Procedure::GetCommand {
                    invoked_path: invoked_path.clone(),
                },
            }))
            .await?;

        loop {
            match connection.receive().await? {
                Packet::Response(Response { outcome, .. }) => {
                    return match outcome {
                        Ok(Reply::Command { record }) => Ok(record),
                        Ok(_) => Err(Box::from(Fault::new(Category::Internal, "unexpected reply"))),
                        Err(fault) => Err(Box::from(fault)),
                    };
                }
                // Events on this connection are not ours to handle
                _ => continue,
            }
        }
    })
}
