// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! served, the package applications daemon
//!
//! Installs packs onto the host, keeps the command registry that backs
//! the `serve-exec` wrapper, and reports transaction progress to its
//! clients. Request failures fail the transaction, never the daemon.

use std::error::Error as StdError;
use std::io;
use std::path::PathBuf;

use clap::Parser;
use wire::Address;

mod commands;
mod service;
mod transaction;

#[derive(Debug, Parser)]
#[command(name = "served", about = "Package applications daemon", version)]
struct Args {
    /// Listen address: a socket path, `@abstract`, or `ip:port`
    #[arg(long, default_value = "/run/chef/served.sock")]
    address: Address,

    /// Daemon state root
    #[arg(long, default_value = "/var/chef")]
    state_dir: PathBuf,

    /// Registry endpoint for fetching packs
    #[arg(long)]
    registry: Option<url::Url>,

    /// Log level
    #[arg(long, default_value = "info")]
    log: tracing_subscriber::filter::LevelFilter,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt().with_max_level(args.log).with_writer(io::stderr).init();

    if let Err(error) = run(args) {
        report_error(&*error);
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run(args: Args) -> Result<(), Box<dyn StdError>> {
    let service = service::Served::open(args.state_dir, args.registry)?;

    service.serve(&args.address).await?;

    Ok(())
}

fn report_error(error: &dyn StdError) {
    let mut sources = vec![error.to_string()];
    let mut source = error.source();
    while let Some(error) = source.take() {
        sources.push(error.to_string());
        source = error.source();
    }
    eprintln!("error: {}", sources.join(": "));
}
