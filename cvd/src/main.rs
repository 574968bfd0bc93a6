// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! cvd, the container virtualization daemon
//!
//! Owns every long-lived build container on the host and exposes the
//! container operations over the wire protocol. Request failures are
//! answered with a fault; the daemon itself never exits on them.

use std::error::Error as StdError;
use std::io;

use clap::Parser;
use wire::Address;

mod optimizer;
mod server;

#[derive(Debug, Parser)]
#[command(name = "cvd", about = "Container virtualization daemon", version)]
struct Args {
    /// Listen address: a socket path, `@abstract`, or `ip:port`
    #[arg(long, default_value = "/run/chef/cvd/cvd.sock")]
    address: Address,

    /// Log level
    #[arg(long, default_value = "info")]
    log: tracing_subscriber::filter::LevelFilter,

    /// Parallelism for batch container startup
    #[arg(long, default_value_t = optimizer::DEFAULT_PARALLEL_LIMIT)]
    parallel_limit: usize,
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
    let server = server::Cvd::new(args.parallel_limit)?;

    server.serve(&args.address).await?;

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
