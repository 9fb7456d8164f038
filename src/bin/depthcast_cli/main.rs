//! depthcast-cli: submit jobs to a depthcast broker and inspect job identities.
#![deny(clippy::all, clippy::pedantic)]

mod args;
mod client;
mod handlers;
mod io;
mod print;


use clap::Parser;

use args::{Cli, Commands};
use client::{CliError, build_ctx};
use handlers::{bench, fingerprint, health, render};

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let Cli {
        server,
        timeout_seconds,
        command,
    } = Cli::parse();
    let connect = || build_ctx(&server, timeout_seconds);

    match command {
        Commands::Render(cmd) => render::handle(&connect()?, cmd).await?,
        Commands::Bench(cmd) => bench::handle(&connect()?, cmd).await?,
        Commands::Health => health::handle(&connect()?).await?,
        Commands::Fingerprint(cmd) => fingerprint::handle(&cmd)?,
    }

    Ok(())
}
