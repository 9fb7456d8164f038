#![deny(clippy::all, clippy::pedantic)]

use depthcast::domain::{canonical_json, fingerprint};

use crate::args::FingerprintArgs;
use crate::client::CliError;
use crate::io::load_job;

pub fn handle(cmd: &FingerprintArgs) -> Result<(), CliError> {
    let job = load_job(&cmd.source)?;
    println!("{}", canonical_json(&job));
    println!("{}", fingerprint(&job));
    Ok(())
}
