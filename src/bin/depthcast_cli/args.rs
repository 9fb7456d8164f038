//! Command-line surface for `depthcast-cli`.

#![deny(clippy::all, clippy::pedantic)]

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint};

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8000";

#[derive(Parser, Debug)]
#[command(name = "depthcast-cli", version, about = "depthcast render broker client", long_about = None)]
pub struct Cli {
    /// Broker base URL, e.g. <http://127.0.0.1:8000>
    #[arg(long, env = "DEPTHCAST_SERVER_URL", default_value = DEFAULT_SERVER_URL)]
    pub server: String,

    /// Give up on a single HTTP request after this many seconds
    #[arg(long, default_value_t = 120)]
    pub timeout_seconds: u64,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit one job and save the resulting video
    Render(RenderArgs),
    /// Submit many concurrent jobs, one per simulated client
    Bench(BenchArgs),
    /// Print a job's canonical form and fingerprint without contacting the server
    Fingerprint(FingerprintArgs),
    /// Show broker health
    Health,
}

/// Where the job comes from: a JSON file, or defaults around an image.
#[derive(Args, Debug, Clone, Default)]
pub struct JobSource {
    /// Job description as JSON
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub job: Option<PathBuf>,

    /// Image locator used when no job file is given
    #[arg(long, value_name = "PATH_OR_URL", conflicts_with = "job")]
    pub image: Option<String>,
}

#[derive(Args, Debug)]
pub struct RenderArgs {
    #[command(flatten)]
    pub source: JobSource,

    /// Where to write the video; defaults to `video.<format>`
    #[arg(long, short, value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub output: Option<PathBuf>,

    /// Override the job priority
    #[arg(long, allow_negative_numbers = true)]
    pub priority: Option<i32>,

    /// Override how long the result stays cached, in seconds
    #[arg(long)]
    pub expire: Option<u64>,
}

#[derive(Args, Debug)]
pub struct BenchArgs {
    #[command(flatten)]
    pub source: JobSource,

    /// Number of concurrent clients; client `i` submits with priority `i`
    #[arg(long, short, default_value_t = 1)]
    pub jobs: u32,

    /// Directory receiving `video-<i>.<format>`; defaults to the system temp dir
    #[arg(long, value_name = "DIR", value_hint = ValueHint::DirPath)]
    pub output_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct FingerprintArgs {
    #[command(flatten)]
    pub source: JobSource,
}
