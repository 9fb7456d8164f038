use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the depthcast server.
#[derive(Debug, Parser)]
#[command(name = "depthcast", version, about = "Depth-parallax render broker")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "DEPTHCAST_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP service and the render workers.
    Serve(Box<ServeArgs>),
    /// Resolve and validate configuration, print it and exit.
    #[command(name = "check-config")]
    CheckConfig(Box<ServeArgs>),
}

impl Command {
    pub fn overrides(&self) -> &ServeOverrides {
        match self {
            Command::Serve(args) | Command::CheckConfig(args) => &args.overrides,
        }
    }
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the number of render worker threads.
    #[arg(long = "workers", value_name = "COUNT")]
    pub workers: Option<u32>,

    /// Override the render queue depth limit (0 disables the limit).
    #[arg(long = "queue-capacity", value_name = "COUNT")]
    pub queue_capacity: Option<u32>,

    /// Override the number of requests served concurrently.
    #[arg(long = "max-inflight-requests", value_name = "COUNT")]
    pub max_inflight_requests: Option<u32>,

    /// Override how long a request waits for its render.
    #[arg(long = "timeout-seconds", value_name = "SECONDS")]
    pub timeout_seconds: Option<u64>,

    /// Override the result cache size in mebibytes.
    #[arg(long = "cache-size-mb", value_name = "MB")]
    pub cache_size_mb: Option<u64>,

    /// Persist results under this directory instead of in memory.
    #[arg(long = "cache-directory", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub cache_directory: Option<PathBuf>,

    /// Override the renderer executable.
    #[arg(long = "renderer-program", value_name = "PATH", value_hint = ValueHint::ExecutablePath)]
    pub renderer_program: Option<PathBuf>,

    /// Override the renderer scratch directory.
    #[arg(long = "renderer-work-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub renderer_work_dir: Option<PathBuf>,
}
