//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU64, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::application::GatewayPolicy;

mod cli;

pub use cli::{CliArgs, Command, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "depthcast";
const ENV_PREFIX: &str = "DEPTHCAST";
#[cfg(unix)]
const DEFAULT_HOST: &str = "0.0.0.0";
#[cfg(not(unix))]
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_WORKERS: u64 = 3;
const DEFAULT_QUEUE_CAPACITY: u64 = 20;
const DEFAULT_MAX_INFLIGHT_REQUESTS: u64 = 64;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PENDING_TTL_SECS: u64 = 30;
const DEFAULT_CACHE_SIZE_MB: u64 = 500;
pub(crate) const DEFAULT_RENDERER_PROGRAM: &str = "depthflow";
const DEFAULT_RENDERER_WORK_DIR: &str = "depthcast";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub broker: BrokerSettings,
    pub cache: CacheSettings,
    pub renderer: RendererSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub workers: NonZeroUsize,
    /// `None` leaves the queue unbounded.
    pub queue_capacity: Option<NonZeroUsize>,
    pub max_inflight_requests: NonZeroUsize,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub pending_ttl: Duration,
}

impl BrokerSettings {
    pub fn gateway_policy(&self) -> GatewayPolicy {
        GatewayPolicy {
            poll_interval: self.poll_interval,
            timeout: self.timeout,
            pending_ttl: self.pending_ttl,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub size_mb: NonZeroU64,
    /// `None` keeps results in memory only.
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RendererSettings {
    pub program: PathBuf,
    pub work_dir: PathBuf,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(command) => raw.apply_serve_overrides(command.overrides()),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    broker: RawBrokerSettings,
    cache: RawCacheSettings,
    renderer: RawRendererSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(workers) = overrides.workers {
            self.broker.workers = Some(workers.into());
        }
        if let Some(capacity) = overrides.queue_capacity {
            self.broker.queue_capacity = Some(capacity.into());
        }
        if let Some(max) = overrides.max_inflight_requests {
            self.broker.max_inflight_requests = Some(max.into());
        }
        if let Some(seconds) = overrides.timeout_seconds {
            self.broker.timeout_seconds = Some(seconds);
        }
        if let Some(size) = overrides.cache_size_mb {
            self.cache.size_mb = Some(size);
        }
        if let Some(directory) = overrides.cache_directory.as_ref() {
            self.cache.directory = Some(directory.clone());
        }
        if let Some(program) = overrides.renderer_program.as_ref() {
            self.renderer.program = Some(program.clone());
        }
        if let Some(dir) = overrides.renderer_work_dir.as_ref() {
            self.renderer.work_dir = Some(dir.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            broker,
            cache,
            renderer,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            broker: build_broker_settings(broker)?,
            cache: build_cache_settings(cache)?,
            renderer: build_renderer_settings(renderer)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_broker_settings(broker: RawBrokerSettings) -> Result<BrokerSettings, LoadError> {
    let workers = non_zero_usize(
        broker.workers.unwrap_or(DEFAULT_WORKERS),
        "broker.workers",
    )?;

    let queue_capacity = match broker.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY) {
        0 => None,
        value => Some(non_zero_usize(value, "broker.queue_capacity")?),
    };

    let max_inflight_requests = non_zero_usize(
        broker
            .max_inflight_requests
            .unwrap_or(DEFAULT_MAX_INFLIGHT_REQUESTS),
        "broker.max_inflight_requests",
    )?;

    let poll_interval_ms = broker.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
    if poll_interval_ms == 0 {
        return Err(LoadError::invalid(
            "broker.poll_interval_ms",
            "must be greater than zero",
        ));
    }

    let timeout_secs = broker.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "broker.timeout_seconds",
            "must be greater than zero",
        ));
    }

    let pending_ttl_secs = broker
        .pending_ttl_seconds
        .unwrap_or(DEFAULT_PENDING_TTL_SECS);
    if pending_ttl_secs == 0 {
        return Err(LoadError::invalid(
            "broker.pending_ttl_seconds",
            "must be greater than zero",
        ));
    }

    let poll_interval = Duration::from_millis(poll_interval_ms);
    let timeout = Duration::from_secs(timeout_secs);
    if poll_interval > timeout {
        return Err(LoadError::invalid(
            "broker.poll_interval_ms",
            "must not exceed broker.timeout_seconds",
        ));
    }

    Ok(BrokerSettings {
        workers,
        queue_capacity,
        max_inflight_requests,
        poll_interval,
        timeout,
        pending_ttl: Duration::from_secs(pending_ttl_secs),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let size_mb = NonZeroU64::new(cache.size_mb.unwrap_or(DEFAULT_CACHE_SIZE_MB))
        .ok_or_else(|| LoadError::invalid("cache.size_mb", "must be greater than zero"))?;
    size_mb.get().checked_mul(1024 * 1024).ok_or_else(|| {
        LoadError::invalid("cache.size_mb", "value exceeds supported range for bytes")
    })?;

    let directory = match cache.directory {
        Some(dir) if dir.as_os_str().is_empty() => {
            return Err(LoadError::invalid(
                "cache.directory",
                "path must not be empty",
            ));
        }
        other => other,
    };

    Ok(CacheSettings { size_mb, directory })
}

fn build_renderer_settings(renderer: RawRendererSettings) -> Result<RendererSettings, LoadError> {
    let program = renderer
        .program
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RENDERER_PROGRAM));
    if program.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "renderer.program",
            "path must not be empty",
        ));
    }

    let work_dir = renderer
        .work_dir
        .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_RENDERER_WORK_DIR));
    if work_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "renderer.work_dir",
            "path must not be empty",
        ));
    }

    let timeout = match renderer.timeout_seconds {
        Some(0) => {
            return Err(LoadError::invalid(
                "renderer.timeout_seconds",
                "must be greater than zero",
            ));
        }
        other => other.map(Duration::from_secs),
    };

    Ok(RendererSettings {
        program,
        work_dir,
        timeout,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBrokerSettings {
    workers: Option<u64>,
    queue_capacity: Option<u64>,
    max_inflight_requests: Option<u64>,
    poll_interval_ms: Option<u64>,
    timeout_seconds: Option<u64>,
    pending_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    size_mb: Option<u64>,
    directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRendererSettings {
    program: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    timeout_seconds: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
