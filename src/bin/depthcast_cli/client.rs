#![deny(clippy::all, clippy::pedantic)]

use std::time::Duration;

use bytes::Bytes;
use depthcast_api_types::{CACHED_HEADER, JobConfig, TOOK_HEADER};
use reqwest::{Client, Response, StatusCode, Url, header::CONTENT_TYPE};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("failed to read input file {path}: {source}")]
    InputFile {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to write output file {path}: {source}")]
    OutputFile {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered {status}: {body}")]
    Server { status: StatusCode, body: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// A finished render as seen by the client.
#[derive(Debug, Clone)]
pub struct RenderReply {
    pub bytes: Bytes,
    pub content_type: Option<String>,
    /// Server-side wall time in seconds.
    pub took: Option<f64>,
    pub cached: bool,
}

#[derive(Clone, Debug)]
pub struct Ctx {
    pub client: Client,
    pub base: Url,
}

impl Ctx {
    pub fn new(server: &str, timeout: Duration) -> Result<Self, CliError> {
        let base = Url::parse(server)?.join("/")?;
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(timeout)
            .build()?;
        Ok(Self { client, base })
    }

    pub fn user_agent() -> &'static str {
        concat!("depthcast-cli/", env!("CARGO_PKG_VERSION"))
    }

    pub fn url(&self, path: &str) -> Result<Url, CliError> {
        self.base.join(path).map_err(CliError::Url)
    }

    pub async fn render(&self, job: &JobConfig) -> Result<RenderReply, CliError> {
        let resp = self
            .client
            .post(self.url("render")?)
            .json(job)
            .send()
            .await?;
        let resp = Self::ensure_success(resp).await?;

        let headers = resp.headers();
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        };
        let content_type = header(CONTENT_TYPE.as_str());
        let took = header(TOOK_HEADER).and_then(|value| value.parse().ok());
        let cached = header(CACHED_HEADER).is_some_and(|value| value == "true");

        let bytes = resp.bytes().await?;
        Ok(RenderReply {
            bytes,
            content_type,
            took,
            cached,
        })
    }

    pub async fn health(&self) -> Result<serde_json::Value, CliError> {
        let resp = self.client.get(self.url("health")?).send().await?;
        let resp = Self::ensure_success(resp).await?;
        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CliError::InvalidInput(format!("failed to parse health body: {e}")))
    }

    async fn ensure_success(resp: Response) -> Result<Response, CliError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(CliError::Server { status, body })
    }
}

pub fn build_ctx(server: &str, timeout_seconds: u64) -> Result<Ctx, CliError> {
    if timeout_seconds == 0 {
        return Err(CliError::InvalidInput(
            "timeout must be at least one second".into(),
        ));
    }
    Ctx::new(server, Duration::from_secs(timeout_seconds))
}
