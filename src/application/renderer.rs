use std::io;
use std::time::Duration;

use bytes::Bytes;
use depthcast_api_types::JobConfig;
use thiserror::Error;

/// Errors a renderer can surface. The message becomes the body of the `500`
/// response every poller of the job receives.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("renderer exited with status {exit_code:?}: {stderr}")]
    Command {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("renderer executable unavailable: {0}")]
    NotFound(io::Error),
    #[error("renderer did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("renderer produced no output")]
    EmptyOutput,
    #[error("renderer i/o failure: {0}")]
    Io(#[from] io::Error),
    #[error("render rejected: {0}")]
    Rejected(String),
    #[error("renderer panicked: {0}")]
    Panicked(String),
}

impl RenderError {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Command { .. } => "command",
            Self::NotFound(_) => "not_found",
            Self::TimedOut(_) => "timed_out",
            Self::EmptyOutput => "empty_output",
            Self::Io(_) => "io",
            Self::Rejected(_) => "rejected",
            Self::Panicked(_) => "panicked",
        }
    }
}

/// Produces the artifact for a job.
///
/// Called from worker threads and allowed to block for as long as rendering
/// takes. Implementations should be idempotent: the same job yields an
/// equivalent artifact or the same failure.
pub trait Renderer: Send + Sync {
    fn render(&self, job: &JobConfig) -> Result<Bytes, RenderError>;
}

impl<F> Renderer for F
where
    F: Fn(&JobConfig) -> Result<Bytes, RenderError> + Send + Sync,
{
    fn render(&self, job: &JobConfig) -> Result<Bytes, RenderError> {
        self(job)
    }
}
