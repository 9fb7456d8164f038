//! Per-fingerprint result states.

use bytes::Bytes;
use time::OffsetDateTime;

/// Bytes produced by a successful render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderArtifact {
    pub bytes: Bytes,
    pub produced_at: OffsetDateTime,
}

impl RenderArtifact {
    pub fn new(bytes: Bytes) -> Self {
        Self {
            bytes,
            produced_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Error message recorded for a failed render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderFailure {
    pub message: String,
    pub produced_at: OffsetDateTime,
}

impl RenderFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            produced_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Terminal result of processing one job.
///
/// Kept separate from [`ResultState`] so a pending marker can never be
/// written through a terminal write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(RenderArtifact),
    Failure(RenderFailure),
}

impl Outcome {
    pub fn success(bytes: impl Into<Bytes>) -> Self {
        Self::Success(RenderArtifact::new(bytes.into()))
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure(RenderFailure::new(message))
    }

    /// Bytes charged against the store's capacity.
    pub fn size_bytes(&self) -> u64 {
        match self {
            Self::Success(artifact) => artifact.bytes.len() as u64,
            Self::Failure(failure) => failure.message.len() as u64,
        }
    }

    pub fn produced_at(&self) -> OffsetDateTime {
        match self {
            Self::Success(artifact) => artifact.produced_at,
            Self::Failure(failure) => failure.produced_at,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// What the store holds for a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultState {
    /// Admitted and not finished yet.
    Pending,
    Success(RenderArtifact),
    Failure(RenderFailure),
}

impl ResultState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl From<Outcome> for ResultState {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success(artifact) => Self::Success(artifact),
            Outcome::Failure(failure) => Self::Failure(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_counts_payload_bytes() {
        assert_eq!(Outcome::success(vec![0u8; 10]).size_bytes(), 10);
        assert_eq!(Outcome::failure("boom").size_bytes(), 4);
    }

    #[test]
    fn outcome_maps_to_terminal_state() {
        let state = ResultState::from(Outcome::failure("boom"));
        assert!(state.is_terminal());
        assert!(matches!(state, ResultState::Failure(ref failure) if failure.message == "boom"));
        assert!(!ResultState::Pending.is_terminal());
    }
}
