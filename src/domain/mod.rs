//! Domain layer: job identity, validation and result states.

pub mod error;
pub mod fingerprint;
pub mod job;
pub mod result;

pub use error::JobValidationError;
pub use fingerprint::{FingerprintKey, FingerprintParseError, canonical_json, fingerprint};
pub use job::validate_job;
pub use result::{Outcome, RenderArtifact, RenderFailure, ResultState};
