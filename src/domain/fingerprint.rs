//! Deterministic job fingerprints.
//!
//! A fingerprint is the SHA-256 of the job's canonical JSON. The canonical
//! form covers every field that affects the rendered output and nothing else:
//! `priority` and `expire` are bookkeeping and stay out of it.
//!
//! Canonical JSON rules:
//! - object keys sorted bytewise, no whitespace
//! - arrays keep their order
//! - integral floats written as integers, `-0.0` written as `0`
//! - other floats in shortest round-trip form

use std::fmt;
use std::str::FromStr;

use depthcast_api_types::{
    AnimationConfig, EncoderConfig, EstimatorConfig, InputRefs, JobConfig, RenderParams,
    UpscalerConfig,
};
use serde::Serialize;
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

const DIGEST_LEN: usize = 32;
// Floats at or above 2^53 are not guaranteed to be exact integers.
/// 2^63 and 2^64. Both are exact in `f64`, so range checks against them
/// guarantee a lossless cast.
const I64_END: f64 = 9_223_372_036_854_775_808.0;
const U64_END: f64 = 18_446_744_073_709_551_616.0;

/// Fixed-width digest identifying what a job renders.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FingerprintKey([u8; DIGEST_LEN]);

impl FingerprintKey {
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First twelve hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for FingerprintKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for FingerprintKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FingerprintKey({})", self.short())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum FingerprintParseError {
    #[error("fingerprint must be {expected} hex characters, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("fingerprint is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

impl FromStr for FingerprintKey {
    type Err = FingerprintParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.len() != DIGEST_LEN * 2 {
            return Err(FingerprintParseError::Length {
                expected: DIGEST_LEN * 2,
                actual: value.len(),
            });
        }
        let mut bytes = [0u8; DIGEST_LEN];
        hex::decode_to_slice(value, &mut bytes)?;
        Ok(Self(bytes))
    }
}

/// The identity-bearing part of a job.
#[derive(Serialize)]
struct JobIdentity<'a> {
    input: &'a InputRefs,
    estimator: &'a EstimatorConfig,
    animation: &'a AnimationConfig,
    upscaler: &'a UpscalerConfig,
    render: &'a RenderParams,
    ffmpeg: &'a EncoderConfig,
}

impl<'a> From<&'a JobConfig> for JobIdentity<'a> {
    fn from(job: &'a JobConfig) -> Self {
        Self {
            input: &job.input,
            estimator: &job.estimator,
            animation: &job.animation,
            upscaler: &job.upscaler,
            render: &job.render,
            ffmpeg: &job.ffmpeg,
        }
    }
}

/// Canonical JSON encoding of the job's identity fields.
pub fn canonical_json(job: &JobConfig) -> String {
    // All map keys are strings and non-finite floats encode as null, so
    // converting the identity view to a value tree cannot fail.
    let value = serde_json::to_value(JobIdentity::from(job)).unwrap_or(Value::Null);
    let mut out = String::with_capacity(256);
    write_canonical(&value, &mut out);
    out
}

/// Compute the fingerprint of `job`.
pub fn fingerprint(job: &JobConfig) -> FingerprintKey {
    let canonical = canonical_json(job);
    let digest = Sha256::digest(canonical.as_bytes());
    let mut bytes = [0u8; DIGEST_LEN];
    bytes.copy_from_slice(&digest);
    FingerprintKey(bytes)
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
        Value::Number(number) => write_number(number, out),
        Value::String(text) => write_string(text, out),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_unstable_by(|(a, _), (b, _)| a.as_bytes().cmp(b.as_bytes()));

            out.push('{');
            for (index, (key, item)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
    }
}

fn write_number(number: &Number, out: &mut String) {
    if let Some(int) = number.as_i64() {
        out.push_str(&int.to_string());
        return;
    }
    if let Some(uint) = number.as_u64() {
        out.push_str(&uint.to_string());
        return;
    }

    // Integral floats are written the way an integer of the same value is.
    match number.as_f64() {
        Some(float) if float == 0.0 => out.push('0'),
        Some(float) if float.fract() == 0.0 && (-I64_END..I64_END).contains(&float) => {
            out.push_str(&(float as i64).to_string());
        }
        Some(float) if float.fract() == 0.0 && (0.0..U64_END).contains(&float) => {
            out.push_str(&(float as u64).to_string());
        }
        _ => out.push_str(&number.to_string()),
    }
}

fn write_string(text: &str, out: &mut String) {
    out.push_str(&Value::String(text.to_owned()).to_string());
}
