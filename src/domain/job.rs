//! Boundary validation for incoming jobs.
//!
//! The broker never inspects a job beyond fingerprinting it, but rejecting
//! obviously broken jobs at the edge keeps them out of the queue and out of
//! the cache.

use depthcast_api_types::{JobConfig, RenderParams};
use url::Url;

use super::error::JobValidationError;

const MAX_SSAA: f64 = 4.0;
const MAX_QUALITY: u8 = 100;
const ALLOWED_SCHEMES: [&str; 3] = ["http", "https", "file"];

/// Check that `job` is renderable in principle.
pub fn validate_job(job: &JobConfig) -> Result<(), JobValidationError> {
    validate_locator("input.image", &job.input.image)?;
    if let Some(depth) = job.input.depth.as_deref() {
        validate_locator("input.depth", depth)?;
    }

    if job.estimator.model.trim().is_empty() {
        return Err(JobValidationError::new(
            "estimator.model",
            "model name must not be empty",
        ));
    }

    for (index, step) in job.animation.steps.iter().enumerate() {
        if step.kind.trim().is_empty() {
            return Err(JobValidationError::new(
                "animation.steps",
                format!("step {index} has an empty type"),
            ));
        }
    }

    if job.expire == 0 {
        return Err(JobValidationError::new(
            "expire",
            "must be at least one second",
        ));
    }

    validate_render(&job.render)
}

fn validate_locator(field: &'static str, locator: &str) -> Result<(), JobValidationError> {
    let trimmed = locator.trim();
    if trimmed.is_empty() {
        return Err(JobValidationError::new(field, "locator must not be empty"));
    }

    if trimmed.contains("://") {
        let url = Url::parse(trimmed)
            .map_err(|err| JobValidationError::new(field, format!("invalid url: {err}")))?;
        if !ALLOWED_SCHEMES.contains(&url.scheme()) {
            return Err(JobValidationError::new(
                field,
                format!("unsupported url scheme `{}`", url.scheme()),
            ));
        }
    }

    Ok(())
}

fn validate_render(render: &RenderParams) -> Result<(), JobValidationError> {
    if render.width == Some(0) {
        return Err(JobValidationError::new(
            "render.width",
            "must be greater than zero",
        ));
    }
    if render.height == Some(0) {
        return Err(JobValidationError::new(
            "render.height",
            "must be greater than zero",
        ));
    }
    if !(render.fps.is_finite() && render.fps > 0.0) {
        return Err(JobValidationError::new(
            "render.fps",
            "must be a positive number",
        ));
    }
    if !(render.time.is_finite() && render.time > 0.0) {
        return Err(JobValidationError::new(
            "render.time",
            "must be a positive number",
        ));
    }
    if render.loops == 0 {
        return Err(JobValidationError::new(
            "render.loop",
            "must be greater than zero",
        ));
    }
    if !(render.ssaa.is_finite() && render.ssaa > 0.0 && render.ssaa <= MAX_SSAA) {
        return Err(JobValidationError::new(
            "render.ssaa",
            format!("must be within (0, {MAX_SSAA}]"),
        ));
    }
    if render.quality > MAX_QUALITY {
        return Err(JobValidationError::new(
            "render.quality",
            format!("must be at most {MAX_QUALITY}"),
        ));
    }
    Ok(())
}
