#![deny(clippy::all, clippy::pedantic)]

use std::path::Path;

use serde::Serialize;

use crate::client::{CliError, RenderReply};

pub fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    let out = serde_json::to_string_pretty(value)
        .map_err(|e| CliError::InvalidInput(format!("failed to render output: {e}")))?;
    println!("{out}");
    Ok(())
}

pub fn render_summary(reply: &RenderReply, path: &Path) -> String {
    let took = reply
        .took
        .map_or_else(|| "?".to_string(), |took| format!("{took:.2}s"));
    format!(
        "saved {} ({} bytes) took={took} cached={}",
        path.display(),
        reply.bytes.len(),
        reply.cached
    )
}
