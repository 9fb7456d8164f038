#![deny(clippy::all, clippy::pedantic)]

use std::fs;
use std::path::Path;

use depthcast_api_types::JobConfig;

use crate::args::JobSource;
use crate::client::CliError;

/// Build the job described by `source`: a JSON file, an image, or the defaults.
pub fn load_job(source: &JobSource) -> Result<JobConfig, CliError> {
    if let Some(path) = &source.job {
        let data = fs::read_to_string(path).map_err(|source| CliError::InputFile {
            path: path.display().to_string(),
            source,
        })?;
        return serde_json::from_str(&data).map_err(|e| {
            CliError::InvalidInput(format!("{} is not a valid job: {e}", path.display()))
        });
    }
    Ok(match &source.image {
        Some(image) => JobConfig::for_image(image.clone()),
        None => JobConfig::default(),
    })
}

pub fn write_output(path: &Path, bytes: &[u8]) -> Result<(), CliError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| CliError::OutputFile {
            path: parent.display().to_string(),
            source,
        })?;
    }
    fs::write(path, bytes).map_err(|source| CliError::OutputFile {
        path: path.display().to_string(),
        source,
    })
}
