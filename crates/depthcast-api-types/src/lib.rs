//! Wire types shared by the depthcast server and its clients.
//!
//! A [`JobConfig`] is the body of `POST /render`. Every section is optional on
//! the wire and falls back to the same defaults the server uses, so `{}` is a
//! valid (if boring) job.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Header carrying the request wall time in seconds, formatted with two decimals.
pub const TOOK_HEADER: &str = "took";
/// Header carrying `"true"` when the artifact was already cached on the first check.
pub const CACHED_HEADER: &str = "cached";

pub const DEFAULT_IMAGE: &str = "https://w.wallhaven.cc/full/pk/wallhaven-pkz5r9.png";
pub const DEFAULT_ESTIMATOR: &str = "depth-anything-v2";
pub const DEFAULT_UPSCALER: &str = "none";
pub const DEFAULT_CODEC: &str = "h264";
pub const DEFAULT_EXPIRE_SECS: u64 = 3600;

/// Free-form model parameters, kept sorted so they serialize deterministically.
pub type Params = BTreeMap<String, Value>;

/// Full description of one render request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub input: InputRefs,
    pub estimator: EstimatorConfig,
    pub animation: AnimationConfig,
    pub upscaler: UpscalerConfig,
    pub render: RenderParams,
    pub ffmpeg: EncoderConfig,
    /// Seconds the finished result stays cached. Not part of the job identity.
    pub expire: u64,
    /// Scheduling hint; higher runs first. Not part of the job identity.
    pub priority: i32,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            input: InputRefs::default(),
            estimator: EstimatorConfig::default(),
            animation: AnimationConfig::default(),
            upscaler: UpscalerConfig::default(),
            render: RenderParams::default(),
            ffmpeg: EncoderConfig::default(),
            expire: DEFAULT_EXPIRE_SECS,
            priority: 0,
        }
    }
}

impl JobConfig {
    /// Convenience constructor for a job rendering `image` with default settings.
    pub fn for_image(image: impl Into<String>) -> Self {
        Self {
            input: InputRefs {
                image: image.into(),
                depth: None,
            },
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_expire(mut self, expire: u64) -> Self {
        self.expire = expire;
        self
    }
}

/// Image and optional depth-map locators (file path or http(s) URL).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputRefs {
    pub image: String,
    pub depth: Option<String>,
}

impl Default for InputRefs {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            depth: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub model: String,
    #[serde(flatten)]
    pub params: Params,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_ESTIMATOR.to_string(),
            params: Params::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnimationConfig {
    /// Applied in order; reordering steps changes the output.
    pub steps: Vec<AnimationStep>,
}

/// One motion preset, component or post-processing filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimationStep {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub params: Params,
}

impl AnimationStep {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: Params::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpscalerConfig {
    pub model: String,
    #[serde(flatten)]
    pub params: Params,
}

impl Default for UpscalerConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_UPSCALER.to_string(),
            params: Params::new(),
        }
    }
}

/// Output geometry, timing and container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderParams {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: f64,
    /// Duration of one loop in seconds.
    pub time: f64,
    #[serde(rename = "loop")]
    pub loops: u32,
    pub ssaa: f64,
    pub quality: u8,
    pub format: VideoFormat,
}

impl Default for RenderParams {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            fps: 60.0,
            time: 10.0,
            loops: 1,
            ssaa: 1.0,
            quality: 50,
            format: VideoFormat::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub codec: String,
    #[serde(flatten)]
    pub params: Params,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            codec: DEFAULT_CODEC.to_string(),
            params: Params::new(),
        }
    }
}

/// Output container. Determines the `video/<format>` content type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    #[default]
    Mp4,
    Webm,
    Mkv,
    Mov,
    Avi,
    Gif,
}

impl VideoFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
            Self::Mkv => "mkv",
            Self::Mov => "mov",
            Self::Avi => "avi",
            Self::Gif => "gif",
        }
    }

    pub fn content_type(self) -> String {
        format!("video/{}", self.as_str())
    }
}

impl fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_uses_defaults() {
        let job: JobConfig = serde_json::from_str("{}").expect("empty job parses");
        assert_eq!(job, JobConfig::default());
        assert_eq!(job.expire, DEFAULT_EXPIRE_SECS);
        assert_eq!(job.render.format, VideoFormat::Mp4);
    }

    #[test]
    fn steps_keep_type_and_extra_params() {
        let job: JobConfig = serde_json::from_str(
            r#"{"animation":{"steps":[{"type":"orbital","intensity":1.5},{"type":"lens"}]}}"#,
        )
        .expect("job parses");

        let steps = &job.animation.steps;
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].kind, "orbital");
        assert_eq!(steps[0].params.get("intensity"), Some(&Value::from(1.5)));
        assert!(steps[1].params.is_empty());
    }

    #[test]
    fn loop_field_uses_wire_name() {
        let job: JobConfig =
            serde_json::from_str(r#"{"render":{"loop":3,"format":"webm"}}"#).expect("job parses");
        assert_eq!(job.render.loops, 3);
        assert_eq!(job.render.format.content_type(), "video/webm");

        let encoded = serde_json::to_value(&job).expect("job encodes");
        assert_eq!(encoded["render"]["loop"], Value::from(3));
    }
}
