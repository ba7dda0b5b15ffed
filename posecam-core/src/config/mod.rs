//! config — the immutable per-session run configuration
//!
//! Built once at startup (CLI flags and/or a JSON file) and passed by
//! reference into the frame loop. Nothing in the loop mutates it.

use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

/// Which estimator variant to load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelConfig {
    pub architecture: String,
    pub output_stride: u32,
    pub input_resolution: u32,
    pub multiplier: f32,
    pub quant_bytes: u32,
    /// Explicit ONNX file. When absent the variant fields derive the default
    /// filename, resolved relative to the working directory.
    pub model_path: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            architecture: "mobilenet-v1".into(),
            output_stride: 16,
            input_resolution: 256,
            multiplier: 0.75,
            quant_bytes: 2,
            model_path: None,
        }
    }
}

impl ModelConfig {
    /// Path of the ONNX export to load: the explicit path when given,
    /// otherwise a filename derived from the variant fields.
    pub fn resolve_path(&self) -> PathBuf {
        match &self.model_path {
            Some(path) => path.clone(),
            None => PathBuf::from(format!(
                "pose-{}-{:03}-{}-s{}-q{}.onnx",
                self.architecture,
                (self.multiplier * 100.0).round() as u32,
                self.input_resolution,
                self.output_stride,
                self.quant_bytes,
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecodingMode {
    /// Keep only the strongest detection.
    SinglePose,
    #[default]
    MultiPose,
}

/// Estimator invocation parameters and confidence thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DetectionConfig {
    pub decoding: DecodingMode,
    /// Mirror keypoint x coordinates so overlays match a mirrored frame.
    pub flip_horizontal: bool,
    pub max_detections: usize,
    /// A pose below this renders nothing at all.
    pub min_pose_confidence: f32,
    /// Per-keypoint filter, also the estimator's proposal score threshold.
    pub min_part_confidence: f32,
    /// De-duplication distance between detections, in frame pixels.
    pub nms_radius: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            decoding: DecodingMode::MultiPose,
            flip_horizontal: true,
            max_detections: 5,
            min_pose_confidence: 0.15,
            min_part_confidence: 0.1,
            nms_radius: 30.0,
        }
    }
}

/// Which overlay layers to draw.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OutputConfig {
    pub show_video: bool,
    pub show_skeleton: bool,
    pub show_points: bool,
    pub show_bounding_box: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            show_video: true,
            show_skeleton: true,
            show_points: true,
            show_bounding_box: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunConfig {
    pub model: ModelConfig,
    pub detection: DetectionConfig,
    pub output: OutputConfig,
}

impl RunConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {}", path.as_ref().display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config file {}", path.as_ref().display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.model.input_resolution > 0,
            "input resolution must be positive"
        );
        ensure!(self.model.multiplier > 0.0, "multiplier must be positive");
        ensure!(
            self.detection.max_detections >= 1,
            "max detections must be at least 1"
        );
        for (name, value) in [
            ("minPoseConfidence", self.detection.min_pose_confidence),
            ("minPartConfidence", self.detection.min_part_confidence),
        ] {
            ensure!(
                (0.0..=1.0).contains(&value),
                "{name} must be within [0, 1], got {value}"
            );
        }
        ensure!(
            self.detection.nms_radius >= 0.0,
            "nms radius must be non-negative"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_demo_session() {
        let config = RunConfig::default();
        assert_eq!(config.detection.max_detections, 5);
        assert_eq!(config.detection.min_pose_confidence, 0.15);
        assert_eq!(config.detection.min_part_confidence, 0.1);
        assert_eq!(config.detection.nms_radius, 30.0);
        assert!(config.detection.flip_horizontal);
        assert!(config.output.show_video);
        assert!(config.output.show_skeleton);
        assert!(config.output.show_points);
        assert!(!config.output.show_bounding_box);
        config.validate().unwrap();
    }

    #[test]
    fn derived_model_filename_encodes_the_variant() {
        let model = ModelConfig::default();
        assert_eq!(
            model.resolve_path(),
            PathBuf::from("pose-mobilenet-v1-075-256-s16-q2.onnx")
        );
        let explicit = ModelConfig {
            model_path: Some(PathBuf::from("custom.onnx")),
            ..ModelConfig::default()
        };
        assert_eq!(explicit.resolve_path(), PathBuf::from("custom.onnx"));
    }

    #[test]
    fn validate_rejects_out_of_range_thresholds() {
        let mut config = RunConfig::default();
        config.detection.min_pose_confidence = 1.5;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.detection.max_detections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: RunConfig =
            serde_json::from_str(r#"{"detection": {"minPoseConfidence": 0.3}}"#).unwrap();
        assert_eq!(config.detection.min_pose_confidence, 0.3);
        assert_eq!(config.detection.max_detections, 5);
        assert_eq!(config.model.output_stride, 16);
    }
}
