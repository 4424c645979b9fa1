//! Tunable thresholds and model settings, loadable from TOML.
//!
//! Every threshold defaults to the value the bundled model was calibrated
//! with. None of them has a documented derivation, so they are exposed here
//! instead of being fixed in the gate or policy code.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Parameters of the green-area / edge-density leaf heuristic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Green-area ratio above which an image is plant-like on color alone.
    pub green_ratio_threshold: f32,
    /// Lower green ratio accepted when the edge ratio is also high enough.
    pub textured_green_ratio: f32,
    pub edge_ratio_threshold: f32,
    /// Hue band on the 0–180 scale, inclusive.
    pub hue_min: f32,
    pub hue_max: f32,
    pub min_saturation: u8,
    pub min_value: u8,
    /// Side of the Gaussian smoothing kernel; odd, at least 3.
    pub blur_kernel: u32,
    pub edge_low_threshold: f32,
    pub edge_high_threshold: f32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            green_ratio_threshold: 0.30,
            textured_green_ratio: 0.15,
            edge_ratio_threshold: 0.05,
            hue_min: 25.0,
            hue_max: 95.0,
            min_saturation: 40,
            min_value: 40,
            blur_kernel: 5,
            edge_low_threshold: 50.0,
            edge_high_threshold: 150.0,
        }
    }
}

/// Thresholds applied to the classifier's output distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Distributions flatter than this (population std dev) are unsupported.
    pub min_std_dev: f64,
    /// Top-class confidence, in percent, required for a diagnosis.
    pub min_confidence_percent: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            min_std_dev: 0.02,
            min_confidence_percent: 80.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// `[1, H, W, C]`
    Nhwc,
    /// `[1, C, H, W]`
    Nchw,
}

/// Input contract of the disease model.
///
/// Each channel value `v` in 0..=255 is fed as `(v * rescale - mean) / std`.
/// The defaults pass raw intensities, which is what the bundled model
/// was trained on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub model_path: PathBuf,
    /// Optional label file; the built-in 33-class list is used when absent.
    pub labels_path: Option<PathBuf>,
    pub input_size: u32,
    pub layout: TensorLayout,
    pub channel_order: ChannelOrder,
    pub rescale: f32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    /// Set when the model emits logits instead of probabilities.
    pub apply_softmax: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/leaf_disease.onnx"),
            labels_path: None,
            input_size: 150,
            layout: TensorLayout::Nhwc,
            channel_order: ChannelOrder::Rgb,
            rescale: 1.0,
            mean: [0.0; 3],
            std: [1.0; 3],
            apply_softmax: false,
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub gate: GateConfig,
    pub policy: PolicyConfig,
    pub classifier: ClassifierConfig,
}

impl PipelineConfig {
    /// Reads and validates a TOML file. Missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let gate = &self.gate;
        unit_interval("gate.green_ratio_threshold", gate.green_ratio_threshold)?;
        unit_interval("gate.textured_green_ratio", gate.textured_green_ratio)?;
        unit_interval("gate.edge_ratio_threshold", gate.edge_ratio_threshold)?;
        if !(0.0..=180.0).contains(&gate.hue_min)
            || !(0.0..=180.0).contains(&gate.hue_max)
            || gate.hue_min > gate.hue_max
        {
            return Err(invalid(
                "gate.hue_min",
                format!(
                    "hue band {}..{} must lie within 0..180",
                    gate.hue_min, gate.hue_max
                ),
            ));
        }
        if gate.blur_kernel < 3 || gate.blur_kernel % 2 == 0 {
            return Err(invalid(
                "gate.blur_kernel",
                format!("{} is not an odd size of at least 3", gate.blur_kernel),
            ));
        }
        if gate.edge_low_threshold < 0.0 || gate.edge_low_threshold > gate.edge_high_threshold {
            return Err(invalid(
                "gate.edge_low_threshold",
                format!(
                    "{} must be non-negative and not above edge_high_threshold {}",
                    gate.edge_low_threshold, gate.edge_high_threshold
                ),
            ));
        }

        let policy = &self.policy;
        if !policy.min_std_dev.is_finite() || policy.min_std_dev < 0.0 {
            return Err(invalid(
                "policy.min_std_dev",
                format!("{} must be a non-negative number", policy.min_std_dev),
            ));
        }
        if !(0.0..=100.0).contains(&policy.min_confidence_percent) {
            return Err(invalid(
                "policy.min_confidence_percent",
                format!("{} is not a percentage", policy.min_confidence_percent),
            ));
        }

        let classifier = &self.classifier;
        if classifier.input_size == 0 {
            return Err(invalid("classifier.input_size", "must be positive".into()));
        }
        if classifier.std.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(invalid(
                "classifier.std",
                format!("{:?} must be strictly positive", classifier.std),
            ));
        }
        Ok(())
    }
}

fn unit_interval(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(field, format!("{value} is outside 0..=1")))
    }
}

fn invalid(field: &'static str, reason: String) -> ConfigError {
    ConfigError::Invalid { field, reason }
}
