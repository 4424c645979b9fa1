//! Leaf photo triage: decode an upload, reject images that do not look like a
//! leaf, classify the rest into one of the known (plant, condition) classes
//! and decide whether the result is trustworthy enough to report.

pub mod classifier;
pub mod config;
pub mod decode;
pub mod error;
pub mod gate;
pub mod labels;
#[cfg(feature = "ort")]
pub mod onnx;
pub mod pipeline;
pub mod scan;
pub mod verdict;

pub use classifier::{DiseaseClassifier, LazyModel, ProbabilityModel, ProbabilityVector};
pub use config::{
    ChannelOrder, ClassifierConfig, GateConfig, PipelineConfig, PolicyConfig, TensorLayout,
};
pub use decode::{Image, decode_image};
pub use error::{ConfigError, DecodeError, InferenceError};
pub use gate::{GateVerdict, LeafGate, LeafStats};
pub use labels::LabelSet;
#[cfg(feature = "ort")]
pub use onnx::OnnxModel;
pub use pipeline::{Analysis, Pipeline};
pub use scan::{ScanOptions, ScanOutcome, ScanRow, analyze_files, export_csv, scan_folder};
pub use verdict::{DistributionStats, Verdict, VerdictPolicy};
