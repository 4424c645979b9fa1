//! Bytes in, verdict out.

use std::sync::Arc;

use serde::Serialize;

use crate::classifier::{DiseaseClassifier, LazyModel};
use crate::config::PipelineConfig;
use crate::decode::{Image, decode_image};
use crate::error::{ConfigError, DecodeError};
use crate::gate::{GateVerdict, LeafGate};
use crate::labels::LabelSet;
use crate::verdict::{DistributionStats, Verdict, VerdictPolicy};

/// Verdict plus the intermediate measurements that led to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analysis {
    pub verdict: Verdict,
    pub width: u32,
    pub height: u32,
    pub gate: GateVerdict,
    /// Present only when the classifier ran and produced scores.
    pub distribution: Option<DistributionStats>,
}

/// Decoder, leaf gate, classifier and policy wired together. Holds no
/// per-run state, so one instance serves any number of runs.
#[derive(Debug)]
pub struct Pipeline {
    gate: LeafGate,
    classifier: DiseaseClassifier,
    policy: VerdictPolicy,
}

impl Pipeline {
    /// Builds a pipeline from configuration. The label file, when configured,
    /// is read here; the model is not loaded until the first plant-like image.
    pub fn from_config(config: &PipelineConfig, model: LazyModel) -> Result<Self, ConfigError> {
        config.validate()?;
        let labels = match &config.classifier.labels_path {
            Some(path) => Arc::new(LabelSet::from_file(path)?),
            None => LabelSet::plant_village(),
        };
        Ok(Self::new(
            LeafGate::new(config.gate.clone()),
            DiseaseClassifier::new(config.classifier.clone(), labels, model),
            VerdictPolicy::new(config.policy.clone()),
        ))
    }

    pub fn new(gate: LeafGate, classifier: DiseaseClassifier, policy: VerdictPolicy) -> Self {
        Self {
            gate,
            classifier,
            policy,
        }
    }

    pub fn labels(&self) -> &LabelSet {
        self.classifier.labels()
    }

    pub fn classifier(&self) -> &DiseaseClassifier {
        &self.classifier
    }

    /// Decodes and analyzes one upload. Undecodable bytes stop here, before
    /// the gate or the model see anything.
    pub fn analyze(&self, bytes: &[u8]) -> Result<Verdict, DecodeError> {
        Ok(self.run(bytes)?.verdict)
    }

    pub fn run(&self, bytes: &[u8]) -> Result<Analysis, DecodeError> {
        let image = decode_image(bytes)?;
        Ok(self.run_image(&image))
    }

    pub fn analyze_image(&self, image: &Image) -> Verdict {
        self.run_image(image).verdict
    }

    pub fn run_image(&self, image: &Image) -> Analysis {
        let gate = self.gate.evaluate(image);
        let (verdict, distribution) =
            self.policy
                .decide_detailed(gate.is_plant(), self.classifier.labels(), || {
                    self.classifier.classify(image)
                });
        tracing::debug!(verdict = verdict.kind(), "analysis finished");
        Analysis {
            verdict,
            width: image.width(),
            height: image.height(),
            gate,
            distribution,
        }
    }
}
