//! Turns the gate result and the classifier's distribution into one verdict.

use serde::Serialize;

use crate::classifier::ProbabilityVector;
use crate::config::PolicyConfig;
use crate::error::InferenceError;
use crate::labels::LabelSet;

/// Final outcome of one analysis. Exactly one variant per run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verdict {
    /// Confident match; confidence is in percent.
    Diagnosis { label: String, confidence: f64 },
    /// Rejected by the leaf gate, the classifier was not run.
    NotAPlant,
    /// Near-uniform distribution: the subject resembles none of the classes.
    Unsupported,
    LowConfidence { confidence: f64 },
    AnalysisFailed { reason: String },
}

impl Verdict {
    /// Short machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Verdict::Diagnosis { .. } => "diagnosis",
            Verdict::NotAPlant => "not_a_plant",
            Verdict::Unsupported => "unsupported",
            Verdict::LowConfidence { .. } => "low_confidence",
            Verdict::AnalysisFailed { .. } => "analysis_failed",
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            Verdict::Diagnosis { label, .. } => Some(label),
            _ => None,
        }
    }

    pub fn confidence(&self) -> Option<f64> {
        match self {
            Verdict::Diagnosis { confidence, .. } | Verdict::LowConfidence { confidence } => {
                Some(*confidence)
            }
            _ => None,
        }
    }
}

/// Summary of a probability vector used by the policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DistributionStats {
    pub argmax: usize,
    /// Top score times 100.
    pub top_confidence: f64,
    pub std_dev: f64,
}

impl DistributionStats {
    pub fn of(probs: &ProbabilityVector) -> Self {
        let (argmax, top) = probs.argmax();
        Self {
            argmax,
            top_confidence: f64::from(top) * 100.0,
            std_dev: probs.std_dev(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VerdictPolicy {
    config: PolicyConfig,
}

impl VerdictPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Full decision for one run. `classify` is only invoked for plant-like
    /// images.
    pub fn decide<F>(&self, is_plant: bool, labels: &LabelSet, classify: F) -> Verdict
    where
        F: FnOnce() -> Result<ProbabilityVector, InferenceError>,
    {
        self.decide_detailed(is_plant, labels, classify).0
    }

    /// Like [`decide`](Self::decide), also returning the distribution summary
    /// when the classifier produced one.
    pub fn decide_detailed<F>(
        &self,
        is_plant: bool,
        labels: &LabelSet,
        classify: F,
    ) -> (Verdict, Option<DistributionStats>)
    where
        F: FnOnce() -> Result<ProbabilityVector, InferenceError>,
    {
        if !is_plant {
            return (Verdict::NotAPlant, None);
        }
        match classify() {
            Ok(probs) => {
                let stats = DistributionStats::of(&probs);
                (self.judge_stats(stats, labels), Some(stats))
            }
            Err(err) => {
                tracing::warn!("classification failed: {err}");
                (
                    Verdict::AnalysisFailed {
                        reason: err.to_string(),
                    },
                    None,
                )
            }
        }
    }

    pub fn judge(&self, probs: &ProbabilityVector, labels: &LabelSet) -> Verdict {
        self.judge_stats(DistributionStats::of(probs), labels)
    }

    /// Uncertainty check first, then confidence. Both thresholds are
    /// inclusive on the passing side.
    pub fn judge_stats(&self, stats: DistributionStats, labels: &LabelSet) -> Verdict {
        if stats.std_dev < self.config.min_std_dev {
            return Verdict::Unsupported;
        }
        if stats.top_confidence < self.config.min_confidence_percent {
            return Verdict::LowConfidence {
                confidence: stats.top_confidence,
            };
        }
        match labels.get(stats.argmax) {
            Some(label) => Verdict::Diagnosis {
                label: label.to_string(),
                confidence: stats.top_confidence,
            },
            None => Verdict::AnalysisFailed {
                reason: format!(
                    "class index {} is outside the {}-label set",
                    stats.argmax,
                    labels.len()
                ),
            },
        }
    }
}
