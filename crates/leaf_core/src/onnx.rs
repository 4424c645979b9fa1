//! ONNX Runtime backend for the disease model.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use ndarray::{ArrayView4, CowArray};
use once_cell::sync::Lazy;
use ort::{
    GraphOptimizationLevel, SessionBuilder, environment::Environment, session::Session,
    tensor::OrtOwnedTensor, value::Value,
};

use crate::classifier::{LazyModel, ProbabilityModel};

static ORT_ENV: Lazy<Arc<Environment>> = Lazy::new(|| {
    Environment::builder()
        .with_name("leaf-doctor")
        .build()
        .expect("failed to initialize ONNX Runtime environment")
        .into_arc()
});

/// Disease model exported to ONNX, run on the CPU.
pub struct OnnxModel {
    session: Session,
}

impl OnnxModel {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("model file is missing: {}", path.display());
        }
        let env = ORT_ENV.clone();
        let session = SessionBuilder::new(&env)?
            .with_optimization_level(GraphOptimizationLevel::Level1)?
            .with_model_from_file(path)?;
        tracing::info!("loaded ONNX model from {}", path.display());
        Ok(Self { session })
    }

    /// Handle that opens `path` on first use.
    pub fn lazy(path: impl Into<PathBuf>) -> LazyModel {
        let path = path.into();
        LazyModel::new(move || {
            let model: Box<dyn ProbabilityModel> = Box::new(OnnxModel::load(&path)?);
            Ok(model)
        })
    }
}

impl ProbabilityModel for OnnxModel {
    fn predict(&self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>> {
        let cow = CowArray::from(input.into_dyn());
        let input = Value::from_array(self.session.allocator(), &cow)
            .map_err(|e| anyhow!("cannot build input tensor: {e}"))?;
        let outputs: Vec<Value> = self.session.run(vec![input])?;
        if outputs.is_empty() {
            anyhow::bail!("model produced no output");
        }
        let scores: OrtOwnedTensor<f32, _> = outputs[0].try_extract()?;
        let scores: Vec<f32> = scores.view().iter().cloned().collect();
        if scores.is_empty() {
            anyhow::bail!("model produced an empty score vector");
        }
        Ok(scores)
    }
}
