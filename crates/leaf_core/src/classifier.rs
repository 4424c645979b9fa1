//! Adapter around the trained disease model.
//!
//! The model itself is opaque: it takes a `[1, 150, 150, 3]` tensor and returns
//! one score per label. Everything around it (channel order, resizing,
//! normalization, output validation, lazy loading) lives here.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use fast_image_resize::{
    FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer, images::Image as ResizeImage,
};
use ndarray::{Array4, ArrayView4};
use once_cell::sync::OnceCell;
use serde::Serialize;

use crate::config::{ChannelOrder, ClassifierConfig, TensorLayout};
use crate::decode::Image;
use crate::error::InferenceError;
use crate::labels::LabelSet;

/// Anything that maps an input tensor to one score per label.
pub trait ProbabilityModel: Send + Sync {
    fn predict(&self, input: ArrayView4<'_, f32>) -> anyhow::Result<Vec<f32>>;
}

type Loader = Box<dyn Fn() -> anyhow::Result<Box<dyn ProbabilityModel>> + Send + Sync>;

/// Model handle loaded on first use.
///
/// Concurrent first use runs the loader once. A failed load is not
/// remembered; the next call tries again.
pub struct LazyModel {
    loader: Loader,
    model: OnceCell<Box<dyn ProbabilityModel>>,
}

impl LazyModel {
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn() -> anyhow::Result<Box<dyn ProbabilityModel>> + Send + Sync + 'static,
    {
        Self {
            loader: Box::new(loader),
            model: OnceCell::new(),
        }
    }

    /// Wraps a model that is already in memory.
    pub fn ready(model: impl ProbabilityModel + 'static) -> Self {
        let model: Box<dyn ProbabilityModel> = Box::new(model);
        Self {
            loader: Box::new(|| -> anyhow::Result<Box<dyn ProbabilityModel>> {
                anyhow::bail!("model was supplied preloaded")
            }),
            model: OnceCell::with_value(model),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model.get().is_some()
    }

    pub fn get(&self) -> Result<&dyn ProbabilityModel, InferenceError> {
        self.model
            .get_or_try_init(|| {
                tracing::info!("loading disease model");
                (self.loader)()
            })
            .map(|m| &**m)
            .map_err(|e| InferenceError::ModelLoad(format!("{e:#}")))
    }
}

impl std::fmt::Debug for LazyModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyModel")
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

/// Classifier output: one non-negative, finite score per label, index-aligned
/// with the [`LabelSet`]. Never empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ProbabilityVector(Vec<f32>);

impl ProbabilityVector {
    pub fn new(scores: Vec<f32>, expected_len: usize) -> Result<Self, InferenceError> {
        if scores.len() != expected_len || scores.is_empty() {
            return Err(InferenceError::OutputLength {
                expected: expected_len,
                actual: scores.len(),
            });
        }
        if let Some((index, &value)) = scores
            .iter()
            .enumerate()
            .find(|(_, p)| !p.is_finite() || **p < 0.0)
        {
            return Err(InferenceError::InvalidScore { index, value });
        }
        Ok(Self(scores))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Index and value of the highest score; the first one wins ties.
    pub fn argmax(&self) -> (usize, f32) {
        self.0
            .iter()
            .copied()
            .enumerate()
            .fold((0, self.0[0]), |best, (i, p)| if p > best.1 { (i, p) } else { best })
    }

    /// Population standard deviation of the scores.
    pub fn std_dev(&self) -> f64 {
        let n = self.0.len() as f64;
        let mean = self.0.iter().map(|&p| f64::from(p)).sum::<f64>() / n;
        let var = self
            .0
            .iter()
            .map(|&p| (f64::from(p) - mean).powi(2))
            .sum::<f64>()
            / n;
        var.sqrt()
    }
}

/// Resizes and normalizes images for the model and validates its output.
#[derive(Debug)]
pub struct DiseaseClassifier {
    config: ClassifierConfig,
    labels: Arc<LabelSet>,
    model: LazyModel,
}

impl DiseaseClassifier {
    pub fn new(config: ClassifierConfig, labels: Arc<LabelSet>, model: LazyModel) -> Self {
        Self {
            config,
            labels,
            model,
        }
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn model(&self) -> &LazyModel {
        &self.model
    }

    /// One image, one inference. Panics inside the model are reported as
    /// [`InferenceError::Model`].
    pub fn classify(&self, image: &Image) -> Result<ProbabilityVector, InferenceError> {
        let tensor = self.prepare_input(image)?;
        let model = self.model.get()?;
        let raw = panic::catch_unwind(AssertUnwindSafe(|| model.predict(tensor.view())))
            .map_err(|_| InferenceError::Model("model panicked during inference".into()))?
            .map_err(|e| InferenceError::Model(format!("{e:#}")))?;
        let scores = if self.config.apply_softmax {
            softmax(&raw)?
        } else {
            raw
        };
        ProbabilityVector::new(scores, self.labels.len())
    }

    /// Builds the `[1, size, size, 3]` (or NCHW) input tensor.
    pub fn prepare_input(&self, image: &Image) -> Result<Array4<f32>, InferenceError> {
        let cfg = &self.config;
        if cfg.input_size == 0 {
            return Err(InferenceError::Preprocess("input size is zero".into()));
        }
        let resized = resize_square(image, cfg.input_size)?;
        let size = cfg.input_size as usize;
        let mut tensor = match cfg.layout {
            TensorLayout::Nhwc => Array4::<f32>::zeros((1, size, size, 3)),
            TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, size, size)),
        };
        for (i, px) in resized.chunks_exact(3).enumerate() {
            let (y, x) = (i / size, i % size);
            let ordered = match cfg.channel_order {
                ChannelOrder::Rgb => [px[0], px[1], px[2]],
                ChannelOrder::Bgr => [px[2], px[1], px[0]],
            };
            for (c, &value) in ordered.iter().enumerate() {
                let v = normalize_channel(value, cfg.rescale, cfg.mean[c], cfg.std[c]);
                match cfg.layout {
                    TensorLayout::Nhwc => tensor[[0, y, x, c]] = v,
                    TensorLayout::Nchw => tensor[[0, c, y, x]] = v,
                }
            }
        }
        Ok(tensor)
    }
}

/// Bilinear resize to `size`×`size`, returned as packed RGB bytes.
fn resize_square(image: &Image, size: u32) -> Result<Vec<u8>, InferenceError> {
    let rgb = image.as_rgb();
    let src = ResizeImage::from_vec_u8(
        rgb.width(),
        rgb.height(),
        rgb.as_raw().clone(),
        PixelType::U8x3,
    )
    .map_err(|e| InferenceError::Preprocess(e.to_string()))?;
    let mut dst = ResizeImage::new(size, size, PixelType::U8x3);
    let options = ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear));
    Resizer::new()
        .resize(&src, &mut dst, &options)
        .map_err(|e| InferenceError::Preprocess(e.to_string()))?;
    Ok(dst.buffer().to_vec())
}

fn normalize_channel(value: u8, rescale: f32, mean: f32, std: f32) -> f32 {
    (f32::from(value) * rescale - mean) / std
}

/// Logits must be finite; an empty slice stays empty.
fn softmax(logits: &[f32]) -> Result<Vec<f32>, InferenceError> {
    if let Some((index, &value)) = logits.iter().enumerate().find(|(_, x)| !x.is_finite()) {
        return Err(InferenceError::InvalidScore { index, value });
    }
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    Ok(exps.into_iter().map(|x| x / sum).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::{Rgb, RgbImage};
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct Fixed(Vec<f32>);

    impl ProbabilityModel for Fixed {
        fn predict(&self, _: ArrayView4<'_, f32>) -> anyhow::Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    impl ProbabilityModel for Failing {
        fn predict(&self, _: ArrayView4<'_, f32>) -> anyhow::Result<Vec<f32>> {
            anyhow::bail!("out of memory")
        }
    }

    struct Panicking;

    impl ProbabilityModel for Panicking {
        fn predict(&self, _: ArrayView4<'_, f32>) -> anyhow::Result<Vec<f32>> {
            panic!("boom")
        }
    }

    fn red_image() -> Image {
        Image::from_rgb(RgbImage::from_pixel(300, 200, Rgb([200, 10, 0]))).unwrap()
    }

    fn constant_model(scores: Vec<f32>) -> LazyModel {
        LazyModel::ready(Fixed(scores))
    }

    fn classifier(config: ClassifierConfig, model: LazyModel) -> DiseaseClassifier {
        DiseaseClassifier::new(config, LabelSet::plant_village(), model)
    }

    #[test]
    fn default_tensor_is_nhwc_150_raw_rgb() -> anyhow::Result<()> {
        let clf = classifier(ClassifierConfig::default(), constant_model(vec![]));
        let tensor = clf.prepare_input(&red_image())?;
        assert_eq!(tensor.shape(), &[1, 150, 150, 3]);
        assert_relative_eq!(tensor[[0, 75, 75, 0]], 200.0, epsilon = 1.0);
        assert_relative_eq!(tensor[[0, 75, 75, 1]], 10.0, epsilon = 1.0);
        assert_relative_eq!(tensor[[0, 75, 75, 2]], 0.0, epsilon = 1.0);
        Ok(())
    }

    #[test]
    fn bgr_nchw_normalized_tensor() -> anyhow::Result<()> {
        let config = ClassifierConfig {
            input_size: 32,
            layout: TensorLayout::Nchw,
            channel_order: ChannelOrder::Bgr,
            rescale: 1.0 / 255.0,
            mean: [0.5; 3],
            std: [0.5; 3],
            ..ClassifierConfig::default()
        };
        let clf = classifier(config, constant_model(vec![]));
        let tensor = clf.prepare_input(&red_image())?;
        assert_eq!(tensor.shape(), &[1, 3, 32, 32]);
        // channel 0 is blue now
        assert_relative_eq!(tensor[[0, 0, 5, 5]], -1.0, epsilon = 0.01);
        assert_relative_eq!(tensor[[0, 2, 5, 5]], (200.0 / 255.0 - 0.5) / 0.5, epsilon = 0.01);
        Ok(())
    }

    #[test]
    fn classify_returns_aligned_vector() -> anyhow::Result<()> {
        let mut scores = vec![0.0; 33];
        scores[7] = 1.0;
        let clf = classifier(ClassifierConfig::default(), constant_model(scores));
        let probs = clf.classify(&red_image())?;
        assert_eq!(probs.len(), 33);
        assert_eq!(probs.argmax(), (7, 1.0));
        Ok(())
    }

    #[test]
    fn wrong_output_length_is_an_inference_error() {
        let clf = classifier(ClassifierConfig::default(), constant_model(vec![0.5, 0.5]));
        let err = clf.classify(&red_image()).unwrap_err();
        assert!(matches!(
            err,
            InferenceError::OutputLength {
                expected: 33,
                actual: 2
            }
        ));
    }

    #[test]
    fn model_errors_and_panics_are_contained() {
        let failing = classifier(
            ClassifierConfig::default(),
            LazyModel::ready(Failing),
        );
        match failing.classify(&red_image()) {
            Err(InferenceError::Model(msg)) => assert!(msg.contains("out of memory")),
            other => panic!("expected model error, got {other:?}"),
        }

        let panicking = classifier(
            ClassifierConfig::default(),
            LazyModel::ready(Panicking),
        );
        assert!(matches!(
            panicking.classify(&red_image()),
            Err(InferenceError::Model(_))
        ));
    }

    #[test]
    fn softmax_option_turns_logits_into_probabilities() -> anyhow::Result<()> {
        let mut logits = vec![-3.0; 33];
        logits[2] = 5.0;
        let config = ClassifierConfig {
            apply_softmax: true,
            ..ClassifierConfig::default()
        };
        let probs = classifier(config, constant_model(logits)).classify(&red_image())?;
        let sum: f32 = probs.as_slice().iter().sum();
        assert_relative_eq!(sum, 1.0, epsilon = 1e-5);
        assert_eq!(probs.argmax().0, 2);
        Ok(())
    }

    #[rstest]
    #[case(f32::NAN)]
    #[case(f32::INFINITY)]
    #[case(f32::NEG_INFINITY)]
    fn non_finite_logit_is_an_inference_error(#[case] bad: f32) {
        let mut logits = vec![0.0; 33];
        logits[3] = bad;
        let config = ClassifierConfig {
            apply_softmax: true,
            ..ClassifierConfig::default()
        };
        let err = classifier(config, constant_model(logits))
            .classify(&red_image())
            .unwrap_err();
        assert!(matches!(err, InferenceError::InvalidScore { index: 3, .. }));
    }

    #[test]
    fn probability_vector_rejects_bad_scores() {
        assert!(matches!(
            ProbabilityVector::new(vec![0.1, f32::NAN], 2),
            Err(InferenceError::InvalidScore { index: 1, .. })
        ));
        assert!(matches!(
            ProbabilityVector::new(vec![-0.1, 0.2], 2),
            Err(InferenceError::InvalidScore { index: 0, .. })
        ));
        assert!(ProbabilityVector::new(vec![], 0).is_err());
    }

    #[test]
    fn argmax_prefers_first_of_equal_scores() -> anyhow::Result<()> {
        let probs = ProbabilityVector::new(vec![0.1, 0.4, 0.4, 0.1], 4)?;
        assert_eq!(probs.argmax(), (1, 0.4));
        Ok(())
    }

    #[test]
    fn std_dev_is_population_std_dev() -> anyhow::Result<()> {
        let probs = ProbabilityVector::new(vec![0.0, 1.0], 2)?;
        assert_relative_eq!(probs.std_dev(), 0.5, epsilon = 1e-12);
        let uniform = ProbabilityVector::new(vec![0.25; 4], 4)?;
        assert_relative_eq!(uniform.std_dev(), 0.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn model_loads_once_under_concurrent_first_use() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let model = Arc::new(LazyModel::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let m: Box<dyn ProbabilityModel> = Box::new(Fixed(vec![1.0]));
            Ok(m)
        }));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let model = Arc::clone(&model);
                thread::spawn(move || model.get().is_ok())
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(model.is_loaded());
    }

    #[test]
    fn failed_load_is_retried_on_next_use() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let model = LazyModel::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("model file missing");
            }
            let m: Box<dyn ProbabilityModel> = Box::new(Fixed(vec![1.0]));
            Ok(m)
        });
        assert!(matches!(model.get(), Err(InferenceError::ModelLoad(_))));
        assert!(!model.is_loaded());
        assert!(model.get().is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
