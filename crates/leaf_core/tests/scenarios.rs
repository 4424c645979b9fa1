use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use approx::assert_relative_eq;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use leaf_core::{
    DecodeError, GateVerdict, LabelSet, LazyModel, LeafGate, Pipeline, PipelineConfig,
    ProbabilityModel, ProbabilityVector, Verdict, VerdictPolicy, decode_image,
};
use ndarray::ArrayView4;
use rstest::rstest;

struct Scripted {
    scores: Vec<f32>,
    calls: Arc<AtomicUsize>,
}

impl ProbabilityModel for Scripted {
    fn predict(&self, input: ArrayView4<'_, f32>) -> anyhow::Result<Vec<f32>> {
        assert_eq!(input.shape(), &[1, 150, 150, 3]);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.scores.clone())
    }
}

fn pipeline(scores: Vec<f32>) -> (Pipeline, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let model = LazyModel::ready(Scripted {
        scores,
        calls: Arc::clone(&calls),
    });
    let pipeline = Pipeline::from_config(&PipelineConfig::default(), model).unwrap();
    (pipeline, calls)
}

fn encode(img: RgbImage, format: ImageFormat) -> Vec<u8> {
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut out), format)
        .unwrap();
    out
}

fn half_green() -> RgbImage {
    RgbImage::from_fn(120, 90, |x, _| {
        if x < 60 {
            Rgb([50, 150, 45])
        } else {
            Rgb([128, 128, 128])
        }
    })
}

fn peaked(index: usize, top: f32) -> Vec<f32> {
    let mut scores = vec![(1.0 - top) / 32.0; 33];
    scores[index] = top;
    scores
}

#[test]
fn mid_gray_image_is_not_a_plant() {
    let (pipeline, calls) = pipeline(peaked(0, 0.99));
    let bytes = encode(
        RgbImage::from_pixel(64, 64, Rgb([128, 128, 128])),
        ImageFormat::Png,
    );
    let analysis = pipeline.run(&bytes).unwrap();
    assert!(matches!(
        analysis.gate,
        GateVerdict::Measured {
            is_plant: false,
            ..
        }
    ));
    assert_eq!(analysis.verdict, Verdict::NotAPlant);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn half_green_image_passes_the_gate_and_is_classified() {
    let (pipeline, calls) = pipeline(peaked(10, 0.95));
    let analysis = pipeline
        .run(&encode(half_green(), ImageFormat::Png))
        .unwrap();
    let stats = analysis.gate.stats().unwrap();
    assert_relative_eq!(stats.green_ratio, 0.5, epsilon = 0.01);
    assert!(analysis.gate.is_plant());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(analysis.verdict.label(), Some("Grape Black rot"));
}

#[rstest]
#[case(true)]
#[case(false)]
fn flat_distribution_is_unsupported_whatever_the_gate_saw(#[case] gate_was_measured: bool) {
    // A fail-open gate and a measured pass must lead to the same verdict.
    let labels = LabelSet::plant_village();
    let probs = ProbabilityVector::new(vec![1.0 / 33.0; 33], 33).unwrap();
    let gate = if gate_was_measured {
        LeafGate::default().evaluate(&decode_image(&encode(half_green(), ImageFormat::Png)).unwrap())
    } else {
        GateVerdict::FailedOpen {
            reason: "synthetic".into(),
        }
    };
    let verdict = VerdictPolicy::default().decide(gate.is_plant(), &labels, || Ok(probs));
    assert_eq!(verdict, Verdict::Unsupported);
}

#[test]
fn confident_output_yields_diagnosis() {
    let (pipeline, _) = pipeline(peaked(19, 0.95));
    match pipeline
        .analyze(&encode(half_green(), ImageFormat::Png))
        .unwrap()
    {
        Verdict::Diagnosis { label, confidence } => {
            assert_eq!(label, "Potato Late blight");
            assert_relative_eq!(confidence, 95.0, epsilon = 1e-3);
        }
        other => panic!("expected diagnosis, got {other:?}"),
    }
}

#[test]
fn weak_output_yields_low_confidence() {
    let (pipeline, _) = pipeline(peaked(4, 0.45));
    match pipeline
        .analyze(&encode(half_green(), ImageFormat::Png))
        .unwrap()
    {
        Verdict::LowConfidence { confidence } => assert_relative_eq!(confidence, 45.0, epsilon = 1e-3),
        other => panic!("expected low confidence, got {other:?}"),
    }
}

#[test]
fn truncated_upload_stops_before_the_gate() {
    let (pipeline, calls) = pipeline(peaked(0, 0.99));
    let bytes = encode(half_green(), ImageFormat::Png);
    let err = pipeline.analyze(&bytes[..bytes.len() / 2]).unwrap_err();
    assert!(matches!(err, DecodeError::Corrupt(_) | DecodeError::Unrecognized(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn same_bytes_give_same_verdict() {
    let (pipeline, calls) = pipeline(peaked(7, 0.88));
    let bytes = encode(half_green(), ImageFormat::Jpeg);
    let first = pipeline.run(&bytes).unwrap();
    let second = pipeline.run(&bytes).unwrap();
    assert_eq!(first, second);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn model_failure_is_reported_as_a_verdict() {
    let model = LazyModel::new(|| anyhow::bail!("weights file not found"));
    let pipeline = Pipeline::from_config(&PipelineConfig::default(), model).unwrap();
    let verdict = pipeline
        .analyze(&encode(half_green(), ImageFormat::Png))
        .unwrap();
    match verdict {
        Verdict::AnalysisFailed { reason } => assert!(reason.contains("weights file not found")),
        other => panic!("expected analysis failure, got {other:?}"),
    }
    assert!(!pipeline.classifier().model().is_loaded());
}

#[rstest]
#[case(peaked(0, 0.99))]
#[case(peaked(32, 0.5))]
#[case(vec![1.0 / 33.0; 33])]
#[case(vec![0.0; 33])]
#[case((0..33).map(|i| i as f32 / 528.0).collect())]
fn every_distribution_maps_to_exactly_one_verdict(#[case] scores: Vec<f32>) {
    let labels = LabelSet::plant_village();
    let probs = ProbabilityVector::new(scores, 33).unwrap();
    let (index, _) = probs.argmax();
    assert!(index < labels.len());
    let verdict = VerdictPolicy::default().judge(&probs, &labels);
    assert!(matches!(
        verdict,
        Verdict::Diagnosis { .. } | Verdict::Unsupported | Verdict::LowConfidence { .. }
    ));
}

#[test]
fn nan_logit_fails_the_analysis_instead_of_looking_flat() {
    let mut logits = vec![0.0; 33];
    logits[3] = f32::NAN;
    let mut config = PipelineConfig::default();
    config.classifier.apply_softmax = true;
    let model = LazyModel::ready(Scripted {
        scores: logits,
        calls: Arc::new(AtomicUsize::new(0)),
    });
    let pipeline = Pipeline::from_config(&config, model).unwrap();
    let verdict = pipeline
        .analyze(&encode(half_green(), ImageFormat::Png))
        .unwrap();
    assert!(
        matches!(verdict, Verdict::AnalysisFailed { .. }),
        "got {verdict:?}"
    );
}
