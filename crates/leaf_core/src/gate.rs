//! Cheap "does this look like a leaf?" heuristic run before the classifier.
//!
//! An image passes when enough of it is leaf green, or when it is somewhat
//! green and carries leaf-like edge texture. The second branch keeps badly
//! diseased leaves (brown, yellow, spotted) from being rejected on color.

use std::panic::{self, AssertUnwindSafe};

use image::{GrayImage, Rgb, RgbImage, imageops};
use imageproc::{edges::canny, filter::gaussian_blur_f32};
use serde::Serialize;

use crate::config::GateConfig;
use crate::decode::Image;
use crate::error::GateError;

/// Measured image statistics, both fractions of the pixel count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LeafStats {
    pub green_ratio: f32,
    pub edge_ratio: f32,
}

/// Gate outcome. `FailedOpen` means the statistics could not be computed and
/// the image is let through to the classifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateVerdict {
    Measured { is_plant: bool, stats: LeafStats },
    FailedOpen { reason: String },
}

impl GateVerdict {
    pub fn is_plant(&self) -> bool {
        match self {
            GateVerdict::Measured { is_plant, .. } => *is_plant,
            GateVerdict::FailedOpen { .. } => true,
        }
    }

    pub fn stats(&self) -> Option<LeafStats> {
        match self {
            GateVerdict::Measured { stats, .. } => Some(*stats),
            GateVerdict::FailedOpen { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LeafGate {
    config: GateConfig,
}

impl LeafGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn is_plant(&self, image: &Image) -> bool {
        self.evaluate(image).is_plant()
    }

    /// Runs the heuristic. Never fails: internal errors fall back to
    /// "plant-like" so the classifier's own uncertainty check gets the final say.
    pub fn evaluate(&self, image: &Image) -> GateVerdict {
        let measured = panic::catch_unwind(AssertUnwindSafe(|| self.measure(image)))
            .unwrap_or_else(|payload| Err(GateError::Panicked(panic_message(payload))));
        match measured {
            Ok(stats) => {
                let is_plant = self.decide(stats);
                tracing::debug!(
                    green_ratio = stats.green_ratio,
                    edge_ratio = stats.edge_ratio,
                    is_plant,
                    "leaf gate measured"
                );
                GateVerdict::Measured { is_plant, stats }
            }
            Err(err) => {
                tracing::warn!("leaf gate failed, treating image as plant-like: {err}");
                GateVerdict::FailedOpen {
                    reason: err.to_string(),
                }
            }
        }
    }

    /// Decision rule over already measured statistics.
    pub fn decide(&self, stats: LeafStats) -> bool {
        let cfg = &self.config;
        stats.green_ratio > cfg.green_ratio_threshold
            || (stats.green_ratio > cfg.textured_green_ratio
                && stats.edge_ratio > cfg.edge_ratio_threshold)
    }

    fn measure(&self, image: &Image) -> Result<LeafStats, GateError> {
        let rgb = image.as_rgb();
        let green_ratio = green_ratio(rgb, &self.config);
        let edge_ratio = edge_ratio(rgb, &self.config)?;
        if !green_ratio.is_finite() {
            return Err(GateError::NonFinite("green_ratio"));
        }
        if !edge_ratio.is_finite() {
            return Err(GateError::NonFinite("edge_ratio"));
        }
        Ok(LeafStats {
            green_ratio,
            edge_ratio,
        })
    }
}

/// Converts to hue (0–180), saturation (0–255), value (0–255).
pub fn to_hsv(pixel: Rgb<u8>) -> (f32, f32, f32) {
    let [r, g, b] = pixel.0.map(f32::from);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    let saturation = if max == 0.0 { 0.0 } else { 255.0 * delta / max };
    if delta == 0.0 {
        return (0.0, saturation, max);
    }
    let mut hue = if max == r {
        60.0 * (g - b) / delta
    } else if max == g {
        120.0 + 60.0 * (b - r) / delta
    } else {
        240.0 + 60.0 * (r - g) / delta
    };
    if hue < 0.0 {
        hue += 360.0;
    }
    (hue / 2.0, saturation, max)
}

/// Fraction of pixels inside the configured green HSV band.
pub fn green_ratio(rgb: &RgbImage, cfg: &GateConfig) -> f32 {
    let total = rgb.width() as usize * rgb.height() as usize;
    if total == 0 {
        return f32::NAN;
    }
    let min_s = f32::from(cfg.min_saturation);
    let min_v = f32::from(cfg.min_value);
    let green = rgb
        .pixels()
        .filter(|p| {
            let (h, s, v) = to_hsv(**p);
            (cfg.hue_min..=cfg.hue_max).contains(&h) && s >= min_s && v >= min_v
        })
        .count();
    green as f32 / total as f32
}

/// Fraction of edge pixels on the smoothed grayscale image.
///
/// `canny` runs its own σ=1.4 Gaussian before the Sobel gradient, so the
/// `blur_kernel` pre-blur stacks on top of it (about σ≈1.8 for 5×5). Edge
/// ratios therefore come out somewhat lower than a single 5×5 blur followed by
/// an L1-gradient Canny would give; `edge_ratio_threshold` is tuned against
/// this combined smoothing.
pub(crate) fn edge_ratio(rgb: &RgbImage, cfg: &GateConfig) -> Result<f32, GateError> {
    let sigma = kernel_sigma(cfg.blur_kernel)?;
    if cfg.edge_low_threshold < 0.0 || cfg.edge_low_threshold > cfg.edge_high_threshold {
        return Err(GateError::Parameter(format!(
            "edge thresholds {}/{} are not ordered",
            cfg.edge_low_threshold, cfg.edge_high_threshold
        )));
    }
    let gray = imageops::grayscale(rgb);
    let smoothed: GrayImage = gaussian_blur_f32(&gray, sigma);
    let edges = canny(&smoothed, cfg.edge_low_threshold, cfg.edge_high_threshold);
    let total = edges.width() as usize * edges.height() as usize;
    if total == 0 {
        return Err(GateError::NonFinite("edge_ratio"));
    }
    let on = edges.pixels().filter(|p| p.0[0] > 0).count();
    Ok(on as f32 / total as f32)
}

/// Sigma matching a square Gaussian kernel of the given odd side.
fn kernel_sigma(kernel: u32) -> Result<f32, GateError> {
    if kernel < 3 || kernel % 2 == 0 {
        return Err(GateError::Parameter(format!(
            "blur kernel {kernel} must be odd and at least 3"
        )));
    }
    Ok(0.3 * ((kernel as f32 - 1.0) * 0.5 - 1.0) + 0.8)
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
