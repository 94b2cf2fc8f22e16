// Pretrained Feature Variance Extractor
// Dispersion of globally pooled activations from a fixed convolutional backbone.
// Generated images tend to have unusually uniform noise residuals, so low variance maps to a high score.

use super::{ExtractionInput, ExtractorError, SignalExtractor};
use crate::models::SignalRole;
use crate::services::preprocessing::LumaPlane;
use std::sync::Arc;
use thiserror::Error;

pub const SIGNAL_NAME: &str = "feature_variance";

/// A fixed feature extractor. Constructed once per worker and shared read-only.
pub trait FeatureBackbone: Send + Sync {
    fn name(&self) -> &str;

    /// Globally pooled activations for one luminance plane.
    fn pooled_features(&self, plane: &LumaPlane) -> Result<Vec<f64>, ExtractorError>;
}

type Kernel = [f32; 9];

const LAPLACIAN: Kernel = [0.0, 1.0, 0.0, 1.0, -4.0, 1.0, 0.0, 1.0, 0.0];
const SOBEL_X: Kernel = [-0.25, 0.0, 0.25, -0.5, 0.0, 0.5, -0.25, 0.0, 0.25];
const SOBEL_Y: Kernel = [-0.25, -0.5, -0.25, 0.0, 0.0, 0.0, 0.25, 0.5, 0.25];
const LAPLACIAN_8: Kernel = [0.125, 0.125, 0.125, 0.125, -1.0, 0.125, 0.125, 0.125, 0.125];
const BOX: Kernel = [1.0 / 9.0; 9];

/// Noise-residual backbone: 1 -> 8 high-pass 3x3 filters, ReLU, 8 -> 16 (smoothing and
/// Laplacian per channel), ReLU, global average pooling, on a fixed-size resample.
#[derive(Debug, Clone)]
pub struct NoiseResidualBackbone {
    input_size: usize,
    first: Vec<Kernel>,
    second: Vec<Kernel>,
}

impl Default for NoiseResidualBackbone {
    fn default() -> Self {
        Self::new(256)
    }
}

impl NoiseResidualBackbone {
    pub fn new(input_size: usize) -> Self {
        let negate = |k: Kernel| k.map(|v| -v);
        Self {
            input_size: input_size.max(8),
            first: vec![
                LAPLACIAN,
                negate(LAPLACIAN),
                SOBEL_X,
                negate(SOBEL_X),
                SOBEL_Y,
                negate(SOBEL_Y),
                LAPLACIAN_8,
                negate(LAPLACIAN_8),
            ],
            second: vec![BOX, LAPLACIAN],
        }
    }

    pub fn channels(&self) -> usize {
        self.first.len() * self.second.len()
    }
}

impl FeatureBackbone for NoiseResidualBackbone {
    fn name(&self) -> &str {
        "noise-residual-v1"
    }

    fn pooled_features(&self, plane: &LumaPlane) -> Result<Vec<f64>, ExtractorError> {
        if plane.is_empty() {
            return Err(ExtractorError::TooSmall {
                width: plane.width,
                height: plane.height,
            });
        }
        let mut input = plane.resampled(self.input_size, self.input_size);
        for p in input.pixels.iter_mut() {
            *p /= 255.0;
        }

        let hidden: Vec<LumaPlane> = self.first.iter().map(|k| conv3_relu(&input, k)).collect();
        let mut pooled = Vec::with_capacity(self.channels());
        for kernel in &self.second {
            for map in &hidden {
                let out = conv3_relu(map, kernel);
                let mean = out.pixels.iter().map(|&v| v as f64).sum::<f64>() / out.pixels.len() as f64;
                pooled.push(mean);
            }
        }
        Ok(pooled)
    }
}

fn conv3_relu(plane: &LumaPlane, kernel: &Kernel) -> LumaPlane {
    let (w, h) = (plane.width, plane.height);
    let mut out = Vec::with_capacity(w * h);
    for y in 0..h as isize {
        for x in 0..w as isize {
            let mut acc = 0.0f32;
            for ky in 0..3isize {
                for kx in 0..3isize {
                    acc += kernel[(ky * 3 + kx) as usize] * plane.get_clamped(x + kx - 1, y + ky - 1);
                }
            }
            out.push(acc.max(0.0));
        }
    }
    LumaPlane {
        width: w,
        height: h,
        pixels: out,
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum CalibrationError {
    #[error("calibration needs at least one knot")]
    Empty,
    #[error("calibration knot {0} is not finite or its score is outside [0, 1]")]
    InvalidKnot(usize),
    #[error("calibration knot {0} breaks the rising-variance, non-rising-score order")]
    NotMonotone(usize),
}

/// Monotone non-increasing piecewise-linear map from feature variance to [0,1].
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    /// `(variance, score)` knots sorted by variance.
    knots: Vec<(f64, f64)>,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            knots: vec![(0.002, 0.95), (0.004, 0.7), (0.006, 0.4), (0.008, 0.0)],
        }
    }
}

impl Calibration {
    pub fn new(knots: Vec<(f64, f64)>) -> Result<Self, CalibrationError> {
        if knots.is_empty() {
            return Err(CalibrationError::Empty);
        }
        if let Some(i) = knots
            .iter()
            .position(|(x, y)| !x.is_finite() || !(0.0..=1.0).contains(y))
        {
            return Err(CalibrationError::InvalidKnot(i));
        }
        if let Some(i) = knots
            .windows(2)
            .position(|pair| pair[0].0 >= pair[1].0 || pair[0].1 < pair[1].1)
        {
            return Err(CalibrationError::NotMonotone(i + 1));
        }
        Ok(Self { knots })
    }

    pub fn knots(&self) -> &[(f64, f64)] {
        &self.knots
    }

    pub fn apply(&self, variance: f64) -> f64 {
        let (Some(first), Some(last)) = (self.knots.first(), self.knots.last()) else {
            return 0.0;
        };
        if variance <= first.0 {
            return first.1.clamp(0.0, 1.0);
        }
        if variance >= last.0 {
            return last.1.clamp(0.0, 1.0);
        }
        for pair in self.knots.windows(2) {
            let ((x0, y0), (x1, y1)) = (pair[0], pair[1]);
            if variance <= x1 {
                let t = (variance - x0) / (x1 - x0);
                return (y0 + t * (y1 - y0)).clamp(0.0, 1.0);
            }
        }
        last.1.clamp(0.0, 1.0)
    }
}

pub struct FeatureVarianceExtractor {
    backbone: Arc<dyn FeatureBackbone>,
    calibration: Calibration,
}

impl FeatureVarianceExtractor {
    pub fn new(backbone: Arc<dyn FeatureBackbone>, calibration: Calibration) -> Self {
        Self {
            backbone,
            calibration,
        }
    }
}

impl SignalExtractor for FeatureVarianceExtractor {
    fn name(&self) -> &'static str {
        SIGNAL_NAME
    }

    fn role(&self) -> SignalRole {
        SignalRole::Evidence
    }

    fn fallback_value(&self) -> f64 {
        0.0
    }

    fn is_perturbable(&self) -> bool {
        true
    }

    fn measure(&self, _input: &ExtractionInput<'_>, plane: &LumaPlane) -> Result<f64, ExtractorError> {
        let features = self.backbone.pooled_features(plane)?;
        if features.is_empty() {
            return Err(ExtractorError::Backbone(format!(
                "{} produced no features",
                self.backbone.name()
            )));
        }
        let n = features.len() as f64;
        let mean = features.iter().sum::<f64>() / n;
        let variance = features.iter().map(|f| (f - mean).powi(2)).sum::<f64>() / n;
        Ok(self.calibration.apply(variance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::preprocessing::DecodedImage;
    use image::GrayImage;

    struct Constant(Vec<f64>);

    impl FeatureBackbone for Constant {
        fn name(&self) -> &str { "constant" }
        fn pooled_features(&self, _plane: &LumaPlane) -> Result<Vec<f64>, ExtractorError> {
            Ok(self.0.clone())
        }
    }

    fn measure_with(backbone: Arc<dyn FeatureBackbone>, plane: &LumaPlane) -> Result<f64, ExtractorError> {
        let image = DecodedImage { width: 1, height: 1, luma: GrayImage::new(1, 1) };
        let input = ExtractionInput { bytes: &[], image: &image };
        FeatureVarianceExtractor::new(backbone, Calibration::default()).measure(&input, plane)
    }

    #[test]
    fn test_calibration_is_monotone_and_interpolates() {
        let cal = Calibration::default();
        assert_eq!(Calibration::new(cal.knots().to_vec()), Ok(cal.clone()));
        assert_eq!(cal.apply(0.0), 0.95);
        assert_eq!(cal.apply(1.0), 0.0);
        assert!((cal.apply(0.003) - 0.825).abs() < 1e-9);
        let mut last = f64::INFINITY;
        for i in 0..100 {
            let v = cal.apply(i as f64 * 0.0001);
            assert!(v <= last);
            last = v;
        }
    }

    #[test]
    fn test_invalid_calibration_is_rejected() {
        assert_eq!(
            Calibration::new(vec![(0.1, 0.2), (0.2, 0.9)]),
            Err(CalibrationError::NotMonotone(1))
        );
        assert_eq!(
            Calibration::new(vec![(0.1, 0.9), (0.1, 0.5)]),
            Err(CalibrationError::NotMonotone(1))
        );
        assert_eq!(Calibration::new(vec![]), Err(CalibrationError::Empty));
        assert_eq!(
            Calibration::new(vec![(0.1, 0.9), (f64::NAN, 0.5)]),
            Err(CalibrationError::InvalidKnot(1))
        );
        assert_eq!(Calibration::new(vec![(0.1, 1.2)]), Err(CalibrationError::InvalidKnot(0)));

        let single = Calibration::new(vec![(0.01, 0.6)]).unwrap();
        assert_eq!(single.apply(0.0), 0.6);
        assert_eq!(single.apply(1.0), 0.6);
    }

    #[test]
    fn test_flat_plane_has_no_residual() {
        let backbone = NoiseResidualBackbone::new(16);
        let features = backbone.pooled_features(&LumaPlane::filled(20, 20, 77.0)).unwrap();
        assert_eq!(features.len(), backbone.channels());
        assert!(features.iter().all(|f| f.abs() < 1e-6));
    }

    #[test]
    fn test_uniform_features_score_high() {
        let plane = LumaPlane::filled(4, 4, 0.0);
        let uniform = measure_with(Arc::new(Constant(vec![0.3; 16])), &plane).unwrap();
        let spread = measure_with(Arc::new(Constant(vec![0.0, 0.5, 0.0, 0.5])), &plane).unwrap();
        assert_eq!(uniform, 0.95);
        assert_eq!(spread, 0.0);
    }

    #[test]
    fn test_empty_features_are_an_error() {
        let plane = LumaPlane::filled(4, 4, 0.0);
        let result = measure_with(Arc::new(Constant(vec![])), &plane);
        assert!(matches!(result, Err(ExtractorError::Backbone(_))));
    }

    #[test]
    fn test_textured_plane_activates_backbone() {
        let backbone = NoiseResidualBackbone::new(16);
        let mut plane = LumaPlane::filled(16, 16, 0.0);
        for (i, p) in plane.pixels.iter_mut().enumerate() {
            *p = if i % 3 == 0 { 255.0 } else { 0.0 };
        }
        let features = backbone.pooled_features(&plane).unwrap();
        assert!(features.iter().any(|f| *f > 0.0));
    }
}
