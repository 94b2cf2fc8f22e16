// Detection Pipeline
// Owns the extractor set, stochastic settings and fusion policy for one worker lifetime.
// Extracting always completes before Fusing begins.

use super::fusion::fuse;
use super::policy::{FusionPolicy, PolicyError};
use super::verdict::{DetectionSensitivity, VerdictBands};
use crate::models::{FusionResult, MediaBlob, MediaKind, Signal, SignalOutcome};
use crate::services::config_store::AppConfig;
use crate::services::extractors::{
    Calibration, ExtractionInput, ExtractorSet, NoiseResidualBackbone, StochasticConfig,
};
use crate::services::preprocessing::{decode_image, DecodeError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("unsupported media kind: {0}")]
    UnsupportedMediaKind(&'static str),
    #[error("decode failure: {0}")]
    Decode(#[from] DecodeError),
}

pub struct DetectionEngine {
    extractors: ExtractorSet,
    policy: FusionPolicy,
    stochastic: StochasticConfig,
    max_side: u32,
}

impl DetectionEngine {
    pub fn new(
        extractors: ExtractorSet,
        policy: FusionPolicy,
        stochastic: StochasticConfig,
        max_side: u32,
    ) -> Result<Self, PolicyError> {
        policy.validate()?;
        Ok(Self {
            extractors,
            policy,
            stochastic,
            max_side,
        })
    }

    /// Standard extractors with a freshly built backbone, configured from `config`.
    pub fn from_config(config: &AppConfig) -> Result<Self, PolicyError> {
        let backbone = Arc::new(NoiseResidualBackbone::default());
        let calibration = Calibration::new(config.detection.variance_knots.clone())?;
        let mut policy = config.policy.clone();
        if let Some(sensitivity) = config.detection.sensitivity.as_deref() {
            policy = policy.with_bands(VerdictBands::for_sensitivity(DetectionSensitivity::from_str(sensitivity)));
        }
        Self::new(
            ExtractorSet::standard(backbone, calibration),
            policy,
            config.detection.stochastic.clone(),
            config.detection.max_side,
        )
    }

    pub fn policy(&self) -> &FusionPolicy {
        &self.policy
    }

    /// Decode once and run every extractor. Individual extractor failures degrade to fallbacks;
    /// only an undecodable or non-image input is an error.
    pub fn extract(&self, blob: &MediaBlob) -> Result<Vec<SignalOutcome>, DetectionError> {
        if blob.kind() != MediaKind::Image {
            return Err(DetectionError::UnsupportedMediaKind(blob.kind().as_str()));
        }
        let image = decode_image(blob.bytes(), self.max_side)?;
        info!(
            "[DETECT] Decoded {}x{} image ({} bytes), extractors [{}], {} runs",
            image.width,
            image.height,
            blob.size(),
            self.extractors.names().join(", "),
            self.stochastic.runs
        );

        let input = ExtractionInput {
            bytes: blob.bytes(),
            image: &image,
        };
        let outcomes = self.extractors.extract_all(&input, &self.stochastic);
        for outcome in &outcomes {
            if let SignalOutcome::Fallback { signal, reason } = outcome {
                warn!("[DETECT] {} fell back to {:.3}: {}", signal.name, signal.score(), reason);
            }
        }
        Ok(outcomes)
    }

    pub fn fuse(&self, outcomes: &[SignalOutcome]) -> FusionResult {
        let signals: Vec<Signal> = outcomes.iter().map(|o| o.signal().clone()).collect();
        fuse(&signals, &self.policy)
    }

    pub fn analyze(&self, blob: &MediaBlob) -> Result<FusionResult, DetectionError> {
        let outcomes = self.extract(blob)?;
        Ok(self.fuse(&outcomes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunStatus, SignalRole};
    use crate::services::extractors::CalibrationError;
    use crate::services::preprocessing::test_support::encoded_image;
    use image::ImageFormat;

    fn engine() -> DetectionEngine {
        let mut config = AppConfig::default();
        config.detection.stochastic = StochasticConfig {
            runs: 2,
            seed: Some(42),
            ..StochasticConfig::default()
        };
        config.detection.max_side = 64;
        DetectionEngine::from_config(&config).unwrap()
    }

    #[test]
    fn test_analyze_png() {
        let blob = MediaBlob::image(encoded_image(48, 40, ImageFormat::Png));
        let result = engine().analyze(&blob).unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert!((0.0..=1.0).contains(&result.confidence));
        for key in ["frequency", "frequency_std", "provenance", "recompression", "feature_variance"] {
            assert!(result.signals.contains_key(key), "missing {}", key);
        }
        // PNG carries no EXIF
        assert_eq!(result.signals["provenance"], 1.0);
        assert_eq!(result.signals["recompression"], 0.0);
    }

    #[test]
    fn test_analyze_jpeg_reports_recompression() {
        let blob = MediaBlob::image(encoded_image(48, 40, ImageFormat::Jpeg));
        let outcomes = engine().extract(&blob).unwrap();
        let recompression = outcomes.iter().find(|o| o.signal().name == "recompression").unwrap();
        assert!(!recompression.is_fallback());
        assert_eq!(recompression.signal().role, SignalRole::Reliability);
    }

    #[test]
    fn test_seeded_analysis_is_reproducible() {
        let blob = MediaBlob::image(encoded_image(32, 32, ImageFormat::Png));
        let engine = engine();
        assert_eq!(engine.analyze(&blob).unwrap(), engine.analyze(&blob).unwrap());
    }

    #[test]
    fn test_garbage_is_decode_failure() {
        let blob = MediaBlob::image(b"not an image at all".to_vec());
        assert!(matches!(engine().analyze(&blob), Err(DetectionError::Decode(_))));
    }

    #[test]
    fn test_video_is_rejected() {
        let blob = MediaBlob::new(vec![0; 16], MediaKind::Video, Some("video/mp4".to_string()));
        assert!(matches!(
            engine().analyze(&blob),
            Err(DetectionError::UnsupportedMediaKind("video"))
        ));
    }

    #[test]
    fn test_sensitivity_overrides_bands() {
        let mut config = AppConfig::default();
        config.detection.sensitivity = Some("high".to_string());
        let engine = DetectionEngine::from_config(&config).unwrap();
        assert_eq!(engine.policy().bands, VerdictBands::for_sensitivity(DetectionSensitivity::High));
    }

    #[test]
    fn test_invalid_policy_is_rejected() {
        let mut config = AppConfig::default();
        config.policy.reliability_cap = -1.0;
        assert!(DetectionEngine::from_config(&config).is_err());
    }

    #[test]
    fn test_misordered_calibration_is_rejected() {
        let mut config = AppConfig::default();
        config.detection.variance_knots = vec![(0.002, 0.4), (0.006, 0.95)];
        assert_eq!(
            DetectionEngine::from_config(&config).err(),
            Some(PolicyError::Calibration(CalibrationError::NotMonotone(1)))
        );
    }
}
