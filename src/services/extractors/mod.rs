// Signal Extractors
// Each extractor maps one decoded upload to a bounded score with a declared role:
// - frequency: spectral energy in the log-magnitude FFT (evidence)
// - provenance: camera metadata suspicion (reliability, damping)
// - recompression: JPEG quantization table degeneracy (reliability, gating)
// - feature_variance: dispersion of fixed backbone features (evidence)

pub mod feature_variance;
pub mod frequency;
pub mod provenance;
pub mod recompression;

use crate::models::{Signal, SignalOutcome, SignalRole};
use crate::services::preprocessing::{perturb, DecodedImage, LumaPlane};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub use feature_variance::{
    Calibration, CalibrationError, FeatureBackbone, FeatureVarianceExtractor, NoiseResidualBackbone,
};
pub use frequency::FrequencyExtractor;
pub use provenance::ProvenanceExtractor;
pub use recompression::RecompressionExtractor;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("malformed input: {0}")]
    Malformed(String),
    #[error("image too small for analysis ({width}x{height})")]
    TooSmall { width: usize, height: usize },
    #[error("non-finite score: {0}")]
    NonFinite(f64),
    #[error("backbone failure: {0}")]
    Backbone(String),
}

/// Everything an extractor may look at for one upload.
pub struct ExtractionInput<'a> {
    pub bytes: &'a [u8],
    pub image: &'a DecodedImage,
}

pub trait SignalExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    fn role(&self) -> SignalRole;

    /// Score reported when measurement fails.
    fn fallback_value(&self) -> f64;

    /// Pixel-based extractors are re-run on perturbed views in stochastic mode.
    /// Byte-level extractors always run once.
    fn is_perturbable(&self) -> bool {
        false
    }

    /// Measure one view of the image. `plane` is the (possibly perturbed) luminance.
    fn measure(&self, input: &ExtractionInput<'_>, plane: &LumaPlane) -> Result<f64, ExtractorError>;
}

/// Multi-pass settings. `runs = 1` is the deterministic single-pass case.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StochasticConfig {
    #[serde(default = "default_runs")]
    pub runs: u32,
    #[serde(default = "default_scale_jitter")]
    pub scale_jitter: f64,
    #[serde(default = "default_noise_sigma")]
    pub noise_sigma: f64,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for StochasticConfig {
    fn default() -> Self {
        Self {
            runs: default_runs(),
            scale_jitter: default_scale_jitter(),
            noise_sigma: default_noise_sigma(),
            seed: None,
        }
    }
}

impl StochasticConfig {
    pub fn single_pass() -> Self {
        Self {
            runs: 1,
            ..Self::default()
        }
    }
}

fn default_runs() -> u32 { 8 }
fn default_scale_jitter() -> f64 { 0.01 }
fn default_noise_sigma() -> f64 { 0.5 }

/// Run one extractor under its failure boundary. Errors and panics become a fallback outcome.
pub fn run_extractor(
    extractor: &dyn SignalExtractor,
    input: &ExtractionInput<'_>,
    config: &StochasticConfig,
    rng: &mut StdRng,
) -> SignalOutcome {
    let name = extractor.name();
    let role = extractor.role();
    let attempt = catch_unwind(AssertUnwindSafe(|| measure_passes(extractor, input, config, rng)));

    let failure = match attempt {
        Ok(Ok(signal)) => {
            debug!(extractor = name, score = signal.score(), "extractor.measured");
            return SignalOutcome::Measured(signal);
        }
        Ok(Err(e)) => e.to_string(),
        Err(payload) => format!("extractor panicked: {}", panic_message(payload.as_ref())),
    };

    warn!(extractor = name, reason = %failure, "extractor.fallback");
    SignalOutcome::Fallback {
        signal: Signal::point(name, role, extractor.fallback_value()),
        reason: failure,
    }
}

fn measure_passes(
    extractor: &dyn SignalExtractor,
    input: &ExtractionInput<'_>,
    config: &StochasticConfig,
    rng: &mut StdRng,
) -> Result<Signal, ExtractorError> {
    if config.runs <= 1 || !extractor.is_perturbable() {
        let plane = input.image.plane();
        let value = checked(extractor.measure(input, &plane)?)?;
        return Ok(Signal::point(extractor.name(), extractor.role(), value));
    }

    let mut scores = Vec::with_capacity(config.runs as usize);
    for _ in 0..config.runs {
        let plane = perturb(&input.image.luma, config.scale_jitter, config.noise_sigma, rng);
        scores.push(checked(extractor.measure(input, &plane)?)?);
    }
    Ok(Signal::sampled(extractor.name(), extractor.role(), &scores))
}

fn checked(value: f64) -> Result<f64, ExtractorError> {
    if value.is_finite() {
        Ok(value.clamp(0.0, 1.0))
    } else {
        Err(ExtractorError::NonFinite(value))
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// The extractors one worker runs. No extractor depends on another's output.
pub struct ExtractorSet {
    extractors: Vec<Box<dyn SignalExtractor>>,
}

impl ExtractorSet {
    pub fn new(extractors: Vec<Box<dyn SignalExtractor>>) -> Self {
        Self { extractors }
    }

    /// The four standard extractors, with the feature backbone injected.
    pub fn standard(backbone: Arc<dyn FeatureBackbone>, calibration: Calibration) -> Self {
        Self::new(vec![
            Box::new(FrequencyExtractor::default()),
            Box::new(ProvenanceExtractor::default()),
            Box::new(RecompressionExtractor::default()),
            Box::new(FeatureVarianceExtractor::new(backbone, calibration)),
        ])
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.extractors.iter().map(|e| e.name()).collect()
    }

    /// Run every extractor. Each gets its own RNG stream so results do not depend on order.
    pub fn extract_all(&self, input: &ExtractionInput<'_>, config: &StochasticConfig) -> Vec<SignalOutcome> {
        self.extractors
            .iter()
            .enumerate()
            .map(|(index, extractor)| {
                let mut rng = match config.seed {
                    Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(index as u64)),
                    None => StdRng::from_entropy(),
                };
                run_extractor(extractor.as_ref(), input, config, &mut rng)
            })
            .collect()
    }
}
