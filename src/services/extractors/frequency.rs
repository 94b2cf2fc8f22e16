// Frequency Artifact Extractor
// Log-magnitude energy in the central crop of the shifted 2-D spectrum of the luminance plane

use super::{ExtractionInput, ExtractorError, SignalExtractor};
use crate::models::SignalRole;
use crate::services::preprocessing::LumaPlane;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

pub const SIGNAL_NAME: &str = "frequency";

/// Divisor mapping mean log-magnitude into [0,1].
const DEFAULT_NORMALIZER: f64 = 10.0;
/// Planes are resampled so the FFT never exceeds this side length.
const DEFAULT_MAX_SIDE: usize = 256;
const MIN_SIDE: usize = 4;

#[derive(Debug, Clone)]
pub struct FrequencyExtractor {
    normalizer: f64,
    max_side: usize,
}

impl Default for FrequencyExtractor {
    fn default() -> Self {
        Self {
            normalizer: DEFAULT_NORMALIZER,
            max_side: DEFAULT_MAX_SIDE,
        }
    }
}

impl FrequencyExtractor {
    pub fn new(normalizer: f64, max_side: usize) -> Self {
        Self {
            normalizer: normalizer.max(f64::EPSILON),
            max_side: max_side.max(MIN_SIDE),
        }
    }
}

impl SignalExtractor for FrequencyExtractor {
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
        if plane.width < MIN_SIDE || plane.height < MIN_SIDE {
            return Err(ExtractorError::TooSmall {
                width: plane.width,
                height: plane.height,
            });
        }

        let working = bounded(plane, self.max_side);
        let magnitude = log_magnitude_spectrum(&working);
        let energy = central_crop_mean(&magnitude, working.width, working.height);
        Ok((energy / self.normalizer).clamp(0.0, 1.0))
    }
}

fn bounded(plane: &LumaPlane, max_side: usize) -> LumaPlane {
    let longest = plane.width.max(plane.height);
    if longest <= max_side {
        return plane.clone();
    }
    let scale = max_side as f64 / longest as f64;
    let w = ((plane.width as f64 * scale).round() as usize).max(MIN_SIDE);
    let h = ((plane.height as f64 * scale).round() as usize).max(MIN_SIDE);
    plane.resampled(w, h)
}

/// `ln(|F| + 1)` of the 2-D DFT, row-major, unshifted.
pub fn log_magnitude_spectrum(plane: &LumaPlane) -> Vec<f64> {
    let (w, h) = (plane.width, plane.height);
    let mut planner = FftPlanner::<f64>::new();
    let mut data: Vec<Complex<f64>> = plane
        .pixels
        .iter()
        .map(|&p| Complex::new(p as f64, 0.0))
        .collect();

    let row_fft = planner.plan_fft_forward(w);
    for row in data.chunks_exact_mut(w) {
        row_fft.process(row);
    }

    let col_fft = planner.plan_fft_forward(h);
    let mut column = vec![Complex::new(0.0, 0.0); h];
    for x in 0..w {
        for y in 0..h {
            column[y] = data[y * w + x];
        }
        col_fft.process(&mut column);
        for y in 0..h {
            data[y * w + x] = column[y];
        }
    }

    data.iter().map(|c| (c.norm() + 1.0).ln()).collect()
}

/// Mean over the central half of the spectrum after an fftshift.
fn central_crop_mean(spectrum: &[f64], w: usize, h: usize) -> f64 {
    let (y_lo, y_hi) = (h / 4, 3 * h / 4);
    let (x_lo, x_hi) = (w / 4, 3 * w / 4);
    let mut total = 0.0;
    let mut count = 0usize;
    for sy in y_lo..y_hi {
        // shifted index -> unshifted index
        let y = (sy + h - h / 2) % h;
        for sx in x_lo..x_hi {
            let x = (sx + w - w / 2) % w;
            total += spectrum[y * w + x];
            count += 1;
        }
    }
    total / count.max(1) as f64
}
