// Image Preprocessing
// Decodes uploads into a luminance plane and applies the perturbations used by multi-pass extraction

use image::imageops::FilterType;
use image::GrayImage;
use rand::Rng;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("input is empty")]
    Empty,
    #[error("not a decodable image: {0}")]
    Image(#[from] image::ImageError),
    #[error("image has zero area ({width}x{height})")]
    ZeroArea { width: u32, height: u32 },
}

/// Row-major floating point luminance in 8-bit units (0..=255).
#[derive(Debug, Clone, PartialEq)]
pub struct LumaPlane {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<f32>,
}

impl LumaPlane {
    pub fn from_gray(img: &GrayImage) -> Self {
        Self {
            width: img.width() as usize,
            height: img.height() as usize,
            pixels: img.as_raw().iter().map(|&p| p as f32).collect(),
        }
    }

    pub fn filled(width: usize, height: usize, value: f32) -> Self {
        Self {
            width,
            height,
            pixels: vec![value; width * height],
        }
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.pixels[y * self.width + x]
    }

    /// Read with edge clamping, for convolution borders.
    pub fn get_clamped(&self, x: isize, y: isize) -> f32 {
        let cx = x.clamp(0, self.width as isize - 1) as usize;
        let cy = y.clamp(0, self.height as isize - 1) as usize;
        self.get(cx, cy)
    }

    /// Bilinear resample to the target size.
    pub fn resampled(&self, width: usize, height: usize) -> Self {
        if width == self.width && height == self.height {
            return self.clone();
        }
        let mut out = Vec::with_capacity(width * height);
        let sx = self.width as f32 / width as f32;
        let sy = self.height as f32 / height as f32;
        for y in 0..height {
            let fy = ((y as f32 + 0.5) * sy - 0.5).max(0.0);
            let y0 = (fy.floor() as usize).min(self.height - 1);
            let y1 = (y0 + 1).min(self.height - 1);
            let ty = fy - y0 as f32;
            for x in 0..width {
                let fx = ((x as f32 + 0.5) * sx - 0.5).max(0.0);
                let x0 = (fx.floor() as usize).min(self.width - 1);
                let x1 = (x0 + 1).min(self.width - 1);
                let tx = fx - x0 as f32;
                let top = self.get(x0, y0) * (1.0 - tx) + self.get(x1, y0) * tx;
                let bottom = self.get(x0, y1) * (1.0 - tx) + self.get(x1, y1) * tx;
                out.push(top * (1.0 - ty) + bottom * ty);
            }
        }
        Self {
            width,
            height,
            pixels: out,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// A decoded upload: original dimensions plus a working-size luminance image.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub luma: GrayImage,
}

impl DecodedImage {
    pub fn plane(&self) -> LumaPlane {
        LumaPlane::from_gray(&self.luma)
    }
}

/// Decode bytes and downscale so the longer side is at most `max_side`.
pub fn decode_image(bytes: &[u8], max_side: u32) -> Result<DecodedImage, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    let img = image::load_from_memory(bytes)?;
    let luma = img.to_luma8();
    let (width, height) = (luma.width(), luma.height());
    if width == 0 || height == 0 {
        return Err(DecodeError::ZeroArea { width, height });
    }

    let longest = width.max(height);
    let luma = if max_side > 0 && longest > max_side {
        let scale = max_side as f64 / longest as f64;
        let w = ((width as f64 * scale).round() as u32).max(1);
        let h = ((height as f64 * scale).round() as u32).max(1);
        image::imageops::resize(&luma, w, h, FilterType::Triangle)
    } else {
        luma
    };

    Ok(DecodedImage {
        width,
        height,
        luma,
    })
}

/// One stochastic view of the image: sub-pixel resize jitter followed by additive Gaussian noise.
pub fn perturb<R: Rng>(
    luma: &GrayImage,
    scale_jitter: f64,
    noise_sigma: f64,
    rng: &mut R,
) -> LumaPlane {
    let jittered = if scale_jitter > 0.0 {
        let scale = 1.0 + rng.gen_range(-scale_jitter..=scale_jitter);
        let w = ((luma.width() as f64 * scale).round() as u32).max(1);
        let h = ((luma.height() as f64 * scale).round() as u32).max(1);
        LumaPlane::from_gray(&image::imageops::resize(luma, w, h, FilterType::Triangle))
    } else {
        LumaPlane::from_gray(luma)
    };

    if noise_sigma <= 0.0 {
        return jittered;
    }

    let pixels = jittered
        .pixels
        .iter()
        .map(|&p| (p as f64 + noise_sigma * standard_normal(rng)) as f32)
        .collect();
    LumaPlane {
        width: jittered.width,
        height: jittered.height,
        pixels,
    }
}

// Box-Muller transform
fn standard_normal<R: Rng>(rng: &mut R) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}
