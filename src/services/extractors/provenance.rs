// Provenance Metadata Extractor
// Scores how suspicious the embedded provenance is: missing camera tags,
// generator-sized dimensions and known generator names in software tags.
// High values mean "no trustworthy camera origin"; fusion derives damping from the complement.

use super::{ExtractionInput, ExtractorError, SignalExtractor};
use crate::models::SignalRole;
use crate::services::preprocessing::LumaPlane;
use exif::{In, Tag};
use image::ImageFormat;
use regex::{Regex, RegexBuilder};
use std::io::Cursor;
use std::sync::OnceLock;
use tracing::debug;

pub const SIGNAL_NAME: &str = "provenance";

const NO_EXIF_WEIGHT: f64 = 0.5;
const NO_CAMERA_WEIGHT: f64 = 0.3;
const NO_CAPTURE_WEIGHT: f64 = 0.2;
const TILE_MULTIPLE_WEIGHT: f64 = 0.2;
const DEFAULT_TILE_SIZE: u32 = 64;

const GENERATOR_PATTERN: &str = r"stable[\s_-]?diffusion|midjourney|dall[\s·-]?e|firefly|comfyui|automatic1111|novelai|invokeai|sdxl|leonardo\.ai|imagen|steps:\s*\d+,\s*sampler";

const CAPTURE_TAGS: [Tag; 5] = [
    Tag::ExposureTime,
    Tag::FNumber,
    Tag::PhotographicSensitivity,
    Tag::DateTimeOriginal,
    Tag::FocalLength,
];

const TEXT_TAGS: [Tag; 4] = [Tag::Software, Tag::ImageDescription, Tag::Artist, Tag::Make];

fn generator_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        RegexBuilder::new(GENERATOR_PATTERN)
            .case_insensitive(true)
            .build()
            .expect("generator name pattern compiles")
    })
}

/// Findings behind one provenance score.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvenanceReport {
    pub has_exif: bool,
    pub has_camera: bool,
    pub has_capture_settings: bool,
    pub tile_aligned: bool,
    pub generator: Option<String>,
}

impl ProvenanceReport {
    pub fn suspicion(&self) -> f64 {
        if self.generator.is_some() {
            return 1.0;
        }
        let mut score = 0.0;
        if !self.has_exif {
            score += NO_EXIF_WEIGHT;
        }
        if !self.has_camera {
            score += NO_CAMERA_WEIGHT;
        }
        if !self.has_capture_settings {
            score += NO_CAPTURE_WEIGHT;
        }
        if self.tile_aligned {
            score += TILE_MULTIPLE_WEIGHT;
        }
        f64::min(score, 1.0)
    }
}

#[derive(Debug, Clone)]
pub struct ProvenanceExtractor {
    tile_size: u32,
}

impl Default for ProvenanceExtractor {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
        }
    }
}

impl ProvenanceExtractor {
    pub fn inspect(&self, bytes: &[u8], width: u32, height: u32) -> Result<ProvenanceReport, ExtractorError> {
        let mut report = ProvenanceReport {
            tile_aligned: width % self.tile_size == 0 && height % self.tile_size == 0,
            ..ProvenanceReport::default()
        };
        let mut texts: Vec<String> = Vec::new();

        if let Some(exif) = read_exif(bytes)? {
            report.has_exif = exif.fields().next().is_some();
            report.has_camera = [Tag::Make, Tag::Model]
                .iter()
                .any(|tag| exif.get_field(*tag, In::PRIMARY).is_some());
            report.has_capture_settings = CAPTURE_TAGS
                .iter()
                .any(|tag| exif.get_field(*tag, In::PRIMARY).is_some());
            for tag in TEXT_TAGS {
                if let Some(field) = exif.get_field(tag, In::PRIMARY) {
                    texts.push(field.display_value().to_string());
                }
            }
        }

        if matches!(image::guess_format(bytes), Ok(ImageFormat::Png)) {
            texts.extend(png_text_chunks(bytes));
        }

        report.generator = texts
            .iter()
            .find_map(|t| generator_pattern().find(t).map(|m| m.as_str().to_string()));
        Ok(report)
    }
}

impl SignalExtractor for ProvenanceExtractor {
    fn name(&self) -> &'static str {
        SIGNAL_NAME
    }

    fn role(&self) -> SignalRole {
        SignalRole::Reliability
    }

    fn fallback_value(&self) -> f64 {
        0.5
    }

    fn measure(&self, input: &ExtractionInput<'_>, _plane: &LumaPlane) -> Result<f64, ExtractorError> {
        let report = self.inspect(input.bytes, input.image.width, input.image.height)?;
        Ok(report.suspicion())
    }
}

/// `Ok(None)` when the container carries no EXIF block or cannot carry one.
fn read_exif(bytes: &[u8]) -> Result<Option<exif::Exif>, ExtractorError> {
    let container = matches!(
        image::guess_format(bytes),
        Ok(ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::Tiff | ImageFormat::WebP)
    );
    if !container {
        return Ok(None);
    }
    match exif::Reader::new().read_from_container(&mut Cursor::new(bytes)) {
        Ok(exif) => Ok(Some(exif)),
        Err(exif::Error::NotFound(_)) => Ok(None),
        Err(e) => Err(ExtractorError::Malformed(format!("exif: {}", e))),
    }
}

/// Keyword and text of every PNG text chunk (`tEXt`, `zTXt`, `iTXt`), inflated where compressed.
/// Chunks after the image data are included. A damaged stream yields whatever was read before the damage.
pub fn png_text_chunks(bytes: &[u8]) -> Vec<String> {
    let mut reader = match png::Decoder::new(Cursor::new(bytes)).read_info() {
        Ok(reader) => reader,
        Err(e) => {
            debug!(error = %e, "provenance.png_unreadable");
            return Vec::new();
        }
    };
    if let Err(e) = reader.finish() {
        debug!(error = %e, "provenance.png_trailing_chunks_unreadable");
    }

    let info = reader.info();
    let mut out = Vec::new();
    for chunk in &info.uncompressed_latin1_text {
        out.push(format!("{} {}", chunk.keyword, chunk.text));
    }
    for chunk in &info.compressed_latin1_text {
        match chunk.get_text() {
            Ok(text) => out.push(format!("{} {}", chunk.keyword, text)),
            Err(e) => debug!(keyword = %chunk.keyword, error = %e, "provenance.ztxt_undecodable"),
        }
    }
    for chunk in &info.utf8_text {
        match chunk.get_text() {
            Ok(text) => out.push(format!("{} {}", chunk.keyword, text)),
            Err(e) => debug!(keyword = %chunk.keyword, error = %e, "provenance.itxt_undecodable"),
        }
    }
    out
}
