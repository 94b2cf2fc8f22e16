// Recompression Artifact Extractor
// Degeneracy of JPEG quantization tables. Coarse, flat tables mean the spectrum has been
// rewritten by (re)compression and frequency evidence deserves less trust.

use super::{ExtractionInput, ExtractorError, SignalExtractor};
use crate::models::SignalRole;
use crate::services::preprocessing::LumaPlane;

pub const SIGNAL_NAME: &str = "recompression";

const COARSENESS_WEIGHT: f64 = 0.6;
const FLATNESS_WEIGHT: f64 = 0.25;
const SPARSITY_WEIGHT: f64 = 0.15;
/// Mean quantizer step at which a table counts as fully coarse.
const COARSE_STEP: f64 = 40.0;
/// Coefficient of variation typical of an unmodified standard table.
const REFERENCE_CV: f64 = 0.75;

/// One DQT table in zig-zag order.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantTable {
    pub id: u8,
    pub values: Vec<u16>,
}

impl QuantTable {
    pub fn degeneracy(&self) -> f64 {
        let n = self.values.len().max(1) as f64;
        let mean = self.values.iter().map(|&v| v as f64).sum::<f64>() / n;
        let variance = self
            .values
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / n;
        let cv = if mean > 0.0 { variance.sqrt() / mean } else { 0.0 };

        let mut distinct = self.values.clone();
        distinct.sort_unstable();
        distinct.dedup();

        let coarseness = ((mean - 1.0) / COARSE_STEP).clamp(0.0, 1.0);
        let flatness = 1.0 - (cv / REFERENCE_CV).clamp(0.0, 1.0);
        let sparsity = 1.0 - distinct.len() as f64 / n;

        (COARSENESS_WEIGHT * coarseness + FLATNESS_WEIGHT * flatness + SPARSITY_WEIGHT * sparsity)
            .clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecompressionExtractor;

impl SignalExtractor for RecompressionExtractor {
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
        if !is_jpeg(input.bytes) {
            // lossless or non-DCT container: no recompression evidence
            return Ok(0.0);
        }
        let tables = parse_quant_tables(input.bytes)?;
        let luminance = tables
            .iter()
            .find(|t| t.id == 0)
            .or_else(|| tables.first())
            .ok_or_else(|| ExtractorError::Malformed("JPEG without quantization tables".to_string()))?;
        Ok(luminance.degeneracy())
    }
}

pub fn is_jpeg(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0xFF, 0xD8])
}

/// Walk JPEG marker segments up to start-of-scan and collect every DQT table.
pub fn parse_quant_tables(bytes: &[u8]) -> Result<Vec<QuantTable>, ExtractorError> {
    if !is_jpeg(bytes) {
        return Err(ExtractorError::Malformed("missing SOI marker".to_string()));
    }

    let mut tables = Vec::new();
    let mut pos = 2;
    while pos + 1 < bytes.len() {
        if bytes[pos] != 0xFF {
            return Err(ExtractorError::Malformed(format!("expected marker at offset {}", pos)));
        }
        let marker = bytes[pos + 1];
        pos += 2;

        match marker {
            // fill byte
            0xFF => {
                pos -= 1;
                continue;
            }
            // standalone markers carry no length
            0x01 | 0xD0..=0xD7 => continue,
            0xD9 | 0xDA => break,
            _ => {}
        }

        let header = bytes
            .get(pos..pos + 2)
            .ok_or_else(|| ExtractorError::Malformed("truncated segment length".to_string()))?;
        let len = u16::from_be_bytes([header[0], header[1]]) as usize;
        if len < 2 {
            return Err(ExtractorError::Malformed(format!("segment length {} too small", len)));
        }
        let payload = bytes
            .get(pos + 2..pos + len)
            .ok_or_else(|| ExtractorError::Malformed("truncated segment".to_string()))?;
        if marker == 0xDB {
            tables.extend(parse_dqt(payload)?);
        }
        pos += len;
    }
    Ok(tables)
}

fn parse_dqt(mut payload: &[u8]) -> Result<Vec<QuantTable>, ExtractorError> {
    let mut tables = Vec::new();
    while let Some((&info, rest)) = payload.split_first() {
        let precision = info >> 4;
        let id = info & 0x0F;
        let width = if precision == 0 { 1 } else { 2 };
        let body = rest
            .get(..64 * width)
            .ok_or_else(|| ExtractorError::Malformed(format!("truncated quantization table {}", id)))?;
        let values = if width == 1 {
            body.iter().map(|&b| b as u16).collect()
        } else {
            body.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect()
        };
        tables.push(QuantTable { id, values });
        payload = &rest[64 * width..];
    }
    Ok(tables)
}
