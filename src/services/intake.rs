// Upload Intake
// Turns an upload (declared content type + bytes) into a MediaBlob the supervisor accepts.

use crate::models::{MediaBlob, MediaKind};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, PartialEq)]
pub enum IntakeError {
    #[error("unsupported media kind: {0}")]
    UnsupportedMediaKind(&'static str),
    #[error("upload is empty")]
    Empty,
}

/// Classify an upload. The declared content type wins when it names images or video;
/// otherwise the bytes are sniffed for a known image format.
pub fn classify_upload(content_type: Option<&str>, bytes: Vec<u8>) -> Result<MediaBlob, IntakeError> {
    if bytes.is_empty() {
        return Err(IntakeError::Empty);
    }

    let declared = content_type.map(MediaKind::from_content_type).unwrap_or(MediaKind::Unknown);
    let kind = match declared {
        MediaKind::Unknown => sniff(&bytes),
        known => known,
    };
    debug!(declared = ?content_type, kind = kind.as_str(), "intake.classified");

    match kind {
        MediaKind::Image => Ok(MediaBlob::new(bytes, kind, content_type.map(str::to_string))),
        other => Err(IntakeError::UnsupportedMediaKind(other.as_str())),
    }
}

fn sniff(bytes: &[u8]) -> MediaKind {
    match image::guess_format(bytes) {
        Ok(_) => MediaKind::Image,
        Err(_) => MediaKind::Unknown,
    }
}
