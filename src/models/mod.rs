// SynthScope Data Models
// Media input, signal values and the persisted result record

use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Constant written to the `type` field of every result record.
pub const RECORD_TYPE: &str = "image";

// ============ Media ============

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Unknown,
}

impl MediaKind {
    /// Classify a declared MIME type such as `image/png`.
    pub fn from_content_type(content_type: &str) -> Self {
        let lowered = content_type.trim().to_lowercase();
        if lowered.starts_with("image/") || lowered == "image" {
            Self::Image
        } else if lowered.starts_with("video/") || lowered == "video" {
            Self::Video
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Unknown => "unknown",
        }
    }
}

/// Raw bytes of one uploaded item. Never mutated once built.
#[derive(Debug, Clone)]
pub struct MediaBlob {
    bytes: Vec<u8>,
    kind: MediaKind,
    content_type: Option<String>,
}

impl MediaBlob {
    pub fn new(bytes: Vec<u8>, kind: MediaKind, content_type: Option<String>) -> Self {
        Self {
            bytes,
            kind,
            content_type,
        }
    }

    pub fn image(bytes: Vec<u8>) -> Self {
        Self::new(bytes, MediaKind::Image, None)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

// ============ Signals ============

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalRole {
    /// Contributes to the fused score after scaling.
    Evidence,
    /// Scales, damps or gates evidence. Never summed.
    Reliability,
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalValue {
    Point { value: f64 },
    /// Result of several perturbed passes over the same input.
    Sampled { mean: f64, std: f64, runs: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub name: String,
    pub role: SignalRole,
    pub value: SignalValue,
}

impl Signal {
    pub fn point(name: impl Into<String>, role: SignalRole, value: f64) -> Self {
        Self {
            name: name.into(),
            role,
            value: SignalValue::Point {
                value: value.clamp(0.0, 1.0),
            },
        }
    }

    /// Build a sampled signal from per-pass scores. Population standard deviation.
    pub fn sampled(name: impl Into<String>, role: SignalRole, scores: &[f64]) -> Self {
        let runs = scores.len().max(1);
        let mean = scores.iter().sum::<f64>() / runs as f64;
        let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / runs as f64;
        Self {
            name: name.into(),
            role,
            value: SignalValue::Sampled {
                mean: mean.clamp(0.0, 1.0),
                std: variance.sqrt().clamp(0.0, 1.0),
                runs: runs as u32,
            },
        }
    }

    /// Point value, or the mean for sampled signals.
    pub fn score(&self) -> f64 {
        match self.value {
            SignalValue::Point { value } => value,
            SignalValue::Sampled { mean, .. } => mean,
        }
    }

    /// Standard deviation across passes; `None` for single-pass signals.
    pub fn instability(&self) -> Option<f64> {
        match self.value {
            SignalValue::Point { .. } => None,
            SignalValue::Sampled { std, .. } => Some(std),
        }
    }
}

/// Per-extractor result. Failures never escape as errors; they degrade to a fallback score.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    Measured(Signal),
    Fallback { signal: Signal, reason: String },
}

impl SignalOutcome {
    pub fn signal(&self) -> &Signal {
        match self {
            Self::Measured(signal) => signal,
            Self::Fallback { signal, .. } => signal,
        }
    }

    pub fn into_signal(self) -> Signal {
        match self {
            Self::Measured(signal) => signal,
            Self::Fallback { signal, .. } => signal,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }
}

// ============ Result Record ============

/// Ordered by severity: `LikelyNatural < Uncertain < PossibleAi < HighConfidenceAi`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    LikelyNatural,
    Uncertain,
    PossibleAi,
    HighConfidenceAi,
}

impl Verdict {
    pub fn label(&self) -> &'static str {
        match self {
            Self::HighConfidenceAi => "AI-generated",
            Self::PossibleAi => "Possibly AI-generated",
            Self::Uncertain => "Uncertain",
            Self::LikelyNatural => "Likely natural",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Started,
    Completed,
    Failed,
}

/// The record persisted at a worker's output location and returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionResult {
    #[serde(rename = "type")]
    pub record_type: String,
    pub verdict: Verdict,
    #[serde(serialize_with = "serialize_rounded")]
    pub confidence: f64,
    #[serde(default, serialize_with = "serialize_rounded_map")]
    pub signals: BTreeMap<String, f64>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FusionResult {
    /// Placeholder written before any computation starts.
    pub fn started() -> Self {
        Self {
            record_type: RECORD_TYPE.to_string(),
            verdict: Verdict::Uncertain,
            confidence: 0.0,
            signals: BTreeMap::new(),
            status: RunStatus::Started,
            error: None,
        }
    }

    pub fn completed(confidence: f64, verdict: Verdict, signals: BTreeMap<String, f64>) -> Self {
        Self {
            record_type: RECORD_TYPE.to_string(),
            verdict,
            confidence: round3(confidence.clamp(0.0, 1.0)),
            signals: signals.into_iter().map(|(k, v)| (k, round3(v))).collect(),
            status: RunStatus::Completed,
            error: None,
        }
    }

    /// Degraded result: confidence 0.0, verdict Uncertain.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            record_type: RECORD_TYPE.to_string(),
            verdict: Verdict::Uncertain,
            confidence: 0.0,
            signals: BTreeMap::new(),
            status: RunStatus::Failed,
            error: Some(error.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == RunStatus::Failed
    }
}

/// Round to 3 decimal places.
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn serialize_rounded<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(round3(*value))
}

fn serialize_rounded_map<S: Serializer>(
    values: &BTreeMap<String, f64>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(values.len()))?;
    for (name, value) in values {
        map.serialize_entry(name, &round3(*value))?;
    }
    map.end()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_kind_from_content_type() {
        assert_eq!(MediaKind::from_content_type("image/jpeg"), MediaKind::Image);
        assert_eq!(MediaKind::from_content_type(" IMAGE/PNG "), MediaKind::Image);
        assert_eq!(MediaKind::from_content_type("video/mp4"), MediaKind::Video);
        assert_eq!(MediaKind::from_content_type("application/pdf"), MediaKind::Unknown);
    }

    #[test]
    fn test_sampled_signal_statistics() {
        let signal = Signal::sampled("frequency", SignalRole::Evidence, &[0.4, 0.6]);
        assert!((signal.score() - 0.5).abs() < 1e-9);
        assert!((signal.instability().unwrap() - 0.1).abs() < 1e-9);
        match signal.value {
            SignalValue::Sampled { runs, .. } => assert_eq!(runs, 2),
            _ => panic!("expected sampled value"),
        }
    }

    #[test]
    fn test_point_signal_is_clamped() {
        let signal = Signal::point("frequency", SignalRole::Evidence, 1.7);
        assert_eq!(signal.score(), 1.0);
        assert_eq!(signal.instability(), None);
    }

    #[test]
    fn test_verdict_severity_order() {
        assert!(Verdict::LikelyNatural < Verdict::Uncertain);
        assert!(Verdict::Uncertain < Verdict::PossibleAi);
        assert!(Verdict::PossibleAi < Verdict::HighConfidenceAi);
    }

    #[test]
    fn test_failed_record_defaults() {
        let result = FusionResult::failed("decode error");
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.verdict, Verdict::Uncertain);
        assert_eq!(result.error.as_deref(), Some("decode error"));
    }

    #[test]
    fn test_record_wire_format() {
        let mut signals = BTreeMap::new();
        signals.insert("frequency".to_string(), 0.123456);
        let result = FusionResult::completed(0.87654, Verdict::HighConfidenceAi, signals);
        let json: serde_json::Value = serde_json::to_value(&result).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["verdict"], "high_confidence_ai");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["confidence"], 0.877);
        assert_eq!(json["signals"]["frequency"], 0.123);
        assert!(json.get("error").is_none());
    }
}
