// Verdict Bands
// Sensitivity shifts the band cut points, never the fused confidence itself.

use super::policy::PolicyError;
use crate::models::Verdict;
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DetectionSensitivity {
    Low,
    Medium,
    High,
}

impl DetectionSensitivity {
    pub fn from_str(val: &str) -> Self {
        match val.trim().to_lowercase().as_str() {
            "low" => Self::Low,
            "high" => Self::High,
            _ => Self::Medium,
        }
    }
}

/// Lower bounds of each verdict band. Anything below `uncertain` is `LikelyNatural`.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerdictBands {
    pub high_confidence_ai: f64,
    pub possible_ai: f64,
    pub uncertain: f64,
}

impl Default for VerdictBands {
    fn default() -> Self {
        Self::for_sensitivity(DetectionSensitivity::Medium)
    }
}

impl VerdictBands {
    pub fn for_sensitivity(sensitivity: DetectionSensitivity) -> Self {
        match sensitivity {
            DetectionSensitivity::Low => Self {
                high_confidence_ai: 0.85,
                possible_ai: 0.55,
                uncertain: 0.30,
            },
            DetectionSensitivity::Medium => Self {
                high_confidence_ai: 0.75,
                possible_ai: 0.40,
                uncertain: 0.25,
            },
            DetectionSensitivity::High => Self {
                high_confidence_ai: 0.65,
                possible_ai: 0.35,
                uncertain: 0.20,
            },
        }
    }

    /// Bands must be strictly ordered inside (0, 1] so every confidence maps to exactly one verdict
    /// and severity never decreases as confidence grows.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let ordered = 0.0 < self.uncertain
            && self.uncertain < self.possible_ai
            && self.possible_ai < self.high_confidence_ai
            && self.high_confidence_ai <= 1.0;
        if ordered {
            Ok(())
        } else {
            Err(PolicyError::BandsNotMonotone)
        }
    }

    pub fn decide(&self, confidence: f64) -> Verdict {
        let confidence = if confidence.is_nan() { 0.0 } else { confidence.clamp(0.0, 1.0) };
        if confidence >= self.high_confidence_ai {
            Verdict::HighConfidenceAi
        } else if confidence >= self.possible_ai {
            Verdict::PossibleAi
        } else if confidence >= self.uncertain {
            Verdict::Uncertain
        } else {
            Verdict::LikelyNatural
        }
    }
}
