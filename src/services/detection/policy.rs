// Fusion Policy
// Versioned, data-driven description of how signals combine: weights, gates, caps,
// damping and the conditional override. Swapping a policy never touches orchestration code.

use super::verdict::VerdictBands;
use crate::services::extractors::{feature_variance, frequency, provenance, recompression, CalibrationError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

pub const POLICY_VERSION: &str = "fusion-v2";

#[derive(Error, Debug, PartialEq)]
pub enum PolicyError {
    #[error("policy has no evidence rules")]
    NoEvidence,
    #[error("evidence weights sum to {0:.3}, above 1.0")]
    WeightsExceedOne(f64),
    #[error("evidence '{0}' has a negative or non-finite weight")]
    InvalidWeight(String),
    #[error("evidence '{0}' is listed more than once")]
    DuplicateEvidence(String),
    #[error("{name} must lie in [0, 1], got {value}")]
    OutOfRange { name: &'static str, value: f64 },
    #[error("verdict bands must satisfy 0 < uncertain < possible_ai < high_confidence_ai <= 1")]
    BandsNotMonotone,
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}

/// One evidence signal and the reliability signals that gate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceRule {
    pub signal: String,
    pub weight: f64,
    #[serde(default)]
    pub gates: Vec<String>,
}

/// Damping derived from a provenance-style reliability signal: `cap * (1 - value)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DampingRule {
    pub signal: String,
    pub cap: f64,
}

/// Bonus applied when an evidence signal is extreme and its gate confirms it is genuine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideRule {
    pub evidence_signal: String,
    pub evidence_threshold: f64,
    pub gate_signal: String,
    pub gate_max: f64,
    pub bonus: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FusionPolicy {
    #[serde(default = "default_version")]
    pub version: String,
    pub evidence: Vec<EvidenceRule>,
    /// Ceiling applied to every reliability input before it is subtracted from 1.0.
    #[serde(default = "default_reliability_cap")]
    pub reliability_cap: f64,
    /// Multiplier turning a sampled signal's std into a reliability input.
    #[serde(default = "default_instability_scale")]
    pub instability_scale: f64,
    #[serde(default)]
    pub damping: Option<DampingRule>,
    #[serde(default)]
    pub override_rule: Option<OverrideRule>,
    #[serde(default)]
    pub bands: VerdictBands,
}

fn default_version() -> String { POLICY_VERSION.to_string() }
fn default_reliability_cap() -> f64 { 0.7 }
fn default_instability_scale() -> f64 { 4.0 }

impl Default for FusionPolicy {
    fn default() -> Self {
        Self {
            version: default_version(),
            evidence: vec![
                EvidenceRule {
                    signal: frequency::SIGNAL_NAME.to_string(),
                    weight: 0.65,
                    gates: vec![recompression::SIGNAL_NAME.to_string()],
                },
                EvidenceRule {
                    signal: feature_variance::SIGNAL_NAME.to_string(),
                    weight: 0.35,
                    gates: vec![],
                },
            ],
            reliability_cap: default_reliability_cap(),
            instability_scale: default_instability_scale(),
            damping: Some(DampingRule {
                signal: provenance::SIGNAL_NAME.to_string(),
                cap: 0.35,
            }),
            override_rule: Some(OverrideRule {
                evidence_signal: frequency::SIGNAL_NAME.to_string(),
                evidence_threshold: 0.9,
                gate_signal: recompression::SIGNAL_NAME.to_string(),
                gate_max: 0.3,
                bonus: 0.35,
            }),
            bands: VerdictBands::default(),
        }
    }
}

impl FusionPolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.evidence.is_empty() {
            return Err(PolicyError::NoEvidence);
        }

        let mut seen = HashSet::new();
        let mut total = 0.0;
        for rule in &self.evidence {
            if !rule.weight.is_finite() || rule.weight < 0.0 {
                return Err(PolicyError::InvalidWeight(rule.signal.clone()));
            }
            if !seen.insert(rule.signal.as_str()) {
                return Err(PolicyError::DuplicateEvidence(rule.signal.clone()));
            }
            total += rule.weight;
        }
        // tolerate float noise from config files
        if total > 1.0 + 1e-9 {
            return Err(PolicyError::WeightsExceedOne(total));
        }

        unit_range("reliability_cap", self.reliability_cap)?;
        if !self.instability_scale.is_finite() || self.instability_scale < 0.0 {
            return Err(PolicyError::OutOfRange {
                name: "instability_scale",
                value: self.instability_scale,
            });
        }
        if let Some(damping) = &self.damping {
            unit_range("damping.cap", damping.cap)?;
        }
        if let Some(rule) = &self.override_rule {
            unit_range("override.evidence_threshold", rule.evidence_threshold)?;
            unit_range("override.gate_max", rule.gate_max)?;
            unit_range("override.bonus", rule.bonus)?;
        }
        self.bands.validate()
    }

    pub fn with_bands(mut self, bands: VerdictBands) -> Self {
        self.bands = bands;
        self
    }
}

fn unit_range(name: &'static str, value: f64) -> Result<(), PolicyError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(PolicyError::OutOfRange { name, value })
    }
}
