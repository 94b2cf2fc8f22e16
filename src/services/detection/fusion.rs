// Fusion Engine
// Reliability-gated fusion of evidence signals. Reliability signals only scale, damp or gate
// evidence, each within a capped range; they never enter the weighted sum themselves.

use super::policy::{EvidenceRule, FusionPolicy};
use crate::models::{FusionResult, Signal, SignalRole};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

pub const METADATA_DAMPING_KEY: &str = "metadata_damping";
pub const OVERRIDE_BONUS_KEY: &str = "override_bonus";

/// Per-evidence breakdown of one fusion run.
#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceContribution {
    pub signal: String,
    pub raw: f64,
    pub reliability: f64,
    pub effective: f64,
    pub weighted: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusionBreakdown {
    pub contributions: Vec<EvidenceContribution>,
    pub damping: f64,
    pub bonus: f64,
    pub confidence: f64,
}

struct SignalIndex<'a> {
    by_name: HashMap<&'a str, &'a Signal>,
}

impl<'a> SignalIndex<'a> {
    fn new(signals: &'a [Signal]) -> Self {
        Self {
            by_name: signals.iter().map(|s| (s.name.as_str(), s)).collect(),
        }
    }

    fn with_role(&self, name: &str, role: SignalRole) -> Option<&'a Signal> {
        self.by_name.get(name).copied().filter(|s| s.role == role)
    }

    fn reliability(&self, name: &str) -> Option<f64> {
        self.with_role(name, SignalRole::Reliability).map(|s| s.score())
    }
}

/// Trust factor contributed by one reliability input. Never below `1 - cap`.
pub fn trust_factor(reliability_value: f64, cap: f64) -> f64 {
    let value = if reliability_value.is_nan() { 0.0 } else { reliability_value.clamp(0.0, 1.0) };
    1.0 - value.min(cap.clamp(0.0, 1.0))
}

fn reliability_of(rule: &EvidenceRule, evidence: &Signal, index: &SignalIndex<'_>, policy: &FusionPolicy) -> f64 {
    let mut factor = 1.0;
    for gate in &rule.gates {
        // a missing gate is neutral
        if let Some(value) = index.reliability(gate) {
            factor *= trust_factor(value, policy.reliability_cap);
        }
    }
    if let Some(std) = evidence.instability() {
        let instability = (std * policy.instability_scale).clamp(0.0, 1.0);
        factor *= trust_factor(instability, policy.reliability_cap);
    }
    factor
}

fn metadata_damping(index: &SignalIndex<'_>, policy: &FusionPolicy) -> f64 {
    let Some(rule) = &policy.damping else {
        return 0.0;
    };
    match index.reliability(&rule.signal) {
        Some(suspicion) => rule.cap.clamp(0.0, 1.0) * (1.0 - suspicion.clamp(0.0, 1.0)),
        None => 0.0,
    }
}

fn override_bonus(index: &SignalIndex<'_>, policy: &FusionPolicy) -> f64 {
    let Some(rule) = &policy.override_rule else {
        return 0.0;
    };
    let Some(evidence) = index.with_role(&rule.evidence_signal, SignalRole::Evidence) else {
        return 0.0;
    };
    match index.reliability(&rule.gate_signal) {
        // without a gate reading the bonus cannot be confirmed
        Some(gate) if evidence.score() >= rule.evidence_threshold && gate < rule.gate_max => rule.bonus,
        _ => 0.0,
    }
}

/// Compute the fused confidence and its breakdown. Deterministic for a fixed signal set.
pub fn fuse_detailed(signals: &[Signal], policy: &FusionPolicy) -> FusionBreakdown {
    let index = SignalIndex::new(signals);
    let damping = metadata_damping(&index, policy);

    let contributions: Vec<EvidenceContribution> = policy
        .evidence
        .iter()
        .filter_map(|rule| {
            let evidence = index.with_role(&rule.signal, SignalRole::Evidence)?;
            let raw = evidence.score();
            let reliability = reliability_of(rule, evidence, &index, policy);
            let effective = raw * reliability * (1.0 - damping);
            Some(EvidenceContribution {
                signal: rule.signal.clone(),
                raw,
                reliability,
                effective,
                weighted: rule.weight * effective,
            })
        })
        .collect();

    let bonus = override_bonus(&index, policy);
    let sum: f64 = contributions.iter().map(|c| c.weighted).sum();
    let confidence = (sum + bonus).clamp(0.0, 1.0);

    debug!(
        policy = %policy.version,
        evidence = contributions.len(),
        damping,
        bonus,
        confidence,
        "[FUSION] fused"
    );

    FusionBreakdown {
        contributions,
        damping,
        bonus,
        confidence,
    }
}

/// Fuse signals into a completed result record.
pub fn fuse(signals: &[Signal], policy: &FusionPolicy) -> FusionResult {
    let breakdown = fuse_detailed(signals, policy);

    let mut reported = BTreeMap::new();
    for signal in signals {
        reported.insert(signal.name.clone(), signal.score());
        if let Some(std) = signal.instability() {
            reported.insert(format!("{}_std", signal.name), std);
        }
    }
    for contribution in &breakdown.contributions {
        reported.insert(format!("{}_reliability", contribution.signal), contribution.reliability);
    }
    reported.insert(METADATA_DAMPING_KEY.to_string(), breakdown.damping);
    reported.insert(OVERRIDE_BONUS_KEY.to_string(), breakdown.bonus);

    let verdict = policy.bands.decide(breakdown.confidence);
    FusionResult::completed(breakdown.confidence, verdict, reported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunStatus, SignalValue, Verdict};

    fn evidence(name: &str, value: f64) -> Signal {
        Signal::point(name, SignalRole::Evidence, value)
    }

    fn reliability(name: &str, value: f64) -> Signal {
        Signal::point(name, SignalRole::Reliability, value)
    }

    fn signals(frequency: f64, feature: f64, provenance: f64, recompression: f64) -> Vec<Signal> {
        vec![
            evidence("frequency", frequency),
            evidence("feature_variance", feature),
            reliability("provenance", provenance),
            reliability("recompression", recompression),
        ]
    }

    #[test]
    fn test_scenario_unmetadata_strong_artifact() {
        // no metadata at all -> provenance suspicion 1.0, so no damping
        let policy = FusionPolicy::default();
        for i in 0..=10 {
            let feature = i as f64 / 10.0;
            let result = fuse(&signals(0.95, feature, 1.0, 0.1), &policy);
            assert_eq!(result.status, RunStatus::Completed);
            assert_eq!(result.signals[OVERRIDE_BONUS_KEY], 0.35);
            assert!(result.confidence >= 0.75, "feature {} -> {}", feature, result.confidence);
            assert_eq!(result.verdict, Verdict::HighConfidenceAi);
        }
    }

    #[test]
    fn test_override_alone_reaches_high_band() {
        // weakest reading that still qualifies for the bonus
        let policy = FusionPolicy::default();
        let result = fuse(&signals(0.9, 0.0, 1.0, 0.29), &policy);
        assert_eq!(result.signals[OVERRIDE_BONUS_KEY], 0.35);
        assert_eq!(result.verdict, Verdict::HighConfidenceAi, "confidence {}", result.confidence);
    }

    #[test]
    fn test_scenario_camera_metadata_heavy_recompression() {
        let policy = FusionPolicy::default();
        for feature in [0.0, 0.5, 1.0] {
            let breakdown = fuse_detailed(&signals(0.95, feature, 0.0, 0.8), &policy);
            assert_eq!(breakdown.bonus, 0.0);
            let result = fuse(&signals(0.95, feature, 0.0, 0.8), &policy);
            assert!(result.verdict <= Verdict::PossibleAi, "feature {} -> {:?}", feature, result.verdict);
        }
    }

    #[test]
    fn test_monotone_in_evidence() {
        let policy = FusionPolicy::default();
        for (provenance, recompression) in [(0.0, 0.0), (0.5, 0.2), (1.0, 0.9)] {
            let mut previous = -1.0;
            for i in 0..=100 {
                let raw = i as f64 / 100.0;
                let confidence = fuse_detailed(&signals(raw, 0.4, provenance, recompression), &policy).confidence;
                assert!(confidence >= previous);
                previous = confidence;
            }
        }
    }

    #[test]
    fn test_single_reliability_cannot_veto() {
        let policy = FusionPolicy::default();
        let raw = 0.8;
        // recompression at maximum, everything else neutral
        let set = vec![evidence("frequency", raw), reliability("recompression", 1.0)];
        let breakdown = fuse_detailed(&set, &policy);
        let frequency = &breakdown.contributions[0];
        assert!(frequency.effective >= raw * (1.0 - policy.reliability_cap) - 1e-12);
        assert!(frequency.effective > 0.0);
    }

    #[test]
    fn test_instability_dampens_trust() {
        let policy = FusionPolicy::default();
        let stable = Signal {
            name: "frequency".to_string(),
            role: SignalRole::Evidence,
            value: SignalValue::Sampled { mean: 0.7, std: 0.0, runs: 5 },
        };
        let shaky = Signal {
            value: SignalValue::Sampled { mean: 0.7, std: 0.1, runs: 5 },
            ..stable.clone()
        };
        let a = fuse_detailed(&[stable], &policy);
        let b = fuse_detailed(&[shaky], &policy);
        assert!(b.contributions[0].reliability < a.contributions[0].reliability);
        assert!((b.contributions[0].reliability - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_reliability_never_adds() {
        let policy = FusionPolicy::default();
        let only_reliability = vec![reliability("provenance", 1.0), reliability("recompression", 1.0)];
        let result = fuse(&only_reliability, &policy);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.verdict, Verdict::LikelyNatural);
    }

    #[test]
    fn test_role_mismatch_is_ignored() {
        let policy = FusionPolicy::default();
        // a reliability-role signal named like evidence never contributes
        let set = vec![reliability("frequency", 1.0)];
        assert_eq!(fuse_detailed(&set, &policy).confidence, 0.0);
        // an evidence-role signal named like a gate never gates
        let set = vec![evidence("frequency", 0.5), evidence("recompression", 1.0)];
        assert_eq!(fuse_detailed(&set, &policy).contributions[0].reliability, 1.0);
    }

    #[test]
    fn test_override_requires_gate_reading() {
        let policy = FusionPolicy::default();
        let set = vec![evidence("frequency", 0.99)];
        assert_eq!(fuse_detailed(&set, &policy).bonus, 0.0);
    }

    #[test]
    fn test_fusion_is_byte_identical() {
        let policy = FusionPolicy::default();
        let set = signals(0.63, 0.41, 0.3, 0.25);
        let a = serde_json::to_string(&fuse(&set, &policy)).unwrap();
        let b = serde_json::to_string(&fuse(&set, &policy)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_trust_factor_floor() {
        assert_eq!(trust_factor(1.0, 0.7), 1.0 - 0.7);
        assert_eq!(trust_factor(0.2, 0.7), 0.8);
        assert_eq!(trust_factor(f64::NAN, 0.7), 1.0);
    }
}
