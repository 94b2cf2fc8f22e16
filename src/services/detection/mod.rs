// Detection Module
// Image detection core logic organized into specialized submodules:
// - policy: Versioned fusion policy (weights, gates, damping, override, bands)
// - fusion: Reliability-gated fusion of extractor signals
// - verdict: Sensitivity presets and confidence-to-verdict bands
// - pipeline: Detection engine running extraction then fusion for one blob

pub mod fusion;
pub mod pipeline;
pub mod policy;
pub mod verdict;

// Re-export commonly used items
pub use fusion::{fuse, fuse_detailed, trust_factor, EvidenceContribution, FusionBreakdown};
pub use pipeline::{DetectionEngine, DetectionError};
pub use policy::{DampingRule, EvidenceRule, FusionPolicy, OverrideRule, PolicyError, POLICY_VERSION};
pub use verdict::{DetectionSensitivity, VerdictBands};
