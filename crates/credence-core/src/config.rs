//! Engine configuration
//!
//! All tunables recognised by the engine, with the bounds they are clamped
//! to. Environment loading is the caller's concern; the engine only ever
//! sees a constructed [`EngineConfig`].

use serde::{Deserialize, Serialize};

// ============================================================================
// DEFAULTS
// ============================================================================

/// Cosine similarity at or above which an ingest is a hard duplicate
pub const DEFAULT_DEDUP_THRESHOLD: f32 = 0.85;

/// Lower edge of the LLM-judged duplicate band
pub const DEFAULT_DEDUP_LOWER_THRESHOLD: f32 = 0.70;

/// Judge confidence required to reject inside the duplicate band
pub const DEFAULT_DEDUP_CONFIDENCE_THRESHOLD: f32 = 0.80;

/// Edges below this strength are ignored by traversals
pub const DEFAULT_MIN_EDGE_STRENGTH: f32 = 0.30;

/// Damping factor for confidence updates (share taken from neighbours)
pub const DEFAULT_SHOCK_ALPHA: f64 = 0.6;

/// Contradiction weight inside the update rule
pub const DEFAULT_SHOCK_ETA: f64 = 0.8;

/// Share of a shock that cascades out to supporting neighbours
pub const DEFAULT_PROPAGATION_RHO: f64 = 0.3;

/// Zone penalty weight for boundary contradictions (cut-)
pub const DEFAULT_QUALITY_LAMBDA: f64 = 0.2;

/// Zone penalty weight for severed support (loss+)
pub const DEFAULT_QUALITY_RHO: f64 = 0.1;

/// Judge confidence floor for recording a violation
pub const DEFAULT_VIOLATION_THRESHOLD: f32 = 0.7;

/// Judge confidence floor for recording a confirmation
pub const DEFAULT_CONFIRM_THRESHOLD: f32 = 0.7;

/// Per-condition candidate search cap
pub const DEFAULT_MAX_CANDIDATES: usize = 20;

/// Vector search similarity cutoff
pub const DEFAULT_MIN_SIMILARITY: f32 = 0.5;

/// Global in-flight judge call cap
pub const DEFAULT_JUDGE_CONCURRENCY: usize = 8;

/// Global in-flight embedding call cap
pub const DEFAULT_EMBED_CONCURRENCY: usize = 8;

// ============================================================================
// CONFIG
// ============================================================================

/// Engine configuration
///
/// Construct with [`Default::default`] and override fields, then call
/// [`EngineConfig::clamped`] to enforce the documented bounds. The engine
/// clamps on construction so a wild value can never widen a threshold past
/// its safe range.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Hard-duplicate cosine threshold (0.5 - 1.0)
    pub dedup_threshold: f32,
    /// LLM-judge duplicate band lower edge (0.3 - 0.9)
    pub dedup_lower_threshold: f32,
    /// Judge confidence to reject a near-duplicate (0.5 - 1.0)
    pub dedup_confidence_threshold: f32,
    /// Minimum edge strength considered by traversals
    pub min_edge_strength: f32,
    /// Confidence update damping factor
    pub shock_alpha: f64,
    /// Contradiction weight in the update rule
    pub shock_eta: f64,
    /// Cascade-out share of a shock
    pub propagation_rho: f64,
    /// Zone penalty weight for cut- edges
    pub quality_lambda: f64,
    /// Zone penalty weight for loss+ edges
    pub quality_rho: f64,
    /// Judge confidence floor for violations (0.5 - 1.0)
    pub violation_threshold: f32,
    /// Judge confidence floor for confirmations (0.5 - 1.0)
    pub confirm_threshold: f32,
    /// Per-condition candidate cap (1 - 100)
    pub max_candidates: usize,
    /// Vector search cutoff (0.0 - 1.0)
    pub min_similarity: f32,
    /// Global in-flight judge calls (1 - 32)
    pub judge_concurrency: usize,
    /// Global in-flight embedding calls (1 - 32)
    pub embed_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dedup_threshold: DEFAULT_DEDUP_THRESHOLD,
            dedup_lower_threshold: DEFAULT_DEDUP_LOWER_THRESHOLD,
            dedup_confidence_threshold: DEFAULT_DEDUP_CONFIDENCE_THRESHOLD,
            min_edge_strength: DEFAULT_MIN_EDGE_STRENGTH,
            shock_alpha: DEFAULT_SHOCK_ALPHA,
            shock_eta: DEFAULT_SHOCK_ETA,
            propagation_rho: DEFAULT_PROPAGATION_RHO,
            quality_lambda: DEFAULT_QUALITY_LAMBDA,
            quality_rho: DEFAULT_QUALITY_RHO,
            violation_threshold: DEFAULT_VIOLATION_THRESHOLD,
            confirm_threshold: DEFAULT_CONFIRM_THRESHOLD,
            max_candidates: DEFAULT_MAX_CANDIDATES,
            min_similarity: DEFAULT_MIN_SIMILARITY,
            judge_concurrency: DEFAULT_JUDGE_CONCURRENCY,
            embed_concurrency: DEFAULT_EMBED_CONCURRENCY,
        }
    }
}

impl EngineConfig {
    /// Return a copy with every option clamped to its documented bounds
    pub fn clamped(mut self) -> Self {
        self.dedup_threshold = self.dedup_threshold.clamp(0.5, 1.0);
        self.dedup_lower_threshold = self.dedup_lower_threshold.clamp(0.3, 0.9);
        self.dedup_confidence_threshold = self.dedup_confidence_threshold.clamp(0.5, 1.0);
        self.violation_threshold = self.violation_threshold.clamp(0.5, 1.0);
        self.confirm_threshold = self.confirm_threshold.clamp(0.5, 1.0);
        self.max_candidates = self.max_candidates.clamp(1, 100);
        self.min_similarity = self.min_similarity.clamp(0.0, 1.0);
        self.judge_concurrency = self.judge_concurrency.clamp(1, 32);
        self.embed_concurrency = self.embed_concurrency.clamp(1, 32);
        self
    }
}
