//! Memory record - the fundamental unit of belief
//!
//! A memory is a single record shape; its *kind* (observation, thought,
//! prediction) is a predicate over field presence, not a subtype:
//!
//! - `source` present          => observation (external evidence)
//! - `derived_from`, no deadline => thought (a belief)
//! - `resolves_by` present     => prediction (a time-bound thought)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// SOURCE KINDS
// ============================================================================

/// Where an observation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Market data feed
    Market,
    /// News wire
    News,
    /// Earnings release
    Earnings,
    /// Email ingestion
    Email,
    /// A human operator
    Human,
    /// Automated tool output
    Tool,
}

impl SourceKind {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Market => "market",
            SourceKind::News => "news",
            SourceKind::Earnings => "earnings",
            SourceKind::Email => "email",
            SourceKind::Human => "human",
            SourceKind::Tool => "tool",
        }
    }

    /// Parse from a normalised source string
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "market" => Some(SourceKind::Market),
            "news" => Some(SourceKind::News),
            "earnings" => Some(SourceKind::Earnings),
            "email" => Some(SourceKind::Email),
            "human" => Some(SourceKind::Human),
            "tool" => Some(SourceKind::Tool),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// MEMORY KIND (predicate, not subtype)
// ============================================================================

/// Semantic kind of a memory, inferred from field presence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    /// Sourced from reality
    Observation,
    /// Derived belief without a deadline
    Thought,
    /// Time-bound derived belief
    Prediction,
}

impl MemoryKind {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Observation => "observation",
            MemoryKind::Thought => "thought",
            MemoryKind::Prediction => "prediction",
        }
    }
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// STATES AND OUTCOMES
// ============================================================================

/// Lifecycle state of a memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryState {
    /// Persisted with completeness warnings, awaiting override
    Draft,
    /// Live and exposed to new evidence
    #[default]
    Active,
    /// Auto-confirmed time-bound belief
    Confirmed,
    /// A core violation or poor survival rate knocked it out
    Violated,
    /// Explicitly resolved with an outcome
    Resolved,
}

impl MemoryState {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryState::Draft => "draft",
            MemoryState::Active => "active",
            MemoryState::Confirmed => "confirmed",
            MemoryState::Violated => "violated",
            MemoryState::Resolved => "resolved",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(MemoryState::Draft),
            "active" => Some(MemoryState::Active),
            "confirmed" => Some(MemoryState::Confirmed),
            "violated" => Some(MemoryState::Violated),
            "resolved" => Some(MemoryState::Resolved),
            _ => None,
        }
    }

    /// States in which condition vectors are kept indexed
    pub fn keeps_condition_vectors(&self) -> bool {
        matches!(self, MemoryState::Draft | MemoryState::Active)
    }
}

impl std::fmt::Display for MemoryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome recorded when a memory is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The belief held
    Correct,
    /// The belief failed
    Incorrect,
    /// Resolution without a verdict
    Voided,
    /// Replaced by a newer memory
    Superseded,
}

impl Outcome {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Correct => "correct",
            Outcome::Incorrect => "incorrect",
            Outcome::Voided => "voided",
            Outcome::Superseded => "superseded",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "correct" => Some(Outcome::Correct),
            "incorrect" => Some(Outcome::Incorrect),
            "voided" => Some(Outcome::Voided),
            "superseded" => Some(Outcome::Superseded),
            _ => None,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Progress of the post-ingest exposure check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExposureStatus {
    /// Queued, not yet picked up
    #[default]
    Pending,
    /// A checker is working on it
    Processing,
    /// Finished
    Completed,
    /// Nothing to check (no conditions)
    Skipped,
}

impl ExposureStatus {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ExposureStatus::Pending => "pending",
            ExposureStatus::Processing => "processing",
            ExposureStatus::Completed => "completed",
            ExposureStatus::Skipped => "skipped",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExposureStatus::Pending),
            "processing" => Some(ExposureStatus::Processing),
            "completed" => Some(ExposureStatus::Completed),
            "skipped" => Some(ExposureStatus::Skipped),
            _ => None,
        }
    }
}

// ============================================================================
// VIOLATIONS
// ============================================================================

/// How structurally important the violated memory was
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DamageLevel {
    /// High centrality or active descendants: full shock
    Core,
    /// Leaf belief: reduced shock
    Peripheral,
}

impl DamageLevel {
    /// Shock magnitude injected into the cascade for this damage level
    pub fn shock_magnitude(&self) -> f64 {
        match self {
            DamageLevel::Core => 1.0,
            DamageLevel::Peripheral => 0.4,
        }
    }

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            DamageLevel::Core => "core",
            DamageLevel::Peripheral => "peripheral",
        }
    }
}

/// Whether a violation arrived directly or through a cascade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationOrigin {
    /// A judged match against this memory's own condition
    Direct,
    /// Damage propagated from a neighbour
    Cascade,
}

/// One recorded violation of a memory's invalidation condition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationRecord {
    /// The observation that triggered it
    pub obs_id: String,
    /// The matched condition text
    pub condition: String,
    /// When it was recorded
    pub timestamp: DateTime<Utc>,
    /// Core or peripheral
    pub damage_level: DamageLevel,
    /// Direct judge match or cascade damage
    pub source_type: ViolationOrigin,
    /// Seed of the cascade, when source_type is cascade
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cascade_source_id: Option<String>,
}

// ============================================================================
// MEMORY RECORD
// ============================================================================

/// A memory row in the belief graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    /// Unique identifier (UUID v4 unless the caller chose one)
    pub id: String,
    /// The claim text
    pub content: String,
    /// Evidence source; present iff this is an observation
    pub source: Option<String>,
    /// Optional provenance URL
    pub source_url: Option<String>,
    /// Ordered ids of the memories this was derived from
    pub derived_from: Vec<String>,
    /// Free-form assumptions the claim rests on
    pub assumes: Vec<String>,
    /// Natural-language predicates that would falsify this claim
    pub invalidates_if: Vec<String>,
    /// Natural-language predicates that would confirm this claim
    pub confirms_if: Vec<String>,
    /// Condition deciding the outcome at resolution time
    pub outcome_condition: Option<String>,
    /// Deadline for time-bound beliefs
    pub resolves_by: Option<DateTime<Utc>>,

    /// Initial confidence in [0, 1]
    pub starting_confidence: f64,
    /// Count of judged confirmations
    pub confirmations: u32,
    /// Count of times any condition was judged against evidence
    pub times_tested: u32,
    /// Monotone violation counter; `violations` is authoritative
    pub contradictions: u32,
    /// Incoming derived_from edge count
    pub centrality: u32,
    /// Graph-propagated confidence; always None for observations
    pub propagated_confidence: Option<f64>,

    /// Lifecycle state
    pub state: MemoryState,
    /// Resolution outcome; present iff state is resolved
    pub outcome: Option<Outcome>,
    /// Terminal retraction flag
    pub retracted: bool,
    /// Recorded violations, authoritative over `contradictions`
    pub violations: Vec<ViolationRecord>,

    /// Exposure check progress
    pub exposure_check_status: ExposureStatus,
    /// When the exposure check finished
    pub exposure_check_completed_at: Option<DateTime<Utc>>,
    /// Positive cascade effects applied
    pub cascade_boosts: u32,
    /// Negative cascade effects applied
    pub cascade_damages: u32,
    /// Last cascade touch
    pub last_cascade_at: Option<DateTime<Utc>>,
    /// Predictive-error score at ingest
    pub surprise: Option<f64>,
    /// Categorisation tags
    pub tags: Vec<String>,

    /// When the row was created
    pub created_at: DateTime<Utc>,
    /// When the row was last written
    pub updated_at: DateTime<Utc>,
}

impl Default for MemoryRecord {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            content: String::new(),
            source: None,
            source_url: None,
            derived_from: vec![],
            assumes: vec![],
            invalidates_if: vec![],
            confirms_if: vec![],
            outcome_condition: None,
            resolves_by: None,
            starting_confidence: 0.5,
            confirmations: 0,
            times_tested: 0,
            contradictions: 0,
            centrality: 0,
            propagated_confidence: None,
            state: MemoryState::Active,
            outcome: None,
            retracted: false,
            violations: vec![],
            exposure_check_status: ExposureStatus::Pending,
            exposure_check_completed_at: None,
            cascade_boosts: 0,
            cascade_damages: 0,
            last_cascade_at: None,
            surprise: None,
            tags: vec![],
            created_at: now,
            updated_at: now,
        }
    }
}

impl MemoryRecord {
    /// Infer the semantic kind from field presence
    pub fn kind(&self) -> MemoryKind {
        if self.source.is_some() {
            MemoryKind::Observation
        } else if self.resolves_by.is_some() {
            MemoryKind::Prediction
        } else {
            MemoryKind::Thought
        }
    }

    /// True for memories sourced from reality
    pub fn is_observation(&self) -> bool {
        self.kind() == MemoryKind::Observation
    }

    /// True for memories carrying a deadline
    pub fn is_time_bound(&self) -> bool {
        self.resolves_by.is_some()
    }

    /// Confirmations over tests, in [0, 1]
    pub fn survival_rate(&self) -> f64 {
        f64::from(self.confirmations) / f64::from(self.times_tested.max(1))
    }

    /// Violated at least once and surviving less than half its tests
    pub fn is_overwhelmingly_violated(&self) -> bool {
        !self.violations.is_empty() && self.survival_rate() < 0.5
    }

    /// True when this memory may still generate events and receive updates
    pub fn is_live(&self) -> bool {
        !self.retracted
            && matches!(self.state, MemoryState::Draft | MemoryState::Active)
    }

    /// Resolved with outcome incorrect
    pub fn is_resolved_incorrect(&self) -> bool {
        self.state == MemoryState::Resolved && self.outcome == Some(Outcome::Incorrect)
    }
}

// ============================================================================
// REQUEST TYPE
// ============================================================================

/// Input for ingesting a new memory
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct MemoryRequest {
    /// The claim text (required, at most 10 000 chars)
    pub content: String,
    /// Evidence source; makes this an observation
    pub source: Option<String>,
    /// Optional provenance URL
    pub source_url: Option<String>,
    /// Ids of the memories this is derived from
    pub derived_from: Vec<String>,
    /// Free-form assumptions
    pub assumes: Vec<String>,
    /// Falsification predicates
    pub invalidates_if: Vec<String>,
    /// Confirmation predicates
    pub confirms_if: Vec<String>,
    /// Resolution condition; required when resolves_by is set
    pub outcome_condition: Option<String>,
    /// Deadline; makes this a prediction
    pub resolves_by: Option<DateTime<Utc>>,
    /// Categorisation tags
    pub tags: Vec<String>,
    /// Caller-chosen id for idempotent retries
    pub id: Option<String>,
}
