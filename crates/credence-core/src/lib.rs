//! # Credence Core
//!
//! Belief-graph memory engine: ingests claims, links them by derivation
//! and contradiction, and keeps a coherent, falsifiable knowledge state
//! under streaming evidence.
//!
//! Every memory is one record shape; its *kind* is a predicate over
//! fields:
//!
//! - **Observation**: `source` set, treated as external evidence
//! - **Thought**: derived belief without a deadline
//! - **Prediction**: derived belief with a `resolves_by` deadline
//!
//! Claims carry natural-language falsification and confirmation
//! conditions. When new evidence arrives, the engine finds standing
//! conditions it semantically matches, asks an LLM judge to rule on each
//! match, and propagates the consequences: violation records, state
//! transitions, edge updates, and a damped confidence shock through the
//! neighbourhood. A periodic whole-graph pass keeps global confidence at
//! a bounded-error fixed point, guarded by a spectral-radius estimate.
//!
//! ## Subsystems
//!
//! - [`ingest`]: validation, two-phase dedup, transactional persist,
//!   exposure scheduling
//! - [`exposure`]: bi-directional condition matching and state
//!   transitions under a bounded judge pool
//! - [`propagation`]: local shock cascades and the whole-graph
//!   fixed-point relaxation
//! - [`zone`]: locally consistent cluster extraction with Harary
//!   2-coloring and quality scoring
//! - [`surprise`]: predictive-error scoring against nearest neighbours
//! - [`resolution`]: explicit outcomes, supersession, and outcome-driven
//!   cascades
//! - [`storage`]: SQLite row store plus the three vector indexes
//! - [`oracle`]: the embedding/judge gateway over pluggable providers
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use credence_core::{BeliefEngine, EngineConfig, IndexSet, MemoryRequest, SqliteStore};
//! use std::sync::Arc;
//!
//! let store = Arc::new(SqliteStore::new(None)?);
//! let engine = BeliefEngine::new(
//!     store,
//!     IndexSet::in_memory(),
//!     embedder,          // your EmbeddingProvider
//!     chat,              // your ChatProvider
//!     EngineConfig::default(),
//! );
//!
//! let outcome = engine
//!     .ingest(
//!         MemoryRequest {
//!             content: "AAPL closed at 170".to_string(),
//!             source: Some("market".to_string()),
//!             ..Default::default()
//!         },
//!         "session-1",
//!         "req-1",
//!     )
//!     .await?;
//! ```
//!
//! ## Feature flags
//!
//! - `remote-oracle` (default): OpenAI-compatible HTTP providers for the
//!   embedding and judge endpoints

#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod config;
pub mod error;
pub mod memory;
pub mod storage;

pub mod oracle;

pub mod exposure;
pub mod ingest;
pub mod propagation;
pub mod resolution;
pub mod surprise;
pub mod zone;

pub mod engine;
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Configuration and errors
pub use config::EngineConfig;
pub use error::{ConflictKind, CoreError, Result};

// Memory types
pub use memory::{
    DamageLevel, Edge, EdgeType, EventType, ExposureStatus, MemoryEvent, MemoryKind,
    MemoryRecord, MemoryRequest, MemoryState, Outcome, SourceKind, ViolationOrigin,
    ViolationRecord,
};

// Storage layer
pub use storage::{
    confirms_vector_id, cosine_similarity, invalidates_vector_id, IndexSet, MemoryVectorIndex,
    SqliteStore, VectorFilter, VectorIndex, VectorMatch, VectorMetadata, VectorRecord,
    EMBEDDING_DIMENSIONS, MAX_BIND_PARAMS,
};

// Oracle gateway
pub use oracle::{
    ChatProvider, EmbeddingProvider, JudgeKind, JudgeVerdict, OracleGateway,
};

#[cfg(feature = "remote-oracle")]
pub use oracle::{RemoteChatProvider, RemoteEmbeddingProvider, RemoteOracleConfig};

// Pipelines and services
pub use engine::{BeliefEngine, CascadeAction, CascadeApplied};
pub use exposure::{ExposureChecker, ExposureReport};
pub use ingest::{ExposureQueued, IngestOutcome, IngestPipeline};
pub use propagation::{
    effective_confidence, local_confidence, run_full_propagation, propagate_shock,
    PropagationReport, ShockKind, ShockResult, TestedGauge,
};
pub use resolution::{ResolutionService, ResolveOutcome};
pub use stats::{EngineStats, RobustnessTiers};
pub use surprise::compute_surprise;
pub use zone::{
    BoundaryExclusion, ZoneEdge, ZoneMember, ZoneParams, ZoneResult,
};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        BeliefEngine, CascadeAction, EngineConfig, IndexSet, IngestOutcome, MemoryRecord,
        MemoryRequest, MemoryState, Outcome, Result, SqliteStore, ZoneParams, ZoneResult,
    };

    pub use crate::{ChatProvider, EmbeddingProvider, OracleGateway};
}
