//! Error taxonomy for the belief engine
//!
//! Kinds, not call sites: every fallible operation in the crate maps its
//! failures onto one of these variants so the request layer can translate
//! them uniformly (validation/conflict to 4xx semantics, transient to 503).

use serde::{Deserialize, Serialize};

/// Conflict diagnostics returned with [`CoreError::Conflict`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ConflictKind {
    /// Ingest hit a duplicate of an existing memory
    #[serde(rename_all = "camelCase")]
    Duplicate {
        /// Id of the memory already holding this content
        duplicate_id: String,
        /// Content of the duplicate, for the caller's diagnostics
        duplicate_content: String,
        /// Cosine similarity that triggered the rejection
        similarity: f32,
    },
    /// Resolve called on an already-resolved memory without `force`
    #[serde(rename_all = "camelCase")]
    AlreadyResolved {
        /// Current state of the target
        state: String,
        /// Outcome already recorded, if any
        outcome: Option<String>,
    },
}

/// Core error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A request failed one of the ingestion pre-conditions
    #[error("validation failed: {rule}")]
    Validation {
        /// The violated rule, phrased for the caller
        rule: String,
    },

    /// Referenced memory, edge, or event does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate at ingest or already-resolved at resolve
    #[error("conflict: {0:?}")]
    Conflict(ConflictKind),

    /// Storage retry budget exhausted on a transient driver error
    #[error("transient storage failure: {0}")]
    StorageTransient(String),

    /// Permanent storage driver error
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Embed/judge endpoint unreachable after retries
    #[error("oracle unavailable: {0}")]
    OracleUnavailable(String),

    /// Invariant violated on read (dangling reference, malformed row)
    #[error("inconsistency: {0}")]
    Inconsistency(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Initialization error
    #[error("initialization error: {0}")]
    Init(String),
}

impl CoreError {
    /// Shorthand for a validation failure
    pub fn validation(rule: impl Into<String>) -> Self {
        CoreError::Validation { rule: rule.into() }
    }

    /// True if retrying the enclosing workflow step may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::StorageTransient(_) | CoreError::OracleUnavailable(_)
        )
    }
}

/// Core result type
pub type Result<T> = std::result::Result<T, CoreError>;
