//! Typed, strength-weighted edges between memories
//!
//! Uniqueness is the (source, target, type) triple; upserts merge strength
//! and the storage adapter clamps it into [0, 1].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// EDGE TYPES
// ============================================================================

/// Relation carried by an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    /// Target was derived from source (support)
    DerivedFrom,
    /// Target was confirmed by source (support)
    ConfirmedBy,
    /// Target was violated by source (contradiction)
    ViolatedBy,
    /// Source replaces target
    Supersedes,
}

impl EdgeType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::DerivedFrom => "derived_from",
            EdgeType::ConfirmedBy => "confirmed_by",
            EdgeType::ViolatedBy => "violated_by",
            EdgeType::Supersedes => "supersedes",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "derived_from" => Some(EdgeType::DerivedFrom),
            "confirmed_by" => Some(EdgeType::ConfirmedBy),
            "violated_by" => Some(EdgeType::ViolatedBy),
            "supersedes" => Some(EdgeType::Supersedes),
            _ => None,
        }
    }

    /// Support edges carry positive sign in propagation
    pub fn is_support(&self) -> bool {
        matches!(self, EdgeType::DerivedFrom | EdgeType::ConfirmedBy)
    }

    /// Contradiction edges carry negative sign in propagation
    pub fn is_contradiction(&self) -> bool {
        matches!(self, EdgeType::ViolatedBy)
    }

    /// The edge types traversed as support by cascades and zones
    pub const SUPPORT: [EdgeType; 2] = [EdgeType::DerivedFrom, EdgeType::ConfirmedBy];
}

impl std::fmt::Display for EdgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// EDGE
// ============================================================================

/// A directed edge in the belief graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    /// Unique edge id
    pub id: String,
    /// Source memory id
    pub source_id: String,
    /// Target memory id
    pub target_id: String,
    /// Relation type
    pub edge_type: EdgeType,
    /// Strength in [0, 1]
    pub strength: f32,
    /// When the edge was created
    pub created_at: DateTime<Utc>,
    /// When the edge strength last changed
    pub updated_at: DateTime<Utc>,
}

impl Edge {
    /// Create a new edge with a fresh id and clamped strength
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        edge_type: EdgeType,
        strength: f32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            edge_type,
            strength: strength.clamp(0.0, 1.0),
            created_at: now,
            updated_at: now,
        }
    }

    /// The endpoint opposite to `id`, if `id` is an endpoint at all
    pub fn other_endpoint<'a>(&'a self, id: &str) -> Option<&'a str> {
        if self.source_id == id {
            Some(&self.target_id)
        } else if self.target_id == id {
            Some(&self.source_id)
        } else {
            None
        }
    }
}
