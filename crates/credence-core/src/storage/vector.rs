//! Vector index interface and the in-process default
//!
//! Three separate indexes back the engine: content vectors keyed by memory
//! id, and the two condition indexes keyed by `{memory_id}:inv:{k}` /
//! `{memory_id}:conf:{k}` so condition records can be deleted by id without
//! an index lookup. The driver behind the interface is external; the
//! bundled [`MemoryVectorIndex`] does an exact cosine scan and is what the
//! default engine and every test run against.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::memory::MemoryKind;

/// Embedding dimensionality used across all three indexes
pub const EMBEDDING_DIMENSIONS: usize = 768;

// ============================================================================
// RECORD IDS
// ============================================================================

/// Id of the invalidates-condition record `k` of a memory
pub fn invalidates_vector_id(memory_id: &str, k: usize) -> String {
    format!("{}:inv:{}", memory_id, k)
}

/// Id of the confirms-condition record `k` of a memory
pub fn confirms_vector_id(memory_id: &str, k: usize) -> String {
    format!("{}:conf:{}", memory_id, k)
}

// ============================================================================
// RECORDS AND QUERIES
// ============================================================================

/// Metadata stored alongside each vector
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VectorMetadata {
    /// Owning memory id (equals the record id in the content index)
    pub memory_id: String,
    /// Kind flag for content records
    pub kind: Option<MemoryKind>,
    /// Whether the owning memory carries a deadline
    pub time_bound: bool,
    /// Condition position for condition records
    pub k: Option<usize>,
    /// Condition text for condition records
    pub condition_text: Option<String>,
}

/// One vector record
#[derive(Debug, Clone)]
pub struct VectorRecord {
    /// Record id (memory id, or a condition id)
    pub id: String,
    /// 768-dim f32 vector
    pub vector: Vec<f32>,
    /// Metadata for filtering and judge context
    pub metadata: VectorMetadata,
}

/// Metadata filter applied during queries
#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    /// Only records whose owning memory has this kind
    pub kind: Option<MemoryKind>,
    /// Only records with this time_bound flag
    pub time_bound: Option<bool>,
    /// Owning memory ids to skip
    pub exclude_memory_ids: Vec<String>,
}

impl VectorFilter {
    /// Filter to observation content records
    pub fn observations() -> Self {
        Self {
            kind: Some(MemoryKind::Observation),
            ..Default::default()
        }
    }

    /// True when `metadata` passes this filter
    pub fn matches(&self, metadata: &VectorMetadata) -> bool {
        if let Some(kind) = self.kind {
            if metadata.kind != Some(kind) {
                return false;
            }
        }
        if let Some(time_bound) = self.time_bound {
            if metadata.time_bound != time_bound {
                return false;
            }
        }
        !self
            .exclude_memory_ids
            .iter()
            .any(|id| id == &metadata.memory_id)
    }
}

/// One query hit
#[derive(Debug, Clone)]
pub struct VectorMatch {
    /// Record id
    pub id: String,
    /// Cosine similarity, guaranteed >= the query's min_score
    pub score: f32,
    /// The record's metadata
    pub metadata: VectorMetadata,
}

// ============================================================================
// INDEX INTERFACE
// ============================================================================

/// Interface the engine consumes from a vector index driver
///
/// Drivers are eventually consistent with respect to row writes; consumers
/// treat a missing condition record as "not yet indexed" and retry once.
pub trait VectorIndex: Send + Sync {
    /// Insert or replace a batch of records
    fn upsert(&self, batch: Vec<VectorRecord>) -> Result<()>;

    /// Top-k records by cosine similarity, honoring `min_score` strictly
    fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&VectorFilter>,
        min_score: f32,
    ) -> Result<Vec<VectorMatch>>;

    /// Delete records by id; unknown ids are ignored
    fn delete_by_ids(&self, ids: &[String]) -> Result<()>;

    /// Number of records currently indexed
    fn len(&self) -> usize;

    /// True when the index holds no records
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// INDEX SET
// ============================================================================

/// The three indexes the engine runs against
#[derive(Clone)]
pub struct IndexSet {
    /// Content vectors, id = memory id
    pub content: std::sync::Arc<dyn VectorIndex>,
    /// Invalidates-condition vectors, id = `{memory_id}:inv:{k}`
    pub invalidates: std::sync::Arc<dyn VectorIndex>,
    /// Confirms-condition vectors, id = `{memory_id}:conf:{k}`
    pub confirms: std::sync::Arc<dyn VectorIndex>,
}

impl IndexSet {
    /// Three fresh in-process indexes
    pub fn in_memory() -> Self {
        Self {
            content: std::sync::Arc::new(MemoryVectorIndex::new()),
            invalidates: std::sync::Arc::new(MemoryVectorIndex::new()),
            confirms: std::sync::Arc::new(MemoryVectorIndex::new()),
        }
    }

    /// Delete every condition record of a memory, by formatted id
    pub fn delete_condition_vectors(
        &self,
        memory_id: &str,
        invalidates_count: usize,
        confirms_count: usize,
    ) -> Result<()> {
        let inv_ids: Vec<String> = (0..invalidates_count)
            .map(|k| invalidates_vector_id(memory_id, k))
            .collect();
        let conf_ids: Vec<String> = (0..confirms_count)
            .map(|k| confirms_vector_id(memory_id, k))
            .collect();
        self.invalidates.delete_by_ids(&inv_ids)?;
        self.confirms.delete_by_ids(&conf_ids)?;
        Ok(())
    }
}

// ============================================================================
// SIMILARITY
// ============================================================================

/// Cosine similarity between two vectors of equal length
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

// ============================================================================
// IN-PROCESS INDEX
// ============================================================================

/// Exact-cosine in-process vector index
///
/// The default driver: a guarded map scanned linearly per query. Fine for
/// the graph sizes the engine targets; swap a remote driver in through the
/// [`VectorIndex`] trait when the corpus outgrows it.
pub struct MemoryVectorIndex {
    records: RwLock<HashMap<String, VectorRecord>>,
}

impl MemoryVectorIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorIndex for MemoryVectorIndex {
    fn upsert(&self, batch: Vec<VectorRecord>) -> Result<()> {
        for record in &batch {
            if record.vector.len() != EMBEDDING_DIMENSIONS {
                return Err(CoreError::Validation {
                    rule: format!(
                        "vector {} has {} dimensions, expected {}",
                        record.id,
                        record.vector.len(),
                        EMBEDDING_DIMENSIONS
                    ),
                });
            }
        }
        let mut records = self
            .records
            .write()
            .map_err(|_| CoreError::Init("vector index lock poisoned".to_string()))?;
        for record in batch {
            records.insert(record.id.clone(), record);
        }
        Ok(())
    }

    fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&VectorFilter>,
        min_score: f32,
    ) -> Result<Vec<VectorMatch>> {
        let records = self
            .records
            .read()
            .map_err(|_| CoreError::Init("vector index lock poisoned".to_string()))?;

        let mut hits: Vec<VectorMatch> = records
            .values()
            .filter(|r| filter.is_none_or(|f| f.matches(&r.metadata)))
            .map(|r| VectorMatch {
                id: r.id.clone(),
                score: cosine_similarity(vector, &r.vector),
                metadata: r.metadata.clone(),
            })
            .filter(|m| m.score >= min_score)
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    fn delete_by_ids(&self, ids: &[String]) -> Result<()> {
        let mut records = self
            .records
            .write()
            .map_err(|_| CoreError::Init("vector index lock poisoned".to_string()))?;
        for id in ids {
            records.remove(id);
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }
}
