//! Surprise scoring
//!
//! A predictive-error score for each new active memory: how far it sits
//! from its nearest confident neighbours, decayed by how structurally
//! integrated the memory already is. Stored on the row as a cache; queries
//! that rank by surprise revalidate by recomputing.

use crate::error::Result;
use crate::memory::MemoryRecord;
use crate::propagation::effective_confidence;
use crate::storage::{SqliteStore, VectorFilter, VectorIndex};

/// Neighbours fetched from the content index (self excluded)
const NEIGHBOUR_FETCH: usize = 6;

/// Neighbours kept for the weighted mean
const NEIGHBOUR_KEEP: usize = 5;

/// Structural-integration decay constant
const INTEGRATION_K: f64 = 0.1;

/// Confidence floor applied to neighbour weights
const WEIGHT_FLOOR: f64 = 0.1;

/// Cache drift that triggers a write-back on revalidation
pub const REVALIDATE_DRIFT: f64 = 0.05;

/// Compute the surprise score for a memory
///
/// `embedding` is the memory's content vector; `depth` inputs are taken
/// from the record itself. Returns a value in [0, 1]; an empty
/// neighbourhood is maximally surprising.
pub async fn compute_surprise(
    store: &SqliteStore,
    content_index: &dyn VectorIndex,
    max_times_tested: u32,
    record: &MemoryRecord,
    embedding: &[f32],
) -> Result<f64> {
    let filter = VectorFilter {
        exclude_memory_ids: vec![record.id.clone()],
        ..Default::default()
    };
    let mut hits = content_index.query(embedding, NEIGHBOUR_FETCH, Some(&filter), 0.0)?;
    hits.truncate(NEIGHBOUR_KEEP);

    let depth = f64::from(record.centrality) + f64::from(record.times_tested);
    let integration = 1.0 / (1.0 + INTEGRATION_K * depth);

    if hits.is_empty() {
        return Ok(integration.clamp(0.0, 1.0));
    }

    let neighbour_ids: Vec<String> = hits.iter().map(|h| h.metadata.memory_id.clone()).collect();
    let neighbours = store.list_by_ids(&neighbour_ids).await?;
    let confidence_of: std::collections::HashMap<&str, f64> = neighbours
        .iter()
        .map(|n| (n.id.as_str(), effective_confidence(n, max_times_tested)))
        .collect();

    let mut weighted_sim = 0.0f64;
    let mut weight_total = 0.0f64;
    for hit in &hits {
        let confidence = confidence_of
            .get(hit.metadata.memory_id.as_str())
            .copied()
            .unwrap_or(0.0);
        let weight = confidence.max(WEIGHT_FLOOR);
        weighted_sim += weight * f64::from(hit.score);
        weight_total += weight;
    }
    let mean_similarity = if weight_total > 0.0 {
        weighted_sim / weight_total
    } else {
        0.0
    };

    Ok(((1.0 - mean_similarity) * integration).clamp(0.0, 1.0))
}
