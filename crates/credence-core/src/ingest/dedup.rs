//! Two-phase duplicate detection
//!
//! Phase one is pure vector similarity: at or above the hard threshold the
//! submission is rejected outright. In the band below it, the judge gets
//! the final word, and only a confident duplicate verdict rejects.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::oracle::{JudgeKind, OracleGateway};
use crate::storage::{SqliteStore, VectorIndex};

/// Candidates pulled from the content index per check
const DEDUP_CANDIDATES: usize = 5;

/// An established duplicate of the submission
#[derive(Debug, Clone)]
pub struct DuplicateHit {
    /// Id of the existing memory
    pub id: String,
    /// Its content, for the caller's diagnostics
    pub content: String,
    /// Cosine similarity between the two contents
    pub similarity: f32,
}

/// Look for an existing memory duplicating `content`
pub async fn find_duplicate(
    store: &SqliteStore,
    content_index: &dyn VectorIndex,
    oracle: &OracleGateway,
    config: &EngineConfig,
    content: &str,
    embedding: &[f32],
) -> Result<Option<DuplicateHit>> {
    let hits = content_index.query(
        embedding,
        DEDUP_CANDIDATES,
        None,
        config.dedup_lower_threshold,
    )?;

    for hit in hits {
        let Some(existing) = store.get_memory(&hit.metadata.memory_id).await? else {
            // Vector without a row: eventually consistent index, skip
            continue;
        };
        if existing.retracted {
            continue;
        }

        if hit.score >= config.dedup_threshold {
            tracing::debug!(
                duplicate_id = %existing.id,
                similarity = hit.score,
                "hard duplicate above cosine threshold"
            );
            return Ok(Some(DuplicateHit {
                id: existing.id,
                content: existing.content,
                similarity: hit.score,
            }));
        }

        // Band between the thresholds: the judge decides
        match oracle
            .judge(JudgeKind::Duplicate, content, "", &existing.content)
            .await
        {
            Ok(verdict)
                if verdict.matches && verdict.confidence >= config.dedup_confidence_threshold =>
            {
                tracing::debug!(
                    duplicate_id = %existing.id,
                    similarity = hit.score,
                    confidence = verdict.confidence,
                    "judge confirmed duplicate"
                );
                return Ok(Some(DuplicateHit {
                    id: existing.id,
                    content: existing.content,
                    similarity: hit.score,
                }));
            }
            Ok(_) => {}
            Err(err) => {
                // Non-response defaults to non-duplicate
                tracing::warn!("duplicate judge unavailable, accepting submission: {}", err);
            }
        }
    }
    Ok(None)
}
