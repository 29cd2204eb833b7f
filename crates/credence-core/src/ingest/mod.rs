//! Ingestion pipeline
//!
//! Validates a submission, rejects near-duplicates, persists the row with
//! its derivation edges and vectors, and schedules the exposure check.
//! Completeness warnings divert the memory onto the draft path instead of
//! failing it.

mod dedup;

pub use dedup::{find_duplicate, DuplicateHit};

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{ConflictKind, CoreError, Result};
use crate::memory::{
    EventType, ExposureStatus, MemoryEvent, MemoryKind, MemoryRecord, MemoryRequest, MemoryState,
    SourceKind,
};
use crate::oracle::OracleGateway;
use crate::propagation::TestedGauge;
use crate::storage::{
    confirms_vector_id, invalidates_vector_id, IndexSet, SqliteStore, VectorMetadata, VectorRecord,
};
use crate::surprise::compute_surprise;

/// Longest accepted content
pub const MAX_CONTENT_CHARS: usize = 10_000;

/// Kind-default starting confidences
const OBSERVATION_DEFAULT_CONFIDENCE: f64 = 0.9;
const THOUGHT_DEFAULT_CONFIDENCE: f64 = 0.5;
const PREDICTION_DEFAULT_CONFIDENCE: f64 = 0.4;

// ============================================================================
// OUTCOME
// ============================================================================

/// Whether the exposure check was scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposureQueued {
    /// An exposure-check job is in the queue
    Queued,
    /// The memory has no conditions to check
    Skipped,
}

/// Result of one ingestion
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    /// Id of the created (or already existing) memory
    pub id: String,
    /// `active`, or `draft` when completeness warnings fired
    pub status: MemoryState,
    /// True for predictions
    pub time_bound: bool,
    /// Exposure-check scheduling
    pub exposure_check: ExposureQueued,
    /// Advisory completeness warnings (draft path)
    pub warnings: Vec<String>,
    /// Predictive-error score, when computed
    pub surprise: Option<f64>,
}

// ============================================================================
// PIPELINE
// ============================================================================

/// The ingestion pipeline
pub struct IngestPipeline {
    store: Arc<SqliteStore>,
    indexes: IndexSet,
    oracle: Arc<OracleGateway>,
    config: EngineConfig,
    gauge: Arc<TestedGauge>,
}

impl IngestPipeline {
    /// Build a pipeline over shared engine state
    pub fn new(
        store: Arc<SqliteStore>,
        indexes: IndexSet,
        oracle: Arc<OracleGateway>,
        config: EngineConfig,
        gauge: Arc<TestedGauge>,
    ) -> Self {
        Self {
            store,
            indexes,
            oracle,
            config,
            gauge,
        }
    }

    /// Ingest one memory
    pub async fn ingest(
        &self,
        request: MemoryRequest,
        session_id: &str,
        request_id: &str,
    ) -> Result<IngestOutcome> {
        // Idempotent retry with a caller-chosen id
        if let Some(id) = &request.id {
            if let Some(existing) = self.store.get_memory(id).await? {
                tracing::info!(request_id, memory_id = %id, "retry of an already stored memory");
                return Ok(stored_outcome(&existing));
            }
        }

        let request = validate(request, &self.store).await?;
        let kind = kind_of_request(&request);

        // Duplicate rejection
        let embedding = self.oracle.embed(&request.content).await?;
        if let Some(duplicate) = find_duplicate(
            &self.store,
            self.indexes.content.as_ref(),
            &self.oracle,
            &self.config,
            &request.content,
            &embedding,
        )
        .await?
        {
            return Err(CoreError::Conflict(ConflictKind::Duplicate {
                duplicate_id: duplicate.id,
                duplicate_content: duplicate.content,
                similarity: duplicate.similarity,
            }));
        }

        // Completeness warnings and starting confidence, side by side
        let (warnings, starting_confidence) = tokio::join!(
            self.oracle.completeness(
                &request.content,
                kind.as_str(),
                !request.invalidates_if.is_empty(),
                !request.confirms_if.is_empty(),
            ),
            self.starting_confidence(kind, request.source.as_deref()),
        );
        let starting_confidence = starting_confidence?;

        let now = Utc::now();
        // Observations are always checked (against everyone else's
        // conditions); beliefs only when they carry conditions themselves
        let needs_exposure = kind == MemoryKind::Observation
            || !request.invalidates_if.is_empty()
            || !request.confirms_if.is_empty();
        let mut record = MemoryRecord {
            id: request.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string()),
            content: request.content,
            source: request.source,
            source_url: request.source_url,
            derived_from: request.derived_from,
            assumes: request.assumes,
            invalidates_if: request.invalidates_if,
            confirms_if: request.confirms_if,
            outcome_condition: request.outcome_condition,
            resolves_by: request.resolves_by,
            starting_confidence,
            state: if warnings.is_empty() {
                MemoryState::Active
            } else {
                MemoryState::Draft
            },
            exposure_check_status: if needs_exposure {
                ExposureStatus::Pending
            } else {
                ExposureStatus::Skipped
            },
            tags: request.tags,
            created_at: now,
            updated_at: now,
            ..Default::default()
        };

        if record.state == MemoryState::Active {
            let max_tested = self.gauge.get(&self.store).await?;
            record.surprise = Some(
                compute_surprise(
                    &self.store,
                    self.indexes.content.as_ref(),
                    max_tested,
                    &record,
                    &embedding,
                )
                .await?,
            );
        }

        // Vectors first, row second; a failure anywhere compensates by
        // deleting what was indexed so the memory appears all-or-nothing.
        let persisted = async {
            self.upsert_vectors(&record, &embedding).await?;
            self.store.create_memory(&record).await
        }
        .await;
        if let Err(err) = persisted {
            tracing::warn!(
                request_id,
                memory_id = %record.id,
                "persist failed, compensating vector deletes: {}",
                err
            );
            let _ = self
                .indexes
                .content
                .delete_by_ids(std::slice::from_ref(&record.id));
            let _ = self.indexes.delete_condition_vectors(
                &record.id,
                record.invalidates_if.len(),
                record.confirms_if.len(),
            );
            return Err(err);
        }

        let exposure_check = if needs_exposure {
            self.store
                .append_event(
                    &exposure_event(session_id, &record.id, &embedding),
                )
                .await?;
            ExposureQueued::Queued
        } else {
            ExposureQueued::Skipped
        };

        tracing::info!(
            request_id,
            memory_id = %record.id,
            kind = kind.as_str(),
            state = record.state.as_str(),
            "memory ingested"
        );
        Ok(IngestOutcome {
            id: record.id,
            status: record.state,
            time_bound: record.resolves_by.is_some(),
            exposure_check,
            warnings,
            surprise: record.surprise,
        })
    }

    /// Promote a draft to active, keeping its queued exposure check
    pub async fn override_draft(&self, id: &str) -> Result<MemoryRecord> {
        let record = self
            .store
            .get_memory(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        if record.state != MemoryState::Draft {
            return Err(CoreError::validation(format!(
                "memory {} is {}, not draft",
                id, record.state
            )));
        }
        self.store
            .modify_memory(id, |m| m.state = MemoryState::Active)
            .await
    }

    async fn starting_confidence(&self, kind: MemoryKind, source: Option<&str>) -> Result<f64> {
        if let Some(source) = source {
            if let Some(stat) = self.store.source_confidence(source).await? {
                return Ok(stat.clamp(0.0, 1.0));
            }
        }
        Ok(match kind {
            MemoryKind::Observation => OBSERVATION_DEFAULT_CONFIDENCE,
            MemoryKind::Thought => THOUGHT_DEFAULT_CONFIDENCE,
            MemoryKind::Prediction => PREDICTION_DEFAULT_CONFIDENCE,
        })
    }

    /// Upsert the content vector and one record per condition
    async fn upsert_vectors(&self, record: &MemoryRecord, embedding: &[f32]) -> Result<()> {
        let time_bound = record.is_time_bound();
        self.indexes.content.upsert(vec![VectorRecord {
            id: record.id.clone(),
            vector: embedding.to_vec(),
            metadata: VectorMetadata {
                memory_id: record.id.clone(),
                kind: Some(record.kind()),
                time_bound,
                ..Default::default()
            },
        }])?;

        let mut inv_batch = vec![];
        for (k, condition) in record.invalidates_if.iter().enumerate() {
            inv_batch.push(VectorRecord {
                id: invalidates_vector_id(&record.id, k),
                vector: self.oracle.embed(condition).await?,
                metadata: VectorMetadata {
                    memory_id: record.id.clone(),
                    k: Some(k),
                    condition_text: Some(condition.clone()),
                    time_bound,
                    kind: None,
                },
            });
        }
        if !inv_batch.is_empty() {
            self.indexes.invalidates.upsert(inv_batch)?;
        }

        let mut conf_batch = vec![];
        for (k, condition) in record.confirms_if.iter().enumerate() {
            conf_batch.push(VectorRecord {
                id: confirms_vector_id(&record.id, k),
                vector: self.oracle.embed(condition).await?,
                metadata: VectorMetadata {
                    memory_id: record.id.clone(),
                    k: Some(k),
                    condition_text: Some(condition.clone()),
                    time_bound,
                    kind: None,
                },
            });
        }
        if !conf_batch.is_empty() {
            self.indexes.confirms.upsert(conf_batch)?;
        }
        Ok(())
    }
}

/// Reconstruct the outcome of an already stored memory for retried requests
fn stored_outcome(record: &MemoryRecord) -> IngestOutcome {
    IngestOutcome {
        id: record.id.clone(),
        status: record.state,
        time_bound: record.is_time_bound(),
        exposure_check: if record.exposure_check_status == ExposureStatus::Skipped {
            ExposureQueued::Skipped
        } else {
            ExposureQueued::Queued
        },
        warnings: vec![],
        surprise: record.surprise,
    }
}

/// The exposure-check job for a new memory, idempotent by memory id
pub fn exposure_event(session_id: &str, memory_id: &str, embedding: &[f32]) -> MemoryEvent {
    let mut event = MemoryEvent::new(session_id, EventType::ExposureCheck, memory_id);
    event.id = format!("exposure:{}", memory_id);
    event.context = serde_json::json!({ "embedding": embedding });
    event
}

/// Infer the kind a request will produce
fn kind_of_request(request: &MemoryRequest) -> MemoryKind {
    if request.source.is_some() {
        MemoryKind::Observation
    } else if request.resolves_by.is_some() {
        MemoryKind::Prediction
    } else {
        MemoryKind::Thought
    }
}

/// Apply the ordered pre-conditions, returning the normalised request
async fn validate(mut request: MemoryRequest, store: &SqliteStore) -> Result<MemoryRequest> {
    // 1. Content present and bounded
    let content = request.content.trim();
    if content.is_empty() {
        return Err(CoreError::validation("content must be non-empty"));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(CoreError::validation(format!(
            "content exceeds {} characters",
            MAX_CONTENT_CHARS
        )));
    }
    request.content = content.to_string();

    // 2. Source normalisation
    if let Some(source) = request.source.take() {
        let normalised = source.trim().to_lowercase();
        if normalised.is_empty() {
            return Err(CoreError::validation("source must be non-empty when present"));
        }
        if SourceKind::parse_name(&normalised).is_none() {
            return Err(CoreError::validation(format!(
                "unknown source '{}' (expected market, news, earnings, email, human, or tool)",
                normalised
            )));
        }
        request.source = Some(normalised);
    }

    // 3. Evidence or derivation
    if request.source.is_none() && request.derived_from.is_empty() {
        return Err(CoreError::validation(
            "at least one of source or derived_from is required",
        ));
    }

    // 4. Derivation references must exist and be live
    for parent in &request.derived_from {
        match store.get_memory(parent).await? {
            None => return Err(CoreError::NotFound(parent.clone())),
            Some(p) if p.retracted => {
                return Err(CoreError::validation(format!(
                    "derived_from reference {} is retracted",
                    parent
                )))
            }
            Some(_) => {}
        }
    }

    // 5. Time-bound beliefs need a future deadline and an outcome condition
    if let Some(resolves_by) = request.resolves_by {
        if request
            .outcome_condition
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
            .is_empty()
        {
            return Err(CoreError::validation(
                "resolves_by requires an outcome_condition",
            ));
        }
        if resolves_by <= Utc::now() {
            return Err(CoreError::validation("resolves_by must be in the future"));
        }
    }

    Ok(request)
}
