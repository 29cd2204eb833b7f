//! Exposure checker
//!
//! Matches a new memory against the standing belief graph, in both
//! directions: a new observation is tested against every indexed
//! falsification/confirmation condition, and a new belief's conditions are
//! tested against stored observations. Candidate search is vector
//! similarity; the judge gets the final word; state transitions and events
//! follow each confirmed match.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinSet;

use crate::config::EngineConfig;
use crate::error::{CoreError, Result};
use crate::memory::{
    DamageLevel, EdgeType, EventType, ExposureStatus, MemoryEvent, MemoryKind, MemoryRecord,
    MemoryState, ViolationOrigin, ViolationRecord,
};
use crate::oracle::{JudgeKind, JudgeVerdict, OracleGateway};
use crate::propagation::{propagate_shock, ShockKind, TestedGauge};
use crate::storage::{IndexSet, SqliteStore, VectorFilter};

/// Centrality at which a belief becomes core
const CORE_CENTRALITY: u32 = 3;

/// Descendant scan depth for the core predicate
const CORE_DESCENDANT_DEPTH: usize = 2;

// ============================================================================
// TYPES
// ============================================================================

/// One candidate match awaiting judgement
#[derive(Debug, Clone)]
struct Candidate {
    /// The observation side of the pair
    obs_id: String,
    obs_content: String,
    /// The belief under test
    target_id: String,
    target_content: String,
    /// The matched condition text
    condition: String,
    /// Vector similarity that surfaced the candidate
    similarity: f32,
    /// Whether the condition falsifies or confirms
    direction: JudgeKind,
}

/// Outcome of one exposure run
#[derive(Debug, Clone, Default)]
pub struct ExposureReport {
    /// Violations recorded
    pub violations: usize,
    /// Confirmations recorded
    pub confirmations: usize,
    /// Time-bound beliefs auto-confirmed
    pub auto_confirmed: usize,
    /// Cascade runs triggered
    pub cascades: usize,
}

// ============================================================================
// CHECKER
// ============================================================================

/// The bi-directional exposure checker
pub struct ExposureChecker {
    store: Arc<SqliteStore>,
    indexes: IndexSet,
    oracle: Arc<OracleGateway>,
    config: EngineConfig,
    gauge: Arc<TestedGauge>,
}

impl ExposureChecker {
    /// Build a checker over shared engine state
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

    /// Run the exposure check for one memory
    ///
    /// `content_embedding` is the vector produced at ingest when available;
    /// otherwise the content is re-embedded. A storage failure resets the
    /// memory to `pending` so the operator can re-drive it.
    pub async fn run(
        &self,
        session_id: &str,
        memory_id: &str,
        content_embedding: Option<Vec<f32>>,
    ) -> Result<ExposureReport> {
        let record = self
            .store
            .get_memory(memory_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(memory_id.to_string()))?;
        if record.retracted || !record.state.keeps_condition_vectors() {
            tracing::debug!(memory_id, "memory no longer eligible for exposure check");
            return Ok(ExposureReport::default());
        }

        self.store
            .modify_memory(memory_id, |m| {
                m.exposure_check_status = ExposureStatus::Processing
            })
            .await?;

        match self.check(session_id, &record, content_embedding).await {
            Ok(report) => {
                self.store
                    .modify_memory(memory_id, |m| {
                        m.exposure_check_status = ExposureStatus::Completed;
                        m.exposure_check_completed_at = Some(Utc::now());
                    })
                    .await?;
                Ok(report)
            }
            Err(err) => {
                tracing::warn!(memory_id, "exposure check failed, resetting to pending: {}", err);
                let _ = self
                    .store
                    .modify_memory(memory_id, |m| {
                        m.exposure_check_status = ExposureStatus::Pending
                    })
                    .await;
                Err(err)
            }
        }
    }

    async fn check(
        &self,
        session_id: &str,
        record: &MemoryRecord,
        content_embedding: Option<Vec<f32>>,
    ) -> Result<ExposureReport> {
        let candidates = match record.kind() {
            MemoryKind::Observation => {
                self.observation_candidates(record, content_embedding).await?
            }
            MemoryKind::Thought | MemoryKind::Prediction => {
                self.belief_candidates(record).await?
            }
        };
        if candidates.is_empty() {
            return Ok(ExposureReport::default());
        }

        // Judge pool: calls run concurrently under the gateway semaphore and
        // may finish out of order; results are re-merged in similarity order
        // before transitions apply.
        let mut join_set = JoinSet::new();
        for (idx, candidate) in candidates.iter().enumerate() {
            let oracle = self.oracle.clone();
            let candidate = candidate.clone();
            join_set.spawn(async move {
                let verdict = oracle
                    .judge(
                        candidate.direction,
                        &candidate.obs_content,
                        &candidate.condition,
                        &candidate.target_content,
                    )
                    .await;
                (idx, verdict)
            });
        }
        let mut verdicts: Vec<Option<JudgeVerdict>> = vec![None; candidates.len()];
        while let Some(joined) = join_set.join_next().await {
            let (idx, verdict) = joined
                .map_err(|e| CoreError::Init(format!("judge task panicked: {}", e)))?;
            verdicts[idx] = Some(match verdict {
                Ok(v) => v,
                Err(err) => {
                    // Oracle unreachable: partial result, safe non-match
                    tracing::warn!("judge unavailable, recording non-match: {}", err);
                    JudgeVerdict::non_match()
                }
            });
        }

        let mut order: Vec<usize> = (0..candidates.len()).collect();
        order.sort_by(|a, b| {
            candidates[*b]
                .similarity
                .partial_cmp(&candidates[*a].similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut report = ExposureReport::default();
        for idx in order {
            let candidate = &candidates[idx];
            let Some(verdict) = &verdicts[idx] else { continue };
            if !verdict.matches {
                continue;
            }
            match candidate.direction {
                JudgeKind::Invalidates if verdict.confidence >= self.config.violation_threshold => {
                    self.apply_violation(session_id, candidate, verdict, &mut report)
                        .await?;
                }
                JudgeKind::Confirms if verdict.confidence >= self.config.confirm_threshold => {
                    self.apply_confirmation(session_id, candidate, verdict, &mut report)
                        .await?;
                }
                _ => {}
            }
        }
        Ok(report)
    }

    /// New observation against the two condition indexes
    async fn observation_candidates(
        &self,
        record: &MemoryRecord,
        content_embedding: Option<Vec<f32>>,
    ) -> Result<Vec<Candidate>> {
        let embedding = match content_embedding {
            Some(v) => v,
            None => self.oracle.embed(&record.content).await?,
        };

        let mut raw = vec![];
        for (index, direction) in [
            (&self.indexes.invalidates, JudgeKind::Invalidates),
            (&self.indexes.confirms, JudgeKind::Confirms),
        ] {
            let hits = index.query(
                &embedding,
                self.config.max_candidates,
                None,
                self.config.min_similarity,
            )?;
            for hit in hits {
                let Some(condition) = hit.metadata.condition_text.clone() else {
                    continue;
                };
                if hit.metadata.memory_id == record.id {
                    continue;
                }
                raw.push((hit.metadata.memory_id, condition, hit.score, direction));
            }
        }

        let target_ids: Vec<String> = raw.iter().map(|(id, ..)| id.clone()).collect();
        let targets: std::collections::HashMap<String, MemoryRecord> = self
            .store
            .list_by_ids(&target_ids)
            .await?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        Ok(raw
            .into_iter()
            .filter_map(|(target_id, condition, similarity, direction)| {
                // A condition vector without a live row is stale index state
                let target = targets.get(&target_id)?;
                if target.retracted || !target.state.keeps_condition_vectors() {
                    return None;
                }
                Some(Candidate {
                    obs_id: record.id.clone(),
                    obs_content: record.content.clone(),
                    target_id,
                    target_content: target.content.clone(),
                    condition,
                    similarity,
                    direction,
                })
            })
            .collect())
    }

    /// New belief's conditions against stored observations
    async fn belief_candidates(&self, record: &MemoryRecord) -> Result<Vec<Candidate>> {
        let mut conditions: Vec<(String, JudgeKind)> = record
            .invalidates_if
            .iter()
            .map(|c| (c.clone(), JudgeKind::Invalidates))
            .collect();
        if record.is_time_bound() {
            conditions.extend(
                record
                    .confirms_if
                    .iter()
                    .map(|c| (c.clone(), JudgeKind::Confirms)),
            );
        }

        let filter = VectorFilter {
            kind: Some(MemoryKind::Observation),
            exclude_memory_ids: vec![record.id.clone()],
            ..Default::default()
        };
        let mut candidates = vec![];
        for (condition, direction) in conditions {
            let embedding = self.oracle.embed(&condition).await?;
            let hits = self.indexes.content.query(
                &embedding,
                self.config.max_candidates,
                Some(&filter),
                self.config.min_similarity,
            )?;
            let obs_ids: Vec<String> = hits.iter().map(|h| h.metadata.memory_id.clone()).collect();
            let observations: std::collections::HashMap<String, MemoryRecord> = self
                .store
                .list_by_ids(&obs_ids)
                .await?
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect();
            for hit in hits {
                let Some(obs) = observations.get(&hit.metadata.memory_id) else {
                    continue;
                };
                if obs.retracted {
                    continue;
                }
                candidates.push(Candidate {
                    obs_id: obs.id.clone(),
                    obs_content: obs.content.clone(),
                    target_id: record.id.clone(),
                    target_content: record.content.clone(),
                    condition: condition.clone(),
                    similarity: hit.score,
                    direction,
                });
            }
        }
        Ok(candidates)
    }

    /// Record a judged violation on the target belief
    async fn apply_violation(
        &self,
        session_id: &str,
        candidate: &Candidate,
        verdict: &JudgeVerdict,
        report: &mut ExposureReport,
    ) -> Result<()> {
        let target = self
            .store
            .get_memory(&candidate.target_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(candidate.target_id.clone()))?;
        // Idempotent by the (obs, condition, target) triple
        if target
            .violations
            .iter()
            .any(|v| v.obs_id == candidate.obs_id && v.condition == candidate.condition)
        {
            return Ok(());
        }

        let damage = if is_core(&self.store, &target).await? {
            DamageLevel::Core
        } else {
            DamageLevel::Peripheral
        };

        let violation = ViolationRecord {
            obs_id: candidate.obs_id.clone(),
            condition: candidate.condition.clone(),
            timestamp: Utc::now(),
            damage_level: damage,
            source_type: ViolationOrigin::Direct,
            cascade_source_id: None,
        };
        let updated = self
            .store
            .modify_memory(&candidate.target_id, |m| {
                m.violations.push(violation.clone());
                m.contradictions += 1;
                m.times_tested += 1;
                if damage == DamageLevel::Core || m.is_overwhelmingly_violated() {
                    m.state = MemoryState::Violated;
                }
            })
            .await?;

        if !updated.state.keeps_condition_vectors() {
            self.indexes.delete_condition_vectors(
                &updated.id,
                updated.invalidates_if.len(),
                updated.confirms_if.len(),
            )?;
        }

        self.store
            .upsert_edge(
                &candidate.obs_id,
                &candidate.target_id,
                EdgeType::ViolatedBy,
                1.0,
            )
            .await?;

        let mut event = MemoryEvent::new(session_id, EventType::Violation, &candidate.target_id)
            .with_violated_by(&candidate.obs_id)
            .with_damage(damage)
            .with_context(serde_json::json!({
                "condition": candidate.condition,
                "confidence": verdict.confidence,
                "reasoning": verdict.reasoning,
                "state": updated.state.as_str(),
            }));
        event.id = format!(
            "violation:{}:{}:{}",
            candidate.obs_id,
            candidate.target_id,
            fingerprint(&candidate.condition)
        );
        self.store.append_event(&event).await?;

        tracing::info!(
            target = %candidate.target_id,
            obs = %candidate.obs_id,
            damage = damage.as_str(),
            state = updated.state.as_str(),
            "violation recorded"
        );
        report.violations += 1;

        // Shock the neighbourhood and queue the cascade effects
        let max_tested = self.gauge.get(&self.store).await?;
        let shock = propagate_shock(
            &self.store,
            &self.config,
            max_tested,
            &candidate.target_id,
            ShockKind::Damage(damage),
        )
        .await?;
        report.cascades += 1;
        for affected in &shock.affected {
            let mut cascade =
                MemoryEvent::new(session_id, EventType::CascadeDamage, affected.clone())
                    .with_damage(damage)
                    .with_context(serde_json::json!({
                        "cascadeSourceId": candidate.target_id,
                        "obsId": candidate.obs_id,
                        "condition": candidate.condition,
                    }));
            cascade.id = format!(
                "cascade_damage:{}:{}:{}",
                candidate.target_id,
                affected,
                fingerprint(&candidate.condition)
            );
            self.store.append_event(&cascade).await?;
        }
        Ok(())
    }

    /// Record a judged confirmation on the target belief
    async fn apply_confirmation(
        &self,
        session_id: &str,
        candidate: &Candidate,
        verdict: &JudgeVerdict,
        report: &mut ExposureReport,
    ) -> Result<()> {
        let target = self
            .store
            .get_memory(&candidate.target_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(candidate.target_id.clone()))?;
        // One confirmation per (obs, target) pair
        let existing = self
            .store
            .list_edges_incident(
                &[candidate.target_id.clone()],
                &[EdgeType::ConfirmedBy],
                0.0,
            )
            .await?;
        if existing
            .iter()
            .any(|e| e.source_id == candidate.obs_id && e.target_id == candidate.target_id)
        {
            return Ok(());
        }

        let auto_confirm = target.is_time_bound();
        let updated = self
            .store
            .modify_memory(&candidate.target_id, |m| {
                m.confirmations += 1;
                m.times_tested += 1;
                if auto_confirm {
                    m.state = MemoryState::Confirmed;
                }
            })
            .await?;
        self.store
            .upsert_edge(
                &candidate.obs_id,
                &candidate.target_id,
                EdgeType::ConfirmedBy,
                1.0,
            )
            .await?;

        report.confirmations += 1;
        if auto_confirm {
            report.auto_confirmed += 1;
            self.indexes.delete_condition_vectors(
                &updated.id,
                updated.invalidates_if.len(),
                updated.confirms_if.len(),
            )?;

            let mut confirmed = MemoryEvent::new(
                session_id,
                EventType::PredictionConfirmed,
                &candidate.target_id,
            )
            .with_context(serde_json::json!({
                "obsId": candidate.obs_id,
                "condition": candidate.condition,
                "confidence": verdict.confidence,
            }));
            confirmed.id = format!(
                "prediction_confirmed:{}:{}",
                candidate.obs_id, candidate.target_id
            );
            self.store.append_event(&confirmed).await?;

            let mut resolution =
                MemoryEvent::new(session_id, EventType::Resolution, &candidate.target_id)
                    .with_context(serde_json::json!({
                        "reason": "auto-confirmed by observation",
                        "obsId": candidate.obs_id,
                    }));
            resolution.id = format!("resolution:{}:{}", candidate.obs_id, candidate.target_id);
            self.store.append_event(&resolution).await?;
        }

        tracing::info!(
            target = %candidate.target_id,
            obs = %candidate.obs_id,
            auto_confirm,
            "confirmation recorded"
        );
        Ok(())
    }

}

/// Core iff centrality >= 3 or any active derivation descendant within two
/// hops; core violations shock at full magnitude
pub(crate) async fn is_core(store: &SqliteStore, record: &MemoryRecord) -> Result<bool> {
    if record.centrality >= CORE_CENTRALITY {
        return Ok(true);
    }
    let mut frontier = vec![record.id.clone()];
    for _ in 0..CORE_DESCENDANT_DEPTH {
        if frontier.is_empty() {
            break;
        }
        let edges = store
            .list_edges_incident(&frontier, &[EdgeType::DerivedFrom], 0.0)
            .await?;
        let children: Vec<String> = edges
            .iter()
            .filter(|e| frontier.contains(&e.source_id))
            .map(|e| e.target_id.clone())
            .collect();
        if children.is_empty() {
            break;
        }
        let rows = store.list_by_ids(&children).await?;
        if rows
            .iter()
            .any(|r| r.state == MemoryState::Active && !r.retracted)
        {
            return Ok(true);
        }
        frontier = children;
    }
    Ok(false)
}

/// Short stable fingerprint for deterministic event ids
fn fingerprint(text: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}
