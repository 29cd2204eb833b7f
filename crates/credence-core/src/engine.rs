//! Engine facade
//!
//! One struct owning the store, the three vector indexes, the oracle
//! gateway, and the configuration, exposing the boundary API external
//! collaborators adapt to their transport: ingest, resolve, zone,
//! apply_cascade, stats, and the operational extras (draft override,
//! retraction, event draining, whole-graph passes, janitor listing).

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{CoreError, Result};
use crate::exposure::{ExposureChecker, ExposureReport};
use crate::ingest::{IngestOutcome, IngestPipeline};
use crate::memory::{
    DamageLevel, EventType, MemoryEvent, MemoryRecord, MemoryRequest, MemoryState, Outcome,
    ViolationOrigin, ViolationRecord,
};
use crate::oracle::{ChatProvider, EmbeddingProvider, OracleGateway};
use crate::propagation::{run_full_propagation, PropagationReport, TestedGauge};
use crate::resolution::{ResolutionService, ResolveOutcome};
use crate::stats::{collect_stats, EngineStats};
use crate::storage::{IndexSet, SqliteStore};
use crate::surprise::{compute_surprise, REVALIDATE_DRIFT};
use crate::zone::{extract_zone, ZoneParams, ZoneResult};

/// Semantic hits fetched when resolving a zone seed from a query
const SEED_SEARCH_TOP_K: usize = 10;

/// Semantic hits offered to zone expansion
const EXPANSION_TOP_K: usize = 25;

// ============================================================================
// CASCADE ACTIONS
// ============================================================================

/// What a queued cascade event does when committed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CascadeAction {
    /// Strengthen the target
    Boost,
    /// Weaken the target with a cascade violation
    Damage,
    /// Consume the event without touching the target
    Dismiss,
}

/// Result of committing one cascade effect
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeApplied {
    /// The target memory
    pub memory_id: String,
    /// What was requested
    pub action: CascadeAction,
    /// False when the guarding event had already been dispatched
    pub applied: bool,
}

// ============================================================================
// ENGINE
// ============================================================================

/// The belief-graph memory engine
pub struct BeliefEngine {
    store: Arc<SqliteStore>,
    indexes: IndexSet,
    oracle: Arc<OracleGateway>,
    config: EngineConfig,
    gauge: Arc<TestedGauge>,
    pipeline: IngestPipeline,
    checker: ExposureChecker,
    resolution: ResolutionService,
    instance_id: String,
}

impl BeliefEngine {
    /// Build an engine over providers; the gateway is constructed here
    pub fn new(
        store: Arc<SqliteStore>,
        indexes: IndexSet,
        embedder: Arc<dyn EmbeddingProvider>,
        chat: Arc<dyn ChatProvider>,
        config: EngineConfig,
    ) -> Self {
        let config = config.clamped();
        let oracle = Arc::new(OracleGateway::new(embedder, chat, &config));
        Self::with_gateway(store, indexes, oracle, config)
    }

    /// Build an engine over an existing gateway
    pub fn with_gateway(
        store: Arc<SqliteStore>,
        indexes: IndexSet,
        oracle: Arc<OracleGateway>,
        config: EngineConfig,
    ) -> Self {
        let config = config.clamped();
        let gauge = Arc::new(TestedGauge::new());
        let pipeline = IngestPipeline::new(
            store.clone(),
            indexes.clone(),
            oracle.clone(),
            config.clone(),
            gauge.clone(),
        );
        let checker = ExposureChecker::new(
            store.clone(),
            indexes.clone(),
            oracle.clone(),
            config.clone(),
            gauge.clone(),
        );
        let resolution = ResolutionService::new(
            store.clone(),
            indexes.clone(),
            config.clone(),
            gauge.clone(),
        );
        Self {
            store,
            indexes,
            oracle,
            config,
            gauge,
            pipeline,
            checker,
            resolution,
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    /// The underlying row store
    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// The engine configuration after clamping
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // BOUNDARY API
    // ========================================================================

    /// Ingest a memory (§ pipeline)
    pub async fn ingest(
        &self,
        request: MemoryRequest,
        session_id: &str,
        request_id: &str,
    ) -> Result<IngestOutcome> {
        self.pipeline.ingest(request, session_id, request_id).await
    }

    /// Resolve a memory with an outcome
    pub async fn resolve(
        &self,
        session_id: &str,
        id: &str,
        outcome: Outcome,
        reason: Option<&str>,
        replaced_by: Option<&str>,
        force: bool,
    ) -> Result<ResolveOutcome> {
        self.resolution
            .resolve(session_id, id, outcome, reason, replaced_by, force)
            .await
    }

    /// Extract a reasoning zone around an id or a semantic query
    pub async fn zone(&self, params: ZoneParams) -> Result<ZoneResult> {
        let (seed_id, semantic_candidates) = match (&params.memory_id, &params.query) {
            (Some(id), query) => {
                let candidates = match query {
                    Some(q) => self.semantic_candidates(q, Some(id.as_str())).await?,
                    None => vec![],
                };
                (id.clone(), candidates)
            }
            (None, Some(query)) => {
                let embedding = self.oracle.embed(query).await?;
                let hits =
                    self.indexes
                        .content
                        .query(&embedding, SEED_SEARCH_TOP_K, None, 0.0)?;
                let mut seed = None;
                for hit in &hits {
                    if let Some(record) = self.store.get_memory(&hit.metadata.memory_id).await? {
                        if !record.retracted {
                            seed = Some(record.id);
                            break;
                        }
                    }
                }
                let seed = seed.ok_or_else(|| {
                    CoreError::NotFound(format!("no memory matches query '{}'", query))
                })?;
                let candidates = self.semantic_candidates(query, Some(seed.as_str())).await?;
                (seed, candidates)
            }
            (None, None) => {
                return Err(CoreError::validation(
                    "zone requires a memory_id or a query",
                ))
            }
        };

        let max_tested = self.gauge.get(&self.store).await?;
        extract_zone(
            &self.store,
            &self.config,
            max_tested,
            &seed_id,
            &params,
            &semantic_candidates,
        )
        .await
    }

    /// Commit a queued cascade effect onto a memory
    ///
    /// With an `event_id` the event's dispatched bit guards replays: the
    /// second application of the same event is a no-op.
    pub async fn apply_cascade(
        &self,
        memory_id: &str,
        action: CascadeAction,
        event_id: Option<&str>,
        source_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<CascadeApplied> {
        if let Some(event_id) = event_id {
            if self.store.claim_event(event_id).await?.is_none() {
                tracing::debug!(event_id, "cascade event already dispatched, skipping");
                return Ok(CascadeApplied {
                    memory_id: memory_id.to_string(),
                    action,
                    applied: false,
                });
            }
        }

        match action {
            CascadeAction::Dismiss => {}
            CascadeAction::Boost => {
                self.store
                    .modify_memory(memory_id, |m| {
                        m.cascade_boosts += 1;
                        m.last_cascade_at = Some(Utc::now());
                    })
                    .await?;
            }
            CascadeAction::Damage => {
                let source = source_id.map(str::to_string);
                let condition = reason.unwrap_or("cascade damage").to_string();
                let updated = self
                    .store
                    .modify_memory(memory_id, |m| {
                        m.violations.push(ViolationRecord {
                            obs_id: source.clone().unwrap_or_else(|| "cascade".to_string()),
                            condition: condition.clone(),
                            timestamp: Utc::now(),
                            damage_level: DamageLevel::Peripheral,
                            source_type: ViolationOrigin::Cascade,
                            cascade_source_id: source.clone(),
                        });
                        m.contradictions += 1;
                        m.cascade_damages += 1;
                        m.last_cascade_at = Some(Utc::now());
                        if m.is_overwhelmingly_violated() {
                            m.state = MemoryState::Violated;
                        }
                    })
                    .await?;
                if !updated.state.keeps_condition_vectors() {
                    self.indexes.delete_condition_vectors(
                        memory_id,
                        updated.invalidates_if.len(),
                        updated.confirms_if.len(),
                    )?;
                }
            }
        }
        Ok(CascadeApplied {
            memory_id: memory_id.to_string(),
            action,
            applied: true,
        })
    }

    /// Summary counts by state, robustness tier, and violation presence
    pub async fn stats(&self) -> Result<EngineStats> {
        collect_stats(&self.store).await
    }

    // ========================================================================
    // OPERATIONS
    // ========================================================================

    /// Promote a draft to active
    pub async fn override_draft(&self, id: &str) -> Result<MemoryRecord> {
        self.pipeline.override_draft(id).await
    }

    /// Permanently retract a memory
    pub async fn retract(&self, id: &str) -> Result<()> {
        self.resolution.retract(id).await
    }

    /// Run (or re-drive) the exposure check of one memory
    pub async fn run_exposure_check(
        &self,
        session_id: &str,
        memory_id: &str,
    ) -> Result<ExposureReport> {
        self.checker.run(session_id, memory_id, None).await
    }

    /// Run one singleton whole-graph propagation pass
    pub async fn run_full_propagation(&self) -> Result<PropagationReport> {
        let max_tested = self.gauge.get(&self.store).await?;
        run_full_propagation(&self.store, &self.config, max_tested, &self.instance_id).await
    }

    /// Claim and process a session's due events
    ///
    /// Exposure checks run here; cascade effects are committed through
    /// [`BeliefEngine::apply_cascade`]; the remaining events (violations,
    /// confirmations, resolutions) are returned for the caller's dispatcher.
    pub async fn drain_session(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryEvent>> {
        let events = self.store.claim_due_events(session_id, limit).await?;
        for event in &events {
            match event.event_type {
                EventType::ExposureCheck => {
                    let embedding = event.context["embedding"]
                        .as_array()
                        .map(|a| a.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect());
                    if let Err(err) = self
                        .checker
                        .run(session_id, &event.memory_id, embedding)
                        .await
                    {
                        tracing::warn!(
                            memory_id = %event.memory_id,
                            "queued exposure check failed: {}",
                            err
                        );
                    }
                }
                EventType::CascadeBoost => {
                    let source = event.context["cascadeSourceId"].as_str();
                    self.apply_cascade(
                        &event.memory_id,
                        CascadeAction::Boost,
                        None,
                        source,
                        None,
                    )
                    .await?;
                }
                EventType::CascadeDamage => {
                    let source = event.context["cascadeSourceId"].as_str();
                    let condition = event.context["condition"].as_str();
                    self.apply_cascade(
                        &event.memory_id,
                        CascadeAction::Damage,
                        None,
                        source,
                        condition,
                    )
                    .await?;
                }
                _ => {}
            }
        }
        Ok(events)
    }

    /// The most surprising active memories, revalidated on read
    ///
    /// Stored scores drifting more than the threshold are rewritten in
    /// passing; ranking uses the recomputed values.
    pub async fn most_surprising(&self, limit: usize) -> Result<Vec<(MemoryRecord, f64)>> {
        let ranked = self.store.list_surprise_ranked(limit).await?;
        let max_tested = self.gauge.get(&self.store).await?;

        let mut out = vec![];
        for (id, stored) in ranked {
            let Some(record) = self.store.get_memory(&id).await? else { continue };
            let embedding = self.oracle.embed(&record.content).await?;
            let fresh = compute_surprise(
                &self.store,
                self.indexes.content.as_ref(),
                max_tested,
                &record,
                &embedding,
            )
            .await?;
            if (fresh - stored).abs() > REVALIDATE_DRIFT {
                // Fire-and-forget refresh of the cached value
                let _ = self
                    .store
                    .modify_memory(&id, |m| m.surprise = Some(fresh))
                    .await;
            }
            out.push((record, fresh));
        }
        out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(out)
    }

    /// Janitor listing of dangling derivation references
    pub async fn dangling_derived_refs(&self) -> Result<Vec<(String, String)>> {
        self.store.dangling_derived_refs().await
    }

    async fn semantic_candidates(
        &self,
        query: &str,
        exclude: Option<&str>,
    ) -> Result<Vec<String>> {
        let embedding = self.oracle.embed(query).await?;
        let hits = self
            .indexes
            .content
            .query(&embedding, EXPANSION_TOP_K, None, 0.0)?;
        Ok(hits
            .into_iter()
            .map(|h| h.metadata.memory_id)
            .filter(|id| exclude != Some(id.as_str()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::ExposureQueued;
    use crate::testing::{judge_match, TestRig};

    fn engine(rig: &TestRig) -> BeliefEngine {
        BeliefEngine::with_gateway(
            rig.store.clone(),
            rig.indexes.clone(),
            rig.oracle.clone(),
            rig.config.clone(),
        )
    }

    fn axis(hot: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; crate::storage::EMBEDDING_DIMENSIONS];
        v[hot] = 1.0;
        v
    }

    fn observation(content: &str) -> MemoryRequest {
        MemoryRequest {
            content: content.to_string(),
            source: Some("market".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_drain_runs_queued_exposure_checks() {
        let rig = TestRig::new();
        let e = engine(&rig);

        rig.embedder.preset("MSFT drops below 300", axis(11));
        rig.embedder.preset("MSFT closed at 290", axis(11));

        let belief = e
            .ingest(
                MemoryRequest {
                    content: "MSFT holds the 300 level".to_string(),
                    source: Some("human".to_string()),
                    invalidates_if: vec!["MSFT drops below 300".to_string()],
                    ..Default::default()
                },
                "s1",
                "r1",
            )
            .await
            .unwrap();
        assert_eq!(belief.exposure_check, ExposureQueued::Queued);

        // Drain the belief's own exposure check first (no observations yet)
        e.drain_session("s1", 10).await.unwrap();

        rig.chat.push_judge(&judge_match(0.9));
        let obs = e
            .ingest(observation("MSFT closed at 290"), "s1", "r2")
            .await
            .unwrap();
        // The observation has no conditions, so no queued check: run directly
        let report = e.run_exposure_check("s1", &obs.id).await.unwrap();
        assert_eq!(report.violations, 1);

        let b = rig.store.get_memory(&belief.id).await.unwrap().unwrap();
        assert_eq!(b.violations.len(), 1);
    }

    #[tokio::test]
    async fn test_apply_cascade_event_guard_is_idempotent() {
        let rig = TestRig::new();
        let e = engine(&rig);
        let target = e
            .ingest(observation("GOOG closed at 140"), "s1", "r1")
            .await
            .unwrap();

        let event = MemoryEvent::new("s1", EventType::CascadeBoost, &target.id);
        rig.store.append_event(&event).await.unwrap();

        let first = e
            .apply_cascade(&target.id, CascadeAction::Boost, Some(&event.id), None, None)
            .await
            .unwrap();
        assert!(first.applied);

        let second = e
            .apply_cascade(&target.id, CascadeAction::Boost, Some(&event.id), None, None)
            .await
            .unwrap();
        assert!(!second.applied);

        let record = rig.store.get_memory(&target.id).await.unwrap().unwrap();
        assert_eq!(record.cascade_boosts, 1);
        assert!(record.last_cascade_at.is_some());
    }

    #[tokio::test]
    async fn test_cascade_damage_records_cascade_violation() {
        let rig = TestRig::new();
        let e = engine(&rig);
        let parent = e
            .ingest(observation("NVDA closed at 900"), "s1", "r1")
            .await
            .unwrap();
        let target = e
            .ingest(
                MemoryRequest {
                    content: "NVDA momentum continues".to_string(),
                    derived_from: vec![parent.id.clone()],
                    ..Default::default()
                },
                "s1",
                "r2",
            )
            .await
            .unwrap();

        e.apply_cascade(
            &target.id,
            CascadeAction::Damage,
            None,
            Some(&parent.id),
            Some("upstream belief failed"),
        )
        .await
        .unwrap();

        let record = rig.store.get_memory(&target.id).await.unwrap().unwrap();
        assert_eq!(record.cascade_damages, 1);
        assert_eq!(record.violations.len(), 1);
        assert_eq!(record.violations[0].source_type, ViolationOrigin::Cascade);
        assert_eq!(
            record.violations[0].cascade_source_id.as_deref(),
            Some(parent.id.as_str())
        );
        // times_tested untouched by cascade damage
        assert_eq!(record.times_tested, 0);
    }

    #[tokio::test]
    async fn test_zone_by_query_resolves_seed() {
        let rig = TestRig::new();
        let e = engine(&rig);

        rig.embedder.preset("tech megacaps", axis(20));
        rig.embedder.preset("AAPL leads the megacap rally", axis(20));

        let seed = e
            .ingest(observation("AAPL leads the megacap rally"), "s1", "r1")
            .await
            .unwrap();
        e.ingest(
            MemoryRequest {
                content: "Megacap strength persists".to_string(),
                derived_from: vec![seed.id.clone()],
                ..Default::default()
            },
            "s1",
            "r2",
        )
        .await
        .unwrap();

        let zone = e
            .zone(ZoneParams {
                query: Some("tech megacaps".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(zone.seed_id, seed.id);
        assert_eq!(zone.members.len(), 2);

        let err = e.zone(ZoneParams::default()).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_most_surprising_revalidates_stale_scores() {
        let rig = TestRig::new();
        let e = engine(&rig);

        let first = e
            .ingest(observation("WTI crude spiked 8 percent"), "s1", "r1")
            .await
            .unwrap();
        assert_eq!(first.surprise, Some(1.0));

        // Corrupt the cached score; the ranked read must recompute and
        // write the fresh value back.
        rig.store
            .modify_memory(&first.id, |m| m.surprise = Some(0.2))
            .await
            .unwrap();

        let ranked = e.most_surprising(5).await.unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].1, 1.0);

        let stored = rig.store.get_memory(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.surprise, Some(1.0));
    }

    #[tokio::test]
    async fn test_stats_and_janitor_round_out_the_api() {
        let rig = TestRig::new();
        let e = engine(&rig);
        e.ingest(observation("DAX closed higher"), "s1", "r1")
            .await
            .unwrap();

        let stats = e.stats().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.by_state.get("active"), Some(&1));

        assert!(e.dangling_derived_refs().await.unwrap().is_empty());
    }
}
