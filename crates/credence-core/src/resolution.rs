//! Resolution service
//!
//! Closes out a memory with an explicit outcome, cleans its condition
//! vectors, and pushes the consequences through the cascade: a correct
//! resolution boosts its derivation neighbourhood, an incorrect or
//! superseded one damages it, a voided one touches nothing.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{ConflictKind, CoreError, Result};
use crate::exposure::is_core;
use crate::memory::{
    DamageLevel, EdgeType, EventType, MemoryEvent, MemoryRecord, MemoryState, Outcome,
};
use crate::propagation::{propagate_shock, ShockKind, TestedGauge};
use crate::storage::{IndexSet, SqliteStore};

// ============================================================================
// TYPES
// ============================================================================

/// Result of a resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveOutcome {
    /// The resolved memory
    pub id: String,
    /// The recorded outcome
    pub outcome: Outcome,
    /// Neighbours whose confidence moved in the cascade
    pub cascaded: usize,
    /// Largest confidence drop in the cascade
    pub max_drop: f64,
}

// ============================================================================
// SERVICE
// ============================================================================

/// The resolution service
pub struct ResolutionService {
    store: Arc<SqliteStore>,
    indexes: IndexSet,
    config: EngineConfig,
    gauge: Arc<TestedGauge>,
}

impl ResolutionService {
    /// Build a service over shared engine state
    pub fn new(
        store: Arc<SqliteStore>,
        indexes: IndexSet,
        config: EngineConfig,
        gauge: Arc<TestedGauge>,
    ) -> Self {
        Self {
            store,
            indexes,
            config,
            gauge,
        }
    }

    /// Resolve a memory with an outcome
    #[allow(clippy::too_many_arguments)]
    pub async fn resolve(
        &self,
        session_id: &str,
        id: &str,
        outcome: Outcome,
        reason: Option<&str>,
        replaced_by: Option<&str>,
        force: bool,
    ) -> Result<ResolveOutcome> {
        let record = self
            .store
            .get_memory(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        if record.retracted {
            return Err(CoreError::validation(format!("memory {} is retracted", id)));
        }
        if record.state == MemoryState::Resolved && !force {
            return Err(CoreError::Conflict(ConflictKind::AlreadyResolved {
                state: record.state.as_str().to_string(),
                outcome: record.outcome.map(|o| o.as_str().to_string()),
            }));
        }

        if let Some(replacement) = replaced_by {
            if replacement == id {
                return Err(CoreError::validation("a memory cannot supersede itself"));
            }
            match self.store.get_memory(replacement).await? {
                None => return Err(CoreError::NotFound(replacement.to_string())),
                Some(r) if r.retracted => {
                    return Err(CoreError::validation(format!(
                        "replacement {} is retracted",
                        replacement
                    )))
                }
                Some(_) => {}
            }
        }

        let is_observation = record.is_observation();
        let updated = self
            .store
            .modify_memory(id, |m| {
                m.state = MemoryState::Resolved;
                m.outcome = Some(outcome);
                // A settled belief is ground truth for its neighbourhood;
                // observations keep their anchor semantics instead
                if !is_observation {
                    match outcome {
                        Outcome::Correct => m.propagated_confidence = Some(1.0),
                        Outcome::Incorrect => m.propagated_confidence = Some(0.0),
                        Outcome::Voided | Outcome::Superseded => {}
                    }
                }
            })
            .await?;
        self.indexes.delete_condition_vectors(
            id,
            updated.invalidates_if.len(),
            updated.confirms_if.len(),
        )?;

        if let Some(replacement) = replaced_by {
            self.store
                .upsert_edge(replacement, id, EdgeType::Supersedes, 1.0)
                .await?;
        }

        let mut event = MemoryEvent::new(session_id, EventType::Resolution, id)
            .with_context(serde_json::json!({
                "outcome": outcome.as_str(),
                "reason": reason,
                "replacedBy": replaced_by,
                "forced": force,
            }));
        event.id = format!("resolved:{}:{}", id, outcome.as_str());
        self.store.append_event(&event).await?;

        // A settled verdict is evidence about the sources that vouched for
        // this belief; fold it into their empirical track records
        self.record_source_outcomes(&updated, outcome).await;

        // Cascade by outcome
        let shock_kind = match outcome {
            Outcome::Correct => Some(ShockKind::Boost),
            Outcome::Incorrect | Outcome::Superseded => {
                let damage = if is_core(&self.store, &updated).await? {
                    DamageLevel::Core
                } else {
                    DamageLevel::Peripheral
                };
                Some(ShockKind::Damage(damage))
            }
            Outcome::Voided => None,
        };

        let mut cascaded = 0;
        let mut max_drop = 0.0;
        if let Some(kind) = shock_kind {
            let max_tested = self.gauge.get(&self.store).await?;
            let shock =
                propagate_shock(&self.store, &self.config, max_tested, id, kind).await?;
            cascaded = shock.affected.len();
            max_drop = shock.max_drop;

            let event_type = if kind.is_damage() {
                EventType::CascadeDamage
            } else {
                EventType::CascadeBoost
            };
            for affected in &shock.affected {
                let mut cascade = MemoryEvent::new(session_id, event_type, affected.clone())
                    .with_context(serde_json::json!({
                        "cascadeSourceId": id,
                        "outcome": outcome.as_str(),
                    }));
                cascade.id = format!(
                    "{}:{}:{}",
                    event_type.as_str(),
                    id,
                    affected
                );
                self.store.append_event(&cascade).await?;
            }
        }

        tracing::info!(
            memory_id = id,
            outcome = outcome.as_str(),
            cascaded,
            "memory resolved"
        );
        Ok(ResolveOutcome {
            id: id.to_string(),
            outcome,
            cascaded,
            max_drop,
        })
    }

    /// Update the empirical stats of every source that vouched for the
    /// resolved memory: its own source when it is an observation, plus each
    /// observation it was derived from.
    ///
    /// Bookkeeping only; failures are logged and never fail the resolve.
    async fn record_source_outcomes(&self, record: &MemoryRecord, outcome: Outcome) {
        let correct = match outcome {
            Outcome::Correct => true,
            Outcome::Incorrect => false,
            // No verdict about the evidence either way
            Outcome::Voided | Outcome::Superseded => return,
        };

        let mut sources: Vec<String> = vec![];
        if let Some(source) = &record.source {
            sources.push(source.clone());
        }
        match self.store.list_by_ids(&record.derived_from).await {
            Ok(parents) => {
                for parent in parents {
                    if let Some(source) = parent.source {
                        sources.push(source);
                    }
                }
            }
            Err(err) => {
                tracing::warn!(
                    memory_id = %record.id,
                    "could not load parents for source stats: {}",
                    err
                );
            }
        }

        for source in sources {
            if let Err(err) = self.store.record_source_outcome(&source, correct).await {
                tracing::warn!(source = %source, "source stat update failed: {}", err);
            }
        }
    }

    /// Permanently retract a memory
    ///
    /// Terminal: condition and content vectors are removed and the row can
    /// never generate events again.
    pub async fn retract(&self, id: &str) -> Result<()> {
        let updated = self
            .store
            .modify_memory(id, |m| m.retracted = true)
            .await?;
        self.indexes.delete_condition_vectors(
            id,
            updated.invalidates_if.len(),
            updated.confirms_if.len(),
        )?;
        self.indexes
            .content
            .delete_by_ids(std::slice::from_ref(&updated.id))?;
        tracing::info!(memory_id = id, "memory retracted");
        Ok(())
    }
}
