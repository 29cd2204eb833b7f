//! Local confidence shock
//!
//! After a violation, confirmation, or resolution, the seed's bounded
//! neighbourhood absorbs a damped confidence update. The same update rule
//! as the whole-graph pass, restricted to two support hops, with a shock
//! contradiction (or confirmation) injected from the seed onto its direct
//! support neighbours proportionally to edge strength.

use std::collections::{HashMap, HashSet};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::memory::{DamageLevel, EdgeType, MemoryRecord};
use crate::storage::SqliteStore;

use super::confidence::local_confidence;

/// Edges weaker than this are invisible to the cascade
const SUPPORT_FLOOR: f32 = 0.1;

/// Support hops gathered around the seed
const NEIGHBOURHOOD_HOPS: usize = 2;

/// Damped update rounds
const SHOCK_ITERATIONS: usize = 3;

/// Smallest write-back delta
const WRITE_EPSILON: f64 = 1e-6;

// ============================================================================
// SHOCK KINDS
// ============================================================================

/// Direction and magnitude of a shock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShockKind {
    /// Negative shock after a violation or failed resolution
    Damage(DamageLevel),
    /// Positive shock after a correct resolution
    Boost,
}

impl ShockKind {
    /// Injected shock magnitude
    pub fn magnitude(&self) -> f64 {
        match self {
            ShockKind::Damage(level) => level.shock_magnitude(),
            ShockKind::Boost => 1.0,
        }
    }

    /// Edge type the injection is written as
    pub fn edge_type(&self) -> EdgeType {
        match self {
            ShockKind::Damage(_) => EdgeType::ViolatedBy,
            ShockKind::Boost => EdgeType::ConfirmedBy,
        }
    }

    /// True for negative shocks
    pub fn is_damage(&self) -> bool {
        matches!(self, ShockKind::Damage(_))
    }
}

/// Outcome of one shock run
#[derive(Debug, Clone, Default)]
pub struct ShockResult {
    /// Ids whose propagated confidence was rewritten
    pub affected: Vec<String>,
    /// Largest confidence drop across the neighbourhood
    pub max_drop: f64,
}

// ============================================================================
// PROPAGATION
// ============================================================================

/// Apply a local confidence shock around `seed_id`
pub async fn propagate_shock(
    store: &SqliteStore,
    config: &EngineConfig,
    max_times_tested: u32,
    seed_id: &str,
    kind: ShockKind,
) -> Result<ShockResult> {
    // 1. Gather the support neighbourhood, two hops out
    let mut members: HashSet<String> = HashSet::from([seed_id.to_string()]);
    let mut frontier: Vec<String> = vec![seed_id.to_string()];
    let mut support_edges: HashMap<String, (String, String, f32)> = HashMap::new();
    // Direct support neighbours of the seed, by summed strength
    let mut direct: HashMap<String, f32> = HashMap::new();

    for hop in 0..NEIGHBOURHOOD_HOPS {
        if frontier.is_empty() {
            break;
        }
        let edges = store
            .list_edges_incident(&frontier, &EdgeType::SUPPORT, SUPPORT_FLOOR)
            .await?;
        let mut next: Vec<String> = vec![];
        for edge in edges {
            if hop == 0 {
                if let Some(other) = edge.other_endpoint(seed_id) {
                    *direct.entry(other.to_string()).or_insert(0.0) += edge.strength;
                }
            }
            support_edges.insert(
                edge.id.clone(),
                (edge.source_id.clone(), edge.target_id.clone(), edge.strength),
            );
            for endpoint in [edge.source_id, edge.target_id] {
                if members.insert(endpoint.clone()) {
                    next.push(endpoint);
                }
            }
        }
        frontier = next;
    }

    // 2. Incoming contradictions anywhere in the neighbourhood
    let member_ids: Vec<String> = members.iter().cloned().collect();
    let mut contradiction_edges: Vec<(String, String, f32)> = store
        .list_edges_incident(&member_ids, &[EdgeType::ViolatedBy], 0.0)
        .await?
        .into_iter()
        .filter(|e| members.contains(&e.target_id))
        .map(|e| (e.source_id, e.target_id, e.strength))
        .collect();

    // 3. Inject the shock onto the seed's direct support neighbours
    let total_strength: f32 = direct.values().sum();
    if total_strength > 0.0 {
        for (neighbour, strength) in &direct {
            let injected =
                (config.propagation_rho * kind.magnitude() * f64::from(*strength)
                    / f64::from(total_strength)) as f32;
            if injected <= 0.0 {
                continue;
            }
            let merged = store
                .upsert_edge(seed_id, neighbour, kind.edge_type(), injected)
                .await?;
            match kind {
                ShockKind::Damage(_) => {
                    contradiction_edges.retain(|(s, t, _)| !(s == seed_id && t == neighbour));
                    contradiction_edges.push((
                        seed_id.to_string(),
                        neighbour.clone(),
                        merged.strength,
                    ));
                }
                ShockKind::Boost => {
                    support_edges.insert(
                        merged.id.clone(),
                        (seed_id.to_string(), neighbour.clone(), merged.strength),
                    );
                }
            }
        }
    }

    // Contradiction sources outside the neighbourhood still exert pressure;
    // their values are read but never written.
    let mut value_ids: HashSet<String> = members.clone();
    for (source, _, _) in &contradiction_edges {
        value_ids.insert(source.clone());
    }

    // 4. Local scalars and starting values
    let ids: Vec<String> = value_ids.into_iter().collect();
    let records: HashMap<String, MemoryRecord> = store
        .list_by_ids(&ids)
        .await?
        .into_iter()
        .map(|r| (r.id.clone(), r))
        .collect();

    let mut local: HashMap<String, f64> = HashMap::new();
    let mut values: HashMap<String, f64> = HashMap::new();
    for (id, record) in &records {
        if record.is_observation() {
            values.insert(id.clone(), record.starting_confidence);
        } else {
            let l = local_confidence(record, max_times_tested);
            values.insert(id.clone(), record.propagated_confidence.unwrap_or(l));
            local.insert(id.clone(), l);
        }
    }
    let start_values = values.clone();

    // Which nodes actually update: neighbourhood beliefs, never the seed,
    // never observations, never retracted rows
    let updateable: Vec<String> = members
        .iter()
        .filter(|id| id.as_str() != seed_id)
        .filter(|id| {
            records
                .get(*id)
                .map(|r| !r.is_observation() && !r.retracted)
                .unwrap_or(false)
        })
        .cloned()
        .collect();

    // 5. Damped fixed-point rounds (Jacobi updates over the previous round)
    for _ in 0..SHOCK_ITERATIONS {
        let mut next = values.clone();
        for id in &updateable {
            let mut support_sum = 0.0f64;
            let mut support_weight = 0.0f64;
            for (source, target, strength) in support_edges.values() {
                let other = if source == id {
                    target
                } else if target == id {
                    source
                } else {
                    continue;
                };
                if let Some(v) = values.get(other) {
                    support_sum += f64::from(*strength) * v;
                    support_weight += f64::from(*strength);
                }
            }
            let support = if support_weight > 0.0 {
                support_sum / support_weight
            } else {
                0.0
            };

            let mut contra_sum = 0.0f64;
            let mut contra_weight = 0.0f64;
            for (source, target, strength) in &contradiction_edges {
                if target != id {
                    continue;
                }
                if let Some(v) = values.get(source) {
                    contra_sum += f64::from(*strength) * v;
                    contra_weight += f64::from(*strength);
                }
            }
            let contradiction = if contra_weight > 0.0 {
                contra_sum / contra_weight
            } else {
                0.0
            };

            let updated = (1.0 - config.shock_alpha) * local[id]
                + config.shock_alpha * (support - config.shock_eta * contradiction);
            next.insert(id.clone(), updated.clamp(0.0, 1.0));
        }
        values = next;
    }

    // 6. Write back what moved
    let mut result = ShockResult::default();
    for id in &updateable {
        let before = start_values[id];
        let after = values[id];
        if (after - before).abs() > WRITE_EPSILON {
            store
                .modify_memory(id, |m| m.propagated_confidence = Some(after))
                .await?;
            result.affected.push(id.clone());
            result.max_drop = result.max_drop.max(before - after);
        }
    }
    tracing::debug!(
        seed = seed_id,
        affected = result.affected.len(),
        max_drop = result.max_drop,
        "shock propagated"
    );
    Ok(result)
}
