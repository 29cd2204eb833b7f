//! Whole-graph confidence propagation
//!
//! Periodic pass over every connected component of the support and
//! contradiction graph. Observations anchor their components; everything
//! else relaxes under the same damped rule the shock path uses, after a
//! spectral-radius estimate decides whether the iteration is a contraction
//! at all.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::memory::{EdgeType, MemoryRecord};
use crate::storage::SqliteStore;

use super::confidence::local_confidence;

/// Edges weaker than this are invisible to propagation
const STRENGTH_FLOOR: f32 = 0.1;

/// Power-iteration steps for the norm estimate
const POWER_ITERATIONS: usize = 20;

/// Contraction margin: sigma >= 1 - EPSILON trips the guard
const CONTRACTION_EPSILON: f64 = 1e-3;

/// Iteration cap under the non-contraction guard
const GUARDED_ITERATIONS: usize = 5;

/// Iteration cap for contracting components
const MAX_ITERATIONS: usize = 25;

/// Convergence threshold on the largest update
const CONVERGENCE_EPSILON: f64 = 1e-4;

/// Smallest write-back delta
const WRITE_EPSILON: f64 = 1e-6;

/// Advisory lock guarding the propagation singleton
const PROPAGATION_LOCK: &str = "graph_propagation";

/// Lock lease; long enough for a full pass, short enough to self-heal
const LOCK_TTL: Duration = Duration::from_secs(300);

// ============================================================================
// REPORT
// ============================================================================

/// Outcome of one whole-graph pass
#[derive(Debug, Clone, Default)]
pub struct PropagationReport {
    /// Connected components visited
    pub components: usize,
    /// Nodes whose propagated confidence was rewritten
    pub updated: usize,
    /// Components that tripped the non-contraction guard
    pub guarded_components: usize,
    /// True when another instance held the lock and nothing ran
    pub skipped: bool,
}

// ============================================================================
// PASS
// ============================================================================

/// Run one singleton whole-graph propagation pass
pub async fn run_full_propagation(
    store: &SqliteStore,
    config: &EngineConfig,
    max_times_tested: u32,
    holder: &str,
) -> Result<PropagationReport> {
    if !store
        .try_acquire_lock(PROPAGATION_LOCK, holder, LOCK_TTL)
        .await?
    {
        tracing::debug!("graph propagation already running, skipping");
        return Ok(PropagationReport {
            skipped: true,
            ..Default::default()
        });
    }

    let pass = propagate_all(store, config, max_times_tested).await;
    store.release_lock(PROPAGATION_LOCK, holder).await?;
    pass
}

async fn propagate_all(
    store: &SqliteStore,
    config: &EngineConfig,
    max_times_tested: u32,
) -> Result<PropagationReport> {
    let edges = store
        .list_edges_by_types(
            &[
                EdgeType::DerivedFrom,
                EdgeType::ConfirmedBy,
                EdgeType::ViolatedBy,
            ],
            STRENGTH_FLOOR,
        )
        .await?;

    // Undirected adjacency for component discovery
    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
    for edge in &edges {
        adjacency
            .entry(edge.source_id.clone())
            .or_default()
            .push(edge.target_id.clone());
        adjacency
            .entry(edge.target_id.clone())
            .or_default()
            .push(edge.source_id.clone());
    }

    let mut report = PropagationReport::default();
    let mut visited: HashSet<String> = HashSet::new();
    let all_nodes: Vec<String> = adjacency.keys().cloned().collect();

    for start in all_nodes {
        if visited.contains(&start) {
            continue;
        }
        // BFS one component
        let mut component: Vec<String> = vec![];
        let mut queue = VecDeque::from([start.clone()]);
        visited.insert(start);
        while let Some(node) = queue.pop_front() {
            component.push(node.clone());
            if let Some(neighbours) = adjacency.get(&node) {
                for n in neighbours {
                    if visited.insert(n.clone()) {
                        queue.push_back(n.clone());
                    }
                }
            }
        }

        report.components += 1;
        let outcome = propagate_component(store, config, max_times_tested, &component, &edges)
            .await?;
        report.updated += outcome.0;
        if outcome.1 {
            report.guarded_components += 1;
        }
    }

    tracing::info!(
        components = report.components,
        updated = report.updated,
        guarded = report.guarded_components,
        "whole-graph propagation pass complete"
    );
    Ok(report)
}

/// Relax one component; returns (written nodes, guard tripped)
async fn propagate_component(
    store: &SqliteStore,
    config: &EngineConfig,
    max_times_tested: u32,
    component: &[String],
    all_edges: &[crate::memory::Edge],
) -> Result<(usize, bool)> {
    let records: HashMap<String, MemoryRecord> = store
        .list_by_ids(&component.to_vec())
        .await?
        .into_iter()
        .map(|r| (r.id.clone(), r))
        .collect();
    let in_component: HashSet<&String> = component.iter().collect();

    // Node order: updateable first for the restricted operator
    let updateable: Vec<String> = component
        .iter()
        .filter(|id| {
            records
                .get(*id)
                .map(|r| !r.is_observation() && !r.retracted)
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    if updateable.is_empty() {
        return Ok((0, false));
    }
    let index: HashMap<&String, usize> = updateable.iter().enumerate().map(|(i, id)| (id, i)).collect();

    // Per-node neighbour lists restricted to the component
    let mut support: HashMap<String, Vec<(String, f64)>> = HashMap::new();
    let mut contradiction: HashMap<String, Vec<(String, f64)>> = HashMap::new();
    for edge in all_edges {
        if !in_component.contains(&edge.source_id) || !in_component.contains(&edge.target_id) {
            continue;
        }
        let w = f64::from(edge.strength);
        if edge.edge_type.is_support() {
            support
                .entry(edge.source_id.clone())
                .or_default()
                .push((edge.target_id.clone(), w));
            support
                .entry(edge.target_id.clone())
                .or_default()
                .push((edge.source_id.clone(), w));
        } else if edge.edge_type.is_contradiction() {
            contradiction
                .entry(edge.target_id.clone())
                .or_default()
                .push((edge.source_id.clone(), w));
        }
    }

    // Initial values: anchors at starting confidence, beliefs at their
    // stored propagated value or their local confidence
    let mut local: HashMap<String, f64> = HashMap::new();
    let mut values: HashMap<String, f64> = HashMap::new();
    for id in component {
        let Some(record) = records.get(id) else { continue };
        if record.is_observation() {
            values.insert(id.clone(), record.starting_confidence);
        } else {
            let l = local_confidence(record, max_times_tested);
            values.insert(id.clone(), record.propagated_confidence.unwrap_or(l));
            local.insert(id.clone(), l);
        }
    }
    let start_values = values.clone();

    // Spectral-radius estimate of the update operator restricted to the
    // updateable nodes: sigma = alpha * ||A+ - eta A-||_2 via power
    // iteration on MtM.
    let n = updateable.len();
    let support_weight: Vec<f64> = updateable
        .iter()
        .map(|id| {
            support
                .get(id)
                .map(|ns| ns.iter().map(|(_, w)| w).sum())
                .unwrap_or(0.0)
        })
        .collect();
    let contra_weight: Vec<f64> = updateable
        .iter()
        .map(|id| {
            contradiction
                .get(id)
                .map(|ns| ns.iter().map(|(_, w)| w).sum())
                .unwrap_or(0.0)
        })
        .collect();

    let apply_m = |x: &[f64]| -> Vec<f64> {
        let mut out = vec![0.0; n];
        for (i, id) in updateable.iter().enumerate() {
            let mut acc = 0.0;
            if support_weight[i] > 0.0 {
                if let Some(ns) = support.get(id) {
                    for (other, w) in ns {
                        if let Some(&j) = index.get(other) {
                            acc += w * x[j] / support_weight[i];
                        }
                    }
                }
            }
            if contra_weight[i] > 0.0 {
                if let Some(ns) = contradiction.get(id) {
                    for (other, w) in ns {
                        if let Some(&j) = index.get(other) {
                            acc -= config.shock_eta * w * x[j] / contra_weight[i];
                        }
                    }
                }
            }
            out[i] = config.shock_alpha * acc;
        }
        out
    };
    let apply_mt = |x: &[f64]| -> Vec<f64> {
        let mut out = vec![0.0; n];
        for (i, id) in updateable.iter().enumerate() {
            if support_weight[i] > 0.0 {
                if let Some(ns) = support.get(id) {
                    for (other, w) in ns {
                        if let Some(&j) = index.get(other) {
                            out[j] += config.shock_alpha * w * x[i] / support_weight[i];
                        }
                    }
                }
            }
            if contra_weight[i] > 0.0 {
                if let Some(ns) = contradiction.get(id) {
                    for (other, w) in ns {
                        if let Some(&j) = index.get(other) {
                            out[j] -= config.shock_alpha * config.shock_eta * w * x[i]
                                / contra_weight[i];
                        }
                    }
                }
            }
        }
        out
    };

    let mut v = vec![1.0 / (n as f64).sqrt(); n];
    let mut sigma = 0.0f64;
    for _ in 0..POWER_ITERATIONS {
        let u = apply_m(&v);
        let w = apply_mt(&u);
        let norm = w.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm <= f64::EPSILON {
            sigma = 0.0;
            break;
        }
        sigma = norm.sqrt();
        v = w.iter().map(|x| x / norm).collect();
    }

    let guard_tripped = sigma >= 1.0 - CONTRACTION_EPSILON;
    let iteration_cap = if guard_tripped {
        tracing::warn!(
            sigma,
            size = component.len(),
            "propagation operator is not a contraction, capping iterations"
        );
        GUARDED_ITERATIONS
    } else {
        MAX_ITERATIONS
    };

    // Damped fixed-point iteration
    for _ in 0..iteration_cap {
        let mut max_delta = 0.0f64;
        let mut next = values.clone();
        for (i, id) in updateable.iter().enumerate() {
            let support_mean = if support_weight[i] > 0.0 {
                support
                    .get(id)
                    .map(|ns| {
                        ns.iter()
                            .filter_map(|(other, w)| values.get(other).map(|v| w * v))
                            .sum::<f64>()
                            / support_weight[i]
                    })
                    .unwrap_or(0.0)
            } else {
                0.0
            };
            let contra_mean = if contra_weight[i] > 0.0 {
                contradiction
                    .get(id)
                    .map(|ns| {
                        ns.iter()
                            .filter_map(|(other, w)| values.get(other).map(|v| w * v))
                            .sum::<f64>()
                            / contra_weight[i]
                    })
                    .unwrap_or(0.0)
            } else {
                0.0
            };
            let updated = ((1.0 - config.shock_alpha) * local[id]
                + config.shock_alpha * (support_mean - config.shock_eta * contra_mean))
                .clamp(0.0, 1.0);
            max_delta = max_delta.max((updated - values[id]).abs());
            next.insert(id.clone(), updated);
        }
        values = next;
        if max_delta < CONVERGENCE_EPSILON {
            break;
        }
    }

    // Write back what moved
    let mut written = 0usize;
    for id in &updateable {
        let before = start_values[id];
        let after = values[id];
        if (after - before).abs() > WRITE_EPSILON {
            store
                .modify_memory(id, |m| m.propagated_confidence = Some(after))
                .await?;
            written += 1;
        }
    }
    Ok((written, guard_tripped))
}
