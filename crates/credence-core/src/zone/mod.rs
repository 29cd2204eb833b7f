//! Reasoning-zone extraction
//!
//! Around a seed, grow the largest locally consistent cluster over support
//! edges, gating every candidate on safety (not violated, not retracted,
//! not overwhelmingly contradicted) and on contradiction-freeness against
//! the zone built so far. The finished zone gets an explicit boundary with
//! per-node exclusion reasons, a signed-cycle balance check, and a quality
//! score.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{CoreError, Result};
use crate::memory::{EdgeType, MemoryRecord, MemoryState};
use crate::propagation::effective_confidence;
use crate::storage::SqliteStore;

/// Default BFS depth
pub const DEFAULT_MAX_DEPTH: usize = 3;

/// Hard cap on BFS depth
pub const MAX_DEPTH_CAP: usize = 5;

/// Default zone size
pub const DEFAULT_MAX_SIZE: usize = 30;

/// Hard cap on zone size
pub const MAX_SIZE_CAP: usize = 100;

/// Zone size below which semantic expansion kicks in
const SEMANTIC_EXPANSION_THRESHOLD: usize = 5;

// ============================================================================
// PARAMETERS AND RESULTS
// ============================================================================

/// Zone extraction parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ZoneParams {
    /// Seed memory id; resolved from `query` when absent
    pub memory_id: Option<String>,
    /// Semantic seed query
    pub query: Option<String>,
    /// BFS depth bound (default 3, capped at 5)
    pub max_depth: Option<usize>,
    /// Zone size bound (default 30, capped at 100)
    pub max_size: Option<usize>,
    /// Support-edge floor (default: engine `min_edge_strength`)
    pub min_edge_strength: Option<f32>,
    /// Whether small zones may expand semantically
    pub include_semantic: Option<bool>,
}

impl ZoneParams {
    pub(crate) fn depth(&self) -> usize {
        self.max_depth.unwrap_or(DEFAULT_MAX_DEPTH).min(MAX_DEPTH_CAP)
    }

    pub(crate) fn size(&self) -> usize {
        self.max_size.unwrap_or(DEFAULT_MAX_SIZE).min(MAX_SIZE_CAP)
    }
}

/// One zone member
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneMember {
    /// Memory id
    pub id: String,
    /// Hop distance from the seed (0 for the seed and semantic members)
    pub depth: usize,
    /// Joined via semantic expansion rather than graph growth
    pub semantic: bool,
    /// Effective confidence used by the quality score
    pub confidence: f64,
}

/// A lightweight edge reference in zone output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneEdge {
    /// Source memory id
    pub source_id: String,
    /// Target memory id
    pub target_id: String,
    /// Edge type
    pub edge_type: EdgeType,
    /// Edge strength
    pub strength: f32,
}

/// An excluded node on the zone boundary, with its reasons
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundaryExclusion {
    /// The excluded memory id
    pub id: String,
    /// Why it is outside the zone
    pub reasons: Vec<String>,
}

/// Zone extraction result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneResult {
    /// The resolved seed
    pub seed_id: String,
    /// Zone members with confidence and provenance
    pub members: Vec<ZoneMember>,
    /// Excluded nodes with per-node reasons
    pub boundary: Vec<BoundaryExclusion>,
    /// Edges with both endpoints inside the zone
    pub internal_edges: Vec<ZoneEdge>,
    /// Contradiction edges crossing the boundary (cut-)
    pub cut_edges: Vec<ZoneEdge>,
    /// Support edges crossing the boundary (loss+)
    pub loss_edges: Vec<ZoneEdge>,
    /// Safety findings about the seed itself
    pub unsafe_reasons: Vec<String>,
    /// True when a Harary 2-coloring exists
    pub balanced: bool,
    /// An offending edge when the zone is imbalanced
    pub conflict_edge: Option<ZoneEdge>,
    /// Quality score in [0, 1]
    pub quality: f64,
}

// ============================================================================
// GATES
// ============================================================================

/// Safety-gate verdict for one candidate; `None` means safe
fn safety_reason(record: &MemoryRecord) -> Option<String> {
    if record.retracted {
        return Some("retracted".to_string());
    }
    if record.state == MemoryState::Violated {
        return Some("state is violated".to_string());
    }
    if record.is_resolved_incorrect() {
        return Some("resolved incorrect".to_string());
    }
    if record.is_overwhelmingly_violated() {
        return Some(format!(
            "overwhelmingly violated (survival {:.2})",
            record.survival_rate()
        ));
    }
    None
}

fn contradiction_reason(member_id: &str) -> String {
    format!("contradicts [{}] (violated_by)", member_id)
}

// ============================================================================
// EXTRACTION
// ============================================================================

/// Extract a locally consistent zone around `seed_id`
///
/// `semantic_candidates` are pre-resolved content-search hits (top-25 for
/// the request's query); they are only consulted when the grown zone is
/// smaller than the expansion threshold.
pub async fn extract_zone(
    store: &SqliteStore,
    config: &EngineConfig,
    max_times_tested: u32,
    seed_id: &str,
    params: &ZoneParams,
    semantic_candidates: &[String],
) -> Result<ZoneResult> {
    let seed = store
        .get_memory(seed_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(seed_id.to_string()))?;
    let min_strength = params
        .min_edge_strength
        .unwrap_or(config.min_edge_strength);
    let max_depth = params.depth();
    let max_size = params.size();

    // 1. Seed safety findings (recorded, not gating)
    let mut unsafe_reasons = vec![];
    if let Some(reason) = safety_reason(&seed) {
        unsafe_reasons.push(reason);
    }
    if !seed.violations.is_empty() && unsafe_reasons.is_empty() {
        unsafe_reasons.push(format!("{} recorded violations", seed.violations.len()));
    }

    let mut depth_of: HashMap<String, usize> = HashMap::from([(seed_id.to_string(), 0)]);
    let mut members: Vec<String> = vec![seed_id.to_string()];
    let mut member_set: HashSet<String> = HashSet::from([seed_id.to_string()]);
    let mut semantic_set: HashSet<String> = HashSet::new();
    let mut boundary: HashMap<String, Vec<String>> = HashMap::new();

    // 2. Gated BFS over support edges
    let mut frontier = vec![seed_id.to_string()];
    for depth in 1..=max_depth {
        if frontier.is_empty() || members.len() >= max_size {
            break;
        }
        let edges = store
            .list_edges_incident(&frontier, &EdgeType::SUPPORT, min_strength)
            .await?;
        let mut candidates: Vec<String> = vec![];
        for edge in &edges {
            for endpoint in [&edge.source_id, &edge.target_id] {
                if !member_set.contains(endpoint)
                    && !boundary.contains_key(endpoint)
                    && !candidates.contains(endpoint)
                {
                    candidates.push(endpoint.clone());
                }
            }
        }
        if candidates.is_empty() {
            break;
        }

        let records: HashMap<String, MemoryRecord> = store
            .list_by_ids(&candidates)
            .await?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        // Contradictions between any candidate and the zone so far
        let contra_edges = store
            .list_edges_incident(&candidates, &[EdgeType::ViolatedBy], 0.0)
            .await?;

        let mut next_frontier = vec![];
        for candidate in candidates {
            if members.len() >= max_size {
                break;
            }
            let Some(record) = records.get(&candidate) else {
                tracing::warn!(id = %candidate, "edge endpoint without a row, skipping");
                continue;
            };
            // a. Safety gate
            if let Some(reason) = safety_reason(record) {
                boundary.entry(candidate.clone()).or_default().push(reason);
                continue;
            }
            // b. Contradiction gate against current members
            let conflicting: Vec<String> = contra_edges
                .iter()
                .filter(|e| e.source_id == candidate || e.target_id == candidate)
                .filter_map(|e| e.other_endpoint(&candidate))
                .filter(|other| member_set.contains(*other))
                .map(|other| other.to_string())
                .collect();
            if !conflicting.is_empty() {
                let entry = boundary.entry(candidate.clone()).or_default();
                for member in conflicting {
                    entry.push(contradiction_reason(&member));
                }
                continue;
            }

            member_set.insert(candidate.clone());
            depth_of.insert(candidate.clone(), depth);
            members.push(candidate.clone());
            next_frontier.push(candidate);
        }
        frontier = next_frontier;
    }

    // 3. Semantic expansion for small zones
    let include_semantic = params.include_semantic.unwrap_or(true);
    if include_semantic
        && params.query.is_some()
        && members.len() < SEMANTIC_EXPANSION_THRESHOLD
        && !semantic_candidates.is_empty()
    {
        let fresh: Vec<String> = semantic_candidates
            .iter()
            .filter(|id| !member_set.contains(*id) && !boundary.contains_key(*id))
            .cloned()
            .collect();
        let records: HashMap<String, MemoryRecord> = store
            .list_by_ids(&fresh)
            .await?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        let contra_edges = if fresh.is_empty() {
            vec![]
        } else {
            store
                .list_edges_incident(&fresh, &[EdgeType::ViolatedBy], 0.0)
                .await?
        };

        for candidate in fresh {
            if members.len() >= max_size {
                break;
            }
            let Some(record) = records.get(&candidate) else { continue };
            if let Some(reason) = safety_reason(record) {
                boundary.entry(candidate.clone()).or_default().push(reason);
                continue;
            }
            let conflicting: Vec<String> = contra_edges
                .iter()
                .filter(|e| e.source_id == candidate || e.target_id == candidate)
                .filter_map(|e| e.other_endpoint(&candidate))
                .filter(|other| member_set.contains(*other))
                .map(|other| other.to_string())
                .collect();
            if !conflicting.is_empty() {
                let entry = boundary.entry(candidate.clone()).or_default();
                for member in conflicting {
                    entry.push(contradiction_reason(&member));
                }
                continue;
            }
            member_set.insert(candidate.clone());
            depth_of.insert(candidate.clone(), 0);
            semantic_set.insert(candidate.clone());
            members.push(candidate);
        }
    }

    // 4. Boundary completion: cut- and loss+ edges
    let contra_incident = store
        .list_edges_incident(&members, &[EdgeType::ViolatedBy], 0.0)
        .await?;
    let support_incident = store
        .list_edges_incident(&members, &EdgeType::SUPPORT, min_strength)
        .await?;

    let to_zone_edge = |e: &crate::memory::Edge| ZoneEdge {
        source_id: e.source_id.clone(),
        target_id: e.target_id.clone(),
        edge_type: e.edge_type,
        strength: e.strength,
    };

    let mut internal_edges = vec![];
    let mut cut_edges = vec![];
    for edge in &contra_incident {
        let inside = (member_set.contains(&edge.source_id) as u8)
            + (member_set.contains(&edge.target_id) as u8);
        match inside {
            2 => internal_edges.push(to_zone_edge(edge)),
            1 => {
                let (external, internal) = if member_set.contains(&edge.source_id) {
                    (&edge.target_id, &edge.source_id)
                } else {
                    (&edge.source_id, &edge.target_id)
                };
                boundary
                    .entry(external.clone())
                    .or_default()
                    .push(contradiction_reason(internal));
                cut_edges.push(to_zone_edge(edge));
            }
            _ => {}
        }
    }
    let mut loss_edges = vec![];
    for edge in &support_incident {
        let inside = (member_set.contains(&edge.source_id) as u8)
            + (member_set.contains(&edge.target_id) as u8);
        match inside {
            2 => internal_edges.push(to_zone_edge(edge)),
            1 => loss_edges.push(to_zone_edge(edge)),
            _ => {}
        }
    }

    // 5. Signed-cycle balance (Harary 2-coloring)
    let (balanced, conflict_edge) = two_color(&members, &internal_edges);

    // 6. Quality score
    let records: HashMap<String, MemoryRecord> = store
        .list_by_ids(&members)
        .await?
        .into_iter()
        .map(|r| (r.id.clone(), r))
        .collect();
    let zone_members: Vec<ZoneMember> = members
        .iter()
        .filter_map(|id| {
            records.get(id).map(|record| ZoneMember {
                id: id.clone(),
                depth: depth_of.get(id).copied().unwrap_or(0),
                semantic: semantic_set.contains(id),
                confidence: effective_confidence(record, max_times_tested),
            })
        })
        .collect();
    let size = zone_members.len().max(1) as f64;
    let mean_confidence =
        zone_members.iter().map(|m| m.confidence).sum::<f64>() / size;
    let quality = (mean_confidence
        - config.quality_lambda * cut_edges.len() as f64 / size
        - config.quality_rho * loss_edges.len() as f64 / size)
        .clamp(0.0, 1.0);

    let mut boundary: Vec<BoundaryExclusion> = boundary
        .into_iter()
        .map(|(id, mut reasons)| {
            reasons.dedup();
            BoundaryExclusion { id, reasons }
        })
        .collect();
    boundary.sort_by(|a, b| a.id.cmp(&b.id));

    Ok(ZoneResult {
        seed_id: seed_id.to_string(),
        members: zone_members,
        boundary,
        internal_edges,
        cut_edges,
        loss_edges,
        unsafe_reasons,
        balanced,
        conflict_edge,
        quality,
    })
}

/// Harary 2-coloring over the zone's internal signed edges
///
/// Support edges must connect same-colored nodes, contradiction edges
/// opposite-colored. Returns the offending edge when no coloring exists.
fn two_color(members: &[String], internal_edges: &[ZoneEdge]) -> (bool, Option<ZoneEdge>) {
    let mut adjacency: HashMap<&str, Vec<(&ZoneEdge, &str)>> = HashMap::new();
    for edge in internal_edges {
        adjacency
            .entry(edge.source_id.as_str())
            .or_default()
            .push((edge, edge.target_id.as_str()));
        adjacency
            .entry(edge.target_id.as_str())
            .or_default()
            .push((edge, edge.source_id.as_str()));
    }

    let mut color: HashMap<&str, bool> = HashMap::new();
    for start in members {
        if color.contains_key(start.as_str()) {
            continue;
        }
        color.insert(start.as_str(), false);
        let mut queue = VecDeque::from([start.as_str()]);
        while let Some(node) = queue.pop_front() {
            let own = color[node];
            let Some(neighbours) = adjacency.get(node) else { continue };
            for (edge, other) in neighbours {
                let expected = if edge.edge_type.is_contradiction() {
                    !own
                } else {
                    own
                };
                match color.get(other) {
                    Some(&c) if c != expected => return (false, Some((*edge).clone())),
                    Some(_) => {}
                    None => {
                        color.insert(other, expected);
                        queue.push_back(other);
                    }
                }
            }
        }
    }
    (true, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRecord;

    fn thought(id: &str) -> MemoryRecord {
        MemoryRecord {
            id: id.to_string(),
            content: format!("thought {}", id),
            derived_from: vec![],
            starting_confidence: 0.5,
            ..Default::default()
        }
    }

    async fn store_with(nodes: &[&str]) -> SqliteStore {
        let store = SqliteStore::in_memory().unwrap();
        for id in nodes {
            store.put_memory(&thought(id)).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_zone_grows_over_support_and_reports_cut() {
        // B supports A; C contradicts A from outside
        let store = store_with(&["a", "b", "c"]).await;
        store
            .upsert_edge("b", "a", EdgeType::DerivedFrom, 1.0)
            .await
            .unwrap();
        store
            .upsert_edge("c", "a", EdgeType::ViolatedBy, 1.0)
            .await
            .unwrap();

        let zone = extract_zone(
            &store,
            &EngineConfig::default(),
            0,
            "b",
            &ZoneParams::default(),
            &[],
        )
        .await
        .unwrap();

        let ids: HashSet<&str> = zone.members.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, HashSet::from(["a", "b"]));
        assert_eq!(zone.cut_edges.len(), 1);
        assert!(zone.loss_edges.is_empty());
        assert!(zone.unsafe_reasons.is_empty());
        assert!(zone.balanced);
        assert!(zone.quality > 0.0 && zone.quality < 1.0);

        let c_entry = zone.boundary.iter().find(|b| b.id == "c").unwrap();
        assert_eq!(c_entry.reasons, vec!["contradicts [a] (violated_by)"]);
    }

    #[tokio::test]
    async fn test_safety_gate_excludes_violated_candidates() {
        let store = store_with(&["seed"]).await;
        let mut bad = thought("bad");
        bad.state = MemoryState::Violated;
        store.put_memory(&bad).await.unwrap();
        store
            .upsert_edge("seed", "bad", EdgeType::DerivedFrom, 1.0)
            .await
            .unwrap();

        let zone = extract_zone(
            &store,
            &EngineConfig::default(),
            0,
            "seed",
            &ZoneParams::default(),
            &[],
        )
        .await
        .unwrap();

        assert_eq!(zone.members.len(), 1);
        let entry = zone.boundary.iter().find(|b| b.id == "bad").unwrap();
        assert_eq!(entry.reasons, vec!["state is violated"]);
    }

    #[tokio::test]
    async fn test_contradiction_gate_keeps_zone_consistent() {
        // seed supports x and y, but y contradicts x
        let store = store_with(&["seed", "x", "y"]).await;
        store
            .upsert_edge("seed", "x", EdgeType::DerivedFrom, 1.0)
            .await
            .unwrap();
        store
            .upsert_edge("seed", "y", EdgeType::DerivedFrom, 0.9)
            .await
            .unwrap();
        store
            .upsert_edge("y", "x", EdgeType::ViolatedBy, 1.0)
            .await
            .unwrap();

        let zone = extract_zone(
            &store,
            &EngineConfig::default(),
            0,
            "seed",
            &ZoneParams::default(),
            &[],
        )
        .await
        .unwrap();

        // One of x/y joined first and gated the other out
        assert_eq!(zone.members.len(), 2);
        assert_eq!(zone.boundary.len(), 1);
        let excluded = &zone.boundary[0];
        assert!(excluded.reasons[0].starts_with("contradicts ["));
        assert_eq!(zone.cut_edges.len(), 1);
    }

    #[tokio::test]
    async fn test_max_size_and_depth_are_never_exceeded() {
        let store = SqliteStore::in_memory().unwrap();
        store.put_memory(&thought("seed")).await.unwrap();
        // A 10-node chain off the seed
        let mut previous = "seed".to_string();
        for i in 0..10 {
            let id = format!("n{}", i);
            store.put_memory(&thought(&id)).await.unwrap();
            store
                .upsert_edge(&previous, &id, EdgeType::DerivedFrom, 1.0)
                .await
                .unwrap();
            previous = id;
        }

        let params = ZoneParams {
            max_depth: Some(2),
            max_size: Some(2),
            ..Default::default()
        };
        let zone = extract_zone(&store, &EngineConfig::default(), 0, "seed", &params, &[])
            .await
            .unwrap();
        assert!(zone.members.len() <= 2);
        assert!(zone.members.iter().all(|m| m.depth <= 2));

        // Depth param is capped at the hard limit
        let wild = ZoneParams {
            max_depth: Some(50),
            ..Default::default()
        };
        assert_eq!(wild.depth(), MAX_DEPTH_CAP);
        let oversized = ZoneParams {
            max_size: Some(5000),
            ..Default::default()
        };
        assert_eq!(oversized.size(), MAX_SIZE_CAP);
    }

    #[tokio::test]
    async fn test_semantic_expansion_marks_members() {
        let store = store_with(&["seed", "sem1", "sem2"]).await;
        let params = ZoneParams {
            query: Some("anything".to_string()),
            ..Default::default()
        };
        let zone = extract_zone(
            &store,
            &EngineConfig::default(),
            0,
            "seed",
            &params,
            &["sem1".to_string(), "sem2".to_string()],
        )
        .await
        .unwrap();

        let semantic: Vec<&ZoneMember> =
            zone.members.iter().filter(|m| m.semantic).collect();
        assert_eq!(semantic.len(), 2);
        // Graph-grown seed is not semantic
        assert!(!zone.members.iter().find(|m| m.id == "seed").unwrap().semantic);
    }

    fn zone_edge(source: &str, target: &str, edge_type: EdgeType) -> ZoneEdge {
        ZoneEdge {
            source_id: source.to_string(),
            target_id: target.to_string(),
            edge_type,
            strength: 1.0,
        }
    }

    #[test]
    fn test_two_coloring_accepts_balanced_structures() {
        let members: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        // Two camps: {a, b} supports within, contradictions across
        let edges = vec![
            zone_edge("a", "b", EdgeType::DerivedFrom),
            zone_edge("c", "d", EdgeType::ConfirmedBy),
            zone_edge("a", "c", EdgeType::ViolatedBy),
            zone_edge("b", "d", EdgeType::ViolatedBy),
        ];
        let (balanced, conflict) = two_color(&members, &edges);
        assert!(balanced);
        assert!(conflict.is_none());
    }

    #[test]
    fn test_two_coloring_rejects_odd_contradiction_cycle() {
        let members: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        // a ~ b, b ~ c (support), but c contradicts a: no valid coloring
        let edges = vec![
            zone_edge("a", "b", EdgeType::DerivedFrom),
            zone_edge("b", "c", EdgeType::DerivedFrom),
            zone_edge("c", "a", EdgeType::ViolatedBy),
        ];
        let (balanced, conflict) = two_color(&members, &edges);
        assert!(!balanced);
        assert!(conflict.is_some());
    }

    #[test]
    fn test_two_coloring_rejects_mutual_contradiction_pair_with_support() {
        let members: Vec<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        // Simultaneous support and contradiction between the same pair
        let edges = vec![
            zone_edge("a", "b", EdgeType::DerivedFrom),
            zone_edge("b", "a", EdgeType::ViolatedBy),
        ];
        let (balanced, conflict) = two_color(&members, &edges);
        assert!(!balanced);
        assert_eq!(conflict.unwrap().edge_type, EdgeType::ViolatedBy);
    }

    #[tokio::test]
    async fn test_missing_seed_is_not_found() {
        let store = store_with(&[]).await;
        let err = extract_zone(
            &store,
            &EngineConfig::default(),
            0,
            "ghost",
            &ZoneParams::default(),
            &[],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
