//! Summary statistics over the belief graph

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::SqliteStore;

/// Survival-rate robustness bands among non-retracted memories
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RobustnessTiers {
    /// Never tested
    pub untested: i64,
    /// Tested with survival below 0.5
    pub fragile: i64,
    /// Survival in [0.5, 0.8)
    pub contested: i64,
    /// Survival at or above 0.8
    pub robust: i64,
}

/// Engine-wide summary counts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    /// All non-retracted memories
    pub total: i64,
    /// Counts per state
    pub by_state: BTreeMap<String, i64>,
    /// Memories with at least one recorded violation
    pub with_violations: i64,
    /// Memories with none
    pub without_violations: i64,
    /// Robustness banding
    pub robustness: RobustnessTiers,
}

/// Collect the summary in a handful of aggregate queries
pub async fn collect_stats(store: &SqliteStore) -> Result<EngineStats> {
    let by_state_rows = store.count_by_state().await?;
    let (with_violations, without_violations) = store.violation_presence_counts().await?;
    let (untested, fragile, contested, robust) = store.robustness_tier_counts().await?;

    let mut by_state = BTreeMap::new();
    let mut total = 0;
    for (state, count) in by_state_rows {
        total += count;
        by_state.insert(state.as_str().to_string(), count);
    }

    Ok(EngineStats {
        total,
        by_state,
        with_violations,
        without_violations,
        robustness: RobustnessTiers {
            untested,
            fragile,
            contested,
            robust,
        },
    })
}
