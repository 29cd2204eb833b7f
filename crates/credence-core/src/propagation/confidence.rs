//! Confidence scalars
//!
//! Every node carries two scalars: a *local* confidence blending its
//! starting confidence with its empirical survival record, and a
//! *propagated* confidence written by the shock and whole-graph passes.
//! The blend weight grows logarithmically with how often the memory has
//! been tested, normalised against the process-wide `max_times_tested`
//! gauge.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{CoreError, Result};
use crate::memory::MemoryRecord;
use crate::storage::SqliteStore;

/// How long a gauge snapshot stays fresh
const GAUGE_REFRESH: Duration = Duration::from_secs(60);

// ============================================================================
// LOCAL CONFIDENCE
// ============================================================================

/// Local confidence of a record
///
/// `sc * (1 - w) + survival * w` where `w = ln(tt + 1) / ln(MAX + 1)`.
/// An untested graph (`MAX = 0`) keeps every node at its starting
/// confidence.
pub fn local_confidence(record: &MemoryRecord, max_times_tested: u32) -> f64 {
    let tt = f64::from(record.times_tested);
    let max = f64::from(max_times_tested);
    let w = if max_times_tested == 0 {
        0.0
    } else {
        ((tt + 1.0).ln() / (max + 1.0).ln()).clamp(0.0, 1.0)
    };
    (record.starting_confidence * (1.0 - w) + record.survival_rate() * w).clamp(0.0, 1.0)
}

/// Propagated confidence when set, local otherwise
///
/// Observations anchor at their starting confidence; their propagated
/// value is never written.
pub fn effective_confidence(record: &MemoryRecord, max_times_tested: u32) -> f64 {
    if record.is_observation() {
        return record.starting_confidence;
    }
    record
        .propagated_confidence
        .unwrap_or_else(|| local_confidence(record, max_times_tested))
}

// ============================================================================
// GAUGE
// ============================================================================

/// Process-wide `max_times_tested` snapshot, refreshed at most once a minute
pub struct TestedGauge {
    inner: Mutex<GaugeState>,
}

struct GaugeState {
    value: u32,
    refreshed_at: Option<Instant>,
}

impl TestedGauge {
    /// Create an unrefreshed gauge
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GaugeState {
                value: 0,
                refreshed_at: None,
            }),
        }
    }

    /// Current snapshot, refreshing from the store when stale
    pub async fn get(&self, store: &SqliteStore) -> Result<u32> {
        {
            let state = self
                .inner
                .lock()
                .map_err(|_| CoreError::Init("gauge lock poisoned".to_string()))?;
            if let Some(at) = state.refreshed_at {
                if at.elapsed() < GAUGE_REFRESH {
                    return Ok(state.value);
                }
            }
        }
        let fresh = store.max_times_tested().await?;
        let mut state = self
            .inner
            .lock()
            .map_err(|_| CoreError::Init("gauge lock poisoned".to_string()))?;
        state.value = fresh;
        state.refreshed_at = Some(Instant::now());
        Ok(state.value)
    }
}

impl Default for TestedGauge {
    fn default() -> Self {
        Self::new()
    }
}
