//! Memory events - the per-session significant-event queue
//!
//! Append-only rows with a dispatched bit. Delivery is at-least-once per
//! session; every consumer must be idempotent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::DamageLevel;

// ============================================================================
// EVENT TYPES
// ============================================================================

/// Kind of significant event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A condition was judged violated
    Violation,
    /// A time-bound belief auto-confirmed
    PredictionConfirmed,
    /// A positive cascade effect is queued for the dispatcher
    CascadeBoost,
    /// A negative cascade effect is queued for the dispatcher
    CascadeDamage,
    /// A memory was resolved
    Resolution,
    /// A newly ingested memory awaits its exposure check
    ExposureCheck,
}

impl EventType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Violation => "violation",
            EventType::PredictionConfirmed => "prediction_confirmed",
            EventType::CascadeBoost => "cascade_boost",
            EventType::CascadeDamage => "cascade_damage",
            EventType::Resolution => "resolution",
            EventType::ExposureCheck => "exposure_check",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "violation" => Some(EventType::Violation),
            "prediction_confirmed" => Some(EventType::PredictionConfirmed),
            "cascade_boost" => Some(EventType::CascadeBoost),
            "cascade_damage" => Some(EventType::CascadeDamage),
            "resolution" => Some(EventType::Resolution),
            "exposure_check" => Some(EventType::ExposureCheck),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// EVENT
// ============================================================================

/// One queued event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEvent {
    /// Unique event id
    pub id: String,
    /// Queue partition; dispatch is single-consumer per session
    pub session_id: String,
    /// Kind of event
    pub event_type: EventType,
    /// The memory the event is about
    pub memory_id: String,
    /// Violating observation, for violation events
    pub violated_by: Option<String>,
    /// Damage level, for violation and cascade events
    pub damage_level: Option<DamageLevel>,
    /// Free-form JSON context for the dispatcher
    pub context: serde_json::Value,
    /// Queue ordering key
    pub created_at: DateTime<Utc>,
    /// Whether a consumer has claimed this event
    pub dispatched: bool,
    /// When it was claimed
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl MemoryEvent {
    /// Create an undispatched event with a fresh id
    pub fn new(
        session_id: impl Into<String>,
        event_type: EventType,
        memory_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            event_type,
            memory_id: memory_id.into(),
            violated_by: None,
            damage_level: None,
            context: serde_json::Value::Null,
            created_at: Utc::now(),
            dispatched: false,
            dispatched_at: None,
        }
    }

    /// Builder-style violating-observation setter
    pub fn with_violated_by(mut self, obs_id: impl Into<String>) -> Self {
        self.violated_by = Some(obs_id.into());
        self
    }

    /// Builder-style damage-level setter
    pub fn with_damage(mut self, level: DamageLevel) -> Self {
        self.damage_level = Some(level);
        self
    }

    /// Builder-style context setter
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}
