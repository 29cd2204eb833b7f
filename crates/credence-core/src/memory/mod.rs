//! Memory module - core types of the belief graph
//!
//! One record shape for every memory; kind is a predicate over fields.
//! Edges are a small tagged enum; events are append-only queue rows.

mod edge;
mod event;
mod record;

pub use edge::{Edge, EdgeType};
pub use event::{EventType, MemoryEvent};
pub use record::{
    DamageLevel, ExposureStatus, MemoryKind, MemoryRecord, MemoryRequest, MemoryState, Outcome,
    SourceKind, ViolationOrigin, ViolationRecord,
};
