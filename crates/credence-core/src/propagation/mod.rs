//! Propagation module - confidence under streaming evidence
//!
//! Two paths share one update rule: the local shock after a violation or
//! resolution, and the periodic whole-graph relaxation.

mod confidence;
mod graph;
mod shock;

pub use confidence::{effective_confidence, local_confidence, TestedGauge};
pub use graph::{run_full_propagation, PropagationReport};
pub use shock::{propagate_shock, ShockKind, ShockResult};
