//! End-to-end test support for the belief engine
//!
//! The harness stands up a real engine on a temporary database with
//! scripted oracle providers, so scenarios exercise the full ingest ->
//! exposure -> cascade -> resolution path without a model in the loop.

pub mod harness;
pub mod mocks;
