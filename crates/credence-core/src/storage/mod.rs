//! Storage module - row store and vector indexes
//!
//! The row store owns every memory, edge, and event; other components
//! borrow them by id. Vector indexes sit behind a driver trait with an
//! exact-cosine in-process default.

pub mod migrations;
mod sqlite;
mod vector;

pub use sqlite::{SqliteStore, MAX_BIND_PARAMS};
pub use vector::{
    confirms_vector_id, cosine_similarity, invalidates_vector_id, IndexSet,
    MemoryVectorIndex, VectorFilter, VectorIndex, VectorMatch, VectorMetadata, VectorRecord,
    EMBEDDING_DIMENSIONS,
};
