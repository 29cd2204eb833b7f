//! Test engine harness
//!
//! Stands up a [`BeliefEngine`] on a temporary database file with scripted
//! providers. The temp directory lives as long as the harness, so each
//! test gets an isolated store that is removed on drop.

use std::path::PathBuf;
use std::sync::Arc;

use credence_core::{
    BeliefEngine, EngineConfig, IndexSet, MemoryRequest, SqliteStore,
};
use tempfile::TempDir;

use crate::mocks::{MockEmbedder, MockJudge};

/// A fully wired engine over scripted providers
pub struct TestEngine {
    /// The engine under test
    pub engine: BeliefEngine,
    /// Direct store access for assertions
    pub store: Arc<SqliteStore>,
    /// The three in-process vector indexes
    pub indexes: IndexSet,
    /// Scripted embedder (pin texts to axes)
    pub embedder: Arc<MockEmbedder>,
    /// Scripted judge (queue verdicts)
    pub judge: Arc<MockJudge>,
    /// Database path, for reopen tests
    pub db_path: PathBuf,
    _temp_dir: TempDir,
}

impl TestEngine {
    /// Engine with default configuration on a fresh temp database
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Engine with a custom configuration
    pub fn with_config(config: EngineConfig) -> Self {
        let temp_dir = TempDir::new().expect("temp dir");
        let db_path = temp_dir.path().join("credence-e2e.db");
        let store = Arc::new(SqliteStore::new(Some(db_path.clone())).expect("store"));
        let indexes = IndexSet::in_memory();
        let embedder = Arc::new(MockEmbedder::new());
        let judge = Arc::new(MockJudge::quiet());
        let engine = BeliefEngine::new(
            store.clone(),
            indexes.clone(),
            embedder.clone(),
            judge.clone(),
            config,
        );
        Self {
            engine,
            store,
            indexes,
            embedder,
            judge,
            db_path,
            _temp_dir: temp_dir,
        }
    }

    /// Ingest an observation with the given content
    pub async fn observe(&self, session: &str, content: &str) -> credence_core::IngestOutcome {
        self.engine
            .ingest(
                MemoryRequest {
                    content: content.to_string(),
                    source: Some("market".to_string()),
                    ..Default::default()
                },
                session,
                &format!("req-{}", uuid::Uuid::new_v4().simple()),
            )
            .await
            .expect("observation ingest")
    }

    /// Ingest a thought derived from the given parents
    pub async fn think(
        &self,
        session: &str,
        content: &str,
        derived_from: Vec<String>,
    ) -> credence_core::IngestOutcome {
        self.engine
            .ingest(
                MemoryRequest {
                    content: content.to_string(),
                    derived_from,
                    ..Default::default()
                },
                session,
                &format!("req-{}", uuid::Uuid::new_v4().simple()),
            )
            .await
            .expect("thought ingest")
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}
