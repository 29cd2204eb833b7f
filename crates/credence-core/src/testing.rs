//! Shared scripted providers for unit tests

use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::oracle::{ChatProvider, EmbeddingProvider, OracleGateway};
use crate::storage::EMBEDDING_DIMENSIONS;

/// Deterministic embedder: same text, same vector; different texts land on
/// (nearly always) orthogonal axes. Specific texts can be pinned to a
/// preset vector to script similarity.
pub struct HashEmbedder {
    presets: Mutex<HashMap<String, Vec<f32>>>,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self {
            presets: Mutex::new(HashMap::new()),
        }
    }

    /// Pin a text to an exact vector
    pub fn preset(&self, text: &str, vector: Vec<f32>) {
        self.presets
            .lock()
            .unwrap()
            .insert(text.to_string(), vector);
    }

    /// The vector this embedder will produce for a text
    pub fn vector_for(text: &str) -> Vec<f32> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        text.hash(&mut hasher);
        let hot = (hasher.finish() as usize) % EMBEDDING_DIMENSIONS;
        let mut v = vec![0.0f32; EMBEDDING_DIMENSIONS];
        v[hot] = 1.0;
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(preset) = self.presets.lock().unwrap().get(text) {
            return Ok(preset.clone());
        }
        Ok(Self::vector_for(text))
    }
}

/// Chat provider with a scripted judge-answer queue and a fixed
/// completeness answer; routing keys off the system prompt.
pub struct ScriptedChat {
    judge_answers: Mutex<VecDeque<String>>,
    judge_default: String,
    completeness_answer: String,
}

impl ScriptedChat {
    /// All judge calls answer non-match, completeness finds nothing
    pub fn quiet() -> Self {
        Self {
            judge_answers: Mutex::new(VecDeque::new()),
            judge_default: r#"{"matches": false, "confidence": 0.0, "reasoning": "no"}"#
                .to_string(),
            completeness_answer: r#"{"warnings": []}"#.to_string(),
        }
    }

    /// Queue one judge answer (consumed in call order)
    pub fn push_judge(&self, answer: &str) {
        self.judge_answers
            .lock()
            .unwrap()
            .push_back(answer.to_string());
    }

    /// Replace the default judge answer
    pub fn with_judge_default(mut self, answer: &str) -> Self {
        self.judge_default = answer.to_string();
        self
    }

    /// Replace the completeness answer
    pub fn with_completeness(mut self, answer: &str) -> Self {
        self.completeness_answer = answer.to_string();
        self
    }
}

#[async_trait]
impl ChatProvider for ScriptedChat {
    async fn complete(&self, system: &str, _user: &str) -> Result<String> {
        if system.contains("review new memory submissions") {
            return Ok(self.completeness_answer.clone());
        }
        let queued = self.judge_answers.lock().unwrap().pop_front();
        Ok(queued.unwrap_or_else(|| self.judge_default.clone()))
    }
}

/// A quiet gateway over scripted providers
pub fn scripted_gateway(chat: Arc<ScriptedChat>) -> Arc<OracleGateway> {
    Arc::new(OracleGateway::new(
        Arc::new(HashEmbedder::new()),
        chat,
        &EngineConfig::default(),
    ))
}

/// Everything a component test needs, with handles kept for scripting
pub struct TestRig {
    pub store: Arc<crate::storage::SqliteStore>,
    pub indexes: crate::storage::IndexSet,
    pub oracle: Arc<OracleGateway>,
    pub embedder: Arc<HashEmbedder>,
    pub chat: Arc<ScriptedChat>,
    pub config: EngineConfig,
    pub gauge: Arc<crate::propagation::TestedGauge>,
}

impl TestRig {
    pub fn new() -> Self {
        Self::with_chat(ScriptedChat::quiet())
    }

    pub fn with_chat(chat: ScriptedChat) -> Self {
        let embedder = Arc::new(HashEmbedder::new());
        let chat = Arc::new(chat);
        let config = EngineConfig::default();
        let oracle = Arc::new(OracleGateway::new(embedder.clone(), chat.clone(), &config));
        Self {
            store: Arc::new(crate::storage::SqliteStore::in_memory().unwrap()),
            indexes: crate::storage::IndexSet::in_memory(),
            oracle,
            embedder,
            chat,
            config,
            gauge: Arc::new(crate::propagation::TestedGauge::new()),
        }
    }

    pub fn pipeline(&self) -> crate::ingest::IngestPipeline {
        crate::ingest::IngestPipeline::new(
            self.store.clone(),
            self.indexes.clone(),
            self.oracle.clone(),
            self.config.clone(),
            self.gauge.clone(),
        )
    }
}

/// A judge answer JSON
pub fn judge_match(confidence: f32) -> String {
    format!(
        r#"{{"matches": true, "confidence": {}, "reasoning": "scripted match"}}"#,
        confidence
    )
}
