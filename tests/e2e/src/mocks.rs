//! Scripted oracle providers
//!
//! The embedder maps each text onto a deterministic axis (pinnable per
//! text to script similarity); the chat provider answers judge calls from
//! a queue and completeness calls with a fixed answer.

use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use async_trait::async_trait;
use credence_core::{ChatProvider, EmbeddingProvider, Result, EMBEDDING_DIMENSIONS};

/// A one-hot vector on the given axis
pub fn axis(hot: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBEDDING_DIMENSIONS];
    v[hot % EMBEDDING_DIMENSIONS] = 1.0;
    v
}

/// A judge answer accepting the match at the given confidence
pub fn judge_match(confidence: f32) -> String {
    format!(
        r#"{{"matches": true, "confidence": {}, "reasoning": "scripted match"}}"#,
        confidence
    )
}

/// Deterministic embedder with per-text pinning
pub struct MockEmbedder {
    presets: Mutex<HashMap<String, Vec<f32>>>,
}

impl MockEmbedder {
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
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(preset) = self.presets.lock().unwrap().get(text) {
            return Ok(preset.clone());
        }
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        text.hash(&mut hasher);
        Ok(axis(hasher.finish() as usize))
    }
}

/// Chat provider with a scripted judge queue
pub struct MockJudge {
    judge_answers: Mutex<VecDeque<String>>,
    completeness_answer: Mutex<String>,
}

impl MockJudge {
    /// Judge answers non-match by default; completeness finds nothing
    pub fn quiet() -> Self {
        Self {
            judge_answers: Mutex::new(VecDeque::new()),
            completeness_answer: Mutex::new(r#"{"warnings": []}"#.to_string()),
        }
    }

    /// Queue one judge answer, consumed in call order
    pub fn push_judge(&self, answer: &str) {
        self.judge_answers
            .lock()
            .unwrap()
            .push_back(answer.to_string());
    }

    /// Script the completeness oracle
    pub fn set_completeness(&self, answer: &str) {
        *self.completeness_answer.lock().unwrap() = answer.to_string();
    }
}

#[async_trait]
impl ChatProvider for MockJudge {
    async fn complete(&self, system: &str, _user: &str) -> Result<String> {
        if system.contains("review new memory submissions") {
            return Ok(self.completeness_answer.lock().unwrap().clone());
        }
        Ok(self
            .judge_answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                r#"{"matches": false, "confidence": 0.0, "reasoning": "default"}"#.to_string()
            }))
    }
}
