//! Embedding + judge gateway
//!
//! The single funnel for every model call the engine makes. Adds, on top of
//! whatever providers are plugged in: bounded concurrency (one semaphore per
//! operation kind), per-call deadlines, a two-retry budget, an LRU cache in
//! front of `embed`, and the safe-default degradation for unparseable judge
//! answers.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::config::EngineConfig;
use crate::error::{CoreError, Result};
use crate::storage::EMBEDDING_DIMENSIONS;

use super::judge::{
    build_completeness_prompt, build_judge_prompt, parse_verdict, parse_warnings,
    JudgeKind, JudgeVerdict, COMPLETENESS_SYSTEM_PROMPT, JUDGE_SYSTEM_PROMPT,
};

/// Deadline on one judge call
pub const JUDGE_DEADLINE: Duration = Duration::from_secs(30);

/// Deadline on one embedding call
pub const EMBED_DEADLINE: Duration = Duration::from_secs(10);

/// Retries after the first attempt, both ops
const ORACLE_RETRIES: u32 = 2;

/// Embedding cache capacity (texts)
const EMBED_CACHE_CAPACITY: usize = 256;

// ============================================================================
// PROVIDER TRAITS
// ============================================================================

/// External embedding provider
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed one text into a 768-dim vector
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// External chat-completion provider
///
/// Both the in-cluster model and any secondary endpoint implement this; the
/// verdict format lives entirely on this side of the boundary so providers
/// cannot diverge.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// One system+user exchange, returning raw model text
    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

// ============================================================================
// GATEWAY
// ============================================================================

/// Gateway in front of the embedding and chat providers
pub struct OracleGateway {
    embedder: Arc<dyn EmbeddingProvider>,
    chat: Arc<dyn ChatProvider>,
    judge_slots: Arc<Semaphore>,
    embed_slots: Arc<Semaphore>,
    embed_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl OracleGateway {
    /// Build a gateway over the given providers
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        chat: Arc<dyn ChatProvider>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            embedder,
            chat,
            judge_slots: Arc::new(Semaphore::new(config.judge_concurrency)),
            embed_slots: Arc::new(Semaphore::new(config.embed_concurrency)),
            embed_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(EMBED_CACHE_CAPACITY).expect("capacity is non-zero"),
            )),
        }
    }

    /// Embed a text, going through the cache, a concurrency slot, the
    /// deadline, and the retry budget.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Ok(mut cache) = self.embed_cache.lock() {
            if let Some(vector) = cache.get(text) {
                return Ok(vector.clone());
            }
        }

        let _permit = self
            .embed_slots
            .acquire()
            .await
            .map_err(|_| CoreError::Init("embed semaphore closed".to_string()))?;

        let mut last_err = None;
        for attempt in 0..=ORACLE_RETRIES {
            match timeout(EMBED_DEADLINE, self.embedder.embed(text)).await {
                Ok(Ok(vector)) => {
                    if vector.len() != EMBEDDING_DIMENSIONS {
                        return Err(CoreError::OracleUnavailable(format!(
                            "embedding has {} dimensions, expected {}",
                            vector.len(),
                            EMBEDDING_DIMENSIONS
                        )));
                    }
                    if let Ok(mut cache) = self.embed_cache.lock() {
                        cache.put(text.to_string(), vector.clone());
                    }
                    return Ok(vector);
                }
                Ok(Err(err)) => {
                    tracing::warn!(attempt, "embedding call failed: {}", err);
                    last_err = Some(err.to_string());
                }
                Err(_) => {
                    tracing::warn!(attempt, "embedding call exceeded {:?}", EMBED_DEADLINE);
                    last_err = Some("deadline exceeded".to_string());
                }
            }
        }
        Err(CoreError::OracleUnavailable(format!(
            "embed failed after {} attempts: {}",
            ORACLE_RETRIES + 1,
            last_err.unwrap_or_default()
        )))
    }

    /// Ask the judge one structured question
    ///
    /// Unreachable provider => `OracleUnavailable` (callers degrade to
    /// non-match). Reachable but unparseable => the safe default verdict,
    /// logged here.
    pub async fn judge(
        &self,
        kind: JudgeKind,
        subject: &str,
        condition: &str,
        claim: &str,
    ) -> Result<JudgeVerdict> {
        let _permit = self
            .judge_slots
            .acquire()
            .await
            .map_err(|_| CoreError::Init("judge semaphore closed".to_string()))?;

        let prompt = build_judge_prompt(kind, subject, condition, claim);
        let mut last_err = None;
        for attempt in 0..=ORACLE_RETRIES {
            match timeout(JUDGE_DEADLINE, self.chat.complete(JUDGE_SYSTEM_PROMPT, &prompt)).await {
                Ok(Ok(text)) => {
                    return Ok(parse_verdict(&text).unwrap_or_else(|| {
                        tracing::warn!(
                            kind = kind.as_str(),
                            "judge answer was not parseable JSON, treating as non-match"
                        );
                        JudgeVerdict::non_match()
                    }));
                }
                Ok(Err(err)) => {
                    tracing::warn!(attempt, kind = kind.as_str(), "judge call failed: {}", err);
                    last_err = Some(err.to_string());
                }
                Err(_) => {
                    tracing::warn!(
                        attempt,
                        kind = kind.as_str(),
                        "judge call exceeded {:?}",
                        JUDGE_DEADLINE
                    );
                    last_err = Some("deadline exceeded".to_string());
                }
            }
        }
        Err(CoreError::OracleUnavailable(format!(
            "judge failed after {} attempts: {}",
            ORACLE_RETRIES + 1,
            last_err.unwrap_or_default()
        )))
    }

    /// Advisory completeness check; every failure is swallowed
    pub async fn completeness(
        &self,
        content: &str,
        kind: &str,
        has_invalidates: bool,
        has_confirms: bool,
    ) -> Vec<String> {
        let permit = match self.judge_slots.acquire().await {
            Ok(p) => p,
            Err(_) => return vec![],
        };
        let prompt = build_completeness_prompt(content, kind, has_invalidates, has_confirms);
        let outcome = timeout(
            JUDGE_DEADLINE,
            self.chat.complete(COMPLETENESS_SYSTEM_PROMPT, &prompt),
        )
        .await;
        drop(permit);

        match outcome {
            Ok(Ok(text)) => parse_warnings(&text).unwrap_or_default(),
            Ok(Err(err)) => {
                tracing::warn!("completeness oracle failed (ignored): {}", err);
                vec![]
            }
            Err(_) => {
                tracing::warn!("completeness oracle timed out (ignored)");
                vec![]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedEmbedder {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl EmbeddingProvider for FixedEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(CoreError::OracleUnavailable("flaky".to_string()));
            }
            let mut v = vec![0.0f32; EMBEDDING_DIMENSIONS];
            v[0] = text.len() as f32;
            Ok(v)
        }
    }

    struct FixedChat {
        answer: String,
    }

    #[async_trait]
    impl ChatProvider for FixedChat {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
            Ok(self.answer.clone())
        }
    }

    fn gateway(fail_first: usize, answer: &str) -> (OracleGateway, Arc<FixedEmbedder>) {
        let embedder = Arc::new(FixedEmbedder {
            calls: AtomicUsize::new(0),
            fail_first,
        });
        let gateway = OracleGateway::new(
            embedder.clone(),
            Arc::new(FixedChat {
                answer: answer.to_string(),
            }),
            &EngineConfig::default(),
        );
        (gateway, embedder)
    }

    #[tokio::test]
    async fn test_embed_retries_then_succeeds() {
        let (gateway, embedder) = gateway(2, "{}");
        let vector = gateway.embed("hello").await.unwrap();
        assert_eq!(vector.len(), EMBEDDING_DIMENSIONS);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_embed_exhausts_retry_budget() {
        let (gateway, embedder) = gateway(10, "{}");
        let err = gateway.embed("hello").await.unwrap_err();
        assert!(matches!(err, CoreError::OracleUnavailable(_)));
        // First attempt plus two retries
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_embed_cache_hits_skip_provider() {
        let (gateway, embedder) = gateway(0, "{}");
        gateway.embed("same text").await.unwrap();
        gateway.embed("same text").await.unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_judge_parses_verdict() {
        let (gateway, _) = gateway(
            0,
            r#"{"matches": true, "confidence": 0.88, "reasoning": "clear match"}"#,
        );
        let verdict = gateway
            .judge(JudgeKind::Invalidates, "obs", "cond", "belief")
            .await
            .unwrap();
        assert!(verdict.matches);
        assert_eq!(verdict.confidence, 0.88);
    }

    #[tokio::test]
    async fn test_judge_garbage_degrades_to_non_match() {
        let (gateway, _) = gateway(0, "I refuse to answer in JSON");
        let verdict = gateway
            .judge(JudgeKind::Confirms, "obs", "cond", "belief")
            .await
            .unwrap();
        assert_eq!(verdict, JudgeVerdict::non_match());
    }

    #[tokio::test]
    async fn test_completeness_swallows_failures() {
        struct FailingChat;
        #[async_trait]
        impl ChatProvider for FailingChat {
            async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
                Err(CoreError::OracleUnavailable("down".to_string()))
            }
        }
        let gateway = OracleGateway::new(
            Arc::new(FixedEmbedder {
                calls: AtomicUsize::new(0),
                fail_first: 0,
            }),
            Arc::new(FailingChat),
            &EngineConfig::default(),
        );
        assert!(gateway.completeness("text", "thought", true, false).await.is_empty());
    }
}
