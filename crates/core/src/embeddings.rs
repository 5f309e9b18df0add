use crate::config::OpenAiConfig;
use crate::error::EmbeddingError;
use crate::traits::EmbeddingProvider;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

/// Input longer than this many characters is cut before it is sent upstream.
pub const EMBEDDING_INPUT_CHAR_LIMIT: usize = 8_000;

/// Deterministic hashed trigram embedder that needs no network access.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        for window in chars.windows(3) {
            let mut hash = 1469598103934665603u64;
            for c in window {
                let mut buffer = [0u8; 4];
                for byte in c.encode_utf8(&mut buffer).bytes() {
                    hash ^= byte as u64;
                    hash = hash.wrapping_mul(1099511628211);
                }
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingProvider for CharacterNgramEmbedder {
    fn model_name(&self) -> &str {
        "character-trigram"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed_text(text))
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// OpenAI-compatible `/embeddings` client.
pub struct OpenAiEmbedder {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiEmbedder {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.config.embedding_model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let response = self
            .client
            .post(format!("{}/embeddings", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&EmbeddingRequest {
                model: &self.config.embedding_model,
                input: text,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let details = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::BackendResponse { status, details });
        }

        let payload: EmbeddingResponse = response.json().await?;
        payload
            .data
            .into_iter()
            .next()
            .map(|data| data.embedding)
            .filter(|embedding| !embedding.is_empty())
            .ok_or(EmbeddingError::EmptyResponse)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: usize, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    /// Wait after the `failures`-th failed attempt: `base_delay * 2^failures`.
    pub fn delay_for_attempt(&self, failures: usize) -> Duration {
        let exponent = failures.min(16) as u32;
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Best-effort embedding: truncates input, retries with backoff, and yields
/// `None` when no provider is configured or every attempt failed.
#[derive(Clone, Default)]
pub struct EmbeddingEngine {
    provider: Option<Arc<dyn EmbeddingProvider>>,
    policy: RetryPolicy,
}

impl EmbeddingEngine {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, policy: RetryPolicy) -> Self {
        Self {
            provider: Some(provider),
            policy,
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    pub async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let provider = self.provider.as_ref()?;
        let input = truncate_chars(text, EMBEDDING_INPUT_CHAR_LIMIT);
        let attempts = self.policy.attempts.max(1);

        for attempt in 1..=attempts {
            match provider.embed(input).await {
                Ok(vector) => {
                    debug!(attempt, dimensions = vector.len(), "embedding generated");
                    return Some(vector);
                }
                Err(error) if attempt < attempts => {
                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(attempt, attempts, %error, ?delay, "embedding failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    warn!(attempts, %error, model = provider.model_name(), "embedding gave up");
                }
            }
        }

        None
    }
}

impl std::fmt::Debug for EmbeddingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingEngine")
            .field("provider", &self.provider.as_ref().map(|p| p.model_name().to_string()))
            .field("policy", &self.policy)
            .finish()
    }
}

pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}

/// Cosine similarity in `[-1, 1]`; `0` when either side is missing, empty,
/// of a different length, or has zero magnitude.
pub fn cosine_similarity(a: Option<&[f32]>, b: Option<&[f32]>) -> f64 {
    let (Some(a), Some(b)) = (a, b) else {
        return 0.0;
    };
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0f64;
    let mut norm_a = 0f64;
    let mut norm_b = 0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyProvider {
        failures_before_success: usize,
        calls: AtomicUsize,
        seen_len: AtomicUsize,
    }

    impl FlakyProvider {
        fn new(failures_before_success: usize) -> Self {
            Self {
                failures_before_success,
                calls: AtomicUsize::new(0),
                seen_len: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyProvider {
        fn model_name(&self) -> &str {
            "flaky"
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            self.seen_len.store(text.chars().count(), Ordering::SeqCst);
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(EmbeddingError::EmptyResponse)
            } else {
                Ok(vec![1.0, 0.0])
            }
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[test]
    fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed_text("Quarterly revenue and churn");
        let second = embedder.embed_text("Quarterly revenue and churn");
        assert_eq!(first, second);
    }

    #[test]
    fn embedder_outputs_expected_length() {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        assert_eq!(embedder.embed_text("abc").len(), 32);
    }

    #[test]
    fn backoff_doubles_per_failure() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
    }

    fn vector(values: &[f32]) -> Option<&[f32]> {
        Some(values)
    }

    #[test]
    fn cosine_handles_missing_and_degenerate_vectors() {
        let a = [1.0f32, 2.0, 3.0];
        assert_eq!(cosine_similarity(vector(&a), None), 0.0);
        assert_eq!(cosine_similarity(None, vector(&a)), 0.0);
        assert_eq!(cosine_similarity(vector(&a), vector(&[1.0, 2.0])), 0.0);
        assert_eq!(cosine_similarity(vector(&a), vector(&[0.0, 0.0, 0.0])), 0.0);
        assert_eq!(cosine_similarity(vector(&[]), vector(&[])), 0.0);
    }

    #[test]
    fn cosine_is_symmetric_and_bounded() {
        let pairs: [(&[f32], &[f32]); 4] = [
            (&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]),
            (&[1.0, 0.0], &[0.0, 1.0]),
            (&[1.0, 1.0], &[-1.0, -1.0]),
            (&[0.3, -0.7, 2.5], &[-4.0, 0.1, 0.9]),
        ];
        for (a, b) in pairs {
            let forward = cosine_similarity(Some(a), Some(b));
            let backward = cosine_similarity(Some(b), Some(a));
            assert_eq!(forward, backward);
            assert!((-1.0..=1.0).contains(&forward));
        }
        assert!((cosine_similarity(vector(&[1.0, 2.0]), vector(&[1.0, 2.0])) - 1.0).abs() < 1e-9);
        assert!(
            (cosine_similarity(vector(&[1.0, 1.0]), vector(&[-1.0, -1.0])) + 1.0).abs() < 1e-9
        );
    }

    #[test]
    fn truncation_counts_characters() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }

    #[tokio::test]
    async fn disabled_engine_returns_none() {
        assert_eq!(EmbeddingEngine::disabled().embed("anything").await, None);
    }

    #[tokio::test]
    async fn engine_retries_until_success() {
        let provider = Arc::new(FlakyProvider::new(2));
        let engine = EmbeddingEngine::new(provider.clone(), fast_policy());

        assert_eq!(engine.embed("text").await, Some(vec![1.0, 0.0]));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn engine_gives_up_after_the_attempt_ceiling() {
        let provider = Arc::new(FlakyProvider::new(usize::MAX));
        let engine = EmbeddingEngine::new(provider.clone(), fast_policy());

        assert_eq!(engine.embed("text").await, None);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn engine_truncates_long_input() {
        let provider = Arc::new(FlakyProvider::new(0));
        let engine = EmbeddingEngine::new(provider.clone(), fast_policy());

        let long = "a".repeat(EMBEDDING_INPUT_CHAR_LIMIT + 500);
        engine.embed(&long).await;
        assert_eq!(provider.seen_len.load(Ordering::SeqCst), EMBEDDING_INPUT_CHAR_LIMIT);
    }
}
