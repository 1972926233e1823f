use crate::config::{EmbeddingBackend, IndexConfig};
use crate::error::SearchError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;

/// Width of the local trigram embedder when nothing else is configured.
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 128;

/// Batches larger than this are hashed on the blocking pool.
const INLINE_BATCH_LIMIT: usize = 32;

pub const DEFAULT_FEATURE_EXTRACTION_URL: &str =
    "https://api-inference.huggingface.co/pipeline/feature-extraction";

/// Maps text to a fixed-dimension vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifier reported in index stats.
    fn model_id(&self) -> &str;
    fn dimensions(&self) -> usize;

    /// One vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SearchError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| SearchError::Embedding("embedder returned no vector".to_string()))
    }
}

/// Builds the embedder `config` selects. `api_token` only matters for remote backends.
pub fn embedder_for(
    config: &IndexConfig,
    feature_extraction_url: &str,
    api_token: Option<String>,
) -> Arc<dyn Embedder> {
    match config.embedding_backend {
        EmbeddingBackend::HuggingFace => Arc::new(HuggingFaceEmbedder::new(
            feature_extraction_url,
            config.embedding_model.clone(),
            config.embedding_dimensions,
            api_token,
        )),
        EmbeddingBackend::CharacterTrigram => {
            Arc::new(CharacterNgramEmbedder::new(config.embedding_dimensions))
        }
    }
}

/// Hashed character-trigram embedder. Deterministic and fully local.
#[derive(Debug, Clone)]
pub struct CharacterNgramEmbedder {
    model_id: String,
    dimensions: usize,
}

impl CharacterNgramEmbedder {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self {
            model_id: format!("char-trigram-{dimensions}"),
            dimensions,
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let mut hash = 1469598103934665603u64;
            for ch in window {
                let mut buffer = [0u8; 4];
                for byte in ch.encode_utf8(&mut buffer).bytes() {
                    hash ^= byte as u64;
                    hash = hash.wrapping_mul(1099511628211);
                }
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        normalize(&mut vector);
        vector
    }
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIMENSIONS)
    }
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SearchError> {
        if texts.len() <= INLINE_BATCH_LIMIT {
            return Ok(texts.iter().map(|text| self.embed_text(text)).collect());
        }

        let embedder = self.clone();
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || {
            texts
                .iter()
                .map(|text| embedder.embed_text(text))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|error| SearchError::Embedding(error.to_string()))
    }
}

/// Sentence embeddings from a Hugging Face feature-extraction endpoint.
pub struct HuggingFaceEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: usize,
    api_token: Option<String>,
}

impl HuggingFaceEmbedder {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
        api_token: Option<String>,
    ) -> Self {
        let model = model.into();
        let endpoint = format!("{}/{}", base_url.into().trim_end_matches('/'), model);
        Self {
            client: Client::new(),
            endpoint,
            model,
            dimensions: dimensions.max(1),
            api_token: api_token.filter(|token| !token.trim().is_empty()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Embedder for HuggingFaceEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SearchError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut request = self.client.post(&self.endpoint).json(&json!({
            "inputs": texts,
            "options": { "wait_for_model": true },
        }));
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|error| SearchError::Embedding(error.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| SearchError::Embedding(error.to_string()))?;
        if !status.is_success() {
            return Err(SearchError::Embedding(format!(
                "{} returned {status}: {}",
                self.endpoint,
                body.chars().take(300).collect::<String>()
            )));
        }

        let payload: Value = serde_json::from_str(&body)?;
        parse_feature_extraction(&payload, texts.len(), self.dimensions)
    }
}

/// Reads one vector per input from a feature-extraction payload.
///
/// Sentence models answer with `[[f32; d]; n]`; token-level models answer with
/// `[[[f32; d]; tokens]; n]`, which is mean-pooled. Vectors come back unit length.
pub fn parse_feature_extraction(
    payload: &Value,
    expected_count: usize,
    dimensions: usize,
) -> Result<Vec<Vec<f32>>, SearchError> {
    let rows = payload.as_array().ok_or_else(|| {
        SearchError::Embedding(format!("feature-extraction payload is not a list: {payload}"))
    })?;
    if rows.len() != expected_count {
        return Err(SearchError::Embedding(format!(
            "expected {expected_count} vectors, got {}",
            rows.len()
        )));
    }

    rows.iter()
        .map(|row| {
            let mut vector = match row.as_array().and_then(|values| values.first()) {
                Some(Value::Array(_)) => mean_pool(row)?,
                _ => number_list(row)?,
            };
            if vector.len() != dimensions {
                return Err(SearchError::DimensionMismatch {
                    expected: dimensions,
                    actual: vector.len(),
                });
            }
            normalize(&mut vector);
            Ok(vector)
        })
        .collect()
}

fn number_list(value: &Value) -> Result<Vec<f32>, SearchError> {
    value
        .as_array()
        .ok_or_else(|| SearchError::Embedding("embedding row is not a list".to_string()))?
        .iter()
        .map(|number| {
            number
                .as_f64()
                .map(|number| number as f32)
                .ok_or_else(|| SearchError::Embedding(format!("not a number: {number}")))
        })
        .collect()
}

fn mean_pool(tokens: &Value) -> Result<Vec<f32>, SearchError> {
    let tokens = tokens
        .as_array()
        .ok_or_else(|| SearchError::Embedding("token rows are not a list".to_string()))?;
    let mut sum: Vec<f32> = Vec::new();
    for token in tokens {
        let vector = number_list(token)?;
        if sum.is_empty() {
            sum = vector;
        } else if sum.len() == vector.len() {
            for (total, value) in sum.iter_mut().zip(vector) {
                *total += value;
            }
        } else {
            return Err(SearchError::Embedding("ragged token embeddings".to_string()));
        }
    }
    let count = tokens.len().max(1) as f32;
    for value in &mut sum {
        *value /= count;
    }
    Ok(sum)
}

fn normalize(vector: &mut [f32]) {
    let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for value in vector.iter_mut() {
            *value /= magnitude;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed_text("Vacation requests go through the HR portal");
        let second = embedder.embed_text("Vacation requests go through the HR portal");
        assert_eq!(first, second);
    }

    #[test]
    fn trigram_embedder_reports_its_own_model_id() {
        let embedder = CharacterNgramEmbedder::new(32);
        assert_eq!(embedder.embed_text("abc").len(), 32);
        assert_eq!(embedder.model_id(), "char-trigram-32");
        assert_eq!(CharacterNgramEmbedder::default().model_id(), "char-trigram-128");
    }

    #[test]
    fn embeddings_are_unit_length() {
        let embedder = CharacterNgramEmbedder::default();
        let vector = embedder.embed_text("expense reports are due monthly");
        let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn short_text_embeds_to_zero_vector() {
        let embedder = CharacterNgramEmbedder::new(16);
        assert!(embedder.embed_text("ab").iter().all(|value| *value == 0.0));
    }

    #[tokio::test]
    async fn large_batches_match_inline_embedding() -> Result<(), SearchError> {
        let embedder = CharacterNgramEmbedder::new(64);
        let texts: Vec<String> = (0..INLINE_BATCH_LIMIT * 3)
            .map(|index| format!("policy paragraph number {index}"))
            .collect();

        let vectors = embedder.embed_batch(&texts).await?;

        assert_eq!(vectors.len(), texts.len());
        for (text, vector) in texts.iter().zip(&vectors) {
            assert_eq!(vector, &embedder.embed_text(text));
        }
        assert_eq!(embedder.embed("policy paragraph number 0").await?, vectors[0]);
        Ok(())
    }

    #[test]
    fn sentence_vectors_are_parsed_and_normalized() -> Result<(), SearchError> {
        let payload = json!([[3.0, 4.0], [0.0, 2.0]]);
        let vectors = parse_feature_extraction(&payload, 2, 2)?;
        assert_eq!(vectors, vec![vec![0.6, 0.8], vec![0.0, 1.0]]);
        Ok(())
    }

    #[test]
    fn token_vectors_are_mean_pooled() -> Result<(), SearchError> {
        let payload = json!([[[2.0, 0.0], [0.0, 2.0]]]);
        let vectors = parse_feature_extraction(&payload, 1, 2)?;
        let expected = 1.0 / 2f32.sqrt();
        assert!((vectors[0][0] - expected).abs() < 1e-6);
        assert!((vectors[0][1] - expected).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn wrong_width_or_count_is_rejected() {
        assert!(matches!(
            parse_feature_extraction(&json!([[1.0, 2.0, 3.0]]), 1, 384),
            Err(SearchError::DimensionMismatch { expected: 384, actual: 3 })
        ));
        assert!(matches!(
            parse_feature_extraction(&json!([[1.0]]), 2, 1),
            Err(SearchError::Embedding(_))
        ));
        assert!(matches!(
            parse_feature_extraction(&json!({ "error": "loading" }), 1, 1),
            Err(SearchError::Embedding(_))
        ));
    }

    #[test]
    fn config_selects_backend_and_model_id() {
        let remote = IndexConfig::default();
        let embedder = embedder_for(&remote, "https://hf.example/pipeline/feature-extraction/", None);
        assert_eq!(embedder.model_id(), "sentence-transformers/all-MiniLM-L6-v2");
        assert_eq!(embedder.dimensions(), 384);

        let local = IndexConfig {
            embedding_backend: EmbeddingBackend::CharacterTrigram,
            embedding_dimensions: 128,
            ..IndexConfig::default()
        };
        assert_eq!(embedder_for(&local, DEFAULT_FEATURE_EXTRACTION_URL, None).model_id(), "char-trigram-128");
    }

    #[test]
    fn endpoint_joins_model() {
        let embedder = HuggingFaceEmbedder::new(
            "https://hf.example/pipeline/feature-extraction/",
            "sentence-transformers/all-MiniLM-L6-v2",
            384,
            Some(" ".to_string()),
        );
        assert_eq!(
            embedder.endpoint(),
            "https://hf.example/pipeline/feature-extraction/sentence-transformers/all-MiniLM-L6-v2"
        );
        assert!(embedder.api_token.is_none());
    }
}
