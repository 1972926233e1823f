use crate::chunking::ChunkingConfig;
use crate::error::IngestError;
use crate::models::{DEFAULT_NUM_SOURCES, MAX_NUM_SOURCES};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_EMBEDDING_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";
/// Output width of [`DEFAULT_EMBEDDING_MODEL`].
pub const DEFAULT_EMBEDDING_MODEL_DIMENSIONS: usize = 384;
pub const DEFAULT_GENERATION_MODEL: &str = "google/flan-t5-small";
pub const DEFAULT_INDEX_PATH: &str = "docs_index/index.jsonl";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    #[default]
    Cosine,
    Euclidean,
    DotProduct,
}

impl fmt::Display for SimilarityMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SimilarityMetric::Cosine => "cosine",
            SimilarityMetric::Euclidean => "euclidean",
            SimilarityMetric::DotProduct => "dot_product",
        })
    }
}

impl FromStr for SimilarityMetric {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "cosine" => Ok(SimilarityMetric::Cosine),
            "euclidean" | "l2" => Ok(SimilarityMetric::Euclidean),
            "dot_product" | "dot" | "ip" => Ok(SimilarityMetric::DotProduct),
            other => Err(format!("unsupported similarity metric: {other}")),
        }
    }
}

/// Where chunk and query vectors come from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackend {
    /// A sentence-transformers model behind a feature-extraction endpoint.
    #[default]
    HuggingFace,
    /// Hashed character trigrams, computed locally. Lexical, not semantic.
    CharacterTrigram,
}

impl fmt::Display for EmbeddingBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EmbeddingBackend::HuggingFace => "hugging_face",
            EmbeddingBackend::CharacterTrigram => "character_trigram",
        })
    }
}

impl FromStr for EmbeddingBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "hugging_face" | "huggingface" | "hf" => Ok(EmbeddingBackend::HuggingFace),
            "character_trigram" | "char_trigram" | "trigram" => {
                Ok(EmbeddingBackend::CharacterTrigram)
            }
            other => Err(format!("unsupported embedding backend: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationConfig {
    pub model: String,
    pub max_new_tokens: usize,
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_GENERATION_MODEL.to_string(),
            max_new_tokens: 256,
            timeout_secs: 60,
        }
    }
}

impl GenerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Everything the index and query engine need to know at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexConfig {
    pub embedding_backend: EmbeddingBackend,
    /// Model id for remote backends; the trigram backend names itself.
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub chunking: ChunkingConfig,
    pub similarity_metric: SimilarityMetric,
    pub generation: GenerationConfig,
    pub retrieval_k: usize,
    pub index_path: PathBuf,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            embedding_backend: EmbeddingBackend::default(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            embedding_dimensions: DEFAULT_EMBEDDING_MODEL_DIMENSIONS,
            chunking: ChunkingConfig::default(),
            similarity_metric: SimilarityMetric::default(),
            generation: GenerationConfig::default(),
            retrieval_k: DEFAULT_NUM_SOURCES,
            index_path: PathBuf::from(DEFAULT_INDEX_PATH),
        }
    }
}

impl IndexConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        self.chunking.validate()?;

        if !(1..=MAX_NUM_SOURCES).contains(&self.retrieval_k) {
            return Err(IngestError::InvalidArgument(format!(
                "retrieval_k {} is outside 1..={MAX_NUM_SOURCES}",
                self.retrieval_k
            )));
        }
        if self.embedding_dimensions == 0 {
            return Err(IngestError::InvalidArgument(
                "embedding_dimensions must be at least 1".to_string(),
            ));
        }
        if self.generation.max_new_tokens == 0 {
            return Err(IngestError::InvalidArgument(
                "max_new_tokens must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
