use crate::chunking::ChunkingConfig;
use crate::config::SimilarityMetric;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const UNTITLED: &str = "Untitled";
pub const DEFAULT_NUM_SOURCES: usize = 3;
pub const MAX_NUM_SOURCES: usize = 5;
pub const MAX_QUERY_TOKENS: usize = 2_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Notion,
    GoogleDocs,
    Confluence,
    #[default]
    #[serde(other)]
    Unknown,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Notion => "notion",
            SourceType::GoogleDocs => "google_docs",
            SourceType::Confluence => "confluence",
            SourceType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "notion" => Ok(SourceType::Notion),
            "google_docs" | "google" | "gdocs" => Ok(SourceType::GoogleDocs),
            "confluence" => Ok(SourceType::Confluence),
            "unknown" => Ok(SourceType::Unknown),
            other => Err(format!("unsupported source type: {other}")),
        }
    }
}

/// A normalized document produced by the extractor. Never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceDocument {
    pub source_type: SourceType,
    pub source_id: String,
    pub title: String,
    pub url: Option<String>,
    pub raw_content: String,
}

/// Provenance carried by every chunk and index entry.
///
/// The serde defaults are the single place where missing metadata is filled in,
/// so rows persisted without these fields still come back in a uniform shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkMetadata {
    #[serde(default)]
    pub source_type: SourceType,
    #[serde(default = "default_source_id")]
    pub source_id: String,
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub chunk_index: u64,
}

fn default_source_id() -> String {
    "init".to_string()
}

fn default_title() -> String {
    "Initialization Document".to_string()
}

impl ChunkMetadata {
    pub fn for_document(document: &SourceDocument, chunk_index: u64) -> Self {
        Self {
            source_type: document.source_type,
            source_id: document.source_id.clone(),
            title: document.title.clone(),
            url: document.url.clone(),
            chunk_index,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub metadata: ChunkMetadata,
}

/// Persisted form of a chunk. One JSON line per entry in the index file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub content_hash: String,
    #[serde(default = "Utc::now")]
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub text: String,
    pub metadata: ChunkMetadata,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub num_sources: Option<usize>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub source_types: Option<Vec<SourceType>>,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            context: None,
            num_sources: None,
            max_tokens: None,
            source_types: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_num_sources(mut self, num_sources: usize) -> Self {
        self.num_sources = Some(num_sources);
        self
    }

    pub fn with_source_types(mut self, source_types: Vec<SourceType>) -> Self {
        self.source_types = Some(source_types);
        self
    }

    /// Number of chunks to retrieve. A requested count is kept inside
    /// `1..=MAX_NUM_SOURCES`; otherwise the configured count applies as is.
    pub fn effective_k(&self, configured: usize) -> usize {
        match self.num_sources {
            Some(requested) => requested.clamp(1, MAX_NUM_SOURCES),
            None => configured,
        }
    }

    /// Generation budget for this request, never above the configured one.
    pub fn effective_max_new_tokens(&self, configured: usize) -> usize {
        match self.max_tokens {
            Some(requested) => requested.min(MAX_QUERY_TOKENS).min(configured).max(1),
            None => configured,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<SearchResult>,
    pub context_used: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexStats {
    pub total_entries: usize,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub chunking: ChunkingConfig,
    pub similarity_metric: SimilarityMetric,
}

/// An opaque per-user token for one external source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    pub owner_id: String,
    pub source_type: SourceType,
    pub token: String,
    pub connected_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_type_round_trips_through_str() {
        for source in [
            SourceType::Notion,
            SourceType::GoogleDocs,
            SourceType::Confluence,
            SourceType::Unknown,
        ] {
            assert_eq!(source.as_str().parse::<SourceType>(), Ok(source));
        }
        assert_eq!("google-docs".parse::<SourceType>(), Ok(SourceType::GoogleDocs));
        assert!("sharepoint".parse::<SourceType>().is_err());
    }

    #[test]
    fn unrecognized_source_type_deserializes_as_unknown() -> Result<(), serde_json::Error> {
        let source: SourceType = serde_json::from_str("\"dropbox\"")?;
        assert_eq!(source, SourceType::Unknown);
        Ok(())
    }

    #[test]
    fn metadata_missing_fields_get_legacy_defaults() -> Result<(), serde_json::Error> {
        let metadata: ChunkMetadata = serde_json::from_str("{}")?;
        assert_eq!(metadata.source_type, SourceType::Unknown);
        assert_eq!(metadata.source_id, "init");
        assert_eq!(metadata.title, "Initialization Document");
        assert_eq!(metadata.url, None);
        Ok(())
    }

    #[test]
    fn query_request_bounds_are_enforced() {
        assert_eq!(QueryRequest::new("q").effective_k(DEFAULT_NUM_SOURCES), 3);

        let request = QueryRequest::new("q").with_num_sources(0);
        assert_eq!(request.effective_k(DEFAULT_NUM_SOURCES), 1);

        let request = QueryRequest::new("q").with_num_sources(50);
        assert_eq!(request.effective_k(DEFAULT_NUM_SOURCES), MAX_NUM_SOURCES);
        assert_eq!(request.effective_k(4), MAX_NUM_SOURCES);
        assert_eq!(QueryRequest::new("q").effective_k(4), 4);

        let mut request = QueryRequest::new("q");
        assert_eq!(request.effective_max_new_tokens(256), 256);
        request.max_tokens = Some(64);
        assert_eq!(request.effective_max_new_tokens(256), 64);
        request.max_tokens = Some(5_000);
        assert_eq!(request.effective_max_new_tokens(4_000), MAX_QUERY_TOKENS);
    }
}
