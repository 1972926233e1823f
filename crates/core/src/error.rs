use crate::models::SourceType;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("malformed source payload: {0}")]
    Extraction(String),

    #[error("invalid response from {source_name}: {details}")]
    SourceResponse { source_name: String, details: String },

    #[error("index error: {0}")]
    Index(#[from] SearchError),

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("index unavailable at {path}: {details}")]
    IndexUnavailable { path: String, details: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("embedding dimension {actual} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding failed: {0}")]
    Embedding(String),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("retrieval failed: {0}")]
    Retrieval(#[from] SearchError),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("generation timed out after {0:?}")]
    GenerationTimeout(Duration),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no {source_type} token for {owner_id}: please connect {source_type} first")]
    Missing {
        owner_id: String,
        source_type: SourceType,
    },

    #[error("credential store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential store is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
