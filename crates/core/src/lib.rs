pub mod chunking;
pub mod config;
pub mod credentials;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod generation;
pub mod index;
pub mod ingest;
pub mod models;
pub mod query;
pub mod sources;

pub use chunking::{build_chunks, normalize_whitespace, split_text, ChunkingConfig, LengthUnit};
pub use config::{EmbeddingBackend, GenerationConfig, IndexConfig, SimilarityMetric};
pub use credentials::{CredentialStore, FileCredentialStore, InMemoryCredentialStore};
pub use embeddings::{
    embedder_for, CharacterNgramEmbedder, Embedder, HuggingFaceEmbedder,
    DEFAULT_EMBEDDING_DIMENSIONS, DEFAULT_FEATURE_EXTRACTION_URL,
};
pub use error::{CredentialError, IngestError, QueryError, SearchError};
pub use extractor::{
    extract_confluence_page, extract_google_doc_structured, extract_google_doc_text,
    extract_notion_page,
};
pub use generation::{Generator, HuggingFaceGenerator, DEFAULT_INFERENCE_URL};
pub use index::IndexStore;
pub use ingest::{IngestionPipeline, IngestionReport, SkippedDocument};
pub use models::{
    Chunk, ChunkMetadata, QueryRequest, QueryResponse, SearchResult, SourceDocument, SourceType,
};
pub use query::QueryEngine;
pub use sources::{
    ConfluenceClient, FetchedDocuments, GoogleDocsClient, NotionClient, SourceClient,
    SourceSelector,
};
