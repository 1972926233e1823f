use crate::chunking::build_chunks;
use crate::credentials::CredentialStore;
use crate::error::IngestError;
use crate::index::{is_placeholder, IndexStore};
use crate::models::{SourceDocument, SourceType};
use crate::sources::{
    ConfluenceClient, GoogleDocsClient, NotionClient, SourceClient, SourceSelector,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct SkippedDocument {
    pub source_id: String,
    pub reason: String,
}

#[derive(Debug, Default, Serialize)]
pub struct IngestionReport {
    /// One id per document that produced at least one indexed chunk.
    pub document_ids: Vec<String>,
    pub chunk_count: usize,
    pub skipped: Vec<SkippedDocument>,
}

/// Fetch → extract → chunk → index, one source at a time.
pub struct IngestionPipeline {
    index: Arc<IndexStore>,
    credentials: Arc<dyn CredentialStore>,
    clients: HashMap<SourceType, Arc<dyn SourceClient>>,
}

impl IngestionPipeline {
    pub fn new(index: Arc<IndexStore>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            index,
            credentials,
            clients: HashMap::new(),
        }
    }

    /// A pipeline wired to the public Notion, Google, and Confluence APIs.
    pub fn with_default_clients(
        index: Arc<IndexStore>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self::new(index, credentials)
            .register_client(Arc::new(NotionClient::default()))
            .register_client(Arc::new(GoogleDocsClient::default()))
            .register_client(Arc::new(ConfluenceClient::default()))
    }

    pub fn register_client(mut self, client: Arc<dyn SourceClient>) -> Self {
        self.clients.insert(client.source_type(), client);
        self
    }

    /// Ingests with the token the owner connected for `source_type`.
    pub async fn process_for_owner(
        &self,
        owner_id: &str,
        source_type: SourceType,
        selector: &SourceSelector,
    ) -> Result<IngestionReport, IngestError> {
        let token = self.credentials.require_token(owner_id, source_type)?;
        self.process_source(source_type, &token, selector).await
    }

    pub async fn process_source(
        &self,
        source_type: SourceType,
        auth_token: &str,
        selector: &SourceSelector,
    ) -> Result<IngestionReport, IngestError> {
        self.index.config().chunking.validate()?;

        let client = self.clients.get(&source_type).ok_or_else(|| {
            IngestError::InvalidArgument(format!("no client registered for {source_type}"))
        })?;

        let fetched = client.fetch(auth_token, selector).await?;
        info!(
            source = %source_type,
            documents = fetched.documents.len(),
            skipped = fetched.skipped.len(),
            "fetched source documents"
        );

        let mut report = self.index_documents(fetched.documents).await?;
        report.skipped.extend(fetched.skipped);
        Ok(report)
    }

    /// Indexes already-extracted documents, replacing earlier versions of each.
    pub async fn index_documents(
        &self,
        documents: Vec<SourceDocument>,
    ) -> Result<IngestionReport, IngestError> {
        let chunking = self.index.config().chunking;
        chunking.validate()?;

        let mut report = IngestionReport::default();

        for document in documents {
            let outcome = async {
                let chunks = build_chunks(&document, &chunking)?;
                if chunks.is_empty() {
                    return Err(IngestError::Extraction("document has no text".to_string()));
                }
                if chunks.iter().all(|chunk| is_placeholder(&chunk.text)) {
                    return Err(IngestError::Extraction(
                        "document has no indexable text".to_string(),
                    ));
                }
                let ids = self
                    .index
                    .replace_source(document.source_type, &document.source_id, &chunks)
                    .await?;
                Ok::<_, IngestError>(ids.len())
            }
            .await;

            match outcome {
                Ok(chunk_count) => {
                    info!(
                        source = %document.source_type,
                        source_id = %document.source_id,
                        title = %document.title,
                        chunk_count,
                        "document indexed"
                    );
                    report.chunk_count += chunk_count;
                    report.document_ids.push(document.source_id);
                }
                Err(error) => {
                    warn!(source_id = %document.source_id, error = %error, "skipped document");
                    report.skipped.push(SkippedDocument {
                        source_id: document.source_id,
                        reason: error.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::{ChunkingConfig, LengthUnit};
    use crate::config::IndexConfig;
    use crate::credentials::InMemoryCredentialStore;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::CredentialError;
    use crate::extractor::extract_notion_page;
    use crate::sources::FetchedDocuments;
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct FakeNotion {
        documents: Mutex<Vec<SourceDocument>>,
        tokens: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl FakeNotion {
        fn new(documents: Vec<SourceDocument>) -> Arc<Self> {
            Arc::new(Self {
                documents: Mutex::new(documents),
                tokens: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            })
        }

        fn replace(&self, documents: Vec<SourceDocument>) {
            if let Ok(mut current) = self.documents.lock() {
                *current = documents;
            }
        }
    }

    #[async_trait]
    impl SourceClient for FakeNotion {
        fn source_type(&self) -> SourceType {
            SourceType::Notion
        }

        async fn fetch(
            &self,
            token: &str,
            _selector: &SourceSelector,
        ) -> Result<FetchedDocuments, IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut tokens) = self.tokens.lock() {
                tokens.push(token.to_string());
            }
            let documents = self
                .documents
                .lock()
                .map(|documents| documents.clone())
                .unwrap_or_default();
            Ok(FetchedDocuments {
                documents,
                skipped: vec![SkippedDocument {
                    source_id: "broken-page".to_string(),
                    reason: "blocks request failed".to_string(),
                }],
            })
        }
    }

    fn page(source_id: &str, body: &str) -> SourceDocument {
        SourceDocument {
            source_type: SourceType::Notion,
            source_id: source_id.to_string(),
            title: format!("Page {source_id}"),
            url: None,
            raw_content: body.to_string(),
        }
    }

    fn long_body(topic: &str) -> String {
        (0..40)
            .map(|index| format!("{topic} paragraph {index}."))
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn open_index(dir: &Path, chunking: ChunkingConfig) -> Result<Arc<IndexStore>, Box<dyn std::error::Error>> {
        let config = IndexConfig {
            chunking,
            ..IndexConfig::default()
        };
        let embedder = Arc::new(CharacterNgramEmbedder::new(64));
        Ok(Arc::new(
            IndexStore::open(dir.join("index.jsonl"), embedder, config).await?,
        ))
    }

    fn small_chunks() -> ChunkingConfig {
        ChunkingConfig {
            chunk_size: 200,
            chunk_overlap: 40,
            unit: LengthUnit::Character,
        }
    }

    #[tokio::test]
    async fn process_source_indexes_documents_and_reports_skips(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let index = open_index(dir.path(), small_chunks()).await?;
        let notion = FakeNotion::new(vec![
            page("handbook", &long_body("benefits")),
            page("blank", "   "),
        ]);
        let pipeline = IngestionPipeline::new(index.clone(), Arc::new(InMemoryCredentialStore::new()))
            .register_client(notion.clone());

        let report = pipeline
            .process_source(SourceType::Notion, "secret", &SourceSelector::default())
            .await?;

        assert_eq!(report.document_ids, vec!["handbook".to_string()]);
        assert!(report.chunk_count > 1);
        assert_eq!(index.len().await, report.chunk_count);
        let skipped: Vec<&str> = report.skipped.iter().map(|skip| skip.source_id.as_str()).collect();
        assert_eq!(skipped, vec!["blank", "broken-page"]);
        Ok(())
    }

    #[tokio::test]
    async fn owner_token_is_resolved_from_credentials() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let index = open_index(dir.path(), small_chunks()).await?;
        let credentials = Arc::new(InMemoryCredentialStore::new());
        credentials.store_token("ana@example.com", SourceType::Notion, "secret_notion")?;
        let notion = FakeNotion::new(vec![page("handbook", &long_body("benefits"))]);
        let pipeline = IngestionPipeline::new(index, credentials).register_client(notion.clone());

        pipeline
            .process_for_owner("ana@example.com", SourceType::Notion, &SourceSelector::default())
            .await?;

        let tokens = notion.tokens.lock().map_err(|error| error.to_string())?;
        assert_eq!(*tokens, vec!["secret_notion".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn missing_credential_is_surfaced() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let index = open_index(dir.path(), small_chunks()).await?;
        let notion = FakeNotion::new(Vec::new());
        let pipeline = IngestionPipeline::new(index, Arc::new(InMemoryCredentialStore::new()))
            .register_client(notion.clone());

        let result = pipeline
            .process_for_owner("bo@example.com", SourceType::Notion, &SourceSelector::default())
            .await;

        assert!(matches!(
            result,
            Err(IngestError::Credential(CredentialError::Missing { .. }))
        ));
        assert_eq!(notion.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_chunking_config_fails_before_fetching() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let invalid = ChunkingConfig {
            chunk_size: 200,
            chunk_overlap: 200,
            unit: LengthUnit::Token,
        };
        let index = open_index(dir.path(), invalid).await?;
        let notion = FakeNotion::new(vec![page("handbook", &long_body("benefits"))]);
        let pipeline = IngestionPipeline::new(index, Arc::new(InMemoryCredentialStore::new()))
            .register_client(notion.clone());

        let result = pipeline
            .process_source(SourceType::Notion, "secret", &SourceSelector::default())
            .await;

        assert!(matches!(result, Err(IngestError::InvalidChunkConfig(_))));
        assert_eq!(notion.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn unregistered_source_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let index = open_index(dir.path(), small_chunks()).await?;
        let pipeline = IngestionPipeline::new(index, Arc::new(InMemoryCredentialStore::new()));

        let result = pipeline
            .process_source(SourceType::Confluence, "u:t", &SourceSelector::default())
            .await;

        assert!(matches!(result, Err(IngestError::InvalidArgument(_))));
        Ok(())
    }

    #[tokio::test]
    async fn reingesting_replaces_previous_chunks() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let index = open_index(dir.path(), small_chunks()).await?;
        let notion = FakeNotion::new(vec![page("handbook", &long_body("benefits"))]);
        let pipeline = IngestionPipeline::new(index.clone(), Arc::new(InMemoryCredentialStore::new()))
            .register_client(notion.clone());
        let selector = SourceSelector::default();

        let first = pipeline.process_source(SourceType::Notion, "t", &selector).await?;
        pipeline.process_source(SourceType::Notion, "t", &selector).await?;
        assert_eq!(index.len().await, first.chunk_count);

        notion.replace(vec![page("handbook", "A much shorter handbook.")]);
        let updated = pipeline.process_source(SourceType::Notion, "t", &selector).await?;
        assert_eq!(updated.chunk_count, 1);
        assert_eq!(index.len().await, 1);

        let hits = index.search("handbook", 5).await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "A much shorter handbook.");
        Ok(())
    }

    #[tokio::test]
    async fn index_documents_assigns_chunk_indexes_per_document(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let index = open_index(dir.path(), small_chunks()).await?;
        let pipeline = IngestionPipeline::new(index.clone(), Arc::new(InMemoryCredentialStore::new()));

        pipeline
            .index_documents(vec![page("a", &long_body("alpha")), page("b", &long_body("beta"))])
            .await?;

        let hits = index.search("paragraph", 100).await?;
        for source_id in ["a", "b"] {
            let mut indexes: Vec<u64> = hits
                .iter()
                .filter(|hit| hit.metadata.source_id == source_id)
                .map(|hit| hit.metadata.chunk_index)
                .collect();
            indexes.sort_unstable();
            let expected: Vec<u64> = (0..indexes.len() as u64).collect();
            assert_eq!(indexes, expected);
        }
        Ok(())
    }

    #[tokio::test]
    async fn placeholder_only_update_keeps_previous_version() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let index = open_index(dir.path(), small_chunks()).await?;
        let pipeline = IngestionPipeline::new(index.clone(), Arc::new(InMemoryCredentialStore::new()));

        pipeline
            .index_documents(vec![page("handbook", "Remote work is allowed on Fridays.")])
            .await?;
        let report = pipeline
            .index_documents(vec![page("handbook", "initialization")])
            .await?;

        assert!(report.document_ids.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(index.len().await, 1);
        assert_eq!(
            index.search("remote work", 1).await?[0].text,
            "Remote work is allowed on Fridays."
        );
        Ok(())
    }

    #[tokio::test]
    async fn pages_without_ids_do_not_replace_each_other() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let index = open_index(dir.path(), small_chunks()).await?;
        let pipeline = IngestionPipeline::new(index.clone(), Arc::new(InMemoryCredentialStore::new()));

        let paragraph = |text: &str| {
            json!({ "type": "paragraph", "paragraph": { "rich_text": [{ "plain_text": text }] } })
        };
        let first = extract_notion_page(
            &json!({ "properties": {} }),
            &[paragraph("Parking is free for staff.")],
        )?;
        let second = extract_notion_page(
            &json!({ "properties": {} }),
            &[paragraph("Badges are issued at reception.")],
        )?;
        assert_ne!(first.source_id, second.source_id);

        let report = pipeline.index_documents(vec![first, second]).await?;

        assert_eq!(report.document_ids.len(), 2);
        assert_eq!(index.len().await, 2);
        Ok(())
    }
}
