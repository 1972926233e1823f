use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use docs_qa_core::config::{
    DEFAULT_EMBEDDING_MODEL, DEFAULT_EMBEDDING_MODEL_DIMENSIONS, DEFAULT_GENERATION_MODEL,
    DEFAULT_INDEX_PATH,
};
use docs_qa_core::{
    embedder_for, normalize_whitespace, ChunkingConfig, CredentialStore, EmbeddingBackend,
    FileCredentialStore, GenerationConfig, HuggingFaceGenerator, IndexConfig, IndexStore,
    IngestionPipeline, LengthUnit, QueryEngine, QueryRequest, SimilarityMetric, SourceDocument,
    SourceSelector, SourceType, DEFAULT_FEATURE_EXTRACTION_URL, DEFAULT_INFERENCE_URL,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "docs-qa", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON-lines file holding the similarity index.
    #[arg(long, env = "DOCS_QA_INDEX_PATH", default_value = DEFAULT_INDEX_PATH)]
    index_path: PathBuf,

    /// JSON file holding connected source tokens.
    #[arg(long, env = "DOCS_QA_CREDENTIALS_PATH", default_value = "docs_index/credentials.json")]
    credentials_path: PathBuf,

    /// `hugging_face` or `char_trigram` (offline, no model download).
    #[arg(long, env = "EMBEDDING_BACKEND", default_value = "hugging_face")]
    embedding_backend: EmbeddingBackend,

    #[arg(long, env = "EMBEDDING_MODEL", default_value = DEFAULT_EMBEDDING_MODEL)]
    embedding_model: String,

    #[arg(long, env = "EMBEDDING_DIMENSIONS", default_value_t = DEFAULT_EMBEDDING_MODEL_DIMENSIONS)]
    embedding_dimensions: usize,

    /// Root URL of the feature extraction API.
    #[arg(long, env = "EMBEDDING_URL", default_value = DEFAULT_FEATURE_EXTRACTION_URL)]
    embedding_url: String,

    #[arg(long, env = "CHUNK_SIZE", default_value_t = 1000)]
    chunk_size: usize,

    #[arg(long, env = "CHUNK_OVERLAP", default_value_t = 200)]
    chunk_overlap: usize,

    /// `character` or `token`.
    #[arg(long, env = "CHUNK_UNIT", default_value = "character")]
    chunk_unit: LengthUnit,

    /// `cosine`, `euclidean`, or `dot_product`.
    #[arg(long, env = "SIMILARITY_METRIC", default_value = "cosine")]
    similarity_metric: SimilarityMetric,

    #[arg(long, env = "LLM_MODEL", default_value = DEFAULT_GENERATION_MODEL)]
    llm_model: String,

    /// Root URL of the text generation inference API.
    #[arg(long, env = "INFERENCE_URL", default_value = DEFAULT_INFERENCE_URL)]
    inference_url: String,

    #[arg(long, env = "HUGGINGFACE_API_TOKEN", hide_env_values = true)]
    huggingface_api_token: Option<String>,

    #[arg(long, env = "MAX_NEW_TOKENS", default_value_t = 256)]
    max_new_tokens: usize,

    #[arg(long, env = "GENERATION_TIMEOUT_SECS", default_value_t = 60)]
    generation_timeout_secs: u64,

    /// Chunks retrieved per question when the request does not say.
    #[arg(long, env = "RETRIEVAL_K", default_value_t = 3)]
    retrieval_k: usize,
}

#[derive(Subcommand)]
enum Command {
    /// Store a source token for a user.
    Connect {
        #[arg(long)]
        owner: String,
        /// `notion`, `google_docs`, or `confluence`.
        #[arg(long)]
        source: SourceType,
        /// Notion integration secret, Google access token, or `user:api_token` for Confluence.
        #[arg(long, env = "DOCS_QA_SOURCE_TOKEN", hide_env_values = true)]
        token: String,
    },
    /// Fetch a connected source and index its documents.
    Ingest {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        source: SourceType,
        #[command(flatten)]
        selector: SelectorArgs,
    },
    /// Index a local text file as an unknown-source document.
    Import {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        title: Option<String>,
    },
    /// Answer a question from the indexed documents.
    Query {
        question: String,
        /// Extra context echoed back in the response.
        #[arg(long)]
        context: Option<String>,
        #[arg(long)]
        num_sources: Option<usize>,
        #[arg(long)]
        max_tokens: Option<usize>,
        /// Restrict retrieval to these sources; repeatable.
        #[arg(long = "source")]
        sources: Vec<SourceType>,
    },
    /// Show the closest chunks without generating an answer.
    Similar {
        question: String,
        #[arg(long, default_value_t = 5)]
        k: usize,
    },
    /// Print index statistics.
    Stats,
}

#[derive(Args)]
struct SelectorArgs {
    /// Notion database to ingest; searches the whole workspace when absent.
    #[arg(long)]
    database_id: Option<String>,
    /// Google Doc id.
    #[arg(long)]
    document_id: Option<String>,
    /// Confluence site root, e.g. https://acme.atlassian.net/wiki
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long)]
    space_key: Option<String>,
}

impl From<SelectorArgs> for SourceSelector {
    fn from(args: SelectorArgs) -> Self {
        SourceSelector {
            database_id: args.database_id,
            document_id: args.document_id,
            base_url: args.base_url,
            space_key: args.space_key,
        }
    }
}

impl Cli {
    fn index_config(&self) -> IndexConfig {
        IndexConfig {
            embedding_backend: self.embedding_backend,
            embedding_model: self.embedding_model.clone(),
            embedding_dimensions: self.embedding_dimensions,
            chunking: ChunkingConfig {
                chunk_size: self.chunk_size,
                chunk_overlap: self.chunk_overlap,
                unit: self.chunk_unit,
            },
            similarity_metric: self.similarity_metric,
            generation: GenerationConfig {
                model: self.llm_model.clone(),
                max_new_tokens: self.max_new_tokens,
                timeout_secs: self.generation_timeout_secs,
            },
            retrieval_k: self.retrieval_k,
            index_path: self.index_path.clone(),
        }
    }
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = cli.index_config();
    config
        .validate()
        .map_err(|error| anyhow::anyhow!(error.to_string()))?;

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        index = %config.index_path.display(),
        "docs-qa boot"
    );

    let credentials = Arc::new(FileCredentialStore::open(&cli.credentials_path)?);

    if let Command::Connect {
        owner,
        source,
        token,
    } = &cli.command
    {
        credentials.store_token(owner, *source, token)?;
        return print_json(&json!({
            "status": "connected",
            "owner": owner,
            "source": source,
        }));
    }

    let embedder = embedder_for(
        &config,
        &cli.embedding_url,
        cli.huggingface_api_token.clone(),
    );
    let index = Arc::new(IndexStore::open(&config.index_path, embedder, config.clone()).await?);
    let generator = Arc::new(HuggingFaceGenerator::new(
        cli.inference_url.clone(),
        config.generation.model.clone(),
        cli.huggingface_api_token.clone(),
    ));
    let engine = QueryEngine::new(index.clone(), generator);

    match cli.command {
        Command::Connect { .. } => {}
        Command::Ingest {
            owner,
            source,
            selector,
        } => {
            let pipeline = IngestionPipeline::with_default_clients(index.clone(), credentials);
            let report = pipeline
                .process_for_owner(&owner, source, &selector.into())
                .await?;

            for skipped in &report.skipped {
                warn!(source_id = %skipped.source_id, reason = %skipped.reason, "skipped document");
            }
            info!(
                source = %source,
                documents = report.document_ids.len(),
                chunk_count = report.chunk_count,
                "ingestion finished"
            );
            print_json(&report)?;
        }
        Command::Import { file, title } => {
            let raw_content = tokio::fs::read_to_string(&file).await?;
            let source_id = file.display().to_string();
            let title = title.unwrap_or_else(|| {
                file.file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_else(|| source_id.clone())
            });
            let document = SourceDocument {
                source_type: SourceType::Unknown,
                source_id,
                title,
                url: None,
                raw_content,
            };

            let pipeline = IngestionPipeline::new(index.clone(), credentials);
            let report = pipeline.index_documents(vec![document]).await?;
            print_json(&report)?;
        }
        Command::Query {
            question,
            context,
            num_sources,
            max_tokens,
            sources,
        } => {
            let mut request = QueryRequest::new(question);
            request.context = context;
            request.num_sources = num_sources;
            request.max_tokens = max_tokens;
            if !sources.is_empty() {
                request = request.with_source_types(sources);
            }

            let response = engine.answer(&request).await;
            print_json(&response)?;
        }
        Command::Similar { question, k } => {
            let hits = engine.similar(&question, k).await;
            let rendered: Vec<_> = hits
                .iter()
                .map(|hit| {
                    let preview: String = normalize_whitespace(&hit.text).chars().take(160).collect();
                    json!({
                        "score": hit.score,
                        "source_type": hit.metadata.source_type,
                        "source_id": hit.metadata.source_id,
                        "title": hit.metadata.title,
                        "url": hit.metadata.url,
                        "chunk_index": hit.metadata.chunk_index,
                        "preview": preview,
                    })
                })
                .collect();
            print_json(&rendered)?;
        }
        Command::Stats => {
            print_json(&engine.stats().await)?;
        }
    }

    Ok(())
}
