//! Retrieval-augmented question answering over the [`IndexStore`].
//!
//! [`QueryEngine::answer`] always returns a well-formed [`QueryResponse`]:
//! retrieval and generation failures become a fixed apology, and an index
//! with nothing relevant yields a fixed guidance answer without calling the
//! model at all.

use crate::error::QueryError;
use crate::generation::Generator;
use crate::index::{is_placeholder, IndexStore};
use crate::models::{IndexStats, QueryRequest, QueryResponse, SearchResult};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

pub const NO_CONTEXT_ANSWER: &str = "Hmm, I couldn't find anything in your documents that answers that. \
Could you tell me a bit more, or maybe ask in a different way? \
For example, you can ask: 'What is our vacation policy?' or 'How do I submit an expense report?'. \
If you want, I can help you add more documents too! 😊";

pub const APOLOGY_ANSWER: &str =
    "I apologize, but I encountered an error while processing your question. Please try again.";

const QA_TEMPLATE: &str = "You are an AI assistant helping with internal company documentation.
Use the following pieces of context to answer the question at the end.
If you don't know the answer, just say that you don't know. Don't try to make up an answer.
Always include relevant source information in your answer.

Context: {context}

Question: {question}

Answer: Let me help you with that based on the available documentation.";

pub fn render_prompt(context: &str, question: &str) -> String {
    QA_TEMPLATE
        .replacen("{context}", context, 1)
        .replacen("{question}", question, 1)
}

pub struct QueryEngine {
    index: Arc<IndexStore>,
    generator: Arc<dyn Generator>,
}

impl QueryEngine {
    pub fn new(index: Arc<IndexStore>, generator: Arc<dyn Generator>) -> Self {
        Self { index, generator }
    }

    pub fn index(&self) -> &Arc<IndexStore> {
        &self.index
    }

    pub async fn answer(&self, request: &QueryRequest) -> QueryResponse {
        match self.try_answer(request).await {
            Ok(response) => response,
            Err(error) => {
                warn!(question = %request.question, error = %error, "query failed");
                let mut metadata = Map::new();
                metadata.insert("error".to_string(), json!(error.to_string()));
                QueryResponse {
                    answer: APOLOGY_ANSWER.to_string(),
                    sources: Vec::new(),
                    context_used: None,
                    metadata,
                }
            }
        }
    }

    async fn try_answer(&self, request: &QueryRequest) -> Result<QueryResponse, QueryError> {
        let config = self.index.config();
        let k = request.effective_k(config.retrieval_k);
        let retrieved = self
            .index
            .search_filtered(&request.question, k, request.source_types.as_deref())
            .await?;

        if retrieved.iter().all(|hit| is_placeholder(&hit.text)) {
            debug!(question = %request.question, "no relevant context");
            return Ok(self.no_context_response(request));
        }

        let context = retrieved
            .iter()
            .map(|hit| hit.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = render_prompt(&context, &request.question);
        let max_new_tokens = request.effective_max_new_tokens(config.generation.max_new_tokens);
        let timeout = config.generation.timeout();

        let answer = tokio::time::timeout(timeout, self.generator.generate(&prompt, max_new_tokens))
            .await
            .map_err(|_| QueryError::GenerationTimeout(timeout))??;

        let mut metadata = Map::new();
        metadata.insert("model".to_string(), json!(self.generator.model_id()));
        metadata.insert("num_sources_used".to_string(), json!(retrieved.len()));

        Ok(QueryResponse {
            answer,
            sources: retrieved,
            context_used: request.context.clone(),
            metadata,
        })
    }

    fn no_context_response(&self, request: &QueryRequest) -> QueryResponse {
        let mut metadata = Map::new();
        metadata.insert("model".to_string(), json!(self.generator.model_id()));
        metadata.insert("num_sources_used".to_string(), Value::from(0));
        metadata.insert("note".to_string(), json!("No relevant context found."));

        QueryResponse {
            answer: NO_CONTEXT_ANSWER.to_string(),
            sources: Vec::new(),
            context_used: request.context.clone(),
            metadata,
        }
    }

    /// Retrieval only, with the metric's raw (unclamped) relevance scores.
    pub async fn similar(&self, question: &str, k: usize) -> Vec<SearchResult> {
        match self.index.search_scored(question, k, None).await {
            Ok(results) => results,
            Err(error) => {
                warn!(question, error = %error, "similarity search failed");
                Vec::new()
            }
        }
    }

    pub async fn stats(&self) -> IndexStats {
        self.index.stats().await
    }
}
