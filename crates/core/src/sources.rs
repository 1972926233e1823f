//! HTTP clients for the external document sources.
//!
//! Each client fetches raw payloads and hands them to the extractor. A page
//! that fails on its own is reported in [`FetchedDocuments::skipped`] instead
//! of failing the batch.

use crate::error::IngestError;
use crate::extractor::{extract_confluence_page, extract_google_doc_text, extract_notion_page};
use crate::ingest::SkippedDocument;
use crate::models::{SourceDocument, SourceType};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;
use url::Url;

pub const NOTION_API_URL: &str = "https://api.notion.com";
pub const NOTION_VERSION: &str = "2022-06-28";
pub const GOOGLE_API_URL: &str = "https://www.googleapis.com";

/// Which part of a source to ingest. Fields irrelevant to a source are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceSelector {
    /// Notion database to query; the whole workspace search when absent.
    pub database_id: Option<String>,
    /// Google Doc id.
    pub document_id: Option<String>,
    /// Confluence site root, e.g. `https://acme.atlassian.net/wiki`.
    pub base_url: Option<String>,
    pub space_key: Option<String>,
}

#[derive(Debug, Default)]
pub struct FetchedDocuments {
    pub documents: Vec<SourceDocument>,
    pub skipped: Vec<SkippedDocument>,
}

#[async_trait]
pub trait SourceClient: Send + Sync {
    fn source_type(&self) -> SourceType;

    async fn fetch(
        &self,
        token: &str,
        selector: &SourceSelector,
    ) -> Result<FetchedDocuments, IngestError>;
}

async fn send_json(request: RequestBuilder, source_name: &str) -> Result<Value, IngestError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(IngestError::SourceResponse {
            source_name: source_name.to_string(),
            details: format!("{status}: {}", body.chars().take(300).collect::<String>()),
        });
    }
    Ok(response.json().await?)
}

/// Cursor for the next Notion page of results, if the listing goes on.
pub fn next_cursor(payload: &Value) -> Option<String> {
    let has_more = payload.get("has_more").and_then(Value::as_bool).unwrap_or(false);
    if !has_more {
        return None;
    }
    payload
        .get("next_cursor")
        .and_then(Value::as_str)
        .filter(|cursor| !cursor.is_empty())
        .map(str::to_string)
}

/// Absolute URL of the next Confluence result page, if there is one.
pub fn confluence_next_url(payload: &Value, site: &str) -> Option<String> {
    payload
        .pointer("/_links/next")
        .and_then(Value::as_str)
        .filter(|path| !path.is_empty())
        .map(|path| format!("{}{path}", site.trim_end_matches('/')))
}

/// Request body for a Notion page listing, either a database query or a
/// workspace search restricted to pages.
pub fn notion_list_body(database_id: Option<&str>, cursor: Option<&str>) -> Value {
    let mut body = match database_id {
        Some(_) => json!({ "page_size": 100 }),
        None => json!({
            "page_size": 100,
            "filter": { "property": "object", "value": "page" }
        }),
    };
    if let Some(cursor) = cursor {
        body["start_cursor"] = json!(cursor);
    }
    body
}

fn results_of(payload: &Value) -> Vec<Value> {
    payload
        .get("results")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

pub struct NotionClient {
    client: Client,
    api_url: String,
}

impl NotionClient {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn authorized(&self, request: RequestBuilder, token: &str) -> RequestBuilder {
        request
            .bearer_auth(token)
            .header("Notion-Version", NOTION_VERSION)
    }

    async fn list_pages(&self, token: &str, database_id: Option<&str>) -> Result<Vec<Value>, IngestError> {
        let endpoint = match database_id {
            Some(database_id) => format!("{}/v1/databases/{database_id}/query", self.api_url),
            None => format!("{}/v1/search", self.api_url),
        };
        let mut pages = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let request = self
                .client
                .post(endpoint.as_str())
                .json(&notion_list_body(database_id, cursor.as_deref()));
            let payload = send_json(self.authorized(request, token), "notion").await?;
            pages.extend(results_of(&payload));

            cursor = next_cursor(&payload);
            if cursor.is_none() {
                break;
            }
        }
        Ok(pages)
    }

    async fn page_blocks(&self, token: &str, page_id: &str) -> Result<Vec<Value>, IngestError> {
        let mut blocks = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut request = self
                .client
                .get(format!("{}/v1/blocks/{page_id}/children", self.api_url))
                .query(&[("page_size", "100")]);
            if let Some(cursor) = &cursor {
                request = request.query(&[("start_cursor", cursor.as_str())]);
            }
            let payload = send_json(self.authorized(request, token), "notion").await?;
            blocks.extend(results_of(&payload));

            cursor = next_cursor(&payload);
            if cursor.is_none() {
                break;
            }
        }
        Ok(blocks)
    }
}

impl Default for NotionClient {
    fn default() -> Self {
        Self::new(NOTION_API_URL)
    }
}

#[async_trait]
impl SourceClient for NotionClient {
    fn source_type(&self) -> SourceType {
        SourceType::Notion
    }

    async fn fetch(
        &self,
        token: &str,
        selector: &SourceSelector,
    ) -> Result<FetchedDocuments, IngestError> {
        let pages = self.list_pages(token, selector.database_id.as_deref()).await?;
        let mut fetched = FetchedDocuments::default();

        for page in pages {
            let page_id = page
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let document = match self.page_blocks(token, &page_id).await {
                Ok(blocks) => extract_notion_page(&page, &blocks),
                Err(error) => Err(error),
            };
            match document {
                Ok(document) => fetched.documents.push(document),
                Err(error) => {
                    warn!(page_id = %page_id, error = %error, "skipping notion page");
                    fetched.skipped.push(SkippedDocument {
                        source_id: page_id,
                        reason: error.to_string(),
                    });
                }
            }
        }

        Ok(fetched)
    }
}

pub struct GoogleDocsClient {
    client: Client,
    api_url: String,
}

impl GoogleDocsClient {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Default for GoogleDocsClient {
    fn default() -> Self {
        Self::new(GOOGLE_API_URL)
    }
}

/// Google tokens are stored either as a bare access token or as the OAuth
/// token JSON (`{"token": ..}` or `{"access_token": ..}`).
pub fn google_access_token(stored: &str) -> String {
    serde_json::from_str::<Value>(stored)
        .ok()
        .and_then(|value| {
            value
                .get("token")
                .or_else(|| value.get("access_token"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| stored.trim().to_string())
}

#[async_trait]
impl SourceClient for GoogleDocsClient {
    fn source_type(&self) -> SourceType {
        SourceType::GoogleDocs
    }

    async fn fetch(
        &self,
        token: &str,
        selector: &SourceSelector,
    ) -> Result<FetchedDocuments, IngestError> {
        let document_id = selector
            .document_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                IngestError::InvalidArgument("a google document id is required".to_string())
            })?;

        let response = self
            .client
            .get(format!("{}/drive/v3/files/{document_id}/export", self.api_url))
            .query(&[("mimeType", "text/plain")])
            .bearer_auth(google_access_token(token))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::SourceResponse {
                source_name: "google_docs".to_string(),
                details: status.to_string(),
            });
        }
        let text = response.text().await?;

        Ok(FetchedDocuments {
            documents: vec![extract_google_doc_text(document_id, &text)],
            skipped: Vec::new(),
        })
    }
}

pub struct ConfluenceClient {
    client: Client,
    page_limit: usize,
}

impl ConfluenceClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            page_limit: 50,
        }
    }
}

impl Default for ConfluenceClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Confluence tokens are stored as `username:api_token`.
pub fn split_confluence_token(token: &str) -> Result<(&str, &str), IngestError> {
    token
        .split_once(':')
        .filter(|(username, api_token)| !username.is_empty() && !api_token.is_empty())
        .ok_or_else(|| {
            IngestError::InvalidArgument(
                "confluence token must look like `username:api_token`".to_string(),
            )
        })
}

pub fn confluence_content_url(
    base_url: &str,
    space_key: Option<&str>,
    limit: usize,
) -> Result<Url, IngestError> {
    let mut url = Url::parse(&format!("{}/rest/api/content", base_url.trim_end_matches('/')))?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("type", "page")
            .append_pair("expand", "body.storage")
            .append_pair("limit", &limit.to_string());
        if let Some(space_key) = space_key.filter(|key| !key.trim().is_empty()) {
            query.append_pair("spaceKey", space_key);
        }
    }
    Ok(url)
}

#[async_trait]
impl SourceClient for ConfluenceClient {
    fn source_type(&self) -> SourceType {
        SourceType::Confluence
    }

    async fn fetch(
        &self,
        token: &str,
        selector: &SourceSelector,
    ) -> Result<FetchedDocuments, IngestError> {
        let (username, api_token) = split_confluence_token(token)?;
        let base_url = selector
            .base_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                IngestError::InvalidArgument("a confluence base url is required".to_string())
            })?;
        let site = base_url.trim_end_matches('/');

        let mut next = Some(
            confluence_content_url(site, selector.space_key.as_deref(), self.page_limit)?.to_string(),
        );
        let mut fetched = FetchedDocuments::default();

        while let Some(url) = next.take() {
            let request = self.client.get(url.as_str()).basic_auth(username, Some(api_token));
            let payload = send_json(request, "confluence").await?;

            for page in results_of(&payload) {
                match extract_confluence_page(&page, site) {
                    Ok(document) => fetched.documents.push(document),
                    Err(error) => fetched.skipped.push(SkippedDocument {
                        source_id: page
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown")
                            .to_string(),
                        reason: error.to_string(),
                    }),
                }
            }

            next = confluence_next_url(&payload, site);
        }

        Ok(fetched)
    }
}
