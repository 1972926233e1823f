//! Turns source-specific payloads into [`SourceDocument`]s.
//!
//! Every function here is a pure transform. Missing or partial fields are
//! replaced with defaults so one odd page never sinks a whole batch.

use crate::error::IngestError;
use crate::models::{SourceDocument, SourceType, UNTITLED};
use regex::{Captures, Regex};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

pub fn extract_notion_page(page: &Value, blocks: &[Value]) -> Result<SourceDocument, IngestError> {
    ensure_object(page, "notion page")?;

    let title = notion_title(page).unwrap_or_else(|| UNTITLED.to_string());
    let raw_content = notion_blocks_to_text(blocks);
    let source_id = string_at(page, "/id").unwrap_or_else(|| {
        let fallback = fallback_id(&title, &raw_content);
        debug!(source_id = %fallback, "notion page has no id");
        fallback
    });

    Ok(SourceDocument {
        source_type: SourceType::Notion,
        source_id,
        title,
        url: string_at(page, "/url"),
        raw_content,
    })
}

fn notion_title(page: &Value) -> Option<String> {
    if let Some(title) = page
        .pointer("/properties/title/title")
        .and_then(rich_text_content)
    {
        return Some(title);
    }

    page.pointer("/properties")
        .and_then(Value::as_object)?
        .values()
        .filter(|property| property.get("type").and_then(Value::as_str) == Some("title"))
        .find_map(|property| property.get("title").and_then(rich_text_content))
}

/// Renders Notion blocks in order, one paragraph per block.
pub fn notion_blocks_to_text(blocks: &[Value]) -> String {
    blocks
        .iter()
        .filter_map(notion_block_line)
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn notion_block_line(block: &Value) -> Option<String> {
    let block_type = block.get("type").and_then(Value::as_str)?;
    let body = block.get(block_type);
    let text = body.and_then(block_rich_text).unwrap_or_default();

    let line = match block_type {
        "paragraph" => text,
        "heading_1" => format!("# {text}"),
        "heading_2" => format!("## {text}"),
        "heading_3" => format!("### {text}"),
        "bulleted_list_item" | "numbered_list_item" => format!("- {text}"),
        "to_do" => {
            let checked = body
                .and_then(|value| value.get("checked"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            format!("[{}] {text}", if checked { "x" } else { " " })
        }
        "quote" | "callout" => format!("> {text}"),
        "code" => text,
        _ => return None,
    };

    Some(line)
}

/// Supports both the current `rich_text` key and the legacy `text` key.
fn block_rich_text(body: &Value) -> Option<String> {
    body.get("rich_text")
        .or_else(|| body.get("text"))
        .and_then(rich_text_content)
}

fn rich_text_content(runs: &Value) -> Option<String> {
    let runs = runs.as_array()?;
    let text = runs
        .iter()
        .filter_map(|run| {
            run.get("plain_text")
                .and_then(Value::as_str)
                .or_else(|| run.pointer("/text/content").and_then(Value::as_str))
        })
        .collect::<String>();

    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// A Google Doc exported through Drive as `text/plain`.
pub fn extract_google_doc_text(document_id: &str, exported_text: &str) -> SourceDocument {
    let title = format!("Google Doc {document_id}");
    let raw_content = exported_text.trim_start_matches('\u{feff}').to_string();
    SourceDocument {
        source_type: SourceType::GoogleDocs,
        source_id: id_or_fallback(document_id, &title, &raw_content),
        title,
        url: Some(google_doc_url(document_id)),
        raw_content,
    }
}

/// A Google Doc as returned by the Docs API (`documents.get`).
pub fn extract_google_doc_structured(
    document_id: &str,
    document: &Value,
) -> Result<SourceDocument, IngestError> {
    ensure_object(document, "google doc")?;

    let raw_content = document
        .pointer("/body/content")
        .and_then(Value::as_array)
        .map(|elements| {
            elements
                .iter()
                .filter_map(|element| element.pointer("/paragraph/elements"))
                .filter_map(Value::as_array)
                .flatten()
                .filter_map(|run| run.pointer("/textRun/content").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default();

    let title =
        string_at(document, "/title").unwrap_or_else(|| format!("Google Doc {document_id}"));
    Ok(SourceDocument {
        source_type: SourceType::GoogleDocs,
        source_id: id_or_fallback(document_id, &title, &raw_content),
        title,
        url: Some(google_doc_url(document_id)),
        raw_content,
    })
}

fn google_doc_url(document_id: &str) -> String {
    format!("https://docs.google.com/document/d/{document_id}/edit")
}

/// A page from the Confluence content API with `body.storage` expanded.
pub fn extract_confluence_page(page: &Value, base_url: &str) -> Result<SourceDocument, IngestError> {
    ensure_object(page, "confluence page")?;

    let base = string_at(page, "/_links/base").unwrap_or_else(|| base_url.to_string());
    let url = string_at(page, "/_links/webui")
        .map(|path| format!("{}{}", base.trim_end_matches('/'), path));
    let storage = page
        .pointer("/body/storage/value")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let title = string_at(page, "/title").unwrap_or_else(|| UNTITLED.to_string());
    let raw_content = storage_markup_to_text(storage)?;
    let source_id =
        string_at(page, "/id").unwrap_or_else(|| fallback_id(&title, &raw_content));

    Ok(SourceDocument {
        source_type: SourceType::Confluence,
        title,
        source_id,
        url,
        raw_content,
    })
}

/// Strips Confluence storage markup down to text, keeping headings as `#` markers.
pub fn storage_markup_to_text(markup: &str) -> Result<String, IngestError> {
    let heading_re = Regex::new(r"(?i)<h([1-6])[^>]*>")?;
    let block_end_re = Regex::new(r"(?i)<br\s*/?>|</(p|div|h[1-6]|li|tr|pre|blockquote|table)>")?;
    let list_item_re = Regex::new(r"(?i)<li[^>]*>")?;
    let tag_re = Regex::new(r"<[^>]+>")?;
    let blank_lines_re = Regex::new(r"\n[ \t]*(\n[ \t]*)+")?;

    let text = heading_re.replace_all(markup, |captures: &Captures| {
        let level = captures[1].parse::<usize>().unwrap_or(1);
        format!("\n{} ", "#".repeat(level))
    });
    let text = list_item_re.replace_all(&text, "\n- ");
    let text = block_end_re.replace_all(&text, "\n\n");
    let text = tag_re.replace_all(&text, "");
    let text = decode_entities(&text);
    let text = blank_lines_re.replace_all(&text, "\n\n");

    Ok(text.trim().to_string())
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn ensure_object(payload: &Value, kind: &str) -> Result<(), IngestError> {
    if payload.is_object() {
        Ok(())
    } else {
        Err(IngestError::Extraction(format!(
            "{kind} payload is not an object"
        )))
    }
}

fn string_at(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn id_or_fallback(value: &str, title: &str, content: &str) -> String {
    if value.trim().is_empty() {
        fallback_id(title, content)
    } else {
        value.trim().to_string()
    }
}

/// Stable id for a payload that carries none, derived from what it says.
/// Distinct documents get distinct ids, so one cannot replace another.
fn fallback_id(title: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("unknown-{}", &digest[..16])
}
