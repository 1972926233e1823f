use crate::error::IngestError;
use crate::models::{Chunk, ChunkMetadata, SourceDocument};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;

pub const MIN_CHUNK_SIZE: usize = 100;
pub const MAX_CHUNK_SIZE: usize = 2_000;
pub const MAX_CHUNK_OVERLAP: usize = 500;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LengthUnit {
    #[default]
    #[serde(alias = "char")]
    Character,
    Token,
}

impl FromStr for LengthUnit {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "character" | "char" | "chars" => Ok(LengthUnit::Character),
            "token" | "tokens" => Ok(LengthUnit::Token),
            other => Err(format!("unsupported length unit: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    #[serde(default)]
    pub unit: LengthUnit,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            chunk_overlap: 200,
            unit: LengthUnit::Character,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(IngestError::InvalidChunkConfig(format!(
                "chunk_size {} is outside {MIN_CHUNK_SIZE}..={MAX_CHUNK_SIZE}",
                self.chunk_size
            )));
        }
        if self.chunk_overlap > MAX_CHUNK_OVERLAP {
            return Err(IngestError::InvalidChunkConfig(format!(
                "chunk_overlap {} exceeds {MAX_CHUNK_OVERLAP}",
                self.chunk_overlap
            )));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "chunk_overlap {} must be smaller than chunk_size {}",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }

    fn step(&self) -> usize {
        self.chunk_size - self.chunk_overlap
    }
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('\u{a0}', " ")
}

/// Byte offsets where each unit starts, plus `text.len()` as the final entry.
///
/// A token is a run of non-whitespace plus the whitespace after it; leading
/// whitespace belongs to the first token so the units always cover the text.
fn unit_boundaries(text: &str, unit: LengthUnit) -> Vec<usize> {
    let mut bounds = match unit {
        LengthUnit::Character => text.char_indices().map(|(offset, _)| offset).collect(),
        LengthUnit::Token => {
            let mut bounds = vec![0];
            let mut seen_word = false;
            let mut previous_was_space = false;
            for (offset, ch) in text.char_indices() {
                let is_space = ch.is_whitespace();
                if !is_space && previous_was_space && seen_word {
                    bounds.push(offset);
                }
                seen_word |= !is_space;
                previous_was_space = is_space;
            }
            bounds
        }
    };
    bounds.push(text.len());
    bounds
}

/// Splits `text` into windows of at most `chunk_size` units, each starting
/// `chunk_size - chunk_overlap` units after the previous one.
pub fn split_text(text: &str, config: &ChunkingConfig) -> Result<Vec<String>, IngestError> {
    config.validate()?;

    if text.is_empty() {
        return Ok(Vec::new());
    }

    let bounds = unit_boundaries(text, config.unit);
    let unit_count = bounds.len() - 1;
    let mut chunks = Vec::new();
    let mut start = 0;

    loop {
        let end = (start + config.chunk_size).min(unit_count);
        chunks.push(text[bounds[start]..bounds[end]].to_string());
        if end == unit_count {
            break;
        }
        start += config.step();
    }

    Ok(chunks)
}

pub fn build_chunks(
    document: &SourceDocument,
    config: &ChunkingConfig,
) -> Result<Vec<Chunk>, IngestError> {
    if document.raw_content.trim().is_empty() {
        return Ok(Vec::new());
    }

    Ok(split_text(&document.raw_content, config)?
        .into_iter()
        .enumerate()
        .map(|(index, text)| Chunk {
            text,
            metadata: ChunkMetadata::for_document(document, index as u64),
        })
        .collect())
}

/// Stable identity of a chunk's content and position, used for dedup.
pub fn chunk_fingerprint(chunk: &Chunk) -> String {
    let mut hasher = Sha256::new();
    hasher.update(chunk.metadata.source_type.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(chunk.metadata.source_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(chunk.metadata.chunk_index.to_le_bytes());
    hasher.update(chunk.text.as_bytes());
    format!("{:x}", hasher.finalize())
}
