//! Persistent similarity index over embedded chunks.
//!
//! The whole collection lives in one JSON-lines file: loaded wholesale by
//! [`IndexStore::open`], appended to by [`IndexStore::add`], and rewritten
//! through a temporary file by [`IndexStore::remove_source`] and
//! [`IndexStore::replace_source`]. Writers are serialized by a single mutex;
//! readers only take the in-memory read lock and may miss entries that a
//! concurrent writer has not published yet.

use crate::chunking::chunk_fingerprint;
use crate::config::{IndexConfig, SimilarityMetric};
use crate::embeddings::Embedder;
use crate::error::SearchError;
use crate::models::{Chunk, IndexEntry, IndexStats, SearchResult, SourceType};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Texts older deployments seeded into empty collections.
const PLACEHOLDER_TEXTS: [&str; 3] = ["initialization", "initialization text", ""];

pub fn is_placeholder(text: &str) -> bool {
    let normalized = text.trim().to_lowercase();
    PLACEHOLDER_TEXTS.contains(&normalized.as_str())
}

/// A chunk that has been embedded but not yet assigned an id.
struct Prepared<'a> {
    chunk: &'a Chunk,
    content_hash: String,
    embedding: Vec<f32>,
}

pub struct IndexStore {
    path: PathBuf,
    embedder: Arc<dyn Embedder>,
    config: IndexConfig,
    entries: RwLock<Vec<IndexEntry>>,
    writer: Mutex<()>,
}

impl IndexStore {
    /// Loads the index at `path`, or starts an empty one if the file is absent.
    ///
    /// Either every persisted entry loads or the call fails; there is no
    /// partially loaded store. The one exception is an unterminated final
    /// line left by an interrupted append, which is cut off the file.
    pub async fn open(
        path: impl AsRef<Path>,
        embedder: Arc<dyn Embedder>,
        config: IndexConfig,
    ) -> Result<Self, SearchError> {
        let path = path.as_ref().to_path_buf();
        let unavailable = |details: String| SearchError::IndexUnavailable {
            path: path.display().to_string(),
            details,
        };

        let entries = if fs::try_exists(&path)
            .await
            .map_err(|error| unavailable(error.to_string()))?
        {
            let raw = fs::read_to_string(&path)
                .await
                .map_err(|error| unavailable(error.to_string()))?;
            let loaded = parse_entries(&raw, embedder.dimensions()).map_err(unavailable)?;
            if loaded.clean_len != raw.len() || (!raw.is_empty() && !raw.ends_with('\n')) {
                repair_tail(&path, loaded.clean_len, raw[..loaded.clean_len].ends_with('\n'))
                    .await
                    .map_err(|error| unavailable(error.to_string()))?;
            }
            loaded.entries
        } else {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|error| unavailable(error.to_string()))?;
            }
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|error| unavailable(error.to_string()))?;
            Vec::new()
        };

        info!(
            path = %path.display(),
            entries = entries.len(),
            model = embedder.model_id(),
            "index opened"
        );

        Ok(Self {
            path,
            embedder,
            config,
            entries: RwLock::new(entries),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Embeds and persists `chunks`, returning one id per stored chunk.
    ///
    /// A chunk whose fingerprint is already indexed is not stored twice; its
    /// existing id is returned instead, so retried batches are harmless.
    pub async fn add(&self, chunks: &[Chunk]) -> Result<Vec<String>, SearchError> {
        let prepared = self.prepare(chunks).await?;
        if prepared.is_empty() {
            return Ok(Vec::new());
        }

        let _guard = self.writer.lock().await;

        let mut known = fingerprints(&self.entries.read().await);
        let (ids, fresh) = assign_ids(prepared, &mut known);
        if fresh.is_empty() {
            return Ok(ids);
        }

        self.append(&encode_lines(&fresh)?).await?;
        debug!(added = fresh.len(), path = %self.path.display(), "index appended");
        self.entries.write().await.extend(fresh);

        Ok(ids)
    }

    /// Drops every entry of one source document and rewrites the file.
    pub async fn remove_source(
        &self,
        source_type: SourceType,
        source_id: &str,
    ) -> Result<usize, SearchError> {
        let _guard = self.writer.lock().await;

        let (retained, removed) = self.without_source(source_type, source_id).await;
        if removed == 0 {
            return Ok(0);
        }

        self.rewrite(&retained).await?;
        *self.entries.write().await = retained;
        debug!(removed, %source_type, source_id, "index entries removed");

        Ok(removed)
    }

    /// Swaps every entry of one source document for `chunks` in a single
    /// rewrite. If anything fails, the previous entries stay in place.
    pub async fn replace_source(
        &self,
        source_type: SourceType,
        source_id: &str,
        chunks: &[Chunk],
    ) -> Result<Vec<String>, SearchError> {
        let prepared = self.prepare(chunks).await?;

        let _guard = self.writer.lock().await;

        let (mut next, removed) = self.without_source(source_type, source_id).await;
        let mut known = fingerprints(&next);
        let (ids, fresh) = assign_ids(prepared, &mut known);
        let added = fresh.len();
        next.extend(fresh);

        self.rewrite(&next).await?;
        *self.entries.write().await = next;
        debug!(removed, added, %source_type, source_id, "index entries replaced");

        Ok(ids)
    }

    /// Top-`k` entries for `query`, scores clamped to `[0, 1]`.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchResult>, SearchError> {
        self.search_filtered(query, k, None).await
    }

    pub async fn search_filtered(
        &self,
        query: &str,
        k: usize,
        source_types: Option<&[SourceType]>,
    ) -> Result<Vec<SearchResult>, SearchError> {
        Ok(self
            .search_scored(query, k, source_types)
            .await?
            .into_iter()
            .map(|mut result| {
                result.score = result.score.clamp(0.0, 1.0);
                result
            })
            .collect())
    }

    /// Top-`k` entries with the metric's raw relevance, best first.
    ///
    /// Cosine and dot product can be negative and euclidean relevance drops
    /// below zero for distant vectors; callers that need `[0, 1]` use
    /// [`IndexStore::search`].
    pub async fn search_scored(
        &self,
        query: &str,
        k: usize,
        source_types: Option<&[SourceType]>,
    ) -> Result<Vec<SearchResult>, SearchError> {
        if k == 0 || self.is_empty().await {
            return Ok(Vec::new());
        }

        let query_vector = self.embedder.embed(query).await?;
        let expected = self.embedder.dimensions();
        if query_vector.len() != expected {
            return Err(SearchError::DimensionMismatch {
                expected,
                actual: query_vector.len(),
            });
        }

        let entries = self.entries.read().await;
        let mut scored: Vec<(f64, &IndexEntry)> = entries
            .iter()
            .filter(|entry| !is_placeholder(&entry.text))
            .filter(|entry| {
                source_types.map_or(true, |allowed| allowed.contains(&entry.metadata.source_type))
            })
            .map(|entry| {
                (
                    relevance(self.config.similarity_metric, &query_vector, &entry.embedding),
                    entry,
                )
            })
            .collect();

        scored.sort_by(|left, right| right.0.total_cmp(&left.0));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(score, entry)| SearchResult {
                text: entry.text.clone(),
                metadata: entry.metadata.clone(),
                score,
            })
            .collect())
    }

    pub async fn stats(&self) -> IndexStats {
        IndexStats {
            total_entries: self.len().await,
            embedding_model: self.embedder.model_id().to_string(),
            embedding_dimensions: self.embedder.dimensions(),
            chunking: self.config.chunking,
            similarity_metric: self.config.similarity_metric,
        }
    }

    /// Embeds the non-placeholder chunks. Runs before the writer lock is taken.
    async fn prepare<'a>(&self, chunks: &'a [Chunk]) -> Result<Vec<Prepared<'a>>, SearchError> {
        let kept: Vec<&Chunk> = chunks
            .iter()
            .filter(|chunk| {
                let placeholder = is_placeholder(&chunk.text);
                if placeholder {
                    debug!(source_id = %chunk.metadata.source_id, "skipping placeholder chunk");
                }
                !placeholder
            })
            .collect();
        if kept.is_empty() {
            return Ok(Vec::new());
        }

        let texts: Vec<String> = kept.iter().map(|chunk| chunk.text.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;
        if embeddings.len() != kept.len() {
            return Err(SearchError::Embedding(format!(
                "expected {} vectors, got {}",
                kept.len(),
                embeddings.len()
            )));
        }

        let expected = self.embedder.dimensions();
        kept.into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| {
                if embedding.len() != expected {
                    return Err(SearchError::DimensionMismatch {
                        expected,
                        actual: embedding.len(),
                    });
                }
                Ok(Prepared {
                    chunk,
                    content_hash: chunk_fingerprint(chunk),
                    embedding,
                })
            })
            .collect()
    }

    async fn without_source(&self, source_type: SourceType, source_id: &str) -> (Vec<IndexEntry>, usize) {
        let entries = self.entries.read().await;
        let retained: Vec<IndexEntry> = entries
            .iter()
            .filter(|entry| {
                !(entry.metadata.source_type == source_type && entry.metadata.source_id == source_id)
            })
            .cloned()
            .collect();
        let removed = entries.len() - retained.len();
        (retained, removed)
    }

    /// Appends `payload`; on failure the file is cut back to its prior length.
    async fn append(&self, payload: &str) -> Result<(), SearchError> {
        let original_len = match fs::metadata(&self.path).await {
            Ok(metadata) => metadata.len(),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => 0,
            Err(error) => return Err(error.into()),
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        if let Err(error) = write_synced(&mut file, payload.as_bytes()).await {
            warn!(path = %self.path.display(), error = %error, "append failed, truncating");
            if let Err(rollback) = file.set_len(original_len).await {
                warn!(path = %self.path.display(), error = %rollback, "truncate after failed append failed");
            }
            return Err(error.into());
        }
        Ok(())
    }

    /// Replaces the file with `entries` through a temporary file and a rename.
    async fn rewrite(&self, entries: &[IndexEntry]) -> Result<(), SearchError> {
        let payload = encode_lines(entries)?;
        let staging = self.path.with_extension("jsonl.tmp");

        let written = async {
            let mut file = fs::File::create(&staging).await?;
            write_synced(&mut file, payload.as_bytes()).await?;
            drop(file);
            fs::rename(&staging, &self.path).await
        }
        .await;

        if let Err(error) = written {
            if fs::try_exists(&staging).await.unwrap_or(false) {
                if let Err(cleanup) = fs::remove_file(&staging).await {
                    debug!(path = %staging.display(), error = %cleanup, "staging file left behind");
                }
            }
            return Err(error.into());
        }
        Ok(())
    }
}

async fn write_synced(file: &mut fs::File, payload: &[u8]) -> std::io::Result<()> {
    file.write_all(payload).await?;
    file.flush().await?;
    file.sync_data().await
}

fn fingerprints(entries: &[IndexEntry]) -> HashMap<String, String> {
    entries
        .iter()
        .map(|entry| (entry.content_hash.clone(), entry.id.clone()))
        .collect()
}

/// One id per prepared chunk; only chunks with unseen fingerprints become entries.
fn assign_ids(
    prepared: Vec<Prepared<'_>>,
    known: &mut HashMap<String, String>,
) -> (Vec<String>, Vec<IndexEntry>) {
    let mut ids = Vec::with_capacity(prepared.len());
    let mut fresh = Vec::new();
    for Prepared {
        chunk,
        content_hash,
        embedding,
    } in prepared
    {
        if let Some(existing) = known.get(&content_hash) {
            ids.push(existing.clone());
            continue;
        }
        let entry = IndexEntry {
            id: Uuid::new_v4().to_string(),
            text: chunk.text.clone(),
            metadata: chunk.metadata.clone(),
            embedding,
            content_hash: content_hash.clone(),
            ingested_at: Utc::now(),
        };
        known.insert(content_hash, entry.id.clone());
        ids.push(entry.id.clone());
        fresh.push(entry);
    }
    (ids, fresh)
}

fn encode_lines(entries: &[IndexEntry]) -> Result<String, SearchError> {
    let mut payload = String::new();
    for entry in entries {
        payload.push_str(&serde_json::to_string(entry)?);
        payload.push('\n');
    }
    Ok(payload)
}

struct LoadedEntries {
    entries: Vec<IndexEntry>,
    /// Byte length of the file up to the last line worth keeping.
    clean_len: usize,
}

fn parse_entries(raw: &str, dimensions: usize) -> Result<LoadedEntries, String> {
    let mut entries = Vec::new();
    let mut offset = 0;
    for (line_no, line) in raw.split_inclusive('\n').enumerate() {
        let start = offset;
        offset += line.len();
        if line.trim().is_empty() {
            continue;
        }
        let entry: IndexEntry = match serde_json::from_str(line.trim_end()) {
            Ok(entry) => entry,
            Err(error) if !line.ends_with('\n') => {
                warn!(line = line_no + 1, error = %error, "dropping torn final index line");
                return Ok(LoadedEntries {
                    entries,
                    clean_len: start,
                });
            }
            Err(error) => return Err(format!("line {}: {error}", line_no + 1)),
        };
        if is_placeholder(&entry.text) {
            continue;
        }
        if entry.embedding.len() != dimensions {
            return Err(format!(
                "line {}: embedding dimension {} does not match {dimensions}",
                line_no + 1,
                entry.embedding.len()
            ));
        }
        entries.push(entry);
    }
    Ok(LoadedEntries {
        entries,
        clean_len: raw.len(),
    })
}

/// Cuts a torn tail off the file so later appends start on a fresh line.
async fn repair_tail(path: &Path, clean_len: usize, ends_with_newline: bool) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(clean_len as u64).await?;
    if clean_len > 0 && !ends_with_newline {
        let mut file = OpenOptions::new().append(true).open(path).await?;
        write_synced(&mut file, b"\n").await?;
    } else {
        file.sync_data().await?;
    }
    Ok(())
}

/// Higher is more similar for every metric.
pub fn relevance(metric: SimilarityMetric, query: &[f32], candidate: &[f32]) -> f64 {
    match metric {
        SimilarityMetric::Cosine => cosine_similarity(query, candidate),
        SimilarityMetric::Euclidean => 1.0 - euclidean_distance(query, candidate) / 2f64.sqrt(),
        SimilarityMetric::DotProduct => dot(query, candidate),
    }
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(x, y)| f64::from(*x) * f64::from(*y)).sum()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let magnitude_a = dot(a, a).sqrt();
    let magnitude_b = dot(b, b).sqrt();
    if magnitude_a < f64::EPSILON || magnitude_b < f64::EPSILON {
        0.0
    } else {
        dot(a, b) / (magnitude_a * magnitude_b)
    }
}

fn euclidean_distance(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let delta = f64::from(*x) - f64::from(*y);
            delta * delta
        })
        .sum::<f64>()
        .sqrt()
}
