//! Compute-once embedding cache with gzip persistence and vector-store upload.
//!
//! Entries are keyed by a blake3 hash of content + metadata. A lookup never
//! blocks on I/O; file writes are serialised behind a mutex and go through a
//! temp file + rename so a crash never leaves a half-written cache. Saves
//! triggered from async paths run on the blocking pool.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use dashmap::DashMap;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::llm::embeddings::{EmbeddingClient, EmbeddingServiceUnavailable};
use crate::search::qdrant::{UpsertPoint, VectorStore};
use crate::search::sparse::SparseEncoder;

const CACHE_FILE: &str = "embeddings_cache.gz";
const FORMAT_VERSION: u32 = 2;
/// Save after this many new embeddings.
const AUTO_SAVE_EVERY: usize = 50;
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingCacheError {
    #[error("Invalid cache filename '{0}'")]
    InvalidFilename(String),
    #[error("Cache I/O failed for {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Unreadable cache file {}: {message}", .path.display())]
    Format { path: PathBuf, message: String },
    #[error("Upload failed for batch starting at entry {start}: {message}")]
    Upload { start: usize, message: String },
    #[error(transparent)]
    Embedding(#[from] EmbeddingServiceUnavailable),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> EmbeddingCacheError + '_ {
    move |source| EmbeddingCacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ─── Entry types ─────────────────────────────────────────

/// Known metadata fields plus everything else, kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_start: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_end: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_metadata: BTreeMap<String, Value>,
}

impl EmbeddingMetadata {
    /// Normalise a free-form legacy metadata map. Values of known keys that
    /// don't fit the typed field stay in `additional_metadata` unchanged.
    pub fn from_legacy(map: Map<String, Value>) -> Self {
        let mut meta = Self::default();
        for (key, value) in map {
            let leftover = match key.as_str() {
                "url" => put_string(&mut meta.url, value),
                "title" => put_string(&mut meta.title, value),
                "package" => put_string(&mut meta.package, value),
                "hash" => put_string(&mut meta.hash, value),
                "retrievalSource" => put_string(&mut meta.retrieval_source, value),
                "fallbackReason" => put_string(&mut meta.fallback_reason, value),
                "chunkIndex" => put_int(&mut meta.chunk_index, value),
                "pageStart" => put_int(&mut meta.page_start, value),
                "pageEnd" => put_int(&mut meta.page_end, value),
                _ => Some(value),
            };
            if let Some(value) = leftover {
                meta.additional_metadata.insert(key, value);
            }
        }
        meta
    }

    /// Flattened store payload fields.
    fn to_payload(&self) -> Map<String, Value> {
        let mut payload = Map::new();
        for (key, value) in &self.additional_metadata {
            payload.insert(key.clone(), value.clone());
        }
        if let Ok(Value::Object(known)) = serde_json::to_value(Self {
            additional_metadata: BTreeMap::new(),
            ..self.clone()
        }) {
            payload.extend(known);
        }
        payload
    }
}

fn put_string(slot: &mut Option<String>, value: Value) -> Option<Value> {
    match value {
        Value::String(s) => {
            *slot = Some(s);
            None
        }
        Value::Null => None,
        other => Some(other),
    }
}

fn put_int(slot: &mut Option<i64>, value: Value) -> Option<Value> {
    let parsed = match &value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Null => return None,
        _ => None,
    };
    match parsed {
        Some(n) => {
            *slot = Some(n);
            None
        }
        None => Some(value),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedEmbedding {
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub uploaded: bool,
    #[serde(default)]
    pub metadata: EmbeddingMetadata,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheFile {
    version: u32,
    saved_at: DateTime<Utc>,
    entries: Vec<CachedEmbedding>,
}

/// Older flat layout: a bare array, free-form metadata, zone-less timestamps.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    embedding: Vec<f32>,
    #[serde(default)]
    created_at: Option<Value>,
    #[serde(default)]
    uploaded: bool,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
}

/// Accepts RFC 3339, naive ISO local date-times, `[y,m,d,h,min,s,nanos]`
/// arrays and epoch milliseconds.
fn parse_legacy_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            }),
        Value::Array(parts) => {
            let n: Vec<i64> = parts.iter().filter_map(Value::as_i64).collect();
            let get = |i: usize| n.get(i).copied().unwrap_or(0);
            NaiveDate::from_ymd_opt(get(0) as i32, get(1) as u32, get(2) as u32)?
                .and_hms_nano_opt(get(3) as u32, get(4) as u32, get(5) as u32, get(6) as u32)
                .map(|naive| naive.and_utc())
        }
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

impl From<LegacyEntry> for CachedEmbedding {
    fn from(legacy: LegacyEntry) -> Self {
        let id = legacy
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            id,
            content: legacy.content,
            embedding: legacy.embedding,
            created_at: legacy
                .created_at
                .as_ref()
                .and_then(parse_legacy_timestamp)
                .unwrap_or_else(Utc::now),
            uploaded: legacy.uploaded,
            metadata: EmbeddingMetadata::from_legacy(legacy.metadata.unwrap_or_default()),
        }
    }
}

fn cache_key(content: &str, metadata: &EmbeddingMetadata) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(content.as_bytes());
    hasher.update(b"\0");
    if let Ok(meta) = serde_json::to_vec(metadata) {
        hasher.update(&meta);
    }
    hasher.finalize().to_hex().to_string()
}

/// Reject anything that could escape the cache directory.
pub fn validate_filename(name: &str) -> Result<&str, EmbeddingCacheError> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed.contains("..")
        || trimmed.contains('/')
        || trimmed.contains('\\')
        || trimmed.contains(':')
    {
        return Err(EmbeddingCacheError::InvalidFilename(name.to_string()));
    }
    Ok(trimmed)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_embeddings: usize,
    pub uploaded: usize,
    pub pending: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub cache_dir: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReport {
    pub uploaded: usize,
    pub batches: usize,
}

// ─── Cache ───────────────────────────────────────────────

pub struct EmbeddingCache {
    dir: PathBuf,
    entries: Arc<DashMap<String, CachedEmbedding>>,
    embedder: Arc<dyn EmbeddingClient>,
    store: Arc<dyn VectorStore>,
    sparse: SparseEncoder,
    upload_collection: String,
    hits: AtomicU64,
    misses: AtomicU64,
    unsaved: AtomicUsize,
    file_lock: Arc<Mutex<()>>,
}

impl EmbeddingCache {
    /// Open (or create) the cache in `dir`. A corrupt cache file is moved
    /// aside and the cache starts empty.
    pub fn open(
        dir: &Path,
        embedder: Arc<dyn EmbeddingClient>,
        store: Arc<dyn VectorStore>,
        upload_collection: &str,
    ) -> Result<Self, EmbeddingCacheError> {
        std::fs::create_dir_all(dir).map_err(io_err(dir))?;

        let cache = Self {
            dir: dir.to_path_buf(),
            entries: Arc::new(DashMap::new()),
            embedder,
            store,
            sparse: SparseEncoder::new(),
            upload_collection: upload_collection.to_string(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            unsaved: AtomicUsize::new(0),
            file_lock: Arc::new(Mutex::new(())),
        };

        let path = cache.cache_path();
        if path.exists() {
            match read_cache_file(&path) {
                Ok(entries) => {
                    let count = entries.len();
                    cache.insert_all(entries);
                    tracing::info!("[CACHE] loaded {count} embeddings from {}", path.display());
                }
                Err(EmbeddingCacheError::Format { message, .. }) => {
                    let quarantine = dir.join(format!(
                        "embeddings_cache.corrupt.{}.gz",
                        Utc::now().format(TIMESTAMP_FORMAT)
                    ));
                    std::fs::rename(&path, &quarantine).map_err(io_err(&path))?;
                    tracing::warn!(
                        "[CACHE] cache file unreadable ({message}); moved to {} and starting empty",
                        quarantine.display()
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Ok(cache)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.dir.join(CACHE_FILE)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert_all(&self, entries: Vec<CachedEmbedding>) {
        for entry in entries {
            self.entries.insert(cache_key(&entry.content, &entry.metadata), entry);
        }
    }

    /// Embeddings for `items` in input order. Cached entries are reused; all
    /// misses go to the provider in one call.
    pub async fn get_or_compute(
        &self,
        items: &[(String, EmbeddingMetadata)],
    ) -> Result<Vec<Vec<f32>>, EmbeddingCacheError> {
        let keys: Vec<String> = items.iter().map(|(c, m)| cache_key(c, m)).collect();
        let mut results: Vec<Option<Vec<f32>>> = vec![None; items.len()];
        let mut missing: Vec<usize> = Vec::new();
        let mut queued: HashSet<&str> = HashSet::new();

        for (i, key) in keys.iter().enumerate() {
            if let Some(entry) = self.entries.get(key) {
                results[i] = Some(entry.embedding.clone());
                self.hits.fetch_add(1, Ordering::Relaxed);
            } else if queued.insert(key.as_str()) {
                missing.push(i);
                self.misses.fetch_add(1, Ordering::Relaxed);
            }
        }

        if !missing.is_empty() {
            let texts: Vec<String> = missing.iter().map(|&i| items[i].0.clone()).collect();
            let vectors = self.embedder.embed(&texts).await?;

            for (&i, vector) in missing.iter().zip(vectors) {
                let (content, metadata) = &items[i];
                self.entries.entry(keys[i].clone()).or_insert_with(|| CachedEmbedding {
                    id: Uuid::new_v4().to_string(),
                    content: content.clone(),
                    embedding: vector,
                    created_at: Utc::now(),
                    uploaded: false,
                    metadata: metadata.clone(),
                });
                if self.unsaved.fetch_add(1, Ordering::Relaxed) + 1 >= AUTO_SAVE_EVERY {
                    self.flush().await?;
                }
            }
            if self.unsaved.load(Ordering::Relaxed) > 0 {
                self.flush().await?;
            }
        }

        // Fill in-batch duplicates and newly computed slots from the map.
        for (i, key) in keys.iter().enumerate() {
            if results[i].is_none() {
                results[i] = self.entries.get(key).map(|e| e.embedding.clone());
            }
        }
        results
            .into_iter()
            .enumerate()
            .map(|(i, r)| {
                r.ok_or_else(|| {
                    EmbeddingCacheError::from(EmbeddingServiceUnavailable::new(
                        format!("{} provider returned no embedding for input {i}", self.embedder.name()),
                        None,
                    ))
                })
            })
            .collect()
    }

    fn write_file(&self, path: &Path) -> Result<usize, EmbeddingCacheError> {
        write_locked(&self.entries, &self.file_lock, path)
    }

    /// Persist the whole cache to the main cache file.
    pub fn save(&self) -> Result<(), EmbeddingCacheError> {
        self.unsaved.store(0, Ordering::Relaxed);
        let count = self.write_file(&self.cache_path())?;
        tracing::debug!("[CACHE] saved {count} embeddings");
        Ok(())
    }

    /// [`save`](Self::save) on the blocking pool, for callers on the runtime.
    async fn flush(&self) -> Result<(), EmbeddingCacheError> {
        self.unsaved.store(0, Ordering::Relaxed);
        let entries = self.entries.clone();
        let lock = self.file_lock.clone();
        let path = self.cache_path();
        let count = tokio::task::spawn_blocking(move || write_locked(&entries, &lock, &path))
            .await
            .map_err(|e| EmbeddingCacheError::Io {
                path: self.cache_path(),
                source: std::io::Error::other(format!("cache save task failed: {e}")),
            })??;
        tracing::debug!("[CACHE] saved {count} embeddings");
        Ok(())
    }

    pub fn save_snapshot(&self) -> Result<PathBuf, EmbeddingCacheError> {
        let path = self.dir.join(format!(
            "embeddings_snapshot_{}.gz",
            Utc::now().format(TIMESTAMP_FORMAT)
        ));
        let count = self.write_file(&path)?;
        tracing::info!("[CACHE] snapshot of {count} embeddings written to {}", path.display());
        Ok(path)
    }

    pub fn export(&self, filename: &str) -> Result<PathBuf, EmbeddingCacheError> {
        let path = self.dir.join(validate_filename(filename)?);
        let count = self.write_file(&path)?;
        tracing::info!("[CACHE] exported {count} embeddings to {}", path.display());
        Ok(path)
    }

    /// Merge entries from a current- or legacy-format file in the cache directory.
    pub fn import(&self, filename: &str) -> Result<usize, EmbeddingCacheError> {
        let path = self.dir.join(validate_filename(filename)?);
        let entries = {
            let _guard = self.file_lock.lock();
            read_cache_file(&path)?
        };
        let count = entries.len();
        self.insert_all(entries);
        self.save()?;
        tracing::info!("[CACHE] imported {count} embeddings from {}", path.display());
        Ok(count)
    }

    fn to_point(&self, entry: &CachedEmbedding) -> UpsertPoint {
        let id = Uuid::parse_str(&entry.id)
            .unwrap_or_else(|_| Uuid::new_v5(&Uuid::NAMESPACE_OID, entry.id.as_bytes()));
        let mut payload = entry.metadata.to_payload();
        payload.insert("doc_content".to_string(), Value::String(entry.content.clone()));
        if !payload.contains_key("hash") {
            payload.insert(
                "hash".to_string(),
                Value::String(blake3::hash(entry.content.as_bytes()).to_hex().to_string()),
            );
        }
        UpsertPoint {
            id,
            dense: entry.embedding.clone(),
            sparse: self.sparse.encode(&entry.content),
            payload,
        }
    }

    /// Upsert every pending entry in batches. A batch is marked uploaded only
    /// after the store confirms it; the first failing batch stops the run.
    pub async fn upload_pending(&self, batch_size: usize) -> Result<UploadReport, EmbeddingCacheError> {
        let batch_size = batch_size.max(1);
        let mut pending: Vec<(String, CachedEmbedding)> = self
            .entries
            .iter()
            .filter(|e| !e.value().uploaded)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        pending.sort_by(|a, b| a.1.created_at.cmp(&b.1.created_at).then_with(|| a.1.id.cmp(&b.1.id)));

        let mut report = UploadReport {
            uploaded: 0,
            batches: 0,
        };
        for (batch_idx, batch) in pending.chunks(batch_size).enumerate() {
            let start = batch_idx * batch_size;
            let points = batch.iter().map(|(_, entry)| self.to_point(entry)).collect();
            if let Err(e) = self.store.upsert(&self.upload_collection, points).await {
                tracing::error!("[CACHE] upload batch at {start} failed: {e}");
                if report.uploaded > 0 {
                    self.flush().await?;
                }
                return Err(EmbeddingCacheError::Upload {
                    start,
                    message: e.to_string(),
                });
            }
            for (key, _) in batch {
                if let Some(mut entry) = self.entries.get_mut(key) {
                    entry.uploaded = true;
                }
            }
            report.uploaded += batch.len();
            report.batches += 1;
        }

        if report.uploaded > 0 {
            self.flush().await?;
            tracing::info!(
                "[CACHE] uploaded {} embeddings in {} batches to {}",
                report.uploaded,
                report.batches,
                self.upload_collection
            );
        }
        Ok(report)
    }

    pub fn stats(&self) -> CacheStats {
        let (total, uploaded) = self
            .entries
            .iter()
            .fold((0, 0), |(total, uploaded), e| (total + 1, uploaded + usize::from(e.value().uploaded)));
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            total_embeddings: total,
            uploaded,
            pending: total - uploaded,
            hits,
            misses,
            hit_rate: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
            cache_dir: self.dir.display().to_string(),
        }
    }
}

// ─── File format ─────────────────────────────────────────

/// Snapshot and write under the file lock so writers land in order.
fn write_locked(
    entries: &DashMap<String, CachedEmbedding>,
    lock: &Mutex<()>,
    path: &Path,
) -> Result<usize, EmbeddingCacheError> {
    let _guard = lock.lock();
    let mut snapshot: Vec<CachedEmbedding> = entries.iter().map(|e| e.value().clone()).collect();
    snapshot.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    let count = snapshot.len();
    write_cache_file(path, snapshot)?;
    Ok(count)
}

fn write_cache_file(path: &Path, entries: Vec<CachedEmbedding>) -> Result<(), EmbeddingCacheError> {
    let file = CacheFile {
        version: FORMAT_VERSION,
        saved_at: Utc::now(),
        entries,
    };
    let json = serde_json::to_vec(&file).map_err(|e| EmbeddingCacheError::Format {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json).map_err(io_err(path))?;
    let compressed = encoder.finish().map_err(io_err(path))?;

    let tmp_path = path.with_extension("gz.tmp");
    std::fs::write(&tmp_path, &compressed).map_err(io_err(&tmp_path))?;
    std::fs::rename(&tmp_path, path).map_err(io_err(path))?;
    Ok(())
}

/// Decode either layout; the shape of the top-level JSON decides which.
fn read_cache_file(path: &Path) -> Result<Vec<CachedEmbedding>, EmbeddingCacheError> {
    let bytes = std::fs::read(path).map_err(io_err(path))?;
    let format_err = |message: String| EmbeddingCacheError::Format {
        path: path.to_path_buf(),
        message,
    };

    let mut json = String::new();
    GzDecoder::new(bytes.as_slice())
        .read_to_string(&mut json)
        .map_err(|e| format_err(format!("gzip: {e}")))?;
    let value: Value = serde_json::from_str(&json).map_err(|e| format_err(format!("json: {e}")))?;

    let is_legacy = value.is_array();
    let is_current = value.get("entries").is_some();
    if is_legacy {
        let legacy: Vec<LegacyEntry> =
            serde_json::from_value(value).map_err(|e| format_err(format!("legacy entries: {e}")))?;
        tracing::info!("[CACHE] converting {} legacy entries from {}", legacy.len(), path.display());
        Ok(legacy.into_iter().map(CachedEmbedding::from).collect())
    } else if is_current {
        let file: CacheFile = serde_json::from_value(value).map_err(|e| format_err(format!("entries: {e}")))?;
        if file.version > FORMAT_VERSION {
            tracing::warn!("[CACHE] {} has newer format version {}", path.display(), file.version);
        }
        Ok(file.entries)
    } else {
        Err(format_err("unrecognised top-level layout".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::qdrant::{HybridQuery, ScoredPoint, VectorStoreError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingClient for CountingEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingServiceUnavailable> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
        fn dimensions(&self) -> usize {
            2
        }
        fn name(&self) -> &'static str {
            "counting"
        }
    }

    /// Accepts `ok_batches` upserts, then fails.
    struct FlakyStore {
        ok_batches: usize,
        calls: AtomicUsize,
        upserted: Mutex<Vec<UpsertPoint>>,
    }

    #[async_trait]
    impl VectorStore for FlakyStore {
        async fn query(&self, _query: &HybridQuery) -> Result<Vec<ScoredPoint>, VectorStoreError> {
            Ok(Vec::new())
        }
        async fn upsert(&self, _collection: &str, points: Vec<UpsertPoint>) -> Result<(), VectorStoreError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.ok_batches {
                return Err(VectorStoreError::Http {
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            self.upserted.lock().extend(points);
            Ok(())
        }
    }

    fn open_cache(dir: &Path, ok_batches: usize) -> (EmbeddingCache, Arc<CountingEmbedder>, Arc<FlakyStore>) {
        let embedder = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(FlakyStore {
            ok_batches,
            calls: AtomicUsize::new(0),
            upserted: Mutex::new(Vec::new()),
        });
        let cache = EmbeddingCache::open(dir, embedder.clone(), store.clone(), "java-docs").unwrap();
        (cache, embedder, store)
    }

    fn item(content: &str) -> (String, EmbeddingMetadata) {
        (
            content.to_string(),
            EmbeddingMetadata {
                url: Some(format!("https://docs.example/{content}")),
                ..Default::default()
            },
        )
    }

    fn write_gz(path: &Path, value: &Value) {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(value.to_string().as_bytes()).unwrap();
        std::fs::write(path, enc.finish().unwrap()).unwrap();
    }

    // ─── Compute once ───

    #[tokio::test]
    async fn test_get_or_compute_reuses_cached_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, embedder, _) = open_cache(dir.path(), 0);

        let first = cache.get_or_compute(&[item("a"), item("bbb"), item("a")]).await.unwrap();
        assert_eq!(first, vec![vec![1.0, 1.0], vec![3.0, 1.0], vec![1.0, 1.0]]);
        assert_eq!(cache.len(), 2);

        let second = cache.get_or_compute(&[item("bbb")]).await.unwrap();
        assert_eq!(second, vec![vec![3.0, 1.0]]);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.pending, 2);
    }

    #[tokio::test]
    async fn test_cache_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (cache, _, _) = open_cache(dir.path(), 0);
            cache.get_or_compute(&[item("persist me")]).await.unwrap();
        }
        let (reopened, embedder, _) = open_cache(dir.path(), 0);
        assert_eq!(reopened.len(), 1);
        reopened.get_or_compute(&[item("persist me")]).await.unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_batches_progress_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _, _) = open_cache(dir.path(), 0);
        let cache = Arc::new(cache);

        // Each batch crosses the auto-save threshold at least once.
        let tasks: Vec<_> = (0..6)
            .map(|t| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    let items: Vec<_> = (0..AUTO_SAVE_EVERY + 10).map(|i| item(&format!("t{t}-c{i}"))).collect();
                    cache.get_or_compute(&items).await.map(|v| v.len())
                })
            })
            .collect();

        let stats_reader = {
            let cache = cache.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let stats = cache.stats();
                    assert!(stats.pending <= stats.total_embeddings);
                    tokio::task::yield_now().await;
                }
            })
        };

        let all = tokio::time::timeout(Duration::from_secs(30), futures_util::future::join_all(tasks))
            .await
            .expect("batches stalled");
        for result in all {
            assert_eq!(result.unwrap().unwrap(), AUTO_SAVE_EVERY + 10);
        }
        stats_reader.await.unwrap();

        let expected = 6 * (AUTO_SAVE_EVERY + 10);
        assert_eq!(cache.len(), expected);
        assert_eq!(read_cache_file(&cache.cache_path()).unwrap().len(), expected);
    }

    #[test]
    fn test_corrupt_cache_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CACHE_FILE), b"definitely not gzip").unwrap();
        let (cache, _, _) = open_cache(dir.path(), 0);
        assert!(cache.is_empty());
        assert!(!dir.path().join(CACHE_FILE).exists());
        let quarantined = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("embeddings_cache.corrupt."));
        assert!(quarantined);
    }

    // ─── Import / export ───

    #[test]
    fn test_legacy_import_round_trips_extra_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _, _) = open_cache(dir.path(), 0);
        let legacy = json!([
            {
                "id": "legacy-1",
                "content": "Records are immutable data carriers.",
                "embedding": [0.5, 0.25],
                "createdAt": "2024-03-01T12:30:00.123",
                "uploaded": true,
                "metadata": {
                    "url": "https://docs.example/records",
                    "chunkIndex": "4",
                    "pageStart": 12,
                    "customTag": {"nested": [1, 2, "x"]},
                    "author": "Duke",
                    "title": 7
                }
            },
            {
                "id": "",
                "content": "Sealed classes restrict inheritance.",
                "embedding": [0.1, 0.2],
                "createdAt": [2023, 11, 5, 8, 15, 0],
                "uploaded": false,
                "metadata": {}
            }
        ]);
        write_gz(&dir.path().join("legacy.gz"), &legacy);

        assert_eq!(cache.import("legacy.gz").unwrap(), 2);
        cache.export("roundtrip.gz").unwrap();
        let entries = read_cache_file(&dir.path().join("roundtrip.gz")).unwrap();

        let first = entries.iter().find(|e| e.id == "legacy-1").unwrap();
        assert!(first.uploaded);
        assert_eq!(first.content, "Records are immutable data carriers.");
        assert_eq!(first.metadata.chunk_index, Some(4));
        assert_eq!(first.metadata.page_start, Some(12));
        assert_eq!(first.metadata.additional_metadata["customTag"], json!({"nested": [1, 2, "x"]}));
        assert_eq!(first.metadata.additional_metadata["author"], json!("Duke"));
        // Known key with the wrong type is kept verbatim rather than dropped.
        assert_eq!(first.metadata.additional_metadata["title"], json!(7));
        assert_eq!(first.created_at.format("%Y-%m-%d %H:%M:%S").to_string(), "2024-03-01 12:30:00");

        let second = entries.iter().find(|e| e.id != "legacy-1").unwrap();
        assert!(Uuid::parse_str(&second.id).is_ok());
        assert!(!second.uploaded);
        assert_eq!(second.created_at.format("%Y-%m-%d").to_string(), "2023-11-05");
    }

    #[test]
    fn test_filenames_cannot_escape_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _, _) = open_cache(dir.path(), 0);
        for bad in ["", "  ", "../x.gz", "a/b.gz", "a\\b.gz", "c:x.gz"] {
            assert!(matches!(cache.export(bad), Err(EmbeddingCacheError::InvalidFilename(_))), "{bad}");
        }
        assert!(cache.export("ok.gz").is_ok());
    }

    #[test]
    fn test_snapshot_name_is_timestamped() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _, _) = open_cache(dir.path(), 0);
        let path = cache.save_snapshot().unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("embeddings_snapshot_"));
        assert!(name.ends_with(".gz"));
    }

    // ─── Upload ───

    #[tokio::test]
    async fn test_upload_marks_only_confirmed_batches() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _, store) = open_cache(dir.path(), 1);
        cache
            .get_or_compute(&[item("one"), item("two"), item("three")])
            .await
            .unwrap();

        let err = cache.upload_pending(2).await.unwrap_err();
        match err {
            EmbeddingCacheError::Upload { start, .. } => assert_eq!(start, 2),
            other => panic!("unexpected error: {other}"),
        }
        let stats = cache.stats();
        assert_eq!(stats.uploaded, 2);
        assert_eq!(stats.pending, 1);

        let upserted = store.upserted.lock();
        assert_eq!(upserted.len(), 2);
        assert!(upserted[0].payload.contains_key("doc_content"));
        assert!(upserted[0].payload.contains_key("hash"));
        assert!(!upserted[0].sparse.is_empty());
    }

    #[test]
    fn test_non_uuid_ids_map_to_stable_point_ids() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _, _) = open_cache(dir.path(), 0);
        let entry = CachedEmbedding {
            id: "legacy-7".into(),
            content: "text".into(),
            embedding: vec![1.0],
            created_at: Utc::now(),
            uploaded: false,
            metadata: EmbeddingMetadata::default(),
        };
        assert_eq!(cache.to_point(&entry).id, cache.to_point(&entry).id);
    }
}
