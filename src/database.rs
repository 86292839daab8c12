//! Persistent vector index.
//!
//! Layout of an index directory:
//! - `vectors/` - LMDB environment, one bincode-encoded [`VectorEntry`] per key
//! - `embedding_model.txt` - single-line fingerprint of the embedding model
//!
//! The index is tenant-agnostic: every user's entries share one structure and
//! per-user scoping happens in the retriever.

use chrono::{DateTime, Utc};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::ann::RandomProjectionIndex;
use crate::config::{IndexOptions, Number, SearchMethod};
use crate::document::{DocumentMetadata, IndexedDocument};
use crate::error::IndexError;
use crate::vector_ops::{cosine_distance, normalize_vector};

pub const FINGERPRINT_FILE: &str = "embedding_model.txt";
pub const VECTORS_DIR: &str = "vectors";
const ENTRIES_DB: &str = "entries";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorEntry {
    pub content: String,
    pub embedding: Vec<Number>,
    pub metadata: DocumentMetadata,
}

impl VectorEntry {
    pub fn new(document: IndexedDocument, embedding: Vec<Number>) -> Self {
        Self {
            content: document.content,
            embedding,
            metadata: document.metadata,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    /// Cosine distance to the query; lower is closer.
    pub distance: Number,
    pub entry: VectorEntry,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_documents: usize,
    pub users: BTreeMap<String, usize>,
    pub document_types: BTreeMap<String, usize>,
    pub categories: BTreeMap<String, usize>,
    pub index_size_kb: f64,
    pub last_modified: Option<String>,
}

/// Operations the orchestrator needs from a vector store.
///
/// `remove_user` is allowed to be a full rebuild; a store with real deletes
/// can implement it directly.
pub trait VectorStore: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn count_for_user(&self, user_id: i64) -> usize;

    fn add(&mut self, entries: Vec<VectorEntry>) -> Result<(), IndexError>;

    /// Drops every entry owned by `user_id`, returning how many were removed.
    fn remove_user(&mut self, user_id: i64) -> Result<usize, IndexError>;

    fn search(&self, query_embedding: &[Number], k: usize) -> Vec<SearchHit>;

    fn save(&mut self) -> Result<(), IndexError>;

    fn stats(&self) -> IndexStats;
}

/// Thin LMDB wrapper. The environment is opened on first use and kept for the
/// life of the index; heed registers environments per process, so a directory
/// that has been opened is never deleted, only cleared.
struct LmdbWrapper {
    path: PathBuf,
    map_size: usize,
    handle: Option<(Env, Database<Str, Bytes>)>,
}

impl LmdbWrapper {
    fn new(path: PathBuf, map_size: usize) -> Self {
        Self {
            path,
            map_size,
            handle: None,
        }
    }

    fn exists(&self) -> bool {
        self.path.join("data.mdb").exists()
    }

    fn open(&mut self) -> Result<(Env, Database<Str, Bytes>), IndexError> {
        if let Some((env, db)) = self.handle.as_ref() {
            return Ok((env.clone(), *db));
        }
        fs::create_dir_all(&self.path)?;
        // SAFETY: the environment is only opened through this wrapper and is
        // never shared with another process while mapped.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(self.map_size)
                .max_dbs(1)
                .open(&self.path)?
        };
        let mut wtxn = env.write_txn()?;
        let db: Database<Str, Bytes> = env.create_database(&mut wtxn, Some(ENTRIES_DB))?;
        wtxn.commit()?;
        self.handle = Some((env.clone(), db));
        Ok((env, db))
    }

    fn key(position: usize) -> String {
        format!("{position:020}")
    }

    fn load(&mut self) -> Result<Vec<VectorEntry>, IndexError> {
        let (env, db) = self.open()?;
        let rtxn = env.read_txn()?;
        let mut entries = Vec::new();
        for item in db.iter(&rtxn)? {
            let (_, value) = item?;
            entries.push(bincode::deserialize(value)?);
        }
        Ok(entries)
    }

    fn append(&mut self, start: usize, entries: &[VectorEntry]) -> Result<(), IndexError> {
        let (env, db) = self.open()?;
        let mut wtxn = env.write_txn()?;
        for (offset, entry) in entries.iter().enumerate() {
            let value = bincode::serialize(entry)?;
            db.put(&mut wtxn, Self::key(start + offset).as_str(), value.as_slice())?;
        }
        wtxn.commit()?;
        Ok(())
    }

    fn rewrite(&mut self, entries: &[VectorEntry]) -> Result<(), IndexError> {
        let (env, db) = self.open()?;
        let mut wtxn = env.write_txn()?;
        db.clear(&mut wtxn)?;
        for (position, entry) in entries.iter().enumerate() {
            let value = bincode::serialize(entry)?;
            db.put(&mut wtxn, Self::key(position).as_str(), value.as_slice())?;
        }
        wtxn.commit()?;
        Ok(())
    }
}

pub struct VectorIndex {
    dir: PathBuf,
    fingerprint: String,
    dimensions: usize,
    entries: Vec<VectorEntry>,
    ann: Option<RandomProjectionIndex>,
    lmdb: LmdbWrapper,
    persisted: usize,
    needs_rewrite: bool,
}

impl VectorIndex {
    /// Opens the index in `dir` if it was built with `fingerprint`, otherwise
    /// discards whatever is on disk and starts empty. Never fails.
    pub fn create_or_load(
        dir: impl AsRef<Path>,
        fingerprint: &str,
        dimensions: usize,
        options: IndexOptions,
    ) -> Self {
        let dir = dir.as_ref().to_path_buf();
        let lmdb = LmdbWrapper::new(dir.join(VECTORS_DIR), options.map_size);
        let mut index = Self {
            dir,
            fingerprint: fingerprint.to_string(),
            dimensions,
            ann: Self::new_ann(dimensions, &options),
            entries: Vec::new(),
            lmdb,
            persisted: 0,
            needs_rewrite: false,
        };

        if !index.lmdb.exists() {
            log::info!("no existing vector index at {}", index.dir.display());
            return index;
        }

        let stored = fs::read_to_string(index.dir.join(FINGERPRINT_FILE))
            .ok()
            .map(|s| s.trim().to_string());
        if stored.as_deref() != Some(fingerprint) {
            log::warn!(
                "embedding model mismatch or missing: stored={:?} current={:?}; clearing old index",
                stored,
                fingerprint
            );
            index.discard_on_disk();
            return index;
        }

        match index.lmdb.load() {
            Ok(entries) if entries.iter().all(|e| e.embedding.len() == dimensions) => {
                index.entries = entries;
                index.persisted = index.entries.len();
                index.rebuild_ann();
                log::info!(
                    "loaded vector index with {} documents from {}",
                    index.entries.len(),
                    index.dir.display()
                );
            }
            Ok(_) => {
                log::warn!("stored vectors do not have dimension {dimensions}; clearing old index");
                index.discard_on_disk();
            }
            Err(err) => {
                log::error!("failed to load vector index: {err}; clearing old index");
                index.discard_on_disk();
            }
        }
        index
    }

    fn new_ann(dimensions: usize, options: &IndexOptions) -> Option<RandomProjectionIndex> {
        match options.search_method {
            SearchMethod::Ann => Some(RandomProjectionIndex::new(
                dimensions,
                options.ann_num_projections,
                options.ann_num_tables,
            )),
            SearchMethod::Exact => None,
        }
    }

    fn rebuild_ann(&mut self) {
        if let Some(ann) = self.ann.as_mut() {
            ann.clear();
            for (position, entry) in self.entries.iter().enumerate() {
                ann.add(&entry.embedding, position);
            }
        }
    }

    /// Best-effort: the stale fingerprint is removed and the stored entries are
    /// cleared in place. Failures are logged, the in-memory index stays empty, and
    /// the next save rewrites the store from scratch.
    fn discard_on_disk(&mut self) {
        let fingerprint_path = self.dir.join(FINGERPRINT_FILE);
        if fingerprint_path.exists() {
            if let Err(err) = fs::remove_file(&fingerprint_path) {
                log::warn!("failed to remove {}: {err}", fingerprint_path.display());
            }
        }
        if let Err(err) = self.lmdb.rewrite(&[]) {
            log::warn!("failed to clear old vectors at {}: {err}", self.lmdb.path.display());
        }
        self.entries.clear();
        self.persisted = 0;
        self.needs_rewrite = true;
        self.rebuild_ann();
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entries(&self) -> &[VectorEntry] {
        &self.entries
    }

    /// Keeps every entry whose owner is not `user_id`. An empty result leaves an
    /// empty index.
    pub fn rebuild_excluding(&mut self, user_id: i64) -> usize {
        let owner = user_id.to_string();
        let before = self.entries.len();
        self.entries.retain(|entry| entry.metadata.user_id.trim() != owner);
        let removed = before - self.entries.len();
        self.rebuild_ann();
        self.needs_rewrite = true;
        log::info!(
            "rebuilt vector index without user {user_id}: removed {removed}, kept {}",
            self.entries.len()
        );
        removed
    }

    fn candidate_positions(&self, query: &[Number], k: usize) -> Vec<usize> {
        if let Some(ann) = self.ann.as_ref() {
            let candidates = ann.candidates(query);
            if candidates.len() >= k {
                return candidates.into_iter().collect();
            }
            log::debug!(
                "ann proposed {} candidates for k={k}, falling back to exact scan",
                candidates.len()
            );
        }
        (0..self.entries.len()).collect()
    }

    fn write_fingerprint(&self) -> Result<(), IndexError> {
        let path = self.dir.join(FINGERPRINT_FILE);
        let temp_path = self.dir.join(format!("{FINGERPRINT_FILE}.tmp"));
        {
            let mut file = fs::File::create(&temp_path)?;
            writeln!(file, "{}", self.fingerprint)?;
        }
        fs::rename(temp_path, path)?;
        Ok(())
    }

    fn data_file_stats(&self) -> (f64, Option<String>) {
        let Ok(meta) = fs::metadata(self.lmdb.path.join("data.mdb")) else {
            return (0.0, None);
        };
        let modified = meta
            .modified()
            .ok()
            .map(|time| DateTime::<Utc>::from(time).to_rfc3339());
        (meta.len() as f64 / 1024.0, modified)
    }
}

impl VectorStore for VectorIndex {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn count_for_user(&self, user_id: i64) -> usize {
        let owner = user_id.to_string();
        self.entries
            .iter()
            .filter(|entry| entry.metadata.user_id.trim() == owner)
            .count()
    }

    fn add(&mut self, entries: Vec<VectorEntry>) -> Result<(), IndexError> {
        if let Some(bad) = entries.iter().find(|e| e.embedding.len() != self.dimensions) {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: bad.embedding.len(),
            });
        }
        for mut entry in entries {
            normalize_vector(&mut entry.embedding);
            let position = self.entries.len();
            if let Some(ann) = self.ann.as_mut() {
                ann.add(&entry.embedding, position);
            }
            self.entries.push(entry);
        }
        Ok(())
    }

    fn remove_user(&mut self, user_id: i64) -> Result<usize, IndexError> {
        Ok(self.rebuild_excluding(user_id))
    }

    fn search(&self, query_embedding: &[Number], k: usize) -> Vec<SearchHit> {
        if k == 0 || self.entries.is_empty() {
            return Vec::new();
        }
        let mut query = query_embedding.to_vec();
        normalize_vector(&mut query);

        let mut scored: Vec<(Number, usize)> = self
            .candidate_positions(&query, k)
            .into_par_iter()
            .filter_map(|position| {
                cosine_distance(&query, &self.entries[position].embedding)
                    .map(|distance| (distance, position))
            })
            .collect();

        scored.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        scored.truncate(k);
        scored
            .into_iter()
            .map(|(distance, position)| SearchHit {
                distance,
                entry: self.entries[position].clone(),
            })
            .collect()
    }

    fn save(&mut self) -> Result<(), IndexError> {
        fs::create_dir_all(&self.dir)?;
        if self.needs_rewrite {
            self.lmdb.rewrite(&self.entries)?;
        } else if self.persisted < self.entries.len() {
            self.lmdb.append(self.persisted, &self.entries[self.persisted..])?;
        } else if !self.lmdb.exists() {
            self.lmdb.rewrite(&self.entries)?;
        }
        self.write_fingerprint()?;
        self.persisted = self.entries.len();
        self.needs_rewrite = false;
        log::info!(
            "saved vector index with {} documents to {}",
            self.entries.len(),
            self.dir.display()
        );
        Ok(())
    }

    fn stats(&self) -> IndexStats {
        let mut stats = IndexStats {
            total_documents: self.entries.len(),
            ..IndexStats::default()
        };
        for entry in &self.entries {
            let metadata = &entry.metadata;
            if !metadata.user_id.is_empty() {
                *stats.users.entry(metadata.user_id.clone()).or_default() += 1;
            }
            if !metadata.kind.is_empty() {
                *stats.document_types.entry(metadata.kind.clone()).or_default() += 1;
            }
            if !metadata.category.is_empty() {
                *stats.categories.entry(metadata.category.clone()).or_default() += 1;
            }
        }
        let (size_kb, last_modified) = self.data_file_stats();
        stats.index_size_kb = size_kb;
        stats.last_modified = last_modified;
        stats
    }
}
