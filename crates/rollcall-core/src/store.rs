//! Per-group embedding persistence.
//!
//! Each (owner, group) pair is one file, `<root>/<owner>/<group>.emb`,
//! holding a postcard-encoded ordered list of `(key, vector)` pairs. Saves
//! replace the file atomically via a temp file and rename. Upserts on the
//! same store are serialized by a per-store lock; different stores never
//! contend.

use crate::types::{Embedding, EmbeddingError, GroupEmbeddings, IdentityKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

const STORE_EXTENSION: &str = "emb";
const FORMAT_VERSION: u16 = 1;
/// Loaded vectors must be unit length within this margin.
const NORM_TOLERANCE: f32 = 1e-3;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid store id component {0:?}")]
    InvalidStoreId(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("encoding store: {0}")]
    Encode(#[from] postcard::Error),
    #[error("corrupt store {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Names one store: the (owner, group) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StoreId {
    owner: String,
    group: String,
}

impl StoreId {
    /// Both components become path segments, so separators and dot names are refused.
    pub fn new(owner: impl Into<String>, group: impl Into<String>) -> Result<Self, StoreError> {
        let owner = owner.into();
        let group = group.into();
        for part in [&owner, &group] {
            let bad = part.is_empty()
                || part == "."
                || part == ".."
                || part.contains(['/', '\\', '\0']);
            if bad {
                return Err(StoreError::InvalidStoreId(part.clone()));
            }
        }
        Ok(Self { owner, group })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn group(&self) -> &str {
        &self.group
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.group)
    }
}

/// On-disk layout. f32 values are written as raw little-endian bits.
#[derive(Serialize, Deserialize)]
struct StoreFile {
    format_version: u16,
    dimension: u32,
    entries: Vec<(String, Vec<f32>)>,
}

/// File-backed embedding stores rooted at one directory.
pub struct EmbeddingStore {
    root: PathBuf,
    locks: Mutex<HashMap<StoreId, Arc<Mutex<()>>>>,
}

impl EmbeddingStore {
    /// Open (and create if needed) the store root.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(io_err(&root))?;
        tracing::debug!(root = %root.display(), "embedding store opened");
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn path(&self, id: &StoreId) -> PathBuf {
        self.root
            .join(&id.owner)
            .join(format!("{}.{STORE_EXTENSION}", id.group))
    }

    fn lock_for(&self, id: &StoreId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(id.clone()).or_default().clone()
    }

    /// Read a store. A store that was never written is empty, not an error.
    pub fn load(&self, id: &StoreId) -> Result<GroupEmbeddings, StoreError> {
        let path = self.path(id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(GroupEmbeddings::new()),
            Err(e) => return Err(io_err(&path)(e)),
        };
        decode(&path, &bytes)
    }

    /// Replace the whole store.
    pub fn save(&self, id: &StoreId, embeddings: &GroupEmbeddings) -> Result<(), StoreError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.write(id, embeddings)
    }

    /// Set one identity's embedding, keeping every other entry.
    ///
    /// Returns the embedding previously stored under `key`.
    pub fn upsert(
        &self,
        id: &StoreId,
        key: IdentityKey,
        embedding: Embedding,
    ) -> Result<Option<Embedding>, StoreError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut current = self.load(id)?;
        let previous = current.insert(key.clone(), embedding)?;
        self.write(id, &current)?;

        tracing::debug!(store = %id, key = %key, replaced = previous.is_some(), "upserted embedding");
        Ok(previous)
    }

    /// Persisted stores, sorted by owner then group.
    pub fn list_stores(&self, owner: Option<&str>) -> Result<Vec<StoreId>, StoreError> {
        let mut ids = Vec::new();
        for owner_entry in std::fs::read_dir(&self.root).map_err(io_err(&self.root))? {
            let owner_entry = owner_entry.map_err(io_err(&self.root))?;
            let owner_path = owner_entry.path();
            if !owner_path.is_dir() {
                continue;
            }
            let Some(owner_name) = owner_entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if owner.is_some_and(|o| o != owner_name) {
                continue;
            }
            for file in std::fs::read_dir(&owner_path).map_err(io_err(&owner_path))? {
                let path = file.map_err(io_err(&owner_path))?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(STORE_EXTENSION) {
                    continue;
                }
                let Some(group) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if let Ok(id) = StoreId::new(owner_name.clone(), group) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// First persisted store, in [`list_stores`](Self::list_stores) order, holding `key`.
    pub fn find_identity(&self, key: &str) -> Result<Option<(StoreId, Embedding)>, StoreError> {
        for id in self.list_stores(None)? {
            if let Some(embedding) = self.load(&id)?.get(key) {
                return Ok(Some((id, embedding.clone())));
            }
        }
        Ok(None)
    }

    fn write(&self, id: &StoreId, embeddings: &GroupEmbeddings) -> Result<(), StoreError> {
        let path = self.path(id);
        let dir = path.parent().unwrap_or(&self.root).to_path_buf();
        std::fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let bytes = encode(embeddings)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err(&dir))?;
        tmp.write_all(&bytes).map_err(io_err(tmp.path()))?;
        tmp.as_file().sync_all().map_err(io_err(&path))?;
        tmp.persist(&path).map_err(|e| io_err(&path)(e.error))?;

        tracing::debug!(store = %id, identities = embeddings.len(), bytes = bytes.len(), "store saved");
        Ok(())
    }
}

fn encode(embeddings: &GroupEmbeddings) -> Result<Vec<u8>, StoreError> {
    let file = StoreFile {
        format_version: FORMAT_VERSION,
        dimension: embeddings.dimension().unwrap_or(0) as u32,
        entries: embeddings
            .iter()
            .map(|(k, e)| (k.as_str().to_owned(), e.values().to_vec()))
            .collect(),
    };
    Ok(postcard::to_allocvec(&file)?)
}

fn decode(path: &Path, bytes: &[u8]) -> Result<GroupEmbeddings, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };
    let file: StoreFile = postcard::from_bytes(bytes).map_err(|e| corrupt(e.to_string()))?;
    if file.format_version != FORMAT_VERSION {
        return Err(corrupt(format!("unknown format version {}", file.format_version)));
    }

    if file.dimension == 0 && !file.entries.is_empty() {
        return Err(corrupt("zero dimension with stored entries".to_string()));
    }

    let mut embeddings = GroupEmbeddings::new();
    for (key, values) in file.entries {
        if values.len() != file.dimension as usize {
            return Err(corrupt(format!(
                "entry {key:?} has {} values, header says {}",
                values.len(),
                file.dimension
            )));
        }
        if embeddings.contains(&key) {
            return Err(corrupt(format!("duplicate key {key:?}")));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(corrupt(format!("entry {key:?} has non-finite values")));
        }
        let embedding = Embedding::from_stored(values);
        if (embedding.norm() - 1.0).abs() > NORM_TOLERANCE {
            return Err(corrupt(format!(
                "entry {key:?} is not unit length (norm {})",
                embedding.norm()
            )));
        }
        embeddings.insert(IdentityKey::from_stored(key), embedding)?;
    }
    Ok(embeddings)
}
