//! Persistent store contract and its two backends.
//!
//! Three independent namespaces:
//!
//! | Namespace  | Key          | Value                                  |
//! |------------|--------------|----------------------------------------|
//! | `projects` | project id   | full nested [`Project`] document       |
//! | `media`    | page id      | raw page blob ([`MediaBlob`])          |
//! | `cache`    | content hash | validated analysis results + timestamp |
//!
//! There is no cross-namespace transaction. A single project write is
//! atomic to readers in both backends: [`MemoryStore`] swaps the whole
//! document under one lock and [`FsStore`] writes a temp file and renames it.

use crate::error::StoreError;
use crate::model::{AnalysisResult, Project};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

/// Raw bytes of a page plus their mime type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaBlob {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl MediaBlob {
    pub fn new(mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            bytes,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new("text/plain", text.into().into_bytes())
    }
}

/// One result-cache record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub results: Vec<AnalysisResult>,
    pub cached_at: DateTime<Utc>,
}

/// Storage backend used by the pipeline.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_project(&self, id: &str) -> Result<Option<Project>, StoreError>;
    async fn put_project(&self, project: &Project) -> Result<(), StoreError>;
    /// Returns `true` if a project was deleted.
    async fn delete_project(&self, id: &str) -> Result<bool, StoreError>;

    async fn get_media(&self, page_id: &str) -> Result<Option<MediaBlob>, StoreError>;
    async fn put_media(&self, page_id: &str, blob: &MediaBlob) -> Result<(), StoreError>;
    async fn delete_media(&self, page_id: &str) -> Result<bool, StoreError>;

    async fn get_cached(&self, hash: &str) -> Result<Option<CacheEntry>, StoreError>;
    async fn put_cached(&self, hash: &str, entry: &CacheEntry) -> Result<(), StoreError>;
    /// Remove every cache entry, returning how many were removed.
    async fn clear_cache(&self) -> Result<usize, StoreError>;
    async fn count_cache(&self) -> Result<usize, StoreError>;
}

/// Keys become file names in [`FsStore`], so keep them boring everywhere.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let ok = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

// ── In-memory backend ────────────────────────────────────────────────────────

/// Volatile store for tests and embedding hosts that persist elsewhere.
#[derive(Default)]
pub struct MemoryStore {
    projects: RwLock<HashMap<String, Project>>,
    media: RwLock<HashMap<String, MediaBlob>>,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_project(&self, id: &str) -> Result<Option<Project>, StoreError> {
        Ok(self.projects.read().await.get(id).cloned())
    }

    async fn put_project(&self, project: &Project) -> Result<(), StoreError> {
        validate_key(&project.id)?;
        self.projects
            .write()
            .await
            .insert(project.id.clone(), project.clone());
        Ok(())
    }

    async fn delete_project(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.projects.write().await.remove(id).is_some())
    }

    async fn get_media(&self, page_id: &str) -> Result<Option<MediaBlob>, StoreError> {
        Ok(self.media.read().await.get(page_id).cloned())
    }

    async fn put_media(&self, page_id: &str, blob: &MediaBlob) -> Result<(), StoreError> {
        validate_key(page_id)?;
        self.media
            .write()
            .await
            .insert(page_id.to_string(), blob.clone());
        Ok(())
    }

    async fn delete_media(&self, page_id: &str) -> Result<bool, StoreError> {
        Ok(self.media.write().await.remove(page_id).is_some())
    }

    async fn get_cached(&self, hash: &str) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self.cache.read().await.get(hash).cloned())
    }

    async fn put_cached(&self, hash: &str, entry: &CacheEntry) -> Result<(), StoreError> {
        validate_key(hash)?;
        self.cache
            .write()
            .await
            .insert(hash.to_string(), entry.clone());
        Ok(())
    }

    async fn clear_cache(&self) -> Result<usize, StoreError> {
        let mut cache = self.cache.write().await;
        let n = cache.len();
        cache.clear();
        Ok(n)
    }

    async fn count_cache(&self) -> Result<usize, StoreError> {
        Ok(self.cache.read().await.len())
    }
}

// ── Filesystem backend ───────────────────────────────────────────────────────

/// Directory-backed store:
///
/// ```text
/// <root>/projects/<id>.json
/// <root>/media/<page-id>.bin      raw bytes
/// <root>/media/<page-id>.json     {"mimeType": …}
/// <root>/cache/<hash>.json
/// ```
pub struct FsStore {
    root: PathBuf,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaMeta {
    mime_type: String,
}

impl FsStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        for ns in ["projects", "media", "cache"] {
            let dir = root.join(ns);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|source| StoreError::Io { path: dir, source })?;
        }
        debug!("Opened filesystem store at {}", root.display());
        Ok(Self { root })
    }

    fn path(&self, ns: &str, key: &str, ext: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(ns).join(format!("{key}.{ext}")))
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(
        path: &Path,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| StoreError::Serde {
                    key: key.to_string(),
                    source,
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    async fn remove(path: &Path) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Write via a temp file in the same directory, then rename over `path`.
    async fn write_atomic(path: PathBuf, bytes: Vec<u8>) -> Result<(), StoreError> {
        tokio::task::spawn_blocking(move || write_atomic_blocking(&path, &bytes))
            .await
            .map_err(|e| StoreError::Io {
                path: PathBuf::new(),
                source: std::io::Error::other(format!("write task panicked: {e}")),
            })?
    }

    async fn list(&self, ns: &str, ext: &str) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.root.join(ns);
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(ext) {
                out.push(path);
            }
        }
        Ok(out)
    }
}

fn write_atomic_blocking(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

fn to_json<T: Serialize>(value: &T, key: &str) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serde {
        key: key.to_string(),
        source,
    })
}

#[async_trait]
impl Store for FsStore {
    async fn get_project(&self, id: &str) -> Result<Option<Project>, StoreError> {
        let path = self.path("projects", id, "json")?;
        Self::read_json(&path, id).await
    }

    async fn put_project(&self, project: &Project) -> Result<(), StoreError> {
        let path = self.path("projects", &project.id, "json")?;
        Self::write_atomic(path, to_json(project, &project.id)?).await
    }

    async fn delete_project(&self, id: &str) -> Result<bool, StoreError> {
        Self::remove(&self.path("projects", id, "json")?).await
    }

    async fn get_media(&self, page_id: &str) -> Result<Option<MediaBlob>, StoreError> {
        let meta_path = self.path("media", page_id, "json")?;
        let Some(meta) = Self::read_json::<MediaMeta>(&meta_path, page_id).await? else {
            return Ok(None);
        };
        let bin_path = self.path("media", page_id, "bin")?;
        match tokio::fs::read(&bin_path).await {
            Ok(bytes) => Ok(Some(MediaBlob::new(meta.mime_type, bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                path: bin_path,
                source,
            }),
        }
    }

    async fn put_media(&self, page_id: &str, blob: &MediaBlob) -> Result<(), StoreError> {
        // Bytes first: a sidecar without bytes reads as "missing".
        Self::write_atomic(self.path("media", page_id, "bin")?, blob.bytes.clone()).await?;
        let meta = MediaMeta {
            mime_type: blob.mime_type.clone(),
        };
        Self::write_atomic(self.path("media", page_id, "json")?, to_json(&meta, page_id)?).await
    }

    async fn delete_media(&self, page_id: &str) -> Result<bool, StoreError> {
        let had_meta = Self::remove(&self.path("media", page_id, "json")?).await?;
        let had_bin = Self::remove(&self.path("media", page_id, "bin")?).await?;
        Ok(had_meta || had_bin)
    }

    async fn get_cached(&self, hash: &str) -> Result<Option<CacheEntry>, StoreError> {
        let path = self.path("cache", hash, "json")?;
        Self::read_json(&path, hash).await
    }

    async fn put_cached(&self, hash: &str, entry: &CacheEntry) -> Result<(), StoreError> {
        let path = self.path("cache", hash, "json")?;
        Self::write_atomic(path, to_json(entry, hash)?).await
    }

    async fn clear_cache(&self) -> Result<usize, StoreError> {
        let files = self.list("cache", "json").await?;
        let mut removed = 0;
        for path in files {
            if Self::remove(&path).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn count_cache(&self) -> Result<usize, StoreError> {
        Ok(self.list("cache", "json").await?.len())
    }
}
