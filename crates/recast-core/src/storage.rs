//! Scratch storage for uploads and converted outputs.
//!
//! Files are named `<nanos>-<sanitized filename>` where the nanosecond stamp
//! is strictly increasing per store, so two uploads of the same name never
//! collide.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info};

use crate::asset::sanitize_filename;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScratchArea {
    Uploads,
    Converted,
}

impl fmt::Display for ScratchArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uploads => "uploads",
            Self::Converted => "converted",
        })
    }
}

/// Handle to one stored file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScratchKey {
    area: ScratchArea,
    name: String,
}

impl ScratchKey {
    pub fn area(&self) -> ScratchArea {
        self.area
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ScratchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.area, self.name)
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("scratch file {0} does not exist")]
    NotFound(ScratchKey),

    #[error("scratch storage unavailable: {0}")]
    Unavailable(String),
}

/// Where the pipeline parks uploads and converted files.
pub trait ScratchStore: Send + Sync + 'static {
    type Reader: AsyncRead + Send + Unpin + 'static;

    /// Store `content` under a fresh unique name derived from `filename`.
    fn create(
        &self,
        area: ScratchArea,
        filename: &str,
        content: Bytes,
    ) -> impl Future<Output = Result<ScratchKey, StorageError>> + Send;

    /// Open a stored file for reading, returning it with its length.
    fn open(
        &self,
        key: &ScratchKey,
    ) -> impl Future<Output = Result<(Self::Reader, u64), StorageError>> + Send;

    /// Remove a stored file. Missing files are not an error.
    fn delete(&self, key: &ScratchKey) -> impl Future<Output = Result<(), StorageError>> + Send;
}

/// Strictly increasing wall-clock nanoseconds.
#[derive(Debug, Default)]
struct NanoStamp {
    last: AtomicU64,
}

impl NanoStamp {
    fn next(&self) -> u64 {
        let now = chrono::Utc::now()
            .timestamp_nanos_opt()
            .map_or(0, |n| n.max(0) as u64);
        let prev = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                Some(now.max(prev + 1))
            })
            .unwrap_or_else(|prev| prev);
        now.max(prev + 1)
    }

    fn name(&self, filename: &str) -> String {
        format!("{}-{}", self.next(), sanitize_filename(filename))
    }
}

// ── Filesystem ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct FsScratch {
    uploads: PathBuf,
    converted: PathBuf,
    stamp: NanoStamp,
}

impl FsScratch {
    pub fn new(uploads: impl Into<PathBuf>, converted: impl Into<PathBuf>) -> Self {
        Self {
            uploads: uploads.into(),
            converted: converted.into(),
            stamp: NanoStamp::default(),
        }
    }

    /// Create both scratch directories if they do not exist yet.
    pub async fn provision(&self) -> Result<(), StorageError> {
        for dir in [&self.uploads, &self.converted] {
            fs::create_dir_all(dir).await.map_err(|source| StorageError::Io {
                op: "create directory",
                path: dir.clone(),
                source,
            })?;
        }
        info!(
            uploads = %self.uploads.display(),
            converted = %self.converted.display(),
            "scratch directories ready"
        );
        Ok(())
    }

    pub fn dir(&self, area: ScratchArea) -> &Path {
        match area {
            ScratchArea::Uploads => &self.uploads,
            ScratchArea::Converted => &self.converted,
        }
    }

    pub fn path(&self, key: &ScratchKey) -> PathBuf {
        self.dir(key.area).join(&key.name)
    }
}

impl ScratchStore for FsScratch {
    type Reader = fs::File;

    async fn create(
        &self,
        area: ScratchArea,
        filename: &str,
        content: Bytes,
    ) -> Result<ScratchKey, StorageError> {
        let key = ScratchKey {
            area,
            name: self.stamp.name(filename),
        };
        let path = self.path(&key);
        let io_err = |op| {
            let path = path.clone();
            move |source| StorageError::Io { op, path, source }
        };

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(io_err("create"))?;
        file.write_all(&content).await.map_err(io_err("write"))?;
        file.flush().await.map_err(io_err("flush"))?;

        debug!(key = %key, bytes = content.len(), "scratch file written");
        Ok(key)
    }

    async fn open(&self, key: &ScratchKey) -> Result<(fs::File, u64), StorageError> {
        let path = self.path(key);
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.clone()));
            }
            Err(source) => {
                return Err(StorageError::Io {
                    op: "open",
                    path,
                    source,
                });
            }
        };
        let len = file
            .metadata()
            .await
            .map_err(|source| StorageError::Io {
                op: "stat",
                path,
                source,
            })?
            .len();
        Ok((file, len))
    }

    async fn delete(&self, key: &ScratchKey) -> Result<(), StorageError> {
        let path = self.path(key);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key = %key, "scratch file removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io {
                op: "remove",
                path,
                source,
            }),
        }
    }
}

// ── In-memory ───────────────────────────────────────────────────────────────

/// Scratch store kept in memory, for tests and embedders that do not want
/// files on disk.
#[derive(Debug, Clone, Default)]
pub struct MemoryScratch {
    files: Arc<Mutex<HashMap<ScratchKey, Bytes>>>,
    writes: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
    stamp: Arc<NanoStamp>,
}

impl MemoryScratch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of successful `create` calls so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Names currently stored in `area`, sorted.
    pub fn names(&self, area: ScratchArea) -> Vec<String> {
        let files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<_> = files
            .keys()
            .filter(|k| k.area == area)
            .map(|k| k.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Make every subsequent `create` fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl ScratchStore for MemoryScratch {
    type Reader = Cursor<Bytes>;

    async fn create(
        &self,
        area: ScratchArea,
        filename: &str,
        content: Bytes,
    ) -> Result<ScratchKey, StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory store is failing".into()));
        }
        let key = ScratchKey {
            area,
            name: self.stamp.name(filename),
        };
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), content);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(key)
    }

    async fn open(&self, key: &ScratchKey) -> Result<(Cursor<Bytes>, u64), StorageError> {
        let files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        let content = files
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.clone()))?;
        let len = content.len() as u64;
        Ok((Cursor::new(content), len))
    }

    async fn delete(&self, key: &ScratchKey) -> Result<(), StorageError> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn stamps_are_strictly_increasing() {
        let stamp = NanoStamp::default();
        let mut prev = 0;
        for _ in 0..1000 {
            let next = stamp.next();
            assert!(next > prev);
            prev = next;
        }
    }

    #[tokio::test]
    async fn fs_round_trip_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsScratch::new(dir.path().join("uploads"), dir.path().join("converted"));
        store.provision().await.unwrap();

        let key = store
            .create(ScratchArea::Uploads, "../evil/photo.png", Bytes::from_static(b"pixels"))
            .await
            .unwrap();
        assert!(key.name().ends_with("-photo.png"), "{}", key.name());
        assert!(store.path(&key).starts_with(dir.path().join("uploads")));

        let (mut reader, len) = store.open(&key).await.unwrap();
        assert_eq!(len, 6);
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"pixels");

        store.delete(&key).await.unwrap();
        assert!(matches!(store.open(&key).await, Err(StorageError::NotFound(_))));
        // Deleting twice is fine.
        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    async fn same_filename_never_collides() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsScratch::new(dir.path().join("u"), dir.path().join("c"));
        store.provision().await.unwrap();

        let a = store
            .create(ScratchArea::Converted, "out.png", Bytes::from_static(b"a"))
            .await
            .unwrap();
        let b = store
            .create(ScratchArea::Converted, "out.png", Bytes::from_static(b"b"))
            .await
            .unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn memory_store_counts_writes_and_can_fail() {
        let store = MemoryScratch::new();
        store
            .create(ScratchArea::Uploads, "a.png", Bytes::from_static(b"1"))
            .await
            .unwrap();
        assert_eq!(store.writes(), 1);
        assert_eq!(store.names(ScratchArea::Uploads).len(), 1);

        store.set_failing(true);
        assert!(matches!(
            store
                .create(ScratchArea::Uploads, "b.png", Bytes::from_static(b"2"))
                .await,
            Err(StorageError::Unavailable(_))
        ));
        assert_eq!(store.writes(), 1);
    }
}
