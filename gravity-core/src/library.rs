use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::fs;
use tracing::{debug, instrument, warn};

pub type DocumentKey = u64;

pub const LIBRARY_SCHEMA_VERSION: u32 = 1;
const MANIFEST_FILE: &str = "library.json";
const BLOB_DIR: &str = "blobs";
const LOCK_FILE: &str = ".lock";

#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("document library at {path:?} is unavailable: {reason}")]
    StoreUnavailable { path: PathBuf, reason: String },
    #[error("document {0} not found")]
    NotFound(DocumentKey),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Everything the library knows about a document except its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub id: DocumentKey,
    pub name: String,
    pub mime_type: String,
    pub last_page: u32,
    /// Epoch milliseconds of the last save or page update.
    pub timestamp: i64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRecord {
    pub id: DocumentKey,
    pub name: String,
    pub mime_type: String,
    pub blob: Vec<u8>,
    pub last_page: u32,
    pub timestamp: i64,
}

impl DocumentRecord {
    fn from_parts(summary: DocumentSummary, blob: Vec<u8>) -> Self {
        Self {
            id: summary.id,
            name: summary.name,
            mime_type: summary.mime_type,
            blob,
            last_page: summary.last_page,
            timestamp: summary.timestamp,
        }
    }

    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            id: self.id,
            name: self.name.clone(),
            mime_type: self.mime_type.clone(),
            last_page: self.last_page,
            timestamp: self.timestamp,
            size: self.blob.len() as u64,
        }
    }
}

/// Sorts most recently touched documents first.
pub fn by_recency(documents: &mut [DocumentSummary]) {
    documents.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
}

#[async_trait]
pub trait LibraryStore: Send + Sync {
    async fn save(
        &self,
        blob: Vec<u8>,
        name: &str,
        mime_type: &str,
    ) -> Result<DocumentKey, LibraryError>;

    /// Unordered; sort with [`by_recency`] for display.
    async fn list(&self) -> Result<Vec<DocumentSummary>, LibraryError>;

    async fn get(&self, id: DocumentKey) -> Result<DocumentRecord, LibraryError>;

    async fn update_page(&self, id: DocumentKey, page: u32) -> Result<(), LibraryError>;

    /// Deleting an unknown id is not an error.
    async fn delete(&self, id: DocumentKey) -> Result<(), LibraryError>;
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

/// Wall-clock millis, bumped when needed so a store never hands out the same
/// timestamp twice.
fn next_timestamp(last: &mut i64) -> i64 {
    let next = now_millis().max(*last + 1);
    *last = next;
    next
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    next_id: DocumentKey,
    last_timestamp: i64,
    records: BTreeMap<DocumentKey, DocumentSummary>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: LIBRARY_SCHEMA_VERSION,
            next_id: 1,
            last_timestamp: 0,
            records: BTreeMap::new(),
        }
    }
}

/// Library kept in a directory: a versioned JSON manifest plus one file per
/// document blob.
///
/// Both are replaced through uniquely named temp files and a rename, so
/// readers see either the old or the new state. Every read-modify-write of
/// the manifest holds an advisory lock on `.lock` in the root, which
/// serializes writers across handles and processes.
pub struct FileLibraryStore {
    layout: Arc<LibraryLayout>,
    write_lock: tokio::sync::Mutex<()>,
}

#[derive(Debug)]
struct LibraryLayout {
    root: PathBuf,
}

impl LibraryLayout {
    fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    fn blob_dir(&self) -> PathBuf {
        self.root.join(BLOB_DIR)
    }

    fn blob_path(&self, id: DocumentKey) -> PathBuf {
        self.blob_dir().join(format!("{id}.bin"))
    }

    fn unavailable(&self, reason: impl ToString) -> LibraryError {
        LibraryError::StoreUnavailable {
            path: self.root.clone(),
            reason: reason.to_string(),
        }
    }

    fn parse_manifest(&self, bytes: &[u8]) -> Result<Manifest, LibraryError> {
        let manifest: Manifest = serde_json::from_slice(bytes)
            .map_err(|err| self.unavailable(format!("corrupt manifest: {err}")))?;
        if manifest.version > LIBRARY_SCHEMA_VERSION {
            return Err(self.unavailable(format!(
                "schema version {} is newer than supported version {}",
                manifest.version, LIBRARY_SCHEMA_VERSION
            )));
        }
        Ok(manifest)
    }

    fn load_manifest(&self) -> Result<Manifest, LibraryError> {
        match std::fs::read(self.manifest_path()) {
            Ok(bytes) => self.parse_manifest(&bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Manifest::default()),
            Err(err) => Err(self.unavailable(err)),
        }
    }

    fn commit(&self, manifest: &Manifest) -> Result<(), LibraryError> {
        let payload = serde_json::to_vec_pretty(manifest)?;
        write_atomic(&self.manifest_path(), &payload)
    }

    /// Writes the blob under the next id and commits its record. The blob is
    /// removed again when the commit fails.
    fn insert_document(
        &self,
        manifest: &mut Manifest,
        blob: &[u8],
        name: String,
        mime_type: String,
    ) -> Result<DocumentKey, LibraryError> {
        let id = manifest.next_id;
        let blob_path = self.blob_path(id);
        write_atomic(&blob_path, blob)?;

        let timestamp = next_timestamp(&mut manifest.last_timestamp);
        manifest.next_id += 1;
        manifest.records.insert(
            id,
            DocumentSummary {
                id,
                name,
                mime_type,
                last_page: 1,
                timestamp,
                size: blob.len() as u64,
            },
        );
        if let Err(err) = self.commit(manifest) {
            manifest.records.remove(&id);
            if let Err(cleanup) = std::fs::remove_file(&blob_path) {
                warn!(id, %cleanup, "failed to remove blob of unsaved document");
            }
            return Err(err);
        }
        Ok(id)
    }

    /// Runs `op` on the current manifest while holding the library lock.
    /// `op` decides itself whether to commit.
    fn locked<T, F>(&self, op: F) -> Result<T, LibraryError>
    where
        F: FnOnce(&Self, &mut Manifest) -> Result<T, LibraryError>,
    {
        std::fs::create_dir_all(self.blob_dir()).map_err(|err| self.unavailable(err))?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path())
            .map_err(|err| self.unavailable(err))?;
        let mut lock = fd_lock::RwLock::new(file);
        let _guard = lock.write().map_err(|err| self.unavailable(err))?;

        let mut manifest = self.load_manifest()?;
        op(self, &mut manifest)
    }
}

fn write_atomic(path: &Path, payload: &[u8]) -> Result<(), LibraryError> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(payload)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

impl FileLibraryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            layout: Arc::new(LibraryLayout { root: root.into() }),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.layout.root
    }

    /// Creates the layout when missing and loads the manifest. Opening an
    /// initialized library never modifies it.
    async fn open(&self) -> Result<Manifest, LibraryError> {
        let layout = &self.layout;
        fs::create_dir_all(layout.blob_dir())
            .await
            .map_err(|err| layout.unavailable(err))?;

        match fs::read(layout.manifest_path()).await {
            Ok(bytes) => layout.parse_manifest(&bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Manifest::default()),
            Err(err) => Err(layout.unavailable(err)),
        }
    }

    /// Runs a manifest update on the blocking pool under the library lock.
    /// One update per handle is in flight at a time.
    async fn update<T, F>(&self, op: F) -> Result<T, LibraryError>
    where
        F: FnOnce(&LibraryLayout, &mut Manifest) -> Result<T, LibraryError> + Send + 'static,
        T: Send + 'static,
    {
        let _guard = self.write_lock.lock().await;
        let layout = Arc::clone(&self.layout);
        tokio::task::spawn_blocking(move || layout.locked(op))
            .await
            .map_err(|err| LibraryError::Io(io::Error::new(io::ErrorKind::Other, err)))?
    }
}

#[async_trait]
impl LibraryStore for FileLibraryStore {
    #[instrument(skip(self, blob), fields(root = %self.layout.root.display(), bytes = blob.len()))]
    async fn save(
        &self,
        blob: Vec<u8>,
        name: &str,
        mime_type: &str,
    ) -> Result<DocumentKey, LibraryError> {
        let name = name.to_string();
        let mime_type = mime_type.to_string();
        let id = self
            .update(move |layout, manifest| {
                layout.insert_document(manifest, &blob, name, mime_type)
            })
            .await?;

        debug!(id, "document saved");
        Ok(id)
    }

    #[instrument(skip(self), fields(root = %self.layout.root.display()))]
    async fn list(&self) -> Result<Vec<DocumentSummary>, LibraryError> {
        let manifest = self.open().await?;
        Ok(manifest.records.into_values().collect())
    }

    #[instrument(skip(self), fields(root = %self.layout.root.display()))]
    async fn get(&self, id: DocumentKey) -> Result<DocumentRecord, LibraryError> {
        let mut manifest = self.open().await?;
        let summary = manifest
            .records
            .remove(&id)
            .ok_or(LibraryError::NotFound(id))?;

        let blob = match fs::read(self.layout.blob_path(id)).await {
            Ok(blob) => blob,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(LibraryError::NotFound(id))
            }
            Err(err) => return Err(err.into()),
        };
        Ok(DocumentRecord::from_parts(summary, blob))
    }

    #[instrument(skip(self), fields(root = %self.layout.root.display()))]
    async fn update_page(&self, id: DocumentKey, page: u32) -> Result<(), LibraryError> {
        self.update(move |layout, manifest| {
            let timestamp = next_timestamp(&mut manifest.last_timestamp);
            let record = manifest
                .records
                .get_mut(&id)
                .ok_or(LibraryError::NotFound(id))?;
            record.last_page = page;
            record.timestamp = timestamp;
            layout.commit(manifest)
        })
        .await
    }

    #[instrument(skip(self), fields(root = %self.layout.root.display()))]
    async fn delete(&self, id: DocumentKey) -> Result<(), LibraryError> {
        self.update(move |layout, manifest| {
            if manifest.records.remove(&id).is_none() {
                debug!(id, "delete of unknown document ignored");
                return Ok(());
            }
            layout.commit(manifest)?;

            // the document is gone once the manifest is committed
            match std::fs::remove_file(layout.blob_path(id)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!(id, %err, "failed to remove blob of deleted document"),
            }
            Ok(())
        })
        .await
    }
}

#[derive(Debug)]
struct MemoryLibrary {
    next_id: DocumentKey,
    last_timestamp: i64,
    records: BTreeMap<DocumentKey, DocumentRecord>,
}

/// Process-local library, used for tests and throwaway sessions.
pub struct MemoryLibraryStore {
    inner: Mutex<MemoryLibrary>,
}

impl MemoryLibraryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryLibrary {
                next_id: 1,
                last_timestamp: 0,
                records: BTreeMap::new(),
            }),
        }
    }
}

impl Default for MemoryLibraryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LibraryStore for MemoryLibraryStore {
    async fn save(
        &self,
        blob: Vec<u8>,
        name: &str,
        mime_type: &str,
    ) -> Result<DocumentKey, LibraryError> {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let timestamp = next_timestamp(&mut inner.last_timestamp);
        inner.records.insert(
            id,
            DocumentRecord {
                id,
                name: name.to_string(),
                mime_type: mime_type.to_string(),
                blob,
                last_page: 1,
                timestamp,
            },
        );
        Ok(id)
    }

    async fn list(&self) -> Result<Vec<DocumentSummary>, LibraryError> {
        Ok(self
            .inner
            .lock()
            .records
            .values()
            .map(DocumentRecord::summary)
            .collect())
    }

    async fn get(&self, id: DocumentKey) -> Result<DocumentRecord, LibraryError> {
        self.inner
            .lock()
            .records
            .get(&id)
            .cloned()
            .ok_or(LibraryError::NotFound(id))
    }

    async fn update_page(&self, id: DocumentKey, page: u32) -> Result<(), LibraryError> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let record = inner
            .records
            .get_mut(&id)
            .ok_or(LibraryError::NotFound(id))?;
        record.last_page = page;
        record.timestamp = next_timestamp(&mut inner.last_timestamp);
        Ok(())
    }

    async fn delete(&self, id: DocumentKey) -> Result<(), LibraryError> {
        self.inner.lock().records.remove(&id);
        Ok(())
    }
}
