use crate::error::{DownloadError, Result};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const SCHEMA_VERSION_KEY: &[u8] = b"__schema_version__";

/// Per-resource bookkeeping persisted alongside the chunk bytes.
///
/// Invariants (see spec §3): `downloaded_bytes` is the sum of all stored
/// chunk sizes; `total_bytes` (once known) bounds it from above; chunks are
/// written in ascending index order within a single job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub url: String,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub chunk_count: usize,
    pub validator: Option<String>,
    pub last_updated: i64,
}

impl ChunkMetadata {
    fn new(url: &str, validator: Option<String>) -> Self {
        Self {
            url: url.to_string(),
            total_bytes: 0,
            downloaded_bytes: 0,
            chunk_count: 0,
            validator,
            last_updated: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// `true` iff `downloaded_bytes == total_bytes > 0` (spec I4).
    pub fn is_complete(&self) -> bool {
        self.total_bytes > 0 && self.downloaded_bytes == self.total_bytes
    }
}

fn chunk_key(url: &str, index: usize) -> Vec<u8> {
    format!("{url}:{index:010}").into_bytes()
}

/// Durable, append-only block store keyed by `(url, chunk index)`, plus
/// per-URL metadata. Backed by `sled`; the chunk write and the metadata
/// update for a single `append_chunk` call commit as one transaction so a
/// reader never observes one without the other (spec I5).
pub struct ChunkStore {
    chunks: sled::Tree,
    metadata: sled::Tree,
    available: AtomicBool,
    quota_bytes: Option<u64>,
    used_bytes: AtomicU64,
}

impl ChunkStore {
    /// Open (or create) a chunk store at `path`, scoped by `store_name` and
    /// `store_version`. A stored schema version older than `store_version`
    /// is accepted and rewritten; this crate does not define migrations
    /// beyond recording the current version, since no incompatible layout
    /// change has happened yet.
    pub fn open<P: AsRef<Path>>(path: P, store_name: &str, store_version: u32) -> Result<Self> {
        let db = sled::Config::new()
            .path(path.as_ref().join(store_name))
            .open()?;

        let chunks = db.open_tree(b"chunks")?;
        let metadata = db.open_tree(b"metadata")?;

        if metadata.get(SCHEMA_VERSION_KEY)?.is_none() {
            metadata.insert(SCHEMA_VERSION_KEY, &store_version.to_le_bytes())?;
        }

        let used_bytes = Self::sum_downloaded_bytes(&metadata)?;

        Ok(Self {
            chunks,
            metadata,
            available: AtomicBool::new(true),
            quota_bytes: None,
            used_bytes: AtomicU64::new(used_bytes),
        })
    }

    /// A store instance that reports `StorageUnavailable` for every
    /// mutating call, for hosts that disable persistent storage.
    pub fn disabled() -> Self {
        let db = sled::Config::new().temporary(true).open().expect("in-memory sled config");
        let chunks = db.open_tree(b"chunks").expect("open tree");
        let metadata = db.open_tree(b"metadata").expect("open tree");
        Self {
            chunks,
            metadata,
            available: AtomicBool::new(false),
            quota_bytes: None,
            used_bytes: AtomicU64::new(0),
        }
    }

    /// Caps total stored bytes across all resources; exceeding it makes
    /// `append_chunk` fail with `StorageFull` instead of writing.
    pub fn with_quota(mut self, max_bytes: u64) -> Self {
        self.quota_bytes = Some(max_bytes);
        self
    }

    fn sum_downloaded_bytes(metadata: &sled::Tree) -> Result<u64> {
        let mut total = 0u64;
        for item in metadata.iter() {
            let (key, value) = item?;
            if key.as_ref() == SCHEMA_VERSION_KEY {
                continue;
            }
            let meta: ChunkMetadata = bincode::deserialize(&value)?;
            total += meta.downloaded_bytes;
        }
        Ok(total)
    }

    /// Append one chunk at `index`, creating or updating the resource's
    /// metadata. See spec §4.1 for the four-step algorithm this implements
    /// as a single transaction.
    pub fn append_chunk(
        &self,
        url: &str,
        chunk_bytes: &[u8],
        index: usize,
        total_bytes: u64,
        validator: Option<String>,
    ) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(DownloadError::StorageUnavailable);
        }

        if let Some(quota) = self.quota_bytes {
            let used = self.used_bytes.load(Ordering::SeqCst);
            if used + chunk_bytes.len() as u64 > quota {
                return Err(DownloadError::StorageFull);
            }
        }

        let key = chunk_key(url, index);

        let result: std::result::Result<(), TransactionError<DownloadError>> =
            (&self.chunks, &self.metadata).transaction(|(tx_chunks, tx_metadata)| {
                tx_chunks.insert(key.as_slice(), chunk_bytes)?;

                let mut meta = match tx_metadata.get(url.as_bytes())? {
                    Some(bytes) => bincode::deserialize::<ChunkMetadata>(&bytes)
                        .map_err(|e| ConflictableTransactionError::Abort(DownloadError::Serialization(e)))?,
                    None => ChunkMetadata::new(url, validator.clone()),
                };

                if let (Some(existing), Some(incoming)) = (&meta.validator, &validator) {
                    if existing != incoming {
                        return Err(ConflictableTransactionError::Abort(DownloadError::ValidatorMismatch));
                    }
                }
                if meta.validator.is_none() {
                    meta.validator = validator.clone();
                }

                meta.chunk_count = meta.chunk_count.max(index + 1);
                if total_bytes > 0 {
                    meta.total_bytes = total_bytes;
                }
                meta.downloaded_bytes += chunk_bytes.len() as u64;
                meta.last_updated = chrono::Utc::now().timestamp_millis();

                let encoded = bincode::serialize(&meta)
                    .map_err(|e| ConflictableTransactionError::Abort(DownloadError::Serialization(e)))?;
                tx_metadata.insert(url.as_bytes(), encoded)?;

                Ok(())
            });

        result?;
        self.used_bytes.fetch_add(chunk_bytes.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    pub fn get_metadata(&self, url: &str) -> Result<Option<ChunkMetadata>> {
        match self.metadata.get(url.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove all chunks and metadata for `url`. Idempotent.
    pub fn clear(&self, url: &str) -> Result<()> {
        if let Some(bytes) = self.metadata.get(url.as_bytes())? {
            let meta: ChunkMetadata = bincode::deserialize(&bytes)?;
            self.used_bytes.fetch_sub(meta.downloaded_bytes.min(self.used_bytes.load(Ordering::SeqCst)), Ordering::SeqCst);
            for i in 0..meta.chunk_count {
                self.chunks.remove(chunk_key(url, i))?;
            }
            self.metadata.remove(url.as_bytes())?;
        }
        Ok(())
    }

    /// Pull-based, single-pass read-back of chunks `0..expected_chunks`
    /// concatenated in order.
    pub fn stream<'a>(&'a self, url: &'a str, expected_chunks: usize) -> ChunkStream<'a> {
        ChunkStream {
            store: self,
            url,
            expected_chunks,
            next_index: 0,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn flush(&self) -> Result<()> {
        self.chunks.flush()?;
        self.metadata.flush()?;
        Ok(())
    }
}

/// Single-pass iterator over a resource's stored chunks, in ascending index
/// order. Restartable only by calling [`ChunkStore::stream`] again.
pub struct ChunkStream<'a> {
    store: &'a ChunkStore,
    url: &'a str,
    expected_chunks: usize,
    next_index: usize,
}

impl<'a> Iterator for ChunkStream<'a> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_index >= self.expected_chunks {
            return None;
        }
        let index = self.next_index;
        self.next_index += 1;

        let key = chunk_key(self.url, index);
        match self.store.chunks.get(key) {
            Ok(Some(bytes)) => Some(Ok(bytes.to_vec())),
            Ok(None) => Some(Err(DownloadError::MissingChunk(index))),
            Err(e) => Some(Err(e.into())),
        }
    }
}
