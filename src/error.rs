use thiserror::Error;

/// Error kinds surfaced by the download core.
///
/// Variant names match the download core's documented error taxonomy rather
/// than the underlying transport/storage error type, so callers can match on
/// the variant without reaching into `reqwest`/`sled` internals.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Caller aborted the acquisition. State remains resumable.
    #[error("download cancelled")]
    Cancelled,

    /// Non-2xx, non-handled HTTP response.
    #[error("HTTP error: status {status}")]
    HttpError { status: u16 },

    /// Persisted validator (ETag) disagreed with the server's current one.
    /// The store has already been cleared by the time this is returned.
    #[error("resource validator changed since last download")]
    ValidatorChanged,

    /// `ChunkStore::append_chunk` was called with a validator that disagrees
    /// with the one already on record for this URL. Unlike `ValidatorChanged`
    /// this is raised by the store itself, before any job-level resolution;
    /// the store does not clear anything on this error.
    #[error("chunk validator disagrees with stored metadata")]
    ValidatorMismatch,

    /// Persistent store rejected a write because it is out of quota.
    #[error("persistent store is full")]
    StorageFull,

    /// Persistent store is not available at all; only memory fallback works.
    #[error("persistent store is unavailable")]
    StorageUnavailable,

    /// Finalization found a gap in the chunk sequence.
    #[error("missing chunk at index {0}")]
    MissingChunk(usize),

    /// `downloaded_bytes != total_bytes` at finalization, or a checksum
    /// mismatch was found during `check_integrity`.
    #[error("integrity check failed: {0}")]
    IntegrityError(String),

    /// Transport failure before completion. Store remains resumable.
    #[error("network error: {0}")]
    NetworkError(String),

    /// Serialization failure in the metadata/manifest layer.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// I/O failure outside of the store/network paths (e.g. temp files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for the underlying store's own error type.
    #[error("storage error: {0}")]
    Storage(String),

    /// A terminal failure relayed through the scheduler's broadcast
    /// resolution to a caller that deduplicated onto an in-flight job rather
    /// than driving it directly. The original typed error is already
    /// formatted into the message by the driving caller.
    #[error("download failed: {0}")]
    Failed(String),
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        DownloadError::NetworkError(err.to_string())
    }
}

impl From<sled::Error> for DownloadError {
    fn from(err: sled::Error) -> Self {
        DownloadError::Storage(err.to_string())
    }
}

impl From<sled::transaction::TransactionError<DownloadError>> for DownloadError {
    fn from(err: sled::transaction::TransactionError<DownloadError>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(inner) => inner,
            sled::transaction::TransactionError::Storage(e) => DownloadError::Storage(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;
