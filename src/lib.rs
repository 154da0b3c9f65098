//! Resumable, quota-aware, chunked download core for large model artifacts.
//!
//! Four cooperating pieces, leaves first: [`chunk_store`] is the durable
//! append-only block store a job writes chunks into; [`content_cache`] is
//! the final read-optimized store a completed resource lands in;
//! [`download_job`] drives one resumable HTTP acquisition; [`scheduler`]
//! coordinates acquisitions across callers, dedupes by URL, bounds
//! concurrency, and finalizes completed jobs from the chunk store into the
//! content cache.

pub mod chunk_store;
pub mod config;
pub mod content_cache;
pub mod download_job;
pub mod error;
pub mod scheduler;

pub use chunk_store::{ChunkMetadata, ChunkStore, ChunkStream};
pub use config::Config;
pub use content_cache::{CachedResource, ContentCache, IntegrityStatus};
pub use download_job::{DownloadJob, JobOutcome, JobStatus, Progress, ProgressCallback, QuotaHandler};
pub use error::{DownloadError, Result};
pub use scheduler::DownloadScheduler;
