use crate::chunk_store::ChunkStore;
use crate::config::Config;
use crate::content_cache::{ContentCache, IntegrityStatus};
use crate::download_job::{DownloadJob, JobOutcome, Progress, ProgressCallback, QuotaHandler};
use crate::error::{DownloadError, Result};
use dashmap::DashMap;
use log::{error, info};
use reqwest::Client;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, Semaphore};

/// What a deduplicated subscriber eventually receives, broadcast once the
/// driving caller's finalization completes.
#[derive(Debug, Clone)]
enum JobResolution {
    Completed,
    Failed(String),
}

/// Tracks one in-flight acquisition, shared by every caller that
/// deduplicated onto the same URL.
struct JobHandle {
    job: Arc<DownloadJob>,
    resolution_tx: broadcast::Sender<JobResolution>,
    progress_cb: Mutex<ProgressCallback>,
}

/// Process-wide coordinator for resumable downloads: deduplicates concurrent
/// requests for the same URL, bounds concurrency, and finalizes completed
/// jobs into the [`ContentCache`].
///
/// Constructed once per process and threaded through as an `Arc` — the
/// singleton is a construction policy, not a global.
pub struct DownloadScheduler {
    chunk_store: Arc<ChunkStore>,
    content_cache: Arc<ContentCache>,
    client: Client,
    config: Config,
    semaphore: Arc<Semaphore>,
    jobs: Arc<DashMap<String, Arc<JobHandle>>>,
    quota_handler: Mutex<Option<QuotaHandler>>,
}

impl DownloadScheduler {
    pub fn new(chunk_store: Arc<ChunkStore>, content_cache: Arc<ContentCache>, config: Config) -> Self {
        Self {
            chunk_store,
            content_cache,
            client: Client::new(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            jobs: Arc::new(DashMap::new()),
            quota_handler: Mutex::new(None),
        }
    }

    pub fn set_quota_handler(&self, handler: QuotaHandler) {
        *self.quota_handler.lock().unwrap() = Some(handler);
    }

    /// Acquire `url`: short-circuits if already cached, dedupes onto an
    /// in-flight job, or admits a new one. Resolves only after finalization.
    pub async fn acquire(&self, url: &str, progress_cb: ProgressCallback) -> Result<()> {
        if self.content_cache.has(url)? {
            if let Some(meta) = self.content_cache.get_metadata(url)? {
                if meta.content_length > 0 {
                    progress_cb(Progress { loaded: 1, total: 1, speed: 0.0 });
                    return Ok(());
                }
            }
        }

        // Fast path: attach to an existing job, replacing its progress
        // callback (spec.md §4.4's documented dedup limitation).
        if let Some(handle) = self.jobs.get(url).map(|h| h.clone()) {
            *handle.progress_cb.lock().unwrap() = progress_cb;
            return Self::await_resolution(&handle).await;
        }

        let quota_handler = self.quota_handler.lock().unwrap().clone();
        let job = Arc::new(DownloadJob::new(
            url.to_string(),
            self.client.clone(),
            self.chunk_store.clone(),
            self.config.flush_window_bytes,
            quota_handler,
        ));
        let (resolution_tx, _) = broadcast::channel(8);
        let handle = Arc::new(JobHandle {
            job: job.clone(),
            resolution_tx,
            progress_cb: Mutex::new(progress_cb),
        });

        // Someone may have won a race to insert first; attach to theirs if
        // so. The entry (and its internal shard lock) must not be held
        // across an `.await`, so extract what we need and drop it first.
        let winner = match self.jobs.entry(url.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => Some(existing.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(handle.clone());
                None
            }
        };
        if let Some(existing) = winner {
            return Self::await_resolution(&existing).await;
        }

        // Subscribe before driving the job: `drive` broadcasts its outcome
        // exactly once and a subscriber that joins after the send would
        // never observe it.
        let mut rx = handle.resolution_tx.subscribe();
        self.drive(handle).await;
        Self::resolve(rx.recv().await)
    }

    async fn await_resolution(handle: &Arc<JobHandle>) -> Result<()> {
        let mut rx = handle.resolution_tx.subscribe();
        Self::resolve(rx.recv().await)
    }

    /// Maps a broadcast resolution (or a dropped-sender recv error) onto the
    /// caller-facing result. Shared by the driving caller and every
    /// deduplicated subscriber so both paths resolve identically.
    fn resolve(result: std::result::Result<JobResolution, broadcast::error::RecvError>) -> Result<()> {
        match result {
            Ok(JobResolution::Completed) => Ok(()),
            Ok(JobResolution::Failed(msg)) => Err(DownloadError::Failed(msg)),
            Err(_) => Err(DownloadError::Failed("scheduler dropped the job before it resolved".to_string())),
        }
    }

    /// Runs `handle`'s job under the concurrency bound, finalizes on
    /// success, and broadcasts the outcome to every dedup subscriber.
    async fn drive(&self, handle: Arc<JobHandle>) {
        let semaphore = self.semaphore.clone();
        let jobs = self.jobs.clone();
        let content_cache = self.content_cache.clone();
        let chunk_store = self.chunk_store.clone();
        let url = handle.job_url().to_string();

        let permit = match semaphore.acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                jobs.remove(&url);
                let _ = handle.resolution_tx.send(JobResolution::Failed("scheduler shut down".to_string()));
                return;
            }
        };

        let progress_cb: ProgressCallback = {
            let guard = handle.progress_cb.lock().unwrap();
            guard.clone()
        };

        let run_result = handle.job.run(progress_cb).await;
        let resolution = match run_result {
            Ok(outcome) => match Self::finalize(&chunk_store, &content_cache, &url, outcome) {
                Ok(()) => {
                    info!("finalized download for {url}");
                    JobResolution::Completed
                }
                Err(e) => {
                    error!("finalization failed for {url}: {e}");
                    JobResolution::Failed(e.to_string())
                }
            },
            Err(e) => {
                error!("download job failed for {url}: {e}");
                JobResolution::Failed(e.to_string())
            }
        };

        drop(permit);
        jobs.remove(&url);
        let _ = handle.resolution_tx.send(resolution);
    }

    /// Converts a completed job's chunks (or memory buffer) into a single
    /// `ContentCache` entry, then clears transient state. See spec.md §4.4.
    fn finalize(
        chunk_store: &ChunkStore,
        content_cache: &ContentCache,
        url: &str,
        outcome: JobOutcome,
    ) -> Result<()> {
        if let Some(bytes) = outcome.memory_bytes {
            content_cache.put(url, &bytes, None, outcome.validator)?;
            return Ok(());
        }

        let meta = chunk_store
            .get_metadata(url)?
            .ok_or_else(|| DownloadError::IntegrityError("no metadata at finalization".to_string()))?;
        if meta.downloaded_bytes != meta.total_bytes || meta.total_bytes == 0 {
            return Err(DownloadError::IntegrityError(format!(
                "downloaded_bytes ({}) != total_bytes ({})",
                meta.downloaded_bytes, meta.total_bytes
            )));
        }

        let mut bytes = Vec::with_capacity(meta.downloaded_bytes as usize);
        for chunk in chunk_store.stream(url, meta.chunk_count) {
            match chunk {
                Ok(c) => bytes.extend(c),
                Err(e) => {
                    // A gap despite matching byte counts is unrecoverable:
                    // a plain retry would short-circuit on downloaded_bytes
                    // == total_bytes and hit the same gap again. Clear so a
                    // future acquire starts fresh instead of resuming into it.
                    let _ = chunk_store.clear(url);
                    return Err(DownloadError::IntegrityError(format!(
                        "finalization found a gap in stored chunks for {url}: {e}"
                    )));
                }
            }
        }

        content_cache.put(url, &bytes, None, outcome.validator)?;
        chunk_store.clear(url)?;
        Ok(())
    }

    /// Aborts a running job or drops a not-yet-admitted one. The associated
    /// `acquire` call(s) resolve with `Cancelled`.
    pub fn cancel(&self, url: &str) {
        if let Some(handle) = self.jobs.get(url) {
            handle.job.cancel();
        }
    }

    pub fn check_integrity(&self, url: &str, expected_sha256: Option<&str>) -> Result<IntegrityStatus> {
        self.content_cache.check_integrity(url, expected_sha256)
    }

    /// Removes `url` from both the content cache and the chunk store.
    /// Idempotent: safe to call when neither holds the URL.
    pub fn delete(&self, url: &str) -> Result<()> {
        self.cancel(url);
        self.content_cache.delete(url)?;
        self.chunk_store.clear(url)?;
        Ok(())
    }
}

impl JobHandle {
    fn job_url(&self) -> &str {
        self.job.url()
    }
}
