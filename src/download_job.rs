use crate::chunk_store::ChunkStore;
use crate::error::{DownloadError, Result};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// `(loaded, total, speed_bytes_per_sec)`, recomputed at roughly 1 Hz while a
/// job streams.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub loaded: u64,
    pub total: u64,
    pub speed: f64,
}

pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Invoked on `StorageFull`; resolves to whether the job may fall back to
/// in-memory chunk accumulation.
pub type QuotaHandler = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Errored,
}

/// The response-classification state machine from the control-flow design:
/// decided once, before any streaming begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseClassification {
    Start,
    Resumed206,
    ResumedReset200,
    Completed416,
    RestartFrom416,
    HttpError(u16),
}

/// What a completed job hands back to the scheduler for finalization.
pub struct JobOutcome {
    pub validator: Option<String>,
    pub total_bytes: u64,
    /// `Some` when the job ran in memory-fallback mode; the scheduler writes
    /// these bytes straight to `ContentCache` instead of streaming from
    /// `ChunkStore`.
    pub memory_bytes: Option<Vec<u8>>,
}

/// Executes one resumable, cancellable resource acquisition.
pub struct DownloadJob {
    url: String,
    client: Client,
    chunk_store: Arc<ChunkStore>,
    flush_window_bytes: usize,
    quota_handler: Option<QuotaHandler>,
    cancel_token: CancellationToken,
    status: Mutex<JobStatus>,
    memory_fallback: AtomicBool,
}

impl DownloadJob {
    pub fn new(
        url: String,
        client: Client,
        chunk_store: Arc<ChunkStore>,
        flush_window_bytes: usize,
        quota_handler: Option<QuotaHandler>,
    ) -> Self {
        Self {
            url,
            client,
            chunk_store,
            flush_window_bytes,
            quota_handler,
            cancel_token: CancellationToken::new(),
            status: Mutex::new(JobStatus::Pending),
            memory_fallback: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> JobStatus {
        *self.status.lock().unwrap()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    fn set_status(&self, status: JobStatus) {
        *self.status.lock().unwrap() = status;
    }

    /// Run the job to completion, invoking `progress_cb` roughly once a
    /// second while data streams in.
    pub async fn run(&self, progress_cb: ProgressCallback) -> Result<JobOutcome> {
        if self.cancel_token.is_cancelled() {
            self.set_status(JobStatus::Paused);
            return Err(DownloadError::Cancelled);
        }
        self.set_status(JobStatus::Running);

        // Step 1: resumption check.
        let existing = self.chunk_store.get_metadata(&self.url)?;
        let (mut start_byte, mut chunk_index, mut known_validator) = match existing {
            Some(meta) if meta.downloaded_bytes > 0 => (meta.downloaded_bytes, meta.chunk_count, meta.validator),
            Some(_) => {
                self.chunk_store.clear(&self.url)?;
                (0, 0, None)
            }
            None => (0, 0, None),
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .run_attempt(start_byte, chunk_index, known_validator.clone(), progress_cb.clone())
                .await?
            {
                AttemptOutcome::Done(outcome) => {
                    self.set_status(JobStatus::Completed);
                    return Ok(outcome);
                }
                AttemptOutcome::RestartFromZero if attempt < 2 => {
                    start_byte = 0;
                    chunk_index = 0;
                    known_validator = None;
                    continue;
                }
                AttemptOutcome::RestartFromZero => {
                    self.set_status(JobStatus::Errored);
                    return Err(DownloadError::IntegrityError(
                        "server repeatedly rejected the request after restart".to_string(),
                    ));
                }
            }
        }
    }

    async fn run_attempt(
        &self,
        start_byte: u64,
        mut chunk_index: usize,
        known_validator: Option<String>,
        progress_cb: ProgressCallback,
    ) -> Result<AttemptOutcome> {
        // Step 2: request.
        let mut request = self.client.get(self.url.as_str());
        if start_byte > 0 {
            request = request.header("Range", format!("bytes={start_byte}-"));
        }
        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let content_length = headers
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let server_validator = headers
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        // Step 3: response classification.
        let (classification, mut total_bytes, mut effective_start) = if status == StatusCode::PARTIAL_CONTENT {
            (ResponseClassification::Resumed206, start_byte + content_length, start_byte)
        } else if status == StatusCode::OK && start_byte == 0 {
            (ResponseClassification::Start, content_length, 0)
        } else if status == StatusCode::OK && start_byte > 0 {
            (ResponseClassification::ResumedReset200, content_length, 0)
        } else if status == StatusCode::RANGE_NOT_SATISFIABLE {
            let total_on_server = headers
                .get("content-range")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total);
            match total_on_server {
                // Equal means we already hold exactly the resource's current
                // byte count: genuinely complete, nothing left to fetch. Any
                // mismatch (including start_byte > n, which means the locally
                // claimed total no longer agrees with what the server now
                // reports) is stale local state, not completion — clear and
                // restart instead of trusting it.
                Some(n) if start_byte == n => (ResponseClassification::Completed416, n, start_byte),
                _ => (ResponseClassification::RestartFrom416, 0, 0),
            }
        } else {
            (ResponseClassification::HttpError(status.as_u16()), 0, 0)
        };

        if let ResponseClassification::HttpError(code) = classification {
            return Err(DownloadError::HttpError { status: code });
        }

        if classification == ResponseClassification::RestartFrom416 {
            self.chunk_store.clear(&self.url)?;
            return Ok(AttemptOutcome::RestartFromZero);
        }

        if classification == ResponseClassification::Completed416 {
            return Ok(AttemptOutcome::Done(JobOutcome {
                validator: known_validator,
                total_bytes,
                memory_bytes: None,
            }));
        }

        if classification == ResponseClassification::ResumedReset200 {
            self.chunk_store.clear(&self.url)?;
            chunk_index = 0;
            effective_start = 0;
        }

        // Step 4: validator drift.
        if let (Some(known), Some(server)) = (&known_validator, &server_validator) {
            if known != server {
                self.chunk_store.clear(&self.url)?;
                self.set_status(JobStatus::Errored);
                return Err(DownloadError::ValidatorChanged);
            }
        }

        let validator = server_validator.or(known_validator);

        // Step 5-7: streaming consumption, quota fallback, completion.
        let outcome = self
            .stream_body(response, effective_start, chunk_index, total_bytes, validator, progress_cb)
            .await?;
        total_bytes = outcome.total_bytes;
        Ok(AttemptOutcome::Done(JobOutcome { total_bytes, ..outcome }))
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_body(
        &self,
        response: reqwest::Response,
        start_byte: u64,
        mut chunk_index: usize,
        total_bytes: u64,
        validator: Option<String>,
        progress_cb: ProgressCallback,
    ) -> Result<JobOutcome> {
        let mut stream = response.bytes_stream();
        let mut buffer = BytesMut::new();
        let mut loaded = start_byte;
        let mut last_tick = Instant::now();
        let mut bytes_since_tick = 0u64;
        let mut memory_chunks: Vec<Bytes> = Vec::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => {
                    self.set_status(JobStatus::Paused);
                    return Err(DownloadError::Cancelled);
                }
                item = stream.next() => item,
            };

            match next {
                Some(Ok(bytes)) => {
                    loaded += bytes.len() as u64;
                    bytes_since_tick += bytes.len() as u64;
                    buffer.extend_from_slice(&bytes);

                    if last_tick.elapsed().as_secs_f64() >= 1.0 {
                        let speed = bytes_since_tick as f64 / last_tick.elapsed().as_secs_f64();
                        progress_cb(Progress { loaded, total: total_bytes, speed });
                        last_tick = Instant::now();
                        bytes_since_tick = 0;
                    }

                    if buffer.len() >= self.flush_window_bytes {
                        self.flush_buffer(&mut buffer, &mut chunk_index, total_bytes, &validator, &mut memory_chunks)
                            .await?;
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }

        if !buffer.is_empty() {
            self.flush_buffer(&mut buffer, &mut chunk_index, total_bytes, &validator, &mut memory_chunks)
                .await?;
        }

        progress_cb(Progress { loaded, total: total_bytes, speed: 0.0 });

        if self.memory_fallback.load(Ordering::SeqCst) {
            let combined: Vec<u8> = memory_chunks.iter().flat_map(|b| b.to_vec()).collect();
            Ok(JobOutcome { validator, total_bytes, memory_bytes: Some(combined) })
        } else {
            Ok(JobOutcome { validator, total_bytes, memory_bytes: None })
        }
    }

    async fn flush_buffer(
        &self,
        buffer: &mut BytesMut,
        chunk_index: &mut usize,
        total_bytes: u64,
        validator: &Option<String>,
        memory_chunks: &mut Vec<Bytes>,
    ) -> Result<()> {
        let chunk = buffer.split().freeze();

        if self.memory_fallback.load(Ordering::SeqCst) {
            memory_chunks.push(chunk);
            *chunk_index += 1;
            return Ok(());
        }

        match self
            .chunk_store
            .append_chunk(&self.url, &chunk, *chunk_index, total_bytes, validator.clone())
        {
            Ok(()) => {
                *chunk_index += 1;
                Ok(())
            }
            Err(DownloadError::StorageFull) => self.fall_back_to_memory(chunk, chunk_index, memory_chunks).await,
            Err(e) => Err(e),
        }
    }

    /// Step 6: quota fallback. Recovers already-persisted chunks into
    /// memory, clears the store, and switches the job to memory mode.
    async fn fall_back_to_memory(
        &self,
        failed_chunk: Bytes,
        chunk_index: &mut usize,
        memory_chunks: &mut Vec<Bytes>,
    ) -> Result<()> {
        let Some(handler) = &self.quota_handler else {
            return Err(DownloadError::StorageFull);
        };
        if !handler().await {
            return Err(DownloadError::StorageFull);
        }

        warn!("chunk store out of quota for {}, falling back to memory", self.url);

        if let Some(meta) = self.chunk_store.get_metadata(&self.url)? {
            for chunk in self.chunk_store.stream(&self.url, meta.chunk_count) {
                memory_chunks.push(Bytes::from(chunk?));
            }
        }
        self.chunk_store.clear(&self.url)?;

        memory_chunks.push(failed_chunk);
        *chunk_index += 1;
        self.memory_fallback.store(true, Ordering::SeqCst);
        debug!("{} now running in memory-fallback mode, {} chunk(s) recovered", self.url, memory_chunks.len());
        Ok(())
    }
}

enum AttemptOutcome {
    Done(JobOutcome),
    RestartFromZero,
}

fn parse_content_range_total(header: &str) -> Option<u64> {
    header.rsplit('/').next().and_then(|n| n.parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_store::ChunkStore;
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;

    fn job(chunk_store: Arc<ChunkStore>, url: &str) -> DownloadJob {
        DownloadJob::new(url.to_string(), Client::new(), chunk_store, 5 * 1024 * 1024, None)
    }

    fn noop_progress() -> ProgressCallback {
        Arc::new(|_p| {})
    }

    #[tokio::test]
    async fn fresh_download_writes_single_chunk() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ChunkStore::open(dir.path(), "store", 1).unwrap());
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/a")
            .with_status(200)
            .with_header("content-length", "7")
            .with_body("content")
            .create_async()
            .await;

        let job = job(store.clone(), &format!("{}/a", server.url()));
        let outcome = job.run(noop_progress()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(outcome.total_bytes, 7);
        assert!(outcome.memory_bytes.is_none());

        let meta = store.get_metadata(&job.url).unwrap().unwrap();
        assert_eq!(meta.downloaded_bytes, 7);
        assert!(meta.is_complete());
    }

    #[tokio::test]
    async fn resume_sends_range_header_and_completes() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ChunkStore::open(dir.path(), "store", 1).unwrap());
        let url = "https://example.com/a";
        store.append_chunk(url, b"start", 0, 10, None).unwrap();

        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/a")
            .match_header("range", "bytes=5-")
            .with_status(206)
            .with_header("content-length", "5")
            .with_body("end!!")
            .create_async()
            .await;

        let job = job(store.clone(), &format!("{}/a", server.url()));
        let outcome = job.run(noop_progress()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(outcome.total_bytes, 10);

        let bytes: Vec<u8> = store.stream(url, 2).collect::<Result<Vec<_>>>().unwrap().concat();
        assert_eq!(bytes, b"startend!!");
    }

    #[tokio::test]
    async fn server_ignores_range_clears_and_restarts_from_zero() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ChunkStore::open(dir.path(), "store", 1).unwrap());
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/a")
            .match_header("range", "bytes=5-")
            .with_status(200)
            .with_header("content-length", "7")
            .with_body("content")
            .create_async()
            .await;

        let url = format!("{}/a", server.url());
        store.append_chunk(&url, b"stale", 0, 0, None).unwrap();

        let job = job(store.clone(), &url);
        let outcome = job.run(noop_progress()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(outcome.total_bytes, 7);
        let bytes: Vec<u8> = store.stream(&url, 1).collect::<Result<Vec<_>>>().unwrap().concat();
        assert_eq!(bytes, b"content");
    }

    #[tokio::test]
    async fn range_not_satisfiable_restarts_from_zero_on_mismatch() {
        // Seed scenario 4: the store claims more bytes (100) than the
        // server's current total (50) agrees with. That disagreement means
        // the local partial data is stale, not complete — expect a clear and
        // a second, un-ranged request whose fresh body becomes the artifact.
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ChunkStore::open(dir.path(), "store", 1).unwrap());
        let url_path = "/a";
        let mut server = mockito::Server::new_async().await;
        let restart_mock = server
            .mock("GET", url_path)
            .match_header("range", "bytes=100-")
            .with_status(416)
            .with_header("content-range", "bytes */50")
            .create_async()
            .await;
        let fresh_mock = server
            .mock("GET", url_path)
            .match_header("range", mockito::Matcher::Missing)
            .with_status(200)
            .with_header("content-length", "7")
            .with_body("content")
            .create_async()
            .await;

        let url = format!("{}{}", server.url(), url_path);
        store.append_chunk(&url, &vec![0u8; 100], 0, 100, None).unwrap();

        let job = job(store.clone(), &url);
        let outcome = job.run(noop_progress()).await.unwrap();

        restart_mock.assert_async().await;
        fresh_mock.assert_async().await;
        assert_eq!(outcome.total_bytes, 7);
        let bytes: Vec<u8> = store.stream(&url, 1).collect::<Result<Vec<_>>>().unwrap().concat();
        assert_eq!(bytes, b"content");
    }

    #[tokio::test]
    async fn range_not_satisfiable_with_matching_total_is_already_complete() {
        // start_byte == N: we hold exactly the resource's current byte
        // count, so a 416 on the next ranged request just confirms
        // completion rather than signalling drift.
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ChunkStore::open(dir.path(), "store", 1).unwrap());
        let url_path = "/a";
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", url_path)
            .match_header("range", "bytes=50-")
            .with_status(416)
            .with_header("content-range", "bytes */50")
            .create_async()
            .await;

        let url = format!("{}{}", server.url(), url_path);
        store.append_chunk(&url, &vec![0u8; 50], 0, 50, None).unwrap();

        let job = job(store.clone(), &url);
        let outcome = job.run(noop_progress()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(outcome.total_bytes, 50);
    }

    #[tokio::test]
    async fn quota_full_falls_back_to_memory_when_handler_consents() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ChunkStore::open(dir.path(), "store", 1).unwrap().with_quota(3));
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/a")
            .with_status(200)
            .with_header("content-length", "6")
            .with_body("abcdef")
            .create_async()
            .await;

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let handler: QuotaHandler = Arc::new(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { true })
        });

        let job = DownloadJob::new(
            format!("{}/a", server.url()),
            Client::new(),
            store.clone(),
            3,
            Some(handler),
        );

        let outcome = job.run(noop_progress()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.memory_bytes.as_deref(), Some(b"abcdef".as_slice()));
        assert!(store.get_metadata(&job.url).unwrap().is_none());
    }

    #[tokio::test]
    async fn cancellation_pauses_without_clearing_store() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ChunkStore::open(dir.path(), "store", 1).unwrap());
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/a")
            .with_status(200)
            .with_header("content-length", "1000000")
            .with_body(vec![0u8; 1_000_000])
            .create_async()
            .await;

        let job = Arc::new(job(store.clone(), &format!("{}/a", server.url())));
        let job_clone = job.clone();
        job_clone.cancel();

        let result = job.run(noop_progress()).await;
        assert!(matches!(result, Err(DownloadError::Cancelled)));
        assert_eq!(job.status(), JobStatus::Paused);
    }

    #[test]
    fn parses_content_range_total() {
        assert_eq!(parse_content_range_total("bytes */50"), Some(50));
        assert_eq!(parse_content_range_total("bytes 0-9/2000"), Some(2000));
    }
}
