/// Configuration recognized by the download core.
///
/// Mirrors the options a caller can set when constructing a
/// [`crate::scheduler::DownloadScheduler`]; defaults match the values the
/// spec calls out explicitly.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of jobs the scheduler runs concurrently.
    pub max_concurrent: usize,

    /// Buffered-byte threshold at which a job flushes one chunk to the
    /// store. ~5 MiB by default.
    pub flush_window_bytes: usize,

    /// Logical namespace for the [`crate::content_cache::ContentCache`].
    pub cache_name: String,

    /// Persistent store name for the [`crate::chunk_store::ChunkStore`].
    pub store_name: String,

    /// Schema version for the persistent store; bumped when the on-disk
    /// chunk/metadata layout changes incompatibly.
    pub store_version: u32,
}

pub const DEFAULT_MAX_CONCURRENT: usize = 3;
pub const DEFAULT_FLUSH_WINDOW_BYTES: usize = 5 * 1024 * 1024;
pub const DEFAULT_CACHE_NAME: &str = "transformers-cache";
pub const DEFAULT_STORE_NAME: &str = "transformers-chunk-store";
pub const CURRENT_STORE_VERSION: u32 = 1;

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            flush_window_bytes: DEFAULT_FLUSH_WINDOW_BYTES,
            cache_name: DEFAULT_CACHE_NAME.to_string(),
            store_name: DEFAULT_STORE_NAME.to_string(),
            store_version: CURRENT_STORE_VERSION,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.max_concurrent, 3);
        assert_eq!(cfg.flush_window_bytes, 5 * 1024 * 1024);
        assert_eq!(cfg.cache_name, "transformers-cache");
        assert_eq!(cfg.store_version, 1);
    }
}
