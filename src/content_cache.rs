use crate::error::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

/// A resource once it has left the chunked, in-progress world of
/// [`crate::chunk_store::ChunkStore`] and become a single read-optimized
/// blob, keyed by the URL it was fetched from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedResource {
    pub url: String,
    pub content_length: u64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub cached_at: i64,
}

/// Outcome of [`ContentCache::check_integrity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityStatus {
    Ok,
    Missing,
    SizeMismatch { expected: u64, actual: u64 },
    ChecksumMismatch,
}

/// Final, read-optimized, URL-keyed store. Unlike `ChunkStore` this holds
/// one contiguous blob per resource plus its fetch metadata; it is the
/// target of finalization, never itself written to incrementally.
pub struct ContentCache {
    bodies: sled::Tree,
    metadata: sled::Tree,
}

impl ContentCache {
    pub fn open<P: AsRef<Path>>(path: P, cache_name: &str) -> Result<Self> {
        let db = sled::Config::new().path(path.as_ref().join(cache_name)).open()?;
        let bodies = db.open_tree(b"bodies")?;
        let metadata = db.open_tree(b"metadata")?;
        Ok(Self { bodies, metadata })
    }

    pub fn put(
        &self,
        url: &str,
        body: &[u8],
        content_type: Option<String>,
        etag: Option<String>,
    ) -> Result<()> {
        let record = CachedResource {
            url: url.to_string(),
            content_length: body.len() as u64,
            content_type,
            etag,
            cached_at: chrono::Utc::now().timestamp_millis(),
        };
        let encoded = bincode::serialize(&record)?;

        self.bodies.insert(url.as_bytes(), body)?;
        self.metadata.insert(url.as_bytes(), encoded)?;
        Ok(())
    }

    pub fn get(&self, url: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.bodies.get(url.as_bytes())?.map(|v| v.to_vec()))
    }

    pub fn get_metadata(&self, url: &str) -> Result<Option<CachedResource>> {
        match self.metadata.get(url.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn has(&self, url: &str) -> Result<bool> {
        Ok(self.metadata.contains_key(url.as_bytes())?)
    }

    pub fn delete(&self, url: &str) -> Result<()> {
        self.bodies.remove(url.as_bytes())?;
        self.metadata.remove(url.as_bytes())?;
        Ok(())
    }

    /// Verify a cached resource's size, and optionally its SHA-256 digest,
    /// against expectations. Used after finalization and on demand.
    pub fn check_integrity(&self, url: &str, expected_sha256: Option<&str>) -> Result<IntegrityStatus> {
        let meta = match self.get_metadata(url)? {
            Some(m) => m,
            None => return Ok(IntegrityStatus::Missing),
        };
        let body = match self.get(url)? {
            Some(b) => b,
            None => return Ok(IntegrityStatus::Missing),
        };

        if body.len() as u64 != meta.content_length {
            return Ok(IntegrityStatus::SizeMismatch {
                expected: meta.content_length,
                actual: body.len() as u64,
            });
        }

        if let Some(expected) = expected_sha256 {
            let mut hasher = Sha256::new();
            hasher.update(&body);
            let digest = hex_encode(&hasher.finalize());
            if !digest.eq_ignore_ascii_case(expected) {
                return Ok(IntegrityStatus::ChecksumMismatch);
            }
        }

        Ok(IntegrityStatus::Ok)
    }

    pub fn flush(&self) -> Result<()> {
        self.bodies.flush()?;
        self.metadata.flush()?;
        Ok(())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cache(dir: &TempDir) -> ContentCache {
        ContentCache::open(dir.path(), "test-cache").unwrap()
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache
            .put("https://example.com/a", b"payload", Some("text/plain".into()), Some("abc".into()))
            .unwrap();

        assert_eq!(cache.get("https://example.com/a").unwrap().unwrap(), b"payload");
        let meta = cache.get_metadata("https://example.com/a").unwrap().unwrap();
        assert_eq!(meta.content_length, 7);
        assert_eq!(meta.etag.as_deref(), Some("abc"));
    }

    #[test]
    fn missing_resource_reports_missing() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        assert_eq!(cache.check_integrity("nope", None).unwrap(), IntegrityStatus::Missing);
    }

    #[test]
    fn size_mismatch_is_detected() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache.put("u1", b"hello", None, None).unwrap();
        // Corrupt the body directly without touching metadata.
        cache.bodies.insert("u1".as_bytes(), b"hi").unwrap();

        let status = cache.check_integrity("u1", None).unwrap();
        assert_eq!(status, IntegrityStatus::SizeMismatch { expected: 5, actual: 2 });
    }

    #[test]
    fn checksum_mismatch_is_detected() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache.put("u1", b"hello", None, None).unwrap();

        let status = cache.check_integrity("u1", Some("deadbeef")).unwrap();
        assert_eq!(status, IntegrityStatus::ChecksumMismatch);
    }

    #[test]
    fn checksum_match_reports_ok() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache.put("u1", b"hello", None, None).unwrap();

        let mut hasher = Sha256::new();
        hasher.update(b"hello");
        let digest = hex_encode(&hasher.finalize());

        assert_eq!(cache.check_integrity("u1", Some(&digest)).unwrap(), IntegrityStatus::Ok);
    }

    #[test]
    fn delete_removes_body_and_metadata() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache.put("u1", b"hello", None, None).unwrap();
        cache.delete("u1").unwrap();

        assert!(cache.get("u1").unwrap().is_none());
        assert!(!cache.has("u1").unwrap());
    }
}
