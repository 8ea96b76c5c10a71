//! Read-through, TTL'd, content-addressed key-value stores. Three are
//! used by the rest of the crate: Registrations (by trial id),
//! Publications (by PMID), and Result-Classifications (by
//! `trialId__pmid`). Each is a directory of one JSON file per key,
//! written atomically (temp file + rename), matching the teacher's
//! per-entity JSON sidecar convention.
//!
//! Concurrency: a per-key single-flight primitive ensures at most one
//! producer runs per key even under concurrent callers, so concurrent
//! discovery of the same trial never duplicates work.

pub mod singleflight;

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::PublinkError;

/// The TTL bucket a value belongs to; looked up against
/// `cache.ttl.<cacheType>` in config, falling back to `cache.ttl.default`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheType {
    Registration,
    Publication,
    Classification,
    PubmedNaive,
    LinkedAtRegistration,
    GptQuery,
}

impl CacheType {
    pub fn config_key(self) -> &'static str {
        match self {
            CacheType::Registration => "registration",
            CacheType::Publication => "publication",
            CacheType::Classification => "classification",
            CacheType::PubmedNaive => "pubmed-naive",
            CacheType::LinkedAtRegistration => "linked-at-registration",
            CacheType::GptQuery => "gpt-query",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    timestamp: u64,
    ttl_seconds: u64,
    cache_type: CacheType,
    data: T,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A directory-backed, read-through KV store for one entity type.
pub struct Store {
    dir: PathBuf,
    single_flight: singleflight::SingleFlight,
}

/// Characters a key may not contain once sanitized for a filename.
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

impl Store {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            single_flight: singleflight::SingleFlight::new(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_key(key)))
    }

    /// Read a value iff present and unexpired. Values written without the
    /// TTL envelope (legacy shape) are returned as-is, per spec.
    pub async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PublinkError> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(PublinkError::CacheIo(err)),
        };

        if let Ok(envelope) = serde_json::from_slice::<Envelope<T>>(&bytes) {
            if now_secs().saturating_sub(envelope.timestamp) < envelope.ttl_seconds {
                return Ok(Some(envelope.data));
            }
            return Ok(None);
        }

        // Legacy / envelope-less value: return as-is.
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| PublinkError::CacheDecode { path: path.display().to_string(), source })
    }

    /// Write `data` under `key` with the given TTL bucket, atomically.
    pub async fn write<T: Serialize>(
        &self,
        key: &str,
        cache_type: CacheType,
        ttl_seconds: u64,
        data: &T,
    ) -> Result<(), PublinkError> {
        let envelope = Envelope {
            timestamp: now_secs(),
            ttl_seconds,
            cache_type,
            data,
        };
        let bytes = serde_json::to_vec_pretty(&envelope).map_err(|source| PublinkError::CacheDecode {
            path: key.to_string(),
            source,
        })?;
        save_atomic(&self.path_for(key), &bytes).await
    }

    /// Read-through: return the cached value if fresh, else run
    /// `produce` exactly once per key even under concurrent callers
    /// (single-flight), cache its result, and return it. `produce` may be
    /// called more than once across the process lifetime (once per
    /// cache miss), but never concurrently for the same key.
    pub async fn get_or_produce<T, F, Fut>(
        &self,
        key: &str,
        cache_type: CacheType,
        ttl_seconds: u64,
        produce: F,
    ) -> Result<T, PublinkError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, PublinkError>>,
    {
        let mut produce = Some(produce);
        loop {
            if let Some(cached) = self.read::<T>(key).await? {
                return Ok(cached);
            }

            match self.single_flight.enter(key).await {
                singleflight::Turn::Leader => {
                    let produce = produce.take().expect("leader runs produce exactly once");
                    let result = produce().await;
                    let value = match result {
                        Ok(value) => value,
                        Err(err) => {
                            self.single_flight.finish(key).await;
                            return Err(err);
                        }
                    };
                    let write_result = self.write(key, cache_type, ttl_seconds, &value).await;
                    self.single_flight.finish(key).await;
                    write_result?;
                    return Ok(value);
                }
                singleflight::Turn::Follower(notify) => {
                    notify.notified().await;
                }
            }
        }
    }
}

/// Write `bytes` to `path` via a temp file + rename so a crash never
/// leaves a torn or empty file in place of a prior value.
pub async fn save_atomic(path: &Path, bytes: &[u8]) -> Result<(), PublinkError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension(format!(
        "{}.tmp-{}",
        path.extension().and_then(|e| e.to_str()).unwrap_or("json"),
        std::process::id()
    ));
    tokio::fs::write(&tmp_path, bytes).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempdir();
        let store = Store::new(dir.path());
        store
            .write("NCT00000001", CacheType::Registration, 3600, &"hello".to_string())
            .await
            .unwrap();
        let value: Option<String> = store.read("NCT00000001").await.unwrap();
        assert_eq!(value.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn expired_entries_are_treated_as_missing() {
        let dir = tempdir();
        let store = Store::new(dir.path());
        store
            .write("NCT00000001", CacheType::Registration, 0, &"stale".to_string())
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let value: Option<String> = store.read("NCT00000001").await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn get_or_produce_caches_result() {
        let dir = tempdir();
        let store = Store::new(dir.path());
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let value = store
                .get_or_produce("NCT00000001", CacheType::Registration, 3600, || async move {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok::<_, PublinkError>("produced".to_string())
                })
                .await
                .unwrap();
            assert_eq!(value, "produced");
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn legacy_values_without_envelope_are_returned_as_is() {
        let dir = tempdir();
        let store = Store::new(dir.path());
        let path = store.path_for("legacy");
        tokio::fs::create_dir_all(dir.path()).await.unwrap();
        tokio::fs::write(&path, serde_json::to_vec(&"plain").unwrap())
            .await
            .unwrap();
        let value: Option<String> = store.read("legacy").await.unwrap();
        assert_eq!(value.as_deref(), Some("plain"));
    }

    fn tempdir() -> tempdir_shim::TempDir {
        tempdir_shim::TempDir::new()
    }

    /// A tiny self-cleaning temp-dir helper so tests don't pull in the
    /// `tempfile` crate for one use site.
    mod tempdir_shim {
        use std::path::{Path, PathBuf};

        pub struct TempDir(PathBuf);

        impl TempDir {
            pub fn new() -> Self {
                let dir = std::env::temp_dir().join(format!(
                    "publink-cache-test-{}-{}",
                    std::process::id(),
                    std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap()
                        .as_nanos()
                ));
                std::fs::create_dir_all(&dir).unwrap();
                Self(dir)
            }

            pub fn path(&self) -> &Path {
                &self.0
            }
        }

        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }
}
