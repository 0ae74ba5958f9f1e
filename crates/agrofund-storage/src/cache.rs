//! File-backed expiring cache for derived views (filtered lists, aggregate stats).
//!
//! One JSON document per entry, named `<operation>-<sha256>.json` so entries can be
//! invalidated by operation name. Expiry is lazy: `get` drops stale entries it reads,
//! and `cleanup_expired` sweeps everything against each entry's own recorded max-age.

use std::path::{Path, PathBuf};
use std::time::Duration;

use agrofund_core::env;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache entry {path} is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// Cache key: the operation name plus a SHA-256 over its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub operation: String,
    pub digest: String,
}

impl CacheKey {
    pub fn file_name(&self) -> String {
        let operation: String = self
            .operation
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        format!("{operation}-{}.json", self.digest)
    }
}

/// Builds a deterministic key. Keyword arguments are sorted by name before hashing,
/// positional arguments keep their order.
pub fn cache_key(operation: &str, positional: &[&str], keyword: &[(&str, &str)]) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(operation.as_bytes());
    hasher.update(b"|");
    for arg in positional {
        hasher.update(arg.len().to_le_bytes());
        hasher.update(arg.as_bytes());
    }
    hasher.update(b"|");

    let mut sorted: Vec<_> = keyword.iter().collect();
    sorted.sort_by_key(|(k, _)| *k);
    for (k, v) in sorted {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.len().to_le_bytes());
        hasher.update(v.as_bytes());
        hasher.update(b"&");
    }

    CacheKey {
        operation: operation.to_string(),
        digest: hex::encode(hasher.finalize()),
    }
}

/// Default max-age per data category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheAges {
    pub list: Duration,
    pub detail: Duration,
    pub stats: Duration,
}

impl Default for CacheAges {
    fn default() -> Self {
        Self {
            list: Duration::from_secs(300),
            detail: Duration::from_secs(900),
            stats: Duration::from_secs(600),
        }
    }
}

impl CacheAges {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            list: Duration::from_secs(env::parsed("AGROFUND_CACHE_LIST_SECS", defaults.list.as_secs())),
            detail: Duration::from_secs(env::parsed(
                "AGROFUND_CACHE_DETAIL_SECS",
                defaults.detail.as_secs(),
            )),
            stats: Duration::from_secs(env::parsed("AGROFUND_CACHE_STATS_SECS", defaults.stats.as_secs())),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    operation: String,
    stored_at: DateTime<Utc>,
    max_age_secs: u64,
    value: serde_json::Value,
}

impl CacheEntry {
    fn is_stale(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.stored_at);
        age.num_milliseconds() > i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Single-process cache; no cross-process consistency.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    dir: PathBuf,
}

impl ResponseCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// Returns the cached value, or `None` on a miss, a stale entry or a corrupt entry.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey, max_age: Duration) -> Option<T> {
        self.get_at(key, max_age, Utc::now()).await
    }

    pub async fn get_at<T: DeserializeOwned>(
        &self,
        key: &CacheKey,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Option<T> {
        match self.lookup_at(key, max_age, now).await {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "dropping unreadable cache entry");
                remove_quietly(&self.entry_path(key)).await;
                None
            }
        }
    }

    /// Like [`get_at`](Self::get_at) but reports unreadable entries instead of hiding them.
    /// Stale entries are still deleted and reported as a miss.
    pub async fn lookup_at<T: DeserializeOwned>(
        &self,
        key: &CacheKey,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<T>, CacheError> {
        let path = self.entry_path(key);
        let Some(entry) = read_entry(&path).await? else {
            return Ok(None);
        };
        if entry.is_stale(max_age, now) {
            debug!(operation = %key.operation, "cache entry expired");
            remove_quietly(&path).await;
            return Ok(None);
        }
        serde_json::from_value(entry.value)
            .map(Some)
            .map_err(|e| CacheError::Corrupt {
                path,
                reason: e.to_string(),
            })
    }

    pub async fn set<T: Serialize>(&self, key: &CacheKey, value: &T, max_age: Duration) -> Result<(), CacheError> {
        self.set_at(key, value, max_age, Utc::now()).await
    }

    pub async fn set_at<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        let path = self.entry_path(key);
        let entry = CacheEntry {
            operation: key.operation.clone(),
            stored_at: now,
            max_age_secs: max_age.as_secs(),
            value: serde_json::to_value(value).map_err(|e| CacheError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?,
        };
        let bytes = serde_json::to_vec(&entry).map_err(|e| CacheError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        write_entry(&self.dir, &path, &bytes).await
    }

    /// Returns the cached value or computes, stores and returns a fresh one.
    pub async fn get_or_compute<T, F>(&self, key: &CacheKey, max_age: Duration, compute: F) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        if let Some(hit) = self.get(key, max_age).await {
            return hit;
        }
        let value = compute();
        if let Err(err) = self.set(key, &value, max_age).await {
            warn!(error = %err, operation = %key.operation, "failed to store cache entry");
        }
        value
    }

    /// Removes entries whose file name contains `pattern`, or every entry for `None`.
    pub async fn clear(&self, pattern: Option<&str>) -> usize {
        let mut removed = 0;
        for path in self.entry_files().await {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if pattern.map_or(true, |p| name.contains(p)) && fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        debug!(removed, ?pattern, "cache cleared");
        removed
    }

    pub async fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(Utc::now()).await
    }

    /// Full sweep against each entry's own max-age. Corrupt entries are deleted too.
    pub async fn cleanup_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for path in self.entry_files().await {
            let expired = match read_entry(&path).await {
                Ok(Some(entry)) => entry.is_stale(Duration::from_secs(entry.max_age_secs), now),
                Ok(None) => false,
                Err(err) => {
                    warn!(error = %err, "removing corrupt cache entry");
                    true
                }
            };
            if expired && fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }

    async fn entry_files(&self) -> Vec<PathBuf> {
        let Ok(mut entries) = fs::read_dir(&self.dir).await else {
            return Vec::new();
        };
        let mut files = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files
    }
}

async fn read_entry(path: &Path) -> Result<Option<CacheEntry>, CacheError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(io_error(path)(source)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| CacheError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError {
    let path = path.to_path_buf();
    move |source| CacheError::Io { path, source }
}

async fn write_entry(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    fs::create_dir_all(dir).await.map_err(io_error(dir))?;
    let temp = dir.join(format!(".{}.tmp", Uuid::new_v4()));
    fs::write(&temp, bytes).await.map_err(io_error(&temp))?;
    if let Err(source) = fs::rename(&temp, path).await {
        let _ = fs::remove_file(&temp).await;
        return Err(io_error(path)(source));
    }
    Ok(())
}

async fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to delete cache entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use tempfile::tempdir;

    #[test]
    fn keyword_order_does_not_change_the_key() {
        let a = cache_key("list", &["page"], &[("status", "Open"), ("q", "riego")]);
        let b = cache_key("list", &["page"], &[("q", "riego"), ("status", "Open")]);
        assert_eq!(a, b);
        assert_ne!(a, cache_key("stats", &["page"], &[("q", "riego"), ("status", "Open")]));
        assert_ne!(
            cache_key("list", &["ab", "c"], &[]),
            cache_key("list", &["a", "bc"], &[])
        );
    }

    #[tokio::test]
    async fn fresh_entry_hits_and_stale_entry_misses() {
        let dir = tempdir().expect("tempdir");
        let cache = ResponseCache::new(dir.path());
        let key = cache_key("stats", &[], &[]);
        let now = Utc::now();

        cache.set_at(&key, &vec![1, 2, 3], Duration::from_secs(100), now).await.unwrap();
        let hit: Option<Vec<i32>> = cache.get_at(&key, Duration::from_secs(100), now).await;
        assert_eq!(hit, Some(vec![1, 2, 3]));

        let short = cache_key("detail", &["x"], &[]);
        cache.set_at(&short, &"v", Duration::from_secs(1), now).await.unwrap();
        let later = now + TimeDelta::milliseconds(1500);
        let miss: Option<String> = cache.get_at(&short, Duration::from_secs(1), later).await;
        assert_eq!(miss, None);
        assert!(!dir.path().join(short.file_name()).exists(), "stale entry removed on read");
    }

    #[tokio::test]
    async fn huge_max_age_never_expires() {
        let dir = tempdir().expect("tempdir");
        let cache = ResponseCache::new(dir.path());
        let key = cache_key("stats", &[], &[]);
        let now = Utc::now();
        cache.set_at(&key, &5, Duration::MAX, now).await.unwrap();

        let later = now + TimeDelta::days(3650);
        assert_eq!(cache.get_at::<i32>(&key, Duration::MAX, later).await, Some(5));
        assert_eq!(cache.cleanup_expired_at(later).await, 0);
    }

    #[tokio::test]
    async fn real_clock_expiry() {
        let dir = tempdir().expect("tempdir");
        let cache = ResponseCache::new(dir.path());
        let key = cache_key("list", &[], &[]);
        cache.set(&key, &"v", Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(cache.get::<String>(&key, Duration::from_secs(1)).await, None);
    }

    #[tokio::test]
    async fn corrupt_entry_is_a_miss_and_is_deleted() {
        let dir = tempdir().expect("tempdir");
        let cache = ResponseCache::new(dir.path());
        let key = cache_key("list", &[], &[]);
        std::fs::write(dir.path().join(key.file_name()), b"garbage").unwrap();

        assert!(cache.lookup_at::<String>(&key, Duration::from_secs(5), Utc::now()).await.is_err());
        assert_eq!(cache.get::<String>(&key, Duration::from_secs(5)).await, None);
        assert!(!dir.path().join(key.file_name()).exists());
    }

    #[tokio::test]
    async fn cleanup_uses_each_entry_max_age_and_removes_corrupt_files() {
        let dir = tempdir().expect("tempdir");
        let cache = ResponseCache::new(dir.path());
        let now = Utc::now();
        let old = now - TimeDelta::seconds(60);

        cache.set_at(&cache_key("short", &[], &[]), &1, Duration::from_secs(10), old).await.unwrap();
        cache.set_at(&cache_key("long", &[], &[]), &2, Duration::from_secs(3600), old).await.unwrap();
        std::fs::write(dir.path().join("broken-abc.json"), b"{").unwrap();

        assert_eq!(cache.cleanup_expired_at(now).await, 2);
        let kept: Option<i32> = cache.get_at(&cache_key("long", &[], &[]), Duration::from_secs(3600), now).await;
        assert_eq!(kept, Some(2));
    }

    #[tokio::test]
    async fn clear_by_operation_pattern() {
        let dir = tempdir().expect("tempdir");
        let cache = ResponseCache::new(dir.path());
        cache.set(&cache_key("list", &["1"], &[]), &1, Duration::from_secs(60)).await.unwrap();
        cache.set(&cache_key("list", &["2"], &[]), &2, Duration::from_secs(60)).await.unwrap();
        cache.set(&cache_key("stats", &[], &[]), &3, Duration::from_secs(60)).await.unwrap();

        assert_eq!(cache.clear(Some("list-")).await, 2);
        assert_eq!(cache.clear(None).await, 1);
        assert_eq!(cache.clear(None).await, 0);
    }

    #[tokio::test]
    async fn get_or_compute_only_computes_on_miss() {
        let dir = tempdir().expect("tempdir");
        let cache = ResponseCache::new(dir.path());
        let key = cache_key("stats", &[], &[]);
        let mut calls = 0;
        let first: u32 = cache.get_or_compute(&key, Duration::from_secs(60), || {
            calls += 1;
            7
        }).await;
        let second: u32 = cache.get_or_compute(&key, Duration::from_secs(60), || {
            calls += 1;
            8
        }).await;
        assert_eq!((first, second, calls), (7, 7, 1));
    }
}
