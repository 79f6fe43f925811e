//! On-disk cache of stream probe results.
//!
//! Re-validating a large playlist is slow, so results are kept in a small
//! bincode file keyed by URL and reused until they go stale.

use crate::channel::ChannelStatus;
use crate::errors::{MatrixError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Increment when the cached structs change to auto-invalidate old caches
const CACHE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedProbe {
    pub status: ChannelStatus,
    pub http_status: Option<u16>,
    pub checked_at: u64, // Unix timestamp (seconds)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidationCache {
    pub version: u32,
    entries: HashMap<String, CachedProbe>,
}

impl Default for ValidationCache {
    fn default() -> Self {
        Self {
            version: CACHE_VERSION,
            entries: HashMap::new(),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl ValidationCache {
    /// Path: <cache_dir>/validation.bin
    pub fn cache_path() -> Option<PathBuf> {
        let proj = crate::config::project_dirs()?;
        Some(proj.cache_dir().join("validation.bin"))
    }

    /// Load from the default location, starting empty if missing or unreadable
    pub fn load() -> Self {
        Self::cache_path()
            .and_then(|p| Self::load_from(&p))
            .unwrap_or_default()
    }

    /// Returns None if the cache doesn't exist, is corrupt, or has an old version
    pub fn load_from(path: &Path) -> Option<Self> {
        let data = std::fs::read(path).ok()?;
        let cache: ValidationCache = bincode::deserialize(&data).ok()?;

        if cache.version != CACHE_VERSION {
            let _ = std::fs::remove_file(path);
            return None;
        }
        Some(cache)
    }

    /// Prune entries older than `ttl_hours`, then save to the default location
    pub fn persist(&mut self, ttl_hours: u32) -> Result<usize> {
        let path = Self::cache_path()
            .ok_or_else(|| MatrixError::InvalidInput("cannot determine cache directory".into()))?;
        self.persist_to(&path, ttl_hours)
    }

    pub fn persist_to(&mut self, path: &Path, ttl_hours: u32) -> Result<usize> {
        let pruned = self.prune(ttl_hours);
        self.save_to(path)?;
        if pruned > 0 {
            tracing::debug!(pruned, kept = self.len(), "pruned validation cache");
        }
        Ok(pruned)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let encoded = bincode::serialize(self)
            .map_err(|e| MatrixError::InvalidInput(format!("cache encode failed: {}", e)))?;
        std::fs::write(path, encoded)?;
        Ok(())
    }

    /// Entry for `url` if it was checked less than `ttl_hours` ago
    pub fn get_fresh(&self, url: &str, ttl_hours: u32) -> Option<&CachedProbe> {
        let entry = self.entries.get(url)?;
        let age_secs = now_secs().saturating_sub(entry.checked_at);
        (age_secs < ttl_hours as u64 * 3600).then_some(entry)
    }

    /// Timeouts are transient and never cached
    pub fn record(&mut self, url: &str, status: ChannelStatus, http_status: Option<u16>) {
        if matches!(status, ChannelStatus::Timeout | ChannelStatus::Unchecked) {
            self.entries.remove(url);
            return;
        }
        self.entries.insert(
            url.to_string(),
            CachedProbe {
                status,
                http_status,
                checked_at: now_secs(),
            },
        );
    }

    /// Drop stale entries, returning how many were removed
    pub fn prune(&mut self, ttl_hours: u32) -> usize {
        let cutoff = now_secs().saturating_sub(ttl_hours as u64 * 3600);
        let before = self.entries.len();
        self.entries.retain(|_, e| e.checked_at >= cutoff);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_lookup() {
        let mut cache = ValidationCache::default();
        cache.record("http://a", ChannelStatus::Working, Some(200));
        cache.record("http://b", ChannelStatus::Timeout, None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_fresh("http://a", 1).unwrap().http_status, Some(200));
        assert!(cache.get_fresh("http://a", 0).is_none());
        assert!(cache.get_fresh("http://b", 1).is_none());
    }

    #[test]
    fn test_prune_removes_old_entries() {
        let mut cache = ValidationCache::default();
        cache.entries.insert(
            "http://old".into(),
            CachedProbe {
                status: ChannelStatus::Broken,
                http_status: Some(404),
                checked_at: 0,
            },
        );
        cache.record("http://new", ChannelStatus::Working, Some(200));
        assert_eq!(cache.prune(1), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_persist_drops_stale_entries_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("validation.bin");

        let mut cache = ValidationCache::default();
        cache.entries.insert(
            "http://old".into(),
            CachedProbe {
                status: ChannelStatus::Working,
                http_status: Some(200),
                checked_at: 1,
            },
        );
        cache.record("http://new", ChannelStatus::Broken, Some(404));
        assert_eq!(cache.persist_to(&path, 6).unwrap(), 1);

        let loaded = ValidationCache::load_from(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(!loaded.entries.contains_key("http://old"));
        assert!(loaded.get_fresh("http://new", 6).is_some());
    }

    #[test]
    fn test_save_load_and_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("validation.bin");

        let mut cache = ValidationCache::default();
        cache.record("http://a", ChannelStatus::Broken, Some(404));
        cache.save_to(&path).unwrap();
        let loaded = ValidationCache::load_from(&path).unwrap();
        assert_eq!(loaded.get_fresh("http://a", 1).unwrap().status, ChannelStatus::Broken);

        let stale = ValidationCache {
            version: CACHE_VERSION + 1,
            entries: HashMap::new(),
        };
        stale.save_to(&path).unwrap();
        assert!(ValidationCache::load_from(&path).is_none());
        assert!(!path.exists());
    }
}
