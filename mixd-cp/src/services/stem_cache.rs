//! Persistent stem cache
//!
//! Content-addressed store of normalised stem sets: four PCM files under
//! `<root>/<hh>/<hash>/`. A set is either complete or absent: inserts go
//! through a staging directory inside the cache root and land with one
//! rename. Recency is a marker file per set whose mtime is refreshed on
//! every hit, so the LRU order survives restarts. Nothing outside eviction
//! ever deletes a cached set.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use tokio::sync::Mutex;

use crate::models::callback::STEM_NAMES;

const MARKER_FILE: &str = ".last_used";
const STAGING_DIR: &str = ".staging";

#[derive(Debug, Clone)]
pub struct StemCacheConfig {
    pub root: PathBuf,
    /// Total size ceiling; eviction runs when an insert pushes past it
    pub max_bytes: u64,
}

/// On-disk stem cache
pub struct StemCache {
    config: StemCacheConfig,
    /// Serialises set/evict so two inserts cannot interleave an eviction
    write_guard: Mutex<()>,
}

impl StemCache {
    pub fn new(config: StemCacheConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.root)
            .with_context(|| format!("creating stem cache root {}", config.root.display()))?;
        std::fs::create_dir_all(config.root.join(STAGING_DIR))?;
        Ok(Self {
            config,
            write_guard: Mutex::new(()),
        })
    }

    fn set_dir(&self, hash: &str) -> PathBuf {
        self.config.root.join(&hash[..2]).join(hash)
    }

    fn stem_file(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{}.wav", name))
    }

    /// Look up a complete stem set. Refreshes the recency marker on hit.
    pub async fn get(&self, hash: &str) -> Option<HashMap<String, PathBuf>> {
        let dir = self.set_dir(hash);
        let mut files = HashMap::new();
        for name in STEM_NAMES {
            let path = Self::stem_file(&dir, name);
            if !path.is_file() {
                return None;
            }
            files.insert(name.to_string(), path);
        }

        // Rewriting the marker bumps its mtime; that is the LRU clock.
        if let Err(e) = tokio::fs::write(dir.join(MARKER_FILE), b"").await {
            tracing::warn!(hash, error = %e, "Failed to refresh stem cache marker");
        }
        Some(files)
    }

    /// Whether a complete set exists without touching the recency marker
    pub fn contains(&self, hash: &str) -> bool {
        let dir = self.set_dir(hash);
        STEM_NAMES.iter().all(|n| Self::stem_file(&dir, n).is_file())
    }

    /// Insert a stem set from files elsewhere on disk.
    ///
    /// The files are copied into a staging directory inside the cache root
    /// and the whole directory is renamed into place, so readers never see a
    /// partial set. Returns the cached paths.
    pub async fn set(
        &self,
        hash: &str,
        files: &HashMap<String, PathBuf>,
    ) -> Result<HashMap<String, PathBuf>> {
        for name in STEM_NAMES {
            if !files.contains_key(name) {
                bail!("stem set for {} is missing {:?}", hash, name);
            }
        }

        let _guard = self.write_guard.lock().await;

        let staging = self
            .config
            .root
            .join(STAGING_DIR)
            .join(uuid::Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&staging).await?;

        let staged: Result<()> = async {
            for name in STEM_NAMES {
                let source = &files[name];
                tokio::fs::copy(source, Self::stem_file(&staging, name))
                    .await
                    .with_context(|| format!("staging stem {:?} from {}", name, source.display()))?;
            }
            tokio::fs::write(staging.join(MARKER_FILE), b"").await?;
            Ok(())
        }
        .await;
        if let Err(e) = staged {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(e);
        }

        let target = self.set_dir(hash);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if target.exists() {
            tokio::fs::remove_dir_all(&target).await?;
        }
        tokio::fs::rename(&staging, &target).await?;

        self.evict_locked()?;

        let mut cached = HashMap::new();
        for name in STEM_NAMES {
            cached.insert(name.to_string(), Self::stem_file(&target, name));
        }
        Ok(cached)
    }

    /// Total bytes of cached stem sets
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.walk_sets()?.iter().map(|s| s.bytes).sum())
    }

    /// Evict least-recently-used sets until under the ceiling
    pub async fn evict(&self) -> Result<usize> {
        let _guard = self.write_guard.lock().await;
        self.evict_locked()
    }

    fn evict_locked(&self) -> Result<usize> {
        let mut sets = self.walk_sets()?;
        let mut total: u64 = sets.iter().map(|s| s.bytes).sum();
        if total <= self.config.max_bytes {
            return Ok(0);
        }

        sets.sort_by_key(|s| s.last_used);
        let mut evicted = 0;
        for set in sets {
            if total <= self.config.max_bytes {
                break;
            }
            tracing::info!(
                hash = %set.hash,
                bytes = set.bytes,
                "Evicting stem set from cache"
            );
            std::fs::remove_dir_all(&set.dir)?;
            total = total.saturating_sub(set.bytes);
            evicted += 1;
        }
        Ok(evicted)
    }

    fn walk_sets(&self) -> Result<Vec<CachedSet>> {
        let mut sets = Vec::new();
        for prefix in std::fs::read_dir(&self.config.root)? {
            let prefix = prefix?;
            if !prefix.file_type()?.is_dir()
                || prefix.file_name().to_string_lossy().starts_with('.')
            {
                continue;
            }
            for entry in std::fs::read_dir(prefix.path())? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let dir = entry.path();
                let bytes = std::fs::read_dir(&dir)?
                    .filter_map(|f| f.ok())
                    .filter_map(|f| f.metadata().ok())
                    .map(|m| m.len())
                    .sum();
                let last_used = std::fs::metadata(dir.join(MARKER_FILE))
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                sets.push(CachedSet {
                    hash: entry.file_name().to_string_lossy().into_owned(),
                    dir,
                    bytes,
                    last_used,
                });
            }
        }
        Ok(sets)
    }
}

struct CachedSet {
    hash: String,
    dir: PathBuf,
    bytes: u64,
    last_used: SystemTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stem_fixture(dir: &Path, bytes: usize) -> HashMap<String, PathBuf> {
        let mut files = HashMap::new();
        for name in STEM_NAMES {
            let path = dir.join(format!("{}.wav", name));
            std::fs::write(&path, vec![0u8; bytes]).unwrap();
            files.insert(name.to_string(), path);
        }
        files
    }

    fn cache(root: &Path, max_bytes: u64) -> StemCache {
        StemCache::new(StemCacheConfig {
            root: root.to_path_buf(),
            max_bytes,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn set_then_get_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(&tmp.path().join("cache"), u64::MAX);
        let source = TempDir::new().unwrap();
        let files = stem_fixture(source.path(), 64);

        let hash = "ab".repeat(32);
        let cached = cache.set(&hash, &files).await.unwrap();
        assert_eq!(cached.len(), 4);
        for path in cached.values() {
            assert!(path.is_file());
        }

        let hit = cache.get(&hash).await.unwrap();
        assert_eq!(hit, cached);
    }

    #[tokio::test]
    async fn rejects_partial_sets() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(&tmp.path().join("cache"), u64::MAX);
        let source = TempDir::new().unwrap();
        let mut files = stem_fixture(source.path(), 16);
        files.remove("drums");

        let err = cache.set(&"cd".repeat(32), &files).await;
        assert!(err.is_err());
        assert!(!cache.contains(&"cd".repeat(32)));
    }

    #[tokio::test]
    async fn miss_on_incomplete_directory() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(&tmp.path().join("cache"), u64::MAX);
        let hash = "ef".repeat(32);

        // A torn set on disk (three files) must read as absent
        let dir = tmp.path().join("cache").join(&hash[..2]).join(&hash);
        std::fs::create_dir_all(&dir).unwrap();
        for name in &STEM_NAMES[..3] {
            std::fs::write(dir.join(format!("{}.wav", name)), b"x").unwrap();
        }

        assert!(cache.get(&hash).await.is_none());
    }

    #[tokio::test]
    async fn eviction_drops_least_recently_used_first() {
        let tmp = TempDir::new().unwrap();
        // Each set is 4 × 100 bytes; ceiling fits two sets only
        let cache = cache(&tmp.path().join("cache"), 900);
        let source = TempDir::new().unwrap();
        let files = stem_fixture(source.path(), 100);

        let old = "aa".repeat(32);
        let mid = "bb".repeat(32);
        cache.set(&old, &files).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cache.set(&mid, &files).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // Touch `old` so `mid` becomes the eviction candidate
        cache.get(&old).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let new = "cc".repeat(32);
        cache.set(&new, &files).await.unwrap();

        assert!(cache.contains(&old));
        assert!(!cache.contains(&mid));
        assert!(cache.contains(&new));
    }
}
