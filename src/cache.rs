use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::downloads::{MediaKind, OutputFormat};
use crate::error::{AppError, Result};

/// On-disk artifact store keyed by request fingerprint.
///
/// Producers write to a `.part` staging path and rename into place on
/// success, so a fingerprint's final file is only ever visible once it is
/// complete. Readers never open staging files.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
    retention: Duration,
}

impl CacheStore {
    /// Creates the store, making sure the cache directory exists first.
    pub fn new(dir: PathBuf, retention: Duration) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, retention })
    }

    /// Derive the cache fingerprint for a normalized request.
    ///
    /// The source URL is hashed rather than embedded: raw URLs contain path
    /// separators and percent signs that would corrupt the cache namespace.
    pub fn key_for(
        url: &str,
        kind: MediaKind,
        quality: Option<&str>,
        format: OutputFormat,
    ) -> String {
        let digest = Sha256::digest(url.as_bytes());
        let mut hash = String::with_capacity(32);
        for byte in &digest[..16] {
            let _ = write!(hash, "{:02x}", byte);
        }
        format!(
            "{}-{}-{}-{}",
            hash,
            kind.as_str(),
            quality.unwrap_or("na"),
            format.ext()
        )
    }

    pub fn path_for(&self, key: &str, format: OutputFormat) -> PathBuf {
        self.dir.join(format!("{}.{}", key, format.ext()))
    }

    pub fn staging_path_for(&self, key: &str, format: OutputFormat) -> PathBuf {
        self.dir.join(format!("{}.{}.part", key, format.ext()))
    }

    /// True only when a completed artifact exists for this fingerprint.
    pub fn has(&self, key: &str, format: OutputFormat) -> bool {
        self.path_for(key, format).is_file()
    }

    /// Promote a finished staging file to its final, servable path.
    pub fn commit(&self, key: &str, format: OutputFormat) -> Result<PathBuf> {
        let staging = self.staging_path_for(key, format);
        let target = self.path_for(key, format);
        if !staging.is_file() {
            return Err(AppError::ExtractionFailed(
                "no output file was produced".to_string(),
            ));
        }
        fs::rename(&staging, &target)?;
        debug!("[cache] committed {}", target.display());
        Ok(target)
    }

    /// Best-effort removal of a half-written staging file after a failure.
    pub fn discard_partial(&self, key: &str, format: OutputFormat) {
        let staging = self.staging_path_for(key, format);
        if staging.exists() {
            if let Err(e) = fs::remove_file(&staging) {
                warn!(
                    "[cache] failed to remove partial {}: {}",
                    staging.display(),
                    e
                );
            }
        }
    }

    /// Delete every cache file whose mtime is older than the retention
    /// window. Individual stat/unlink errors are logged and skipped; the
    /// sweep itself never fails. Returns the number of files removed.
    pub fn evict_expired(&self) -> usize {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("[cache] sweep could not read {}: {}", self.dir.display(), e);
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("[cache] sweep skipping unreadable entry: {}", e);
                    continue;
                }
            };
            let path = entry.path();
            let metadata = match entry.metadata() {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(e) => {
                    warn!("[cache] sweep could not stat {}: {}", path.display(), e);
                    continue;
                }
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok())
                .unwrap_or_default();
            if age > self.retention {
                match fs::remove_file(&path) {
                    Ok(()) => {
                        debug!("[cache] evicted {}", path.display());
                        removed += 1;
                    }
                    Err(e) => {
                        warn!("[cache] failed to evict {}: {}", path.display(), e);
                    }
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(retention: Duration) -> (tempfile::TempDir, CacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().to_path_buf(), retention).unwrap();
        (dir, store)
    }

    #[test]
    fn key_is_deterministic() {
        let a = CacheStore::key_for("https://x/y", MediaKind::Audio, None, OutputFormat::Mp3);
        let b = CacheStore::key_for("https://x/y", MediaKind::Audio, None, OutputFormat::Mp3);
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_requests_get_distinct_keys() {
        let base = CacheStore::key_for(
            "https://x/y",
            MediaKind::Video,
            Some("1080"),
            OutputFormat::Mp4,
        );
        let other_url = CacheStore::key_for(
            "https://x/z",
            MediaKind::Video,
            Some("1080"),
            OutputFormat::Mp4,
        );
        let other_quality = CacheStore::key_for(
            "https://x/y",
            MediaKind::Video,
            Some("720"),
            OutputFormat::Mp4,
        );
        let other_format = CacheStore::key_for(
            "https://x/y",
            MediaKind::Video,
            Some("1080"),
            OutputFormat::Mp3,
        );
        assert_ne!(base, other_url);
        assert_ne!(base, other_quality);
        assert_ne!(base, other_format);
    }

    #[test]
    fn key_is_filesystem_safe() {
        let key = CacheStore::key_for(
            "https://example.com/a/b?c=d&e=%2F../..",
            MediaKind::Both,
            None,
            OutputFormat::Mp4,
        );
        assert!(!key.contains('/'));
        assert!(!key.contains('%'));
        assert!(!key.contains('?'));
    }

    #[test]
    fn has_is_false_until_commit() {
        let (_dir, store) = store(Duration::from_secs(60));
        let key = CacheStore::key_for("https://x/y", MediaKind::Audio, None, OutputFormat::Mp3);

        assert!(!store.has(&key, OutputFormat::Mp3));

        // A staging file still being written must not count as a hit.
        fs::write(store.staging_path_for(&key, OutputFormat::Mp3), b"partial").unwrap();
        assert!(!store.has(&key, OutputFormat::Mp3));

        let path = store.commit(&key, OutputFormat::Mp3).unwrap();
        assert!(store.has(&key, OutputFormat::Mp3));
        assert_eq!(fs::read(path).unwrap(), b"partial");
    }

    #[test]
    fn commit_without_staging_file_fails() {
        let (_dir, store) = store(Duration::from_secs(60));
        let err = store.commit("missing", OutputFormat::Mp4).unwrap_err();
        assert!(matches!(err, AppError::ExtractionFailed(_)));
    }

    #[test]
    fn discard_partial_removes_staging() {
        let (_dir, store) = store(Duration::from_secs(60));
        let staging = store.staging_path_for("k", OutputFormat::Wav);
        fs::write(&staging, b"junk").unwrap();
        store.discard_partial("k", OutputFormat::Wav);
        assert!(!staging.exists());
    }

    #[test]
    fn sweep_removes_expired_and_keeps_fresh() {
        let (_dir, store) = store(Duration::ZERO);
        let old = store.path_for("old", OutputFormat::Mp3);
        fs::write(&old, b"stale").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(store.evict_expired(), 1);
        assert!(!old.exists());

        let (_dir, store) = self::store(Duration::from_secs(60 * 60));
        let fresh = store.path_for("fresh", OutputFormat::Mp3);
        fs::write(&fresh, b"new").unwrap();
        assert_eq!(store.evict_expired(), 0);
        assert!(fresh.exists());
    }

    #[test]
    fn sweep_also_collects_stale_partials() {
        let (_dir, store) = store(Duration::ZERO);
        let staging = store.staging_path_for("orphan", OutputFormat::Mp4);
        fs::write(&staging, b"abandoned").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(store.evict_expired(), 1);
        assert!(!staging.exists());
    }
}
