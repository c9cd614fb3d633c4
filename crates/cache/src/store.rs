//! The on-disk content-addressed store.
//!
//! Layout: `<root>/<host-version>/<key>/{artifact, entry.json}`. Entries are
//! written to temporary names and renamed into place, so a concurrent reader
//! never observes a partial entry and the losing writer of a same-key race
//! simply reads back the winner. Integrity failures (missing artifact, bad
//! checksum, unparseable metadata) are silent misses that trigger a rebuild.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::key::CacheKey;
use crate::metadata::{checksum_file, unix_now, EntryMetadata, METADATA_FILE};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("could not determine a cache directory for this platform")]
    NoCacheRoot,
    #[error("cache io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CacheError {
    fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Error of [`CacheStore::get_or_build`]: either the build itself failed or
/// the store could not persist the result.
#[derive(Debug, Error)]
pub enum GetOrBuildError<E> {
    #[error(transparent)]
    Build(E),
    #[error(transparent)]
    Cache(CacheError),
}

/// What a build function hands back for persisting.
#[derive(Debug, Clone)]
pub struct BuiltArtifact {
    pub path: PathBuf,
    pub symbols: Vec<String>,
}

/// A validated, persisted entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub artifact_path: PathBuf,
    pub checksum: String,
    pub created_at: u64,
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// Open (and create) the store under `root`, or under the per-user cache
    /// directory when no override is given. Entries live in a subdirectory
    /// named after the host version, so incompatible layouts never mix.
    pub fn open(root: Option<&Path>) -> Result<Self, CacheError> {
        let base = match root {
            Some(path) => path.to_path_buf(),
            None => directories::BaseDirs::new()
                .ok_or(CacheError::NoCacheRoot)?
                .cache_dir()
                .join("ferrule"),
        };
        let versioned = base.join(env!("CARGO_PKG_VERSION"));
        fs::create_dir_all(&versioned).map_err(|e| CacheError::io(&versioned, e))?;
        Ok(Self { root: versioned })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    /// Validated lookup. Any integrity mismatch is a miss, never an error.
    pub fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        let dir = self.entry_dir(key);
        let metadata_path = dir.join(METADATA_FILE);
        let raw = fs::read_to_string(&metadata_path).ok()?;
        let meta: EntryMetadata = match serde_json::from_str(&raw) {
            Ok(meta) => meta,
            Err(err) => {
                debug!(key = %key.short(), error = %err, "unparseable cache metadata, treating as miss");
                return None;
            }
        };
        if meta.key != key.as_str() {
            debug!(key = %key.short(), "cache metadata key mismatch, treating as miss");
            return None;
        }
        let artifact_path = dir.join(&meta.artifact);
        match checksum_file(&artifact_path) {
            Ok(checksum) if checksum == meta.checksum => Some(CacheEntry {
                key: key.clone(),
                artifact_path,
                checksum,
                created_at: meta.created_at,
                symbols: meta.symbols,
            }),
            Ok(_) => {
                debug!(key = %key.short(), "cache artifact checksum mismatch, treating as miss");
                None
            }
            Err(err) => {
                debug!(key = %key.short(), error = %err, "cache artifact unreadable, treating as miss");
                None
            }
        }
    }

    /// Return the cached entry for `key`, or run `build_fn` and persist its
    /// artifact. Repeated calls with an unchanged key invoke the build at
    /// most once per store state.
    pub fn get_or_build<E>(
        &self,
        key: &CacheKey,
        build_fn: impl FnOnce() -> Result<BuiltArtifact, E>,
    ) -> Result<CacheEntry, GetOrBuildError<E>> {
        if let Some(entry) = self.lookup(key) {
            debug!(key = %key.short(), "cache hit");
            return Ok(entry);
        }

        debug!(key = %key.short(), "cache miss, building");
        let built = build_fn().map_err(GetOrBuildError::Build)?;
        self.persist(key, &built).map_err(GetOrBuildError::Cache)?;

        // Read back through the validated path; under a same-key race this
        // returns whichever writer won the final rename. A reader can catch
        // the winner mid-replacement (new artifact, old metadata), so retry
        // briefly before giving up.
        for _ in 0..5 {
            if let Some(entry) = self.lookup(key) {
                return Ok(entry);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Err(GetOrBuildError::Cache(CacheError::io(
            self.entry_dir(key),
            io::Error::new(io::ErrorKind::NotFound, "persisted entry failed validation"),
        )))
    }

    /// Copy the artifact and metadata into the entry directory atomically:
    /// temp names first, artifact renamed before the metadata that vouches
    /// for it.
    fn persist(&self, key: &CacheKey, built: &BuiltArtifact) -> Result<(), CacheError> {
        let dir = self.entry_dir(key);
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;

        let artifact_name = built
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string());
        // Temp names are unique per writer, so same-key racers in one
        // process never stomp each other's staging files.
        static TMP_SEQ: AtomicU64 = AtomicU64::new(0);
        let pid = process::id();
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);

        let artifact_tmp = dir.join(format!(".tmp-{pid}-{seq}-{artifact_name}"));
        let artifact_final = dir.join(&artifact_name);
        fs::copy(&built.path, &artifact_tmp).map_err(|e| CacheError::io(&artifact_tmp, e))?;
        let checksum = checksum_file(&artifact_tmp).map_err(|e| CacheError::io(&artifact_tmp, e))?;
        fs::rename(&artifact_tmp, &artifact_final).map_err(|e| CacheError::io(&artifact_final, e))?;

        let meta = EntryMetadata::new(
            key.as_str().to_string(),
            artifact_name,
            checksum,
            built.symbols.clone(),
        );
        let meta_tmp = dir.join(format!(".tmp-{pid}-{seq}-{METADATA_FILE}"));
        let meta_final = dir.join(METADATA_FILE);
        let rendered = serde_json::to_string_pretty(&meta)
            .map_err(|e| CacheError::io(&meta_tmp, io::Error::new(io::ErrorKind::InvalidData, e)))?;
        fs::write(&meta_tmp, rendered).map_err(|e| CacheError::io(&meta_tmp, e))?;
        fs::rename(&meta_tmp, &meta_final).map_err(|e| CacheError::io(&meta_final, e))?;

        Ok(())
    }

    /// Remove entries older than `max_age`. Corrupt entries count as stale.
    /// Safe to run concurrently with reads of unrelated keys.
    pub fn cleanup(&self, max_age: Duration) -> Result<usize, CacheError> {
        let cutoff = unix_now().saturating_sub(max_age.as_secs());
        let mut removed = 0;
        let read = fs::read_dir(&self.root).map_err(|e| CacheError::io(&self.root, e))?;
        for entry in read.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let stale = match fs::read_to_string(dir.join(METADATA_FILE))
                .ok()
                .and_then(|raw| serde_json::from_str::<EntryMetadata>(&raw).ok())
            {
                Some(meta) => meta.created_at < cutoff,
                None => true,
            };
            if stale {
                if let Err(err) = fs::remove_dir_all(&dir) {
                    warn!(path = %dir.display(), error = %err, "failed to remove stale cache entry");
                } else {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Remove every entry.
    pub fn clear(&self) -> Result<(), CacheError> {
        let read = fs::read_dir(&self.root).map_err(|e| CacheError::io(&self.root, e))?;
        for entry in read.flatten() {
            let dir = entry.path();
            if dir.is_dir() {
                fs::remove_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn store(dir: &tempfile::TempDir) -> CacheStore {
        CacheStore::open(Some(dir.path())).unwrap()
    }

    fn fake_artifact(dir: &Path, name: &str, bytes: &[u8]) -> BuiltArtifact {
        let path = dir.join(name);
        fs::write(&path, bytes).unwrap();
        BuiltArtifact {
            path,
            symbols: vec!["add".to_string()],
        }
    }

    #[test]
    fn test_get_or_build_invokes_build_at_most_once() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        let key = CacheKey::compute("fn add() {}", "release", &[]);
        let builds = AtomicUsize::new(0);

        let first = store
            .get_or_build::<Infallible>(&key, || {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok(fake_artifact(scratch.path(), "libunit.so", b"artifact-a"))
            })
            .unwrap();
        let second = store
            .get_or_build::<Infallible>(&key, || {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok(fake_artifact(scratch.path(), "libunit.so", b"artifact-b"))
            })
            .unwrap();

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(first.artifact_path, second.artifact_path);
        assert_eq!(first.checksum, second.checksum);
    }

    #[test]
    fn test_checksum_mismatch_is_silent_miss_and_rebuilds() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        let key = CacheKey::compute("fn f() {}", "release", &[]);

        let entry = store
            .get_or_build::<Infallible>(&key, || {
                Ok(fake_artifact(scratch.path(), "libunit.so", b"original"))
            })
            .unwrap();

        // Corrupt the artifact behind the store's back.
        fs::write(&entry.artifact_path, b"tampered").unwrap();
        assert!(store.lookup(&key).is_none());

        let rebuilds = AtomicUsize::new(0);
        let rebuilt = store
            .get_or_build::<Infallible>(&key, || {
                rebuilds.fetch_add(1, Ordering::SeqCst);
                Ok(fake_artifact(scratch.path(), "libunit.so", b"fresh"))
            })
            .unwrap();
        assert_eq!(rebuilds.load(Ordering::SeqCst), 1);
        assert_eq!(rebuilt.checksum, checksum_file(&rebuilt.artifact_path).unwrap());
    }

    #[test]
    fn test_entries_shared_across_store_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let key = CacheKey::compute("fn g() {}", "release", &[]);

        let first = store(&tmp);
        first
            .get_or_build::<Infallible>(&key, || {
                Ok(fake_artifact(scratch.path(), "libunit.so", b"bytes"))
            })
            .unwrap();

        // A second process run over the same root sees the entry.
        let second = CacheStore::open(Some(tmp.path())).unwrap();
        assert!(second.lookup(&key).is_some());
    }

    #[test]
    fn test_cleanup_removes_only_stale_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let store = store(&tmp);

        let fresh_key = CacheKey::compute("fn fresh() {}", "release", &[]);
        store
            .get_or_build::<Infallible>(&fresh_key, || {
                Ok(fake_artifact(scratch.path(), "libfresh.so", b"fresh"))
            })
            .unwrap();

        let stale_key = CacheKey::compute("fn stale() {}", "release", &[]);
        store
            .get_or_build::<Infallible>(&stale_key, || {
                Ok(fake_artifact(scratch.path(), "libstale.so", b"stale"))
            })
            .unwrap();

        // Age the stale entry by rewriting its metadata.
        let stale_meta_path = store.entry_dir(&stale_key).join(METADATA_FILE);
        let mut meta: EntryMetadata =
            serde_json::from_str(&fs::read_to_string(&stale_meta_path).unwrap()).unwrap();
        meta.created_at = 1;
        fs::write(&stale_meta_path, serde_json::to_string(&meta).unwrap()).unwrap();

        let removed = store.cleanup(Duration::from_secs(3600)).unwrap();
        assert_eq!(removed, 1);
        assert!(store.lookup(&fresh_key).is_some());
        assert!(store.lookup(&stale_key).is_none());
    }

    #[test]
    fn test_clear_removes_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        let key = CacheKey::compute("fn h() {}", "release", &[]);
        store
            .get_or_build::<Infallible>(&key, || {
                Ok(fake_artifact(scratch.path(), "libunit.so", b"bytes"))
            })
            .unwrap();

        store.clear().unwrap();
        assert!(store.lookup(&key).is_none());
    }

    #[test]
    fn test_concurrent_same_key_writers_converge() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(store(&tmp));
        let key = CacheKey::compute("fn race() {}", "release", &[]);

        let mut handles = Vec::new();
        for i in 0..4 {
            let store = Arc::clone(&store);
            let key = key.clone();
            handles.push(std::thread::spawn(move || {
                let scratch = tempfile::tempdir().unwrap();
                let payload = format!("artifact-{i}");
                store
                    .get_or_build::<Infallible>(&key, || {
                        Ok(fake_artifact(scratch.path(), "libunit.so", payload.as_bytes()))
                    })
                    .unwrap()
            }));
        }
        let entries: Vec<CacheEntry> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // Everyone ends up with a validated entry for the same path, and the
        // store agrees with the final state.
        let final_entry = store.lookup(&key).unwrap();
        for entry in entries {
            assert_eq!(entry.artifact_path, final_entry.artifact_path);
        }
    }
}
