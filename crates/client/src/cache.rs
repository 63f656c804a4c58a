//! On-disk layout and freshness rules for the HTTP response cache.

use anyhow::{anyhow, Context, Result};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::source_url::SourceUrl;

const CACHE_DIR_NAME: &str = "v3-cache";
const STAGING_SUFFIX: &str = "-new";

/// The on-disk HTTP response cache shared by all sources.
///
/// Entries live at `{root}/v3-cache/{hash(base_uri)}/{sanitized_key}.dat`;
/// the directory is shared across resolver instances and across processes,
/// with the per-entry file lock as the sole serialization mechanism.
#[derive(Debug, Clone)]
pub struct HttpCache {
    root: PathBuf,
}

impl HttpCache {
    /// Creates a cache rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into().join(CACHE_DIR_NAME),
        }
    }

    /// Returns the default cache root under the platform cache directory.
    pub fn default_root() -> Result<PathBuf> {
        dirs::cache_dir()
            .map(|p| p.join("pakfeed"))
            .ok_or_else(|| anyhow!("failed to determine operating system cache directory"))
    }

    /// Computes the entry paths for a `(source, cache key)` pair.
    pub fn entry(&self, source: &SourceUrl, cache_key: &str) -> CacheEntry {
        let current = self
            .root
            .join(source.cache_label())
            .join(format!("{}.dat", sanitize_key(cache_key)));
        let staging = staging_path(&current);
        CacheEntry { current, staging }
    }

    /// Returns the directory holding transient (zero-TTL) downloads.
    ///
    /// The directory is created on first use.
    pub fn temp_dir(&self) -> Result<PathBuf> {
        let dir = self.root.join("temp");
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create directory `{path}`", path = dir.display()))?;
        Ok(dir)
    }
}

/// The pair of files backing one cache entry.
///
/// At any instant at most one current and one staging file exist per entry;
/// a reader never observes a partially written current file.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The installed cache file served to readers.
    pub current: PathBuf,
    /// The staging file a fresh response is written to before the swap.
    pub staging: PathBuf,
}

fn staging_path(current: &Path) -> PathBuf {
    let mut os = current.as_os_str().to_os_string();
    os.push(STAGING_SUFFIX);
    PathBuf::from(os)
}

/// Strips characters invalid in file names from a cache key and collapses
/// runs of the replacement character.
pub fn sanitize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut last_was_underscore = false;
    for ch in key.chars() {
        let ch = match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        };
        if ch == '_' && last_was_underscore {
            continue;
        }
        last_was_underscore = ch == '_';
        out.push(ch);
    }
    out
}

/// Opens the current cache file if it exists and is younger than `ttl`.
///
/// The entry's parent directory is created as a side effect so a subsequent
/// download has somewhere to stage its response.
pub fn read_fresh(current: &Path, ttl: Duration) -> Result<Option<File>> {
    if let Some(parent) = current.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create directory `{path}`", path = parent.display())
        })?;
    }

    let metadata = match fs::metadata(current) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(anyhow::Error::from(e)
                .context(format!("failed to stat `{path}`", path = current.display())))
        }
    };

    let age = metadata
        .modified()
        .with_context(|| format!("failed to read mtime of `{path}`", path = current.display()))?
        .elapsed()
        .unwrap_or(Duration::MAX);

    if age >= ttl {
        return Ok(None);
    }

    let file = File::open(current)
        .with_context(|| format!("failed to open `{path}`", path = current.display()))?;
    Ok(Some(file))
}

/// Installs a fully written staging file as the current cache file and opens
/// the result for reading.
///
/// Must be called under the entry's file lock. A current file that is open
/// elsewhere is never deleted; in that case another process has just
/// refreshed the entry and its copy is served instead, with the staging file
/// discarded.
pub fn promote_staging(entry: &CacheEntry) -> Result<File> {
    if entry.current.exists() && !is_file_open_elsewhere(&entry.current) {
        fs::remove_file(&entry.current).with_context(|| {
            format!("failed to remove `{path}`", path = entry.current.display())
        })?;
    }

    if entry.current.exists() {
        let _ = fs::remove_file(&entry.staging);
    } else {
        fs::rename(&entry.staging, &entry.current).with_context(|| {
            format!(
                "failed to install cache file `{path}`",
                path = entry.current.display()
            )
        })?;
    }

    File::open(&entry.current).with_context(|| {
        format!("failed to open `{path}`", path = entry.current.display())
    })
}

#[cfg(windows)]
fn is_file_open_elsewhere(path: &Path) -> bool {
    use std::fs::OpenOptions;
    use std::os::windows::fs::OpenOptionsExt;

    // A share-nothing open succeeds only if no other handle exists; deleting
    // a file another process holds open would break its reader.
    OpenOptions::new()
        .read(true)
        .write(true)
        .share_mode(0)
        .open(path)
        .is_err()
}

#[cfg(not(windows))]
fn is_file_open_elsewhere(_path: &Path) -> bool {
    // POSIX renames replace the entry atomically and existing readers keep
    // their handle to the old inode, so the probe is unnecessary.
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn sanitize_strips_and_collapses() {
        assert_eq!(sanitize_key("list_xunit"), "list_xunit");
        assert_eq!(sanitize_key("list_a/b:c"), "list_a_b_c");
        assert_eq!(sanitize_key("a??b"), "a_b");
        assert_eq!(sanitize_key("nupkg_newtonsoft.json.12.0.3"), "nupkg_newtonsoft.json.12.0.3");
    }

    #[test]
    fn entry_paths_have_expected_shape() {
        let cache = HttpCache::new("/tmp/example-root");
        let source = SourceUrl::new("https://feed.example.com/v3/base").unwrap();
        let entry = cache.entry(&source, "list_xunit");

        let current = entry.current.to_string_lossy().into_owned();
        assert!(current.starts_with("/tmp/example-root/v3-cache/"));
        assert!(current.ends_with("/list_xunit.dat"));
        assert_eq!(
            entry.staging.to_string_lossy(),
            format!("{current}-new")
        );
    }

    #[test]
    fn read_fresh_honors_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let current = dir.path().join("entry.dat");

        assert!(read_fresh(&current, Duration::from_secs(60)).unwrap().is_none());

        File::create(&current)
            .unwrap()
            .write_all(b"cached")
            .unwrap();

        let mut fresh = read_fresh(&current, Duration::from_secs(60))
            .unwrap()
            .expect("young entry should be fresh");
        let mut contents = String::new();
        fresh.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "cached");

        // A zero TTL treats even a brand-new entry as stale.
        assert!(read_fresh(&current, Duration::ZERO).unwrap().is_none());
    }

    #[test]
    fn promote_replaces_current() {
        let dir = tempfile::tempdir().unwrap();
        let entry = CacheEntry {
            current: dir.path().join("entry.dat"),
            staging: dir.path().join("entry.dat-new"),
        };

        File::create(&entry.current)
            .unwrap()
            .write_all(b"old")
            .unwrap();
        File::create(&entry.staging)
            .unwrap()
            .write_all(b"new")
            .unwrap();

        let mut installed = promote_staging(&entry).unwrap();
        let mut contents = String::new();
        installed.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "new");
        assert!(!entry.staging.exists());
    }
}
