//! File-based cache for CVE report payloads.
//!
//! One JSON file per vendor/product pair holds the raw response body of the
//! CVE search service, so a cached entry can be parsed exactly like a fresh
//! response. Entries carry no expiry of their own; freshness is judged from
//! the file's modification time.
//!
//! # Example
//!
//! ```no_run
//! use apprelease_exporter::ReportCache;
//! use std::time::Duration;
//!
//! let cache = ReportCache::new("/var/cache/apprelease", Duration::from_secs(24 * 3600));
//!
//! cache.write("Nginx", "nginx", br#"{"results":[]}"#).unwrap();
//! assert!(cache.read_fresh("nginx", "nginx").unwrap().is_some());
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::Result;

/// A directory of report payloads with a time-to-live.
#[derive(Debug, Clone)]
pub struct ReportCache {
    dir: PathBuf,
    ttl: Duration,
}

impl ReportCache {
    /// Creates a cache rooted at `dir`. The directory is created on the
    /// first write, not here.
    ///
    /// Entries older than `ttl` are no longer returned by
    /// [`read_fresh`](Self::read_fresh) but remain available through
    /// [`read_stale`](Self::read_stale).
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    /// Directory holding the cache files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Maximum age of an entry returned by [`read_fresh`](Self::read_fresh).
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Ensures the cache directory exists.
    fn ensure_dir(&self) -> Result<()> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)?;
        }
        Ok(())
    }

    /// Path of the cache file for a vendor/product pair.
    ///
    /// The name is `cve-{vendor}_{product}.json`, lower-cased. Path
    /// separators are replaced so the file always lands inside the cache
    /// directory.
    pub fn path_for(&self, vendor: &str, product: &str) -> PathBuf {
        let name = format!("cve-{}_{}.json", vendor, product)
            .to_lowercase()
            .replace(['/', '\\'], "_");
        self.dir.join(name)
    }

    /// Returns the cached payload if it exists and is not older than the TTL.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read. A missing
    /// file is `Ok(None)`.
    pub fn read_fresh(&self, vendor: &str, product: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(vendor, product);

        let modified = match fs::metadata(&path) {
            Ok(metadata) => metadata.modified()?,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // A modification time in the future counts as fresh.
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();
        if age > self.ttl {
            return Ok(None);
        }

        self.read_stale(vendor, product)
    }

    /// Returns the cached payload regardless of its age.
    pub fn read_stale(&self, vendor: &str, product: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(vendor, product)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Stores `payload`, overwriting any previous entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be created or the file
    /// cannot be written.
    pub fn write(&self, vendor: &str, product: &str, payload: &[u8]) -> Result<()> {
        self.ensure_dir()?;
        fs::write(self.path_for(vendor, product), payload)?;
        Ok(())
    }
}
