use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};

use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Source URL to cached file.
///
/// The directory is owned exclusively by this store: it is wiped when the
/// store opens, and a file is deleted as soon as a newer fetch of the same URL
/// is published.
pub struct CacheStore {
    dir: PathBuf,
    entries: Mutex<HashMap<String, PathBuf>>,
}

impl CacheStore {
    /// Clears whatever a previous process left behind and recreates `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        if dir.exists() {
            info!("cleaning cache directory path={}", dir.display());
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// A fresh, unpublished file name inside the cache directory.
    pub fn allocate_path(&self) -> PathBuf {
        self.dir.join(Uuid::new_v4().simple().to_string())
    }

    pub async fn lookup(&self, url: &str) -> Option<PathBuf> {
        self.entries.lock().await.get(url).cloned()
    }

    /// Maps `url` to `path`, deleting the file it previously mapped to.
    ///
    /// Returns the superseded path, if any.
    pub async fn publish(&self, url: &str, path: PathBuf) -> Option<PathBuf> {
        let mut guard = self.entries.lock().await;
        let previous = guard.insert(url.to_string(), path.clone())?;
        if previous == path {
            return None;
        }
        if let Err(err) = tokio::fs::remove_file(&previous).await
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!(
                "failed to delete superseded cache file path={} err={err}",
                previous.display()
            );
        }
        Some(previous)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
