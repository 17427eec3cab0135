use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CrawlerError, Result};
use crate::scrapers::AggregateRun;

/// Where the latest run is kept between invocations.
///
/// Only the most recent run is retained. `load` treats a missing or
/// unreadable file the same way: there is no prior run.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn save(&self, run: &AggregateRun) -> Result<()>;
    async fn load(&self) -> Option<AggregateRun>;
}

/// Latest run as one pretty-printed JSON document
#[derive(Debug, Clone)]
pub struct JsonResultStore {
    path: PathBuf,
}

impl JsonResultStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ResultStore for JsonResultStore {
    async fn save(&self, run: &AggregateRun) -> Result<()> {
        let json = serde_json::to_vec_pretty(run)
            .map_err(|e| CrawlerError::Storage(format!("Failed to serialize run {}: {}", run.id, e)))?;
        write_atomically(&self.path, &json)?;
        info!(
            "Saved run {} ({} listing(s)) to {}",
            run.id,
            run.total_listings(),
            self.path.display()
        );
        Ok(())
    }

    async fn load(&self) -> Option<AggregateRun> {
        read_json(&self.path)
    }
}

/// Replaces `path` with `contents` so that a reader sees either the old file
/// or the new one, never a torn write. The temp file lives next to the target
/// so the final rename stays on one filesystem.
pub fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)
        .map_err(|e| CrawlerError::Storage(format!("Failed to create directory {}: {}", dir.display(), e)))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| CrawlerError::Storage(format!("Not a file path: {}", path.display())))?;
    let tmp_path = dir.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let written = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(CrawlerError::Storage(format!("Failed to write {}: {}", path.display(), e)));
    }

    debug!("Wrote {} bytes to {}", contents.len(), path.display());
    Ok(())
}

/// Reads a JSON document, or `None` if it is missing or does not parse.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("No file at {}", path.display());
            return None;
        }
        Err(e) => {
            warn!("Could not read {}: {}", path.display(), e);
            return None;
        }
    };

    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring unreadable {}: {}", path.display(), e);
            None
        }
    }
}

/// Serializes `value` as pretty JSON and writes it with `write_atomically`.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| CrawlerError::Storage(format!("Failed to serialize {}: {}", path.display(), e)))?;
    write_atomically(path, &json)
}
