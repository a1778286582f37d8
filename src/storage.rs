//! Pluggable persistence for cassette files.
//!
//! The default backend is append-only JSON Lines: one entry per line,
//! UTF-8, LF-terminated. Reads are streaming and tolerant: a leading BOM,
//! CRLF endings, empty lines, a truncated trailing line, and lines that
//! fail parse or validation are all skipped without failing the load.

use std::path::Path;

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::entry::CassetteEntry;
use crate::error::VcrError;

#[async_trait]
pub trait StorageBackend: std::fmt::Debug + Send + Sync {
    /// Append one encoded entry. The append must be a single atomic write.
    async fn write_entry(&self, path: &Path, entry: &CassetteEntry) -> Result<(), VcrError>;

    /// Stream-read all loadable entries in file order. A missing cassette
    /// reads as empty.
    async fn read_entries(&self, path: &Path) -> Result<Vec<CassetteEntry>, VcrError>;

    async fn delete_cassette(&self, path: &Path) -> Result<(), VcrError>;

    async fn ensure_path(&self, path: &Path) -> Result<(), VcrError>;

    async fn exists(&self, path: &Path) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct JsonlStorage;

impl JsonlStorage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StorageBackend for JsonlStorage {
    async fn write_entry(&self, path: &Path, entry: &CassetteEntry) -> Result<(), VcrError> {
        self.ensure_path(path).await?;

        let mut line = serde_json::to_string(entry)
            .map_err(|e| VcrError::EntryInvalid(format!("unencodable entry: {e}")))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| VcrError::StorageWrite {
                path: path.to_path_buf(),
                source: e,
            })?;

        file.write_all(line.as_bytes())
            .await
            .map_err(|e| VcrError::StorageWrite {
                path: path.to_path_buf(),
                source: e,
            })
    }

    async fn read_entries(&self, path: &Path) -> Result<Vec<CassetteEntry>, VcrError> {
        let file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(VcrError::StorageRead {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let mut lines = BufReader::new(file).lines();
        let mut entries = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut first_line = true;

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    return Err(VcrError::StorageRead {
                        path: path.to_path_buf(),
                        source: e,
                    })
                }
            };

            let mut line = line.trim_end_matches('\r');
            if first_line {
                line = line.strip_prefix('\u{feff}').unwrap_or(line);
                first_line = false;
            }
            if line.trim().is_empty() {
                continue;
            }

            let value = match serde_json::from_str(line) {
                Ok(value) => value,
                Err(e) => {
                    log::warn!("skipping unparseable line in {path:?}: {e}");
                    continue;
                }
            };

            let entry = match CassetteEntry::from_value(value) {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("skipping invalid entry in {path:?}: {e}");
                    continue;
                }
            };

            // (fingerprint, recorded_at) must be unique within a cassette.
            if !seen.insert((entry.req.fingerprint(), entry.recorded_at)) {
                log::warn!(
                    "skipping duplicate entry in {path:?}: {} at {}",
                    entry.req.fingerprint(),
                    entry.recorded_at
                );
                continue;
            }

            entries.push(entry);
        }

        Ok(entries)
    }

    async fn delete_cassette(&self, path: &Path) -> Result<(), VcrError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VcrError::StorageWrite {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    async fn ensure_path(&self, path: &Path) -> Result<(), VcrError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| VcrError::StorageWrite {
                        path: parent.to_path_buf(),
                        source: e,
                    })?;
            }
        }
        Ok(())
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.is_ok()
    }
}
