//! Content-addressed storage for response bodies too large (or too
//! stream-shaped) to inline in a cassette.
//!
//! Objects live at `<root>/<hh>/<sha256-hex>` where `hh` is the first two
//! hex characters of the hash; stream chunk files live under a sibling
//! `streams/` directory as line-delimited JSON. Objects are immutable and
//! shared across cassettes; nothing here garbage-collects them.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::VcrError;

/// SHA-256 of `bytes` as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// One recorded chunk of a streamed body: when it arrived (microseconds
/// since epoch) and its raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub timestamp: u64,
    pub data: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct WireChunk {
    timestamp: u64,
    data: String,
}

#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, hash: &str) -> PathBuf {
        let shard = &hash[..hash.len().min(2)];
        self.root.join(shard).join(hash)
    }

    fn stream_path(&self, hash: &str) -> PathBuf {
        self.root.join("streams").join(format!("{hash}.json"))
    }

    /// Store an opaque object. Idempotent: the hash addresses the content,
    /// so an existing file is already the right bytes.
    pub async fn put(&self, hash: &str, bytes: &[u8]) -> Result<(), VcrError> {
        let path = self.object_path(hash);
        if tokio::fs::metadata(&path).await.is_ok() {
            return Ok(());
        }
        write_atomic(&path, bytes).await
    }

    pub async fn get(&self, hash: &str) -> Result<Vec<u8>, VcrError> {
        let path = self.object_path(hash);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(VcrError::ObjectNotFound {
                hash: hash.to_string(),
            }),
            Err(e) => Err(VcrError::StorageRead { path, source: e }),
        }
    }

    /// Store a streamed body as one encoded chunk per line.
    pub async fn put_stream(&self, hash: &str, chunks: &[StreamChunk]) -> Result<(), VcrError> {
        let path = self.stream_path(hash);
        if tokio::fs::metadata(&path).await.is_ok() {
            return Ok(());
        }

        let mut encoded = String::new();
        for chunk in chunks {
            let wire = WireChunk {
                timestamp: chunk.timestamp,
                data: general_purpose::STANDARD.encode(&chunk.data),
            };
            let line = serde_json::to_string(&wire)
                .map_err(|e| VcrError::EntryInvalid(format!("unencodable stream chunk: {e}")))?;
            encoded.push_str(&line);
            encoded.push('\n');
        }

        write_atomic(&path, encoded.as_bytes()).await
    }

    pub async fn get_stream(&self, hash: &str) -> Result<Vec<StreamChunk>, VcrError> {
        let path = self.stream_path(hash);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VcrError::ObjectNotFound {
                    hash: hash.to_string(),
                })
            }
            Err(e) => return Err(VcrError::StorageRead { path, source: e }),
        };

        let mut chunks = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let wire: WireChunk = serde_json::from_str(line)
                .map_err(|e| VcrError::EntryInvalid(format!("bad stream chunk line: {e}")))?;
            let data = general_purpose::STANDARD
                .decode(wire.data.as_bytes())
                .map_err(|e| VcrError::EntryInvalid(format!("bad stream chunk base64: {e}")))?;
            chunks.push(StreamChunk {
                timestamp: wire.timestamp,
                data,
            });
        }

        Ok(chunks)
    }

    /// Idempotent delete: an absent object is already deleted.
    pub async fn delete(&self, hash: &str) -> Result<(), VcrError> {
        for path in [self.object_path(hash), self.stream_path(hash)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(VcrError::StorageWrite { path, source: e }),
            }
        }
        Ok(())
    }

    pub async fn contains(&self, hash: &str) -> bool {
        tokio::fs::metadata(self.object_path(hash)).await.is_ok()
            || tokio::fs::metadata(self.stream_path(hash)).await.is_ok()
    }

    /// All hashes present in the store, opaque objects and streams alike.
    pub async fn list(&self) -> Result<HashSet<String>, VcrError> {
        let mut hashes = HashSet::new();

        let mut root_entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(hashes),
            Err(e) => {
                return Err(VcrError::StorageRead {
                    path: self.root.clone(),
                    source: e,
                })
            }
        };

        while let Some(shard) = root_entries.next_entry().await.map_err(|e| {
            VcrError::StorageRead {
                path: self.root.clone(),
                source: e,
            }
        })? {
            let shard_path = shard.path();
            if !shard_path.is_dir() {
                continue;
            }
            let is_streams = shard.file_name() == "streams";

            let mut files = tokio::fs::read_dir(&shard_path)
                .await
                .map_err(|e| VcrError::StorageRead {
                    path: shard_path.clone(),
                    source: e,
                })?;
            while let Some(file) = files.next_entry().await.map_err(|e| VcrError::StorageRead {
                path: shard_path.clone(),
                source: e,
            })? {
                let name = file.file_name().to_string_lossy().into_owned();
                let hash = if is_streams {
                    match name.strip_suffix(".json") {
                        Some(hash) => hash.to_string(),
                        None => continue,
                    }
                } else {
                    name
                };
                hashes.insert(hash);
            }
        }

        Ok(hashes)
    }
}

/// Write through a temp file and rename so concurrent puts of the same
/// hash can never expose a partial object.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), VcrError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| VcrError::StorageWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
    }

    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| VcrError::StorageWrite {
            path: tmp.clone(),
            source: e,
        })?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| VcrError::StorageWrite {
            path: path.to_path_buf(),
            source: e,
        })
}
