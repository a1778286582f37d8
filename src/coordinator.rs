//! Per-cassette authority for accumulated entries and the replay cursor.
//!
//! Every recorder and replayer sharing a cassette path goes through the
//! same coordinator, so concurrently spawned test tasks can append and
//! read without external locking. State lives only in memory; persistence
//! is the writer's job.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use tokio::sync::Mutex;

use crate::entry::CassetteEntry;
use crate::object_store::sha256_hex;

/// Stable identifier for a cassette path. Registry keys are hashed so a
/// long-running process never accumulates unbounded path-shaped names.
pub fn coordinator_key(path: &Path) -> String {
    let digest = sha256_hex(path.to_string_lossy().as_bytes());
    digest[..16].to_string()
}

#[derive(Debug, Default)]
struct CoordinatorState {
    entries: Vec<CassetteEntry>,
    cursor: usize,
}

#[derive(Debug, Default)]
pub struct CassetteCoordinator {
    state: Mutex<CoordinatorState>,
}

impl CassetteCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the accumulated entries wholesale (initial cassette load).
    /// Resets the cursor.
    pub async fn load(&self, entries: Vec<CassetteEntry>) {
        let mut state = self.state.lock().await;
        state.entries = entries;
        state.cursor = 0;
    }

    /// Snapshot of the accumulated entries.
    pub async fn entries(&self) -> Vec<CassetteEntry> {
        self.state.lock().await.entries.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    /// In-memory append; no I/O happens here.
    pub async fn append(&self, entry: CassetteEntry) {
        self.state.lock().await.entries.push(entry);
    }

    pub async fn cursor(&self) -> usize {
        self.state.lock().await.cursor
    }

    pub async fn advance_cursor(&self) -> usize {
        let mut state = self.state.lock().await;
        state.cursor += 1;
        state.cursor
    }

    pub async fn reset_cursor(&self) {
        self.state.lock().await.cursor = 0;
    }

    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.entries.clear();
        state.cursor = 0;
    }
}

/// Process-wide coordinator table keyed by [`coordinator_key`].
#[derive(Debug, Default)]
pub struct CoordinatorRegistry {
    coordinators: Mutex<HashMap<String, Arc<CassetteCoordinator>>>,
}

impl CoordinatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The coordinator for `path`, creating it on first access.
    pub async fn get_or_create(&self, path: &Path) -> Arc<CassetteCoordinator> {
        let key = coordinator_key(path);
        let mut coordinators = self.coordinators.lock().await;
        coordinators
            .entry(key)
            .or_insert_with(|| Arc::new(CassetteCoordinator::new()))
            .clone()
    }

    /// Drop the coordinator for `path`. Outstanding `Arc` handles stay
    /// usable but the next `get_or_create` starts fresh.
    pub async fn dispose(&self, path: &Path) {
        let key = coordinator_key(path);
        self.coordinators.lock().await.remove(&key);
    }
}

static GLOBAL_REGISTRY: Lazy<CoordinatorRegistry> = Lazy::new(CoordinatorRegistry::new);

/// The registry shared by every client in this process.
pub fn global_registry() -> &'static CoordinatorRegistry {
    &GLOBAL_REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    use crate::entry::{RecordedRequest, RecordedResponse};

    fn entry(recorded_at: u64) -> CassetteEntry {
        let req =
            RecordedRequest::new("GET", "https://api.example.com/x", StdHashMap::new(), b"")
                .unwrap();
        let (resp, _) = RecordedResponse::new(
            200,
            StdHashMap::new(),
            b"ok".to_vec(),
            Some("text/plain"),
            1000,
            recorded_at,
        )
        .unwrap();
        CassetteEntry::new(req, resp, recorded_at).unwrap()
    }

    #[tokio::test]
    async fn append_and_cursor_are_serialized() {
        let coordinator = Arc::new(CassetteCoordinator::new());

        let mut handles = Vec::new();
        for i in 1..=10u64 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator.append(entry(i)).await;
                coordinator.advance_cursor().await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(coordinator.len().await, 10);
        assert_eq!(coordinator.cursor().await, 10);

        coordinator.clear().await;
        assert!(coordinator.is_empty().await);
        assert_eq!(coordinator.cursor().await, 0);
    }

    #[tokio::test]
    async fn registry_returns_same_coordinator_per_path() {
        let registry = CoordinatorRegistry::new();
        let a = registry.get_or_create(Path::new("cassettes/a.jsonl")).await;
        let b = registry.get_or_create(Path::new("cassettes/a.jsonl")).await;
        let other = registry.get_or_create(Path::new("cassettes/b.jsonl")).await;

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));

        registry.dispose(Path::new("cassettes/a.jsonl")).await;
        let fresh = registry.get_or_create(Path::new("cassettes/a.jsonl")).await;
        assert!(!Arc::ptr_eq(&a, &fresh));
    }

    #[test]
    fn keys_are_stable_and_bounded() {
        let key = coordinator_key(Path::new("cassettes/a.jsonl"));
        assert_eq!(key, coordinator_key(Path::new("cassettes/a.jsonl")));
        assert_eq!(key.len(), 16);
    }
}
