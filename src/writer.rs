//! The process-wide async writer: single authority for pending cassette
//! batches, per-path flush timers, timestamp ordering, and the `all`-mode
//! atomic replace.
//!
//! Entries are ordered by `recorded_at` alone; submission order across
//! tasks is irrelevant. `flush` is a barrier: once it returns, every entry
//! enqueued before the call is on disk (or logged as dropped).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::entry::CassetteEntry;
use crate::error::VcrError;
use crate::storage::StorageBackend;

#[derive(Debug, Default)]
struct WriterState {
    pending: HashMap<PathBuf, Vec<CassetteEntry>>,
    /// `all`-mode accumulations. Kept apart from `pending` so that `flush`
    /// never appends them to the cassette `replace_all` will delete.
    staged: HashMap<PathBuf, Vec<CassetteEntry>>,
    timers: HashMap<PathBuf, JoinHandle<()>>,
}

#[derive(Debug, Clone)]
pub struct CassetteWriter {
    inner: Arc<WriterInner>,
}

#[derive(Debug)]
struct WriterInner {
    storage: Arc<dyn StorageBackend>,
    batch_size: usize,
    batch_timeout: Duration,
    state: Mutex<WriterState>,
}

impl CassetteWriter {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        batch_size: usize,
        batch_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(WriterInner {
                storage,
                batch_size,
                batch_timeout,
                state: Mutex::new(WriterState::default()),
            }),
        }
    }

    /// Enqueue an entry for `path`. Cheap unless this entry completes a
    /// batch, in which case the batch is flushed before returning.
    pub async fn write_entry(&self, path: &Path, entry: CassetteEntry) {
        let batch_full = {
            let mut state = self.inner.state.lock().await;
            let pending = state.pending.entry(path.to_path_buf()).or_default();
            pending.push(entry);
            pending.len() >= self.inner.batch_size
        };

        if batch_full {
            self.flush(path).await;
        } else {
            self.arm_timer(path).await;
        }
    }

    /// Enqueue without arming any flush trigger. `all` mode stages its
    /// entries this way: a mid-frame flush would append to the cassette
    /// that `replace_all` is about to delete.
    pub async fn stage_entry(&self, path: &Path, entry: CassetteEntry) {
        let mut state = self.inner.state.lock().await;
        state
            .staged
            .entry(path.to_path_buf())
            .or_default()
            .push(entry);
    }

    async fn arm_timer(&self, path: &Path) {
        let mut state = self.inner.state.lock().await;
        if let Some(previous) = state.timers.remove(path) {
            previous.abort();
        }

        let writer = self.clone();
        let timer_path = path.to_path_buf();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(writer.inner.batch_timeout).await;
            writer.flush(&timer_path).await;
        });
        state.timers.insert(path.to_path_buf(), handle);
    }

    /// Drain everything pending for `path` to storage, sorted by
    /// `recorded_at`. Individual write failures are logged and skipped;
    /// the writer never dies on an I/O error.
    pub async fn flush(&self, path: &Path) {
        // The timer handle is dropped rather than aborted: flush may be
        // running on the timer task itself, and a drained queue makes a
        // late spurious flush a no-op anyway.
        let mut state = self.inner.state.lock().await;
        state.timers.remove(path);

        let mut batch = match state.pending.remove(path) {
            Some(batch) if !batch.is_empty() => batch,
            _ => return,
        };
        batch.sort_by_key(|entry| entry.recorded_at);

        for entry in &batch {
            if let Err(e) = self.inner.storage.write_entry(path, entry).await {
                log::warn!("failed to persist entry for {path:?}: {e}");
            }
        }
    }

    pub async fn flush_all(&self) {
        let paths: Vec<PathBuf> = {
            let state = self.inner.state.lock().await;
            state.pending.keys().cloned().collect()
        };
        for path in paths {
            self.flush(&path).await;
        }
    }

    /// The `all`-mode commit: atomically replace the cassette at `path`
    /// with the staged entries, sorted by `recorded_at`. Empty pending is
    /// a successful no-op; a frame that recorded nothing must never
    /// destroy an existing cassette.
    pub async fn replace_all(&self, path: &Path) -> Result<(), VcrError> {
        let mut state = self.inner.state.lock().await;
        state.timers.remove(path);

        let mut batch = state.staged.remove(path).unwrap_or_default();
        batch.extend(state.pending.remove(path).unwrap_or_default());
        if batch.is_empty() {
            return Ok(());
        }
        batch.sort_by_key(|entry| entry.recorded_at);

        self.inner.storage.delete_cassette(path).await?;
        self.inner.storage.ensure_path(path).await?;
        for entry in &batch {
            self.inner.storage.write_entry(path, entry).await?;
        }
        Ok(())
    }

    /// Flush every path and cancel outstanding timers. Called at frame
    /// teardown.
    pub async fn shutdown(&self) {
        self.flush_all().await;
        let mut state = self.inner.state.lock().await;
        for (_, timer) in state.timers.drain() {
            timer.abort();
        }
    }

    /// Number of entries not yet persisted for `path`; used by tests and
    /// diagnostics.
    pub async fn pending_len(&self, path: &Path) -> usize {
        let state = self.inner.state.lock().await;
        state.pending.get(path).map_or(0, Vec::len)
            + state.staged.get(path).map_or(0, Vec::len)
    }
}
