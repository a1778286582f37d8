use std::path::PathBuf;

use http_client::Error as HttpError;
use thiserror::Error;

/// Errors surfaced by the recorder core.
///
/// Load-side corruption is deliberately not represented here: malformed
/// cassette lines are logged and skipped so a stale cassette never takes
/// down a test run.
#[derive(Debug, Error)]
pub enum VcrError {
    /// No recorded entry matched the live request in a replay-only mode.
    #[error(
        "no matching entry in cassette {cassette_path:?} for {method} {url} (body_hash {body_hash})"
    )]
    CassetteMiss {
        method: String,
        url: String,
        body_hash: String,
        cassette_path: PathBuf,
    },

    /// The live HTTP call failed while recording. Nothing was written.
    #[error("live request failed: {0}")]
    Network(String),

    /// A request reached an inner client that forbids network traffic.
    #[error("live traffic disabled for this frame: {method} {url}")]
    LiveDisabled { method: String, url: String },

    /// Entry construction or validation failed.
    #[error("invalid cassette entry: {0}")]
    EntryInvalid(String),

    #[error("failed to write {path:?}: {source}")]
    StorageWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {path:?}: {source}")]
    StorageRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An entry references an external body the object store does not hold.
    #[error("external body {hash} missing from object store")]
    ObjectNotFound { hash: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl VcrError {
    fn http_status(&self) -> u16 {
        match self {
            VcrError::CassetteMiss { .. } | VcrError::ObjectNotFound { .. } => 404,
            VcrError::Network(_) => 502,
            _ => 500,
        }
    }

    /// Convert onto the `HttpClient` boundary with a status that reflects
    /// the failure class. Deliberately not a `From` impl: `http_types`
    /// already blanket-converts any `std::error::Error` at status 500.
    pub fn into_http(self) -> HttpError {
        HttpError::from_str(self.http_status(), self.to_string())
    }
}
