//! Typed access to every recorder tunable, validated at boot.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::VcrError;
use crate::naming::PathBuilder;
use crate::redact::CustomRedactor;
use crate::RecordMode;

/// The single environment variable that selects the record mode:
/// `once | new_episodes | all | none`. Unset means `none`.
pub const MODE_ENV_VAR: &str = "REQORD_MODE";

#[derive(Clone)]
pub struct VcrConfig {
    pub cassette_dir: PathBuf,
    pub object_dir: PathBuf,
    /// Query parameter / JSON key names (lowercased) treated as secrets.
    pub auth_params: HashSet<String>,
    /// Header names (lowercased) whose values are masked.
    pub auth_headers: HashSet<String>,
    /// Response headers dropped before an entry is built.
    pub volatile_headers: HashSet<String>,
    pub default_mode: RecordMode,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub max_inline_size: usize,
    /// Stream replay speed; 0 replays instantly.
    pub stream_speed: u32,
    /// Ordered matcher names applied on replay.
    pub matchers: Vec<String>,
    pub named_builders: HashMap<String, PathBuilder>,
    pub global_builder: Option<PathBuilder>,
    /// `(placeholder, value)` pairs scrubbed before the built-in layers.
    pub user_filters: Vec<(String, String)>,
    /// Named redactors, applied in name order ahead of the built-in
    /// layers. A re-registered name replaces the previous redactor.
    pub redactors: HashMap<String, Arc<dyn CustomRedactor>>,
}

impl fmt::Debug for VcrConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VcrConfig")
            .field("cassette_dir", &self.cassette_dir)
            .field("object_dir", &self.object_dir)
            .field("auth_params", &self.auth_params)
            .field("auth_headers", &self.auth_headers)
            .field("volatile_headers", &self.volatile_headers)
            .field("default_mode", &self.default_mode)
            .field("batch_size", &self.batch_size)
            .field("batch_timeout", &self.batch_timeout)
            .field("max_inline_size", &self.max_inline_size)
            .field("stream_speed", &self.stream_speed)
            .field("matchers", &self.matchers)
            .field(
                "named_builders",
                &self.named_builders.keys().collect::<Vec<_>>(),
            )
            .field("global_builder", &self.global_builder.is_some())
            .field("user_filters", &self.user_filters.len())
            .field("redactors", &self.redactors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for VcrConfig {
    fn default() -> Self {
        let cassette_dir = PathBuf::from("tests/cassettes");
        let object_dir = cassette_dir.join("objects");
        Self {
            cassette_dir,
            object_dir,
            auth_params: to_set(&[
                "token",
                "api_key",
                "apikey",
                "access_token",
                "refresh_token",
                "client_secret",
                "key",
                "secret",
                "password",
            ]),
            auth_headers: to_set(&[
                "authorization",
                "cookie",
                "set-cookie",
                "x-api-key",
                "x-auth-token",
            ]),
            volatile_headers: to_set(&[
                "date",
                "server",
                "set-cookie",
                "request-id",
                "x-request-id",
                "x-amzn-trace-id",
            ]),
            default_mode: RecordMode::None,
            batch_size: 64,
            batch_timeout: Duration::from_millis(250),
            max_inline_size: 64 * 1024,
            stream_speed: 0,
            matchers: vec!["method".to_string(), "uri".to_string()],
            named_builders: HashMap::new(),
            global_builder: None,
            user_filters: Vec::new(),
            redactors: HashMap::new(),
        }
    }
}

impl VcrConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cassette_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cassette_dir = dir.into();
        self
    }

    pub fn with_object_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.object_dir = dir.into();
        self
    }

    pub fn with_default_mode(mut self, mode: RecordMode) -> Self {
        self.default_mode = mode;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    pub fn with_max_inline_size(mut self, size: usize) -> Self {
        self.max_inline_size = size;
        self
    }

    pub fn with_matchers(mut self, matchers: Vec<String>) -> Self {
        self.matchers = matchers;
        self
    }

    pub fn add_auth_param(mut self, param: impl Into<String>) -> Self {
        self.auth_params.insert(param.into().to_lowercase());
        self
    }

    pub fn add_auth_header(mut self, header: impl Into<String>) -> Self {
        self.auth_headers.insert(header.into().to_lowercase());
        self
    }

    pub fn add_volatile_header(mut self, header: impl Into<String>) -> Self {
        self.volatile_headers.insert(header.into().to_lowercase());
        self
    }

    pub fn add_user_filter(
        mut self,
        placeholder: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.user_filters.push((placeholder.into(), value.into()));
        self
    }

    pub fn with_redactor(
        mut self,
        name: impl Into<String>,
        redactor: Arc<dyn CustomRedactor>,
    ) -> Self {
        self.redactors.insert(name.into(), redactor);
        self
    }

    pub fn add_named_builder(mut self, name: impl Into<String>, builder: PathBuilder) -> Self {
        self.named_builders.insert(name.into(), builder);
        self
    }

    pub fn with_global_builder(mut self, builder: PathBuilder) -> Self {
        self.global_builder = Some(builder);
        self
    }

    /// Boot-time validation: both directories must exist (created if
    /// needed) and be writable, and batching must be sane.
    pub fn validate(&self) -> Result<(), VcrError> {
        if self.batch_size == 0 {
            return Err(VcrError::Config("batch_size must be at least 1".to_string()));
        }
        probe_writable(&self.cassette_dir)?;
        probe_writable(&self.object_dir)?;
        Ok(())
    }
}

fn to_set(values: &[&str]) -> HashSet<String> {
    values.iter().map(|s| s.to_string()).collect()
}

fn probe_writable(dir: &Path) -> Result<(), VcrError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| VcrError::Config(format!("cannot create {dir:?}: {e}")))?;

    let probe = dir.join(".reqord-probe");
    std::fs::write(&probe, b"")
        .map_err(|e| VcrError::Config(format!("{dir:?} is not writable: {e}")))?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}
