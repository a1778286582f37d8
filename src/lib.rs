//! Record and replay HTTP traffic for deterministic test suites.
//!
//! `VcrClient` wraps any [`http_client::HttpClient`]: in replay modes it
//! serves responses from a cassette file without touching the network, and
//! in recording modes it captures live traffic into durable, chronologically
//! ordered JSON Lines cassettes. Concurrent requests replay in initiation
//! order because every entry is stamped when its request is dispatched, not
//! when the response returns.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use http_client::{Error, HttpClient, Request, Response};
use http_types::StatusCode;
use tokio::sync::Mutex;

mod analyzer;
mod config;
mod coordinator;
mod entry;
mod error;
mod matcher;
mod naming;
mod noop_client;
mod object_store;
mod redact;
mod storage;
mod writer;

pub use analyzer::{classify, should_store_externally, BodyKind};
pub use config::{VcrConfig, MODE_ENV_VAR};
pub use coordinator::{coordinator_key, global_registry, CassetteCoordinator, CoordinatorRegistry};
pub use entry::{
    body_hash, now_micros, BodyEncoding, CassetteEntry, ExternalBody, RecordedRequest,
    RecordedResponse, ALLOWED_METHODS,
};
pub use error::VcrError;
pub use matcher::{
    normalize_url, register_matcher, BodyMatcher, HeadersMatcher, HostMatcher, LiveRequest,
    Matcher, MatcherEngine, MethodMatcher, PathMatcher, UriMatcher,
};
pub use naming::{NamingResolver, PathBuilder, TestContext, CASSETTE_EXTENSION};
pub use noop_client::{NoOpClient, PanickingNoOpClient};
pub use object_store::{sha256_hex, ObjectStore, StreamChunk};
pub use redact::{CustomRedactor, Redactor, REDACTED};
pub use storage::{JsonlStorage, StorageBackend};
pub use writer::CassetteWriter;

/// Per-cassette record/replay policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMode {
    /// Replay on match, fail on miss. The default.
    None,
    /// Same as `None` today; kept distinct for the env surface.
    Once,
    /// Replay on match, record and append on miss.
    NewEpisodes,
    /// Record everything, replace the cassette atomically at frame end.
    All,
}

impl RecordMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordMode::None => "none",
            RecordMode::Once => "once",
            RecordMode::NewEpisodes => "new_episodes",
            RecordMode::All => "all",
        }
    }

    /// Read the mode from [`MODE_ENV_VAR`]; unset means [`RecordMode::None`].
    pub fn from_env() -> Result<Self, VcrError> {
        match std::env::var(MODE_ENV_VAR) {
            Ok(value) => value.parse(),
            Err(_) => Ok(RecordMode::None),
        }
    }
}

impl FromStr for RecordMode {
    type Err = VcrError;

    fn from_str(s: &str) -> Result<Self, VcrError> {
        match s.trim() {
            "none" => Ok(RecordMode::None),
            "once" => Ok(RecordMode::Once),
            "new_episodes" => Ok(RecordMode::NewEpisodes),
            "all" => Ok(RecordMode::All),
            other => Err(VcrError::Config(format!("unknown record mode {other:?}"))),
        }
    }
}

impl std::fmt::Display for RecordMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one test frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Armed,
    Active,
    Terminated,
}

#[derive(Debug)]
pub struct VcrClient {
    inner: Box<dyn HttpClient>,
    mode: RecordMode,
    cassette_path: PathBuf,
    config: VcrConfig,
    coordinator: Arc<CassetteCoordinator>,
    writer: CassetteWriter,
    storage: Arc<dyn StorageBackend>,
    object_store: ObjectStore,
    engine: MatcherEngine,
    redactor: Redactor,
    state: Mutex<FrameState>,
}

impl VcrClient {
    pub fn builder<P: Into<PathBuf>>(cassette_path: P) -> VcrClientBuilder {
        VcrClientBuilder::new(cassette_path)
    }

    /// Resolve the cassette path from a test context (the naming
    /// resolver's priority chain) and start a builder for it.
    pub fn builder_for(
        ctx: &TestContext,
        selected_builder: Option<&str>,
        config: &VcrConfig,
    ) -> Result<VcrClientBuilder, VcrError> {
        let mut resolver = NamingResolver::new(config.cassette_dir.clone());
        for (name, builder) in &config.named_builders {
            resolver.add_named_builder(name.clone(), builder.clone());
        }
        if let Some(builder) = &config.global_builder {
            resolver.set_global_builder(builder.clone());
        }
        let path = resolver.resolve(ctx, selected_builder)?;
        Ok(VcrClientBuilder::new(path).config(config.clone()))
    }

    pub fn mode(&self) -> RecordMode {
        self.mode
    }

    pub fn cassette_path(&self) -> &Path {
        &self.cassette_path
    }

    pub async fn frame_state(&self) -> FrameState {
        *self.state.lock().await
    }

    /// Snapshot of the entries accumulated for this cassette.
    pub async fn entries(&self) -> Vec<CassetteEntry> {
        self.coordinator.entries().await
    }

    /// Load the cassette into the coordinator and arm the frame.
    async fn install(&self) -> Result<(), VcrError> {
        let entries = self.storage.read_entries(&self.cassette_path).await?;
        if !entries.is_empty() {
            log::debug!(
                "loaded {} entries from {:?}",
                entries.len(),
                self.cassette_path
            );
        }
        self.coordinator.load(entries).await;
        *self.state.lock().await = FrameState::Armed;
        Ok(())
    }

    /// First request moves Armed to Active; a terminated frame rejects
    /// further traffic.
    async fn activate(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        match *state {
            FrameState::Armed => {
                *state = FrameState::Active;
                Ok(())
            }
            FrameState::Active => Ok(()),
            FrameState::Idle => Err(Error::from_str(500, "VcrClient used before install")),
            FrameState::Terminated => Err(Error::from_str(500, "VcrClient used after cleanup")),
        }
    }

    /// Frame teardown barrier: flush this cassette, commit the `all`-mode
    /// replacement, then dispose the coordinator. Idempotent; run it from
    /// the test teardown hook so it executes on failure too.
    pub async fn cleanup(&self) -> Result<(), Error> {
        {
            let mut state = self.state.lock().await;
            if *state == FrameState::Terminated {
                return Ok(());
            }
            *state = FrameState::Terminated;
        }

        self.writer.flush(&self.cassette_path).await;
        if self.mode == RecordMode::All {
            self.writer
                .replace_all(&self.cassette_path)
                .await
                .map_err(VcrError::into_http)?;
        }

        self.coordinator.clear().await;
        global_registry().dispose(&self.cassette_path).await;
        Ok(())
    }

    async fn replay_only(&self, live: LiveRequest) -> Result<Response, Error> {
        let entries = self.coordinator.entries().await;
        match self.engine.find_match(&live, &entries) {
            Some(entry) => {
                self.coordinator.advance_cursor().await;
                self.replay_response(entry).await
            }
            None => Err(self.miss_error(&live, &entries).into_http()),
        }
    }

    async fn replay_or_record(&self, live: LiveRequest) -> Result<Response, Error> {
        let entries = self.coordinator.entries().await;
        if let Some(entry) = self.engine.find_match(&live, &entries) {
            self.coordinator.advance_cursor().await;
            return self.replay_response(entry).await;
        }
        drop(entries);

        let entry = self.record(&live).await?;
        self.coordinator.append(entry.clone()).await;
        self.writer
            .write_entry(&self.cassette_path, entry.clone())
            .await;
        self.replay_response(&entry).await
    }

    /// `all` mode never consults recorded entries; everything is recorded
    /// and staged for the atomic replace at frame end.
    async fn record_for_replace(&self, live: LiveRequest) -> Result<Response, Error> {
        let entry = self.record(&live).await?;
        self.coordinator.append(entry.clone()).await;
        self.writer
            .stage_entry(&self.cassette_path, entry.clone())
            .await;
        self.replay_response(&entry).await
    }

    /// Make the live call and build the cassette entry. `recorded_at` is
    /// captured before dispatch: it is the ordering key that keeps
    /// concurrent recordings chronological even when responses return out
    /// of order.
    async fn record(&self, live: &LiveRequest) -> Result<CassetteEntry, Error> {
        let recorded_at = now_micros();

        let outbound = rebuild_request(live)?;
        let mut response = self
            .inner
            .send(outbound)
            .await
            .map_err(|e| VcrError::Network(e.to_string()).into_http())?;

        let status: u16 = response.status().into();
        let mut headers = extract_headers(response.iter());
        let media_type = headers.get("content-type").cloned();
        let body = response
            .body_bytes()
            .await
            .map_err(|e| Error::from_str(500, format!("failed to read response body: {e}")))?;

        headers.retain(|name, _| !self.config.volatile_headers.contains(name));

        let url = self.redactor.redact_url(&live.url);
        let mut request_headers = live.headers.clone();
        self.redactor.redact_request_headers(&mut request_headers);
        self.redactor.redact_response_headers(&mut headers);

        let body = match classify(media_type.as_deref(), &body) {
            BodyKind::Text => match String::from_utf8(body) {
                Ok(text) => self.redactor.redact_response_body(&text).into_bytes(),
                Err(e) => e.into_bytes(),
            },
            _ => body,
        };

        let req = RecordedRequest::new(&live.method, url, request_headers, &live.body)
            .map_err(VcrError::into_http)?;
        let (resp, external) = RecordedResponse::new(
            status,
            headers,
            body,
            media_type.as_deref(),
            self.config.max_inline_size,
            recorded_at,
        )
        .map_err(VcrError::into_http)?;

        // Best effort: a failed put leaves this entry unloadable at replay,
        // but the caller still gets its response.
        if let Some(external) = &external {
            let stored = match external {
                ExternalBody::Binary { hash, bytes } => self.object_store.put(hash, bytes).await,
                ExternalBody::Stream { hash, chunks } => {
                    self.object_store.put_stream(hash, chunks).await
                }
            };
            if let Err(e) = stored {
                log::warn!("failed to store external body: {e}");
            }
        }

        CassetteEntry::new(req, resp, recorded_at).map_err(VcrError::into_http)
    }

    /// Build the response a caller sees from a cassette entry, resolving
    /// external bodies through the object store. Stream replay is instant;
    /// chunk timing is preserved in the store but not honored here.
    async fn replay_response(&self, entry: &CassetteEntry) -> Result<Response, Error> {
        let body: Vec<u8> = match entry.resp.body_encoding {
            BodyEncoding::Text | BodyEncoding::Binary | BodyEncoding::Stream => {
                entry.resp.body.clone()
            }
            BodyEncoding::ExternalBinary => {
                let hash = external_ref(entry)?;
                self.object_store
                    .get(hash)
                    .await
                    .map_err(VcrError::into_http)?
            }
            BodyEncoding::ExternalStream => {
                let hash = external_ref(entry)?;
                let chunks = self
                    .object_store
                    .get_stream(hash)
                    .await
                    .map_err(VcrError::into_http)?;
                self.assemble_stream(chunks).await
            }
        };

        let status =
            StatusCode::try_from(entry.resp.status).unwrap_or(StatusCode::InternalServerError);
        let mut response = Response::new(status);
        for (name, value) in &entry.resp.headers {
            let _ = response.insert_header(name.as_str(), value.as_str());
        }
        response.set_body(body);
        Ok(response)
    }

    /// Concatenate stream chunks. Speed 0 replays instantly; a positive
    /// speed divides the recorded inter-chunk gaps.
    async fn assemble_stream(&self, chunks: Vec<StreamChunk>) -> Vec<u8> {
        let speed = self.config.stream_speed as u64;
        let mut body = Vec::new();
        let mut previous = None;

        for chunk in chunks {
            if speed > 0 {
                if let Some(previous) = previous {
                    let gap = chunk.timestamp.saturating_sub(previous) / speed;
                    if gap > 0 {
                        tokio::time::sleep(std::time::Duration::from_micros(gap)).await;
                    }
                }
                previous = Some(chunk.timestamp);
            }
            body.extend(chunk.data);
        }
        body
    }

    fn miss_error(&self, live: &LiveRequest, entries: &[CassetteEntry]) -> VcrError {
        if let Some(closest) = self.engine.closest_candidate(live, entries) {
            log::warn!(
                "cassette miss for {} {}; closest recorded request is {} {}",
                live.method,
                live.url,
                closest.req.method,
                closest.req.url
            );
        }
        VcrError::CassetteMiss {
            method: live.method.to_uppercase(),
            url: live.url.clone(),
            body_hash: live.body_hash(),
            cassette_path: self.cassette_path.clone(),
        }
    }
}

fn external_ref(entry: &CassetteEntry) -> Result<&str, Error> {
    entry.resp.body_external_ref.as_deref().ok_or_else(|| {
        VcrError::EntryInvalid("external encoding without ref".to_string()).into_http()
    })
}

/// Read everything out of a request once. `http_types` bodies are
/// single-shot, so matching and recording both work from this snapshot.
async fn extract_live_request(mut req: Request) -> Result<LiveRequest, Error> {
    let body = req
        .take_body()
        .into_bytes()
        .await
        .map_err(|e| Error::from_str(500, format!("failed to read request body: {e}")))?;

    Ok(LiveRequest {
        method: req.method().to_string(),
        url: req.url().to_string(),
        headers: extract_headers(req.iter()),
        body,
    })
}

fn extract_headers<'a, I>(iter: I) -> HashMap<String, String>
where
    I: Iterator<
        Item = (
            &'a http_types::headers::HeaderName,
            &'a http_types::headers::HeaderValues,
        ),
    >,
{
    let mut headers = HashMap::new();
    for (name, values) in iter {
        let joined = values
            .iter()
            .map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        headers.insert(name.as_str().to_lowercase(), joined);
    }
    headers
}

/// Reconstruct an outbound request from the snapshot for the live call.
fn rebuild_request(live: &LiveRequest) -> Result<Request, Error> {
    let method: http_types::Method = live
        .method
        .parse()
        .map_err(|e| Error::from_str(400, format!("invalid method: {e}")))?;
    let url: http_types::Url = live
        .url
        .parse()
        .map_err(|e| Error::from_str(400, format!("invalid URL: {e}")))?;

    let mut req = Request::new(method, url);
    for (name, value) in &live.headers {
        let _ = req.insert_header(name.as_str(), value.as_str());
    }
    if !live.body.is_empty() {
        req.set_body(live.body.clone());
    }
    Ok(req)
}

#[async_trait]
impl HttpClient for VcrClient {
    async fn send(&self, req: Request) -> Result<Response, Error> {
        self.activate().await?;
        let live = extract_live_request(req).await?;

        match self.mode {
            RecordMode::None | RecordMode::Once => self.replay_only(live).await,
            RecordMode::NewEpisodes => self.replay_or_record(live).await,
            RecordMode::All => self.record_for_replace(live).await,
        }
    }

    fn set_config(&mut self, config: http_client::Config) -> Result<(), Error> {
        self.inner
            .set_config(config)
            .map_err(|e| Error::from_str(500, format!("Config error: {e}")))
    }

    fn config(&self) -> &http_client::Config {
        self.inner.config()
    }
}

impl Drop for VcrClient {
    fn drop(&mut self) {
        if let Ok(state) = self.state.try_lock() {
            if !matches!(*state, FrameState::Terminated | FrameState::Idle) {
                log::warn!(
                    "VcrClient for {:?} dropped without cleanup; unflushed entries may be lost",
                    self.cassette_path
                );
            }
        }
    }
}

#[derive(Debug)]
pub struct VcrClientBuilder {
    inner: Option<Box<dyn HttpClient>>,
    mode: Option<RecordMode>,
    cassette_path: PathBuf,
    config: VcrConfig,
    storage: Option<Arc<dyn StorageBackend>>,
    redactors: Vec<Arc<dyn CustomRedactor>>,
}

impl VcrClientBuilder {
    pub fn new<P: Into<PathBuf>>(cassette_path: P) -> Self {
        Self {
            inner: None,
            mode: None,
            cassette_path: cassette_path.into(),
            config: VcrConfig::default(),
            storage: None,
            redactors: Vec::new(),
        }
    }

    /// The client used for live traffic in recording modes. Defaults to a
    /// [`NoOpClient`], which keeps replay-only frames off the network even
    /// on a dispatch bug.
    pub fn inner_client(mut self, client: Box<dyn HttpClient>) -> Self {
        self.inner = Some(client);
        self
    }

    /// Explicit mode; when unset, [`MODE_ENV_VAR`] decides, falling back
    /// to the config's `default_mode`.
    pub fn mode(mut self, mode: RecordMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn config(mut self, config: VcrConfig) -> Self {
        self.config = config;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Append an unnamed per-frame redactor. Redactors registered on the
    /// config under a name (`VcrConfig::with_redactor`) run first.
    pub fn add_redactor(mut self, redactor: Arc<dyn CustomRedactor>) -> Self {
        self.redactors.push(redactor);
        self
    }

    pub async fn build(self) -> Result<VcrClient, Error> {
        self.config.validate().map_err(VcrError::into_http)?;

        let mode = match self.mode {
            Some(mode) => mode,
            None => match std::env::var(MODE_ENV_VAR) {
                Ok(value) => value.parse().map_err(VcrError::into_http)?,
                Err(_) => self.config.default_mode,
            },
        };
        let inner = self.inner.unwrap_or_else(|| Box::new(NoOpClient::new()));
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(JsonlStorage::new()) as Arc<dyn StorageBackend>);

        let writer = CassetteWriter::new(
            storage.clone(),
            self.config.batch_size,
            self.config.batch_timeout,
        );
        let object_store = ObjectStore::new(self.config.object_dir.clone());
        let engine = MatcherEngine::new(
            self.config.matchers.clone(),
            self.config.auth_params.clone(),
        );

        let mut redactor = Redactor::new(
            self.config.auth_params.clone(),
            self.config.auth_headers.clone(),
        );
        for (placeholder, value) in &self.config.user_filters {
            redactor.add_user_filter(placeholder.clone(), value.clone());
        }
        // Named redactors run in name order; per-frame additions from the
        // builder run after them.
        let mut names: Vec<&String> = self.config.redactors.keys().collect();
        names.sort();
        for name in names {
            redactor.add_custom(self.config.redactors[name].clone());
        }
        for custom in self.redactors {
            redactor.add_custom(custom);
        }

        let coordinator = global_registry().get_or_create(&self.cassette_path).await;

        let client = VcrClient {
            inner,
            mode,
            cassette_path: self.cassette_path,
            config: self.config,
            coordinator,
            writer,
            storage,
            object_store,
            engine,
            redactor,
            state: Mutex::new(FrameState::Idle),
        };
        client.install().await.map_err(VcrError::into_http)?;
        Ok(client)
    }
}
