//! Shared test doubles: a scripted inner client and config fixtures.
#![allow(dead_code)]

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http_client::{Config, Error, HttpClient, Request, Response};
use http_types::StatusCode;

use reqord::VcrConfig;

pub struct CannedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Simulated server latency, to force responses to complete out of
    /// initiation order.
    pub delay: Duration,
}

impl CannedResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Handler = dyn Fn(&str, &str, &[u8]) -> CannedResponse + Send + Sync;

/// An inner client that answers from a handler function instead of the
/// network, counting how many live calls were made.
pub struct ScriptedClient {
    handler: Box<Handler>,
    calls: Arc<AtomicUsize>,
    config: Config,
}

impl fmt::Debug for ScriptedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedClient")
            .field("calls", &self.calls.load(Ordering::SeqCst))
            .finish()
    }
}

impl ScriptedClient {
    pub fn new(
        handler: impl Fn(&str, &str, &[u8]) -> CannedResponse + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Arc::new(AtomicUsize::new(0)),
            config: Config::new(),
        }
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl HttpClient for ScriptedClient {
    async fn send(&self, mut req: Request) -> Result<Response, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let body = req
            .take_body()
            .into_bytes()
            .await
            .map_err(|e| Error::from_str(500, format!("{e}")))?;
        let method = req.method().to_string();
        let canned = (self.handler)(&method, req.url().as_str(), &body);

        if !canned.delay.is_zero() {
            tokio::time::sleep(canned.delay).await;
        }

        let status = StatusCode::try_from(canned.status).unwrap();
        let mut response = Response::new(status);
        response.set_body(canned.body.clone());
        for (name, value) in &canned.headers {
            let _ = response.insert_header(name.as_str(), value.as_str());
        }
        Ok(response)
    }

    fn set_config(&mut self, config: Config) -> Result<(), Error> {
        self.config = config;
        Ok(())
    }

    fn config(&self) -> &Config {
        &self.config
    }
}

pub fn test_config(root: &Path) -> VcrConfig {
    VcrConfig::default()
        .with_cassette_dir(root.join("cassettes"))
        .with_object_dir(root.join("objects"))
}

/// Parse a JSONL cassette file into raw JSON values, one per line.
pub fn read_cassette_lines(path: &Path) -> Vec<serde_json::Value> {
    let content = std::fs::read_to_string(path).expect("cassette file readable");
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("valid cassette line"))
        .collect()
}
