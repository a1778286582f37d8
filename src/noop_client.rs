use async_trait::async_trait;
use http_client::{Config, Error, HttpClient, Request, Response};

use crate::error::VcrError;

fn refusal(req: &Request) -> VcrError {
    VcrError::LiveDisabled {
        method: req.method().to_string(),
        url: req.url().to_string(),
    }
}

/// An inner client that refuses every request.
///
/// Replay-only frames (`none`/`once`) should never touch the network; this
/// client is their default inner so even a dispatch bug cannot leak a real
/// request. Refusals surface as [`VcrError::LiveDisabled`] through the
/// usual error boundary.
#[derive(Debug, Clone)]
pub struct NoOpClient {
    context: Option<String>,
    config: Config,
}

impl NoOpClient {
    pub fn new() -> Self {
        Self {
            context: None,
            config: Config::new(),
        }
    }

    /// Attach context to the refusal log, e.g. which fixture installed
    /// this client.
    pub fn with_context(context: impl Into<String>) -> Self {
        Self {
            context: Some(context.into()),
            config: Config::new(),
        }
    }

    /// A variant that panics instead of erroring, for catching unexpected
    /// live requests with a stack trace during development.
    pub fn panicking() -> PanickingNoOpClient {
        PanickingNoOpClient::new()
    }
}

impl Default for NoOpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for NoOpClient {
    async fn send(&self, req: Request) -> Result<Response, Error> {
        let err = refusal(&req);
        match &self.context {
            Some(context) => log::warn!("{err} ({context})"),
            None => log::warn!("{err}"),
        }
        Err(err.into_http())
    }

    fn set_config(&mut self, config: Config) -> Result<(), Error> {
        self.config = config;
        Ok(())
    }

    fn config(&self) -> &Config {
        &self.config
    }
}

/// Like [`NoOpClient`] but panics, so the offending call site shows up in
/// the backtrace.
#[derive(Debug, Clone)]
pub struct PanickingNoOpClient {
    context: Option<String>,
    config: Config,
}

impl PanickingNoOpClient {
    pub fn new() -> Self {
        Self {
            context: None,
            config: Config::new(),
        }
    }

    pub fn with_context(context: impl Into<String>) -> Self {
        Self {
            context: Some(context.into()),
            config: Config::new(),
        }
    }
}

impl Default for PanickingNoOpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for PanickingNoOpClient {
    async fn send(&self, req: Request) -> Result<Response, Error> {
        let err = refusal(&req);
        match &self.context {
            Some(context) => panic!("{err} ({context})"),
            None => panic!("{err}"),
        }
    }

    fn set_config(&mut self, config: Config) -> Result<(), Error> {
        self.config = config;
        Ok(())
    }

    fn config(&self) -> &Config {
        &self.config
    }
}
