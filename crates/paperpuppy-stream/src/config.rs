use std::time::Duration;

use crate::accumulator::DEFAULT_SENTINELS;
use crate::errors::StreamError;
use crate::ids::SessionId;
use crate::publisher::DebounceConfig;

/// Where and how to reach the PaperPuppy backend.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ClientConfig {
    /// API root, for example `http://localhost:8080/api`.
    pub base_url: String,
    /// Timeout for establishing the TCP/TLS connection.
    pub connect_timeout: Duration,
    /// Environment variable holding the bearer token.
    pub token_env: String,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout: Duration::from_secs(10),
            token_env: "PAPERPUPPY_TOKEN".to_string(),
        }
    }

    /// Builds a config from `PAPERPUPPY_BASE_URL` (default
    /// `http://localhost:8080/api`).
    pub fn from_env() -> Result<Self, StreamError> {
        let base_url = std::env::var("PAPERPUPPY_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:8080/api".to_string());
        let config = Self::new(base_url);
        config.validate()?;
        Ok(config)
    }

    /// Overrides the API root.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn token_env(mut self, var: impl Into<String>) -> Self {
        self.token_env = var.into();
        self
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        let url = self.base_url.trim();
        if url.is_empty() {
            return Err(StreamError::Config("base_url must not be empty".into()));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(StreamError::Config(format!(
                "base_url must be an http(s) URL, got {url}"
            )));
        }
        Ok(())
    }

    /// Streaming endpoint for sending a message to `session`.
    pub fn send_url(&self, session: &SessionId) -> String {
        format!(
            "{}/sessions/{}/sendRPC",
            self.base_url.trim_end_matches('/'),
            session
        )
    }
}

/// Per-controller stream behaviour.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StreamConfig {
    pub debounce: DebounceConfig,
    /// Fail the stream when no bytes arrive for this long. `None` waits forever.
    pub idle_timeout: Option<Duration>,
    /// Upper bound for receiving response headers.
    pub open_timeout: Option<Duration>,
    /// Payloads that signal stream control rather than content.
    pub sentinels: Vec<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            debounce: DebounceConfig::default(),
            idle_timeout: Some(Duration::from_secs(60)),
            open_timeout: Some(Duration::from_secs(30)),
            sentinels: DEFAULT_SENTINELS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl StreamConfig {
    pub fn debounce(mut self, debounce: DebounceConfig) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn open_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn sentinels(mut self, sentinels: Vec<String>) -> Self {
        self.sentinels = sentinels;
        self
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if self.idle_timeout.is_some_and(|t| t.is_zero()) {
            return Err(StreamError::Config("idle_timeout must be greater than 0".into()));
        }
        if self.open_timeout.is_some_and(|t| t.is_zero()) {
            return Err(StreamError::Config("open_timeout must be greater than 0".into()));
        }
        if self.debounce.max_delay < self.debounce.base_delay {
            return Err(StreamError::Config(
                "debounce max_delay must not be below base_delay".into(),
            ));
        }
        Ok(())
    }
}
