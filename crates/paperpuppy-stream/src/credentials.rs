//! Bearer credentials attached to every stream request.
//!
//! Providers are consulted on each request, never cached, so a token rotated
//! by a login flow is picked up by the next stream.

use std::path::PathBuf;

use tracing::warn;

/// Supplies the bearer token for a request, if any.
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// No credentials.
#[derive(Clone, Copy, Debug, Default)]
pub struct Anonymous;

impl CredentialProvider for Anonymous {
    fn bearer_token(&self) -> Option<String> {
        None
    }
}

/// Fixed token.
#[derive(Clone, Debug)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl CredentialProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        non_empty(&self.0)
    }
}

/// Token read from an environment variable at request time.
#[derive(Clone, Debug)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvToken {
    fn default() -> Self {
        Self::new("PAPERPUPPY_TOKEN")
    }
}

impl CredentialProvider for EnvToken {
    fn bearer_token(&self) -> Option<String> {
        std::env::var(&self.var).ok().as_deref().and_then(non_empty)
    }
}

/// Token persisted in a file (for example by a separate login command).
#[derive(Clone, Debug)]
pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialProvider for TokenFile {
    fn bearer_token(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => non_empty(&raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to read token file");
                None
            }
        }
    }
}

fn non_empty(raw: &str) -> Option<String> {
    let token = raw.trim();
    (!token.is_empty()).then(|| token.to_string())
}
