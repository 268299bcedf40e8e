use std::time::Duration;

/// Broad family of a [`StreamError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request could not be issued or was rejected before streaming.
    Open,
    /// The body failed after streaming began.
    Read,
    /// The stream was cancelled or superseded. Not reported through `on_error`.
    Cancelled,
    /// Invalid configuration.
    Config,
}

/// Errors returned by the streaming core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Endpoint answered with a non-success status before any body was read.
    #[error("stream request failed with status {status}")]
    Http { status: u16, body: Option<String> },
    /// Request could not be sent (DNS, connect, TLS, ...).
    #[error("failed to open stream: {message}")]
    TransportOpen { message: String },
    /// No response headers within the configured open timeout.
    #[error("no response within {0:?}")]
    OpenTimeout(Duration),
    /// Reading the body failed after streaming began.
    #[error("stream read failed: {message}")]
    TransportRead { message: String, partial: String },
    /// No bytes arrived within the configured idle timeout.
    #[error("stream idle for {after:?}")]
    IdleTimeout { after: Duration, partial: String },
    /// The stream was cancelled by the caller or replaced by a newer one.
    #[error("stream cancelled")]
    Cancelled,
    /// Invalid client or stream configuration.
    #[error("config error: {0}")]
    Config(String),
}

impl StreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Http { .. } | Self::TransportOpen { .. } | Self::OpenTimeout(_) => {
                ErrorKind::Open
            }
            Self::TransportRead { .. } | Self::IdleTimeout { .. } => ErrorKind::Read,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Content accumulated before a read failure, if any.
    pub fn partial_content(&self) -> Option<&str> {
        match self {
            Self::TransportRead { partial, .. } | Self::IdleTimeout { partial, .. }
                if !partial.is_empty() =>
            {
                Some(partial.as_str())
            }
            _ => None,
        }
    }

    /// HTTP status for a rejected request.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub(crate) fn read(message: impl Into<String>, partial: impl Into<String>) -> Self {
        Self::TransportRead {
            message: message.into(),
            partial: partial.into(),
        }
    }

    /// Attaches the content accumulated so far to a read-family error.
    pub(crate) fn with_partial(self, content: &str) -> Self {
        match self {
            Self::TransportRead { message, .. } => Self::TransportRead {
                message,
                partial: content.to_string(),
            },
            Self::IdleTimeout { after, .. } => Self::IdleTimeout {
                after,
                partial: content.to_string(),
            },
            other => other,
        }
    }
}
