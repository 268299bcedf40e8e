use std::pin::Pin;

use futures::StreamExt as _;
use tracing::debug;

use crate::config::ClientConfig;
use crate::errors::StreamError;
use crate::payload::FormPayload;

/// Raw body chunks of an opened stream.
pub type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, StreamError>> + Send + 'static>>;

const MAX_ERROR_BODY: usize = 2048;

/// Everything needed to open one stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRequest {
    pub endpoint: String,
    pub payload: FormPayload,
    /// Read from the credential provider right before the request is issued.
    pub bearer_token: Option<String>,
}

/// Opens the byte stream behind a chat answer.
///
/// Implementations must return [`StreamError::Http`] for a non-success status
/// without reading the body as a stream.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, request: StreamRequest) -> Result<ByteStream, StreamError>;
}

/// [`Transport`] over reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, StreamError> {
        config.validate()?;
        // No overall request timeout: a healthy answer can stream for minutes.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| StreamError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Uses an existing client (shared connection pool, custom TLS, ...).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn open(&self, request: StreamRequest) -> Result<ByteStream, StreamError> {
        debug!(
            endpoint = %request.endpoint,
            fields = request.payload.fields().len(),
            "opening stream"
        );

        let mut http_req = self
            .client
            .post(&request.endpoint)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .form(request.payload.fields());
        if let Some(token) = request.bearer_token.as_deref() {
            http_req = http_req.bearer_auth(token);
        }

        let response = http_req.send().await.map_err(|e| StreamError::TransportOpen {
            message: format!("request to {} failed: {e}", request.endpoint),
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.ok().map(truncate_body);
            return Err(StreamError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let stream = response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| StreamError::read(format!("body read failed: {e}"), ""))
        });
        Ok(Box::pin(stream))
    }
}

fn truncate_body(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}
