//! Incremental consumer for PaperPuppy's streamed chat answers.
//!
//! A [`StreamController`] opens one streaming request at a time, turns the
//! body into display-ready text (UTF-8 decoding, event framing, `data:` line
//! extraction, math delimiter normalization), publishes the growing answer at
//! a debounced rate and reconciles it into a [`MessageStore`].
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use paperpuppy_stream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), StreamError> {
//! let client = ClientConfig::from_env()?;
//! let store = Arc::new(InMemoryMessageStore::new());
//! let controller = StreamController::builder()
//!     .transport(Arc::new(HttpTransport::new(&client)?))
//!     .credentials(Arc::new(EnvToken::default()))
//!     .store(store.clone())
//!     .default_session(42_u64)
//!     .build()?;
//!
//! let answer = controller
//!     .start(
//!         client.send_url(&SessionId::from(42_u64)),
//!         ChatRequest::new("What is a transformer?").into_payload(),
//!         StartOptions::new().on_complete(|text| println!("{text}")),
//!     )
//!     .await?;
//! # let _ = answer;
//! # Ok(())
//! # }
//! ```

/// Event payload extraction and the running content buffer.
pub mod accumulator;
/// Backend endpoint and stream tunables.
pub mod config;
/// Stream lifecycle: start, cancel, supersede, observers.
pub mod controller;
/// Bearer token providers.
pub mod credentials;
/// UTF-8 decoding across chunk boundaries.
pub mod decode;
/// Public error types.
pub mod errors;
/// Event framing of decoded text.
pub mod framer;
/// Session and stream identifiers.
pub mod ids;
/// Math delimiter normalization.
pub mod normalize;
/// Tracing setup for binaries.
pub mod observability;
/// Form payloads for stream requests.
pub mod payload;
/// Common imports for typical usage.
pub mod prelude;
/// Debounced publishing of the growing buffer.
pub mod publisher;
/// Controller lifecycle states.
pub mod state;
/// Message store boundary and the in-memory store.
pub mod store;
/// Transport seam and the reqwest implementation.
pub mod transport;

pub use accumulator::{ContentAccumulator, DEFAULT_SENTINELS, LineKind};
pub use config::{ClientConfig, StreamConfig};
pub use controller::{
    AbortHandle, AbortSignal, StartOptions, StreamController, StreamControllerBuilder,
};
pub use credentials::{Anonymous, CredentialProvider, EnvToken, StaticToken, TokenFile};
pub use decode::Utf8StreamDecoder;
pub use errors::{ErrorKind, StreamError};
pub use framer::{ChunkFramer, FramedEvent};
pub use ids::{SessionId, StreamId};
pub use normalize::normalize;
pub use observability::init_observability;
pub use payload::{ChatRequest, FormPayload};
pub use publisher::{DebounceConfig, DebouncedPublisher, PublishSink};
pub use state::StreamState;
pub use store::{
    InMemoryMessageStore, MessageStore, Role, StoredMessage, StreamPhase, StreamUpdate,
};
pub use transport::{ByteStream, HttpTransport, StreamRequest, Transport};
