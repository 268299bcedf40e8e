//! Common imports for driving a stream from application code.
pub use crate::{
    ChatRequest, ClientConfig, CredentialProvider, EnvToken, FormPayload, HttpTransport,
    InMemoryMessageStore, MessageStore, SessionId, StartOptions, StaticToken, StreamConfig,
    StreamController, StreamError, StreamPhase, StreamState, init_observability,
};
