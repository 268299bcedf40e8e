//! Message store boundary the controller writes into.
//!
//! The controller only talks to [`MessageStore`]. [`InMemoryMessageStore`] is
//! the reference implementation: one message list per session, streamed
//! assistant messages keyed by their stream id.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::errors::StreamError;
use crate::ids::{SessionId, StreamId};

/// How far a streamed message has progressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StreamPhase {
    /// More content may follow.
    Streaming,
    /// Final content; latches.
    Complete,
    /// The stream ended early; content is whatever arrived.
    Interrupted,
}

/// Incremental reconciliation record for one streamed message.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StreamUpdate {
    pub session_id: SessionId,
    pub stream_id: StreamId,
    pub content: String,
    pub phase: StreamPhase,
}

impl StreamUpdate {
    pub fn is_complete(&self) -> bool {
        self.phase == StreamPhase::Complete
    }
}

/// Shared message store mutated by streaming sessions.
///
/// `update_stream_message` is called repeatedly with growing content for the
/// same stream id: content is last-write-wins and completion latches.
///
/// The controller calls both methods while holding its active-stream lock, so
/// implementations must not call back into the controller.
pub trait MessageStore: Send + Sync {
    fn update_stream_message(&self, update: StreamUpdate);

    /// Global "assistant is answering" flag.
    fn set_loading(&self, loading: bool);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Message record held by [`InMemoryMessageStore`].
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub session_id: SessionId,
    pub stream_id: Option<StreamId>,
    pub role: Role,
    pub content: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub is_draft: bool,
    pub is_complete: bool,
    pub interrupted: bool,
}

impl StoredMessage {
    /// A user-authored message.
    pub fn user(session_id: SessionId, content: impl Into<String>) -> Self {
        Self {
            id: format!("user-{}", uuid::Uuid::new_v4()),
            session_id,
            stream_id: None,
            role: Role::User,
            content: content.into(),
            created_at: chrono::Utc::now(),
            is_draft: false,
            is_complete: true,
            interrupted: false,
        }
    }

    fn from_stream(update: &StreamUpdate) -> Self {
        let mut message = Self {
            id: format!("stream-{}", update.stream_id),
            session_id: update.session_id.clone(),
            stream_id: Some(update.stream_id),
            role: Role::Assistant,
            content: String::new(),
            created_at: chrono::Utc::now(),
            is_draft: true,
            is_complete: false,
            interrupted: false,
        };
        message.apply(update);
        message
    }

    fn apply(&mut self, update: &StreamUpdate) {
        self.content.clone_from(&update.content);
        match update.phase {
            StreamPhase::Streaming => {}
            StreamPhase::Complete => {
                self.is_draft = false;
                self.is_complete = true;
                self.interrupted = false;
            }
            StreamPhase::Interrupted => self.seal_interrupted(),
        }
    }

    fn seal_interrupted(&mut self) {
        self.is_draft = false;
        self.interrupted = true;
    }
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct StoreState {
    messages: HashMap<SessionId, Vec<StoredMessage>>,
    #[serde(skip)]
    loading: bool,
    #[serde(skip)]
    active_stream: Option<StreamId>,
    #[serde(skip)]
    loading_changes: Vec<bool>,
}

/// In-memory [`MessageStore`] with optional JSON persistence.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    state: Mutex<StoreState>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends a non-streamed message unless one with the same id exists.
    pub fn add_message(&self, message: StoredMessage) {
        let mut state = self.lock();
        let list = state.messages.entry(message.session_id.clone()).or_default();
        if !list.iter().any(|m| m.id == message.id) {
            list.push(message);
        }
    }

    /// Messages of one session in insertion order.
    pub fn messages(&self, session_id: &SessionId) -> Vec<StoredMessage> {
        self.lock()
            .messages
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The message produced by a given stream.
    pub fn stream_message(
        &self,
        session_id: &SessionId,
        stream_id: StreamId,
    ) -> Option<StoredMessage> {
        self.lock()
            .messages
            .get(session_id)?
            .iter()
            .find(|m| m.stream_id == Some(stream_id))
            .cloned()
    }

    pub fn clear_session(&self, session_id: &SessionId) {
        self.lock().messages.remove(session_id);
    }

    pub fn is_loading(&self) -> bool {
        self.lock().loading
    }

    /// Stream currently writing drafts, cleared on completion or when loading stops.
    pub fn active_stream(&self) -> Option<StreamId> {
        self.lock().active_stream
    }

    /// Every value passed to `set_loading`, oldest first.
    pub fn loading_history(&self) -> Vec<bool> {
        self.lock().loading_changes.clone()
    }

    /// Writes all sessions as pretty JSON.
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<(), StreamError> {
        let json = serde_json::to_string_pretty(&*self.lock())
            .map_err(|e| StreamError::Config(format!("failed to serialize history: {e}")))?;
        std::fs::write(path.as_ref(), json).map_err(|e| {
            StreamError::Config(format!(
                "failed to write history {}: {e}",
                path.as_ref().display()
            ))
        })
    }

    /// Loads sessions written by [`save_json`](Self::save_json). A missing
    /// file yields an empty store.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, StreamError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| {
            StreamError::Config(format!("failed to read history {}: {e}", path.display()))
        })?;
        let state: StoreState = serde_json::from_str(&raw).map_err(|e| {
            StreamError::Config(format!("invalid history {}: {e}", path.display()))
        })?;
        Ok(Self {
            state: Mutex::new(state),
        })
    }
}

impl MessageStore for InMemoryMessageStore {
    fn update_stream_message(&self, update: StreamUpdate) {
        let mut state = self.lock();
        let list = state.messages.entry(update.session_id.clone()).or_default();
        let accepted = match list.iter().position(|m| m.stream_id == Some(update.stream_id)) {
            Some(idx) => {
                let message = &mut list[idx];
                if message.is_complete {
                    debug!(stream_id = %update.stream_id, "ignoring update for completed message");
                    false
                } else {
                    message.apply(&update);
                    true
                }
            }
            None if update.content.is_empty() && update.phase == StreamPhase::Streaming => false,
            None => {
                // A late interrupted record from a cancelled stream must not
                // seal the draft of the stream that replaced it.
                if update.phase != StreamPhase::Interrupted {
                    for older in list.iter_mut().filter(|m| m.is_draft) {
                        debug!(stream_id = ?older.stream_id, "sealing superseded draft");
                        older.seal_interrupted();
                    }
                }
                list.push(StoredMessage::from_stream(&update));
                true
            }
        };
        if !accepted {
            return;
        }

        if update.phase == StreamPhase::Streaming {
            state.active_stream = Some(update.stream_id);
        } else if state.active_stream == Some(update.stream_id) {
            state.active_stream = None;
        }
    }

    fn set_loading(&self, loading: bool) {
        let mut state = self.lock();
        state.loading = loading;
        state.loading_changes.push(loading);
        if !loading {
            state.active_stream = None;
        }
    }
}
