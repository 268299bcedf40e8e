use std::fmt;

/// Conversation identifier as seen by the message store.
///
/// Backends hand out numeric ids while some front ends use strings, so the
/// canonical form is a string and numeric ids are converted at the boundary.
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Creates a session id from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the session id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the numeric form when the id came from a numeric backend id.
    pub fn as_u64(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<u64> for SessionId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl From<i64> for SessionId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

/// Identity of one streaming exchange. Fresh for every `start`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct StreamId(uuid::Uuid);

impl StreamId {
    pub(crate) fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> uuid::Uuid {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
