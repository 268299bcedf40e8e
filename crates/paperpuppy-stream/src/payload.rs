/// Ordered form fields sent with a stream request.
///
/// Keys may repeat (`fileIds`), so this is a list rather than a map.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FormPayload {
    fields: Vec<(String, String)>,
}

impl FormPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a field, keeping earlier fields with the same key.
    pub fn append(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// All values for `key` in insertion order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A chat message for the `sendRPC` endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChatRequest {
    pub message: String,
    pub deep_thought: bool,
    pub internet: bool,
    pub knowledge: bool,
    pub file_ids: Vec<String>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn deep_thought(mut self, enabled: bool) -> Self {
        self.deep_thought = enabled;
        self
    }

    pub fn internet(mut self, enabled: bool) -> Self {
        self.internet = enabled;
        self
    }

    pub fn knowledge(mut self, enabled: bool) -> Self {
        self.knowledge = enabled;
        self
    }

    pub fn file_id(mut self, id: impl Into<String>) -> Self {
        self.file_ids.push(id.into());
        self
    }

    /// Flags are only sent when enabled, as the backend treats presence as true.
    pub fn into_payload(self) -> FormPayload {
        let mut payload = FormPayload::new().append("message", self.message);
        for (flag, enabled) in [
            ("enableDeepThought", self.deep_thought),
            ("enableInternet", self.internet),
            ("useKnowledge", self.knowledge),
        ] {
            if enabled {
                payload = payload.append(flag, "true");
            }
        }
        for id in self.file_ids {
            payload = payload.append("fileIds", id);
        }
        payload
    }
}
