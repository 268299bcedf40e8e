use std::fmt;

/// Lifecycle of a stream as observed through the controller.
///
/// `Idle → Active → Completing → Completed → Idle`, `Active → Aborted → Idle`
/// and `Active → Failed → Idle`. Terminal states always fall back to `Idle`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum StreamState {
    #[default]
    Idle,
    Active,
    Completing,
    Completed,
    Aborted,
    Failed,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Failed)
    }

    pub fn is_running(self) -> bool {
        matches!(self, Self::Active | Self::Completing)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: StreamState) -> bool {
        use StreamState::*;
        matches!(
            (self, next),
            (Idle, Active)
                | (Active, Completing)
                | (Active, Aborted)
                | (Active, Failed)
                | (Completing, Completed)
                | (Completing, Aborted)
                | (Completing, Failed)
                | (Completed | Aborted | Failed, Idle)
        )
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}
