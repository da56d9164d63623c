use serde::{Deserialize, Serialize};

/// Lifecycle state of a job's consume loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Never started, or publish-only
    Idle,

    /// Consuming and processing deliveries
    Running,

    /// Consumer cancelled, draining in-flight deliveries
    ShuttingDown,

    /// Loop exited
    Stopped,
}

impl JobState {
    /// Whether a consume loop is alive in this state
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::ShuttingDown)
    }

    /// Get human-readable name
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

impl Default for JobState {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
