/// Task state definitions for tracking orchestration progress
use serde::Serialize;
use std::fmt;

/// Represents the lifecycle state of a URL task in the frontier
///
/// ```text
/// Pending ──dispatch──▶ InFlight ──success──▶ Done
///    ▲                     │
///    └──retry (not_before)─┤
///                          └──exhausted / permanent / operator──▶ Abandoned
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    // ===== Active States =====
    /// Waiting in the frontier for its domain and `not_before` to allow dispatch
    Pending,

    /// Handed to a worker; the fetch is running
    InFlight,

    // ===== Terminal States =====
    /// Fetched successfully
    Done,

    /// Given up on: retries exhausted, permanent failure, or operator request
    Abandoned,
}

impl TaskState {
    /// Returns true if this is a terminal state (no further dispatch)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Abandoned)
    }

    /// Returns true if the task still occupies its URL in the frontier
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InFlight)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Done => "done",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_flight" => Some(Self::InFlight),
            "done" => Some(Self::Done),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }

    /// Whether the frontier accepts a move from `self` to `next`
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, InFlight)
                | (Pending, Abandoned)
                | (InFlight, Pending)
                | (InFlight, Done)
                | (InFlight, Abandoned)
                | (Done, Pending)
                | (Abandoned, Pending)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
