use crate::retry::{ErrorKind, RetryLedger};
use crate::state::TaskState;
use std::time::Instant;

/// A URL waiting in (or tracked by) the frontier
#[derive(Debug, Clone)]
pub struct UrlTask {
    /// Normalized URL; the task's identity
    pub url: String,

    /// Lowercased host, the key for budgets and circuits
    pub domain: String,

    /// Lower is more urgent
    pub priority: u32,

    pub enqueue_time: Instant,

    /// Monotonic insertion counter, breaks ties within a priority band
    pub enqueue_seq: u64,

    /// Earliest instant the task may be dispatched
    pub not_before: Instant,

    pub state: TaskState,

    pub ledger: RetryLedger,

    /// Proxy used by the most recent dispatch, if any
    pub last_proxy: Option<String>,
}

impl UrlTask {
    pub(crate) fn new(
        url: String,
        domain: String,
        priority: u32,
        now: Instant,
        enqueue_seq: u64,
        ledger: RetryLedger,
    ) -> Self {
        Self {
            url,
            domain,
            priority,
            enqueue_time: now,
            enqueue_seq,
            not_before: now,
            state: TaskState::Pending,
            ledger,
            last_proxy: None,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.ledger.attempt_count()
    }

    pub fn last_error_kind(&self) -> Option<ErrorKind> {
        self.ledger.last_error_kind()
    }
}
