//! Deduplicating priority frontier of URL tasks
//!
//! This module handles:
//! - Duplicate suppression keyed by normalized URL
//! - Per-domain ready queues ordered by (priority, enqueue order)
//! - A delayed queue for tasks whose `not_before` lies in the future
//! - Task state transitions (Pending, InFlight, Done, Abandoned)
//!
//! Dispatch goes through [`Frontier::pop_ready_with`], which offers the head
//! of each domain's ready queue to an admission gate. A domain the gate
//! refuses is skipped as a whole; its tasks stay queued where they are.

mod task;

pub use task::UrlTask;

use crate::metrics::{names, MetricsSink, NoopMetrics};
use crate::retry::{RetryLedger, RetryPolicy};
use crate::state::TaskState;
use crate::url::task_identity;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Entry in a domain's ready queue
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
    priority: u32,
    seq: u64,
    url: String,
}

// BinaryHeap is a max-heap; lower priority values and earlier sequence
// numbers must come out first.
impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct Inner {
    records: HashMap<String, UrlTask>,
    ready: HashMap<String, BinaryHeap<ReadyEntry>>,
    delayed: BinaryHeap<Reverse<(Instant, u64, String)>>,
    next_seq: u64,
    pending: usize,
    in_flight: usize,
    ledger_template: RetryLedger,
}

impl Inner {
    /// Whether a queued entry still refers to the live, pending record
    fn is_live(&self, url: &str, seq: u64) -> bool {
        self.records
            .get(url)
            .map(|t| t.state == TaskState::Pending && t.enqueue_seq == seq)
            .unwrap_or(false)
    }

    fn push_ready(&mut self, task: &UrlTask) {
        self.ready
            .entry(task.domain.clone())
            .or_default()
            .push(ReadyEntry {
                priority: task.priority,
                seq: task.enqueue_seq,
                url: task.url.clone(),
            });
    }

    fn enqueue(&mut self, url: &str, now: Instant) {
        let Some(task) = self.records.get(url) else {
            return;
        };
        if task.not_before <= now {
            let task = task.clone();
            self.push_ready(&task);
        } else {
            self.delayed
                .push(Reverse((task.not_before, task.enqueue_seq, task.url.clone())));
        }
    }

    /// Moves delayed entries whose time has come into the ready queues
    fn promote(&mut self, now: Instant) {
        while let Some(Reverse((not_before, _, _))) = self.delayed.peek() {
            if *not_before > now {
                break;
            }
            let Some(Reverse((not_before, seq, url))) = self.delayed.pop() else {
                break;
            };
            let live = self
                .records
                .get(&url)
                .map(|t| t.not_before == not_before)
                .unwrap_or(false);
            if live && self.is_live(&url, seq) {
                if let Some(task) = self.records.get(&url).cloned() {
                    self.push_ready(&task);
                }
            }
        }
    }

    /// Drops stale heads and returns each domain's best live entry, best first
    fn domain_heads(&mut self) -> Vec<(u32, u64, String)> {
        let mut heads = Vec::with_capacity(self.ready.len());
        let mut empty = Vec::new();

        let domains: Vec<String> = self.ready.keys().cloned().collect();
        for domain in domains {
            loop {
                let head = self
                    .ready
                    .get(&domain)
                    .and_then(|heap| heap.peek())
                    .map(|e| (e.priority, e.seq, e.url.clone()));
                match head {
                    Some((priority, seq, url)) if self.is_live(&url, seq) => {
                        heads.push((priority, seq, url));
                        break;
                    }
                    Some(_) => {
                        if let Some(heap) = self.ready.get_mut(&domain) {
                            heap.pop();
                        }
                    }
                    None => {
                        empty.push(domain.clone());
                        break;
                    }
                }
            }
        }

        for domain in empty {
            self.ready.remove(&domain);
        }
        heads.sort_unstable();
        heads
    }

    /// Moves a record to `next`, keeping the state counters in step
    fn transition(&mut self, url: &str, next: TaskState) -> Option<&mut UrlTask> {
        let task = self.records.get_mut(url)?;
        if !task.state.can_transition_to(next) {
            return None;
        }
        match task.state {
            TaskState::Pending => self.pending -= 1,
            TaskState::InFlight => self.in_flight -= 1,
            _ => {}
        }
        match next {
            TaskState::Pending => self.pending += 1,
            TaskState::InFlight => self.in_flight += 1,
            _ => {}
        }
        task.state = next;
        Some(task)
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// Deduplicating priority queue of URL tasks
///
/// All indices live behind one mutex; every operation is a short critical
/// section and none is held across an `.await`.
pub struct Frontier {
    inner: Mutex<Inner>,
    metrics: Arc<dyn MetricsSink>,
}

impl Default for Frontier {
    fn default() -> Self {
        Self::new(Arc::new(NoopMetrics))
    }
}

impl Frontier {
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self::with_policy(&RetryPolicy::default(), metrics)
    }

    /// Creates a frontier whose new tasks start with `policy`'s ledger
    pub fn with_policy(policy: &RetryPolicy, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: HashMap::new(),
                ready: HashMap::new(),
                delayed: BinaryHeap::new(),
                next_seq: 0,
                pending: 0,
                in_flight: 0,
                ledger_template: policy.new_ledger(),
            }),
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit_depth(&self, inner: &Inner) {
        self.metrics.gauge(
            names::FRONTIER_DEPTH,
            (inner.pending + inner.in_flight) as f64,
            &[],
        );
    }

    /// Applies a new retry policy to tasks submitted from now on
    pub fn set_policy(&self, policy: &RetryPolicy) {
        self.lock().ledger_template = policy.new_ledger();
    }

    /// Adds a URL
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The URL was newly inserted
    /// * `Ok(false)` - A record for the normalized URL already exists
    /// * `Err(InvalidTask)` - The URL is malformed; nothing changed
    pub fn add(&self, url: &str, priority: u32) -> crate::Result<bool> {
        self.insert(url, priority, false, Instant::now())
    }

    /// Adds a URL, resetting a Done or Abandoned record back to Pending
    ///
    /// Still a no-op for Pending and InFlight records.
    pub fn add_recrawl(&self, url: &str, priority: u32) -> crate::Result<bool> {
        self.insert(url, priority, true, Instant::now())
    }

    fn insert(&self, raw: &str, priority: u32, recrawl: bool, now: Instant) -> crate::Result<bool> {
        let (url, domain) = task_identity(raw)?;
        let key = url.to_string();

        let mut inner = self.lock();
        let existing = inner.records.get(&key).map(|t| t.state);
        match existing {
            Some(state) if state.is_active() => {
                tracing::trace!("Duplicate URL ignored: {}", key);
                return Ok(false);
            }
            Some(_) if !recrawl => return Ok(false),
            Some(_) => {
                let seq = inner.next_seq();
                if let Some(task) = inner.transition(&key, TaskState::Pending) {
                    task.priority = priority;
                    task.enqueue_seq = seq;
                    task.enqueue_time = now;
                    task.not_before = now;
                    task.ledger.reset();
                    task.last_proxy = None;
                }
                tracing::debug!("Re-crawl of {} scheduled", key);
            }
            None => {
                let seq = inner.next_seq();
                let ledger = inner.ledger_template.clone();
                let task = UrlTask::new(key.clone(), domain, priority, now, seq, ledger);
                inner.records.insert(key.clone(), task);
                inner.pending += 1;
            }
        }

        inner.enqueue(&key, now);
        self.emit_depth(&inner);
        Ok(true)
    }

    /// Pops the most urgent ready task, ignoring admission
    pub fn pop_ready(&self, now: Instant) -> Option<UrlTask> {
        self.pop_ready_with(now, |_| Some(())).map(|(task, ())| task)
    }

    /// Pops the most urgent ready task whose domain the gate admits
    ///
    /// The head task of each domain is offered best-first; the gate is called
    /// at most once per domain. A refused domain keeps all of its tasks
    /// queued. The popped task becomes InFlight and is charged one attempt.
    ///
    /// # Arguments
    ///
    /// * `now` - Tasks with `not_before <= now` are eligible
    /// * `gate` - Admission decision for a domain's head task; `Some` admits
    pub fn pop_ready_with<T, F>(&self, now: Instant, mut gate: F) -> Option<(UrlTask, T)>
    where
        F: FnMut(&UrlTask) -> Option<T>,
    {
        let mut inner = self.lock();
        inner.promote(now);

        for (_, _, url) in inner.domain_heads() {
            let Some(head) = inner.records.get(&url) else {
                continue;
            };
            let Some(admission) = gate(head) else {
                continue;
            };

            let domain = head.domain.clone();
            inner.ready.get_mut(&domain).and_then(|heap| heap.pop())?;
            let task = inner.transition(&url, TaskState::InFlight)?;
            task.ledger.record_attempt();
            let task = task.clone();

            self.emit_depth(&inner);
            return Some((task, admission));
        }
        None
    }

    /// Marks an in-flight task Done
    pub fn complete(&self, url: &str) -> bool {
        let mut inner = self.lock();
        let done = inner.transition(url, TaskState::Done).is_some();
        self.emit_depth(&inner);
        done
    }

    /// Returns an in-flight task to Pending, eligible at `not_before`
    ///
    /// Priority and enqueue order are preserved. Returns false if the task is
    /// no longer in flight (e.g. abandoned by an operator meanwhile).
    pub fn requeue(&self, url: &str, not_before: Instant) -> bool {
        let mut inner = self.lock();
        let Some(task) = inner.transition(url, TaskState::Pending) else {
            return false;
        };
        task.not_before = not_before;
        let now = Instant::now();
        inner.enqueue(url, now);
        self.emit_depth(&inner);
        true
    }

    /// Returns an in-flight task to Pending, immediately eligible again
    pub fn release(&self, url: &str) -> bool {
        let mut inner = self.lock();
        let Some(task) = inner.transition(url, TaskState::Pending) else {
            return false;
        };
        let task = task.clone();
        inner.push_ready(&task);
        self.emit_depth(&inner);
        true
    }

    /// Marks a pending or in-flight task Abandoned
    pub fn abandon(&self, url: &str) -> bool {
        let mut inner = self.lock();
        let abandoned = inner.transition(url, TaskState::Abandoned).is_some();
        self.emit_depth(&inner);
        abandoned
    }

    /// Removes a terminal record, allowing the URL to be added afresh
    pub fn acknowledge(&self, url: &str) -> Option<UrlTask> {
        let mut inner = self.lock();
        let terminal = inner
            .records
            .get(url)
            .map(|t| t.state.is_terminal())
            .unwrap_or(false);
        if terminal {
            inner.records.remove(url)
        } else {
            None
        }
    }

    /// Runs `f` on a task only while it is in flight
    pub fn update_in_flight<R>(&self, url: &str, f: impl FnOnce(&mut UrlTask) -> R) -> Option<R> {
        let mut inner = self.lock();
        inner
            .records
            .get_mut(url)
            .filter(|t| t.state == TaskState::InFlight)
            .map(f)
    }

    pub fn get(&self, url: &str) -> Option<UrlTask> {
        self.lock().records.get(url).cloned()
    }

    /// Number of active (Pending or InFlight) tasks by unique URL
    pub fn len(&self) -> usize {
        let inner = self.lock();
        inner.pending + inner.in_flight
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight
    }

    /// Terminal records not yet acknowledged
    pub fn terminal_len(&self) -> usize {
        let inner = self.lock();
        inner.records.len() - inner.pending - inner.in_flight
    }

    /// True when nothing is pending or in flight
    pub fn is_idle(&self) -> bool {
        self.is_empty()
    }

    /// Earliest `not_before` among delayed tasks (may be stale; a wake hint)
    pub fn next_not_before(&self) -> Option<Instant> {
        self.lock()
            .delayed
            .peek()
            .map(|Reverse((not_before, _, _))| *not_before)
    }
}
