//! Orchestrator: the crawl loop and its operator-facing API
//!
//! This module handles:
//! - Building the per-domain tables, proxy pool and frontier from a [`Config`]
//! - Task submission, operator pause/resume/abandon and acknowledgement
//! - The dispatch loop (worker slots, scheduler decisions, idle sleeping)
//! - Delivering [`TaskReport`]s to registered [`ResultCallback`]s
//! - Applying reloaded configuration while running

use super::fetcher::{FetchResponse, Fetcher, Headers};
use super::scheduler::{Decision, Dispatch, Scheduler};
use super::worker::{fetch_once, WorkerPool};
use crate::budget::DomainBudget;
use crate::circuit::CircuitBreaker;
use crate::config::{validate, Config, SchedulerConfig, SeedEntry};
use crate::frontier::{Frontier, UrlTask};
use crate::metrics::{names, MetricsSink};
use crate::proxy::ProxyRotator;
use crate::retry::{ErrorKind, RetryPolicy};
use crate::state::TaskState;
use crate::url::task_identity;
use crate::{ConfigError, ConfigResult};
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify, OwnedSemaphorePermit};

/// Upper bound between two sweeps of idle per-domain state
const EVICTION_SWEEP: Duration = Duration::from_secs(60);

/// Final outcome of a task, delivered once it reaches Done or Abandoned
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub url: String,

    pub domain: String,

    /// `Done` or `Abandoned`
    pub final_state: TaskState,

    /// Charged attempts (proxy failures are not charged)
    pub attempts: u32,

    pub last_error_kind: Option<ErrorKind>,

    pub last_error: Option<String>,

    /// Present for `Done`
    pub response: Option<FetchResponse>,

    pub finished_at: DateTime<Utc>,
}

impl TaskReport {
    pub(crate) fn from_task(task: &UrlTask, response: Option<FetchResponse>) -> Self {
        Self {
            url: task.url.clone(),
            domain: task.domain.clone(),
            final_state: task.state,
            attempts: task.attempt_count(),
            last_error_kind: task.last_error_kind(),
            last_error: task.ledger.last_error().map(str::to_string),
            response,
            finished_at: Utc::now(),
        }
    }
}

/// Receives a report for every task that reaches a terminal state
///
/// Callbacks run on worker tasks (or on the caller of
/// [`Orchestrator::abandon`]) and should return quickly.
pub trait ResultCallback: Send + Sync {
    fn on_result(&self, report: TaskReport);
}

impl<F> ResultCallback for F
where
    F: Fn(TaskReport) + Send + Sync,
{
    fn on_result(&self, report: TaskReport) {
        self(report)
    }
}

struct Inner {
    scheduler: Scheduler,
    fetcher: Arc<dyn Fetcher>,
    workers: WorkerPool,
    settings: RwLock<SchedulerConfig>,
    headers: RwLock<Headers>,
    callbacks: RwLock<Vec<Arc<dyn ResultCallback>>>,
    wake: Notify,
    metrics: Arc<dyn MetricsSink>,
}

impl Inner {
    fn settings(&self) -> SchedulerConfig {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn headers(&self) -> Headers {
        self.headers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn deliver(&self, report: TaskReport) {
        let callbacks = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for callback in &callbacks {
            callback.on_result(report.clone());
        }
    }

    fn emit_busy(&self) {
        self.metrics
            .gauge(names::WORKERS_BUSY, self.workers.busy() as f64, &[]);
    }

    fn evict_idle(&self, now: Instant, idle: Duration) {
        let buckets = self.scheduler.budget().evict_idle(now, idle);
        let circuits = self.scheduler.circuits().evict_idle(now, idle);
        if buckets + circuits > 0 {
            tracing::debug!(
                "Evicted {} idle bucket(s) and {} idle circuit(s)",
                buckets,
                circuits
            );
        }
    }
}

/// Crawl orchestration core
///
/// Cheap to clone; all clones drive the same frontier and tables.
///
/// # Example
///
/// ```no_run
/// use sumi_conductor::{Config, HttpFetcher, Orchestrator, TaskReport};
/// use sumi_conductor::metrics::TracingMetrics;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::default();
/// let fetcher = HttpFetcher::new(config.user_agent.clone(), &config.fetch);
/// let orchestrator = Orchestrator::new(&config, Arc::new(fetcher), Arc::new(TracingMetrics))?;
/// orchestrator.on_result(|report: TaskReport| println!("{} {}", report.url, report.final_state));
/// orchestrator.submit("https://example.com/", 0)?;
/// orchestrator.run_until_idle().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Builds an orchestrator from a configuration
    ///
    /// # Errors
    ///
    /// Any validation error, an invalid proxy address, or an empty proxy pool
    /// with direct fetching disabled. A `[[domain]]` rule with an invalid rate
    /// is not fatal; that domain is disabled and the problem logged.
    pub fn new(
        config: &Config,
        fetcher: Arc<dyn Fetcher>,
        metrics: Arc<dyn MetricsSink>,
    ) -> ConfigResult<Self> {
        validate(config)?;

        let (budget, problems) =
            DomainBudget::from_config(&config.budget, &config.domains, metrics.clone())?;
        for problem in &problems {
            tracing::error!("{}", problem);
        }
        let circuits = CircuitBreaker::new(&config.circuit, metrics.clone());
        let proxies = ProxyRotator::from_config(&config.proxy, metrics.clone())?;
        let frontier = Frontier::new(metrics.clone());
        let scheduler = Scheduler::new(
            Arc::new(frontier),
            Arc::new(budget),
            Arc::new(circuits),
            Arc::new(proxies),
            RetryPolicy::from_config(&config.retry),
            metrics.clone(),
        );

        tracing::info!(
            "Orchestrator ready: {} worker(s), {} proxy endpoint(s){}",
            config.scheduler.workers,
            scheduler.proxies().len(),
            if scheduler.proxies().is_direct() {
                " (direct)"
            } else {
                ""
            }
        );

        Ok(Self {
            inner: Arc::new(Inner {
                scheduler,
                fetcher,
                workers: WorkerPool::new(config.scheduler.workers as usize),
                settings: RwLock::new(config.scheduler.clone()),
                headers: RwLock::new(config.fetch.headers.clone()),
                callbacks: RwLock::new(Vec::new()),
                wake: Notify::new(),
                metrics,
            }),
        })
    }

    /// Registers a callback for terminal task reports
    pub fn on_result(&self, callback: impl ResultCallback + 'static) {
        self.inner
            .callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(callback));
    }

    /// Submits a URL for crawling
    ///
    /// # Arguments
    ///
    /// * `url` - Absolute http(s) URL; normalized before deduplication
    /// * `priority` - Lower is more urgent
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - A new task was created
    /// * `Ok(false)` - The URL is already known (a duplicate is not an error)
    /// * `Err(InvalidTask)` - The URL is malformed
    pub fn submit(&self, url: &str, priority: u32) -> crate::Result<bool> {
        let added = self.inner.scheduler.frontier().add(url, priority)?;
        self.after_submit(added);
        Ok(added)
    }

    /// Submits a URL, re-opening it if it already finished
    pub fn submit_recrawl(&self, url: &str, priority: u32) -> crate::Result<bool> {
        let added = self.inner.scheduler.frontier().add_recrawl(url, priority)?;
        self.after_submit(added);
        Ok(added)
    }

    /// Submits seed entries, logging and skipping invalid ones
    ///
    /// # Returns
    ///
    /// Number of new tasks created
    pub fn submit_seeds(&self, seeds: &[SeedEntry]) -> usize {
        seeds
            .iter()
            .filter(|seed| match self.submit(&seed.url, seed.priority) {
                Ok(added) => added,
                Err(e) => {
                    tracing::warn!("Skipping seed: {}", e);
                    false
                }
            })
            .count()
    }

    fn after_submit(&self, added: bool) {
        let name = if added {
            names::TASK_SUBMITTED
        } else {
            names::TASK_DUPLICATE
        };
        self.inner.metrics.increment(name, &[]);
        if added {
            self.inner.wake.notify_one();
        }
    }

    /// Stops all dispatch to `domain` until [`resume_domain`](Self::resume_domain)
    pub fn pause_domain(&self, domain: &str) {
        self.inner
            .scheduler
            .circuits()
            .force_open(&domain.to_lowercase());
    }

    pub fn resume_domain(&self, domain: &str) {
        self.inner
            .scheduler
            .circuits()
            .resume(&domain.to_lowercase());
        self.inner.wake.notify_one();
    }

    pub fn is_paused(&self, domain: &str) -> bool {
        self.inner
            .scheduler
            .circuits()
            .is_paused(&domain.to_lowercase())
    }

    /// Abandons a pending or in-flight task
    ///
    /// An in-flight fetch keeps running; its result is discarded. Registered
    /// callbacks receive the Abandoned report right away.
    ///
    /// # Returns
    ///
    /// `Ok(false)` if the task is unknown or already terminal
    pub fn abandon(&self, url: &str) -> crate::Result<bool> {
        let (url, _) = task_identity(url)?;
        let frontier = self.inner.scheduler.frontier();
        if !frontier.abandon(url.as_str()) {
            return Ok(false);
        }
        tracing::info!("Abandoned {} on request", url);

        if let Some(task) = frontier.get(url.as_str()) {
            self.inner.metrics.increment(
                names::TASK_ABANDONED,
                &[("domain", &task.domain), ("kind", "operator")],
            );
            self.inner.deliver(TaskReport::from_task(&task, None));
        }
        self.inner.wake.notify_one();
        Ok(true)
    }

    /// Forgets a terminal task so its URL can be submitted afresh
    ///
    /// # Returns
    ///
    /// The final report of the removed task, or `None` if the URL is unknown
    /// or still active
    pub fn acknowledge(&self, url: &str) -> crate::Result<Option<TaskReport>> {
        let (url, _) = task_identity(url)?;
        Ok(self
            .inner
            .scheduler
            .frontier()
            .acknowledge(url.as_str())
            .map(|task| TaskReport::from_task(&task, None)))
    }

    /// Applies a new configuration to the running orchestrator
    ///
    /// Budgets, circuit settings, retry policy, proxy pool, headers and loop
    /// timing take effect immediately. The worker count is fixed at startup.
    ///
    /// # Returns
    ///
    /// * `Ok(problems)` - Applied; `problems` lists rules that disabled a
    ///   domain and proxy entries that were skipped
    /// * `Err(e)` - Rejected; nothing changed
    pub fn reload(&self, config: &Config) -> ConfigResult<Vec<ConfigError>> {
        match validate(config) {
            // Proxy problems are handled by the pool, which keeps the old one
            Ok(()) | Err(ConfigError::InvalidProxy { .. }) | Err(ConfigError::NoProxies) => {}
            Err(e) => {
                tracing::error!("Configuration reload rejected: {}", e);
                return Err(e);
            }
        }

        let inner = &self.inner;
        let scheduler = &inner.scheduler;
        let mut problems = Vec::new();

        scheduler.set_policy(RetryPolicy::from_config(&config.retry));
        scheduler.circuits().set_config(&config.circuit);
        if let Err(e) = scheduler
            .budget()
            .set_default(config.budget.default_rate, config.budget.default_burst)
        {
            problems.push(e);
        }
        problems.extend(scheduler.budget().set_rules(&config.domains));
        problems.extend(scheduler.proxies().reload(&config.proxy));

        *inner.headers.write().unwrap_or_else(|e| e.into_inner()) = config.fetch.headers.clone();
        {
            let mut settings = inner.settings.write().unwrap_or_else(|e| e.into_inner());
            if config.scheduler.workers as usize != inner.workers.size() {
                tracing::warn!(
                    "Worker count change ({} -> {}) takes effect on restart",
                    inner.workers.size(),
                    config.scheduler.workers
                );
            }
            let workers = settings.workers;
            *settings = SchedulerConfig {
                workers,
                ..config.scheduler.clone()
            };
        }

        for problem in &problems {
            tracing::error!("{}", problem);
        }
        tracing::info!(
            "Configuration reloaded ({} problem(s))",
            problems.len()
        );
        inner.wake.notify_one();
        Ok(problems)
    }

    /// Runs the crawl loop until `shutdown` turns true
    ///
    /// Dispatch stops as soon as shutdown is signalled; fetches already
    /// running finish and report before this returns.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        tracing::info!("Crawl loop started");
        self.drive(Some(shutdown), false).await;
        tracing::info!("Crawl loop stopped");
    }

    /// Runs the crawl loop until nothing is pending or in flight
    ///
    /// Tasks held back forever (a disabled or paused domain, no usable proxy)
    /// keep this from returning.
    pub async fn run_until_idle(&self) {
        self.drive(None, true).await;
        tracing::info!("Frontier drained");
    }

    async fn drive(&self, mut shutdown: Option<watch::Receiver<bool>>, until_idle: bool) {
        let inner = &self.inner;
        let mut last_sweep = Instant::now();

        loop {
            if is_shutdown(&shutdown) {
                break;
            }

            let settings = inner.settings();
            let now = Instant::now();
            if now.duration_since(last_sweep) >= settings.idle_eviction().min(EVICTION_SWEEP) {
                inner.evict_idle(now, settings.idle_eviction());
                last_sweep = now;
            }

            let Some(permit) = inner.workers.try_claim() else {
                // All workers busy: wait for one to finish
                tokio::select! {
                    _ = inner.wake.notified() => {}
                    _ = wait_for_shutdown(&mut shutdown) => break,
                }
                continue;
            };

            match inner.scheduler.next(now) {
                Decision::Dispatch(dispatch) => {
                    let worker = self.clone();
                    tokio::spawn(async move { worker.execute(dispatch, permit).await });
                }
                Decision::Idle { wake_in } => {
                    drop(permit);
                    if until_idle && inner.scheduler.frontier().is_idle() {
                        break;
                    }
                    let tick = settings.idle_tick();
                    let sleep_for = wake_in.map_or(tick, |wait| wait.min(tick));
                    tokio::select! {
                        _ = tokio::time::sleep(sleep_for) => {}
                        _ = inner.wake.notified() => {}
                        _ = wait_for_shutdown(&mut shutdown) => break,
                    }
                }
            }
        }

        inner.workers.drain().await;
    }

    async fn execute(&self, dispatch: Dispatch, permit: OwnedSemaphorePermit) {
        let inner = &self.inner;
        inner.emit_busy();

        let Dispatch { task, admission } = dispatch;
        let proxy = admission.proxy.as_ref().map(|lease| lease.address().clone());
        let (result, latency) =
            fetch_once(inner.fetcher.clone(), &task.url, proxy, inner.headers()).await;

        let report =
            inner
                .scheduler
                .on_outcome(&task, admission, result, latency, Instant::now());
        if let Some(report) = report {
            inner.deliver(report);
        }

        // Released only after the frontier and callbacks saw the outcome
        drop(permit);
        inner.emit_busy();
        inner.wake.notify_one();
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn frontier(&self) -> &Arc<Frontier> {
        self.inner.scheduler.frontier()
    }

    pub fn metrics(&self) -> Arc<dyn MetricsSink> {
        self.inner.metrics.clone()
    }

    pub fn workers(&self) -> usize {
        self.inner.workers.size()
    }
}

fn is_shutdown(shutdown: &Option<watch::Receiver<bool>>) -> bool {
    shutdown.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
}

/// Resolves once shutdown is signalled; never resolves without a receiver
/// or after the sender is gone
async fn wait_for_shutdown(shutdown: &mut Option<watch::Receiver<bool>>) {
    match shutdown {
        Some(rx) => {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
        None => std::future::pending::<()>().await,
    }
}
