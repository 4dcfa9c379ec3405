//! Integration tests for the orchestrator
//!
//! These tests drive the full crawl loop against a scripted in-process
//! fetcher, so every outcome (and its timing) is under the test's control.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sumi_conductor::config::{Config, DomainRule};
use sumi_conductor::crawler::Headers;
use sumi_conductor::metrics::{names, InMemoryMetrics};
use sumi_conductor::proxy::ProxyAddress;
use sumi_conductor::{
    ErrorKind, FetchError, FetchResponse, Fetcher, Orchestrator, TaskReport, TaskState,
};
use tokio::sync::watch;

type Outcome = Result<FetchResponse, FetchError>;

/// One recorded fetch call
#[derive(Debug, Clone)]
struct Call {
    url: String,
    proxy: Option<String>,
    headers: Headers,
    at: Instant,
}

/// Decides the outcome of a call from the call and its 0-based index for that URL
type Script = dyn Fn(&Call, usize) -> Outcome + Send + Sync;

struct ScriptedFetcher {
    script: Box<Script>,
    delay: Duration,
    calls: Mutex<Vec<Call>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedFetcher {
    fn new(script: impl Fn(&Call, usize) -> Outcome + Send + Sync + 'static) -> Arc<Self> {
        Self::with_delay(Duration::ZERO, script)
    }

    fn with_delay(
        delay: Duration,
        script: impl Fn(&Call, usize) -> Outcome + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            delay,
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_to(&self, host: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.url.contains(&format!("//{}/", host)))
            .count()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str, proxy: Option<&ProxyAddress>, headers: &Headers) -> Outcome {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let call = Call {
            url: url.to_string(),
            proxy: proxy.map(|p| p.host().to_string()),
            headers: headers.clone(),
            at: Instant::now(),
        };
        let nth = {
            let mut calls = self.calls.lock().unwrap();
            let nth = calls.iter().filter(|c| c.url == call.url).count();
            calls.push(call.clone());
            nth
        };

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        (self.script)(&call, nth)
    }
}

fn ok(url: &str) -> Outcome {
    Ok(FetchResponse {
        final_url: url.to_string(),
        status_code: 200,
        content_type: Some("text/html".to_string()),
        body: "<html></html>".to_string(),
    })
}

fn transient() -> Outcome {
    Err(FetchError::TransientNetwork("connection reset".to_string()))
}

/// Fast, permissive configuration: generous budgets, millisecond backoff
fn create_test_config() -> Config {
    let mut config = Config::default();
    config.scheduler.workers = 4;
    config.scheduler.idle_tick_ms = 2;
    config.budget.default_rate = 1000.0;
    config.budget.default_burst = 1000;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config
}

struct Harness {
    orchestrator: Orchestrator,
    metrics: Arc<InMemoryMetrics>,
    reports: Arc<Mutex<Vec<TaskReport>>>,
}

impl Harness {
    fn new(config: &Config, fetcher: Arc<ScriptedFetcher>) -> Self {
        let metrics = Arc::new(InMemoryMetrics::new());
        let orchestrator = Orchestrator::new(config, fetcher, metrics.clone())
            .expect("test config should be valid");
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        orchestrator.on_result(move |report: TaskReport| sink.lock().unwrap().push(report));
        Self {
            orchestrator,
            metrics,
            reports,
        }
    }

    async fn run_until_idle(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.orchestrator.run_until_idle())
            .await
            .expect("crawl did not drain in time");
    }

    fn reports(&self) -> Vec<TaskReport> {
        self.reports.lock().unwrap().clone()
    }

    fn report_for(&self, url: &str) -> TaskReport {
        self.reports()
            .into_iter()
            .find(|r| r.url == url)
            .unwrap_or_else(|| panic!("no report for {}", url))
    }
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

#[tokio::test]
async fn test_duplicate_submission_fetches_once() {
    let fetcher = ScriptedFetcher::new(|call, _| ok(&call.url));
    let harness = Harness::new(&create_test_config(), fetcher.clone());

    assert!(harness.orchestrator.submit("https://a.test/page", 1).unwrap());
    assert!(!harness.orchestrator.submit("https://a.test/page", 1).unwrap());
    assert_eq!(harness.orchestrator.frontier().pending_len(), 1);

    harness.run_until_idle().await;

    assert_eq!(fetcher.calls().len(), 1);
    assert_eq!(harness.reports().len(), 1);
    assert_eq!(harness.reports()[0].final_state, TaskState::Done);
}

#[tokio::test]
async fn test_domain_rate_spaces_dispatches() {
    let mut config = create_test_config();
    config.domains = vec![DomainRule {
        pattern: "slow.test".to_string(),
        rate: 5.0,
        burst: 1,
    }];
    let fetcher = ScriptedFetcher::new(|call, _| ok(&call.url));
    let harness = Harness::new(&config, fetcher.clone());

    for path in ["a", "b", "c"] {
        harness
            .orchestrator
            .submit(&format!("https://slow.test/{}", path), 0)
            .unwrap();
    }
    harness.run_until_idle().await;

    let calls = fetcher.calls();
    assert_eq!(calls.len(), 3);
    for pair in calls.windows(2) {
        let gap = pair[1].at.duration_since(pair[0].at);
        assert!(gap >= Duration::from_millis(180), "gap was {:?}", gap);
    }
    assert_eq!(harness.metrics.snapshot().counter_total(names::TASK_DONE), 3);
}

#[tokio::test]
async fn test_circuit_opens_then_probe_recovers() {
    let mut config = create_test_config();
    config.retry.max_attempts = 10;
    config.circuit.threshold = 2;
    config.circuit.open_duration_ms = 200;
    // fails twice, then recovers
    let fetcher = ScriptedFetcher::new(|call, nth| if nth < 2 { transient() } else { ok(&call.url) });
    let harness = Harness::new(&config, fetcher.clone());

    harness
        .orchestrator
        .submit("https://flaky.test/", 0)
        .unwrap();
    harness.run_until_idle().await;

    let calls = fetcher.calls();
    assert_eq!(calls.len(), 3);
    // the third call is the half-open probe, sent only after the open period
    let gap = calls[2].at.duration_since(calls[1].at);
    assert!(gap >= Duration::from_millis(200), "probe came after {:?}", gap);

    let report = harness.report_for("https://flaky.test/");
    assert_eq!(report.final_state, TaskState::Done);
    assert_eq!(report.attempts, 3);

    let snapshot = harness.metrics.snapshot();
    assert_eq!(snapshot.counter_total(names::CIRCUIT_OPENED), 1);
    assert_eq!(snapshot.counter_total(names::CIRCUIT_PROBE), 1);
    assert_eq!(snapshot.counter_total(names::CIRCUIT_CLOSED), 1);
}

#[tokio::test]
async fn test_always_failing_task_is_abandoned_after_max_attempts() {
    let mut config = create_test_config();
    config.retry.max_attempts = 3;
    let fetcher = ScriptedFetcher::new(|_, _| transient());
    let harness = Harness::new(&config, fetcher.clone());

    harness.orchestrator.submit("https://down.test/x", 0).unwrap();
    harness.run_until_idle().await;

    assert_eq!(fetcher.calls().len(), 3);
    let report = harness.report_for("https://down.test/x");
    assert_eq!(report.final_state, TaskState::Abandoned);
    assert_eq!(report.attempts, 3);
    assert_eq!(report.last_error_kind, Some(ErrorKind::TransientNetwork));
    assert!(report.response.is_none());
}

#[tokio::test]
async fn test_proxy_pool_degrades_when_all_cooling_down() {
    let mut config = create_test_config();
    config.proxy.direct = false;
    config.proxy.failure_threshold = 1;
    config.proxy.endpoints = vec!["p1.test:8080".to_string(), "p2.test:8080".to_string()];
    config.retry.max_proxy_retries = 3;
    let fetcher = ScriptedFetcher::new(|_, _| Err(FetchError::Proxy("refused".to_string())));
    let harness = Harness::new(&config, fetcher.clone());

    harness.orchestrator.submit("https://a.test/", 0).unwrap();
    harness.run_until_idle().await;

    let calls = fetcher.calls();
    // dispatch kept going through cooling-down endpoints instead of stalling
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[0].proxy.as_deref(), Some("p1.test"));
    assert_eq!(calls[1].proxy.as_deref(), Some("p2.test"));
    assert!(calls.iter().all(|c| c.proxy.is_some()));

    let report = harness.report_for("https://a.test/");
    assert_eq!(report.final_state, TaskState::Abandoned);
    assert_eq!(report.last_error_kind, Some(ErrorKind::Proxy));
    assert_eq!(report.attempts, 0);

    let stats = harness.orchestrator.scheduler().proxies().stats();
    assert_eq!(stats.len(), 2);
    assert!(stats.iter().all(|s| s.cooling_down));
}

#[tokio::test]
async fn test_proxy_failure_retries_through_another_proxy() {
    let mut config = create_test_config();
    config.proxy.direct = false;
    config.proxy.endpoints = vec!["p1.test:8080".to_string(), "p2.test:8080".to_string()];
    let fetcher = ScriptedFetcher::new(|call, _| match call.proxy.as_deref() {
        Some("p1.test") => Err(FetchError::Proxy("refused".to_string())),
        _ => ok(&call.url),
    });
    let harness = Harness::new(&config, fetcher.clone());

    harness.orchestrator.submit("https://a.test/", 0).unwrap();
    harness.run_until_idle().await;

    let proxies: Vec<_> = fetcher.calls().into_iter().map(|c| c.proxy).collect();
    assert_eq!(
        proxies,
        vec![Some("p1.test".to_string()), Some("p2.test".to_string())]
    );
    let report = harness.report_for("https://a.test/");
    assert_eq!(report.final_state, TaskState::Done);
    // the proxy failure was not charged
    assert_eq!(report.attempts, 1);
}

#[tokio::test]
async fn test_permanent_and_rejected_are_not_retried() {
    let fetcher = ScriptedFetcher::new(|call, _| {
        if call.url.ends_with("/forbidden") {
            Err(FetchError::PermanentBlock("HTTP 403".to_string()))
        } else {
            Err(FetchError::Rejected("HTTP 404".to_string()))
        }
    });
    let harness = Harness::new(&create_test_config(), fetcher.clone());

    harness
        .orchestrator
        .submit("https://a.test/forbidden", 0)
        .unwrap();
    harness.orchestrator.submit("https://b.test/missing", 0).unwrap();
    harness.run_until_idle().await;

    assert_eq!(fetcher.calls().len(), 2);
    assert_eq!(
        harness.report_for("https://a.test/forbidden").last_error_kind,
        Some(ErrorKind::PermanentBlock)
    );
    assert_eq!(
        harness.report_for("https://b.test/missing").last_error_kind,
        Some(ErrorKind::Rejected)
    );
    let errors = harness
        .metrics
        .snapshot()
        .counter_by_tag(names::FETCH_ERROR, "kind");
    assert_eq!(errors.get("permanent_block"), Some(&1));
    assert_eq!(errors.get("rejected"), Some(&1));
}

#[tokio::test]
async fn test_retry_after_hint_delays_only_that_task() {
    let fetcher = ScriptedFetcher::new(|call, nth| {
        if call.url.contains("limited") && nth == 0 {
            Err(FetchError::RateLimited {
                retry_after: Some(Duration::from_millis(300)),
            })
        } else {
            ok(&call.url)
        }
    });
    let harness = Harness::new(&create_test_config(), fetcher.clone());

    harness
        .orchestrator
        .submit("https://a.test/limited", 0)
        .unwrap();
    harness.orchestrator.submit("https://a.test/other", 1).unwrap();
    harness.run_until_idle().await;

    let calls = fetcher.calls();
    let limited: Vec<_> = calls.iter().filter(|c| c.url.contains("limited")).collect();
    assert_eq!(limited.len(), 2);
    let gap = limited[1].at.duration_since(limited[0].at);
    assert!(gap >= Duration::from_millis(300), "retried after {:?}", gap);

    // the other task on the same domain was not held back by the hint
    let other = calls.iter().find(|c| c.url.contains("other")).unwrap();
    assert!(other.at < limited[1].at);
    assert_eq!(harness.reports().len(), 2);
}

#[tokio::test]
async fn test_worker_pool_bounds_concurrency() {
    let mut config = create_test_config();
    config.scheduler.workers = 2;
    let fetcher = ScriptedFetcher::with_delay(Duration::from_millis(30), |call, _| ok(&call.url));
    let harness = Harness::new(&config, fetcher.clone());

    for i in 0..6 {
        harness
            .orchestrator
            .submit(&format!("https://site{}.test/", i), 0)
            .unwrap();
    }
    harness.run_until_idle().await;

    assert_eq!(fetcher.calls().len(), 6);
    let max_active = fetcher.max_active.load(Ordering::SeqCst);
    assert!(max_active <= 2, "{} fetches ran at once", max_active);
    assert!(max_active >= 1);
}

#[tokio::test]
async fn test_priority_order_within_domain() {
    let mut config = create_test_config();
    config.scheduler.workers = 1;
    let fetcher = ScriptedFetcher::new(|call, _| ok(&call.url));
    let harness = Harness::new(&config, fetcher.clone());

    for (path, priority) in [("low", 5), ("high", 1), ("mid", 3), ("high-later", 1)] {
        harness
            .orchestrator
            .submit(&format!("https://a.test/{}", path), priority)
            .unwrap();
    }
    harness.run_until_idle().await;

    let order: Vec<_> = fetcher.calls().into_iter().map(|c| c.url).collect();
    assert_eq!(
        order,
        vec![
            "https://a.test/high",
            "https://a.test/high-later",
            "https://a.test/mid",
            "https://a.test/low",
        ]
    );
}

#[tokio::test]
async fn test_configured_headers_reach_fetcher() {
    let mut config = create_test_config();
    config
        .fetch
        .headers
        .insert("Accept-Language".to_string(), "en".to_string());
    let fetcher = ScriptedFetcher::new(|call, _| ok(&call.url));
    let harness = Harness::new(&config, fetcher.clone());

    harness.orchestrator.submit("https://a.test/", 0).unwrap();
    harness.run_until_idle().await;

    let calls = fetcher.calls();
    assert_eq!(
        calls[0].headers.get("Accept-Language").map(String::as_str),
        Some("en")
    );
}

#[tokio::test]
async fn test_paused_domain_waits_for_resume() {
    let fetcher = ScriptedFetcher::new(|call, _| ok(&call.url));
    let harness = Harness::new(&create_test_config(), fetcher.clone());
    let orchestrator = harness.orchestrator.clone();

    orchestrator.pause_domain("paused.test");
    orchestrator.submit("https://paused.test/", 0).unwrap();
    orchestrator.submit("https://open.test/", 0).unwrap();

    let (tx, rx) = watch::channel(false);
    let runner = orchestrator.clone();
    let handle = tokio::spawn(async move { runner.run(rx).await });

    wait_until("open.test report", || harness.reports().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fetcher.calls_to("paused.test"), 0);
    assert_eq!(orchestrator.frontier().pending_len(), 1);

    orchestrator.resume_domain("paused.test");
    wait_until("paused.test report", || harness.reports().len() == 2).await;
    assert_eq!(
        harness.report_for("https://paused.test/").final_state,
        TaskState::Done
    );

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("run did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_abandon_in_flight_discards_result() {
    let fetcher = ScriptedFetcher::with_delay(Duration::from_millis(200), |call, _| ok(&call.url));
    let harness = Harness::new(&create_test_config(), fetcher.clone());
    let orchestrator = harness.orchestrator.clone();
    orchestrator.submit("https://slow.test/", 0).unwrap();

    let (tx, rx) = watch::channel(false);
    let runner = orchestrator.clone();
    let handle = tokio::spawn(async move { runner.run(rx).await });

    wait_until("fetch to start", || fetcher.calls().len() == 1).await;
    assert!(orchestrator.abandon("https://slow.test/").unwrap());

    let metrics = harness.metrics.clone();
    wait_until("late result", || {
        metrics.snapshot().counter_total(names::TASK_DISCARDED) == 1
    })
    .await;

    let reports = harness.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].final_state, TaskState::Abandoned);
    assert_eq!(
        orchestrator.frontier().get("https://slow.test/").unwrap().state,
        TaskState::Abandoned
    );

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("run did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_every_task_reported_exactly_once() {
    let fetcher = ScriptedFetcher::new(|call, nth| {
        let n: usize = call
            .url
            .rsplit('/')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        match n % 4 {
            0 => ok(&call.url),
            1 if nth == 0 => transient(),
            1 => ok(&call.url),
            2 => Err(FetchError::Rejected("HTTP 410".to_string())),
            _ => transient(),
        }
    });
    let mut config = create_test_config();
    // keep every domain's circuit closed
    config.circuit.threshold = 100;
    let harness = Harness::new(&config, fetcher.clone());

    let mut expected = HashMap::new();
    for n in 0..20 {
        let url = format!("https://d{}.test/{}", n % 5, n);
        harness.orchestrator.submit(&url, n % 3).unwrap();
        let state = match n % 4 {
            0 | 1 => TaskState::Done,
            _ => TaskState::Abandoned,
        };
        expected.insert(url, state);
    }
    harness.run_until_idle().await;

    let reports = harness.reports();
    assert_eq!(reports.len(), 20);
    for report in reports {
        assert_eq!(Some(&report.final_state), expected.get(&report.url), "{}", report.url);
    }
    assert!(harness.orchestrator.frontier().is_idle());
}

#[tokio::test]
async fn test_acknowledging_from_callback_drops_terminal_records() {
    let fetcher = ScriptedFetcher::new(|call, _| {
        if call.url.ends_with("/gone") {
            Err(FetchError::Rejected("HTTP 410".to_string()))
        } else {
            ok(&call.url)
        }
    });
    let harness = Harness::new(&create_test_config(), fetcher.clone());
    let frontier = harness.orchestrator.frontier().clone();
    harness.orchestrator.on_result(move |report: TaskReport| {
        frontier.acknowledge(&report.url);
    });

    for path in ["a", "b", "gone"] {
        harness
            .orchestrator
            .submit(&format!("https://a.test/{}", path), 0)
            .unwrap();
    }
    harness.run_until_idle().await;

    let frontier = harness.orchestrator.frontier().clone();
    wait_until("records acknowledged", || frontier.terminal_len() == 0).await;
    assert_eq!(harness.reports().len(), 3);

    // an acknowledged URL is new again
    assert!(harness.orchestrator.submit("https://a.test/a", 0).unwrap());
}

#[tokio::test]
async fn test_reload_applies_new_budget() {
    let fetcher = ScriptedFetcher::new(|call, _| ok(&call.url));
    let harness = Harness::new(&create_test_config(), fetcher.clone());

    let mut config = create_test_config();
    config.domains = vec![DomainRule {
        pattern: "*.test".to_string(),
        rate: 5.0,
        burst: 1,
    }];
    let problems = harness.orchestrator.reload(&config).unwrap();
    assert!(problems.is_empty());

    harness.orchestrator.submit("https://a.test/1", 0).unwrap();
    harness.orchestrator.submit("https://a.test/2", 0).unwrap();
    harness.run_until_idle().await;

    let calls = fetcher.calls();
    let gap = calls[1].at.duration_since(calls[0].at);
    assert!(gap >= Duration::from_millis(180), "gap was {:?}", gap);
}
