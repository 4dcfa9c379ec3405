//! End-of-run statistics
//!
//! This module collects counters from an in-memory metrics snapshot, the
//! frontier and the proxy pool, and renders them for the terminal.

use crate::frontier::Frontier;
use crate::metrics::{names, HistogramSummary, MetricsSnapshot};
use crate::proxy::{ProxyRotator, ProxyStats};
use std::collections::BTreeMap;
use std::fmt::Write;

/// Crawl statistics summary
#[derive(Debug, Clone, Default)]
pub struct CrawlStatistics {
    /// New tasks accepted
    pub submitted: u64,

    /// Submissions that matched an existing task
    pub duplicates: u64,

    pub dispatched: u64,

    pub retried: u64,

    pub done: u64,

    pub abandoned: u64,

    /// Results that arrived after their task was abandoned
    pub discarded: u64,

    /// Tasks still waiting when the summary was taken
    pub pending: usize,

    pub in_flight: usize,

    /// Fetch errors by kind
    pub errors_by_kind: BTreeMap<String, u64>,

    /// Circuit trips by domain
    pub circuits_opened: BTreeMap<String, u64>,

    /// Latency of successful fetches, in milliseconds
    pub latency_ms: Option<HistogramSummary>,

    pub proxies: Vec<ProxyStats>,
}

/// Gathers statistics for the current run
///
/// # Arguments
///
/// * `snapshot` - Counters recorded by an in-memory metrics sink
/// * `frontier` - Source of the pending and in-flight counts
/// * `proxies` - Source of per-endpoint health
pub fn collect_statistics(
    snapshot: &MetricsSnapshot,
    frontier: &Frontier,
    proxies: &ProxyRotator,
) -> CrawlStatistics {
    CrawlStatistics {
        submitted: snapshot.counter_total(names::TASK_SUBMITTED),
        duplicates: snapshot.counter_total(names::TASK_DUPLICATE),
        dispatched: snapshot.counter_total(names::TASK_DISPATCHED),
        retried: snapshot.counter_total(names::TASK_RETRIED),
        done: snapshot.counter_total(names::TASK_DONE),
        abandoned: snapshot.counter_total(names::TASK_ABANDONED),
        discarded: snapshot.counter_total(names::TASK_DISCARDED),
        pending: frontier.pending_len(),
        in_flight: frontier.in_flight_len(),
        errors_by_kind: snapshot.counter_by_tag(names::FETCH_ERROR, "kind"),
        circuits_opened: snapshot.counter_by_tag(names::CIRCUIT_OPENED, "domain"),
        latency_ms: snapshot.histogram_total(names::FETCH_LATENCY_MS),
        proxies: proxies.stats(),
    }
}

impl CrawlStatistics {
    /// Share of finished tasks that ended Done, in percent
    pub fn success_rate(&self) -> f64 {
        let finished = self.done + self.abandoned;
        if finished > 0 {
            (self.done as f64 / finished as f64) * 100.0
        } else {
            0.0
        }
    }
}

/// Renders statistics as the text printed at the end of a run
pub fn format_statistics(stats: &CrawlStatistics) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail
    let _ = write_statistics(&mut out, stats);
    out
}

fn write_statistics(out: &mut String, stats: &CrawlStatistics) -> std::fmt::Result {
    writeln!(out, "=== Crawl Statistics ===\n")?;

    writeln!(out, "Tasks:")?;
    writeln!(out, "  Submitted: {}", stats.submitted)?;
    writeln!(out, "  Duplicates ignored: {}", stats.duplicates)?;
    writeln!(out, "  Dispatches: {}", stats.dispatched)?;
    writeln!(out, "  Retries scheduled: {}", stats.retried)?;
    writeln!(out, "  Done: {}", stats.done)?;
    writeln!(out, "  Abandoned: {}", stats.abandoned)?;
    if stats.discarded > 0 {
        writeln!(out, "  Late results discarded: {}", stats.discarded)?;
    }
    if stats.pending + stats.in_flight > 0 {
        writeln!(
            out,
            "  Unfinished: {} pending, {} in flight",
            stats.pending, stats.in_flight
        )?;
    }
    writeln!(out)?;

    if let Some(latency) = &stats.latency_ms {
        writeln!(
            out,
            "Fetch latency: mean {:.0} ms, min {:.0} ms, max {:.0} ms ({} fetches)",
            latency.mean(),
            latency.min,
            latency.max,
            latency.count
        )?;
        writeln!(out)?;
    }

    if !stats.errors_by_kind.is_empty() {
        writeln!(out, "Errors by Kind:")?;
        let mut errors: Vec<_> = stats.errors_by_kind.iter().collect();
        errors.sort_by(|a, b| b.1.cmp(a.1));
        for (kind, count) in errors {
            writeln!(out, "  {}: {}", kind, count)?;
        }
        writeln!(out)?;
    }

    if !stats.circuits_opened.is_empty() {
        writeln!(out, "Circuits Opened ({}):", stats.circuits_opened.len())?;
        for (domain, count) in &stats.circuits_opened {
            writeln!(out, "  - {} ({}x)", domain, count)?;
        }
        writeln!(out)?;
    }

    if !stats.proxies.is_empty() {
        writeln!(out, "Proxies:")?;
        for proxy in &stats.proxies {
            writeln!(
                out,
                "  {}: {} ok / {} failed ({:.0}%){}",
                proxy.id,
                proxy.successes,
                proxy.failures,
                proxy.success_rate * 100.0,
                if proxy.cooling_down {
                    ", cooling down"
                } else {
                    ""
                }
            )?;
        }
        writeln!(out)?;
    }

    writeln!(
        out,
        "Success Rate: {:.1}% ({} / {} finished tasks done)",
        stats.success_rate(),
        stats.done,
        stats.done + stats.abandoned
    )
}

/// Prints statistics to stdout
pub fn print_statistics(stats: &CrawlStatistics) {
    print!("{}", format_statistics(stats));
}
