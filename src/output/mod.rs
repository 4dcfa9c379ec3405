//! Output module for run summaries and per-task report lines
//!
//! This module handles:
//! - Rendering one line per finished task for the binary's stdout
//! - Collecting and printing end-of-run statistics

pub mod stats;

pub use stats::{collect_statistics, format_statistics, print_statistics, CrawlStatistics};

use crate::crawler::TaskReport;
use crate::state::TaskState;

/// Formats a finished task as a single log-friendly line
///
/// Done tasks show the status code and body size; abandoned tasks show the
/// last error.
pub fn format_report(report: &TaskReport) -> String {
    match (report.final_state, &report.response) {
        (TaskState::Done, Some(response)) => format!(
            "{} {} {} bytes={} attempts={}",
            report.final_state.as_str().to_uppercase(),
            response.status_code,
            report.url,
            response.body.len(),
            report.attempts
        ),
        _ => format!(
            "{} {} attempts={} error={}",
            report.final_state.as_str().to_uppercase(),
            report.url,
            report.attempts,
            report
                .last_error_kind
                .map(|k| k.as_str())
                .unwrap_or("none")
        ),
    }
}
