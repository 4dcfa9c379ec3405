//! Crawl loop: admission, workers and the orchestrator
//!
//! This module contains the moving parts of a crawl:
//! - The [`Fetcher`] capability and its reqwest implementation
//! - The [`Scheduler`], which admits tasks and applies fetch outcomes
//! - The [`WorkerPool`] bounding concurrent fetches
//! - The [`Orchestrator`], which owns everything and runs the loop

mod coordinator;
mod fetcher;
mod scheduler;
mod worker;

pub use coordinator::{Orchestrator, ResultCallback, TaskReport};
pub use fetcher::{build_http_client, classify_status, FetchResponse, Fetcher, Headers, HttpFetcher};
pub use scheduler::{Admission, Decision, Dispatch, Scheduler};
pub use worker::{fetch_once, WorkerPool};

pub use crate::retry::FetchError;
