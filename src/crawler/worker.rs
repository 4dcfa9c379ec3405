//! Fixed-size worker pool
//!
//! A worker slot is a semaphore permit. The crawl loop claims a slot before
//! asking the scheduler for work, so a full pool simply stops dispatch.

use super::fetcher::{FetchResponse, Fetcher, Headers};
use crate::proxy::ProxyAddress;
use crate::retry::FetchError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded set of concurrent fetch slots
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots currently running a fetch
    pub fn busy(&self) -> usize {
        self.size - self.semaphore.available_permits().min(self.size)
    }

    /// Claims a free slot without waiting
    pub fn try_claim(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Waits until every running fetch has released its slot
    pub async fn drain(&self) {
        if let Ok(all) = self.semaphore.acquire_many(self.size as u32).await {
            drop(all);
        }
    }
}

/// Runs one fetch attempt on its own task
///
/// A panicking fetcher is reported as a transient failure so the task is
/// never left in flight.
///
/// # Returns
///
/// The fetch outcome and its wall time
pub async fn fetch_once(
    fetcher: Arc<dyn Fetcher>,
    url: &str,
    proxy: Option<ProxyAddress>,
    headers: Headers,
) -> (Result<FetchResponse, FetchError>, Duration) {
    let started = Instant::now();
    let target = url.to_string();
    let handle =
        tokio::spawn(async move { fetcher.fetch(&target, proxy.as_ref(), &headers).await });

    let result = match handle.await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("Fetcher task for {} failed: {}", url, e);
            Err(FetchError::TransientNetwork(format!("fetcher task failed: {}", e)))
        }
    };
    (result, started.elapsed())
}
