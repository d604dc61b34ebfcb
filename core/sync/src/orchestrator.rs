//! Parallel fetch orchestrator.
//!
//! One cycle spawns a worker per dataset kind. Each worker performs exactly
//! one fetch and reports a [`SyncResult`] over its own oneshot channel. The
//! orchestrator waits for all three reports (or the deadline) before
//! returning, then reaps every worker.

use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use clientsync_common::{DatasetKind, ErrorCategory, PerDataset, Result};
use clientsync_remote::RemoteSource;

use crate::state::{CycleOutcome, FetchFailure, SyncResult};

/// Default bound on the join barrier.
pub const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(120);

/// Fans one fetch per dataset out to isolated tasks and joins them.
pub struct FetchOrchestrator<S: RemoteSource + ?Sized> {
    source: Arc<S>,
    worker_timeout: Duration,
}

impl<S: RemoteSource + ?Sized + 'static> FetchOrchestrator<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self {
            source,
            worker_timeout: DEFAULT_WORKER_TIMEOUT,
        }
    }

    /// Set the bound on how long the join barrier waits for reports.
    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    /// Fetch all three datasets in parallel.
    ///
    /// Every kind is accounted for in the returned outcome: a worker that
    /// fails, panics, or does not report before the deadline shows up as a
    /// tagged failure. No worker outlives this call.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        // Dropping the set aborts whatever is still running, so an early
        // return or a cancelled caller cannot leak workers.
        let mut workers = JoinSet::new();
        let mut reports = Vec::with_capacity(DatasetKind::ALL.len());

        for kind in DatasetKind::ALL {
            let (tx, rx) = oneshot::channel();
            let source = self.source.clone();
            workers.spawn(async move {
                let result = fetch_isolated(source.as_ref(), kind).await;
                // The orchestrator may have given up on us already.
                let _ = tx.send(result);
            });
            reports.push((kind, rx));
        }

        // Join barrier: every receiver is awaited, none short-circuits.
        let deadline = Instant::now() + self.worker_timeout;
        let worker_timeout = self.worker_timeout;
        let results = join_all(reports.into_iter().map(|(kind, rx)| async move {
            let result = match timeout_at(deadline, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => SyncResult::Failed(FetchFailure::new(
                    ErrorCategory::Process,
                    format!("worker for {} exited without reporting", kind),
                )),
                Err(_) => SyncResult::Failed(FetchFailure::new(
                    ErrorCategory::Process,
                    format!("worker for {} did not report within {:?}", kind, worker_timeout),
                )),
            };
            (kind, result)
        }))
        .await;

        let mut slots: PerDataset<Option<SyncResult>> = PerDataset::default();
        for (kind, result) in results {
            if let SyncResult::Failed(failure) = &result {
                debug!(dataset = %kind, "Fetch failed: {}", failure);
            }
            *slots.get_mut(kind) = Some(result);
        }

        let outcome = CycleOutcome::new(slots.map(|kind, slot| {
            slot.unwrap_or_else(|| {
                SyncResult::Failed(FetchFailure::new(
                    ErrorCategory::Process,
                    format!("no report collected for {}", kind),
                ))
            })
        }));

        if !outcome.is_complete_success() {
            workers.abort_all();
        }
        reap(&mut workers).await;

        Ok(outcome)
    }
}

/// Run one fetch behind a catch-all boundary.
///
/// Errors and panics are turned into tagged failures; nothing escapes.
async fn fetch_isolated<S: RemoteSource + ?Sized>(source: &S, kind: DatasetKind) -> SyncResult {
    match AssertUnwindSafe(source.fetch(kind)).catch_unwind().await {
        Ok(Ok(payload)) => SyncResult::Fetched(payload),
        Ok(Err(err)) => SyncResult::Failed(FetchFailure::from(&err)),
        Err(panic) => SyncResult::Failed(FetchFailure::new(
            ErrorCategory::Process,
            format!("worker for {} panicked: {}", kind, panic_message(&*panic)),
        )),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Wait for every worker to finish (or acknowledge its abort).
async fn reap(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                warn!("Fetch worker panicked outside its boundary");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clientsync_common::Error;
    use clientsync_remote::MemorySource;
    use serde_json::json;

    fn source() -> Arc<MemorySource> {
        Arc::new(MemorySource::with_payloads(
            json!([{"id": 1}]),
            json!([{"id": 2}]),
            json!([{"id": 3}]),
        ))
    }

    #[tokio::test]
    async fn test_all_fetches_succeed() {
        let source = source();
        let orchestrator = FetchOrchestrator::new(source.clone());

        let outcome = orchestrator.run_cycle().await.unwrap();

        assert!(outcome.is_complete_success());
        let payloads = outcome.into_payloads().unwrap();
        assert_eq!(payloads.contacts, json!([{"id": 2}]));
        for kind in DatasetKind::ALL {
            assert_eq!(source.fetch_count(kind), 1);
        }
    }

    #[tokio::test]
    async fn test_barrier_waits_for_slowest_worker() {
        let source = source();
        source.set_delay(DatasetKind::Clients, Duration::from_millis(150));
        source.set_delay(DatasetKind::Contacts, Duration::from_millis(10));
        let orchestrator = FetchOrchestrator::new(source.clone());

        let started = std::time::Instant::now();
        let outcome = orchestrator.run_cycle().await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(150));
        assert!(outcome.is_complete_success());
        assert_eq!(source.active(), 0);
    }

    #[tokio::test]
    async fn test_fetches_run_in_parallel() {
        let source = source();
        for kind in DatasetKind::ALL {
            source.set_delay(kind, Duration::from_millis(200));
        }
        let orchestrator = FetchOrchestrator::new(source);

        let started = std::time::Instant::now();
        orchestrator.run_cycle().await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(550));
    }

    #[tokio::test]
    async fn test_failure_is_tagged() {
        let source = source();
        source.set_failure(DatasetKind::FeaturedClients, || {
            Error::Auth("401 Unauthorized".to_string())
        });
        let orchestrator = FetchOrchestrator::new(source);

        let outcome = orchestrator.run_cycle().await.unwrap();
        let failures = outcome.failures();

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, DatasetKind::FeaturedClients);
        assert_eq!(failures[0].1.category, ErrorCategory::Auth);
        assert!(matches!(outcome.results.clients, SyncResult::Fetched(_)));
    }

    #[tokio::test]
    async fn test_panicking_worker_is_contained() {
        let source = source();
        source.set_panic(DatasetKind::Contacts, "connection pool poisoned");
        let orchestrator = FetchOrchestrator::new(source);

        let outcome = orchestrator.run_cycle().await.unwrap();
        let failure = outcome.results.contacts.failure().cloned().unwrap();

        assert_eq!(failure.category, ErrorCategory::Process);
        assert!(failure.message.contains("connection pool poisoned"));
        assert!(!outcome.results.clients.is_failure());
    }

    #[tokio::test]
    async fn test_hung_worker_times_out_and_is_reaped() {
        let source = source();
        source.set_hang(DatasetKind::Clients);
        let orchestrator =
            FetchOrchestrator::new(source.clone()).with_worker_timeout(Duration::from_millis(100));

        let outcome = orchestrator.run_cycle().await.unwrap();

        let failure = outcome.results.clients.failure().cloned().unwrap();
        assert_eq!(failure.category, ErrorCategory::Process);
        assert!(outcome.results.contacts.failure().is_none());
        assert_eq!(source.active(), 0);
    }

    #[tokio::test]
    async fn test_failure_aborts_slow_siblings() {
        let source = source();
        source.set_failure(DatasetKind::Clients, || Error::Network("reset".to_string()));
        source.set_hang(DatasetKind::Contacts);
        let orchestrator =
            FetchOrchestrator::new(source.clone()).with_worker_timeout(Duration::from_millis(50));

        let outcome = orchestrator.run_cycle().await.unwrap();

        assert_eq!(outcome.failures().len(), 2);
        assert_eq!(source.active(), 0);
    }
}
