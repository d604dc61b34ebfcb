//! Core sync engine: one cycle is fetch-all-three, reconcile, persist-if-changed.

use async_trait::async_trait;
use chrono::Local;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use clientsync_common::Result;
use clientsync_remote::RemoteSource;

use crate::orchestrator::{FetchOrchestrator, DEFAULT_WORKER_TIMEOUT};
use crate::scheduler::CycleRunner;
use crate::state::{CycleReport, CycleStatus};
use crate::store::DeltaStore;

/// Configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Bound on how long one cycle waits for the fetch workers.
    pub worker_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            worker_timeout: DEFAULT_WORKER_TIMEOUT,
        }
    }
}

/// Runs sync cycles against one remote source and one snapshot directory.
///
/// Cycles are single-flight: a cycle requested while another one runs waits
/// for it to finish, so the snapshot directory only ever has one writer.
pub struct SyncEngine<S: RemoteSource + ?Sized> {
    orchestrator: FetchOrchestrator<S>,
    store: DeltaStore,
    cycle_lock: Mutex<()>,
}

impl<S: RemoteSource + ?Sized + 'static> SyncEngine<S> {
    /// Create a new sync engine.
    pub fn new(source: Arc<S>, snapshot_dir: impl AsRef<Path>, config: SyncConfig) -> Self {
        Self {
            orchestrator: FetchOrchestrator::new(source).with_worker_timeout(config.worker_timeout),
            store: DeltaStore::new(snapshot_dir),
            cycle_lock: Mutex::new(()),
        }
    }

    /// Get a reference to the delta store.
    pub fn store(&self) -> &DeltaStore {
        &self.store
    }

    /// Run one full cycle.
    ///
    /// Recoverable problems (failed fetches, failed writes) end up in the
    /// report; only setup failures are returned as errors.
    pub async fn sync_once(&self) -> Result<CycleReport> {
        let _cycle = self.cycle_lock.lock().await;
        let start = Instant::now();

        info!(source = self.orchestrator.source().name(), "Sync started");
        let outcome = self.orchestrator.run_cycle().await?;

        let payloads = match outcome.into_payloads() {
            Ok(payloads) => payloads,
            Err(failures) => {
                for (kind, failure) in &failures {
                    error!(
                        dataset = %kind,
                        category = %failure.category,
                        "Sync failed: {}",
                        failure.message
                    );
                }
                warn!("Sync aborted, nothing persisted");
                return Ok(CycleReport {
                    status: CycleStatus::Aborted { failures },
                    changed: None,
                    write_errors: Vec::new(),
                    duration: start.elapsed(),
                });
            }
        };

        self.store.ensure_dir().await?;
        let reconciliation = self.store.reconcile(&payloads, Local::now()).await;

        let status = match reconciliation.timestamp {
            None => {
                info!("No new data, sync skipped");
                CycleStatus::Skipped
            }
            Some(timestamp) => {
                info!(
                    timestamp = %timestamp,
                    files = reconciliation.written.len(),
                    "New data, saved"
                );
                CycleStatus::Saved { timestamp }
            }
        };

        Ok(CycleReport {
            status,
            changed: Some(reconciliation.changed),
            write_errors: reconciliation
                .errors
                .into_iter()
                .map(|(kind, e)| (kind, e.to_string()))
                .collect(),
            duration: start.elapsed(),
        })
    }
}

#[async_trait]
impl<S: RemoteSource + ?Sized + 'static> CycleRunner for SyncEngine<S> {
    async fn prepare(&self) -> Result<()> {
        self.store.ensure_dir().await
    }

    async fn run_cycle(&self) -> Result<CycleReport> {
        self.sync_once().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing::ListingPublisher;
    use clientsync_common::{DatasetKind, Error, ErrorCategory};
    use clientsync_remote::MemorySource;
    use serde_json::json;
    use tempfile::TempDir;

    /// In-memory sink for formatted log lines.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        (buffer, tracing::subscriber::set_default(subscriber))
    }

    fn source() -> Arc<MemorySource> {
        Arc::new(MemorySource::with_payloads(
            json!([{"id": 1, "nombre": "Ana"}]),
            json!([{"id": 10, "telefono": "555-0101"}]),
            json!([{"id": 1, "destacado": true}]),
        ))
    }

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_first_cycle_creates_six_files() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("db");
        let engine = SyncEngine::new(source(), &db, SyncConfig::default());
        let (mut publisher, listing) = ListingPublisher::new(&db);

        let report = engine.sync_once().await.unwrap();

        assert!(matches!(report.status, CycleStatus::Saved { .. }));
        assert_eq!(report.changed_count(), 3);
        assert_eq!(file_names(&db).len(), 6);

        publisher.refresh().await.unwrap();
        assert_eq!(listing.current().len(), 6);
    }

    #[tokio::test]
    async fn test_second_identical_cycle_is_skipped() {
        let temp = TempDir::new().unwrap();
        let engine = SyncEngine::new(source(), temp.path(), SyncConfig::default());
        let (mut publisher, listing) = ListingPublisher::new(temp.path());

        engine.sync_once().await.unwrap();
        let before = publisher.refresh().await.unwrap();
        let mtime = std::fs::metadata(temp.path().join("clients.json"))
            .unwrap()
            .modified()
            .unwrap();

        let report = engine.sync_once().await.unwrap();

        assert_eq!(report.status, CycleStatus::Skipped);
        assert_eq!(report.changed_count(), 0);
        assert_eq!(publisher.refresh().await.unwrap(), before);
        assert_eq!(listing.current().len(), 6);
        let mtime_after = std::fs::metadata(temp.path().join("clients.json"))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(mtime, mtime_after);
    }

    #[tokio::test]
    async fn test_one_failure_persists_nothing() {
        let temp = TempDir::new().unwrap();
        let source = source();
        source.set_failure(DatasetKind::FeaturedClients, || {
            Error::Auth("401 Unauthorized".to_string())
        });
        let engine = SyncEngine::new(source, temp.path(), SyncConfig::default());

        let report = engine.sync_once().await.unwrap();

        match &report.status {
            CycleStatus::Aborted { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, DatasetKind::FeaturedClients);
                assert_eq!(failures[0].1.category, ErrorCategory::Auth);
            }
            other => panic!("unexpected status: {:?}", other),
        }
        assert!(!report.is_success());
        assert!(report.changed.is_none());
        assert!(file_names(temp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_failure_leaves_existing_snapshots_untouched() {
        let temp = TempDir::new().unwrap();
        let source = source();
        let engine = SyncEngine::new(source.clone(), temp.path(), SyncConfig::default());
        engine.sync_once().await.unwrap();
        let before = file_names(temp.path());

        source.set_payload(DatasetKind::Clients, json!([{"id": 2}]));
        source.set_failure(DatasetKind::Contacts, || Error::Network("timeout".to_string()));
        let report = engine.sync_once().await.unwrap();

        assert!(!report.is_success());
        assert_eq!(file_names(temp.path()), before);
        assert_eq!(
            engine.store().load(DatasetKind::Clients).await.unwrap(),
            json!([{"id": 1, "nombre": "Ana"}])
        );
    }

    #[tokio::test]
    async fn test_partial_change_shares_one_timestamp() {
        let temp = TempDir::new().unwrap();
        let source = source();
        let engine = SyncEngine::new(source.clone(), temp.path(), SyncConfig::default());
        engine.sync_once().await.unwrap();
        // Archive names have one-second resolution.
        tokio::time::sleep(Duration::from_millis(1100)).await;

        source.set_payload(DatasetKind::Clients, json!([]));
        source.set_payload(DatasetKind::Contacts, json!([{"id": 11}]));
        let report = engine.sync_once().await.unwrap();

        let CycleStatus::Saved { timestamp } = &report.status else {
            panic!("unexpected status: {:?}", report.status);
        };
        assert_eq!(report.changed_count(), 2);

        let names = file_names(temp.path());
        assert_eq!(names.len(), 10);
        assert!(names.contains(&format!("clients_{}.json", timestamp)));
        assert!(names.contains(&format!("contacts_{}.json", timestamp)));
        assert!(!names.contains(&format!("featured_clients_{}.json", timestamp)));
    }

    #[tokio::test]
    async fn test_saved_and_skipped_cycles_are_logged() {
        let (logs, _guard) = capture_logs();
        let temp = TempDir::new().unwrap();
        let engine = SyncEngine::new(source(), temp.path(), SyncConfig::default());

        engine.sync_once().await.unwrap();
        let first = logs.contents();
        assert!(first.contains("Sync started"));
        assert!(first.contains("New data, saved"));
        assert!(!first.contains("No new data"));

        engine.sync_once().await.unwrap();
        assert!(logs.contents().contains("No new data, sync skipped"));
    }

    #[tokio::test]
    async fn test_failed_dataset_is_named_in_log() {
        let (logs, _guard) = capture_logs();
        let temp = TempDir::new().unwrap();
        let source = source();
        source.set_failure(DatasetKind::FeaturedClients, || {
            Error::Auth("401 Unauthorized".to_string())
        });
        let engine = SyncEngine::new(source, temp.path(), SyncConfig::default());

        engine.sync_once().await.unwrap();

        let text = logs.contents();
        let failure = text
            .lines()
            .find(|line| line.contains("Sync failed"))
            .expect("failure line");
        assert!(failure.contains("ERROR"));
        assert!(failure.contains("dataset=featured_clients"));
        assert!(failure.contains("category=auth"));
        assert!(failure.contains("401 Unauthorized"));
        assert!(text.contains("Sync aborted, nothing persisted"));
        assert!(!text.contains("New data, saved"));
    }

    #[tokio::test]
    async fn test_concurrent_cycles_are_serialized() {
        let temp = TempDir::new().unwrap();
        let source = source();
        source.set_delay(DatasetKind::Clients, Duration::from_millis(100));
        let engine = Arc::new(SyncEngine::new(source.clone(), temp.path(), SyncConfig::default()));

        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.sync_once().await }
        });
        let second = tokio::spawn({
            let engine = engine.clone();
            async move { engine.sync_once().await }
        });

        let mut statuses = vec![
            first.await.unwrap().unwrap().status,
            second.await.unwrap().unwrap().status,
        ];
        statuses.retain(|s| *s == CycleStatus::Skipped);

        // Exactly one of the two saw the other's writes.
        assert_eq!(statuses.len(), 1);
        assert_eq!(source.fetch_count(DatasetKind::Clients), 2);
        assert_eq!(file_names(temp.path()).len(), 6);
    }
}
