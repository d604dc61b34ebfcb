//! Outcomes of sync cycles and states of the periodic tasks.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use clientsync_common::{DatasetKind, Error, ErrorCategory, Payload, PerDataset};

/// Failure reported by a fetch worker.
///
/// This is the only form an error takes once it crosses a worker boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub category: ErrorCategory,
    pub message: String,
}

impl FetchFailure {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl From<&Error> for FetchFailure {
    fn from(err: &Error) -> Self {
        Self::new(err.category(), err.to_string())
    }
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

/// Outcome of a single fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncResult {
    /// The remote answered with a structured payload.
    Fetched(Payload),
    /// The fetch failed; nothing is known about the dataset.
    Failed(FetchFailure),
}

impl SyncResult {
    pub fn is_failure(&self) -> bool {
        matches!(self, SyncResult::Failed(_))
    }

    pub fn failure(&self) -> Option<&FetchFailure> {
        match self {
            SyncResult::Failed(failure) => Some(failure),
            SyncResult::Fetched(_) => None,
        }
    }
}

/// The three fetch results of one cycle, gathered at the join barrier.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleOutcome {
    pub results: PerDataset<SyncResult>,
}

impl CycleOutcome {
    pub fn new(results: PerDataset<SyncResult>) -> Self {
        Self { results }
    }

    /// Failed datasets, in reporting order.
    pub fn failures(&self) -> Vec<(DatasetKind, FetchFailure)> {
        self.results
            .iter()
            .filter_map(|(kind, result)| result.failure().map(|f| (kind, f.clone())))
            .collect()
    }

    pub fn is_complete_success(&self) -> bool {
        self.results.iter().all(|(_, result)| !result.is_failure())
    }

    /// All three payloads, or every failure if at least one fetch failed.
    pub fn into_payloads(self) -> Result<PerDataset<Payload>, Vec<(DatasetKind, FetchFailure)>> {
        let failures = self.failures();
        let PerDataset {
            clients,
            contacts,
            featured_clients,
        } = self.results;

        match (clients, contacts, featured_clients) {
            (
                SyncResult::Fetched(clients),
                SyncResult::Fetched(contacts),
                SyncResult::Fetched(featured_clients),
            ) => Ok(PerDataset::new(clients, contacts, featured_clients)),
            _ => Err(failures),
        }
    }
}

/// What a cycle ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleStatus {
    /// At least one dataset changed and was persisted under this timestamp.
    Saved { timestamp: String },
    /// Nothing changed; no file was touched.
    Skipped,
    /// At least one fetch failed; nothing was persisted.
    Aborted {
        failures: Vec<(DatasetKind, FetchFailure)>,
    },
}

/// Report of one full cycle. Logged, returned, then discarded.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub status: CycleStatus,
    /// Per-dataset change flags; `None` when the cycle was aborted.
    pub changed: Option<PerDataset<bool>>,
    /// Datasets whose snapshot or archive could not be written.
    pub write_errors: Vec<(DatasetKind, String)>,
    pub duration: Duration,
}

impl CycleReport {
    /// Whether the fetch phase succeeded (saved or skipped).
    pub fn is_success(&self) -> bool {
        !matches!(self.status, CycleStatus::Aborted { .. })
    }

    /// Number of datasets that changed in this cycle.
    pub fn changed_count(&self) -> usize {
        self.changed.as_ref().map(PerDataset::count).unwrap_or(0)
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            CycleStatus::Saved { timestamp } => write!(
                f,
                "new data, saved {} dataset(s) with timestamp {}",
                self.changed_count(),
                timestamp
            )?,
            CycleStatus::Skipped => write!(f, "no new data, skipped")?,
            CycleStatus::Aborted { failures } => {
                write!(f, "sync failed:")?;
                for (kind, failure) in failures {
                    write!(f, " {}: {};", kind, failure)?;
                }
            }
        }
        if !self.write_errors.is_empty() {
            write!(f, " ({} write error(s))", self.write_errors.len())?;
        }
        Ok(())
    }
}

/// State of a periodic task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Spawned, setup not finished yet.
    Idle,
    /// Waiting for the next run; cancellation is observed here.
    Sleeping,
    /// Doing its work; cancellation waits for this to finish.
    Running,
    /// Waiting after a failed run.
    BackingOff,
    /// Stopped on request.
    Cancelled,
    /// Stopped because setup failed.
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Cancelled | TaskState::Failed)
    }
}
