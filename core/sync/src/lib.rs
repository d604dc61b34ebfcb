//! ClientSync Sync Engine
//!
//! Background synchronization of the remote client datasets, including:
//! - Parallel fetch of the three datasets with a join barrier
//! - Delta persistence with timestamped archives
//! - A shared listing of the snapshot directory
//! - Periodic sync and listing tasks plus manual runs
//! - A contact view over the local snapshots

pub mod contacts;
pub mod engine;
pub mod listing;
pub mod orchestrator;
pub mod scheduler;
pub mod state;
pub mod store;

// Re-export main types
pub use contacts::{load_contacts, parse_contacts, Contact};
pub use engine::{SyncConfig, SyncEngine};
pub use listing::{scan_directory, FileListing, ListingHandle, ListingPublisher, Wake};
pub use orchestrator::{FetchOrchestrator, DEFAULT_WORKER_TIMEOUT};
pub use scheduler::{
    spawn_listing_task, spawn_sync_task, CycleRunner, SchedulerConfig, SchedulerHandle,
    SyncScheduler,
};
pub use state::{CycleOutcome, CycleReport, CycleStatus, FetchFailure, SyncResult, TaskState};
pub use store::{DeltaStore, Reconciliation, ARCHIVE_TIMESTAMP_FORMAT};
