//! Sync scheduling - periodic sync, periodic listing refresh and manual runs.
//!
//! Both periodic tasks observe cancellation only while sleeping; a cycle or
//! scan that has started always finishes first.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use clientsync_common::{read_config, ConfigSource, Error, Result};

use crate::listing::{ListingHandle, ListingPublisher, Wake};
use crate::state::{CycleReport, TaskState};

/// Something that can run a sync cycle.
#[async_trait]
pub trait CycleRunner: Send + Sync + 'static {
    /// One-time setup before the first cycle. A failure here is fatal for
    /// the periodic task.
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Run one cycle.
    async fn run_cycle(&self) -> Result<CycleReport>;
}

/// Timing knobs of the periodic tasks.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Wait after a failed sync cycle, in place of the configured interval.
    pub failure_backoff: Duration,
    /// Cadence of the listing task.
    pub listing_period: Duration,
    /// Wait after a failed directory scan.
    pub listing_error_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            failure_backoff: Duration::from_secs(60),
            listing_period: Duration::from_secs(5),
            listing_error_backoff: Duration::from_secs(10),
        }
    }
}

/// Handle on one running periodic task.
pub struct SchedulerHandle {
    name: &'static str,
    token: CancellationToken,
    state: watch::Receiver<TaskState>,
    join: JoinHandle<Result<()>>,
}

impl SchedulerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Ask the task to stop at its next sleep boundary.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the task to stop.
    pub async fn join(self) -> Result<()> {
        self.join
            .await
            .map_err(|e| Error::Process(format!("{} task crashed: {}", self.name, e)))?
    }
}

/// Sleep for `delay` unless cancelled first. Returns `true` on cancellation.
async fn sleep_or_cancel(delay: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

/// Spawn the periodic sync task.
///
/// Each iteration re-reads the interval, sleeps, runs a cycle and, on
/// success, asks for a forced listing refresh. After a failed cycle (or an
/// unreadable interval) the next wait is `failure_backoff` instead.
pub fn spawn_sync_task<R: CycleRunner + ?Sized>(
    runner: Arc<R>,
    config: Arc<dyn ConfigSource>,
    listing: ListingHandle,
    failure_backoff: Duration,
) -> SchedulerHandle {
    let token = CancellationToken::new();
    let (state_tx, state_rx) = watch::channel(TaskState::Idle);

    let join = tokio::spawn(sync_loop(
        runner,
        config,
        listing,
        failure_backoff,
        token.clone(),
        state_tx,
    ));

    SchedulerHandle {
        name: "sync",
        token,
        state: state_rx,
        join,
    }
}

async fn sync_loop<R: CycleRunner + ?Sized>(
    runner: Arc<R>,
    config: Arc<dyn ConfigSource>,
    listing: ListingHandle,
    failure_backoff: Duration,
    token: CancellationToken,
    state: watch::Sender<TaskState>,
) -> Result<()> {
    if let Err(e) = runner.prepare().await {
        error!("Sync task setup failed: {}", e);
        state.send_replace(TaskState::Failed);
        return Err(e);
    }
    info!("Sync task started");

    let mut backing_off = false;

    loop {
        let delay = if backing_off {
            state.send_replace(TaskState::BackingOff);
            info!("Next sync attempt in {:?}", failure_backoff);
            failure_backoff
        } else {
            match read_config(&config, |c| c.sync_interval()).await {
                Ok(interval) => {
                    state.send_replace(TaskState::Sleeping);
                    info!("Next sync in {:?}", interval);
                    interval
                }
                Err(e) => {
                    error!("Cannot read sync interval: {}", e);
                    state.send_replace(TaskState::BackingOff);
                    if sleep_or_cancel(failure_backoff, &token).await {
                        break;
                    }
                    continue;
                }
            }
        };

        if sleep_or_cancel(delay, &token).await {
            break;
        }

        state.send_replace(TaskState::Running);
        match runner.run_cycle().await {
            Ok(report) if report.is_success() => {
                info!("Periodic sync completed in {:?}: {}", report.duration, report);
                listing.request_refresh();
                backing_off = false;
            }
            Ok(report) => {
                warn!("Periodic sync failed: {}", report);
                backing_off = true;
            }
            Err(e) => {
                error!("Periodic sync failed: {}", e);
                backing_off = true;
            }
        }
    }

    state.send_replace(TaskState::Cancelled);
    info!("Sync task stopped");
    Ok(())
}

/// Spawn the periodic listing task. It owns the publisher from now on.
pub fn spawn_listing_task(
    publisher: ListingPublisher,
    period: Duration,
    error_backoff: Duration,
) -> SchedulerHandle {
    let token = CancellationToken::new();
    let (state_tx, state_rx) = watch::channel(TaskState::Idle);

    let join = tokio::spawn(listing_loop(
        publisher,
        period,
        error_backoff,
        token.clone(),
        state_tx,
    ));

    SchedulerHandle {
        name: "listing",
        token,
        state: state_rx,
        join,
    }
}

async fn listing_loop(
    mut publisher: ListingPublisher,
    period: Duration,
    error_backoff: Duration,
    token: CancellationToken,
    state: watch::Sender<TaskState>,
) -> Result<()> {
    info!(dir = %publisher.dir().display(), "Listing task started");
    let mut forced = false;

    loop {
        state.send_replace(TaskState::Running);
        let delay = match publisher.check(forced).await {
            Ok(_) => {
                state.send_replace(TaskState::Sleeping);
                period
            }
            Err(e) => {
                warn!("Listing scan failed: {}", e);
                state.send_replace(TaskState::BackingOff);
                error_backoff
            }
        };

        forced = match publisher.wait(delay, &token).await {
            Wake::Cancelled => break,
            Wake::Forced => {
                debug!("Forced listing refresh requested");
                true
            }
            Wake::Elapsed => false,
        };
    }

    state.send_replace(TaskState::Cancelled);
    info!("Listing task stopped");
    Ok(())
}

/// Owner of both periodic tasks plus the manual trigger.
pub struct SyncScheduler<R: CycleRunner + ?Sized> {
    runner: Arc<R>,
    listing: ListingHandle,
    sync_task: SchedulerHandle,
    listing_task: SchedulerHandle,
}

impl<R: CycleRunner + ?Sized> SyncScheduler<R> {
    /// Spawn the sync and listing tasks.
    ///
    /// Callers that need the listing populated before anything else runs
    /// should call [`ListingPublisher::refresh`] before handing it over.
    pub fn start(
        runner: Arc<R>,
        config: Arc<dyn ConfigSource>,
        publisher: ListingPublisher,
        settings: SchedulerConfig,
    ) -> Self {
        let listing = publisher.handle();
        let listing_task = spawn_listing_task(
            publisher,
            settings.listing_period,
            settings.listing_error_backoff,
        );
        let sync_task = spawn_sync_task(
            runner.clone(),
            config,
            listing.clone(),
            settings.failure_backoff,
        );

        Self {
            runner,
            listing,
            sync_task,
            listing_task,
        }
    }

    /// Run one cycle now and wait for the refreshed listing.
    ///
    /// Independent of the periodic task: its countdown is left alone.
    pub async fn trigger_now(&self) -> Result<CycleReport> {
        info!("Manual sync requested");
        let report = self.runner.run_cycle().await?;

        if let Err(e) = self.listing.refresh_now().await {
            warn!("Listing refresh after manual sync failed: {}", e);
        }
        Ok(report)
    }

    pub fn listing(&self) -> &ListingHandle {
        &self.listing
    }

    pub fn sync_state(&self) -> TaskState {
        self.sync_task.state()
    }

    pub fn listing_state(&self) -> TaskState {
        self.listing_task.state()
    }

    /// Cancel both tasks and wait for them to stop.
    pub async fn shutdown(self) -> Result<()> {
        info!("Stopping background tasks");
        self.sync_task.cancel();
        self.listing_task.cancel();

        let sync = self.sync_task.join().await;
        let listing = self.listing_task.join().await;
        sync.and(listing)
    }
}
