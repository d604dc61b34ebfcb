//! Shared listing of the snapshot files currently on disk.
//!
//! The [`ListingPublisher`] is the single writer: it owns the only
//! `watch::Sender`. Everyone else holds a [`ListingHandle`], which reads
//! owned copies and can ask the publisher to refresh.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use clientsync_common::{Error, Result, SNAPSHOT_EXTENSION};

/// Set of snapshot file names. Order is irrelevant; iteration is sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileListing(BTreeSet<String>);

impl FileListing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Names as a sorted vector.
    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

impl FromIterator<String> for FileListing {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// List the files in `dir` carrying the snapshot extension.
pub async fn scan_directory(dir: &Path) -> Result<FileListing> {
    let mut entries = fs::read_dir(dir).await.map_err(Error::Io)?;
    let mut names = BTreeSet::new();

    while let Some(entry) = entries.next_entry().await.map_err(Error::Io)? {
        let path = entry.path();
        let is_snapshot = path
            .extension()
            .map(|ext| ext == SNAPSHOT_EXTENSION)
            .unwrap_or(false);
        if !is_snapshot || !entry.file_type().await.map_err(Error::Io)?.is_file() {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            names.insert(name.to_string());
        }
    }

    Ok(FileListing(names))
}

type RefreshReply = oneshot::Sender<Result<FileListing>>;

/// Why [`ListingPublisher::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The delay elapsed.
    Elapsed,
    /// A forced update was requested.
    Forced,
    /// Cancellation was requested.
    Cancelled,
}

/// Sole writer of the shared listing.
pub struct ListingPublisher {
    dir: PathBuf,
    tx: watch::Sender<FileListing>,
    force: Arc<Notify>,
    requests: mpsc::Receiver<RefreshReply>,
    request_tx: mpsc::Sender<RefreshReply>,
}

impl ListingPublisher {
    /// Create a publisher for `dir` and a first handle onto it.
    pub fn new(dir: impl AsRef<Path>) -> (Self, ListingHandle) {
        let (tx, rx) = watch::channel(FileListing::new());
        let (request_tx, requests) = mpsc::channel(16);
        let force = Arc::new(Notify::new());

        let handle = ListingHandle {
            rx,
            force: force.clone(),
            requests: request_tx.clone(),
        };

        let publisher = Self {
            dir: dir.as_ref().to_path_buf(),
            tx,
            force,
            requests,
            request_tx,
        };

        (publisher, handle)
    }

    /// Another handle onto this publisher.
    pub fn handle(&self) -> ListingHandle {
        ListingHandle {
            rx: self.tx.subscribe(),
            force: self.force.clone(),
            requests: self.request_tx.clone(),
        }
    }

    /// Directory being listed.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rescan and publish unconditionally.
    pub async fn refresh(&mut self) -> Result<FileListing> {
        let listing = scan_directory(&self.dir).await?;
        self.tx.send_replace(listing.clone());
        info!(files = listing.len(), "File listing refreshed");
        Ok(listing)
    }

    /// Rescan and publish if the listing differs from the last one, or if
    /// `forced` is set. Returns whether a new value was published.
    pub async fn check(&mut self, forced: bool) -> Result<bool> {
        let listing = scan_directory(&self.dir).await?;

        if forced {
            self.tx.send_replace(listing);
            info!("File listing updated (forced)");
            return Ok(true);
        }

        let published = self.tx.send_if_modified(|current| {
            if *current == listing {
                false
            } else {
                *current = listing;
                true
            }
        });
        if published {
            debug!("File listing changed on disk");
        }
        Ok(published)
    }

    /// Wait up to `delay`, serving synchronous refresh requests meanwhile.
    ///
    /// Returns early on a forced update or on cancellation.
    pub async fn wait(&mut self, delay: Duration, token: &CancellationToken) -> Wake {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Wake::Cancelled,
                Some(reply) = self.requests.recv() => {
                    let result = self.refresh().await;
                    let _ = reply.send(result);
                }
                _ = self.force.notified() => return Wake::Forced,
                _ = &mut sleep => return Wake::Elapsed,
            }
        }
    }
}

/// Read side of the shared listing. Cheap to clone.
#[derive(Clone)]
pub struct ListingHandle {
    rx: watch::Receiver<FileListing>,
    force: Arc<Notify>,
    requests: mpsc::Sender<RefreshReply>,
}

impl ListingHandle {
    /// Owned copy of the current listing.
    pub fn current(&self) -> FileListing {
        self.rx.borrow().clone()
    }

    /// Ask for a forced update on the listing task's next check.
    pub fn request_refresh(&self) {
        self.force.notify_one();
    }

    /// Have the listing task rescan and publish now, and wait for the result.
    pub async fn refresh_now(&self) -> Result<FileListing> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(reply_tx)
            .await
            .map_err(|_| Error::Process("Listing task is not running".to_string()))?;

        reply_rx
            .await
            .map_err(|_| Error::Process("Listing task stopped before replying".to_string()))?
    }

    /// Wait for the next published listing.
    pub async fn changed(&mut self) -> Result<FileListing> {
        self.rx
            .changed()
            .await
            .map_err(|_| Error::Process("Listing publisher is gone".to_string()))?;
        Ok(self.rx.borrow_and_update().clone())
    }
}
