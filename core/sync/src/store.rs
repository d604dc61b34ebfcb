//! Delta store: persists only the datasets that actually changed.

use chrono::{DateTime, TimeZone};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, error, warn};

use clientsync_common::{DatasetKind, Error, Payload, PerDataset, Result};

/// Format of the timestamp embedded in archive file names.
pub const ARCHIVE_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Result of reconciling one cycle's payloads with the disk.
#[derive(Debug)]
pub struct Reconciliation {
    /// Which datasets differed from their snapshot.
    pub changed: PerDataset<bool>,
    /// Shared cycle timestamp; `None` when nothing changed.
    pub timestamp: Option<String>,
    /// Files written in this cycle.
    pub written: Vec<PathBuf>,
    /// Write failures, per dataset.
    pub errors: Vec<(DatasetKind, Error)>,
}

impl Reconciliation {
    pub fn any_changed(&self) -> bool {
        self.changed.any()
    }
}

/// Owner of the snapshot directory.
///
/// Per dataset kind it keeps `{kind}.json` (current snapshot) and an
/// append-only series of `{kind}_{timestamp}.json` archives.
pub struct DeltaStore {
    dir: PathBuf,
}

impl DeltaStore {
    /// Create a store rooted at `dir`. Nothing touches the disk until
    /// [`DeltaStore::ensure_dir`] or [`DeltaStore::reconcile`] runs.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Create the snapshot directory if it does not exist.
    pub async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::disk(&self.dir, e))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn main_path(&self, kind: DatasetKind) -> PathBuf {
        self.dir.join(kind.main_file_name())
    }

    pub fn archive_path(&self, kind: DatasetKind, timestamp: &str) -> PathBuf {
        self.dir.join(kind.archive_file_name(timestamp))
    }

    /// Load the current snapshot of `kind`.
    pub async fn load(&self, kind: DatasetKind) -> Result<Payload> {
        let path = self.main_path(kind);
        let content = fs::read(&path).await.map_err(|e| Error::disk(&path, e))?;
        serde_json::from_slice(&content).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Whether `fresh` differs from the snapshot of `kind` on disk.
    ///
    /// A missing, unreadable or malformed snapshot counts as changed.
    pub async fn has_changed(&self, kind: DatasetKind, fresh: &Payload) -> bool {
        match self.load(kind).await {
            Ok(existing) => existing != *fresh,
            Err(Error::Disk { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                debug!(dataset = %kind, "No snapshot on disk yet");
                true
            }
            Err(e) => {
                warn!(dataset = %kind, "Existing snapshot unusable, rewriting: {}", e);
                true
            }
        }
    }

    /// Compare all three payloads with the disk and persist the changed ones.
    ///
    /// `now` stamps every archive written in this call. Write failures for
    /// one dataset do not stop or undo the writes of the others.
    pub async fn reconcile<Tz>(
        &self,
        payloads: &PerDataset<Payload>,
        now: DateTime<Tz>,
    ) -> Reconciliation
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        let mut changed = PerDataset::<bool>::default();
        for (kind, payload) in payloads.iter() {
            *changed.get_mut(kind) = self.has_changed(kind, payload).await;
        }

        if !changed.any() {
            return Reconciliation {
                changed,
                timestamp: None,
                written: Vec::new(),
                errors: Vec::new(),
            };
        }

        let timestamp = now.format(ARCHIVE_TIMESTAMP_FORMAT).to_string();
        let mut written = Vec::new();
        let mut errors = Vec::new();

        for (kind, payload) in payloads.iter() {
            if !*changed.get(kind) {
                continue;
            }
            match self.persist(kind, payload, &timestamp).await {
                Ok(paths) => written.extend(paths),
                Err(e) => {
                    error!(dataset = %kind, "Failed to persist snapshot: {}", e);
                    errors.push((kind, e));
                }
            }
        }

        Reconciliation {
            changed,
            timestamp: Some(timestamp),
            written,
            errors,
        }
    }

    /// Add the archive of `kind`, then overwrite its main snapshot.
    ///
    /// The archive goes first: if it cannot be written the main snapshot is
    /// left alone, so the next cycle still sees the change and retries.
    async fn persist(
        &self,
        kind: DatasetKind,
        payload: &Payload,
        timestamp: &str,
    ) -> Result<Vec<PathBuf>> {
        let content = serde_json::to_vec_pretty(payload)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let archive = self.archive_path(kind, timestamp);
        // Archives are append-only; two cycles in the same second must not
        // replace one another.
        if fs::try_exists(&archive)
            .await
            .map_err(|e| Error::disk(&archive, e))?
        {
            return Err(Error::AlreadyExists(format!(
                "archive {} already exists",
                archive.display()
            )));
        }
        write_atomic(&archive, &content).await?;

        let main = self.main_path(kind);
        write_atomic(&main, &content).await?;

        Ok(vec![archive, main])
    }
}

/// Write through a sibling temp file and rename over the target.
///
/// The temp name does not end in `.json`, so listings never show it.
async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidInput(format!("Bad snapshot path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    fs::write(&tmp, content)
        .await
        .map_err(|e| Error::disk(&tmp, e))?;

    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(Error::disk(path, e));
    }
    Ok(())
}
