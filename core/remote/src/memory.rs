//! In-memory remote source for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use clientsync_common::{DatasetKind, Error, Payload, Result};

use crate::provider::RemoteSource;

type ErrorFactory = Arc<dyn Fn() -> Error + Send + Sync>;

/// Scripted behavior for one dataset.
#[derive(Clone)]
enum Behavior {
    Respond(Payload),
    Fail(ErrorFactory),
    Panic(String),
    Hang,
}

#[derive(Clone)]
struct Script {
    behavior: Behavior,
    delay: Option<Duration>,
}

/// In-memory remote source.
///
/// Each dataset answers with whatever was scripted for it. Unscripted
/// datasets fail with `NotFound`.
pub struct MemorySource {
    scripts: RwLock<HashMap<DatasetKind, Script>>,
    fetches: RwLock<HashMap<DatasetKind, usize>>,
    active: Arc<AtomicUsize>,
}

/// Decrements the active-fetch counter when the fetch future is dropped,
/// whether it completed or was aborted.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemorySource {
    /// Create a source with nothing scripted.
    pub fn new() -> Self {
        Self {
            scripts: RwLock::new(HashMap::new()),
            fetches: RwLock::new(HashMap::new()),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a source answering every dataset with the given payloads.
    pub fn with_payloads(clients: Payload, contacts: Payload, featured: Payload) -> Self {
        let source = Self::new();
        source.set_payload(DatasetKind::Clients, clients);
        source.set_payload(DatasetKind::Contacts, contacts);
        source.set_payload(DatasetKind::FeaturedClients, featured);
        source
    }

    fn script(&self, kind: DatasetKind, behavior: Behavior) {
        let mut scripts = self.scripts.write().unwrap_or_else(|e| e.into_inner());
        let delay = scripts.get(&kind).and_then(|s| s.delay);
        scripts.insert(kind, Script { behavior, delay });
    }

    /// Answer `kind` with `payload`.
    pub fn set_payload(&self, kind: DatasetKind, payload: Payload) {
        self.script(kind, Behavior::Respond(payload));
    }

    /// Fail `kind` with a fresh error from `make` on every fetch.
    pub fn set_failure<F>(&self, kind: DatasetKind, make: F)
    where
        F: Fn() -> Error + Send + Sync + 'static,
    {
        self.script(kind, Behavior::Fail(Arc::new(make)));
    }

    /// Panic while fetching `kind`.
    pub fn set_panic(&self, kind: DatasetKind, message: impl Into<String>) {
        self.script(kind, Behavior::Panic(message.into()));
    }

    /// Never answer for `kind`.
    pub fn set_hang(&self, kind: DatasetKind) {
        self.script(kind, Behavior::Hang);
    }

    /// Delay every answer for `kind`.
    pub fn set_delay(&self, kind: DatasetKind, delay: Duration) {
        let mut scripts = self.scripts.write().unwrap_or_else(|e| e.into_inner());
        match scripts.get_mut(&kind) {
            Some(script) => script.delay = Some(delay),
            None => {
                scripts.insert(
                    kind,
                    Script {
                        behavior: Behavior::Fail(Arc::new(move || {
                            Error::NotFound(format!("{} is not scripted", kind))
                        })),
                        delay: Some(delay),
                    },
                );
            }
        }
    }

    /// Number of fetches started for `kind`.
    pub fn fetch_count(&self, kind: DatasetKind) -> usize {
        let fetches = self.fetches.read().unwrap_or_else(|e| e.into_inner());
        fetches.get(&kind).copied().unwrap_or(0)
    }

    /// Number of fetches currently in flight.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch(&self, kind: DatasetKind) -> Result<Payload> {
        *self
            .fetches
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_insert(0) += 1;

        self.active.fetch_add(1, Ordering::SeqCst);
        let _guard = ActiveGuard(self.active.clone());

        let script = self
            .scripts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .cloned();

        let Some(script) = script else {
            return Err(Error::NotFound(format!("{} is not scripted", kind)));
        };

        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }

        match script.behavior {
            Behavior::Respond(payload) => Ok(payload),
            Behavior::Fail(make) => Err(make()),
            Behavior::Panic(message) => panic!("{}", message),
            Behavior::Hang => futures::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clientsync_common::ErrorCategory;
    use serde_json::json;

    #[tokio::test]
    async fn test_scripted_payloads() {
        let source = MemorySource::with_payloads(json!([1]), json!([2]), json!([3]));

        assert_eq!(source.fetch(DatasetKind::Contacts).await.unwrap(), json!([2]));
        assert_eq!(source.fetch_count(DatasetKind::Contacts), 1);
        assert_eq!(source.fetch_count(DatasetKind::Clients), 0);
        assert_eq!(source.active(), 0);
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let source = MemorySource::new();
        source.set_failure(DatasetKind::FeaturedClients, || {
            Error::Auth("401 Unauthorized".to_string())
        });

        let err = source.fetch(DatasetKind::FeaturedClients).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Auth);

        let err = source.fetch(DatasetKind::Clients).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_keeps_behavior() {
        let source = MemorySource::new();
        source.set_payload(DatasetKind::Clients, json!({"a": 1}));
        source.set_delay(DatasetKind::Clients, Duration::from_secs(3));

        let started = tokio::time::Instant::now();
        let payload = source.fetch(DatasetKind::Clients).await.unwrap();
        assert_eq!(payload, json!({"a": 1}));
        assert!(started.elapsed() >= Duration::from_secs(3));
    }
}
