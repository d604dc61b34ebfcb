//! Remote source trait definition.

use async_trait::async_trait;

use clientsync_common::{DatasetKind, Payload, Result};

/// A service the three datasets can be pulled from.
///
/// Implementations must be safe to call concurrently: one sync cycle fetches
/// all three kinds at the same time.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Get the source name (e.g., "api", "memory").
    fn name(&self) -> &str;

    /// Fetch the current payload of one dataset.
    ///
    /// # Errors
    /// - `Network` for transport failures and timeouts
    /// - `Auth` when credentials are missing or rejected
    /// - `HttpStatus` for any other non-success response
    /// - `Decode` when the body is not valid JSON
    async fn fetch(&self, kind: DatasetKind) -> Result<Payload>;
}
