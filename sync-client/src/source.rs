//! Remote item sources.

use async_trait::async_trait;
use sync_types::{Item, RemoteError};

/// Fetches the canonical item list of one provider.
///
/// Errors must classify correctly (see [`sync_types::Classify`]) so the
/// retry engine can tell a 503 from a 404.
#[async_trait]
pub trait RemoteItemSource: Send + Sync {
    /// Fetch every item the provider currently reports.
    ///
    /// `token` is the current access token, or `None` for providers without
    /// credentials.
    async fn fetch_items(&self, token: Option<&str>) -> Result<Vec<Item>, RemoteError>;
}
