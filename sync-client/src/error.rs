//! Error types for the async services.

use sync_core::QuotaError;
use sync_types::{AuthError, Classify, ConflictId, ErrorClass, ProviderId, RemoteError, StoreError};
use thiserror::Error;

/// Rate limiter errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimiterError {
    /// The rate-limit configuration is unusable.
    #[error("invalid rate limit for {provider}: {source}")]
    InvalidConfig {
        /// Provider being configured.
        provider: ProviderId,
        /// What was wrong.
        #[source]
        source: QuotaError,
    },
}

/// Conflict resolver errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolverError {
    /// No pending conflict has this id.
    #[error("no pending conflict {0}")]
    NotFound(ConflictId),
}

/// Failure to obtain the remote item list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// No usable token could be obtained.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// The item source failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl Classify for FetchError {
    fn classify(&self) -> ErrorClass {
        match self {
            Self::Auth(e) => e.classify(),
            Self::Remote(e) => e.classify(),
        }
    }
}

/// Reconciliation engine errors.
///
/// Failures inside a sync pass are reported in `SyncResult`, not here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// No item source is registered for this provider.
    #[error("provider not registered: {0}")]
    UnknownProvider(ProviderId),

    /// The remote item list could not be fetched.
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// Manual resolution failed.
    #[error(transparent)]
    Resolver(#[from] ResolverError),

    /// Applying a resolution to the local store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The local store rejected an operation.
    #[error("apply failed: {0}")]
    Apply(String),
}
