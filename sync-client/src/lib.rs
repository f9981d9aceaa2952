//! # sync-client
//!
//! Async services for mirror-sync: keep a local mirror of provider items in
//! step with rate-limited, OAuth-guarded remote APIs.
//!
//! ## Features
//!
//! - **Token lifecycle**: authorization with CSRF state and PKCE, refresh
//!   ahead of expiry with at most one refresh in flight per provider, revocation
//! - **Rate limiting**: token bucket, sliding window or fixed window per
//!   provider, reconciled with upstream rate-limit headers
//! - **Retries**: constant, linear or exponential backoff with jitter
//! - **Reconciliation**: URL-keyed diff, conflict strategies with a manual
//!   queue, delete → update → add application with partial-failure reports
//!
//! All pure logic lives in `sync-core`; this crate adds time, I/O and state.
//!
//! ## Example
//!
//! ```ignore
//! use sync_client::{Config, HttpTokenEndpoint, MemoryAuthStore, Services, SyncEngine};
//!
//! let config = Config::from_file(path)?;
//! let services = Services::from_config(&config, flow, Arc::new(HttpTokenEndpoint::new()), auth_store)?;
//! let engine = SyncEngine::new(store, services);
//! engine.register_provider(ProviderId::from("github"), source);
//!
//! for result in engine.sync_all().await {
//!     println!("{}: +{} ~{} -{}", result.provider_id, result.added, result.updated, result.deleted);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod limiter;
pub mod mock;
pub mod resolver;
pub mod retry;
pub mod source;
pub mod store;

pub use auth::{
    AuthEvent, AuthStore, AuthorizationFlow, EndpointError, FlowError, HttpTokenEndpoint,
    MemoryAuthStore, RefreshHandler, TokenEndpoint, TokenManager, TokenResponse,
    DEFAULT_REFRESH_MARGIN,
};
pub use config::{Config, ConfigError, ProviderConfig};
pub use engine::{ProviderOptions, Services, SyncEngine, SyncResult};
pub use error::{EngineError, FetchError, LimiterError, ResolverError};
pub use events::{EventBus, ListenerId, ScopedEvent};
pub use limiter::{spawn_sweep_task, RateLimiter};
pub use mock::{MockAuthorizationFlow, MockItemSource, MockTokenEndpoint};
pub use resolver::{
    ConflictEvent, ConflictResolver, ConflictStats, ManualOutcome, ManualResolution,
};
pub use retry::{RetryEngine, RetryOutcome, Retrying};
pub use source::RemoteItemSource;
pub use store::{
    ApplyBatch, ApplyError, ApplyReport, ApplyTarget, EntryUpdate, LocalStore, MemoryStore,
    NewEntry, RecordStore,
};
