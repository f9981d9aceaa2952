//! # sync-core
//!
//! Pure logic for mirror-sync (no I/O, instant tests).
//!
//! This crate implements the algorithms of the synchronization core
//! without any network, disk or timer I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. Time is passed in by the caller, never read. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about quota and backoff arithmetic
//!
//! The actual I/O (HTTP, stores, timers) is performed by `sync-client`, which
//! drives these functions.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod conflict;
pub mod diff;
pub mod headers;
pub mod quota;

pub use backoff::{BackoffStrategy, RetryPolicy};
pub use conflict::{
    detect_conflict, resolve, Conflict, ConflictStrategy, ConflictType, ManualAction,
    Resolution, CONFLICT_THRESHOLD,
};
pub use diff::{compute_diff, Diff};
pub use headers::{RateLimitHeaders, ResetHint};
pub use quota::{Quota, QuotaConfig, QuotaError, QuotaStatus, RateLimitStrategy};
