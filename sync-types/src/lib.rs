//! # sync-types
//!
//! Shared data model for mirror-sync.
//!
//! This crate provides the foundational types used across all mirror-sync crates:
//! - [`ProviderId`], [`Handle`], [`ConflictId`], [`Timestamp`] - Identity and time types
//! - [`Item`], [`LocalEntry`], [`LocalItem`], [`LocalRecord`] - Remote records and their local mirrors
//! - [`OAuthConfig`], [`AuthTokens`], [`AuthState`] - Provider credentials
//! - [`AuthError`], [`RemoteError`], [`StoreError`] - Error types
//! - [`Classify`], [`ErrorClass`] - Retry classification shared by every fallible layer

#![warn(missing_docs)]
#![warn(clippy::all)]

mod auth;
mod error;
mod ids;
mod item;

pub use auth::{AuthState, AuthTokens, OAuthConfig};
pub use error::{AuthError, Classify, ErrorClass, RemoteError, StoreError};
pub use ids::{ConflictId, Handle, ProviderId, Timestamp};
pub use item::{DeclinedVersion, Item, LocalEntry, LocalItem, LocalRecord};
