//! Items and their local mirrors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Handle, ProviderId, Timestamp};

/// Canonical remote record (pull request, issue, ...).
///
/// `url` is the cross-system identity key; it is unique within one provider
/// namespace for a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    /// Cross-system identity.
    pub url: String,
    /// Display title mirrored into the local store.
    pub title: String,
    /// Provider namespace this item belongs to.
    pub provider_id: ProviderId,
    /// Last modification time reported by the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<Timestamp>,
    /// Opaque provider metadata.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl Item {
    /// Create an item with no timestamp and no metadata.
    pub fn new(provider_id: ProviderId, url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            provider_id,
            last_modified: None,
            metadata: Value::Null,
        }
    }

    /// Set the last modification time.
    pub fn with_last_modified(mut self, ts: Timestamp) -> Self {
        self.last_modified = Some(ts);
        self
    }

    /// Set the opaque metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// An entry as listed by the local state store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEntry {
    /// Store-issued handle.
    pub handle: Handle,
    /// URL of the mirrored item.
    pub url: String,
    /// Title currently stored locally.
    pub title: String,
}

/// A local entry seen as an [`Item`], for diffing against the remote side.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalItem {
    /// Store-issued handle.
    pub handle: Handle,
    /// The local version of the item.
    pub item: Item,
}

/// Persisted association between a local-store handle and the item it mirrors.
///
/// Created when an add is applied, rewritten when an update is applied,
/// removed when a delete is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalRecord {
    /// Store-issued handle.
    pub handle: Handle,
    /// URL of the mirrored item.
    pub url: String,
    /// Title as of the last applied sync.
    pub title: String,
    /// When this record was last written by a sync pass.
    pub last_synced_at: Timestamp,
    /// Provider metadata as of the last applied sync.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    /// Remote version the user chose not to mirror.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declined: Option<DeclinedVersion>,
}

impl LocalRecord {
    /// Record that `handle` now mirrors `item`.
    pub fn mirror(handle: Handle, item: &Item, synced_at: Timestamp) -> Self {
        Self {
            handle,
            url: item.url.clone(),
            title: item.title.clone(),
            last_synced_at: synced_at,
            metadata: item.metadata.clone(),
            declined: None,
        }
    }

    /// Remember (or forget) a declined remote version.
    pub fn with_declined(mut self, declined: Option<DeclinedVersion>) -> Self {
        self.declined = declined;
        self
    }
}

/// A remote version rejected by a manual `KeepLocal` decision.
///
/// While the provider keeps reporting this exact version the local entry is
/// left alone. Any remote change makes it stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclinedVersion {
    /// Remote title at decision time.
    pub title: String,
    /// Remote modification time at decision time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<Timestamp>,
}

impl DeclinedVersion {
    /// Capture the version `item` represents.
    pub fn of(item: &Item) -> Self {
        Self {
            title: item.title.clone(),
            last_modified: item.last_modified,
        }
    }

    /// True if `item` is still the declined version.
    pub fn matches(&self, item: &Item) -> bool {
        self.title == item.title && self.last_modified == item.last_modified
    }
}
