//! Conflict detection and resolution for mirror-sync.
//!
//! Detection and strategy resolution are pure functions over a matched
//! (local, remote) pair. Queueing of conflicts awaiting a manual decision is
//! stateful and lives in `sync-client`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use sync_types::{ConflictId, Item, ProviderId, Timestamp};

/// Two timestamps closer than this are considered the same edit.
pub const CONFLICT_THRESHOLD: Duration = Duration::from_secs(60);

/// Kind of disagreement between a local and a remote item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    /// Both sides changed the title.
    BothModified,
    /// The pair disagrees on URL. Cannot happen with URL-keyed matching.
    UrlMismatch,
    /// Titles agree, metadata differs.
    MetadataOnly,
    /// Reserved.
    LocalOnlyRemoteDeleted,
    /// Reserved.
    LocalDeletedRemoteModified,
}

/// How to settle a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Take the remote version.
    #[default]
    RemoteWins,
    /// Keep the local version.
    LocalWins,
    /// Take whichever side has the later `last_modified`; ties go to remote.
    NewestWins,
    /// Remote as base, local title/metadata on top if local is newer.
    Merge,
    /// Remote as interim value; a user decision is required.
    Manual,
}

/// Decision for a conflict held for manual resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManualAction {
    /// Restore the local version.
    KeepLocal,
    /// Accept the remote version.
    KeepRemote,
    /// Keep both versions. Not representable while URL is identity; treated
    /// as `KeepRemote`.
    KeepBoth,
    /// Drop the local entry.
    DeleteBoth,
}

/// A detected disagreement between the local and remote version of an item.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    /// `{provider}-{url}` key.
    pub id: ConflictId,
    /// What kind of disagreement this is.
    pub conflict_type: ConflictType,
    /// Local version, if any.
    pub local: Option<Item>,
    /// Remote version, if any.
    pub remote: Option<Item>,
    /// When it was detected.
    pub detected_at: Timestamp,
    /// Provider namespace.
    pub provider_id: ProviderId,
}

impl Conflict {
    /// Build a conflict record for a matched pair.
    pub fn new(
        conflict_type: ConflictType,
        local: &Item,
        remote: &Item,
        detected_at: Timestamp,
    ) -> Self {
        Self {
            id: ConflictId::for_item(&remote.provider_id, &remote.url),
            conflict_type,
            local: Some(local.clone()),
            remote: Some(remote.clone()),
            detected_at,
            provider_id: remote.provider_id.clone(),
        }
    }
}

/// Outcome of applying a strategy to a conflicting pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// The item the local entry should mirror.
    pub item: Item,
    /// Strategy that produced `item`.
    pub strategy: ConflictStrategy,
    /// True when `item` is only an interim value pending a user decision.
    pub requires_user_confirmation: bool,
}

/// Classify the disagreement between a matched local/remote pair.
///
/// Returns `None` when the pair does not conflict: either side lacks a
/// timestamp, the timestamps are within [`CONFLICT_THRESHOLD`], or the two
/// versions carry the same title and metadata.
pub fn detect_conflict(local: &Item, remote: &Item) -> Option<ConflictType> {
    if local.url != remote.url {
        return Some(ConflictType::UrlMismatch);
    }

    let (Some(local_ts), Some(remote_ts)) = (local.last_modified, remote.last_modified) else {
        return None;
    };

    if local_ts.abs_diff(remote_ts) <= CONFLICT_THRESHOLD {
        return None;
    }

    if local.title != remote.title {
        Some(ConflictType::BothModified)
    } else if local.metadata != remote.metadata {
        Some(ConflictType::MetadataOnly)
    } else {
        None
    }
}

/// Apply `strategy` to a conflicting pair. Never fails.
pub fn resolve(local: &Item, remote: &Item, strategy: ConflictStrategy) -> Resolution {
    let item = match strategy {
        ConflictStrategy::RemoteWins | ConflictStrategy::Manual => remote.clone(),
        ConflictStrategy::LocalWins => local.clone(),
        ConflictStrategy::NewestWins => {
            if local.last_modified > remote.last_modified {
                local.clone()
            } else {
                remote.clone()
            }
        }
        ConflictStrategy::Merge => merge(local, remote),
    };

    Resolution {
        item,
        strategy,
        requires_user_confirmation: strategy == ConflictStrategy::Manual,
    }
}

fn merge(local: &Item, remote: &Item) -> Item {
    let mut merged = remote.clone();
    if local.last_modified > remote.last_modified {
        merged.title = local.title.clone();
        merged.metadata = local.metadata.clone();
    }
    merged.last_modified = local.last_modified.max(remote.last_modified);
    merged
}
