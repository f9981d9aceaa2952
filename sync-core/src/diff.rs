//! Reconciliation diff for mirror-sync.
//!
//! Given the local entries of one provider namespace and the items the
//! provider currently reports, compute the partition of work a pass must
//! apply:
//! - `to_add`: remote URLs with no local entry
//! - `to_delete`: local entries whose URL the provider no longer reports
//! - `to_update`: entries present on both sides whose reconciled title differs
//!
//! URL is the identity on both sides. The diff is never persisted; every
//! pass recomputes it from fresh snapshots.

use std::collections::{HashMap, HashSet};
use sync_types::{Handle, Item, LocalItem};

/// Work computed for one reconciliation pass.
///
/// `to_add`, `to_update` and `to_delete` are pairwise disjoint over handles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diff {
    /// Remote items with no local counterpart.
    pub to_add: Vec<Item>,
    /// Local handles whose mirrored title must change, with the reconciled item.
    pub to_update: Vec<(Handle, Item)>,
    /// Local handles to remove.
    pub to_delete: Vec<Handle>,
    /// Matched entries that need no store mutation, with the reconciled item.
    ///
    /// Not applied to the store; used to refresh sync records.
    pub retained: Vec<(Handle, Item)>,
}

impl Diff {
    /// True when the pass has nothing to apply.
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }

    /// Number of store operations this diff implies.
    pub fn operation_count(&self) -> usize {
        self.to_add.len() + self.to_update.len() + self.to_delete.len()
    }
}

/// Compute the diff between local entries and remote items.
///
/// `reconcile` is called once for every URL present on both sides and returns
/// the item the local entry should mirror (conflict detection and resolution
/// live behind it). An update is only scheduled when the reconciled title
/// differs from the local title, so an unchanged remote yields an empty diff.
///
/// Remote items repeating an earlier URL are ignored. Local entries repeating
/// an earlier URL are scheduled for deletion.
pub fn compute_diff<F>(local: &[LocalItem], remote: &[Item], mut reconcile: F) -> Diff
where
    F: FnMut(&LocalItem, &Item) -> Item,
{
    let mut diff = Diff::default();

    let mut remote_by_url: HashMap<&str, &Item> = HashMap::with_capacity(remote.len());
    let mut remote_order: Vec<&Item> = Vec::with_capacity(remote.len());
    for item in remote {
        if !remote_by_url.contains_key(item.url.as_str()) {
            remote_by_url.insert(item.url.as_str(), item);
            remote_order.push(item);
        }
    }

    let mut current_urls: HashSet<&str> = HashSet::with_capacity(local.len());
    for entry in local {
        let url = entry.item.url.as_str();
        if !current_urls.insert(url) {
            diff.to_delete.push(entry.handle.clone());
            continue;
        }

        match remote_by_url.get(url) {
            None => diff.to_delete.push(entry.handle.clone()),
            Some(remote_item) => {
                let resolved = reconcile(entry, remote_item);
                if resolved.title != entry.item.title {
                    diff.to_update.push((entry.handle.clone(), resolved));
                } else {
                    diff.retained.push((entry.handle.clone(), resolved));
                }
            }
        }
    }

    for item in remote_order {
        if !current_urls.contains(item.url.as_str()) {
            diff.to_add.push(item.clone());
        }
    }

    diff
}
