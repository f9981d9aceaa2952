//! Local state store and sync-record persistence.
//!
//! The local store is the host's native collection of mirrored entries
//! (bookmark-like CRUD). It has no transactions: a batch may partially
//! succeed, and per-operation failures come back in the [`ApplyReport`]
//! instead of as an error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use sync_types::{Handle, LocalEntry, LocalRecord, ProviderId, StoreError};

/// An entry to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEntry {
    /// Title to display.
    pub title: String,
    /// URL of the mirrored item.
    pub url: String,
}

/// A title change for an existing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryUpdate {
    /// Entry to change.
    pub handle: Handle,
    /// New title.
    pub title: String,
}

/// Mutations for one namespace, applied in one `batch_apply` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyBatch {
    /// Entries to create.
    pub create: Vec<NewEntry>,
    /// Entries to retitle.
    pub update: Vec<EntryUpdate>,
    /// Entries to remove.
    pub delete: Vec<Handle>,
}

impl ApplyBatch {
    /// A batch of creations only.
    pub fn creates(create: Vec<NewEntry>) -> Self {
        Self {
            create,
            ..Self::default()
        }
    }

    /// A batch of updates only.
    pub fn updates(update: Vec<EntryUpdate>) -> Self {
        Self {
            update,
            ..Self::default()
        }
    }

    /// A batch of deletions only.
    pub fn deletes(delete: Vec<Handle>) -> Self {
        Self {
            delete,
            ..Self::default()
        }
    }

    /// Number of operations in the batch.
    pub fn len(&self) -> usize {
        self.create.len() + self.update.len() + self.delete.len()
    }

    /// True if the batch has no operations.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The operation an [`ApplyError`] refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyTarget {
    /// Creating an entry for this URL.
    Create(String),
    /// Updating this entry.
    Update(Handle),
    /// Deleting this entry.
    Delete(Handle),
}

/// A single failed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyError {
    /// Which operation failed.
    pub target: ApplyTarget,
    /// Store-provided reason.
    pub message: String,
}

/// Outcome of a `batch_apply` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Operations that took effect.
    pub succeeded: usize,
    /// Operations that did not.
    pub failed: usize,
    /// One entry per failed operation.
    pub errors: Vec<ApplyError>,
    /// Entries created by this batch, with their new handles.
    pub created: Vec<LocalEntry>,
}

impl ApplyReport {
    /// True if the operation on `target` failed.
    pub fn failed_on(&self, target: &ApplyTarget) -> bool {
        self.errors.iter().any(|e| &e.target == target)
    }

    fn record_failure(&mut self, target: ApplyTarget, message: impl Into<String>) {
        self.failed += 1;
        self.errors.push(ApplyError {
            target,
            message: message.into(),
        });
    }
}

/// The host's local collection of mirrored entries.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// All entries in a provider namespace.
    async fn list_items(&self, namespace: &ProviderId) -> Result<Vec<LocalEntry>, StoreError>;

    /// Apply a batch. Individual failures are reported, not returned as `Err`.
    async fn batch_apply(
        &self,
        namespace: &ProviderId,
        batch: ApplyBatch,
    ) -> Result<ApplyReport, StoreError>;
}

/// Persistence for [`LocalRecord`]s.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Records for a provider. Empty if none were saved.
    async fn load_records(&self, provider: &ProviderId) -> Result<Vec<LocalRecord>, StoreError>;

    /// Replace all records for a provider.
    async fn save_records(
        &self,
        provider: &ProviderId,
        records: Vec<LocalRecord>,
    ) -> Result<(), StoreError>;
}

/// In-memory local store and record store.
///
/// Issues handles `h-1`, `h-2`, ... and supports fault injection for tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    entries: HashMap<ProviderId, Vec<LocalEntry>>,
    records: HashMap<ProviderId, Vec<LocalRecord>>,
    next_handle: u64,
    batches: Vec<(ProviderId, ApplyBatch)>,
    fail_next_list: Option<String>,
    fail_next_save: Option<String>,
    fail_urls: HashSet<String>,
    fail_handles: HashSet<Handle>,
}

impl MemoryStoreInner {
    fn issue_handle(&mut self) -> Handle {
        self.next_handle += 1;
        Handle::new(format!("h-{}", self.next_handle))
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an entry directly, bypassing sync. Returns its handle.
    pub fn insert(&self, namespace: &ProviderId, url: &str, title: &str) -> Handle {
        let mut inner = self.lock();
        let handle = inner.issue_handle();
        inner
            .entries
            .entry(namespace.clone())
            .or_default()
            .push(LocalEntry {
                handle: handle.clone(),
                url: url.to_string(),
                title: title.to_string(),
            });
        handle
    }

    /// Current entries of a namespace.
    pub fn entries(&self, namespace: &ProviderId) -> Vec<LocalEntry> {
        self.lock()
            .entries
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }

    /// Current records of a provider.
    pub fn records(&self, provider: &ProviderId) -> Vec<LocalRecord> {
        self.lock()
            .records
            .get(provider)
            .cloned()
            .unwrap_or_default()
    }

    /// Every batch applied so far, in order.
    pub fn applied_batches(&self) -> Vec<(ProviderId, ApplyBatch)> {
        self.lock().batches.clone()
    }

    /// Cause the next `list_items` to fail.
    pub fn fail_next_list(&self, error: &str) {
        self.lock().fail_next_list = Some(error.to_string());
    }

    /// Cause the next `save_records` to fail.
    pub fn fail_next_save(&self, error: &str) {
        self.lock().fail_next_save = Some(error.to_string());
    }

    /// Reject every create for `url`.
    pub fn fail_create(&self, url: &str) {
        self.lock().fail_urls.insert(url.to_string());
    }

    /// Reject every update or delete of `handle`.
    pub fn fail_handle(&self, handle: &Handle) {
        self.lock().fail_handles.insert(handle.clone());
    }

    /// Stop rejecting any create, update or delete.
    pub fn clear_failures(&self) {
        let mut inner = self.lock();
        inner.fail_urls.clear();
        inner.fail_handles.clear();
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn list_items(&self, namespace: &ProviderId) -> Result<Vec<LocalEntry>, StoreError> {
        let mut inner = self.lock();
        if let Some(error) = inner.fail_next_list.take() {
            return Err(StoreError::Unavailable(error));
        }
        Ok(inner.entries.get(namespace).cloned().unwrap_or_default())
    }

    async fn batch_apply(
        &self,
        namespace: &ProviderId,
        batch: ApplyBatch,
    ) -> Result<ApplyReport, StoreError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.batches.push((namespace.clone(), batch.clone()));

        let mut report = ApplyReport::default();
        let mut entries = inner.entries.remove(namespace).unwrap_or_default();

        for handle in batch.delete {
            if inner.fail_handles.contains(&handle) {
                report.record_failure(ApplyTarget::Delete(handle), "delete rejected");
                continue;
            }
            match entries.iter().position(|e| e.handle == handle) {
                Some(idx) => {
                    entries.remove(idx);
                    report.succeeded += 1;
                }
                None => report.record_failure(ApplyTarget::Delete(handle), "no such entry"),
            }
        }

        for update in batch.update {
            if inner.fail_handles.contains(&update.handle) {
                report.record_failure(ApplyTarget::Update(update.handle), "update rejected");
                continue;
            }
            match entries.iter_mut().find(|e| e.handle == update.handle) {
                Some(entry) => {
                    entry.title = update.title;
                    report.succeeded += 1;
                }
                None => report.record_failure(ApplyTarget::Update(update.handle), "no such entry"),
            }
        }

        for new in batch.create {
            if inner.fail_urls.contains(&new.url) {
                report.record_failure(ApplyTarget::Create(new.url), "create rejected");
                continue;
            }
            let entry = LocalEntry {
                handle: inner.issue_handle(),
                url: new.url,
                title: new.title,
            };
            report.created.push(entry.clone());
            entries.push(entry);
            report.succeeded += 1;
        }

        inner.entries.insert(namespace.clone(), entries);
        Ok(report)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn load_records(&self, provider: &ProviderId) -> Result<Vec<LocalRecord>, StoreError> {
        Ok(self.records(provider))
    }

    async fn save_records(
        &self,
        provider: &ProviderId,
        records: Vec<LocalRecord>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(error) = inner.fail_next_save.take() {
            return Err(StoreError::Io(error));
        }
        inner.records.insert(provider.clone(), records);
        Ok(())
    }
}
