//! JSON-file stores: the local mirror and saved credentials.
//!
//! Each store is one file in the data directory, rewritten whole on every
//! change and readable only by the owner. A per-store lock serializes
//! read-modify-write cycles between concurrent provider passes.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use sync_client::{
    ApplyBatch, ApplyError, ApplyReport, ApplyTarget, AuthStore, LocalStore, RecordStore,
};
use sync_types::{AuthState, Handle, LocalEntry, LocalRecord, ProviderId, StoreError};
use tokio::sync::Mutex;

use crate::config::write_private_json;

/// File name of the local mirror.
pub const MIRROR_FILE: &str = "mirror.json";

/// File name of the credential store.
pub const CREDENTIALS_FILE: &str = "credentials.json";

async fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => serde_json::from_str(&contents)
            .map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(StoreError::Unavailable(format!("{}: {}", path.display(), e))),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    write_private_json(path, value)
        .await
        .map_err(|e| StoreError::Io(format!("{:#}", e)))
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MirrorFile {
    #[serde(default)]
    next_handle: u64,
    #[serde(default)]
    namespaces: BTreeMap<String, Namespace>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Namespace {
    #[serde(default)]
    entries: Vec<LocalEntry>,
    #[serde(default)]
    records: Vec<LocalRecord>,
}

impl MirrorFile {
    fn issue_handle(&mut self) -> Handle {
        self.next_handle += 1;
        Handle::new(format!("e{}", self.next_handle))
    }
}

/// Local mirror kept in `mirror.json`: entries and sync records per provider.
#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonStore {
    /// Store backed by `mirror.json` in `data_dir`.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(MIRROR_FILE),
            lock: Mutex::new(()),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LocalStore for JsonStore {
    async fn list_items(&self, namespace: &ProviderId) -> Result<Vec<LocalEntry>, StoreError> {
        let _guard = self.lock.lock().await;
        let mut file: MirrorFile = read_json(&self.path).await?;
        Ok(file
            .namespaces
            .remove(namespace.as_str())
            .map(|ns| ns.entries)
            .unwrap_or_default())
    }

    async fn batch_apply(
        &self,
        namespace: &ProviderId,
        batch: ApplyBatch,
    ) -> Result<ApplyReport, StoreError> {
        let _guard = self.lock.lock().await;
        let mut file: MirrorFile = read_json(&self.path).await?;
        let mut ns = file.namespaces.remove(namespace.as_str()).unwrap_or_default();
        let mut report = ApplyReport::default();

        for handle in batch.delete {
            match ns.entries.iter().position(|e| e.handle == handle) {
                Some(idx) => {
                    ns.entries.remove(idx);
                    report.succeeded += 1;
                }
                None => report.errors.push(missing(ApplyTarget::Delete(handle))),
            }
        }

        for update in batch.update {
            match ns.entries.iter_mut().find(|e| e.handle == update.handle) {
                Some(entry) => {
                    entry.title = update.title;
                    report.succeeded += 1;
                }
                None => report.errors.push(missing(ApplyTarget::Update(update.handle))),
            }
        }

        for new in batch.create {
            let entry = LocalEntry {
                handle: file.issue_handle(),
                url: new.url,
                title: new.title,
            };
            report.created.push(entry.clone());
            ns.entries.push(entry);
            report.succeeded += 1;
        }

        report.failed = report.errors.len();
        file.namespaces.insert(namespace.to_string(), ns);
        write_json(&self.path, &file).await?;
        Ok(report)
    }
}

fn missing(target: ApplyTarget) -> ApplyError {
    ApplyError {
        target,
        message: "no such entry".into(),
    }
}

#[async_trait]
impl RecordStore for JsonStore {
    async fn load_records(&self, provider: &ProviderId) -> Result<Vec<LocalRecord>, StoreError> {
        let _guard = self.lock.lock().await;
        let mut file: MirrorFile = read_json(&self.path).await?;
        Ok(file
            .namespaces
            .remove(provider.as_str())
            .map(|ns| ns.records)
            .unwrap_or_default())
    }

    async fn save_records(
        &self,
        provider: &ProviderId,
        records: Vec<LocalRecord>,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut file: MirrorFile = read_json(&self.path).await?;
        file.namespaces
            .entry(provider.to_string())
            .or_default()
            .records = records;
        write_json(&self.path, &file).await
    }
}

/// Credentials kept in `credentials.json`, one [`AuthState`] per provider.
#[derive(Debug)]
pub struct FileAuthStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileAuthStore {
    /// Store backed by `credentials.json` in `data_dir`.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(CREDENTIALS_FILE),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl AuthStore for FileAuthStore {
    async fn load(&self, provider: &ProviderId) -> Result<Option<AuthState>, StoreError> {
        let _guard = self.lock.lock().await;
        let mut states: BTreeMap<String, AuthState> = read_json(&self.path).await?;
        Ok(states.remove(provider.as_str()))
    }

    async fn save(&self, state: &AuthState) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut states: BTreeMap<String, AuthState> = read_json(&self.path).await?;
        states.insert(state.provider_id.to_string(), state.clone());
        write_json(&self.path, &states).await
    }

    async fn remove(&self, provider: &ProviderId) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut states: BTreeMap<String, AuthState> = read_json(&self.path).await?;
        if states.remove(provider.as_str()).is_none() {
            return Ok(());
        }
        write_json(&self.path, &states).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_client::{EntryUpdate, NewEntry};
    use sync_types::{AuthTokens, Item, Timestamp};
    use tempfile::tempdir;

    fn ns() -> ProviderId {
        ProviderId::from("github")
    }

    fn new_entry(url: &str, title: &str) -> NewEntry {
        NewEntry {
            url: url.into(),
            title: title.into(),
        }
    }

    #[tokio::test]
    async fn mirror_survives_reopen() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        let report = store
            .batch_apply(
                &ns(),
                ApplyBatch::creates(vec![new_entry("u1", "one"), new_entry("u2", "two")]),
            )
            .await
            .unwrap();
        assert_eq!(report.succeeded, 2);

        let reopened = JsonStore::new(dir.path());
        let entries = reopened.list_items(&ns()).await.unwrap();
        assert_eq!(entries, report.created);
    }

    #[tokio::test]
    async fn handles_are_never_reused() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        let first = store
            .batch_apply(&ns(), ApplyBatch::creates(vec![new_entry("u1", "one")]))
            .await
            .unwrap();
        let handle = first.created[0].handle.clone();
        store
            .batch_apply(&ns(), ApplyBatch::deletes(vec![handle.clone()]))
            .await
            .unwrap();

        let second = store
            .batch_apply(&ns(), ApplyBatch::creates(vec![new_entry("u1", "one")]))
            .await
            .unwrap();

        assert_ne!(second.created[0].handle, handle);
    }

    #[tokio::test]
    async fn unknown_handles_are_reported() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        let created = store
            .batch_apply(&ns(), ApplyBatch::creates(vec![new_entry("u1", "one")]))
            .await
            .unwrap()
            .created;

        let report = store
            .batch_apply(
                &ns(),
                ApplyBatch {
                    create: vec![],
                    update: vec![
                        EntryUpdate {
                            handle: created[0].handle.clone(),
                            title: "uno".into(),
                        },
                        EntryUpdate {
                            handle: Handle::from("ghost"),
                            title: "boo".into(),
                        },
                    ],
                    delete: vec![Handle::from("ghost")],
                },
            )
            .await
            .unwrap();

        assert_eq!((report.succeeded, report.failed), (1, 2));
        assert!(report.failed_on(&ApplyTarget::Delete(Handle::from("ghost"))));
        assert_eq!(store.list_items(&ns()).await.unwrap()[0].title, "uno");
    }

    #[tokio::test]
    async fn records_are_kept_per_provider() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        let item = Item::new(ns(), "u1", "one");
        let record = LocalRecord::mirror(Handle::from("e1"), &item, Timestamp::from_secs(10));

        store.save_records(&ns(), vec![record.clone()]).await.unwrap();

        assert_eq!(store.load_records(&ns()).await.unwrap(), vec![record]);
        assert!(store
            .load_records(&ProviderId::from("gitlab"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn corrupt_mirror_is_an_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(MIRROR_FILE), "{not json").unwrap();
        let store = JsonStore::new(dir.path());

        let result = store.list_items(&ns()).await;

        assert!(matches!(result, Err(StoreError::Corrupt(_))));
    }

    fn auth_state(access: &str) -> AuthState {
        AuthState {
            provider_id: ns(),
            authenticated: true,
            tokens: AuthTokens {
                access_token: access.into(),
                refresh_token: Some("refresh".into()),
                expires_at: Timestamp::from_secs(1_700_003_600),
                token_type: "Bearer".into(),
                scopes: None,
            },
            last_auth: Timestamp::from_secs(1_700_000_000),
            last_refresh: None,
        }
    }

    #[tokio::test]
    async fn credentials_roundtrip_and_remove() {
        let dir = tempdir().unwrap();
        let store = FileAuthStore::new(dir.path());
        assert_eq!(store.load(&ns()).await.unwrap(), None);

        store.save(&auth_state("a1")).await.unwrap();
        store.save(&auth_state("a2")).await.unwrap();
        let loaded = FileAuthStore::new(dir.path()).load(&ns()).await.unwrap();
        assert_eq!(loaded.map(|s| s.tokens.access_token.clone()), Some("a2".into()));

        store.remove(&ns()).await.unwrap();
        store.remove(&ns()).await.unwrap();
        assert_eq!(store.load(&ns()).await.unwrap(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn credentials_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        FileAuthStore::new(dir.path())
            .save(&auth_state("a1"))
            .await
            .unwrap();

        let mode = std::fs::metadata(dir.path().join(CREDENTIALS_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
