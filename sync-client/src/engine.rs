//! Reconciliation engine.
//!
//! [`SyncEngine`] runs one reconciliation pass per provider:
//!
//! ```text
//! LocalStore snapshot ─┐
//!                      ├─ compute_diff (ConflictResolver) ─ delete → update → add ─ records
//! RateLimiter → RetryEngine → TokenManager → RemoteItemSource ─┘
//! ```
//!
//! Passes for the same provider are serialized by a per-provider lock.
//! Passes for different providers are independent, and a failing provider
//! never affects the others in [`SyncEngine::sync_all`].

use dashmap::DashMap;
use futures_util::future::join_all;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use sync_core::{compute_diff, ManualAction, RetryPolicy};
use sync_types::{
    Classify, ConflictId, DeclinedVersion, ErrorClass, Handle, Item, LocalEntry, LocalItem,
    LocalRecord, ProviderId, RemoteError, Timestamp,
};
use tokio::time::Instant;

use crate::auth::TokenManager;
use crate::error::{EngineError, FetchError, ResolverError};
use crate::limiter::RateLimiter;
use crate::resolver::{ConflictResolver, ManualOutcome, ManualResolution};
use crate::retry::{RetryEngine, RetryOutcome};
use crate::source::RemoteItemSource;
use crate::store::{
    ApplyBatch, ApplyReport, ApplyTarget, EntryUpdate, LocalStore, NewEntry, RecordStore,
};

/// The services a [`SyncEngine`] composes, constructed once by the host.
#[derive(Debug, Clone)]
pub struct Services {
    /// Credentials.
    pub tokens: TokenManager,
    /// Per-provider request throttling.
    pub limiter: RateLimiter,
    /// Retry loop around remote fetches.
    pub retry: RetryEngine,
    /// Conflict detection, strategies and the manual queue.
    pub resolver: Arc<ConflictResolver>,
}

impl Services {
    /// Services with no rate limits, the default retry policy and
    /// `RemoteWins` conflict resolution.
    pub fn new(tokens: TokenManager) -> Self {
        Self {
            tokens,
            limiter: RateLimiter::new(),
            retry: RetryEngine::default(),
            resolver: Arc::new(ConflictResolver::default()),
        }
    }
}

/// Per-provider options.
#[derive(Debug, Clone, Default)]
pub struct ProviderOptions {
    /// Retry policy for fetches. `None` uses the retry engine's default.
    pub retry: Option<RetryPolicy>,
    /// Fail the pass instead of fetching anonymously when no token exists.
    pub requires_auth: bool,
}

#[derive(Clone)]
struct ProviderEntry {
    source: Arc<dyn RemoteItemSource>,
    options: ProviderOptions,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    /// Provider synced.
    pub provider_id: ProviderId,
    /// Entries created.
    pub added: usize,
    /// Entries retitled.
    pub updated: usize,
    /// Entries removed.
    pub deleted: usize,
    /// Store operations that failed.
    pub failed: usize,
    /// One message per failed store operation.
    pub errors: Vec<String>,
    /// Wall time of the pass.
    pub duration: Duration,
    /// Why the pass was aborted, if it was.
    pub error: Option<String>,
}

impl SyncResult {
    fn new(provider_id: ProviderId) -> Self {
        Self {
            provider_id,
            added: 0,
            updated: 0,
            deleted: 0,
            failed: 0,
            errors: Vec::new(),
            duration: Duration::ZERO,
            error: None,
        }
    }

    /// True if the pass completed and every store operation succeeded.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.failed == 0
    }

    /// True if nothing was applied.
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.updated == 0 && self.deleted == 0
    }

    fn absorb(&mut self, report: &ApplyReport) {
        self.failed += report.failed;
        self.errors.extend(report.errors.iter().map(|e| match &e.target {
            ApplyTarget::Create(url) => format!("create {}: {}", url, e.message),
            ApplyTarget::Update(handle) => format!("update {}: {}", handle, e.message),
            ApplyTarget::Delete(handle) => format!("delete {}: {}", handle, e.message),
        }));
    }
}

/// Reconciliation engine over a host store `S`.
pub struct SyncEngine<S> {
    store: S,
    services: Services,
    providers: RwLock<BTreeMap<ProviderId, ProviderEntry>>,
    pass_locks: DashMap<ProviderId, Arc<tokio::sync::Mutex<()>>>,
    last_sync: DashMap<ProviderId, Timestamp>,
}

impl<S> fmt::Debug for SyncEngine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("SyncEngine")
            .field("providers", &providers.keys().collect::<Vec<_>>())
            .field("services", &self.services)
            .finish()
    }
}

fn local_item(
    provider: &ProviderId,
    entry: &LocalEntry,
    record: Option<&LocalRecord>,
) -> LocalItem {
    LocalItem {
        handle: entry.handle.clone(),
        item: Item {
            url: entry.url.clone(),
            title: entry.title.clone(),
            provider_id: provider.clone(),
            last_modified: record.map(|r| r.last_synced_at),
            metadata: record.map(|r| r.metadata.clone()).unwrap_or(Value::Null),
        },
    }
}

impl<S> SyncEngine<S>
where
    S: LocalStore + RecordStore,
{
    /// Create an engine over `store` with injected `services`.
    pub fn new(store: S, services: Services) -> Self {
        Self {
            store,
            services,
            providers: RwLock::new(BTreeMap::new()),
            pass_locks: DashMap::new(),
            last_sync: DashMap::new(),
        }
    }

    /// The host store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The composed services.
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Register (or replace) a provider's item source with default options.
    pub fn register_provider(&self, provider: ProviderId, source: Arc<dyn RemoteItemSource>) {
        self.register_provider_with(provider, source, ProviderOptions::default());
    }

    /// Register (or replace) a provider's item source.
    pub fn register_provider_with(
        &self,
        provider: ProviderId,
        source: Arc<dyn RemoteItemSource>,
        options: ProviderOptions,
    ) {
        tracing::debug!("Registered provider {}", provider);
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(provider, ProviderEntry { source, options });
    }

    /// Registered providers, ordered by id.
    pub fn registered_providers(&self) -> Vec<ProviderId> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// When the provider's last successful pass finished.
    pub fn last_sync_time(&self, provider: &ProviderId) -> Option<Timestamp> {
        self.last_sync.get(provider).map(|t| *t)
    }

    fn provider(&self, provider: &ProviderId) -> Option<ProviderEntry> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider)
            .cloned()
    }

    fn pass_lock(&self, provider: &ProviderId) -> Arc<tokio::sync::Mutex<()>> {
        self.pass_locks
            .entry(provider.clone())
            .or_default()
            .clone()
    }

    /// Run every registered provider's pass concurrently.
    pub async fn sync_all(&self) -> Vec<SyncResult> {
        let providers = self.registered_providers();
        join_all(providers.iter().map(|p| self.sync_provider(p))).await
    }

    /// Run one reconciliation pass. Never fails: errors are in the result.
    #[tracing::instrument(skip(self), fields(provider = %provider))]
    pub async fn sync_provider(&self, provider: &ProviderId) -> SyncResult {
        let started = Instant::now();
        let mut result = SyncResult::new(provider.clone());

        let lock = self.pass_lock(provider);
        let _guard = lock.lock().await;

        let outcome = match self.provider(provider) {
            Some(entry) => self.run_pass(provider, &entry, &mut result).await,
            None => Err(EngineError::UnknownProvider(provider.clone())),
        };
        result.duration = started.elapsed();

        match outcome {
            Ok(()) => {
                self.last_sync.insert(provider.clone(), Timestamp::now());
                if result.failed > 0 {
                    tracing::warn!(
                        "Sync of {} applied with {} failures: {}",
                        provider,
                        result.failed,
                        result.errors.join("; ")
                    );
                }
                tracing::info!(
                    "Synced {}: +{} ~{} -{} in {}ms",
                    provider,
                    result.added,
                    result.updated,
                    result.deleted,
                    result.duration.as_millis()
                );
            }
            Err(e) => {
                tracing::warn!("Sync of {} failed: {}", provider, e);
                result.error = Some(e.to_string());
            }
        }
        result
    }

    async fn run_pass(
        &self,
        provider: &ProviderId,
        entry: &ProviderEntry,
        result: &mut SyncResult,
    ) -> Result<(), EngineError> {
        let entries = self.store.list_items(provider).await?;
        let mut previous: HashMap<Handle, LocalRecord> = self
            .store
            .load_records(provider)
            .await?
            .into_iter()
            .map(|r| (r.handle.clone(), r))
            .collect();
        let local: Vec<LocalItem> = entries
            .iter()
            .map(|e| local_item(provider, e, previous.get(&e.handle)))
            .collect();

        let outcome = self.fetch(provider, entry).await;
        let remote = outcome.result?;
        tracing::debug!(
            "Fetched {} items from {} ({} attempts, {}ms)",
            remote.len(),
            provider,
            outcome.attempts,
            outcome.total_time.as_millis()
        );

        // A KeepLocal decision holds while the remote still reports the declined version
        let remote_by_url: HashMap<&str, &Item> =
            remote.iter().map(|i| (i.url.as_str(), i)).collect();
        let declined: HashMap<Handle, DeclinedVersion> = previous
            .values()
            .filter_map(|r| {
                let version = r.declined.as_ref()?;
                let current = remote_by_url.get(r.url.as_str())?;
                version
                    .matches(current)
                    .then(|| (r.handle.clone(), version.clone()))
            })
            .collect();

        let resolver = &self.services.resolver;
        let diff = compute_diff(&local, &remote, |l, r| {
            if declined.contains_key(&l.handle) {
                l.item.clone()
            } else {
                resolver.reconcile(&l.item, r)
            }
        });
        tracing::debug!(
            "Diff for {}: {} to add, {} to update, {} to delete",
            provider,
            diff.to_add.len(),
            diff.to_update.len(),
            diff.to_delete.len()
        );

        let now = Timestamp::now();
        let mut records: Vec<LocalRecord> = diff
            .retained
            .iter()
            .map(|(handle, item)| {
                LocalRecord::mirror(handle.clone(), item, now)
                    .with_declined(declined.get(handle).cloned())
            })
            .collect();

        // Delete first: shortens the window where two entries share a URL
        if !diff.to_delete.is_empty() {
            let report = self
                .store
                .batch_apply(provider, ApplyBatch::deletes(diff.to_delete.clone()))
                .await?;
            result.deleted = report.succeeded;
            result.absorb(&report);
            for handle in &diff.to_delete {
                if report.failed_on(&ApplyTarget::Delete(handle.clone())) {
                    records.extend(previous.remove(handle));
                }
            }
        }

        if !diff.to_update.is_empty() {
            let updates = diff
                .to_update
                .iter()
                .map(|(handle, item)| EntryUpdate {
                    handle: handle.clone(),
                    title: item.title.clone(),
                })
                .collect();
            let report = self
                .store
                .batch_apply(provider, ApplyBatch::updates(updates))
                .await?;
            result.updated = report.succeeded;
            result.absorb(&report);
            for (handle, item) in &diff.to_update {
                if report.failed_on(&ApplyTarget::Update(handle.clone())) {
                    records.extend(previous.remove(handle));
                } else {
                    records.push(LocalRecord::mirror(handle.clone(), item, now));
                }
            }
        }

        // Add last: a partial failure leaves existing entries intact
        if !diff.to_add.is_empty() {
            let creates = diff
                .to_add
                .iter()
                .map(|item| NewEntry {
                    title: item.title.clone(),
                    url: item.url.clone(),
                })
                .collect();
            let report = self
                .store
                .batch_apply(provider, ApplyBatch::creates(creates))
                .await?;
            result.added = report.succeeded;
            result.absorb(&report);
            let by_url: HashMap<&str, &Item> =
                diff.to_add.iter().map(|i| (i.url.as_str(), i)).collect();
            for created in &report.created {
                if let Some(item) = by_url.get(created.url.as_str()) {
                    records.push(LocalRecord::mirror(created.handle.clone(), item, now));
                }
            }
        }

        self.store.save_records(provider, records).await?;
        Ok(())
    }

    /// Fetch the provider's items through the rate limiter and retry loop.
    ///
    /// After an attempt fails with an expired-credentials error, the next
    /// attempt forces a token refresh first.
    async fn fetch(
        &self,
        provider: &ProviderId,
        entry: &ProviderEntry,
    ) -> RetryOutcome<Vec<Item>, FetchError> {
        let policy = entry
            .options
            .retry
            .clone()
            .unwrap_or_else(|| self.services.retry.default_policy().clone());
        let force_refresh = AtomicBool::new(false);
        let tokens = &self.services.tokens;
        let source = &entry.source;
        let requires_auth = entry.options.requires_auth;

        self.services
            .limiter
            .execute(provider, || {
                self.services.retry.execute(&policy, |attempt| {
                    let force_refresh = &force_refresh;
                    async move {
                        let token = if force_refresh.swap(false, Ordering::Relaxed) {
                            tracing::debug!(
                                "Attempt {} on {}: forcing token refresh",
                                attempt,
                                provider
                            );
                            tokens.get_fresh_token(provider).await?
                        } else {
                            tokens.get_token(provider).await?
                        };
                        if token.is_none() && requires_auth {
                            return Err(FetchError::Remote(RemoteError::NotAuthenticated));
                        }

                        source.fetch_items(token.as_deref()).await.map_err(|e| {
                            if e.classify() == ErrorClass::AuthExpired {
                                force_refresh.store(true, Ordering::Relaxed);
                            }
                            FetchError::Remote(e)
                        })
                    }
                })
            })
            .await
    }

    /// Settle a pending manual conflict and apply the decision to the store.
    ///
    /// `KeepLocal` and `KeepRemote` write the chosen title, `DeleteBoth`
    /// removes the local entry and its record. `KeepBoth` cannot keep two
    /// entries for one URL and behaves as `KeepRemote`. After `KeepLocal`
    /// later passes leave the entry alone until the remote changes again.
    ///
    /// The conflict stays queued if the store rejects the decision.
    pub async fn resolve_conflict(
        &self,
        id: &ConflictId,
        action: ManualAction,
    ) -> Result<ManualResolution, EngineError> {
        let resolver = &self.services.resolver;
        let provider = resolver
            .get_pending(id)
            .map(|c| c.provider_id)
            .ok_or_else(|| ResolverError::NotFound(id.clone()))?;

        let lock = self.pass_lock(&provider);
        let _guard = lock.lock().await;

        let resolution = resolver.plan_manual(id, action)?;
        let conflict = &resolution.conflict;
        let Some(url) = conflict
            .remote
            .as_ref()
            .or(conflict.local.as_ref())
            .map(|item| item.url.clone())
        else {
            resolver.settle(&resolution)?;
            return Ok(resolution);
        };
        let declined = match action {
            ManualAction::KeepLocal => conflict.remote.as_ref().map(DeclinedVersion::of),
            _ => None,
        };

        let existing = self
            .store
            .list_items(&provider)
            .await?
            .into_iter()
            .find(|e| e.url == url);
        let mut records = self.store.load_records(&provider).await?;
        let now = Timestamp::now();

        match (&resolution.outcome, existing) {
            (ManualOutcome::Keep(item), Some(entry)) => {
                if entry.title != item.title {
                    let update = EntryUpdate {
                        handle: entry.handle.clone(),
                        title: item.title.clone(),
                    };
                    let report = self
                        .store
                        .batch_apply(&provider, ApplyBatch::updates(vec![update]))
                        .await?;
                    apply_succeeded(&report)?;
                }
                records.retain(|r| r.handle != entry.handle);
                records.push(LocalRecord::mirror(entry.handle, item, now).with_declined(declined));
            }
            (ManualOutcome::Keep(item), None) => {
                let create = NewEntry {
                    title: item.title.clone(),
                    url: item.url.clone(),
                };
                let report = self
                    .store
                    .batch_apply(&provider, ApplyBatch::creates(vec![create]))
                    .await?;
                apply_succeeded(&report)?;
                for created in report.created {
                    records.push(
                        LocalRecord::mirror(created.handle, item, now)
                            .with_declined(declined.clone()),
                    );
                }
            }
            (ManualOutcome::Delete, Some(entry)) => {
                let report = self
                    .store
                    .batch_apply(&provider, ApplyBatch::deletes(vec![entry.handle.clone()]))
                    .await?;
                apply_succeeded(&report)?;
                records.retain(|r| r.handle != entry.handle);
            }
            (ManualOutcome::Delete, None) => {}
        }

        self.store.save_records(&provider, records).await?;
        resolver.settle(&resolution)?;
        tracing::info!("Applied {:?} for conflict {}", action, id);
        Ok(resolution)
    }
}

fn apply_succeeded(report: &ApplyReport) -> Result<(), EngineError> {
    match report.errors.first() {
        Some(e) => Err(EngineError::Apply(e.message.clone())),
        None => Ok(()),
    }
}
