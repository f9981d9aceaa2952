//! Conflict resolver service.
//!
//! Wraps the pure detection and strategy functions from `sync-core` with the
//! stateful parts: strategy selection (global default plus per-provider
//! overrides), the queue of conflicts awaiting a manual decision, running
//! statistics, and conflict events.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use sync_core::{detect_conflict, resolve, Conflict, ConflictStrategy, ConflictType, ManualAction};
use sync_types::{ConflictId, Item, ProviderId, Timestamp};

use crate::error::ResolverError;
use crate::events::{EventBus, ScopedEvent};

/// Conflict lifecycle events.
#[derive(Debug, Clone)]
pub enum ConflictEvent {
    /// A conflict was detected and resolved with `strategy`. Under
    /// `Manual` the conflict stays pending.
    Detected {
        /// The conflict.
        conflict: Conflict,
        /// Strategy applied.
        strategy: ConflictStrategy,
    },
    /// A pending conflict was settled by a user decision.
    Resolved {
        /// The conflict, as it was queued.
        conflict: Conflict,
        /// The decision.
        action: ManualAction,
    },
}

impl ScopedEvent for ConflictEvent {
    fn provider_id(&self) -> &ProviderId {
        match self {
            Self::Detected { conflict, .. } | Self::Resolved { conflict, .. } => {
                &conflict.provider_id
            }
        }
    }
}

/// Running conflict counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictStats {
    /// Conflicts detected since startup.
    pub total: usize,
    /// Detected conflicts per type.
    pub by_type: BTreeMap<ConflictType, usize>,
    /// Detected conflicts per provider.
    pub by_provider: BTreeMap<ProviderId, usize>,
    /// Conflicts currently awaiting a manual decision.
    pub pending: usize,
}

/// What to do with the local entry after a manual decision.
#[derive(Debug, Clone, PartialEq)]
pub enum ManualOutcome {
    /// Mirror this item.
    Keep(Item),
    /// Remove the local entry.
    Delete,
}

/// A settled manual conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct ManualResolution {
    /// The conflict, as it was queued.
    pub conflict: Conflict,
    /// The decision taken.
    pub action: ManualAction,
    /// Effect on the local entry.
    pub outcome: ManualOutcome,
}

/// Stateful conflict resolver.
#[derive(Debug)]
pub struct ConflictResolver {
    default_strategy: RwLock<ConflictStrategy>,
    strategies: RwLock<HashMap<ProviderId, ConflictStrategy>>,
    pending: Mutex<BTreeMap<ConflictId, Conflict>>,
    stats: Mutex<ConflictStats>,
    events: EventBus<ConflictEvent>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ConflictStrategy::default())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConflictResolver {
    /// Create a resolver using `default_strategy` for every provider.
    pub fn new(default_strategy: ConflictStrategy) -> Self {
        Self {
            default_strategy: RwLock::new(default_strategy),
            strategies: RwLock::new(HashMap::new()),
            pending: Mutex::new(BTreeMap::new()),
            stats: Mutex::new(ConflictStats::default()),
            events: EventBus::new(),
        }
    }

    /// Change the global strategy.
    pub fn set_default_strategy(&self, strategy: ConflictStrategy) {
        *self
            .default_strategy
            .write()
            .unwrap_or_else(PoisonError::into_inner) = strategy;
    }

    /// Override the strategy for one provider.
    pub fn set_strategy(&self, provider: ProviderId, strategy: ConflictStrategy) {
        self.strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(provider, strategy);
    }

    /// Strategy in effect for `provider`.
    pub fn strategy_for(&self, provider: &ProviderId) -> ConflictStrategy {
        if let Some(strategy) = self
            .strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider)
        {
            return *strategy;
        }
        *self
            .default_strategy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Conflict events.
    pub fn events(&self) -> &EventBus<ConflictEvent> {
        &self.events
    }

    /// Decide which version a matched pair should mirror.
    ///
    /// Without a conflict the remote version is taken as a plain update.
    /// With one, the provider's strategy decides; under `Manual` the conflict
    /// is queued (replacing any earlier entry for the same URL) and the
    /// remote version is returned as the interim value.
    pub fn reconcile(&self, local: &Item, remote: &Item) -> Item {
        let Some(conflict_type) = detect_conflict(local, remote) else {
            return remote.clone();
        };

        let provider = &remote.provider_id;
        let strategy = self.strategy_for(provider);
        let conflict = Conflict::new(conflict_type, local, remote, Timestamp::now());

        {
            let mut stats = lock(&self.stats);
            stats.total += 1;
            *stats.by_type.entry(conflict_type).or_insert(0) += 1;
            *stats.by_provider.entry(provider.clone()).or_insert(0) += 1;
        }

        let resolution = resolve(local, remote, strategy);
        tracing::debug!(
            "Conflict {:?} on {} resolved with {:?}",
            conflict_type,
            remote.url,
            strategy
        );

        if resolution.requires_user_confirmation {
            lock(&self.pending).insert(conflict.id.clone(), conflict.clone());
        }

        self.events.emit(&ConflictEvent::Detected { conflict, strategy });
        resolution.item
    }

    /// Work out what `action` would do to a queued conflict.
    ///
    /// The conflict stays queued and no event is emitted; pass the result to
    /// [`settle`](Self::settle) once the decision has been applied.
    pub fn plan_manual(
        &self,
        id: &ConflictId,
        action: ManualAction,
    ) -> Result<ManualResolution, ResolverError> {
        let conflict = self
            .get_pending(id)
            .ok_or_else(|| ResolverError::NotFound(id.clone()))?;

        let keep = |item: &Option<Item>| match item {
            Some(item) => ManualOutcome::Keep(item.clone()),
            None => ManualOutcome::Delete,
        };

        let outcome = match action {
            ManualAction::KeepLocal => keep(&conflict.local),
            ManualAction::KeepRemote => keep(&conflict.remote),
            ManualAction::KeepBoth => {
                tracing::warn!(
                    "KeepBoth is not supported for {} (URL is the identity); keeping remote",
                    id
                );
                keep(&conflict.remote)
            }
            ManualAction::DeleteBoth => ManualOutcome::Delete,
        };

        Ok(ManualResolution {
            conflict,
            action,
            outcome,
        })
    }

    /// Dequeue a planned resolution and emit [`ConflictEvent::Resolved`].
    pub fn settle(&self, resolution: &ManualResolution) -> Result<(), ResolverError> {
        let id = &resolution.conflict.id;
        lock(&self.pending)
            .remove(id)
            .ok_or_else(|| ResolverError::NotFound(id.clone()))?;

        tracing::info!("Conflict {} resolved manually: {:?}", id, resolution.action);
        self.events.emit(&ConflictEvent::Resolved {
            conflict: resolution.conflict.clone(),
            action: resolution.action,
        });
        Ok(())
    }

    /// Settle a queued conflict without touching any store.
    pub fn resolve_manually(
        &self,
        id: &ConflictId,
        action: ManualAction,
    ) -> Result<ManualResolution, ResolverError> {
        let resolution = self.plan_manual(id, action)?;
        self.settle(&resolution)?;
        Ok(resolution)
    }

    /// A queued conflict by id.
    pub fn get_pending(&self, id: &ConflictId) -> Option<Conflict> {
        lock(&self.pending).get(id).cloned()
    }

    /// All queued conflicts, ordered by id.
    pub fn pending(&self) -> Vec<Conflict> {
        lock(&self.pending).values().cloned().collect()
    }

    /// Queued conflicts for one provider.
    pub fn pending_for(&self, provider: &ProviderId) -> Vec<Conflict> {
        lock(&self.pending)
            .values()
            .filter(|c| &c.provider_id == provider)
            .cloned()
            .collect()
    }

    /// Current statistics.
    pub fn stats(&self) -> ConflictStats {
        let mut stats = lock(&self.stats).clone();
        stats.pending = lock(&self.pending).len();
        stats
    }
}
