//! End-to-end reconciliation scenarios over in-memory stores and mocks.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sync_client::{
    ConflictEvent, MemoryAuthStore, MemoryStore, MockAuthorizationFlow, MockItemSource,
    MockTokenEndpoint, ProviderOptions, RateLimiter, RecordStore, RetryEngine, Services,
    SyncEngine, TokenManager,
};
use sync_core::{
    compute_diff, detect_conflict, BackoffStrategy, ConflictStrategy, ConflictType, QuotaConfig,
    RateLimitStrategy, RetryPolicy,
};
use sync_types::{Item, LocalItem, LocalRecord, OAuthConfig, ProviderId, RemoteError, Timestamp};

const T0: i64 = 1_700_000_000;

fn github() -> ProviderId {
    ProviderId::from("github")
}

fn item(url: &str, title: &str) -> Item {
    Item::new(github(), url, title)
}

fn token_manager(endpoint: &MockTokenEndpoint) -> TokenManager {
    TokenManager::new(
        Arc::new(MockAuthorizationFlow::new()),
        Arc::new(endpoint.clone()),
        Arc::new(MemoryAuthStore::new()),
    )
}

fn engine(store: &MemoryStore, source: &MockItemSource) -> SyncEngine<MemoryStore> {
    let engine = SyncEngine::new(
        store.clone(),
        Services::new(token_manager(&MockTokenEndpoint::new())),
    );
    engine.register_provider_with(
        github(),
        Arc::new(source.clone()),
        ProviderOptions {
            retry: Some(RetryPolicy::no_retry()),
            requires_auth: false,
        },
    );
    engine
}

#[tokio::test]
async fn new_remote_item_is_added() {
    let store = MemoryStore::new();
    store.insert(&github(), "u1", "t1");
    let source = MockItemSource::with_items(vec![item("u1", "t1"), item("u2", "t2")]);
    let engine = engine(&store, &source);

    let result = engine.sync_provider(&github()).await;

    assert_eq!((result.added, result.updated, result.deleted), (1, 0, 0));
    let urls: Vec<String> = store.entries(&github()).into_iter().map(|e| e.url).collect();
    assert_eq!(urls, vec!["u1".to_string(), "u2".to_string()]);
}

#[tokio::test]
async fn vanished_remote_item_is_deleted() {
    let store = MemoryStore::new();
    store.insert(&github(), "u1", "A");
    store.insert(&github(), "u2", "B");
    let source = MockItemSource::with_items(vec![item("u1", "A")]);
    let engine = engine(&store, &source);

    let result = engine.sync_provider(&github()).await;

    assert_eq!((result.added, result.updated, result.deleted), (0, 0, 1));
    let entries = store.entries(&github());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].url, "u1");
}

#[tokio::test]
async fn newest_wins_takes_later_remote_edit() {
    let store = MemoryStore::new();
    let handle = store.insert(&github(), "u1", "old");
    store
        .save_records(
            &github(),
            vec![LocalRecord::mirror(
                handle,
                &item("u1", "old"),
                Timestamp::from_secs(T0),
            )],
        )
        .await
        .unwrap();
    let source = MockItemSource::with_items(vec![
        item("u1", "new").with_last_modified(Timestamp::from_secs(T0 + 120))
    ]);
    let engine = engine(&store, &source);
    let resolver = Arc::clone(&engine.services().resolver);
    resolver.set_strategy(github(), ConflictStrategy::NewestWins);

    let detected = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&detected);
    resolver.events().subscribe(github(), move |e: &ConflictEvent| {
        if let ConflictEvent::Detected { conflict, .. } = e {
            sink.lock().unwrap().push(conflict.conflict_type);
        }
    });

    let result = engine.sync_provider(&github()).await;

    assert_eq!(result.updated, 1);
    assert_eq!(store.entries(&github())[0].title, "new");
    assert_eq!(
        detected.lock().unwrap().as_slice(),
        &[ConflictType::BothModified]
    );
    assert_eq!(resolver.stats().by_type[&ConflictType::BothModified], 1);
}

#[tokio::test]
async fn fixed_window_admits_two_of_three() {
    let limiter = RateLimiter::new();
    limiter
        .configure(
            github(),
            QuotaConfig::new(RateLimitStrategy::FixedWindow, 2, Duration::from_millis(1000)),
        )
        .unwrap();

    let admitted: Vec<bool> = (0..3).map(|_| limiter.check_limit(&github())).collect();

    assert_eq!(admitted, vec![true, true, false]);
}

#[tokio::test(start_paused = true)]
async fn constant_backoff_succeeds_on_third_attempt() {
    let engine = RetryEngine::default();
    let policy = RetryPolicy::default()
        .with_max_retries(2)
        .with_strategy(BackoffStrategy::Constant)
        .with_initial_delay(Duration::from_millis(10));

    let outcome = engine
        .execute(&policy, |attempt| async move {
            if attempt < 3 {
                Err(RemoteError::Network("reset".into()))
            } else {
                Ok(attempt)
            }
        })
        .await;

    assert!(outcome.is_success());
    assert_eq!(outcome.attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn retry_budget_is_n_plus_one_attempts() {
    let engine = RetryEngine::default();
    let policy = RetryPolicy::default().with_max_retries(4);

    let outcome = engine
        .execute(&policy, |_| async { Err::<(), _>(RemoteError::Timeout) })
        .await;

    assert!(!outcome.is_success());
    assert_eq!(outcome.attempts, 5);
}

#[test]
fn exponential_backoff_growth() {
    let policy = RetryPolicy::default()
        .with_initial_delay(Duration::from_millis(100))
        .with_multiplier(2.0)
        .with_max_delay(Duration::from_millis(1000));

    let delays: Vec<u128> = (1..=6).map(|n| policy.base_delay(n).as_millis()).collect();

    assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
}

#[test]
fn token_bucket_rejects_call_past_capacity() {
    let limiter = RateLimiter::new();
    limiter
        .configure(
            github(),
            QuotaConfig::new(RateLimitStrategy::TokenBucket, 5, Duration::from_secs(3600)),
        )
        .unwrap();

    for _ in 0..5 {
        assert!(limiter.check_limit(&github()));
    }
    assert!(!limiter.check_limit(&github()));
}

#[test]
fn diff_partitions_url_sets() {
    let local: Vec<LocalItem> = ["a", "b", "c", "d"]
        .iter()
        .enumerate()
        .map(|(i, url)| LocalItem {
            handle: format!("h{}", i).as_str().into(),
            item: item(url, url),
        })
        .collect();
    let remote = vec![item("c", "c"), item("d", "D"), item("e", "e"), item("f", "f")];

    let diff = compute_diff(&local, &remote, |_, r| r.clone());

    let added: HashSet<&str> = diff.to_add.iter().map(|i| i.url.as_str()).collect();
    assert_eq!(added, HashSet::from(["e", "f"]));
    let deleted: HashSet<String> = diff.to_delete.iter().map(|h| h.to_string()).collect();
    assert_eq!(deleted, HashSet::from(["h0".to_string(), "h1".to_string()]));
    assert_eq!(diff.to_update.len(), 1);
    assert_eq!(diff.to_update[0].0.as_str(), "h3");
    assert!(diff
        .to_update
        .iter()
        .all(|(h, _)| !diff.to_delete.contains(h)));
}

#[tokio::test]
async fn repeated_pass_is_idempotent() {
    let store = MemoryStore::new();
    let source = MockItemSource::with_items(vec![
        item("u1", "one").with_last_modified(Timestamp::from_secs(T0)),
        item("u2", "two"),
        item("u3", "three"),
    ]);
    let engine = engine(&store, &source);

    let first = engine.sync_provider(&github()).await;
    let second = engine.sync_provider(&github()).await;
    let third = engine.sync_provider(&github()).await;

    assert_eq!(first.added, 3);
    assert!(second.is_noop() && second.is_success());
    assert!(third.is_noop() && third.is_success());
}

#[test]
fn conflict_detection_is_deterministic() {
    let local = item("u1", "a").with_last_modified(Timestamp::from_secs(T0));
    let remote = item("u1", "b").with_last_modified(Timestamp::from_secs(T0 + 600));

    let first = detect_conflict(&local, &remote);
    for _ in 0..10 {
        assert_eq!(detect_conflict(&local, &remote), first);
    }
    assert_eq!(first, Some(ConflictType::BothModified));
}

#[test]
fn newest_wins_picks_larger_timestamp_either_way() {
    let older = item("u1", "older").with_last_modified(Timestamp::from_secs(T0));
    let newer = item("u1", "newer").with_last_modified(Timestamp::from_secs(T0 + 3600));

    let as_remote = sync_core::resolve(&older, &newer, ConflictStrategy::NewestWins);
    let as_local = sync_core::resolve(&newer, &older, ConflictStrategy::NewestWins);

    assert_eq!(as_remote.item.title, "newer");
    assert_eq!(as_local.item.title, "newer");
}

#[tokio::test]
async fn get_token_refreshes_token_inside_margin() {
    let endpoint = MockTokenEndpoint::new();
    endpoint.set_exchange_expires_in(4 * 60);
    let tokens = token_manager(&endpoint);
    tokens.register_config(
        github(),
        OAuthConfig {
            auth_url: "https://provider.test/authorize".into(),
            token_url: "https://provider.test/token".into(),
            client_id: "client".into(),
            client_secret: None,
            redirect_uri: "https://app.test/cb".into(),
            scopes: vec!["repo".into()],
            revoke_url: None,
        },
    );
    tokens.authenticate(&github()).await.unwrap();

    let token = tokens.get_token(&github()).await.unwrap();

    assert!(endpoint.refresh_count() >= 1);
    assert_ne!(token.as_deref(), Some("access-1"));
    let state = tokens.auth_state(&github()).unwrap();
    assert!(!state
        .tokens
        .expires_within(Duration::from_secs(5 * 60), Timestamp::now()));
}
