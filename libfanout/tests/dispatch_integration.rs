//! Integration tests for the dispatcher
//!
//! Every scenario runs against both the in-memory store and a SQLite file so
//! the two implementations are held to the same contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use libfanout::accounting::{MemoryAccountant, PublishUsage, UsageAccountant};
use libfanout::platforms::mock::MockPublisher;
use libfanout::platforms::Publishers;
use libfanout::retry::RetryPolicy;
use libfanout::service::creation::NewPost;
use libfanout::service::{CancelOutcome, QueueService};
use libfanout::store::PostStore;
use libfanout::{
    Database, Dispatcher, DispatcherConfig, FanoutError, MemoryStore, PostStatus, PublishError,
};
use tempfile::TempDir;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

fn minutes(n: i64) -> chrono::Duration {
    chrono::Duration::minutes(n)
}

async fn sqlite_store() -> (Arc<dyn PostStore>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("queue.db");
    let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
    (Arc::new(db), temp_dir)
}

fn memory_store() -> Arc<dyn PostStore> {
    Arc::new(MemoryStore::new())
}

fn dispatcher(
    store: Arc<dyn PostStore>,
    publishers: &[Arc<MockPublisher>],
    accountant: Arc<dyn UsageAccountant>,
) -> Dispatcher {
    let mut registry = Publishers::new();
    for publisher in publishers {
        registry.register(publisher.clone());
    }
    Dispatcher::new(
        store,
        registry,
        accountant,
        RetryPolicy::default(),
        DispatcherConfig {
            publish_timeout: Duration::from_millis(500),
            ..Default::default()
        },
    )
}

async fn create(store: &Arc<dyn PostStore>, platforms: &[&str], max_retries: Option<u32>) -> String {
    let service = QueueService::new(store.clone(), RetryPolicy::default());
    let mut request = NewPost::new("tenant-1", "Hello fediverse");
    for platform in platforms {
        request = request.platform(*platform);
    }
    request.max_retries = max_retries;
    service.create(request, t0() - minutes(1)).await.unwrap().id
}

// ============================================================================
// Scenarios
// ============================================================================

async fn both_platforms_succeed(store: Arc<dyn PostStore>) {
    let a = Arc::new(MockPublisher::success("mastodon"));
    let b = Arc::new(MockPublisher::success("nostr"));
    let accountant = Arc::new(MemoryAccountant::new());
    let dispatcher = dispatcher(store.clone(), &[a.clone(), b.clone()], accountant.clone());
    let id = create(&store, &["mastodon", "nostr"], None).await;

    let report = dispatcher.run_cycle(t0()).await.unwrap();
    assert_eq!(report.posted, 1);

    let post = store.get(&id).await.unwrap().unwrap();
    assert_eq!(post.status, PostStatus::Posted);
    assert!(post.platform_targets.values().all(|s| s.posted));
    assert!(post.status_is_consistent());

    // A posted post is never due again, so accounting happens exactly once
    dispatcher.run_cycle(t0() + minutes(60)).await.unwrap();
    let reports = accountant.reports().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].post_id, id);
    assert_eq!(reports[0].platforms, vec!["mastodon", "nostr"]);
}

async fn partial_failure_then_exhaustion(store: Arc<dyn PostStore>) {
    let a = Arc::new(MockPublisher::success("a"));
    let b = Arc::new(MockPublisher::failure(
        "b",
        PublishError::Network("connection refused".to_string()),
    ));
    let accountant = Arc::new(MemoryAccountant::new());
    let dispatcher = dispatcher(store.clone(), &[a.clone(), b.clone()], accountant.clone());
    let id = create(&store, &["a", "b"], Some(3)).await;

    // Attempt 1
    dispatcher.run_cycle(t0()).await.unwrap();
    let post = store.get(&id).await.unwrap().unwrap();
    assert_eq!(post.status, PostStatus::Pending);
    assert!(post.platform_targets["a"].posted);
    assert!(!post.platform_targets["b"].posted);
    assert_eq!(post.retry.count, 1);
    assert_eq!(post.retry.next_retry_at, Some(t0() + minutes(5)));
    assert!(post.status_is_consistent());

    // Attempt 2, only b is called
    let second = t0() + minutes(5);
    dispatcher.run_cycle(second).await.unwrap();
    let post = store.get(&id).await.unwrap().unwrap();
    assert_eq!(post.status, PostStatus::Pending);
    assert_eq!(post.retry.count, 2);
    assert_eq!(post.retry.next_retry_at, Some(second + minutes(10)));

    // Attempt 3 exhausts the budget
    dispatcher.run_cycle(second + minutes(10)).await.unwrap();
    let post = store.get(&id).await.unwrap().unwrap();
    assert_eq!(post.status, PostStatus::Failed);
    assert_eq!(post.retry.count, 3);
    assert!(post.platform_targets["a"].posted);
    assert!(post.platform_targets["b"].last_error.is_some());
    assert_eq!(post.platform_targets["b"].attempt_count, 3);
    assert_eq!(post.errors.len(), 3);
    assert!(post.errors.iter().all(|e| e.platform.as_deref() == Some("b")));
    assert!(post.status_is_consistent());

    assert_eq!(a.call_count(), 1);
    assert_eq!(b.call_count(), 3);
    assert!(accountant.reports().await.is_empty());

    // Failed is terminal for the dispatcher
    let report = dispatcher.run_cycle(t0() + minutes(24 * 60)).await.unwrap();
    assert_eq!(report.claimed, 0);
}

async fn concurrent_dispatchers_claim_once(store: Arc<dyn PostStore>) {
    let publisher = Arc::new(MockPublisher::success("a").with_delay(Duration::from_millis(50)));
    let accountant = Arc::new(MemoryAccountant::new());
    let x = dispatcher(store.clone(), &[publisher.clone()], accountant.clone());
    let y = dispatcher(store.clone(), &[publisher.clone()], accountant.clone());
    let id = create(&store, &["a"], None).await;

    let (rx, ry) = tokio::join!(x.run_cycle(t0()), y.run_cycle(t0()));
    let (rx, ry) = (rx.unwrap(), ry.unwrap());

    assert_eq!(rx.claimed + ry.claimed, 1);
    assert_eq!(publisher.call_count(), 1);
    assert_eq!(accountant.reports().await.len(), 1);
    assert_eq!(
        store.get(&id).await.unwrap().unwrap().status,
        PostStatus::Posted
    );
}

async fn claim_is_exclusive(store: Arc<dyn PostStore>) {
    let id = create(&store, &["a"], None).await;

    let (first, second) = tokio::join!(
        store.claim(&id, PostStatus::Pending, t0()),
        store.claim(&id, PostStatus::Pending, t0())
    );
    assert!(first.unwrap() ^ second.unwrap());
}

async fn stale_claim_is_recovered(store: Arc<dyn PostStore>) {
    let publisher = Arc::new(MockPublisher::success("a"));
    let accountant = Arc::new(MemoryAccountant::new());
    let dispatcher = dispatcher(store.clone(), &[publisher.clone()], accountant);
    let id = create(&store, &["a"], None).await;

    // A dispatcher claimed it and crashed
    assert!(store.claim(&id, PostStatus::Pending, t0()).await.unwrap());

    // Not stale yet
    let report = dispatcher.run_cycle(t0() + minutes(5)).await.unwrap();
    assert_eq!(report.recovered, 0);
    assert_eq!(report.claimed, 0);

    // Past the ten minute cutoff the sweep returns it and the same cycle publishes it
    let report = dispatcher.run_cycle(t0() + minutes(11)).await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(report.posted, 1);

    let post = store.get(&id).await.unwrap().unwrap();
    assert_eq!(post.status, PostStatus::Posted);
    assert_eq!(post.retry.count, 0);
    assert!(post
        .errors
        .iter()
        .any(|e| e.message == libfanout::dispatcher::STALE_RECOVERY_NOTE));
}

async fn cancel_during_processing(store: Arc<dyn PostStore>) {
    let failing = Arc::new(MockPublisher::failure(
        "a",
        PublishError::RateLimit("429".to_string()),
    ));
    let dispatcher = dispatcher(
        store.clone(),
        &[failing.clone()],
        Arc::new(MemoryAccountant::new()),
    );
    let service = QueueService::new(store.clone(), RetryPolicy::default());
    let id = create(&store, &["a"], None).await;

    assert!(store.claim(&id, PostStatus::Pending, t0()).await.unwrap());
    let outcome = service.cancel(&id, t0()).await.unwrap();
    assert!(matches!(outcome, CancelOutcome::Deferred { .. }));

    let claimed = store.get(&id).await.unwrap().unwrap();
    let status = dispatcher.process_post(claimed, t0()).await.unwrap();
    assert_eq!(status, PostStatus::Cancelled);

    let post = store.get(&id).await.unwrap().unwrap();
    assert_eq!(post.status, PostStatus::Cancelled);
    // The attempt itself is still on record
    assert_eq!(post.platform_targets["a"].attempt_count, 1);

    let report = dispatcher.run_cycle(t0() + minutes(60)).await.unwrap();
    assert_eq!(report.claimed, 0);
    assert_eq!(failing.call_count(), 1);
}

async fn lost_claim_is_not_saved(store: Arc<dyn PostStore>) {
    let publisher = Arc::new(MockPublisher::success("a"));
    let dispatcher = dispatcher(
        store.clone(),
        &[publisher.clone()],
        Arc::new(MemoryAccountant::new()),
    );
    let id = create(&store, &["a"], None).await;

    assert!(store.claim(&id, PostStatus::Pending, t0()).await.unwrap());
    let mut stale_copy = store.get(&id).await.unwrap().unwrap();
    stale_copy.claimed_at = Some(t0() - minutes(30));

    let err = dispatcher.process_post(stale_copy, t0()).await.unwrap_err();
    assert!(matches!(err, FanoutError::ClaimLost(_)));
    assert_eq!(
        store.get(&id).await.unwrap().unwrap().status,
        PostStatus::Processing
    );
}

/// X claims and stalls, the sweep hands the post to Y, Y delivers it, and
/// only then does X finish its pass.
async fn late_pass_after_reclaim(store: Arc<dyn PostStore>, late_outcome: Option<PublishError>) {
    let accountant = Arc::new(MemoryAccountant::new());
    let on_time = Arc::new(MockPublisher::success("a"));
    let late = Arc::new(match late_outcome {
        Some(error) => MockPublisher::failure("a", error),
        None => MockPublisher::success("a"),
    });
    let x = dispatcher(store.clone(), &[late.clone()], accountant.clone());
    let y = dispatcher(store.clone(), &[on_time.clone()], accountant.clone());
    let id = create(&store, &["a"], None).await;

    assert!(store.claim(&id, PostStatus::Pending, t0()).await.unwrap());
    let x_copy = store.get(&id).await.unwrap().unwrap();

    let report = y.run_cycle(t0() + minutes(11)).await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(report.posted, 1);

    let err = x.process_post(x_copy, t0() + minutes(12)).await.unwrap_err();
    assert!(matches!(err, FanoutError::ClaimLost(_)));

    let post = store.get(&id).await.unwrap().unwrap();
    assert_eq!(post.status, PostStatus::Posted);
    assert!(post.platform_targets["a"].posted);
    assert_eq!(accountant.reports().await.len(), 1);
    assert_eq!(late.call_count(), 1);
}

async fn late_failure_after_reclaim(store: Arc<dyn PostStore>) {
    late_pass_after_reclaim(
        store,
        Some(PublishError::Network("connection reset".to_string())),
    )
    .await;
}

async fn late_success_after_reclaim(store: Arc<dyn PostStore>) {
    late_pass_after_reclaim(store, None).await;
}

async fn reset_after_failure(store: Arc<dyn PostStore>) {
    let flaky = Arc::new(MockPublisher::failing_times(
        "a",
        vec![PublishError::Authentication("expired token".to_string())],
    ));
    let accountant = Arc::new(MemoryAccountant::new());
    let dispatcher = dispatcher(store.clone(), &[flaky.clone()], accountant.clone());
    let service = QueueService::new(store.clone(), RetryPolicy::default());
    let id = create(&store, &["a"], Some(0)).await;

    dispatcher.run_cycle(t0()).await.unwrap();
    assert_eq!(service.get(&id).await.unwrap().status, PostStatus::Failed);

    let reset = service.reset_retries(&id, t0() + minutes(1)).await.unwrap();
    assert_eq!(reset.status, PostStatus::Pending);
    assert_eq!(reset.retry.count, 0);

    dispatcher.run_cycle(t0() + minutes(2)).await.unwrap();
    let post = service.get(&id).await.unwrap();
    assert_eq!(post.status, PostStatus::Posted);
    // Audit log keeps the failure and the reset
    assert_eq!(post.errors.len(), 2);
    assert_eq!(accountant.reports().await.len(), 1);
}

// ============================================================================
// Test entry points
// ============================================================================

macro_rules! on_both_stores {
    ($scenario:ident) => {
        mod $scenario {
            use super::*;

            #[tokio::test]
            async fn memory() {
                super::$scenario(memory_store()).await;
            }

            #[tokio::test]
            async fn sqlite() {
                let (store, _temp_dir) = sqlite_store().await;
                super::$scenario(store).await;
            }
        }
    };
}

on_both_stores!(both_platforms_succeed);
on_both_stores!(partial_failure_then_exhaustion);
on_both_stores!(concurrent_dispatchers_claim_once);
on_both_stores!(claim_is_exclusive);
on_both_stores!(stale_claim_is_recovered);
on_both_stores!(cancel_during_processing);
on_both_stores!(lost_claim_is_not_saved);
on_both_stores!(late_failure_after_reclaim);
on_both_stores!(late_success_after_reclaim);
on_both_stores!(reset_after_failure);

// ============================================================================
// Properties that do not depend on the store
// ============================================================================

#[tokio::test]
async fn test_backoff_gaps_never_shrink() {
    let store = memory_store();
    let failing = Arc::new(MockPublisher::failure(
        "a",
        PublishError::Network("down".to_string()),
    ));
    let dispatcher = dispatcher(
        store.clone(),
        &[failing],
        Arc::new(MemoryAccountant::new()),
    );
    let id = create(&store, &["a"], Some(10)).await;

    let mut now = t0();
    let mut gaps = Vec::new();
    loop {
        dispatcher.run_cycle(now).await.unwrap();
        let post = store.get(&id).await.unwrap().unwrap();
        match post.retry.next_retry_at {
            Some(next) => {
                gaps.push(next - now);
                now = next;
            }
            None => {
                assert_eq!(post.status, PostStatus::Failed);
                break;
            }
        }
    }

    assert_eq!(gaps.len(), 9);
    assert!(gaps.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(gaps[0], minutes(5));
    assert_eq!(*gaps.last().unwrap(), minutes(5 * 256));
}

struct BrokenAccountant;

#[async_trait]
impl UsageAccountant for BrokenAccountant {
    async fn record_publish(&self, _usage: &PublishUsage) -> libfanout::Result<()> {
        Err(FanoutError::InvalidInput("quota service unavailable".to_string()))
    }
}

#[tokio::test]
async fn test_accounting_failure_does_not_undo_publish() {
    let store = memory_store();
    let publisher = Arc::new(MockPublisher::success("a"));
    let dispatcher = dispatcher(store.clone(), &[publisher], Arc::new(BrokenAccountant));
    let id = create(&store, &["a"], None).await;

    let report = dispatcher.run_cycle(t0()).await.unwrap();
    assert_eq!(report.posted, 1);
    assert_eq!(report.errors, 0);
    assert_eq!(
        store.get(&id).await.unwrap().unwrap().status,
        PostStatus::Posted
    );
}

#[tokio::test]
async fn test_one_failing_post_does_not_stop_the_cycle() {
    let store = memory_store();
    let good = Arc::new(MockPublisher::success("good"));
    let bad = Arc::new(MockPublisher::failure(
        "bad",
        PublishError::ContentRejected("nope".to_string()),
    ));
    let dispatcher = dispatcher(
        store.clone(),
        &[good.clone(), bad],
        Arc::new(MemoryAccountant::new()),
    );
    let ok_id = create(&store, &["good"], None).await;
    let bad_id = create(&store, &["bad"], None).await;

    let report = dispatcher.run_cycle(t0()).await.unwrap();
    assert_eq!(report.claimed, 2);
    assert_eq!(report.posted, 1);
    assert_eq!(report.retrying, 1);
    assert_eq!(
        store.get(&ok_id).await.unwrap().unwrap().status,
        PostStatus::Posted
    );
    assert_eq!(
        store.get(&bad_id).await.unwrap().unwrap().status,
        PostStatus::Pending
    );
}

#[tokio::test]
async fn test_sqlite_accountant_counts_published_posts() {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(temp_dir.path().join("queue.db").to_str().unwrap())
        .await
        .unwrap();
    let store: Arc<dyn PostStore> = Arc::new(db.clone());
    let accountant = Arc::new(libfanout::accounting::SqliteAccountant::new(db));
    let publisher = Arc::new(MockPublisher::success("a"));
    let dispatcher = dispatcher(store.clone(), &[publisher], accountant.clone());

    create(&store, &["a"], None).await;
    create(&store, &["a"], None).await;
    dispatcher.run_cycle(t0()).await.unwrap();

    assert_eq!(
        accountant
            .published_count("tenant-1", libfanout::accounting::ALL_PLATFORMS)
            .await
            .unwrap(),
        2
    );
    assert_eq!(accountant.published_count("tenant-1", "a").await.unwrap(), 2);
}
