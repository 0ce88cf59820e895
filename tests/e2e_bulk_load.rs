//! Bulk loading through the handler path: backpressure, failures and redo.

mod helpers;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use helpers::{attach_peer, open_with_peer, test_settings};
use resolver_bridge::bridge::{RedoItem, RedoStore, StoreError};
use resolver_bridge::{BridgeError, LoadRecord, Session};

/// Redo store backed by a queue; deleting removes the item by key.
struct QueueStore {
    items: Mutex<VecDeque<RedoItem>>,
    fetches: AtomicUsize,
    /// Time each delete blocks before touching the queue
    delete_delay: Duration,
    /// Every delete reports contention and removes nothing
    always_busy: bool,
}

impl QueueStore {
    fn with_items(count: usize) -> Self {
        Self {
            items: Mutex::new(
                (0..count)
                    .map(|i| RedoItem::new(format!("redo-{}", i), format!("redo payload {}", i)))
                    .collect(),
            ),
            fetches: AtomicUsize::new(0),
            delete_delay: Duration::ZERO,
            always_busy: false,
        }
    }

    fn slow_deletes(mut self, delay: Duration) -> Self {
        self.delete_delay = delay;
        self
    }

    fn always_busy(mut self) -> Self {
        self.always_busy = true;
        self
    }

    fn remaining(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl RedoStore for QueueStore {
    fn fetch_batch(&self, limit: usize) -> Result<Vec<RedoItem>, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.items.lock().unwrap().iter().take(limit).cloned().collect())
    }

    fn delete(&self, item: &RedoItem) -> Result<(), StoreError> {
        if self.always_busy {
            return Err(StoreError::Busy("table locked".to_string()));
        }
        std::thread::sleep(self.delete_delay);
        self.items.lock().unwrap().retain(|i| i.key != item.key);
        Ok(())
    }
}

/// Redo store that never makes progress: every fetch returns the same items.
struct StuckStore {
    fetches: AtomicUsize,
}

impl RedoStore for StuckStore {
    fn fetch_batch(&self, _limit: usize) -> Result<Vec<RedoItem>, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok((0..3)
            .map(|i| RedoItem::new(format!("stuck-{}", i), "again"))
            .collect())
    }

    fn delete(&self, _item: &RedoItem) -> Result<(), StoreError> {
        Ok(())
    }
}

fn records(count: usize) -> Vec<LoadRecord> {
    (0..count).map(|i| LoadRecord::add(format!("record-{}", i))).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_peer_load_completes_under_backpressure() {
    let mut settings = test_settings();
    settings.backpressure.block_threshold = 10;
    settings.backpressure.unblock_threshold = 7;
    let session = Session::open(settings, None).await.unwrap();
    let _peer = attach_peer(&session, |options| {
        options.delay = Duration::from_millis(2);
    })
    .await;

    let report = session.bulk_loader(None).run(records(60)).await.unwrap();

    assert_eq!(report.sent, 60);
    assert_eq!(report.succeeded, 60);
    assert_eq!(report.failed, 0);
    assert_eq!(report.unresolved, 0);
    assert!(!report.aborted);

    session.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn non_critical_failures_are_counted_and_loading_continues() {
    let session = Session::open(test_settings(), None).await.unwrap();
    let _peer = attach_peer(&session, |options| {
        options.fail_payloads.insert("record-3".to_string());
        options.fail_payloads.insert("record-7".to_string());
    })
    .await;

    let report = session.bulk_loader(None).run(records(20)).await.unwrap();

    assert_eq!(report.sent, 20);
    assert_eq!(report.succeeded, 18);
    assert_eq!(report.failed, 2);

    session.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn critical_failure_aborts_the_load() {
    let session = Session::open(test_settings(), None).await.unwrap();
    let _peer = attach_peer(&session, |options| {
        options.critical_payloads.insert("record-0".to_string());
    })
    .await;

    let err = session.bulk_loader(None).run(records(5)).await.unwrap_err();
    match err {
        BridgeError::EngineLogic(error) => {
            assert!(error.critical);
            assert_eq!(error.code, resolver_bridge::peer::CRITICAL_FAILURE_CODE);
        }
        other => panic!("expected a critical engine failure, got {}", other),
    }

    session.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn redo_items_are_processed_and_deleted() {
    let mut settings = test_settings();
    settings.redo.batch_size = 2;
    settings.redo.divergence_threshold = 1_000;
    let (session, _peer) = open_with_peer(settings).await;
    let store = Arc::new(QueueStore::with_items(5));

    let report = session
        .bulk_loader(Some(store.clone()))
        .run(records(4))
        .await
        .unwrap();

    assert_eq!(report.sent, 4);
    assert_eq!(report.redo_processed, 5, "{:?}", report);
    assert_eq!(report.redo_rounds, 3);
    assert!(!report.redo_abandoned);
    assert_eq!(report.cleanup.failed, 0);
    assert_eq!(store.remaining(), 0);
    assert!(session.redo_gate().is_open());

    session.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn non_shrinking_redo_batches_are_abandoned() {
    let mut settings = test_settings();
    settings.redo.divergence_threshold = 2;
    let (session, _peer) = open_with_peer(settings).await;
    let store = Arc::new(StuckStore {
        fetches: AtomicUsize::new(0),
    });

    let report = session
        .bulk_loader(Some(store.clone()))
        .run(records(3))
        .await
        .unwrap();

    // Rounds 2 and 3 do not shrink; the fourth fetch exceeds the threshold.
    assert!(report.redo_abandoned);
    assert_eq!(report.redo_rounds, 3);
    assert_eq!(report.redo_processed, 9);
    assert_eq!(store.fetches.load(Ordering::SeqCst), 4);
    assert_eq!(report.succeeded, 12);

    session.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn acknowledged_redo_is_not_fetched_again_while_its_deletion_runs() {
    let mut settings = test_settings();
    settings.redo.batch_size = 10;
    settings.redo.divergence_threshold = 3;
    let (session, _peer) = open_with_peer(settings).await;
    let store = Arc::new(QueueStore::with_items(3).slow_deletes(Duration::from_millis(30)));

    let report = session
        .bulk_loader(Some(store.clone()))
        .run(records(1))
        .await
        .unwrap();

    // One round for the three items, then an empty fetch once they are deleted.
    assert_eq!(report.redo_rounds, 1, "{:?}", report);
    assert_eq!(report.redo_processed, 3);
    assert!(!report.redo_abandoned);
    assert_eq!(report.cleanup.deleted, 3);
    assert_eq!(store.fetches(), 2);
    assert_eq!(store.remaining(), 0);

    session.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_cleanup_closes_the_gate_and_stops_redo_fetching() {
    let mut settings = test_settings();
    settings.cleanup.max_retries = 1;
    settings.redo.batch_size = 10;
    let (session, _peer) = open_with_peer(settings).await;
    let store = Arc::new(QueueStore::with_items(3).always_busy());

    let report = session
        .bulk_loader(Some(store.clone()))
        .run(records(2))
        .await
        .unwrap();

    assert_eq!(report.redo_rounds, 1, "{:?}", report);
    assert_eq!(report.redo_processed, 3);
    assert_eq!(report.cleanup.failed, 3);
    assert_eq!(report.cleanup.deleted, 0);
    assert!(!report.redo_abandoned);
    assert!(!session.redo_gate().is_open());
    assert_eq!(store.fetches(), 1);
    assert_eq!(store.remaining(), 3);

    // The gate stays closed for later passes: ordinary records still load,
    // redo is not touched.
    let report = session
        .bulk_loader(Some(store.clone()))
        .run(records(2))
        .await
        .unwrap();
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.redo_rounds, 0);
    assert_eq!(store.fetches(), 1);

    session.shutdown().await;
}
