mod common;

use std::time::{Duration, Instant};

use common::{TestCluster, ht, row, transaction_request};
use intent_resolver::prelude::*;
use tokio::sync::oneshot;

fn wait_config() -> ResolverConfig {
    ResolverConfig {
        lock_reacquire_grace: Duration::from_millis(50),
        ..ResolverConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lower_priority_waits_until_blocker_aborts() {
    let cluster = TestCluster::new();
    let (resolver, wait_queue) = cluster.pessimistic_resolver(wait_config());
    let txn_a = cluster.begin(10);
    let txn_b = cluster.begin(1);
    cluster.write_intents(txn_a, &row(1), ht(50));

    let request = transaction_request(txn_b, 1, &row(1), ht(100));
    let lock_batch = cluster.lock(request.intents().unwrap());
    let waiter = tokio::spawn(async move {
        resolver
            .resolve_transaction_conflicts(request, lock_batch)
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished(), "B completed while A is pending");
    assert_eq!(wait_queue.waiting(), 1);

    cluster.status.abort_transaction(txn_a);
    let outcome = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("B resumed")
        .unwrap();

    assert_eq!(outcome.result, Ok(ht(100)));
    assert!(outcome.lock_batch.is_locked());
    assert_eq!(wait_queue.waiting(), 0);
    assert_eq!(cluster.conflicts_seen(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_waiter_reclassifies_after_blocker_commits() {
    let cluster = TestCluster::new();
    let (resolver, _wait_queue) = cluster.pessimistic_resolver(wait_config());
    let txn_a = cluster.begin(10);
    let txn_b = cluster.begin(1);
    cluster.write_intents(txn_a, &row(1), ht(50));

    let mut request = transaction_request(txn_b, 1, &row(1), ht(100));
    request.read_time = Some(ht(60));
    let lock_batch = cluster.lock(request.intents().unwrap());
    let waiter = tokio::spawn(async move {
        resolver
            .resolve_transaction_conflicts(request, lock_batch)
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cluster.commit(txn_a, ht(80));
    let outcome = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("B resumed")
        .unwrap();

    // Depending on whether the intents were applied before B looked again,
    // B meets either the committed record or the committed intents.
    match outcome.result {
        Err(ResolverError::WriteAfterRead {
            write_time,
            read_time,
        }) => {
            assert_eq!(write_time, ht(80));
            assert_eq!(read_time, ht(60));
        }
        Err(ResolverError::ConflictWithCommitted {
            transaction_id,
            commit_time,
        }) => {
            assert_eq!(transaction_id, txn_a);
            assert_eq!(commit_time, ht(80));
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert!(outcome.lock_batch.is_locked());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_expires_with_lock_batch_held() {
    let cluster = TestCluster::new();
    let (resolver, wait_queue) = cluster.pessimistic_resolver(wait_config());
    let txn_a = cluster.begin(10);
    let txn_b = cluster.begin(1);
    cluster.write_intents(txn_a, &row(1), ht(50));

    let mut request = transaction_request(txn_b, 1, &row(1), ht(100));
    let deadline = Instant::now() + Duration::from_millis(150);
    request.deadline = deadline;
    let lock_batch = cluster.lock(request.intents().unwrap());
    let outcome = resolver
        .resolve_transaction_conflicts(request, lock_batch)
        .await;
    let finished = Instant::now();

    assert!(matches!(
        outcome.result,
        Err(ResolverError::Expired { blockers: 1 })
    ));
    assert!(outcome.result.as_ref().unwrap_err().is_retryable());
    assert!(finished < deadline + Duration::from_millis(200));
    assert!(outcome.lock_batch.is_locked());
    assert_eq!(wait_queue.waiting(), 0);
    assert_eq!(cluster.status.status_of(txn_a).status, TransactionStatus::Pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocker_finished_before_registration_is_noticed() {
    let cluster = TestCluster::new();
    let wait_queue = LocalWaitQueue::new(cluster.status.clone(), wait_config());
    // Not subscribed: finished blockers are only found by the re-check.
    let txn_a = cluster.begin(10);
    let txn_b = cluster.begin(1);
    cluster.status.abort_transaction(txn_a);

    let outcome = wait_queue
        .wait_on(WaitRegistration {
            waiter: txn_b,
            priority: 1,
            blockers: vec![txn_a],
            lock_batch: {
                let mut batch = cluster.lock(cluster_intents(1));
                batch.unlock();
                batch
            },
            deadline: Instant::now() + Duration::from_secs(2),
        })
        .await;

    assert_eq!(outcome.result, Ok(()));
    assert!(outcome.lock_batch.is_locked());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_cycle_fails_newcomer_with_deadlock() {
    let cluster = TestCluster::new();
    let (_resolver, wait_queue) = cluster.pessimistic_resolver(wait_config());
    let txn_a = cluster.begin(1);
    let txn_b = cluster.begin(1);

    let mut first_batch = cluster.lock(cluster_intents(1));
    first_batch.unlock();
    let first = wait_queue.wait_on(WaitRegistration {
        waiter: txn_a,
        priority: 1,
        blockers: vec![txn_b],
        lock_batch: first_batch,
        deadline: Instant::now() + Duration::from_secs(2),
    });
    let first = tokio::spawn(first);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut second_batch = cluster.lock(cluster_intents(2));
    second_batch.unlock();
    let second = wait_queue
        .wait_on(WaitRegistration {
            waiter: txn_b,
            priority: 1,
            blockers: vec![txn_a],
            lock_batch: second_batch,
            deadline: Instant::now() + Duration::from_secs(2),
        })
        .await;

    match &second.result {
        Err(err @ ResolverError::Deadlock(id)) => {
            assert_eq!(*id, txn_b);
            assert!(err.is_retryable());
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert!(second.lock_batch.is_locked());

    cluster.status.abort_transaction(txn_b);
    let first = first.await.unwrap();
    assert_eq!(first.result, Ok(()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_aborted_waiter_stops_waiting() {
    let cluster = TestCluster::new();
    let (resolver, _wait_queue) = cluster.pessimistic_resolver(wait_config());
    let txn_a = cluster.begin(10);
    let txn_b = cluster.begin(1);
    cluster.write_intents(txn_a, &row(1), ht(50));

    let request = transaction_request(txn_b, 1, &row(1), ht(100));
    let lock_batch = cluster.lock(request.intents().unwrap());
    let waiter = tokio::spawn(async move {
        resolver
            .resolve_transaction_conflicts(request, lock_batch)
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cluster.status.abort_transaction(txn_b);
    let outcome = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("B resumed")
        .unwrap();

    assert_eq!(outcome.result, Err(ResolverError::TransactionAborted(txn_b)));
    assert!(outcome.lock_batch.is_locked());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deferred_callback_runs_after_resume() {
    let cluster = TestCluster::new();
    let (resolver, _wait_queue) = cluster.pessimistic_resolver(wait_config());
    let txn_a = cluster.begin(10);
    let txn_b = cluster.begin(1);
    cluster.write_intents(txn_a, &row(1), ht(50));

    let request = transaction_request(txn_b, 1, &row(1), ht(100));
    let lock_batch = cluster.lock(request.intents().unwrap());
    let (done, mut finished) = oneshot::channel();
    resolver.resolve_transaction_conflicts_with_callback(
        request,
        lock_batch,
        ResolutionCallback::new(move |outcome| {
            let _ = done.send(outcome);
        }),
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(finished.try_recv().is_err(), "callback ran before A finished");

    cluster.status.abort_transaction(txn_a);
    let outcome = tokio::time::timeout(Duration::from_secs(2), finished)
        .await
        .expect("callback ran")
        .unwrap();
    assert_eq!(outcome.result, Ok(ht(100)));
    assert!(outcome.lock_batch.is_locked());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_equal_priority_waits_instead_of_aborting() {
    let cluster = TestCluster::new();
    let (resolver, wait_queue) = cluster.pessimistic_resolver(wait_config());
    // The requester would win the optimistic id tie-break.
    let holder = TransactionId::from_bytes([2; 16]);
    let requester = TransactionId::from_bytes([1; 16]);
    cluster.status.register(holder, 5);
    cluster.status.register(requester, 5);
    cluster.write_intents(holder, &row(1), ht(50));

    let request = transaction_request(requester, 5, &row(1), ht(100));
    let lock_batch = cluster.lock(request.intents().unwrap());
    let waiter = tokio::spawn(async move {
        resolver
            .resolve_transaction_conflicts(request, lock_batch)
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished(), "requester did not wait");
    assert_eq!(wait_queue.waiting(), 1);
    assert_eq!(cluster.status.status_of(holder).status, TransactionStatus::Pending);

    cluster.status.abort_transaction(holder);
    let outcome = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("requester resumed")
        .unwrap();
    assert_eq!(outcome.result, Ok(ht(100)));
    assert!(outcome.lock_batch.is_locked());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_relock_failure_after_wait_returns_unlocked_batch() {
    let cluster = TestCluster::new();
    let (resolver, _wait_queue) = cluster.pessimistic_resolver(wait_config());
    let txn_a = cluster.begin(10);
    let txn_b = cluster.begin(1);
    cluster.write_intents(txn_a, &row(1), ht(50));

    let mut request = transaction_request(txn_b, 1, &row(1), ht(100));
    let deadline = Instant::now() + Duration::from_millis(300);
    request.deadline = deadline;
    let intents = request.intents().unwrap();
    let lock_batch = cluster.lock(intents.clone());
    let waiter = tokio::spawn(async move {
        resolver
            .resolve_transaction_conflicts(request, lock_batch)
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    // Taken while B is suspended and held past B's deadline plus grace.
    let intruder = cluster.lock(intents);
    cluster.status.abort_transaction(txn_a);
    let outcome = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("B gave up")
        .unwrap();
    let finished = Instant::now();

    assert_eq!(outcome.result, Err(ResolverError::Expired { blockers: 0 }));
    assert!(!outcome.lock_batch.is_locked());
    assert!(finished >= deadline + wait_config().lock_reacquire_grace);
    assert!(intruder.is_locked());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ready_waiters_take_locks_by_priority() {
    let cluster = TestCluster::new();
    let (resolver, wait_queue) = cluster.pessimistic_resolver(wait_config());
    let txn_a = cluster.begin(10);
    let txn_b = cluster.begin(1);
    let txn_c = cluster.begin(3);
    cluster.write_intents(txn_a, &row(1), ht(50));

    let mut waiters = Vec::new();
    for (txn, priority) in [(txn_b, 1), (txn_c, 3)] {
        let request = transaction_request(txn, priority, &row(1), ht(100));
        let lock_batch = cluster.lock(request.intents().unwrap());
        let resolver = resolver.clone();
        waiters.push(tokio::spawn(async move {
            resolver
                .resolve_transaction_conflicts(request, lock_batch)
                .await
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(wait_queue.waiting(), 2);
    let low = waiters.remove(0);
    let high = waiters.remove(0);

    cluster.status.abort_transaction(txn_a);
    let high = tokio::time::timeout(Duration::from_secs(2), high)
        .await
        .expect("C resumed")
        .unwrap();
    assert_eq!(high.result, Ok(ht(100)));
    assert!(high.lock_batch.is_locked());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!low.is_finished(), "B got the key while C holds it");
    drop(high);
    let low = tokio::time::timeout(Duration::from_secs(2), low)
        .await
        .expect("B resumed")
        .unwrap();
    assert_eq!(low.result, Ok(ht(100)));
    assert!(low.lock_batch.is_locked());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reported_finish_resumes_unsubscribed_queue() {
    let cluster = TestCluster::new();
    let wait_queue = LocalWaitQueue::new(cluster.status.clone(), wait_config());
    let txn_a = cluster.begin(10);
    let txn_b = cluster.begin(1);

    let mut lock_batch = cluster.lock(cluster_intents(1));
    lock_batch.unlock();
    let waiter = tokio::spawn(wait_queue.wait_on(WaitRegistration {
        waiter: txn_b,
        priority: 1,
        blockers: vec![txn_a],
        lock_batch,
        deadline: Instant::now() + Duration::from_secs(2),
    }));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(wait_queue.waiting(), 1);
    wait_queue.transaction_finished(txn_a, TransactionStatus::Committed);
    let outcome = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("B resumed")
        .unwrap();

    assert_eq!(outcome.result, Ok(()));
    assert!(outcome.lock_batch.is_locked());
    assert_eq!(wait_queue.waiting(), 0);
}

fn cluster_intents(key: i64) -> KeyToIntentTypeMap {
    let mut intents = KeyToIntentTypeMap::new();
    intents.insert(
        row(key).encode(),
        IsolationLevel::SnapshotIsolation.strong_write_intents(),
    );
    intents
}
