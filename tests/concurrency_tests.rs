mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use common::{TestCluster, ht, operation_request, row, transaction_request};
use futures::executor::block_on;
use intent_resolver::prelude::*;

#[test]
fn test_disjoint_keys_resolve_in_parallel() {
    let cluster = Arc::new(TestCluster::new());
    let resolver = cluster.optimistic_resolver();
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|idx| {
            let cluster = cluster.clone();
            let resolver = resolver.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let txn = cluster.begin(idx as u64);
                let request = transaction_request(txn, idx as u64, &row(idx as i64), ht(100));
                let lock_batch = cluster.lock(request.intents().unwrap());
                // Every thread holds its own batch while the others resolve.
                barrier.wait();
                let outcome = block_on(resolver.resolve_transaction_conflicts(request, lock_batch));
                println!("Tx {} resolved: {:?}", txn, outcome.result);
                assert_eq!(outcome.result, Ok(ht(100)));
                cluster.write_intents(txn, &row(idx as i64), ht(100));
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(cluster.conflicts_seen(), 0);
    assert_eq!(cluster.db.intent_count(), threads);
}

#[test]
fn test_overlapping_operations_serialize_on_lock_batch() {
    let cluster = Arc::new(TestCluster::new());
    let resolver = cluster.optimistic_resolver();
    let threads = 6;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|idx| {
            let cluster = cluster.clone();
            let resolver = resolver.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let request = operation_request(&row(1), ht(100 + idx as u64));
                let intents = request.intents().unwrap();
                barrier.wait();
                let lock_batch = cluster
                    .locks
                    .lock(intents, Instant::now() + Duration::from_secs(5))
                    .expect("lock batch");
                let outcome = block_on(resolver.resolve_operation_conflicts(request, lock_batch));
                let time = outcome.result.expect("resolution");
                // Apply strictly after any record already there.
                let applied = HybridTime::from_raw(time.raw() + 1);
                cluster
                    .db
                    .put_record(&row(1).encode(), DocHybridTime::new(applied, 0), b"v");
                println!("Operation {} applied at {}", idx, applied);
                drop(outcome.lock_batch);
                applied
            })
        })
        .collect();

    let mut times: Vec<HybridTime> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    times.sort();
    times.dedup();
    assert_eq!(times.len(), threads, "two operations applied at the same time");
    assert_eq!(cluster.db.record_count(), threads);
}

#[test]
fn test_concurrent_writers_on_one_key_leave_one_winner_pending() {
    let cluster = Arc::new(TestCluster::new());
    let resolver = cluster.optimistic_resolver();
    let threads = 4;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|idx| {
            let cluster = cluster.clone();
            let resolver = resolver.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let priority = 10 * (idx as u64 + 1);
                let txn = cluster.begin(priority);
                let request = transaction_request(txn, priority, &row(7), ht(100));
                let intents = request.intents().unwrap();
                barrier.wait();
                let lock_batch = cluster
                    .locks
                    .lock(intents, Instant::now() + Duration::from_secs(5))
                    .expect("lock batch");
                let outcome = block_on(resolver.resolve_transaction_conflicts(request, lock_batch));
                if outcome.result.is_ok() {
                    cluster.write_intents(txn, &row(7), ht(100));
                }
                println!("Tx {} (priority {}) resolved: {:?}", txn, priority, outcome.result);
                txn
            })
        })
        .collect();

    let txns: Vec<TransactionId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let pending = txns
        .iter()
        .filter(|txn| cluster.status.status_of(**txn).status == TransactionStatus::Pending)
        .count();
    // Every intent owner still pending conflicts with every other one.
    let pending_with_intents = txns
        .iter()
        .filter(|txn| cluster.status.status_of(**txn).status == TransactionStatus::Pending)
        .filter(|txn| {
            let mut iter = cluster.db.intents_iter();
            iter.seek(b"");
            let mut found = false;
            while iter.valid() {
                if decode_transaction_id_from_intent_value(iter.value()).unwrap() == **txn {
                    found = true;
                }
                iter.next();
            }
            found
        })
        .count();
    assert!(pending >= 1);
    assert_eq!(pending_with_intents, 1);
}
