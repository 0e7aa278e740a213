//! Common utilities for conflict resolver integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};
use intent_resolver::prelude::*;

/// Everything a resolver needs, backed by in-process implementations.
pub struct TestCluster {
    pub db: Arc<MemDocDb>,
    pub status: Arc<LocalStatusManager>,
    pub locks: Arc<SharedLockManager>,
    pub conflicts: Arc<AtomicU64>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            db: Arc::new(MemDocDb::new()),
            status: Arc::new(LocalStatusManager::new()),
            locks: SharedLockManager::new(),
            conflicts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Resolver without a wait queue.
    pub fn optimistic_resolver(&self) -> ConflictResolver {
        ConflictResolver::new(self.db.clone(), self.status.clone(), self.conflicts.clone())
    }

    /// Resolver whose wait queue is subscribed to the status manager.
    pub fn pessimistic_resolver(&self, config: ResolverConfig) -> (ConflictResolver, LocalWaitQueue) {
        let wait_queue = LocalWaitQueue::new(self.status.clone(), config.clone());
        self.status.add_listener(&wait_queue.listener());
        let resolver = self
            .optimistic_resolver()
            .with_config(config)
            .with_wait_queue(Arc::new(wait_queue.clone()));
        (resolver, wait_queue)
    }

    pub fn begin(&self, priority: u64) -> TransactionId {
        let transaction_id = TransactionId::generate();
        self.status.register(transaction_id, priority);
        transaction_id
    }

    /// Leaves the intents of a snapshot isolation write of `path`, the way a
    /// transaction that already resolved its conflicts would.
    pub fn write_intents(&self, transaction_id: TransactionId, path: &DocPath, at: HybridTime) {
        let source = DocOperationIntents {
            doc_ops: &[DocOperation::write(path.clone())],
            isolation: IsolationLevel::SnapshotIsolation,
        };
        let intents = collect_intents(&source, false).expect("intents");
        for (write_id, (key, types)) in intents.into_iter().enumerate() {
            self.db.put_intent(
                &key,
                types,
                DocHybridTime::new(at, write_id as u32),
                transaction_id,
                b"value",
            );
        }
    }

    pub fn commit(&self, transaction_id: TransactionId, commit_time: HybridTime) {
        self.status
            .commit(transaction_id, commit_time)
            .expect("commit");
        self.db
            .apply_intents_of(transaction_id, commit_time)
            .expect("apply intents");
    }

    pub fn lock(&self, intents: KeyToIntentTypeMap) -> LockBatch {
        self.locks
            .lock(intents, Instant::now() + Duration::from_secs(1))
            .expect("lock batch")
    }

    pub fn conflicts_seen(&self) -> u64 {
        self.conflicts.load(Ordering::SeqCst)
    }
}

pub fn ht(micros: u64) -> HybridTime {
    HybridTime::from_micros(micros)
}

pub fn row(key: i64) -> DocPath {
    DocPath::new([key])
}

pub fn transaction_request(
    transaction_id: TransactionId,
    priority: u64,
    path: &DocPath,
    resolution_ht: HybridTime,
) -> TransactionConflictRequest {
    TransactionConflictRequest {
        transaction_id,
        priority,
        isolation: IsolationLevel::SnapshotIsolation,
        doc_ops: vec![DocOperation::write(path.clone())],
        write_batch: KeyValueWriteBatch::default(),
        resolution_ht,
        read_time: None,
        partial_range_key_intents: false,
        deadline: Instant::now() + Duration::from_secs(5),
    }
}

pub fn operation_request(path: &DocPath, resolution_ht: HybridTime) -> OperationConflictRequest {
    OperationConflictRequest {
        doc_ops: vec![DocOperation::write(path.clone())],
        resolution_ht,
        partial_range_key_intents: false,
        deadline: Instant::now() + Duration::from_secs(5),
    }
}

/// Status oracle failing its first calls with a transient error.
pub struct FlakyOracle {
    pub inner: Arc<LocalStatusManager>,
    failures_left: AtomicUsize,
    pub calls: AtomicUsize,
}

impl FlakyOracle {
    pub fn new(inner: Arc<LocalStatusManager>, failures: usize) -> Self {
        Self {
            inner,
            failures_left: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }

    fn fail(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl StatusOracle for FlakyOracle {
    fn check_status(
        &self,
        transaction_id: TransactionId,
        read_ht: HybridTime,
    ) -> BoxFuture<'_, Result<TransactionStatusResult>> {
        if self.fail() {
            return futures::future::ready(Err(ResolverError::RemoteError(
                "coordinator unreachable".to_string(),
            )))
            .boxed();
        }
        self.inner.check_status(transaction_id, read_ht)
    }

    fn abort(&self, transaction_id: TransactionId) -> BoxFuture<'_, Result<TransactionStatusResult>> {
        if self.fail() {
            return futures::future::ready(Err(ResolverError::RemoteError(
                "coordinator unreachable".to_string(),
            )))
            .boxed();
        }
        self.inner.abort(transaction_id)
    }
}

/// Status oracle whose aborts always lose to a commit at `commit_time`.
pub struct CommittingOracle {
    pub inner: Arc<LocalStatusManager>,
    pub commit_time: HybridTime,
}

impl StatusOracle for CommittingOracle {
    fn check_status(
        &self,
        transaction_id: TransactionId,
        read_ht: HybridTime,
    ) -> BoxFuture<'_, Result<TransactionStatusResult>> {
        self.inner.check_status(transaction_id, read_ht)
    }

    fn abort(&self, transaction_id: TransactionId) -> BoxFuture<'_, Result<TransactionStatusResult>> {
        let _ = self.inner.commit(transaction_id, self.commit_time);
        self.inner.abort(transaction_id)
    }
}

/// Status oracle whose aborts never change the transaction's state.
///
/// With `report_aborted` it claims success anyway, otherwise it reports the
/// transaction as still pending.
pub struct IneffectiveAbortOracle {
    pub inner: Arc<LocalStatusManager>,
    pub report_aborted: bool,
    pub aborts: AtomicUsize,
}

impl IneffectiveAbortOracle {
    pub fn new(inner: Arc<LocalStatusManager>, report_aborted: bool) -> Self {
        Self {
            inner,
            report_aborted,
            aborts: AtomicUsize::new(0),
        }
    }

    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }
}

impl StatusOracle for IneffectiveAbortOracle {
    fn check_status(
        &self,
        transaction_id: TransactionId,
        read_ht: HybridTime,
    ) -> BoxFuture<'_, Result<TransactionStatusResult>> {
        self.inner.check_status(transaction_id, read_ht)
    }

    fn abort(&self, transaction_id: TransactionId) -> BoxFuture<'_, Result<TransactionStatusResult>> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        let current = self.inner.status_of(transaction_id);
        let reported = if self.report_aborted {
            TransactionStatusResult::aborted(current.priority)
        } else {
            current
        };
        futures::future::ready(Ok(reported)).boxed()
    }
}
