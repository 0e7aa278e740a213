use std::sync::Arc;
use std::time::Instant;

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use futures::future::{BoxFuture, FutureExt};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::config::ResolverConfig;
use crate::errors::{ResolverError, Result};
use crate::hybrid_time::HybridTime;
use crate::lock_manager::LockBatch;
use crate::status_manager::{StatusListener, StatusOracle, TransactionStatus};
use crate::transaction_id::TransactionId;

/// A suspended resolution handed to a wait queue.
///
/// The registration owns the caller's lock batch, already released, for as
/// long as the wait lasts.
#[derive(Debug)]
pub struct WaitRegistration {
    pub waiter: TransactionId,
    pub priority: u64,
    /// Every pending transaction the waiter must outlive.
    pub blockers: Vec<TransactionId>,
    pub lock_batch: LockBatch,
    pub deadline: Instant,
}

/// How a wait ended. The lock batch always comes back.
#[derive(Debug)]
pub struct WaitOutcome {
    /// Locked when `result` is `Ok`.
    pub lock_batch: LockBatch,
    pub result: Result<()>,
}

/// Pessimistic blocking on pending transactions.
pub trait WaitQueue: Send + Sync {
    /// Suspends the waiter until every blocker has left the pending state or
    /// the deadline passes, then reacquires its lock batch.
    fn wait_on(&self, registration: WaitRegistration) -> BoxFuture<'static, WaitOutcome>;
}

// Held by both the suspended wait and its queue entry, so that the queue can
// reacquire the locks of a ready waiter before signalling it.
type SharedLockBatch = Arc<Mutex<LockBatch>>;

struct Waiter {
    waiter: TransactionId,
    priority: u64,
    blockers: HashSet<TransactionId>,
    lock_batch: SharedLockBatch,
    resume: oneshot::Sender<Result<()>>,
}

impl Waiter {
    fn resume(self, result: Result<()>) {
        let Waiter {
            waiter,
            lock_batch,
            resume,
            ..
        } = self;
        // Give up the queue's handle first so the waiter can take the batch back.
        drop(lock_batch);
        if resume.send(result).is_err() {
            trace!("Transaction {} stopped waiting before it was resumed", waiter);
        }
    }
}

#[derive(Default)]
struct WaitState {
    waiters: HashMap<u64, Waiter>,
    // Blocker to the waiter entries it holds up.
    blocked: HashMap<TransactionId, HashSet<u64>>,
    next_entry: u64,
}

impl WaitState {
    // Detects whether `waiter` waiting on `blockers` would close a cycle in
    // the wait-for graph.
    fn closes_cycle(
        &self,
        waiter: TransactionId,
        blockers: impl IntoIterator<Item = TransactionId>,
    ) -> bool {
        let mut waits_for: HashMap<TransactionId, Vec<TransactionId>> = HashMap::new();
        for entry in self.waiters.values() {
            waits_for
                .entry(entry.waiter)
                .or_default()
                .extend(entry.blockers.iter().copied());
        }
        let mut visited = HashSet::new();
        let mut stack: Vec<TransactionId> = blockers.into_iter().collect();
        while let Some(current) = stack.pop() {
            if current == waiter {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(next) = waits_for.get(&current) {
                stack.extend(next.iter().copied());
            }
        }
        false
    }

    fn remove(&mut self, entry_id: u64) -> Option<Waiter> {
        let entry = self.waiters.remove(&entry_id)?;
        for blocker in &entry.blockers {
            let drained = match self.blocked.get_mut(blocker) {
                Some(entries) => {
                    entries.remove(&entry_id);
                    entries.is_empty()
                }
                None => false,
            };
            if drained {
                self.blocked.remove(blocker);
            }
        }
        Some(entry)
    }

    // Drops `blocker` from every waiter it holds up and returns the waiters
    // left with no blockers, highest priority first.
    fn release_blocker(&mut self, blocker: TransactionId) -> Vec<Waiter> {
        let Some(entries) = self.blocked.remove(&blocker) else {
            return Vec::new();
        };
        let mut ready = Vec::new();
        for entry_id in entries {
            let unblocked = match self.waiters.get_mut(&entry_id) {
                Some(entry) => {
                    entry.blockers.remove(&blocker);
                    entry.blockers.is_empty()
                }
                None => false,
            };
            if unblocked {
                ready.extend(self.remove(entry_id));
            }
        }
        ready.sort_by(|a, b| b.priority.cmp(&a.priority));
        ready
    }
}

struct WaitQueueShared {
    state: Mutex<WaitState>,
    oracle: Arc<dyn StatusOracle>,
    config: ResolverConfig,
}

impl WaitQueueShared {
    // Hands the entry back when registering it would close a wait cycle.
    fn register(&self, entry: Waiter) -> std::result::Result<u64, Waiter> {
        let mut state = self.state.lock();
        if state.closes_cycle(entry.waiter, entry.blockers.iter().copied()) {
            warn!(
                "Transaction {} waiting on {:?} closes a wait cycle",
                entry.waiter, entry.blockers
            );
            return Err(entry);
        }
        let entry_id = state.next_entry;
        state.next_entry += 1;
        for blocker in &entry.blockers {
            state.blocked.entry(*blocker).or_default().insert(entry_id);
        }
        debug!(
            "Transaction {} waits on {} blocker(s)",
            entry.waiter,
            entry.blockers.len()
        );
        state.waiters.insert(entry_id, entry);
        Ok(entry_id)
    }

    fn finished(&self, transaction_id: TransactionId, status: TransactionStatus) {
        let (ready, aborted) = {
            let mut state = self.state.lock();
            let ready = state.release_blocker(transaction_id);
            let aborted: Vec<Waiter> = if status == TransactionStatus::Aborted {
                let ids: Vec<u64> = state
                    .waiters
                    .iter()
                    .filter(|(_, entry)| entry.waiter == transaction_id)
                    .map(|(id, _)| *id)
                    .collect();
                ids.into_iter().filter_map(|id| state.remove(id)).collect()
            } else {
                Vec::new()
            };
            (ready, aborted)
        };
        // Ready waiters take their locks in priority order without blocking;
        // whoever loses a contended key polls for it after resuming.
        for entry in ready {
            if let Err(e) = entry.lock_batch.lock().relock(Instant::now()) {
                trace!(
                    "Transaction {} resumes without its locks: {}",
                    entry.waiter, e
                );
            }
            trace!("Resuming transaction {}", entry.waiter);
            entry.resume(Ok(()));
        }
        for entry in aborted {
            debug!("Waiting transaction {} was aborted", entry.waiter);
            let waiter = entry.waiter;
            entry.resume(Err(ResolverError::TransactionAborted(waiter)));
        }
    }

    // Blockers may have finished before the waiter was registered, in which
    // case no notification will ever arrive for them.
    async fn recheck_blockers(&self, blockers: &[TransactionId]) {
        for blocker in blockers {
            match self.oracle.check_status(*blocker, HybridTime::MAX).await {
                Ok(status) if status.status != TransactionStatus::Pending => {
                    self.finished(*blocker, status.status);
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to re-check blocker {}: {}", blocker, e),
            }
        }
    }

    fn expire(&self, entry_id: u64) -> usize {
        self.state
            .lock()
            .remove(entry_id)
            .map_or(0, |entry| entry.blockers.len())
    }

    fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

impl StatusListener for WaitQueueShared {
    fn on_transaction_finished(&self, transaction_id: TransactionId, status: TransactionStatus) {
        self.finished(transaction_id, status);
    }
}

// Takes sole ownership of the batch back. The queue entry drops its handle
// before resuming, so this only yields when a resume races with expiry.
async fn reclaim(mut shared: SharedLockBatch) -> LockBatch {
    loop {
        match Arc::try_unwrap(shared) {
            Ok(lock_batch) => return lock_batch.into_inner(),
            Err(still_shared) => {
                shared = still_shared;
                tokio::task::yield_now().await;
            }
        }
    }
}

/// In-process wait queue.
///
/// Learns about finished blockers through [`StatusListener`]; subscribe
/// [`LocalWaitQueue::listener`] to the oracle that drives transaction state.
/// Ready waiters get their lock batches back highest priority first, before
/// they are resumed.
#[derive(Clone)]
pub struct LocalWaitQueue {
    inner: Arc<WaitQueueShared>,
}

impl LocalWaitQueue {
    pub fn new(oracle: Arc<dyn StatusOracle>, config: ResolverConfig) -> Self {
        Self {
            inner: Arc::new(WaitQueueShared {
                state: Mutex::new(WaitState::default()),
                oracle,
                config,
            }),
        }
    }

    /// Listener to register with the status oracle.
    pub fn listener(&self) -> Arc<dyn StatusListener> {
        self.inner.clone()
    }

    /// Reports a finished transaction, for oracles without listener support.
    pub fn transaction_finished(&self, transaction_id: TransactionId, status: TransactionStatus) {
        self.inner.finished(transaction_id, status);
    }

    /// Number of suspended waiters.
    pub fn waiting(&self) -> usize {
        self.inner.waiting()
    }
}

impl WaitQueue for LocalWaitQueue {
    fn wait_on(&self, registration: WaitRegistration) -> BoxFuture<'static, WaitOutcome> {
        let inner = Arc::clone(&self.inner);
        async move {
            let WaitRegistration {
                waiter,
                priority,
                blockers,
                lock_batch,
                deadline,
            } = registration;
            let lock_batch: SharedLockBatch = Arc::new(Mutex::new(lock_batch));
            let (resume, resumed) = oneshot::channel();
            let entry = Waiter {
                waiter,
                priority,
                blockers: blockers.iter().copied().collect(),
                lock_batch: Arc::clone(&lock_batch),
                resume,
            };

            let wait_result = match inner.register(entry) {
                Ok(entry_id) => {
                    inner.recheck_blockers(&blockers).await;
                    let timeout = tokio::time::Instant::from_std(deadline);
                    match tokio::time::timeout_at(timeout, resumed).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(_)) => Err(ResolverError::IllegalState(
                            "Wait queue entry dropped without resuming".to_string(),
                        )),
                        Err(_) => {
                            let left = inner.expire(entry_id);
                            debug!(
                                "Wait of transaction {} expired with {} blocker(s) left",
                                waiter, left
                            );
                            Err(ResolverError::Expired { blockers: left })
                        }
                    }
                }
                Err(rejected) => {
                    drop(rejected);
                    Err(ResolverError::Deadlock(waiter))
                }
            };

            let mut lock_batch = reclaim(lock_batch).await;
            let relock_deadline = deadline + inner.config.lock_reacquire_grace;
            let result = match lock_batch.relock_async(relock_deadline).await {
                Ok(()) => wait_result,
                Err(relock_error) => {
                    warn!("Failed to reacquire lock batch after wait: {}", relock_error);
                    match wait_result {
                        Ok(()) => Err(ResolverError::Expired { blockers: 0 }),
                        Err(e) => Err(e),
                    }
                }
            };
            WaitOutcome { lock_batch, result }
        }
        .boxed()
    }
}
