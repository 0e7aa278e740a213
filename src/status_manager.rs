use std::sync::{Arc, Weak};

use ahash::AHashMap as HashMap;
use futures::future::{self, BoxFuture, FutureExt};
use log::debug;
use parking_lot::RwLock;

use crate::errors::{ResolverError, Result};
use crate::hybrid_time::HybridTime;
use crate::transaction_id::TransactionId;

/// Lifecycle stage of a transaction as reported by the status oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    /// The transaction is running or committing and its intents are live.
    Pending,
    /// The transaction has committed. Its intents are visible at the commit time.
    Committed,
    /// The transaction has been aborted. Its intents are garbage.
    Aborted,
}

/// Answer of the status oracle for one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionStatusResult {
    pub status: TransactionStatus,
    /// Commit time for committed transactions, otherwise the time the status
    /// was observed at.
    pub status_time: HybridTime,
    pub priority: u64,
}

impl TransactionStatusResult {
    pub fn pending(priority: u64, status_time: HybridTime) -> Self {
        Self {
            status: TransactionStatus::Pending,
            status_time,
            priority,
        }
    }

    pub fn committed(priority: u64, commit_time: HybridTime) -> Self {
        Self {
            status: TransactionStatus::Committed,
            status_time: commit_time,
            priority,
        }
    }

    pub fn aborted(priority: u64) -> Self {
        Self {
            status: TransactionStatus::Aborted,
            status_time: HybridTime::INVALID,
            priority,
        }
    }
}

/// Authority for transaction state transitions and priorities.
///
/// The resolver holds a shared reference to an oracle; it is never reached
/// through global state. Implementations must make the abort-versus-commit
/// race atomic: exactly one of them wins and the loser can tell.
pub trait StatusOracle: Send + Sync {
    /// Status of `transaction_id` as of `read_ht`.
    ///
    /// Transient communication failures are reported as
    /// [`ResolverError::RemoteError`] and retried by the caller.
    fn check_status(
        &self,
        transaction_id: TransactionId,
        read_ht: HybridTime,
    ) -> BoxFuture<'_, Result<TransactionStatusResult>>;

    /// Requests an abort and returns the status after the request. A
    /// transaction that won the race against the abort reports `Committed`.
    fn abort(&self, transaction_id: TransactionId) -> BoxFuture<'_, Result<TransactionStatusResult>>;
}

/// Observer of transactions leaving the pending state.
pub trait StatusListener: Send + Sync {
    fn on_transaction_finished(&self, transaction_id: TransactionId, status: TransactionStatus);
}

#[derive(Debug, Clone)]
struct TransactionInfo {
    state: TransactionStatus,
    priority: u64,
    commit_time: Option<HybridTime>,
}

/// In-process status oracle.
///
/// Tracks state and priority for every registered transaction. All
/// transitions happen under one write lock, which is what makes abort and
/// commit mutually exclusive. Unknown transactions are reported as aborted,
/// matching what a coordinator reports after forgetting a transaction.
#[derive(Default)]
pub struct LocalStatusManager {
    transactions: RwLock<HashMap<TransactionId, TransactionInfo>>,
    listeners: RwLock<Vec<Weak<dyn StatusListener>>>,
}

impl LocalStatusManager {
    /// Creates a new `LocalStatusManager`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use intent_resolver::prelude::*;
    ///
    /// let status_manager = LocalStatusManager::new();
    /// let txn = TransactionId::generate();
    /// status_manager.register(txn, 100);
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new transaction as pending with the given priority.
    pub fn register(&self, transaction_id: TransactionId, priority: u64) {
        let info = TransactionInfo {
            state: TransactionStatus::Pending,
            priority,
            commit_time: None,
        };
        self.transactions.write().insert(transaction_id, info);
        debug!(
            "Registered Tx {} as Pending (priority {})",
            transaction_id, priority
        );
    }

    /// Subscribes `listener` to finished transactions. Only a weak reference
    /// is kept; a listener is dropped from the list once it is gone.
    pub fn add_listener(&self, listener: &Arc<dyn StatusListener>) {
        self.listeners.write().push(Arc::downgrade(listener));
    }

    /// Marks a pending transaction as committed at `commit_time`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::TransactionAborted`] when an abort won the race
    /// and [`ResolverError::IllegalState`] when the transaction is unknown.
    pub fn commit(&self, transaction_id: TransactionId, commit_time: HybridTime) -> Result<()> {
        {
            let mut transactions = self.transactions.write();
            let info = transactions.get_mut(&transaction_id).ok_or_else(|| {
                ResolverError::IllegalState(format!("Unknown transaction {}", transaction_id))
            })?;
            match info.state {
                TransactionStatus::Pending => {
                    info.state = TransactionStatus::Committed;
                    info.commit_time = Some(commit_time);
                    debug!(
                        "Marked Tx {} as Committed (commit time {})",
                        transaction_id, commit_time
                    );
                }
                TransactionStatus::Committed => return Ok(()),
                TransactionStatus::Aborted => {
                    return Err(ResolverError::TransactionAborted(transaction_id));
                }
            }
        }
        self.notify(transaction_id, TransactionStatus::Committed);
        Ok(())
    }

    /// Aborts a pending transaction. Returns the status after the attempt,
    /// which is `Committed` if the transaction committed first.
    pub fn abort_transaction(&self, transaction_id: TransactionId) -> TransactionStatusResult {
        let (result, changed) = {
            let mut transactions = self.transactions.write();
            match transactions.get_mut(&transaction_id) {
                Some(info) => match info.state {
                    TransactionStatus::Pending => {
                        info.state = TransactionStatus::Aborted;
                        debug!("Marked Tx {} as Aborted", transaction_id);
                        (TransactionStatusResult::aborted(info.priority), true)
                    }
                    _ => (Self::result_of(info), false),
                },
                None => (TransactionStatusResult::aborted(0), false),
            }
        };
        if changed {
            self.notify(transaction_id, TransactionStatus::Aborted);
        }
        result
    }

    pub fn status_of(&self, transaction_id: TransactionId) -> TransactionStatusResult {
        self.transactions
            .read()
            .get(&transaction_id)
            .map_or(TransactionStatusResult::aborted(0), Self::result_of)
    }

    /// Forgets a finished transaction. Pending transactions are kept.
    pub fn forget(&self, transaction_id: TransactionId) -> bool {
        let mut transactions = self.transactions.write();
        let finished = transactions
            .get(&transaction_id)
            .is_some_and(|info| info.state != TransactionStatus::Pending);
        if finished {
            transactions.remove(&transaction_id);
            debug!("Forgot finished transaction {}", transaction_id);
        }
        finished
    }

    fn result_of(info: &TransactionInfo) -> TransactionStatusResult {
        match info.state {
            TransactionStatus::Pending => {
                TransactionStatusResult::pending(info.priority, HybridTime::INVALID)
            }
            TransactionStatus::Committed => TransactionStatusResult::committed(
                info.priority,
                info.commit_time.unwrap_or(HybridTime::INVALID),
            ),
            TransactionStatus::Aborted => TransactionStatusResult::aborted(info.priority),
        }
    }

    // Runs without holding the transactions lock so listeners may call back.
    fn notify(&self, transaction_id: TransactionId, status: TransactionStatus) {
        let listeners: Vec<Arc<dyn StatusListener>> = {
            let mut listeners = self.listeners.write();
            listeners.retain(|listener| listener.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            listener.on_transaction_finished(transaction_id, status);
        }
    }
}

impl StatusOracle for LocalStatusManager {
    fn check_status(
        &self,
        transaction_id: TransactionId,
        read_ht: HybridTime,
    ) -> BoxFuture<'_, Result<TransactionStatusResult>> {
        let mut result = self.status_of(transaction_id);
        if result.status == TransactionStatus::Pending {
            result.status_time = read_ht;
        }
        future::ready(Ok(result)).boxed()
    }

    fn abort(&self, transaction_id: TransactionId) -> BoxFuture<'_, Result<TransactionStatusResult>> {
        future::ready(Ok(self.abort_transaction(transaction_id))).boxed()
    }
}
