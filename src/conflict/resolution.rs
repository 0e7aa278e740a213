use futures::future::BoxFuture;
use log::{debug, warn};

use crate::config::ResolverConfig;
use crate::errors::{ConflictReason, ResolverError, Result};
use crate::hybrid_time::HybridTime;
use crate::status_manager::{StatusOracle, TransactionStatus, TransactionStatusResult};
use crate::transaction_id::TransactionId;

/// Whose conflicts are being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionMode {
    /// A transaction with its own id and priority.
    Transaction { id: TransactionId, priority: u64 },
    /// A single non-transactional operation. It has no priority and never waits.
    Operation,
}

impl ResolutionMode {
    pub fn own_transaction(&self) -> Option<TransactionId> {
        match self {
            ResolutionMode::Transaction { id, .. } => Some(*id),
            ResolutionMode::Operation => None,
        }
    }
}

/// What to do about one conflicting transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Aborted, its intents are garbage.
    Ignore,
    /// Committed at the given time; the operation must be applied after it.
    Committed(HybridTime),
    /// Pending and losing to the caller.
    Abort,
    /// Pending and winning; the caller blocks until it finishes.
    Wait,
}

/// Result of aborting one transaction, after settling any race with its commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    Aborted,
    /// The transaction committed before the abort took effect.
    Committed(HybridTime),
}

/// Classifies conflicting transactions using the status oracle and priorities.
pub struct StatusResolutionPolicy<'a> {
    oracle: &'a dyn StatusOracle,
    config: &'a ResolverConfig,
    mode: ResolutionMode,
    resolution_ht: HybridTime,
    can_wait: bool,
}

impl<'a> StatusResolutionPolicy<'a> {
    pub fn new(
        oracle: &'a dyn StatusOracle,
        config: &'a ResolverConfig,
        mode: ResolutionMode,
        resolution_ht: HybridTime,
        can_wait: bool,
    ) -> Self {
        Self {
            oracle,
            config,
            mode,
            resolution_ht,
            can_wait,
        }
    }

    /// Status of `transaction_id` at the resolution time, retrying transient
    /// oracle failures.
    pub async fn fetch_status(&self, transaction_id: TransactionId) -> Result<TransactionStatusResult> {
        let oracle = self.oracle;
        let resolution_ht = self.resolution_ht;
        self.with_retries(move || oracle.check_status(transaction_id, resolution_ht))
            .await
    }

    /// Maps a status to a classification. Returns an error for conflicts the
    /// caller cannot get past without retrying.
    pub fn classify(
        &self,
        transaction_id: TransactionId,
        status: &TransactionStatusResult,
    ) -> Result<Classification> {
        match status.status {
            TransactionStatus::Aborted => Ok(Classification::Ignore),
            TransactionStatus::Committed => self.classify_committed(transaction_id, status.status_time),
            TransactionStatus::Pending => match self.mode {
                ResolutionMode::Operation => Ok(Classification::Abort),
                // A waiting caller never aborts an equal priority holder.
                ResolutionMode::Transaction { priority, .. } if self.can_wait => {
                    if priority > status.priority {
                        Ok(Classification::Abort)
                    } else {
                        Ok(Classification::Wait)
                    }
                }
                ResolutionMode::Transaction { id, priority } => {
                    if Self::wins(id, priority, transaction_id, status.priority) {
                        Ok(Classification::Abort)
                    } else {
                        Err(ResolverError::TransactionConflict {
                            our: id,
                            other: transaction_id,
                            reason: ConflictReason::HigherPriority,
                        })
                    }
                }
            },
        }
    }

    fn classify_committed(
        &self,
        transaction_id: TransactionId,
        commit_time: HybridTime,
    ) -> Result<Classification> {
        match self.mode {
            ResolutionMode::Operation => Ok(Classification::Committed(commit_time)),
            ResolutionMode::Transaction { .. } => Err(ResolverError::ConflictWithCommitted {
                transaction_id,
                commit_time,
            }),
        }
    }

    /// Optimistic priority comparison: strictly higher priority wins. Equal
    /// priorities fall back to the transaction id order, the smaller id winning.
    pub fn wins(
        own_id: TransactionId,
        own_priority: u64,
        other_id: TransactionId,
        other_priority: u64,
    ) -> bool {
        match own_priority.cmp(&other_priority) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => own_id < other_id,
        }
    }

    /// Aborts `transaction_id`. A transaction still pending after the abort
    /// request is checked again, and a commit that won the race is reported
    /// instead of success.
    pub async fn abort(&self, transaction_id: TransactionId) -> Result<AbortOutcome> {
        let oracle = self.oracle;
        for attempt in 1..=self.config.max_abort_attempts {
            let after_abort = self
                .with_retries(move || oracle.abort(transaction_id))
                .await?;
            let settled = match after_abort.status {
                TransactionStatus::Pending => self.fetch_status(transaction_id).await?,
                _ => after_abort,
            };
            match settled.status {
                TransactionStatus::Aborted => {
                    debug!("Aborted conflicting transaction {}", transaction_id);
                    return Ok(AbortOutcome::Aborted);
                }
                TransactionStatus::Committed => {
                    debug!(
                        "Transaction {} committed at {} before it could be aborted",
                        transaction_id, settled.status_time
                    );
                    return Ok(AbortOutcome::Committed(settled.status_time));
                }
                TransactionStatus::Pending => {
                    debug!(
                        "Transaction {} still pending after abort attempt {}",
                        transaction_id, attempt
                    );
                }
            }
        }
        match self.mode {
            ResolutionMode::Transaction { id, .. } => Err(ResolverError::TransactionConflict {
                our: id,
                other: transaction_id,
                reason: ConflictReason::AbortRace,
            }),
            ResolutionMode::Operation => Err(ResolverError::TryAgain(format!(
                "Transaction {} still pending after {} abort attempts",
                transaction_id, self.config.max_abort_attempts
            ))),
        }
    }

    async fn with_retries<T, F>(&self, mut call: F) -> Result<T>
    where
        F: FnMut() -> BoxFuture<'a, Result<T>>,
    {
        let mut failures = 0;
        loop {
            match call().await {
                Err(e) if e.is_transient() && failures < self.config.max_status_retries => {
                    failures += 1;
                    warn!(
                        "Status oracle call failed ({}), retry {} of {}",
                        e, failures, self.config.max_status_retries
                    );
                    tokio::time::sleep(self.config.status_retry_backoff).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(ResolverError::TryAgain(format!(
                        "Status oracle unavailable after {} retries: {}",
                        failures, e
                    )));
                }
                other => return other,
            }
        }
    }
}
