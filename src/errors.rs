use thiserror::Error;

use crate::hybrid_time::HybridTime;
use crate::transaction_id::TransactionId;

/// Why a conflicting transaction forced the caller to give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// The other transaction is pending and has a higher priority.
    HigherPriority,
    /// The other transaction kept flipping state while we tried to abort it.
    AbortRace,
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictReason::HigherPriority => f.write_str("higher priority"),
            ConflictReason::AbortRace => f.write_str("racing"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolverError {
    /// A stored key or value does not follow the intent layout.
    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Transaction {our} conflicts with {reason} transaction {other}")]
    TransactionConflict {
        our: TransactionId,
        other: TransactionId,
        reason: ConflictReason,
    },

    /// The caller must advance its clock past `commit_time` before retrying.
    #[error("Conflicts with committed transaction {transaction_id} (commit time {commit_time})")]
    ConflictWithCommitted {
        transaction_id: TransactionId,
        commit_time: HybridTime,
    },

    #[error("Value write after transaction start: {write_time} > {read_time}")]
    WriteAfterRead {
        write_time: HybridTime,
        read_time: HybridTime,
    },

    #[error("Deadline exceeded while waiting on {blockers} blocking transaction(s)")]
    Expired { blockers: usize },

    #[error("Deadlock detected: transaction {0} is part of a wait cycle")]
    Deadlock(TransactionId),

    #[error("Try again: {0}")]
    TryAgain(String),

    /// Transient failure talking to the status oracle.
    #[error("Status oracle error: {0}")]
    RemoteError(String),

    #[error("Transaction {0} was aborted")]
    TransactionAborted(TransactionId),

    #[error("Illegal state: {0}")]
    IllegalState(String),
}

impl ResolverError {
    /// Returns true when the caller may retry the whole operation.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ResolverError::Corruption(_) | ResolverError::IllegalState(_)
        )
    }

    /// Returns true for failures the resolver retries locally before
    /// surfacing them.
    pub fn is_transient(&self) -> bool {
        matches!(self, ResolverError::RemoteError(_))
    }
}

pub type Result<T> = std::result::Result<T, ResolverError>;
