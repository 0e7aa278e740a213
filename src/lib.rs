pub mod config;
pub mod conflict;
pub mod data_store;
pub mod dockv;
pub mod errors;
pub mod hybrid_time;
pub mod isolation;
pub mod lock_manager;
pub mod metrics;
pub mod operations;
pub mod resolver;
pub mod status_manager;
pub mod storage;
pub mod transaction_id;
pub mod wait_queue;

// Re-export key types and structs for easier access
pub use config::ResolverConfig;
pub use data_store::mem_store::MemDocDb;
pub use errors::{ResolverError, Result};
pub use hybrid_time::{DocHybridTime, HybridTime};
pub use isolation::IsolationLevel;
pub use lock_manager::{LockBatch, SharedLockManager};
pub use resolver::{
    ConflictResolver, OperationConflictRequest, ResolutionCallback, ResolutionOutcome,
    TransactionConflictRequest,
};
pub use status_manager::{LocalStatusManager, StatusOracle};
pub use storage::DocDb;
pub use transaction_id::TransactionId;
pub use wait_queue::{LocalWaitQueue, WaitQueue};

/// Resolver prelude
pub mod prelude {
    pub use crate::conflict::detection::*;
    pub use crate::conflict::intent_codec::*;
    pub use crate::dockv::*;
    pub use crate::errors::*;
    pub use crate::metrics::*;
    pub use crate::operations::*;
    pub use crate::status_manager::*;
    pub use crate::storage::*;
    pub use crate::wait_queue::*;
    pub use crate::*;
}
