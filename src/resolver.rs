use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashSet as HashSet;
use futures::future::{BoxFuture, FutureExt};
use log::{debug, error, trace};
use tokio::runtime::Handle;

use crate::config::ResolverConfig;
use crate::conflict::detection::detect_conflicts;
use crate::conflict::resolution::{
    AbortOutcome, Classification, ResolutionMode, StatusResolutionPolicy,
};
use crate::dockv::{KeyToIntentTypeMap, hex_dump};
use crate::errors::{ResolverError, Result};
use crate::hybrid_time::HybridTime;
use crate::isolation::IsolationLevel;
use crate::lock_manager::LockBatch;
use crate::metrics::CounterSink;
use crate::operations::{
    DocOperation, DocOperationIntents, KeyValueWriteBatch, TransactionIntents, collect_intents,
};
use crate::status_manager::StatusOracle;
use crate::storage::DocDb;
use crate::transaction_id::TransactionId;
use crate::wait_queue::{WaitOutcome, WaitQueue, WaitRegistration};

/// Conflict resolution request of one transaction.
#[derive(Debug, Clone)]
pub struct TransactionConflictRequest {
    pub transaction_id: TransactionId,
    pub priority: u64,
    pub isolation: IsolationLevel,
    pub doc_ops: Vec<DocOperation>,
    pub write_batch: KeyValueWriteBatch,
    pub resolution_ht: HybridTime,
    /// Start time of the transaction. Committed records newer than this on a
    /// written path fail the resolution.
    pub read_time: Option<HybridTime>,
    pub partial_range_key_intents: bool,
    pub deadline: Instant,
}

impl TransactionConflictRequest {
    /// Keys with intent types the caller has to lock before resolving.
    pub fn intents(&self) -> Result<KeyToIntentTypeMap> {
        let source = TransactionIntents {
            doc_ops: &self.doc_ops,
            write_batch: &self.write_batch,
            isolation: self.isolation,
        };
        collect_intents(&source, self.partial_range_key_intents)
    }
}

/// Conflict resolution request of a single non-transactional operation.
#[derive(Debug, Clone)]
pub struct OperationConflictRequest {
    pub doc_ops: Vec<DocOperation>,
    pub resolution_ht: HybridTime,
    pub partial_range_key_intents: bool,
    pub deadline: Instant,
}

impl OperationConflictRequest {
    /// Keys with intent types the caller has to lock before resolving.
    pub fn intents(&self) -> Result<KeyToIntentTypeMap> {
        let source = DocOperationIntents {
            doc_ops: &self.doc_ops,
            isolation: IsolationLevel::SnapshotIsolation,
        };
        collect_intents(&source, self.partial_range_key_intents)
    }
}

/// Result of one resolution together with the caller's lock batch.
///
/// The batch is locked whenever `result` is `Ok`. On error it is handed back
/// in whatever state the failure left it, usually still locked.
#[derive(Debug)]
pub struct ResolutionOutcome {
    /// Hybrid time the operation may be applied at.
    pub result: Result<HybridTime>,
    pub lock_batch: LockBatch,
}

/// Single-shot completion slot.
///
/// Invoking it twice is a programming error and panics.
pub struct ResolutionCallback {
    callback: Option<Box<dyn FnOnce(ResolutionOutcome) + Send>>,
}

impl ResolutionCallback {
    pub fn new(callback: impl FnOnce(ResolutionOutcome) + Send + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    pub fn is_invoked(&self) -> bool {
        self.callback.is_none()
    }

    pub fn invoke(&mut self, outcome: ResolutionOutcome) {
        match self.callback.take() {
            Some(callback) => callback(outcome),
            None => panic!("ResolutionCallback invoked more than once"),
        }
    }
}

impl Drop for ResolutionCallback {
    fn drop(&mut self) {
        if self.callback.is_some() {
            error!("ResolutionCallback dropped without being invoked");
        }
    }
}

impl fmt::Debug for ResolutionCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolutionCallback")
            .field("invoked", &self.is_invoked())
            .finish()
    }
}

struct ResolutionContext {
    mode: ResolutionMode,
    intents: KeyToIntentTypeMap,
    resolution_ht: HybridTime,
    read_time: Option<HybridTime>,
    deadline: Instant,
}

#[derive(Default)]
struct ResolutionState {
    rounds: usize,
    seen: HashSet<TransactionId>,
    fence: Option<HybridTime>,
}

impl ResolutionState {
    fn fold(&mut self, time: HybridTime) {
        self.fence = self.fence.max(Some(time));
    }
}

enum Round {
    Done,
    Recollect,
    Wait(Vec<TransactionId>),
}

/// Decides whether a write may proceed against the intents and records
/// already in the store.
///
/// Cheap to clone: all collaborators are shared.
#[derive(Clone)]
pub struct ConflictResolver {
    store: Arc<dyn DocDb>,
    status_oracle: Arc<dyn StatusOracle>,
    conflicts_metric: Arc<dyn CounterSink>,
    wait_queue: Option<Arc<dyn WaitQueue>>,
    config: ResolverConfig,
    runtime: Option<Handle>,
}

impl ConflictResolver {
    /// Creates an optimistic resolver: conflicts with higher priority pending
    /// transactions fail instead of waiting.
    pub fn new(
        store: Arc<dyn DocDb>,
        status_oracle: Arc<dyn StatusOracle>,
        conflicts_metric: Arc<dyn CounterSink>,
    ) -> Self {
        Self {
            store,
            status_oracle,
            conflicts_metric,
            wait_queue: None,
            config: ResolverConfig::default(),
            runtime: None,
        }
    }

    /// Makes the resolver pessimistic: losing transactions wait on `wait_queue`.
    pub fn with_wait_queue(mut self, wait_queue: Arc<dyn WaitQueue>) -> Self {
        self.wait_queue = Some(wait_queue);
        self
    }

    pub fn with_config(mut self, config: ResolverConfig) -> Self {
        self.config = config;
        self
    }

    /// Runtime for resolutions started through the callback entry points.
    /// Defaults to the runtime of the calling thread.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolves the conflicts of a transaction's writes. `lock_batch` must
    /// already hold every key of [`TransactionConflictRequest::intents`].
    pub async fn resolve_transaction_conflicts(
        &self,
        request: TransactionConflictRequest,
        lock_batch: LockBatch,
    ) -> ResolutionOutcome {
        debug!(
            "Resolving conflicts of transaction {} at {}",
            request.transaction_id, request.resolution_ht
        );
        let context = request.intents().map(|intents| ResolutionContext {
            mode: ResolutionMode::Transaction {
                id: request.transaction_id,
                priority: request.priority,
            },
            intents,
            resolution_ht: request.resolution_ht,
            read_time: request.read_time,
            deadline: request.deadline,
        });
        self.resolve(context, lock_batch).await
    }

    /// Resolves the conflicts of a non-transactional operation. Pending
    /// conflicting transactions are always aborted.
    pub async fn resolve_operation_conflicts(
        &self,
        request: OperationConflictRequest,
        lock_batch: LockBatch,
    ) -> ResolutionOutcome {
        debug!("Resolving operation conflicts at {}", request.resolution_ht);
        let context = request.intents().map(|intents| ResolutionContext {
            mode: ResolutionMode::Operation,
            intents,
            resolution_ht: request.resolution_ht,
            read_time: None,
            deadline: request.deadline,
        });
        self.resolve(context, lock_batch).await
    }

    /// Callback flavour of [`resolve_transaction_conflicts`](Self::resolve_transaction_conflicts).
    ///
    /// Immediate resolutions invoke `callback` before this returns. Otherwise
    /// the resolution continues on the runtime and `callback` runs there.
    pub fn resolve_transaction_conflicts_with_callback(
        &self,
        request: TransactionConflictRequest,
        lock_batch: LockBatch,
        callback: ResolutionCallback,
    ) {
        let resolver = self.clone();
        self.dispatch(lock_batch, callback, move |lock_batch| {
            async move {
                resolver
                    .resolve_transaction_conflicts(request, lock_batch)
                    .await
            }
            .boxed()
        });
    }

    /// Callback flavour of [`resolve_operation_conflicts`](Self::resolve_operation_conflicts).
    pub fn resolve_operation_conflicts_with_callback(
        &self,
        request: OperationConflictRequest,
        lock_batch: LockBatch,
        callback: ResolutionCallback,
    ) {
        let resolver = self.clone();
        self.dispatch(lock_batch, callback, move |lock_batch| {
            async move {
                resolver
                    .resolve_operation_conflicts(request, lock_batch)
                    .await
            }
            .boxed()
        });
    }

    fn dispatch<F>(&self, lock_batch: LockBatch, mut callback: ResolutionCallback, start: F)
    where
        F: FnOnce(LockBatch) -> BoxFuture<'static, ResolutionOutcome>,
    {
        let handle = match self.runtime.clone().or_else(|| Handle::try_current().ok()) {
            Some(handle) => handle,
            None => {
                callback.invoke(ResolutionOutcome {
                    result: Err(ResolverError::IllegalState(
                        "No tokio runtime available for conflict resolution".to_string(),
                    )),
                    lock_batch,
                });
                return;
            }
        };
        let mut resolution = start(lock_batch);
        {
            let _guard = handle.enter();
            if let Some(outcome) = (&mut resolution).now_or_never() {
                callback.invoke(outcome);
                return;
            }
        }
        trace!("Conflict resolution suspended, continuing on runtime");
        handle.spawn(async move {
            let outcome = resolution.await;
            callback.invoke(outcome);
        });
    }

    async fn resolve(
        &self,
        context: Result<ResolutionContext>,
        lock_batch: LockBatch,
    ) -> ResolutionOutcome {
        let mut state = ResolutionState::default();
        let (lock_batch, result) = match context {
            Ok(context) => self.run(&context, lock_batch, &mut state).await,
            Err(e) => (lock_batch, Err(e)),
        };
        self.conflicts_metric.increment_by(state.seen.len() as u64);
        match &result {
            Ok(time) => debug!(
                "Resolved {} conflicting transaction(s), proceeding at {}",
                state.seen.len(),
                time
            ),
            Err(e) => debug!("Conflict resolution failed: {}", e),
        }
        ResolutionOutcome { result, lock_batch }
    }

    async fn run(
        &self,
        context: &ResolutionContext,
        mut lock_batch: LockBatch,
        state: &mut ResolutionState,
    ) -> (LockBatch, Result<HybridTime>) {
        if let Err(e) = check_lock_batch(&lock_batch, &context.intents) {
            return (lock_batch, Err(e));
        }
        loop {
            match self.resolve_round(context, state).await {
                Ok(Round::Done) => return (lock_batch, Ok(self.result_time(context, state))),
                Ok(Round::Recollect) => {}
                Ok(Round::Wait(blockers)) => {
                    let outcome = self.wait(context, lock_batch, blockers).await;
                    lock_batch = outcome.lock_batch;
                    if let Err(e) = outcome.result {
                        return (lock_batch, Err(e));
                    }
                    state.rounds = 0;
                }
                Err(e) => return (lock_batch, Err(e)),
            }
        }
    }

    async fn resolve_round(
        &self,
        context: &ResolutionContext,
        state: &mut ResolutionState,
    ) -> Result<Round> {
        state.rounds += 1;
        if state.rounds > self.config.max_resolution_rounds {
            return Err(ResolverError::TryAgain(format!(
                "Conflicts still unresolved after {} rounds",
                self.config.max_resolution_rounds
            )));
        }
        let data = detect_conflicts(
            self.store.as_ref(),
            &context.intents,
            context.mode.own_transaction(),
            context.read_time,
        )?;
        trace!(
            "Round {}: {} conflicting transaction(s)",
            state.rounds,
            data.transactions.len()
        );
        if context.mode == ResolutionMode::Operation {
            if let Some(time) = data.max_committed_ht {
                state.fold(time);
            }
        }
        if data.is_empty() {
            return Ok(Round::Done);
        }
        state.seen.extend(data.transactions.keys().copied());

        let policy = StatusResolutionPolicy::new(
            self.status_oracle.as_ref(),
            &self.config,
            context.mode,
            context.resolution_ht,
            self.wait_queue.is_some(),
        );
        let mut classified = Vec::with_capacity(data.transactions.len());
        for &transaction_id in data.transactions.keys() {
            let status = policy.fetch_status(transaction_id).await?;
            classified.push((transaction_id, policy.classify(transaction_id, &status)?));
        }

        let mut aborted = false;
        let mut blockers = Vec::new();
        for (transaction_id, classification) in classified {
            match classification {
                Classification::Ignore => {}
                Classification::Committed(commit_time) => state.fold(commit_time),
                Classification::Abort => match policy.abort(transaction_id).await? {
                    AbortOutcome::Aborted => aborted = true,
                    AbortOutcome::Committed(commit_time) => match context.mode {
                        ResolutionMode::Operation => state.fold(commit_time),
                        ResolutionMode::Transaction { .. } => {
                            return Err(ResolverError::ConflictWithCommitted {
                                transaction_id,
                                commit_time,
                            });
                        }
                    },
                },
                Classification::Wait => blockers.push(transaction_id),
            }
        }

        if aborted {
            Ok(Round::Recollect)
        } else if !blockers.is_empty() {
            Ok(Round::Wait(blockers))
        } else {
            Ok(Round::Done)
        }
    }

    async fn wait(
        &self,
        context: &ResolutionContext,
        mut lock_batch: LockBatch,
        blockers: Vec<TransactionId>,
    ) -> WaitOutcome {
        let (Some(wait_queue), ResolutionMode::Transaction { id, priority }) =
            (&self.wait_queue, context.mode)
        else {
            return WaitOutcome {
                lock_batch,
                result: Err(ResolverError::IllegalState(
                    "Wait required without a wait queue".to_string(),
                )),
            };
        };
        debug!(
            "Transaction {} suspends on {} blocker(s)",
            id,
            blockers.len()
        );
        // Blockers may need these keys to finish.
        lock_batch.unlock();
        wait_queue
            .wait_on(WaitRegistration {
                waiter: id,
                priority,
                blockers,
                lock_batch,
                deadline: context.deadline,
            })
            .await
    }

    fn result_time(&self, context: &ResolutionContext, state: &ResolutionState) -> HybridTime {
        match context.mode {
            ResolutionMode::Transaction { .. } => context.resolution_ht,
            ResolutionMode::Operation => state
                .fence
                .map_or(context.resolution_ht, |fence| fence.max(context.resolution_ht)),
        }
    }
}

fn check_lock_batch(lock_batch: &LockBatch, intents: &KeyToIntentTypeMap) -> Result<()> {
    if !lock_batch.is_locked() {
        return Err(ResolverError::IllegalState(
            "Lock batch is not held".to_string(),
        ));
    }
    for (key, &types) in intents {
        if !lock_batch.covers(key, types) {
            return Err(ResolverError::IllegalState(format!(
                "Lock batch does not cover {} ({:?})",
                hex_dump(key),
                types
            )));
        }
    }
    Ok(())
}
