use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap as HashMap;
use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::dockv::intent::INTENT_TYPE_SET_MAP_SIZE;
use crate::dockv::{IntentType, IntentTypeSet, KeyToIntentTypeMap, hex_dump};
use crate::errors::{ResolverError, Result};

const RELOCK_POLL_INTERVAL: Duration = Duration::from_millis(1);

// Holder counts for all four intent types packed into one word, 16 bits each.
type LockState = u64;

const INTENT_TYPE_BITS: u32 = 16;
const SINGLE_INTENT_MASK: LockState = (1 << INTENT_TYPE_BITS) - 1;

const fn intent_type_mask(intent_type: usize, single_intent_mask: LockState) -> LockState {
    single_intent_mask << (intent_type as u32 * INTENT_TYPE_BITS)
}

const fn intent_type_from_index(idx: usize) -> IntentType {
    match idx {
        0 => IntentType::WeakRead,
        1 => IntentType::WeakWrite,
        2 => IntentType::StrongRead,
        _ => IntentType::StrongWrite,
    }
}

// Indexed by the bits of a set: holder counts that block acquiring it.
const INTENT_TYPE_SET_CONFLICTS: [LockState; INTENT_TYPE_SET_MAP_SIZE] = generate_conflicts();
// Indexed by the bits of a set: one holder for every member.
const INTENT_TYPE_SET_ADD: [LockState; INTENT_TYPE_SET_MAP_SIZE] = generate_by_mask(1);

const fn generate_conflicts() -> [LockState; INTENT_TYPE_SET_MAP_SIZE] {
    let mut result = [0; INTENT_TYPE_SET_MAP_SIZE];
    let mut set = 0;
    while set < INTENT_TYPE_SET_MAP_SIZE {
        let mut member = 0;
        while member < 4 {
            if set & (1 << member) != 0 {
                let mut other = 0;
                while other < 4 {
                    if intent_type_from_index(member)
                        .conflicts_with(intent_type_from_index(other))
                    {
                        result[set] |= intent_type_mask(other, SINGLE_INTENT_MASK);
                    }
                    other += 1;
                }
            }
            member += 1;
        }
        set += 1;
    }
    result
}

const fn generate_by_mask(single_intent_mask: LockState) -> [LockState; INTENT_TYPE_SET_MAP_SIZE] {
    let mut result = [0; INTENT_TYPE_SET_MAP_SIZE];
    let mut set = 0;
    while set < INTENT_TYPE_SET_MAP_SIZE {
        let mut member = 0;
        while member < 4 {
            if set & (1 << member) != 0 {
                result[set] |= intent_type_mask(member, single_intent_mask);
            }
            member += 1;
        }
        set += 1;
    }
    result
}

#[derive(Default)]
struct LockedBatchEntry {
    num_holding: Mutex<LockState>,
    cond_var: Condvar,
}

impl LockedBatchEntry {
    fn lock(&self, lock_types: IntentTypeSet, deadline: Instant) -> bool {
        let idx = lock_types.bits() as usize;
        let mut num_holding = self.num_holding.lock();
        loop {
            if *num_holding & INTENT_TYPE_SET_CONFLICTS[idx] == 0 {
                *num_holding += INTENT_TYPE_SET_ADD[idx];
                return true;
            }
            if self
                .cond_var
                .wait_until(&mut num_holding, deadline)
                .timed_out()
                && *num_holding & INTENT_TYPE_SET_CONFLICTS[idx] != 0
            {
                return false;
            }
        }
    }

    fn unlock(&self, lock_types: IntentTypeSet) {
        let idx = lock_types.bits() as usize;
        {
            let mut num_holding = self.num_holding.lock();
            *num_holding -= INTENT_TYPE_SET_ADD[idx];
        }
        self.cond_var.notify_all();
    }
}

struct ReservedEntry {
    entry: Arc<LockedBatchEntry>,
    ref_count: usize,
}

/// Lock manager handing out intent-type-set locks on encoded keys.
///
/// Holders of non-conflicting intent type sets share a key; a conflicting
/// request blocks until the holders leave or its deadline passes. Keys of a
/// batch are always taken in sorted order.
#[derive(Default)]
pub struct SharedLockManager {
    locks: Mutex<HashMap<Vec<u8>, ReservedEntry>>,
}

impl SharedLockManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Locks every key of `keys` with its intent types, waiting at most until
    /// `deadline`. Nothing stays locked on failure.
    pub fn lock(self: &Arc<Self>, keys: KeyToIntentTypeMap, deadline: Instant) -> Result<LockBatch> {
        let mut batch = LockBatch {
            manager: Arc::clone(self),
            entries: keys
                .into_iter()
                .map(|(key, intent_types)| LockBatchEntry {
                    key,
                    intent_types,
                    locked: None,
                })
                .collect(),
            locked: false,
        };
        batch.relock(deadline)?;
        Ok(batch)
    }

    fn acquire(&self, entries: &mut [LockBatchEntry], deadline: Instant) -> bool {
        trace!("Locking a batch of {} keys", entries.len());
        self.reserve(entries);
        for idx in 0..entries.len() {
            let Some(locked) = entries[idx].locked.clone() else {
                continue;
            };
            if !locked.lock(entries[idx].intent_types, deadline) {
                for taken in entries[..idx].iter().rev() {
                    if let Some(locked) = &taken.locked {
                        locked.unlock(taken.intent_types);
                    }
                }
                self.cleanup(entries);
                return false;
            }
        }
        trace!("Acquired a lock batch of {} keys", entries.len());
        true
    }

    fn release(&self, entries: &mut [LockBatchEntry]) {
        trace!("Unlocking a batch of {} keys", entries.len());
        for entry in entries.iter().rev() {
            if let Some(locked) = &entry.locked {
                locked.unlock(entry.intent_types);
            }
        }
        self.cleanup(entries);
    }

    fn reserve(&self, entries: &mut [LockBatchEntry]) {
        let mut locks = self.locks.lock();
        for entry in entries.iter_mut() {
            let reserved = locks
                .entry(entry.key.clone())
                .or_insert_with(|| ReservedEntry {
                    entry: Arc::new(LockedBatchEntry::default()),
                    ref_count: 0,
                });
            reserved.ref_count += 1;
            entry.locked = Some(Arc::clone(&reserved.entry));
        }
    }

    fn cleanup(&self, entries: &mut [LockBatchEntry]) {
        let mut locks = self.locks.lock();
        for entry in entries.iter_mut() {
            if entry.locked.take().is_none() {
                continue;
            }
            let drained = match locks.get_mut(&entry.key) {
                Some(reserved) => {
                    reserved.ref_count -= 1;
                    reserved.ref_count == 0
                }
                None => false,
            };
            if drained {
                locks.remove(&entry.key);
            }
        }
    }

    /// Number of keys with at least one holder or waiter.
    pub fn active_keys(&self) -> usize {
        self.locks.lock().len()
    }
}

struct LockBatchEntry {
    key: Vec<u8>,
    intent_types: IntentTypeSet,
    locked: Option<Arc<LockedBatchEntry>>,
}

/// Set of key locks held by one operation.
///
/// A move-only token: whoever owns the batch owns its locks. It can be
/// released and reacquired around a suspension, but the set of keys never
/// changes after creation. Dropping a locked batch unlocks it.
pub struct LockBatch {
    manager: Arc<SharedLockManager>,
    entries: Vec<LockBatchEntry>,
    locked: bool,
}

impl LockBatch {
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encoded keys with the intent types locked on them, in key order.
    pub fn keys(&self) -> impl Iterator<Item = (&[u8], IntentTypeSet)> {
        self.entries
            .iter()
            .map(|entry| (entry.key.as_slice(), entry.intent_types))
    }

    /// Returns true when `key` is part of the batch with at least `types`.
    pub fn covers(&self, key: &[u8], types: IntentTypeSet) -> bool {
        self.entries
            .binary_search_by(|entry| entry.key.as_slice().cmp(key))
            .is_ok_and(|idx| self.entries[idx].intent_types.is_superset_of(types))
    }

    /// Releases every lock of the batch. The batch keeps its keys.
    pub fn unlock(&mut self) {
        if !self.locked {
            return;
        }
        self.manager.release(&mut self.entries);
        self.locked = false;
        debug!("Released lock batch of {} keys", self.entries.len());
    }

    /// Reacquires every lock of the batch, waiting at most until `deadline`.
    pub fn relock(&mut self, deadline: Instant) -> Result<()> {
        if self.locked {
            return Ok(());
        }
        if !self.manager.acquire(&mut self.entries, deadline) {
            return Err(ResolverError::TryAgain(format!(
                "Failed to obtain locks on {} keys before deadline",
                self.entries.len()
            )));
        }
        self.locked = true;
        Ok(())
    }

    /// Like [`relock`](Self::relock), for async callers: the executor thread
    /// is never parked on a contended key.
    pub async fn relock_async(&mut self, deadline: Instant) -> Result<()> {
        loop {
            let now = Instant::now();
            if self.relock(now).is_ok() {
                return Ok(());
            }
            if now >= deadline {
                return Err(ResolverError::TryAgain(format!(
                    "Failed to reacquire locks on {} keys before deadline",
                    self.entries.len()
                )));
            }
            tokio::time::sleep(RELOCK_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

impl Drop for LockBatch {
    fn drop(&mut self) {
        self.unlock();
    }
}

impl fmt::Debug for LockBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for entry in &self.entries {
            list.entry(&format_args!("{}: {:?}", hex_dump(&entry.key), entry.intent_types));
        }
        list.finish()?;
        write!(f, " locked: {}", self.locked)
    }
}
