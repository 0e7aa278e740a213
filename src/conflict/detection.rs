use std::collections::BTreeMap;

use log::trace;

use crate::conflict::intent_codec::{
    debug_intent_key_to_string, decode_transaction_id_from_intent_value, parse_intent_key,
    parse_record_key,
};
use crate::dockv::{IntentTypeSet, KeyToIntentTypeMap};
use crate::errors::{ResolverError, Result};
use crate::hybrid_time::HybridTime;
use crate::storage::DocDb;
use crate::transaction_id::TransactionId;

/// Another transaction holding intents that conflict with the operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictingTransaction {
    pub id: TransactionId,
    /// Union of the intent types it holds on the target paths, counting only
    /// the intents that conflict with the operation. Non-conflicting intents
    /// of the same transaction are left out.
    pub intent_types: IntentTypeSet,
    /// A committed record was also found on a strongly intended path where
    /// this transaction holds a conflicting intent.
    pub committed_record_seen: bool,
}

/// Everything the collector found for one resolution round.
#[derive(Debug, Default)]
pub struct ConflictData {
    /// Ordered by id so that classification and aborts are deterministic.
    pub transactions: BTreeMap<TransactionId, ConflictingTransaction>,
    /// Newest committed record on any strongly intended path.
    pub max_committed_ht: Option<HybridTime>,
}

impl ConflictData {
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

/// Scans the store for intents and committed records overlapping the
/// operation's intents.
///
/// Intents of `own_transaction` never conflict. When `read_time` is set, a
/// committed record newer than it on a strongly intended path fails the scan
/// with [`ResolverError::WriteAfterRead`].
pub fn detect_conflicts(
    db: &dyn DocDb,
    intents: &KeyToIntentTypeMap,
    own_transaction: Option<TransactionId>,
    read_time: Option<HybridTime>,
) -> Result<ConflictData> {
    let mut result = ConflictData::default();
    let mut intent_iter = db.intents_iter();
    let mut regular_iter = db.regular_iter();
    let mut path_conflicts = Vec::new();

    for (path, &our_types) in intents {
        path_conflicts.clear();
        intent_iter.seek(path);
        while intent_iter.valid() {
            let key = intent_iter.key();
            if !key.starts_with(path) {
                break;
            }
            let value = intent_iter.value();
            let existing = parse_intent_key(key, value)?;
            // Exact matches sort before intents on descendants.
            if existing.doc_path.len() != path.len() {
                break;
            }
            let owner = decode_transaction_id_from_intent_value(value)?;
            if Some(owner) != own_transaction && our_types.conflicts_with(existing.types) {
                trace!(
                    "Conflict with {} on {}",
                    owner,
                    debug_intent_key_to_string(key)
                );
                result
                    .transactions
                    .entry(owner)
                    .or_insert_with(|| ConflictingTransaction {
                        id: owner,
                        intent_types: IntentTypeSet::empty(),
                        committed_record_seen: false,
                    })
                    .intent_types |= existing.types;
                path_conflicts.push(owner);
            }
            intent_iter.next();
        }

        if !our_types.has_strong() {
            continue;
        }
        regular_iter.seek(path);
        while regular_iter.valid() {
            let key = regular_iter.key();
            if !key.starts_with(path) {
                break;
            }
            let (_, doc_ht) = parse_record_key(key)?;
            let write_time = doc_ht.hybrid_time;
            if let Some(read_time) = read_time {
                if write_time > read_time {
                    return Err(ResolverError::WriteAfterRead {
                        write_time,
                        read_time,
                    });
                }
            }
            result.max_committed_ht = result.max_committed_ht.max(Some(write_time));
            for owner in &path_conflicts {
                if let Some(conflict) = result.transactions.get_mut(owner) {
                    conflict.committed_record_seen = true;
                }
            }
            regular_iter.next();
        }
    }

    Ok(result)
}
