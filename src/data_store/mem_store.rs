use std::ops::Bound;
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;
use log::debug;

use crate::conflict::intent_codec::{
    INTENT_VALUE_HEADER_SIZE, decode_transaction_id_from_intent_value, encode_intent_key,
    encode_intent_value, encode_record_key, parse_intent_key,
};
use crate::dockv::IntentTypeSet;
use crate::errors::Result;
use crate::hybrid_time::{DocHybridTime, HybridTime};
use crate::storage::{DocDb, StoreIterator};
use crate::transaction_id::TransactionId;

type Region = Arc<SkipMap<Vec<u8>, Vec<u8>>>;

/// An in-memory [`DocDb`] implemented using lock-free SkipMaps.
///
/// Holds the intents region and the regular region in separate maps. Besides
/// the read-only cursors it exposes the writer side used by transaction
/// bookkeeping: writing intents, applying a committed transaction's intents
/// and removing an aborted transaction's intents.
#[derive(Default)]
pub struct MemDocDb {
    intents: Region,
    regular: Region,
}

impl MemDocDb {
    /// Creates a new, empty `MemDocDb`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a provisional intent owned by `transaction_id`.
    pub fn put_intent(
        &self,
        doc_path: &[u8],
        types: IntentTypeSet,
        doc_ht: DocHybridTime,
        transaction_id: TransactionId,
        payload: &[u8],
    ) {
        let key = encode_intent_key(doc_path, types, doc_ht);
        let value = encode_intent_value(transaction_id, doc_ht.write_id, payload);
        self.intents.insert(key, value);
    }

    /// Writes a committed record.
    pub fn put_record(&self, doc_path: &[u8], doc_ht: DocHybridTime, value: &[u8]) {
        self.regular
            .insert(encode_record_key(doc_path, doc_ht), value.to_vec());
    }

    /// Removes every intent of `transaction_id`. Returns how many were removed.
    pub fn remove_intents_of(&self, transaction_id: TransactionId) -> Result<usize> {
        let mut removed = 0;
        for entry in self.intents.iter() {
            if decode_transaction_id_from_intent_value(entry.value())? == transaction_id {
                entry.remove();
                removed += 1;
            }
        }
        debug!(
            "Removed {} intents of transaction {}",
            removed, transaction_id
        );
        Ok(removed)
    }

    /// Turns the strong write intents of `transaction_id` into committed
    /// records at `commit_ht` and removes all of its intents.
    pub fn apply_intents_of(&self, transaction_id: TransactionId, commit_ht: HybridTime) -> Result<usize> {
        let mut applied = 0;
        for entry in self.intents.iter() {
            let value = entry.value();
            if decode_transaction_id_from_intent_value(value)? != transaction_id {
                continue;
            }
            let parsed = parse_intent_key(entry.key(), value)?;
            if parsed.types.has_strong_write() {
                let write_id = parsed.doc_hybrid_time()?.write_id;
                let payload = &value[INTENT_VALUE_HEADER_SIZE..];
                self.put_record(parsed.doc_path, DocHybridTime::new(commit_ht, write_id), payload);
                applied += 1;
            }
            entry.remove();
        }
        debug!(
            "Applied {} intents of transaction {} at {}",
            applied, transaction_id, commit_ht
        );
        Ok(applied)
    }

    pub fn intent_count(&self) -> usize {
        self.intents.len()
    }

    pub fn record_count(&self) -> usize {
        self.regular.len()
    }
}

impl DocDb for MemDocDb {
    fn intents_iter(&self) -> Box<dyn StoreIterator> {
        Box::new(MemIterator::new(Arc::clone(&self.intents)))
    }

    fn regular_iter(&self) -> Box<dyn StoreIterator> {
        Box::new(MemIterator::new(Arc::clone(&self.regular)))
    }
}

/// Cursor over one region. Copies the current entry so the cursor does not
/// borrow the map.
struct MemIterator {
    data: Region,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl MemIterator {
    fn new(data: Region) -> Self {
        Self {
            data,
            current: None,
        }
    }

    fn load(&mut self, bound: Bound<&[u8]>) {
        self.current = self
            .data
            .lower_bound(bound)
            .map(|entry| (entry.key().clone(), entry.value().clone()));
    }
}

impl StoreIterator for MemIterator {
    fn seek(&mut self, target: &[u8]) {
        self.load(Bound::Included(target));
    }

    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().map_or(&[][..], |(key, _)| key.as_slice())
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().map_or(&[][..], |(_, value)| value.as_slice())
    }

    fn next(&mut self) {
        if let Some((key, _)) = self.current.take() {
            self.load(Bound::Excluded(key.as_slice()));
        }
    }
}
