use crate::dockv::intent::IntentStrength;
use crate::dockv::{DocPath, IntentTypeSet, KeyToIntentTypeMap, enumerate_intents};
use crate::errors::Result;
use crate::isolation::IsolationLevel;

/// What a structured operation does to its row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocOperationKind {
    Write,
    Delete,
    /// Explicit row lock, e.g. `SELECT ... FOR UPDATE`.
    LockRow,
}

/// A structured per-row operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocOperation {
    pub path: DocPath,
    pub kind: DocOperationKind,
}

impl DocOperation {
    pub fn write(path: DocPath) -> Self {
        Self {
            path,
            kind: DocOperationKind::Write,
        }
    }

    pub fn delete(path: DocPath) -> Self {
        Self {
            path,
            kind: DocOperationKind::Delete,
        }
    }

    pub fn lock_row(path: DocPath) -> Self {
        Self {
            path,
            kind: DocOperationKind::LockRow,
        }
    }
}

/// Raw encoded key with its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValuePair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl KeyValuePair {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Writes and serializable reads of a transaction, as raw encoded pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyValueWriteBatch {
    pub write_pairs: Vec<KeyValuePair>,
    pub read_pairs: Vec<KeyValuePair>,
}

/// Producer of the intents an operation will leave, fed to the resolver.
pub trait IntentSource: Send + Sync {
    /// Calls `f` with every encoded key the operation touches and the
    /// strong intent types it takes on that key. Ancestor expansion happens
    /// in [`collect_intents`].
    fn for_each_strong_key(&self, f: &mut dyn FnMut(&[u8], IntentTypeSet) -> Result<()>) -> Result<()>;
}

/// Structured operations only, as used by non-transactional writes.
#[derive(Debug, Clone, Copy)]
pub struct DocOperationIntents<'a> {
    pub doc_ops: &'a [DocOperation],
    pub isolation: IsolationLevel,
}

impl IntentSource for DocOperationIntents<'_> {
    fn for_each_strong_key(&self, f: &mut dyn FnMut(&[u8], IntentTypeSet) -> Result<()>) -> Result<()> {
        for_each_doc_op(self.doc_ops, self.isolation, f)
    }
}

/// Structured operations plus the raw write batch of a transaction.
#[derive(Debug, Clone, Copy)]
pub struct TransactionIntents<'a> {
    pub doc_ops: &'a [DocOperation],
    pub write_batch: &'a KeyValueWriteBatch,
    pub isolation: IsolationLevel,
}

impl IntentSource for TransactionIntents<'_> {
    fn for_each_strong_key(&self, f: &mut dyn FnMut(&[u8], IntentTypeSet) -> Result<()>) -> Result<()> {
        for_each_doc_op(self.doc_ops, self.isolation, f)?;
        let write_intents = self.isolation.strong_write_intents();
        for pair in &self.write_batch.write_pairs {
            f(&pair.key, write_intents)?;
        }
        let read_intents = self.isolation.strong_read_intents();
        for pair in &self.write_batch.read_pairs {
            f(&pair.key, read_intents)?;
        }
        Ok(())
    }
}

fn for_each_doc_op(
    doc_ops: &[DocOperation],
    isolation: IsolationLevel,
    f: &mut dyn FnMut(&[u8], IntentTypeSet) -> Result<()>,
) -> Result<()> {
    for op in doc_ops {
        let strong = match op.kind {
            DocOperationKind::Write | DocOperationKind::Delete => isolation.strong_write_intents(),
            // Exclusive under every isolation level, serializable included.
            DocOperationKind::LockRow => IsolationLevel::SnapshotIsolation.strong_write_intents(),
        };
        f(&op.path.encode(), strong)?;
    }
    Ok(())
}

/// Expands the keys of `source` into the full per-path intent map: strong
/// intents on the keys, weak intents on their ancestors.
pub fn collect_intents(source: &dyn IntentSource, partial_range_key_intents: bool) -> Result<KeyToIntentTypeMap> {
    let mut result = KeyToIntentTypeMap::new();
    source.for_each_strong_key(&mut |key, strong| {
        enumerate_intents(key, partial_range_key_intents, |strength, path| {
            let types = match strength {
                IntentStrength::Strong => strong,
                IntentStrength::Weak => strong.to_weak(),
            };
            *result.entry(path.to_vec()).or_default() |= types;
            Ok(())
        })
    })?;
    Ok(result)
}
