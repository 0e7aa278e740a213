use crate::dockv::{IntentType, IntentTypeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Isolation levels a transaction may run under.
///
/// The isolation level decides which strong intents a transaction leaves on
/// the keys it touches, and therefore which concurrent intents conflict with
/// it during resolution.
pub enum IsolationLevel {
    /// **Read Committed:**
    ///
    /// Every statement reads the latest committed data. Writes lock the same
    /// way as under snapshot isolation, so concurrent writers on the same key
    /// always conflict.
    ReadCommitted,
    /// **Snapshot Isolation:**
    ///
    /// Reads observe a consistent snapshot taken at the transaction read time.
    /// A write leaves both a strong read and a strong write intent, which
    /// makes two writers of one key conflict with each other and with any
    /// serializable reader.
    #[default]
    SnapshotIsolation,
    /// **Serializable:**
    ///
    /// Reads leave strong read intents so that a later concurrent writer is
    /// detected. Blind writes leave only a strong write intent: two
    /// serializable writes of the same key commute, while reads and writes of
    /// that key conflict.
    Serializable,
}

impl IsolationLevel {
    /// Strong intents left on a key this transaction writes.
    pub fn strong_write_intents(self) -> IntentTypeSet {
        match self {
            IsolationLevel::Serializable => IntentType::StrongWrite.into(),
            IsolationLevel::ReadCommitted | IsolationLevel::SnapshotIsolation => {
                IntentTypeSet::of(&[IntentType::StrongRead, IntentType::StrongWrite])
            }
        }
    }

    /// Strong intents left on a key this transaction reads or row-locks.
    pub fn strong_read_intents(self) -> IntentTypeSet {
        IntentType::StrongRead.into()
    }
}
