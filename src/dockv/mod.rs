/// Intent types, intent type sets and intent enumeration for target keys.
pub mod intent;
/// Binary encoding of document paths.
pub mod key_encoding;

pub use intent::{IntentType, IntentTypeSet, KeyToIntentTypeMap, enumerate_intents};
pub use key_encoding::{DocPath, KeyComponent};

/// Single byte markers used by the key and value layouts.
pub mod value_type {
    /// Marks the intent type set in the intent key suffix.
    pub const INTENT_TYPE_SET: u8 = 0x10;
    /// Ends the doc key part of a path.
    pub const GROUP_END: u8 = b'!';
    /// Precedes an encoded doc hybrid time.
    pub const HYBRID_TIME: u8 = b'#';
    pub const INT64: u8 = b'I';
    pub const STRING: u8 = b'S';
    /// Precedes the owning transaction id in an intent value.
    pub const TRANSACTION_ID: u8 = b'x';
    /// Precedes the write id in an intent value.
    pub const WRITE_ID: u8 = b'w';
}

/// Renders bytes as lowercase hex. Never fails.
pub fn hex_dump(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}
