//! Binary layout of intent keys, intent values and committed record keys.
//!
//! Intent key: `[doc path][INTENT_TYPE_SET][types][HYBRID_TIME][doc hybrid time]`
//! Intent value: `[TRANSACTION_ID][16 byte id][WRITE_ID][u32][payload]`
//! Record key: `[doc path][HYBRID_TIME][doc hybrid time]`
//!
//! The doc path length is never stored. It is recovered by removing the fixed
//! width suffix from the end of the key.

use crate::dockv::key_encoding::describe_path;
use crate::dockv::{IntentTypeSet, hex_dump, value_type};
use crate::errors::{ResolverError, Result};
use crate::hybrid_time::{DocHybridTime, ENCODED_DOC_HT_SIZE};
use crate::transaction_id::{TRANSACTION_ID_SIZE, TransactionId};

/// Intent type set marker, types byte and hybrid time marker.
const INTENT_MARKERS_SIZE: usize = 3;

/// Fixed width suffix following the doc path of an intent key.
pub const INTENT_SUFFIX_SIZE: usize = INTENT_MARKERS_SIZE + ENCODED_DOC_HT_SIZE;

/// Fixed width suffix following the doc path of a committed record key.
pub const RECORD_SUFFIX_SIZE: usize = 1 + ENCODED_DOC_HT_SIZE;

/// Header of an intent value preceding the payload.
pub const INTENT_VALUE_HEADER_SIZE: usize = 1 + TRANSACTION_ID_SIZE + 1 + 4;

/// Views into an intent key. Borrows the caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedIntent<'a> {
    pub doc_path: &'a [u8],
    pub types: IntentTypeSet,
    /// Encoded doc hybrid time, without its marker.
    pub doc_ht: &'a [u8],
}

impl ParsedIntent<'_> {
    pub fn doc_hybrid_time(&self) -> Result<DocHybridTime> {
        DocHybridTime::decode(self.doc_ht)
    }
}

/// Splits `intent_key` into doc path, intent types and doc hybrid time.
///
/// `transaction_id_source` only feeds error messages. It may be any length,
/// typically the raw intent value.
pub fn parse_intent_key<'a>(
    intent_key: &'a [u8],
    transaction_id_source: &[u8],
) -> Result<ParsedIntent<'a>> {
    if intent_key.len() < INTENT_SUFFIX_SIZE {
        return Err(ResolverError::Corruption(format!(
            "Intent key is too short: {} (transaction source: {})",
            hex_dump(intent_key),
            hex_dump(transaction_id_source)
        )));
    }
    let (doc_path, suffix) = intent_key.split_at(intent_key.len() - INTENT_SUFFIX_SIZE);
    if suffix[0] != value_type::INTENT_TYPE_SET {
        return Err(ResolverError::Corruption(format!(
            "Expecting intent type set ({:#04x}) but found {:#04x} in {} (transaction source: {})",
            value_type::INTENT_TYPE_SET,
            suffix[0],
            hex_dump(intent_key),
            hex_dump(transaction_id_source)
        )));
    }
    let types = IntentTypeSet::from_bits(suffix[1]).ok_or_else(|| {
        ResolverError::Corruption(format!(
            "Invalid intent type set {:#04x} in {} (transaction source: {})",
            suffix[1],
            hex_dump(intent_key),
            hex_dump(transaction_id_source)
        ))
    })?;
    if suffix[2] != value_type::HYBRID_TIME {
        return Err(ResolverError::Corruption(format!(
            "Expecting hybrid time with value type {:#04x}, found {:#04x} in {} (transaction source: {})",
            value_type::HYBRID_TIME,
            suffix[2],
            hex_dump(intent_key),
            hex_dump(transaction_id_source)
        )));
    }
    Ok(ParsedIntent {
        doc_path,
        types,
        doc_ht: &suffix[INTENT_MARKERS_SIZE..],
    })
}

pub fn encode_intent_key(doc_path: &[u8], types: IntentTypeSet, doc_ht: DocHybridTime) -> Vec<u8> {
    let mut key = Vec::with_capacity(doc_path.len() + INTENT_SUFFIX_SIZE);
    key.extend_from_slice(doc_path);
    key.push(value_type::INTENT_TYPE_SET);
    key.push(types.bits());
    key.push(value_type::HYBRID_TIME);
    doc_ht.append_encoded(&mut key);
    key
}

pub fn encode_intent_value(transaction_id: TransactionId, write_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut value = Vec::with_capacity(INTENT_VALUE_HEADER_SIZE + payload.len());
    value.push(value_type::TRANSACTION_ID);
    value.extend_from_slice(transaction_id.as_bytes());
    value.push(value_type::WRITE_ID);
    value.extend_from_slice(&write_id.to_be_bytes());
    value.extend_from_slice(payload);
    value
}

pub fn decode_transaction_id_from_intent_value(value: &[u8]) -> Result<TransactionId> {
    if value.len() < 1 + TRANSACTION_ID_SIZE || value[0] != value_type::TRANSACTION_ID {
        return Err(ResolverError::Corruption(format!(
            "Intent value does not start with a transaction id: {}",
            hex_dump(value)
        )));
    }
    TransactionId::from_slice(&value[1..1 + TRANSACTION_ID_SIZE])
}

pub fn encode_record_key(doc_path: &[u8], doc_ht: DocHybridTime) -> Vec<u8> {
    let mut key = Vec::with_capacity(doc_path.len() + RECORD_SUFFIX_SIZE);
    key.extend_from_slice(doc_path);
    key.push(value_type::HYBRID_TIME);
    doc_ht.append_encoded(&mut key);
    key
}

/// Splits a committed record key into its doc path and write time.
pub fn parse_record_key(record_key: &[u8]) -> Result<(&[u8], DocHybridTime)> {
    if record_key.len() < RECORD_SUFFIX_SIZE {
        return Err(ResolverError::Corruption(format!(
            "Record key is too short: {}",
            hex_dump(record_key)
        )));
    }
    let (doc_path, suffix) = record_key.split_at(record_key.len() - RECORD_SUFFIX_SIZE);
    if suffix[0] != value_type::HYBRID_TIME {
        return Err(ResolverError::Corruption(format!(
            "Expecting hybrid time with value type {:#04x}, found {:#04x} in {}",
            value_type::HYBRID_TIME,
            suffix[0],
            hex_dump(record_key)
        )));
    }
    Ok((doc_path, DocHybridTime::decode(&suffix[1..])?))
}

/// Best effort rendering of an intent key. Falls back to a hex dump when the
/// key cannot be decoded.
pub fn debug_intent_key_to_string(intent_key: &[u8]) -> String {
    let parsed = match parse_intent_key(intent_key, &[]) {
        Ok(parsed) => parsed,
        Err(e) => return format!("{} ({})", hex_dump(intent_key), e),
    };
    match (describe_path(parsed.doc_path), parsed.doc_hybrid_time()) {
        (Ok(path), Ok(doc_ht)) => format!("{} {:?} {}", path, parsed.types, doc_ht),
        (Err(e), _) | (_, Err(e)) => format!("{} ({})", hex_dump(intent_key), e),
    }
}
