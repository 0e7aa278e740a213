use std::fmt;

use uuid::Uuid;

use crate::errors::{ResolverError, Result};

/// Size of an encoded [`TransactionId`].
pub const TRANSACTION_ID_SIZE: usize = 16;

/// Unique identifier of a transaction. Ordered by its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        TransactionId(Uuid::new_v4())
    }

    pub const fn from_bytes(bytes: [u8; TRANSACTION_ID_SIZE]) -> Self {
        TransactionId(Uuid::from_bytes(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Uuid::from_slice(bytes).map(TransactionId).map_err(|e| {
            ResolverError::Corruption(format!(
                "Invalid transaction id {}: {}",
                crate::dockv::hex_dump(bytes),
                e
            ))
        })
    }

    pub fn as_bytes(&self) -> &[u8; TRANSACTION_ID_SIZE] {
        self.0.as_bytes()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}
