use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{ResolverError, Result};

/// Number of bits reserved for the logical component of a [`HybridTime`].
pub const LOGICAL_BITS: u32 = 12;
const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// Size of an encoded [`DocHybridTime`].
pub const ENCODED_DOC_HT_SIZE: usize = 12;

/// A cluster-wide timestamp combining physical microseconds and a logical
/// counter. Ordering is the ordering of the packed `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HybridTime(u64);

impl HybridTime {
    pub const MIN: HybridTime = HybridTime(0);
    pub const MAX: HybridTime = HybridTime(u64::MAX - 1);
    pub const INVALID: HybridTime = HybridTime(u64::MAX);

    pub const fn from_raw(value: u64) -> Self {
        HybridTime(value)
    }

    pub const fn from_micros(physical_micros: u64) -> Self {
        HybridTime(physical_micros << LOGICAL_BITS)
    }

    pub const fn from_micros_and_logical(physical_micros: u64, logical: u64) -> Self {
        HybridTime((physical_micros << LOGICAL_BITS) | (logical & LOGICAL_MASK))
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn physical_micros(self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    pub const fn logical(self) -> u64 {
        self.0 & LOGICAL_MASK
    }

    pub const fn is_valid(self) -> bool {
        self.0 != u64::MAX
    }
}

impl fmt::Display for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HybridTime::INVALID => f.write_str("<invalid>"),
            HybridTime::MAX => f.write_str("<max>"),
            HybridTime::MIN => f.write_str("<min>"),
            ht => write!(
                f,
                "{{ physical: {} logical: {} }}",
                ht.physical_micros(),
                ht.logical()
            ),
        }
    }
}

/// A hybrid time plus the write order inside one batch applied at that time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocHybridTime {
    pub hybrid_time: HybridTime,
    pub write_id: u32,
}

impl DocHybridTime {
    pub const fn new(hybrid_time: HybridTime, write_id: u32) -> Self {
        Self {
            hybrid_time,
            write_id,
        }
    }

    /// Appends the fixed width, descending-order encoding to `out`.
    pub fn append_encoded(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(!self.hybrid_time.raw()).to_be_bytes());
        out.extend_from_slice(&(!self.write_id).to_be_bytes());
    }

    pub fn encoded(&self) -> [u8; ENCODED_DOC_HT_SIZE] {
        let mut buf = [0u8; ENCODED_DOC_HT_SIZE];
        buf[..8].copy_from_slice(&(!self.hybrid_time.raw()).to_be_bytes());
        buf[8..].copy_from_slice(&(!self.write_id).to_be_bytes());
        buf
    }

    pub fn decode(encoded: &[u8]) -> Result<Self> {
        if encoded.len() != ENCODED_DOC_HT_SIZE {
            return Err(ResolverError::Corruption(format!(
                "Encoded doc hybrid time must be {} bytes, got {}: {}",
                ENCODED_DOC_HT_SIZE,
                encoded.len(),
                crate::dockv::hex_dump(encoded)
            )));
        }
        let mut ht = [0u8; 8];
        ht.copy_from_slice(&encoded[..8]);
        let mut write_id = [0u8; 4];
        write_id.copy_from_slice(&encoded[8..]);
        Ok(Self {
            hybrid_time: HybridTime(!u64::from_be_bytes(ht)),
            write_id: !u32::from_be_bytes(write_id),
        })
    }
}

impl fmt::Display for DocHybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.write_id == 0 {
            write!(f, "HT{}", self.hybrid_time)
        } else {
            write!(f, "HT{} w: {}", self.hybrid_time, self.write_id)
        }
    }
}
