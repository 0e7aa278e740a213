use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::dockv::hex_dump;
use crate::dockv::key_encoding::decode_boundaries;
use crate::errors::{ResolverError, Result};

const STRONG_INTENT_FLAG: u8 = 0b10;
const WRITE_INTENT_FLAG: u8 = 0b01;

/// Strength and kind of a provisional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum IntentType {
    WeakRead = 0b00,
    WeakWrite = WRITE_INTENT_FLAG,
    StrongRead = STRONG_INTENT_FLAG,
    StrongWrite = STRONG_INTENT_FLAG | WRITE_INTENT_FLAG,
}

impl IntentType {
    pub const ALL: [IntentType; 4] = [
        IntentType::WeakRead,
        IntentType::WeakWrite,
        IntentType::StrongRead,
        IntentType::StrongWrite,
    ];

    pub const fn is_strong(self) -> bool {
        (self as u8) & STRONG_INTENT_FLAG != 0
    }

    pub const fn is_write(self) -> bool {
        (self as u8) & WRITE_INTENT_FLAG != 0
    }

    /// At least one side must be strong, and reads only conflict with writes.
    pub const fn conflicts_with(self, other: IntentType) -> bool {
        (self.is_strong() || other.is_strong()) && (self.is_write() != other.is_write())
    }

    const fn from_index(idx: u8) -> IntentType {
        match idx {
            0 => IntentType::WeakRead,
            1 => IntentType::WeakWrite,
            2 => IntentType::StrongRead,
            _ => IntentType::StrongWrite,
        }
    }
}

/// Number of distinct intent type sets.
pub const INTENT_TYPE_SET_MAP_SIZE: usize = 1 << IntentType::ALL.len();

// Indexed by the bits of a set: which intent types conflict with any member.
const INTENT_TYPE_SET_CONFLICTS: [u8; INTENT_TYPE_SET_MAP_SIZE] = generate_conflicts();

const fn generate_conflicts() -> [u8; INTENT_TYPE_SET_MAP_SIZE] {
    let mut result = [0u8; INTENT_TYPE_SET_MAP_SIZE];
    let mut set = 0;
    while set < INTENT_TYPE_SET_MAP_SIZE {
        let mut member = 0;
        while member < 4 {
            if set & (1 << member) != 0 {
                let mut other = 0;
                while other < 4 {
                    if IntentType::from_index(member as u8)
                        .conflicts_with(IntentType::from_index(other as u8))
                    {
                        result[set] |= 1 << other;
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

/// Small set of [`IntentType`]s, one bit per type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IntentTypeSet(u8);

impl IntentTypeSet {
    pub const fn empty() -> Self {
        IntentTypeSet(0)
    }

    pub fn of(types: &[IntentType]) -> Self {
        types.iter().fold(Self::empty(), |acc, t| acc | *t)
    }

    /// Returns `None` when `bits` has members outside the four intent types.
    pub const fn from_bits(bits: u8) -> Option<Self> {
        if (bits as usize) < INTENT_TYPE_SET_MAP_SIZE {
            Some(IntentTypeSet(bits))
        } else {
            None
        }
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, intent_type: IntentType) -> bool {
        self.0 & (1 << intent_type as u8) != 0
    }

    pub const fn is_superset_of(self, other: IntentTypeSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, intent_type: IntentType) {
        self.0 |= 1 << intent_type as u8;
    }

    pub fn iter(self) -> impl Iterator<Item = IntentType> {
        IntentType::ALL.into_iter().filter(move |t| self.contains(*t))
    }

    pub fn has_strong(self) -> bool {
        self.iter().any(IntentType::is_strong)
    }

    pub fn has_strong_write(self) -> bool {
        self.contains(IntentType::StrongWrite)
    }

    pub fn conflicts_with(self, other: IntentTypeSet) -> bool {
        INTENT_TYPE_SET_CONFLICTS[self.0 as usize] & other.0 != 0
    }

    /// Maps every strong member to its weak counterpart.
    pub fn to_weak(self) -> IntentTypeSet {
        let mut result = IntentTypeSet::empty();
        for intent_type in self.iter() {
            result.insert(IntentType::from_index(intent_type as u8 & !STRONG_INTENT_FLAG));
        }
        result
    }
}

impl From<IntentType> for IntentTypeSet {
    fn from(intent_type: IntentType) -> Self {
        IntentTypeSet(1 << intent_type as u8)
    }
}

impl BitOr for IntentTypeSet {
    type Output = IntentTypeSet;

    fn bitor(self, rhs: IntentTypeSet) -> IntentTypeSet {
        IntentTypeSet(self.0 | rhs.0)
    }
}

impl BitOr<IntentType> for IntentTypeSet {
    type Output = IntentTypeSet;

    fn bitor(self, rhs: IntentType) -> IntentTypeSet {
        self | IntentTypeSet::from(rhs)
    }
}

impl BitOrAssign for IntentTypeSet {
    fn bitor_assign(&mut self, rhs: IntentTypeSet) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for IntentTypeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Strength of an enumerated intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentStrength {
    Weak,
    Strong,
}

/// Intents an operation needs, keyed by encoded path.
pub type KeyToIntentTypeMap = BTreeMap<Vec<u8>, IntentTypeSet>;

/// Calls `f` with every path the write of `encoded_key` touches: weak intents
/// on its ancestors and a strong intent on the key itself. With
/// `partial_range_key_intents` every proper prefix of the doc key components
/// is reported as a weak ancestor too.
pub fn enumerate_intents<F>(encoded_key: &[u8], partial_range_key_intents: bool, mut f: F) -> Result<()>
where
    F: FnMut(IntentStrength, &[u8]) -> Result<()>,
{
    let boundaries = decode_boundaries(encoded_key)?;
    let Some(doc_key_end) = boundaries.doc_key_end else {
        return Err(ResolverError::Corruption(format!(
            "Key without complete doc key: {}",
            hex_dump(encoded_key)
        )));
    };

    if partial_range_key_intents {
        let components = &boundaries.doc_key_component_ends;
        let proper = components.len().saturating_sub(1);
        for &end in &components[..proper] {
            f(IntentStrength::Weak, &encoded_key[..end])?;
        }
    }

    let last = encoded_key.len();
    let doc_key_strength = if doc_key_end == last {
        IntentStrength::Strong
    } else {
        IntentStrength::Weak
    };
    f(doc_key_strength, &encoded_key[..doc_key_end])?;

    for &end in &boundaries.subkey_ends {
        let strength = if end == last {
            IntentStrength::Strong
        } else {
            IntentStrength::Weak
        };
        f(strength, &encoded_key[..end])?;
    }
    Ok(())
}
