/// This module contains logic for detecting transaction conflicts.
pub mod detection;
/// Layout of intent keys and values in the provisional region.
pub mod intent_codec;
/// This module contains logic for resolving transaction conflicts.
pub mod resolution;
