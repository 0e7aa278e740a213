/// In-memory document store over lock-free skip lists.
pub mod mem_store;
