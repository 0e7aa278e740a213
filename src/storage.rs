/// A positioned cursor over one region of the sorted key-value store.
///
/// Mirrors the usual LSM iterator contract: after `seek` the cursor points at
/// the first key greater than or equal to the target, `key`/`value` may only
/// be called while `valid` returns true.
pub trait StoreIterator: Send {
    /// Positions the cursor at the first key `>= target`.
    fn seek(&mut self, target: &[u8]);

    fn valid(&self) -> bool;

    fn key(&self) -> &[u8];

    fn value(&self) -> &[u8];

    /// Advances to the next key in order.
    fn next(&mut self);
}

/// Read-only handle over the two regions of the document store.
///
/// The resolver never writes through this handle. Provisional writes live in
/// the intents region keyed by the intent layout of
/// [`crate::conflict::intent_codec`]; applied writes live in the regular
/// region keyed by doc path and write time.
///
/// Implementations must be `Send` and `Sync` to be used concurrently by
/// multiple resolutions.
///
/// # Examples
///
/// ```no_run
/// use intent_resolver::prelude::*;
///
/// let db = MemDocDb::new();
/// let mut iter = db.intents_iter();
/// iter.seek(b"");
/// while iter.valid() {
///     println!("{}", debug_intent_key_to_string(iter.key()));
///     iter.next();
/// }
/// ```
pub trait DocDb: Send + Sync {
    /// Cursor over provisional writes.
    fn intents_iter(&self) -> Box<dyn StoreIterator>;

    /// Cursor over committed records.
    fn regular_iter(&self) -> Box<dyn StoreIterator>;
}
