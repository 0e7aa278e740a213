use std::sync::atomic::{AtomicU64, Ordering};

/// Sink for the transaction conflicts counter.
pub trait CounterSink: Send + Sync {
    fn increment_by(&self, amount: u64);
}

impl CounterSink for AtomicU64 {
    fn increment_by(&self, amount: u64) {
        self.fetch_add(amount, Ordering::Relaxed);
    }
}
