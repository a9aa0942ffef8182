use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of a logical transaction within this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Monotonic transaction id allocator.
#[derive(Debug)]
pub struct TxnIds {
    counter: AtomicU64,
}

impl Default for TxnIds {
    fn default() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }
}

impl TxnIds {
    #[inline]
    pub fn alloc(&self) -> TxnId {
        TxnId(self.counter.fetch_add(1, Ordering::Relaxed))
    }
}
