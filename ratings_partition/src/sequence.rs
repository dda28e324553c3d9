use std::sync::atomic::{AtomicU64, Ordering};

/// An atomically advanced, 1-based ordinal counter.
///
/// Each call to [`Self::next()`] hands out a distinct ordinal, even across
/// threads, so round-robin assignment driven by this counter never hands two
/// records the same position. This is the in-process counterpart of the
/// per-table row sequence kept by the catalog.
#[derive(Debug, Default)]
pub struct OrdinalSequence {
    last: AtomicU64,
}

impl OrdinalSequence {
    /// A sequence whose next ordinal is `last + 1`.
    pub fn new(last: u64) -> Self {
        Self {
            last: AtomicU64::new(last),
        }
    }

    pub fn next(&self) -> u64 {
        self.last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_add(1))
            .expect("Overflowed ordinal sequence")
            + 1
    }

    /// The most recently handed out ordinal, 0 if none.
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}
