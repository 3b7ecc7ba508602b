use crate::error::LoadError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

pub type LoadResult<V, E> = Result<V, LoadError<E>>;

/// Counters snapshot, see [`Loader::stats()`](crate::Loader::stats).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderStats {
    /// Loads answered by an existing cache entry, resolved or in flight.
    pub cache_hits:     u64,
    /// Requests which made it into a batch.
    pub keys_requested: u64,
    /// Invocations of the batch function.
    pub batches:        u64,
    /// Batches rejected as a whole, including contract violations and cancellations.
    pub failed_batches: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    cache_hits:     AtomicU64,
    keys_requested: AtomicU64,
    batches:        AtomicU64,
    failed_batches: AtomicU64,
}

impl StatCounters {
    #[inline]
    pub(crate) fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn key_requested(&self) {
        self.keys_requested.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn batch_dispatched(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn batch_failed(&self) {
        self.failed_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> LoaderStats {
        LoaderStats {
            cache_hits:     self.cache_hits.load(Ordering::Relaxed),
            keys_requested: self.keys_requested.load(Ordering::Relaxed),
            batches:        self.batches.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
        }
    }
}
