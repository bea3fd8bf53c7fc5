use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonic counter on its own cache line.
///
/// Every counter in the pipeline has exactly one writer. Writers publish with
/// `Release`, readers gate on `Acquire`, so a reader that observes value `n`
/// also observes every slot write made before the counter reached `n`.
#[derive(Debug, Default)]
pub(crate) struct Sequence {
    value: CachePadded<AtomicU64>,
}

impl Sequence {
    pub(crate) fn new(val: u64) -> Self {
        Self {
            value: CachePadded::new(AtomicU64::new(val)),
        }
    }

    /// Load for a gating decision.
    #[inline]
    pub(crate) fn acquire(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Load for statistics or by the owning writer.
    #[inline]
    pub(crate) fn relaxed(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Advance by one, making prior writes visible to `acquire` readers.
    #[inline]
    pub(crate) fn increment(&self) -> u64 {
        self.value.fetch_add(1, Ordering::Release) + 1
    }

    /// Plain increment for callers holding `&mut` access.
    #[inline]
    pub(crate) fn increment_mut(&mut self) -> u64 {
        let v = self.value.get_mut();
        *v += 1;
        *v
    }
}
