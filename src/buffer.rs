//! Fixed-capacity ring storage with monotonic head/tail sequences.
//!
//! `RingBuffer` can be driven directly through `&mut self` when one thread owns
//! it, or handed to threads with [`RingBuffer::split`] or a
//! [`PipelineBuilder`](crate::PipelineBuilder). Slot `seq & mask` holds the item
//! published as sequence `seq`; the live range is `[tail, head)`.

use crate::error::{violation, PipelineError, Result};
use crate::pipeline::Shared;
use crate::producer::{Consumer, Producer};
use crate::sequence::Sequence;
use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Arc;

/// A ring buffer whose every slot sits on its own cache line.
///
/// Worth it for small element types hammered by several stages on different
/// cores; otherwise the packed `RingBuffer<T>` is denser.
pub type PaddedRingBuffer<T> = RingBuffer<CachePadded<T>>;

/// A fixed-capacity circular array addressed by sequence number.
///
/// `&RingBuffer<T>` hands out `&T` through [`at`](Self::at), so sharing it
/// across threads needs `T: Sync`:
///
/// ```compile_fail
/// fn assert_sync<S: Sync>() {}
/// assert_sync::<ring_pipeline::RingBuffer<std::cell::Cell<u8>>>();
/// ```
pub struct RingBuffer<T> {
    slots: Box<[UnsafeCell<T>]>,
    mask: u64,
    /// Next sequence to publish. Written only by the producer.
    head: Sequence,
    /// Next sequence to free. Written only by the terminal consumer.
    tail: Sequence,
    /// A `begin_push` is outstanding.
    push_claimed: bool,
}

// SAFETY: the buffer owns its slots; moving it moves the `T`s.
unsafe impl<T: Send> Send for RingBuffer<T> {}
// SAFETY: `&self` methods only read slots, so shared access needs `T: Sync`.
unsafe impl<T: Send + Sync> Sync for RingBuffer<T> {}

impl<T: Default> RingBuffer<T> {
    /// Create a buffer of `capacity` default-initialised slots.
    ///
    /// # Errors
    /// `InvalidCapacity` unless `capacity` is a non-zero power of two.
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_factory(capacity, T::default)
    }
}

impl<T> RingBuffer<T> {
    /// Create a buffer whose slots are pre-filled by `factory`.
    pub fn with_factory<F>(capacity: usize, mut factory: F) -> Result<Self>
    where
        F: FnMut() -> T,
    {
        if !capacity.is_power_of_two() {
            return Err(PipelineError::InvalidCapacity { capacity });
        }

        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(factory()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            slots,
            mask: capacity as u64 - 1,
            head: Sequence::new(0),
            tail: Sequence::new(0),
            push_claimed: false,
        })
    }

    /// Hand the buffer to a producer thread and a direct consumer thread.
    pub fn split(self) -> (Producer<T>, Consumer<T>) {
        let shared = Arc::new(Shared::new(self, Vec::new()));
        (Producer::new(Arc::clone(&shared)), Consumer::new(shared))
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of items ever published (`head`).
    ///
    /// Read from a non-owning thread this is only a snapshot.
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.head.acquire()
    }

    /// Number of items ever freed (`tail`).
    #[inline]
    pub fn tail_sequence(&self) -> u64 {
        self.tail.acquire()
    }

    /// Number of live items.
    #[inline]
    pub fn len(&self) -> usize {
        // tail first: it never passes head, so the difference cannot underflow
        let tail = self.tail.acquire();
        let head = self.head.acquire();
        head.wrapping_sub(tail) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Slot for the next push, or `BufferFull`.
    pub fn try_begin_push(&mut self) -> Result<&mut T> {
        if self.is_full() {
            return Err(PipelineError::BufferFull);
        }
        self.push_claimed = true;
        let idx = self.index(self.head.relaxed());
        Ok(self.slots[idx].get_mut())
    }

    /// Slot for the next push.
    ///
    /// # Panics
    /// Panics if the buffer is full.
    #[track_caller]
    pub fn begin_push(&mut self) -> &mut T {
        match self.try_begin_push() {
            Ok(slot) => slot,
            Err(e) => violation(e),
        }
    }

    /// Publish the slot returned by the last `begin_push`.
    ///
    /// # Panics
    /// Panics if there is no outstanding `begin_push`.
    #[track_caller]
    pub fn end_push(&mut self) {
        if !self.push_claimed {
            violation(PipelineError::EndWithoutBegin {
                operation: "end_push",
            });
        }
        self.push_claimed = false;
        self.head.increment_mut();
    }

    /// Write `value` into the next slot and publish it.
    pub fn push(&mut self, value: T) -> Result<()> {
        *self.try_begin_push()? = value;
        self.end_push();
        Ok(())
    }

    /// Oldest live item, or `BufferEmpty`.
    pub fn try_begin_pop(&mut self) -> Result<&T> {
        if self.is_empty() {
            return Err(PipelineError::BufferEmpty);
        }
        let idx = self.index(self.tail.relaxed());
        Ok(self.slots[idx].get_mut())
    }

    /// Oldest live item.
    ///
    /// # Panics
    /// Panics if the buffer is empty.
    #[track_caller]
    pub fn begin_pop(&mut self) -> &T {
        match self.try_begin_pop() {
            Ok(slot) => slot,
            Err(e) => violation(e),
        }
    }

    /// Free the oldest live item.
    ///
    /// # Panics
    /// Panics if the buffer is empty.
    #[track_caller]
    pub fn end_pop(&mut self) {
        if self.is_empty() {
            violation(PipelineError::BufferEmpty);
        }
        self.tail.increment_mut();
    }

    /// Item at `offset` from the oldest live item (0 = oldest).
    pub fn try_at(&self, offset: usize) -> Result<&T> {
        let tail = self.tail.acquire();
        let len = self.head.acquire() - tail;
        let offset = offset as u64;
        if offset >= len {
            return Err(PipelineError::OffsetOutOfBounds { offset, len });
        }
        // SAFETY: the slot is live and `&self` excludes every writer.
        Ok(unsafe { &*self.slot_ptr(tail + offset) })
    }

    /// Item at `offset` from the oldest live item.
    ///
    /// # Panics
    /// Panics unless `offset < len()`.
    #[track_caller]
    pub fn at(&self, offset: usize) -> &T {
        self.try_at(offset).unwrap_or_else(|e| violation(e))
    }

    /// Item published as `sequence`.
    pub fn try_get_by_sequence(&self, sequence: u64) -> Result<&T> {
        let tail = self.tail.acquire();
        let head = self.head.acquire();
        check_live(sequence, tail, head)?;
        // SAFETY: the slot is live and `&self` excludes every writer.
        Ok(unsafe { &*self.slot_ptr(sequence) })
    }

    /// Item published as `sequence`.
    ///
    /// # Panics
    /// Panics unless `tail <= sequence < head`.
    #[track_caller]
    pub fn get_by_sequence(&self, sequence: u64) -> &T {
        self.try_get_by_sequence(sequence)
            .unwrap_or_else(|e| violation(e))
    }

    #[inline]
    fn index(&self, sequence: u64) -> usize {
        (sequence & self.mask) as usize
    }

    /// Raw pointer to the slot for `sequence`.
    ///
    /// Dereferencing is only sound while the caller holds the protocol right to
    /// that sequence: the producer for `seq >= head` once `seq - tail <
    /// capacity`, or the one consumer/stage whose gate has passed `seq`.
    #[inline]
    pub(crate) fn slot_ptr(&self, sequence: u64) -> *mut T {
        let idx = self.index(sequence);
        // SAFETY: `mask` keeps `idx` below `slots.len()`.
        unsafe { self.slots.get_unchecked(idx).get() }
    }

    pub(crate) fn head(&self) -> &Sequence {
        &self.head
    }

    pub(crate) fn tail(&self) -> &Sequence {
        &self.tail
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("head", &self.head.relaxed())
            .field("tail", &self.tail.relaxed())
            .finish()
    }
}

pub(crate) fn check_live(sequence: u64, tail: u64, head: u64) -> Result<()> {
    if sequence < tail || sequence >= head {
        return Err(PipelineError::SequenceOutOfRange {
            sequence,
            tail,
            head,
        });
    }
    Ok(())
}
