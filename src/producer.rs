//! Thread handles for the two ends of a ring buffer.
//!
//! A [`Producer`] is the only writer of `head`. A [`Consumer`] is the only
//! writer of `tail` when the buffer is used without stages. Neither handle is
//! `Clone`, which is what makes "single producer" and "single terminal
//! consumer" hold at compile time.

use crate::buffer::check_live;
use crate::error::{violation, PipelineError, Result};
use crate::pipeline::Shared;
use crate::wait::{SpinWait, WaitStrategy};
use std::fmt;
use std::sync::Arc;

/// The publishing end of a ring buffer.
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
    /// Local copy of `head`; the atomic is only ever written from here.
    head: u64,
    /// Last `tail` observed with `Acquire`.
    cached_tail: u64,
    capacity: u64,
    claimed: bool,
    strategy: WaitStrategy,
    waits: u64,
}

// SAFETY: a `Producer` only touches slots it has claimed, and never hands out
// a shared `&T`, so moving it needs no more than `T: Send`.
unsafe impl<T: Send> Send for Producer<T> {}

impl<T> Producer<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>) -> Self {
        let head = shared.ring.head().relaxed();
        let cached_tail = shared.ring.tail().acquire();
        let capacity = shared.ring.capacity() as u64;
        Self {
            shared,
            head,
            cached_tail,
            capacity,
            claimed: false,
            strategy: WaitStrategy::default(),
            waits: 0,
        }
    }

    /// Use `strategy` when `begin_push_wait` has to block.
    pub fn with_wait_strategy(mut self, strategy: WaitStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    fn has_space(&mut self) -> bool {
        if self.head - self.cached_tail < self.capacity {
            return true;
        }
        self.cached_tail = self.shared.ring.tail().acquire();
        self.head - self.cached_tail < self.capacity
    }

    fn wait_for_space<K>(&mut self, keep_going: K) -> bool
    where
        K: FnMut() -> bool,
    {
        if self.has_space() {
            return true;
        }

        let ring = &self.shared.ring;
        let head = self.head;
        let capacity = self.capacity;
        let mut tail = self.cached_tail;
        let mut wait = SpinWait::new(self.strategy);
        let ready = wait.until(
            || {
                tail = ring.tail().acquire();
                head - tail < capacity
            },
            keep_going,
        );

        self.cached_tail = tail;
        self.waits += u64::from(wait.iterations());
        ready
    }

    fn claim(&mut self) -> &mut T {
        self.claimed = true;
        // SAFETY: `has_space` observed (with Acquire) that the terminal consumer
        // freed sequence `head - capacity`, the previous occupant of this slot.
        // Nothing reads a sequence at or past `head` until `end_push`.
        unsafe { &mut *self.shared.ring.slot_ptr(self.head) }
    }

    /// Slot for the next push, or `BufferFull`.
    pub fn try_begin_push(&mut self) -> Result<&mut T> {
        if !self.has_space() {
            return Err(PipelineError::BufferFull);
        }
        Ok(self.claim())
    }

    /// Slot for the next push.
    ///
    /// # Panics
    /// Panics if the buffer is full. Use [`begin_push_wait`](Self::begin_push_wait)
    /// to block instead.
    #[track_caller]
    pub fn begin_push(&mut self) -> &mut T {
        if !self.has_space() {
            violation(PipelineError::BufferFull);
        }
        self.claim()
    }

    /// Slot for the next push, spinning until the terminal consumer frees one.
    pub fn begin_push_wait(&mut self) -> &mut T {
        self.wait_for_space(|| true);
        self.claim()
    }

    /// Like `begin_push_wait`, but gives up with `None` once `keep_going`
    /// returns false.
    pub fn begin_push_until<K>(&mut self, keep_going: K) -> Option<&mut T>
    where
        K: FnMut() -> bool,
    {
        if self.wait_for_space(keep_going) {
            Some(self.claim())
        } else {
            None
        }
    }

    /// Publish the slot returned by the last `begin_push*`.
    ///
    /// # Panics
    /// Panics if there is no outstanding `begin_push*`.
    #[track_caller]
    pub fn end_push(&mut self) {
        if !self.claimed {
            violation(PipelineError::EndWithoutBegin {
                operation: "end_push",
            });
        }
        self.claimed = false;
        self.head += 1;
        self.shared.ring.head().increment();
    }

    /// Write `value` into the next slot, waiting for space, and publish it.
    pub fn push(&mut self, value: T) {
        *self.begin_push_wait() = value;
        self.end_push();
    }

    /// Number of items published so far.
    pub fn sequence(&self) -> u64 {
        self.head
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Live items; a snapshot, consumers may free more at any moment.
    pub fn len(&self) -> usize {
        self.shared.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Total wait iterations spent blocked on a full buffer.
    pub fn total_waits(&self) -> u64 {
        self.waits
    }
}

impl<T> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("head", &self.head)
            .field("capacity", &self.capacity)
            .field("claimed", &self.claimed)
            .finish()
    }
}

/// The direct, non-chained consuming end of a ring buffer.
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
    /// Local copy of `tail`; the atomic is only ever written from here.
    tail: u64,
    /// Last `head` observed with `Acquire`.
    cached_head: u64,
    claimed: bool,
    strategy: WaitStrategy,
    waits: u64,
}

// SAFETY: every slot a `Consumer` reads is one the producer has released and
// no stage can reach. It is `Sync` only when `T: Sync`, through its `Arc`.
unsafe impl<T: Send> Send for Consumer<T> {}

impl<T> Consumer<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>) -> Self {
        let tail = shared.ring.tail().relaxed();
        let cached_head = shared.ring.head().acquire();
        Self {
            shared,
            tail,
            cached_head,
            claimed: false,
            strategy: WaitStrategy::default(),
            waits: 0,
        }
    }

    /// Use `strategy` when `begin_pop_wait` has to block.
    pub fn with_wait_strategy(mut self, strategy: WaitStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    fn has_item(&mut self) -> bool {
        if self.cached_head > self.tail {
            return true;
        }
        self.cached_head = self.shared.ring.head().acquire();
        self.cached_head > self.tail
    }

    fn wait_for_item<K>(&mut self, keep_going: K) -> bool
    where
        K: FnMut() -> bool,
    {
        if self.has_item() {
            return true;
        }

        let ring = &self.shared.ring;
        let tail = self.tail;
        let mut head = self.cached_head;
        let mut wait = SpinWait::new(self.strategy);
        let ready = wait.until(
            || {
                head = ring.head().acquire();
                head > tail
            },
            keep_going,
        );

        self.cached_head = head;
        self.waits += u64::from(wait.iterations());
        ready
    }

    fn claim(&mut self) -> &T {
        self.claimed = true;
        // SAFETY: `tail < head` was observed with Acquire, so the slot is fully
        // written, and the producer cannot reuse it before `end_pop`.
        unsafe { &*self.shared.ring.slot_ptr(self.tail) }
    }

    /// Oldest live item, or `BufferEmpty`.
    pub fn try_begin_pop(&mut self) -> Result<&T> {
        if !self.has_item() {
            return Err(PipelineError::BufferEmpty);
        }
        Ok(self.claim())
    }

    /// Oldest live item.
    ///
    /// # Panics
    /// Panics if nothing is published.
    #[track_caller]
    pub fn begin_pop(&mut self) -> &T {
        if !self.has_item() {
            violation(PipelineError::BufferEmpty);
        }
        self.claim()
    }

    /// Oldest live item, spinning until one is published.
    pub fn begin_pop_wait(&mut self) -> &T {
        self.wait_for_item(|| true);
        self.claim()
    }

    /// Like `begin_pop_wait`, but gives up with `None` once `keep_going`
    /// returns false.
    pub fn begin_pop_until<K>(&mut self, keep_going: K) -> Option<&T>
    where
        K: FnMut() -> bool,
    {
        if self.wait_for_item(keep_going) {
            Some(self.claim())
        } else {
            None
        }
    }

    /// Free the item returned by the last `begin_pop*`.
    ///
    /// # Panics
    /// Panics if there is no outstanding `begin_pop*`.
    #[track_caller]
    pub fn end_pop(&mut self) {
        if !self.claimed {
            violation(PipelineError::EndWithoutBegin {
                operation: "end_pop",
            });
        }
        self.claimed = false;
        self.tail += 1;
        self.shared.ring.tail().increment();
    }

    /// Live item at `offset` from the oldest (0 = oldest).
    pub fn try_at(&self, offset: usize) -> Result<&T> {
        let len = self.shared.ring.head().acquire() - self.tail;
        let offset = offset as u64;
        if offset >= len {
            return Err(PipelineError::OffsetOutOfBounds { offset, len });
        }
        // SAFETY: the sequence is published and only this handle frees it.
        Ok(unsafe { &*self.shared.ring.slot_ptr(self.tail + offset) })
    }

    /// # Panics
    /// Panics unless `offset < len()`.
    #[track_caller]
    pub fn at(&self, offset: usize) -> &T {
        self.try_at(offset).unwrap_or_else(|e| violation(e))
    }

    /// Live item published as `sequence`.
    pub fn try_get_by_sequence(&self, sequence: u64) -> Result<&T> {
        check_live(sequence, self.tail, self.shared.ring.head().acquire())?;
        // SAFETY: as in `try_at`.
        Ok(unsafe { &*self.shared.ring.slot_ptr(sequence) })
    }

    /// # Panics
    /// Panics unless `tail <= sequence < head`.
    #[track_caller]
    pub fn get_by_sequence(&self, sequence: u64) -> &T {
        self.try_get_by_sequence(sequence)
            .unwrap_or_else(|e| violation(e))
    }

    /// Number of items freed so far.
    pub fn tail_sequence(&self) -> u64 {
        self.tail
    }

    pub fn len(&self) -> usize {
        (self.shared.ring.head().acquire() - self.tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total wait iterations spent blocked on an empty buffer.
    pub fn total_waits(&self) -> u64 {
        self.waits
    }
}

impl<T> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("tail", &self.tail)
            .field("claimed", &self.claimed)
            .finish()
    }
}
