//! The slot ring shared by the dispatcher and the sink writers.
//!
//! A `Ring` holds a fixed number of reusable byte buffers. The dispatcher
//! acquires the slot for sequence `s`, fills it and publishes it; every
//! writer then consumes sequence `s` from the same slot and releases it.
//! The slot becomes reusable (for sequence `s + slot_count`) only when the
//! last writer has released it, so the dispatcher can fill slot `s + 1`
//! while writers are still draining `s`.
//!
//! Each slot carries a small state machine guarded by a mutex/condvar pair:
//!
//! ```text
//! Empty -> Filling -> Published -> Draining -> Empty
//! ```
//!
//! The end of the stream is a sentinel sequence recorded on every slot at
//! once, so it never waits for a slot to drain: writers behind it keep
//! draining and stop when their cursor reaches it.
//!
//! The buffer itself sits behind a `RwLock`: the dispatcher holds it
//! exclusively while filling, writers share it while draining. The state
//! mutex is never held across I/O.

use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_SLOT_COUNT: usize = 3;
pub const DEFAULT_SLOT_SIZE: usize = 128 * mem::size_of::<usize>();

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    pub slot_count: usize,
    pub slot_size: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        RingConfig {
            slot_count: DEFAULT_SLOT_COUNT,
            slot_size: DEFAULT_SLOT_SIZE,
        }
    }
}

/// Position of a publication in the stream.
///
/// Cursors only move forward one step at a time, which is what keeps the
/// dispatcher and every writer visiting slots in the same cyclic order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sequence(u64);

impl Sequence {
    pub const ZERO: Sequence = Sequence(0);

    #[inline]
    pub fn next(self) -> Sequence {
        Sequence(self.0 + 1)
    }

    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }

    #[inline]
    fn slot_index(self, slot_count: usize) -> usize {
        (self.0 % slot_count as u64) as usize
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Empty,
    Filling,
    Published,
    Draining,
}

#[derive(Debug)]
struct SlotState {
    phase: Phase,
    // Sequence of the publication the slot holds (or is being filled for).
    generation: u64,
    length: usize,
    pending: usize,
    // First sequence that will never be published.
    end: Option<u64>,
    poisoned: bool,
}

struct Slot {
    state: Mutex<SlotState>,
    changed: Condvar,
    data: RwLock<Box<[u8]>>,
}

impl Slot {
    fn new(size: usize) -> Slot {
        Slot {
            state: Mutex::new(SlotState {
                phase: Phase::Empty,
                generation: 0,
                length: 0,
                pending: 0,
                end: None,
                poisoned: false,
            }),
            changed: Condvar::new(),
            data: RwLock::new(vec![0u8; size].into_boxed_slice()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum RingError {
    #[error("timed out waiting for a slot to drain")]
    Timeout,
    #[error("ring is poisoned")]
    Poisoned,
}

pub struct Ring {
    slots: Box<[Slot]>,
    slot_size: usize,
    writers: usize,
}

impl Ring {
    pub fn new(cfg: &RingConfig, writers: usize) -> Ring {
        let slot_count = cfg.slot_count.max(1);
        let slot_size = cfg.slot_size.max(1);
        let slots = (0..slot_count)
            .map(|_| Slot::new(slot_size))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ring {
            slots,
            slot_size,
            writers,
        }
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    #[inline]
    fn slot(&self, seq: Sequence) -> &Slot {
        &self.slots[seq.slot_index(self.slots.len())]
    }

    /// Waits until the slot for `seq` is drained and hands it out for filling.
    pub fn acquire(&self, seq: Sequence) -> Result<SlotFill<'_>, RingError> {
        self.acquire_until(seq, None)
    }

    pub fn acquire_until(
        &self,
        seq: Sequence,
        deadline: Option<Instant>,
    ) -> Result<SlotFill<'_>, RingError> {
        let slot = self.slot(seq);
        let mut state = slot.state.lock();
        wait_for_empty(slot, &mut state, deadline)?;
        state.phase = Phase::Filling;
        state.generation = seq.value();
        state.length = 0;
        drop(state);

        Ok(SlotFill {
            slot,
            seq,
            writers: self.writers,
            length: None,
            data: slot.data.write(),
        })
    }

    /// Makes a filled slot visible to every writer.
    pub fn publish(&self, mut fill: SlotFill<'_>, length: usize) {
        debug_assert!(length <= self.slot_size);
        fill.length = Some(length.min(self.slot_size));
        // the state transition happens when the fill handle drops
    }

    /// Blocks until the publication for `seq` is available to this writer.
    pub fn consume(&self, seq: Sequence) -> Consumed<'_> {
        let slot = self.slot(seq);
        let mut state = slot.state.lock();
        loop {
            if state.poisoned {
                return Consumed::Poisoned;
            }
            if state.generation == seq.value()
                && matches!(state.phase, Phase::Published | Phase::Draining)
            {
                break;
            }
            if state.end.map_or(false, |end| seq.value() >= end) {
                return Consumed::Sentinel;
            }
            slot.changed.wait(&mut state);
        }
        state.phase = Phase::Draining;
        let length = state.length;
        drop(state);

        Consumed::Chunk(Chunk {
            slot,
            seq,
            length,
            data: slot.data.read(),
        })
    }

    /// Explicit form of dropping a chunk.
    #[inline]
    pub fn release(&self, chunk: Chunk<'_>) {
        drop(chunk);
    }

    /// Marks `seq` as the end of the stream.
    ///
    /// Nothing at or after `seq` may be published afterwards. Writers still
    /// behind `seq` keep draining the publications they have not consumed
    /// yet. A slot held by a stalled writer does not delay the others.
    pub fn publish_sentinel(&self, seq: Sequence) {
        for slot in self.slots.iter() {
            let mut state = slot.state.lock();
            state.end = Some(seq.value());
            slot.changed.notify_all();
        }
    }

    /// Wakes every waiter on every slot and makes all further waits fail.
    ///
    /// Writers that have not finished lose whatever they have not drained,
    /// so this is only for threads that are being abandoned.
    pub fn poison(&self) {
        for slot in self.slots.iter() {
            let mut state = slot.state.lock();
            state.poisoned = true;
            slot.changed.notify_all();
        }
    }
}

fn wait_for_empty(
    slot: &Slot,
    state: &mut parking_lot::MutexGuard<'_, SlotState>,
    deadline: Option<Instant>,
) -> Result<(), RingError> {
    while state.phase != Phase::Empty {
        if state.poisoned {
            return Err(RingError::Poisoned);
        }
        match deadline {
            Some(deadline) => {
                if slot.changed.wait_until(state, deadline).timed_out()
                    && state.phase != Phase::Empty
                {
                    return Err(if state.poisoned {
                        RingError::Poisoned
                    } else {
                        RingError::Timeout
                    });
                }
            }
            None => slot.changed.wait(state),
        }
    }
    if state.poisoned {
        return Err(RingError::Poisoned);
    }
    Ok(())
}

/// Exclusive access to a slot being filled by the dispatcher.
///
/// Dropping it without publishing returns the slot to `Empty`.
pub struct SlotFill<'a> {
    slot: &'a Slot,
    seq: Sequence,
    writers: usize,
    length: Option<usize>,
    data: RwLockWriteGuard<'a, Box<[u8]>>,
}

impl<'a> SlotFill<'a> {
    #[inline]
    pub fn sequence(&self) -> Sequence {
        self.seq
    }
}

impl<'a> Deref for SlotFill<'a> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl<'a> DerefMut for SlotFill<'a> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl<'a> Drop for SlotFill<'a> {
    fn drop(&mut self) {
        // The buffer guard is released right after this body; writers that
        // wake first park briefly on the buffer lock.
        let mut state = self.slot.state.lock();
        match self.length {
            Some(length) if self.writers > 0 => {
                state.length = length;
                state.pending = self.writers;
                state.phase = Phase::Published;
            }
            _ => {
                state.length = 0;
                state.pending = 0;
                state.phase = Phase::Empty;
            }
        }
        self.slot.changed.notify_all();
    }
}

pub enum Consumed<'a> {
    Chunk(Chunk<'a>),
    Sentinel,
    Poisoned,
}

/// Shared access to one publication. Dropping it releases the slot.
pub struct Chunk<'a> {
    slot: &'a Slot,
    seq: Sequence,
    length: usize,
    data: RwLockReadGuard<'a, Box<[u8]>>,
}

impl<'a> Chunk<'a> {
    #[inline]
    pub fn sequence(&self) -> Sequence {
        self.seq
    }

    #[inline]
    pub fn release(self) {
        drop(self);
    }
}

impl<'a> Deref for Chunk<'a> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[..self.length]
    }
}

impl<'a> Drop for Chunk<'a> {
    fn drop(&mut self) {
        let mut state = self.slot.state.lock();
        debug_assert_eq!(state.generation, self.seq.value());
        state.pending = state.pending.saturating_sub(1);
        if state.pending == 0 && state.phase == Phase::Draining {
            state.phase = Phase::Empty;
            self.slot.changed.notify_all();
        }
    }
}
