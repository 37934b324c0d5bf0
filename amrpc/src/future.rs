//! Per-call completion: slots, the completion table and [`Future`].
//!
//! Every issued call reserves a slot in its process's [`CompletionTable`].
//! The call envelope carries only the slot's [`SlotId`]; the ack handler
//! resolves it back through the table, writes the result payload and then
//! publishes readiness. The [`Future`] owns the slot: it is released only
//! after the result has landed, so a reply can never target freed storage.
//!
//! ```text
//!   Pending --[ack handler applies result]--> Ready
//! ```

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use slab::Slab;

use crate::encoding::{RESULT_CAPACITY, ResultBuf, decode_value};
use crate::envelope::SlotId;
use crate::progress::Driver;
use crate::serial::Serial;

/// Completion storage for one call.
///
/// The payload is fully written before `ready` becomes true, and never
/// touched again afterwards.
pub struct FutureData {
    ready: AtomicBool,
    payload: UnsafeCell<ResultBuf>,
}

// SAFETY: `payload` is written once, under the completion table lock, before
// `ready` is stored with Release. Readers only touch it after observing
// `ready` with Acquire.
unsafe impl Sync for FutureData {}
unsafe impl Send for FutureData {}

impl FutureData {
    fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            payload: UnsafeCell::new([0u8; RESULT_CAPACITY]),
        }
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Returns the payload once ready.
    #[inline]
    pub fn payload(&self) -> Option<ResultBuf> {
        if self.is_ready() {
            // SAFETY: ready was observed with Acquire; no further writes.
            Some(unsafe { *self.payload.get() })
        } else {
            None
        }
    }
}

struct Entry {
    generation: u32,
    data: Arc<FutureData>,
}

struct Slots {
    slab: Slab<Entry>,
    next_generation: u32,
}

/// Per-process arena of pending completions, indexed by [`SlotId`].
pub struct CompletionTable {
    slots: Mutex<Slots>,
}

impl Default for CompletionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                slab: Slab::new(),
                next_generation: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates a pending slot.
    pub fn reserve(&self) -> (SlotId, Arc<FutureData>) {
        let data = Arc::new(FutureData::new());
        let mut slots = self.lock();
        let generation = slots.next_generation;
        slots.next_generation = generation.wrapping_add(1);
        let key = slots.slab.insert(Entry {
            generation,
            data: Arc::clone(&data),
        });
        assert!(
            key <= u32::MAX as usize,
            "completion table exceeded {} pending slots",
            u32::MAX
        );
        (
            SlotId {
                key: key as u32,
                generation,
            },
            data,
        )
    }

    /// Applies a result to `slot`: writes the payload, then sets ready.
    ///
    /// # Panics
    /// Panics if `slot` is unknown, stale, or already completed. Each of
    /// those means a reply was duplicated or misrouted.
    pub fn complete(&self, slot: SlotId, payload: &ResultBuf) {
        let slots = self.lock();
        let entry = match slots.slab.get(slot.key as usize) {
            Some(entry) if entry.generation == slot.generation => entry,
            _ => panic!("result for unknown completion slot {:?}", slot),
        };
        assert!(
            !entry.data.is_ready(),
            "completion slot {:?} acknowledged twice",
            slot
        );
        // SAFETY: the table lock serializes writers and the slot is not yet
        // ready, so no reader touches the payload.
        unsafe { *entry.data.payload.get() = *payload };
        entry.data.ready.store(true, Ordering::Release);
    }

    /// Frees a completed slot.
    ///
    /// # Panics
    /// Panics if the slot is unknown or still pending.
    pub fn release(&self, slot: SlotId) {
        let mut slots = self.lock();
        match slots.slab.get(slot.key as usize) {
            Some(entry) if entry.generation == slot.generation => {
                assert!(
                    entry.data.is_ready(),
                    "completion slot {:?} released while pending",
                    slot
                );
            }
            _ => panic!("release of unknown completion slot {:?}", slot),
        }
        slots.slab.remove(slot.key as usize);
    }

    /// Drops a pending slot whose call never left this process.
    pub(crate) fn discard(&self, slot: SlotId) {
        let mut slots = self.lock();
        if slots
            .slab
            .get(slot.key as usize)
            .is_some_and(|entry| entry.generation == slot.generation)
        {
            slots.slab.remove(slot.key as usize);
        }
    }

    /// Number of slots currently reserved.
    pub fn len(&self) -> usize {
        self.lock().slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of [`Future::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureStatus {
    Ready,
    Pending,
}

/// Handle to the result of one remote call.
///
/// Dropping a `Future` waits for its result first; the remote side holds a
/// reference to the slot until the reply is applied.
#[must_use = "dropping a Future blocks until its call completes"]
pub struct Future<T: Serial> {
    slot: SlotId,
    data: Arc<FutureData>,
    table: Arc<CompletionTable>,
    driver: Driver,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serial> Future<T> {
    pub(crate) fn new(
        slot: SlotId,
        data: Arc<FutureData>,
        table: Arc<CompletionTable>,
        driver: Driver,
    ) -> Self {
        Self {
            slot,
            data,
            table,
            driver,
            _marker: PhantomData,
        }
    }

    /// The completion slot this future owns.
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Drives progress until the result arrives, then returns it.
    ///
    /// Result types larger than [`RESULT_CAPACITY`] are rejected at compile
    /// time. May be called more than once.
    pub fn wait(&self) -> T {
        self.driver.wait_until(|| self.data.is_ready());
        // SAFETY: the ack handler wrote a payload encoded from a `T` by the
        // call this future was created for.
        match self.data.payload() {
            Some(payload) => unsafe { decode_value::<T, RESULT_CAPACITY>(&payload) },
            None => unreachable!("future observed ready without a payload"),
        }
    }

    /// Reports readiness without driving progress.
    #[inline]
    pub fn check(&self) -> FutureStatus {
        if self.data.is_ready() {
            FutureStatus::Ready
        } else {
            FutureStatus::Pending
        }
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.data.is_ready()
    }
}

impl<T: Serial> Drop for Future<T> {
    fn drop(&mut self) {
        if !self.data.is_ready() {
            self.driver.wait_until(|| self.data.is_ready());
        }
        self.table.release(self.slot);
    }
}

impl<T: Serial> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("slot", &self.slot)
            .field("status", &self.check())
            .finish()
    }
}
