//! Pins: per-worker hazard pointers with batched, deferred reclamation.
//!
//! A worker that is about to dereference a shared record publishes the
//! record's address in one of the slots of its [`Pins`] handle. A record that
//! was unlinked from a shared structure is not freed right away; it is
//! *retired* into the handle's purgatory. Once the purgatory is full, the pin
//! slots of every other worker are scanned, and the retired records that
//! nobody pins are handed to the registry's [`Reclaim`] implementation in one
//! chain. Records that are still pinned stay in the purgatory for the next
//! round.
//!
//! Readers never wait for writers, and writers never wait for readers: a
//! pinned record only delays its own reclamation.
//!
//! Pin sets live in a [`GrowableDirectory`] and are never freed while the
//! registry is alive. Unused sets are kept on a lock-free stack whose top is a
//! `u32` holding the index of the top set in its low 16 bits and a version in
//! the remaining bits. Every push and pop bumps the version, so a pop that read
//! a stale `link` cannot succeed.
//!
//! Retired records are chained through an `AtomicPtr<u8>` that every managed
//! record carries at the registry's `free_link_offset`. The same link is used
//! by the reclaimer, e.g. to push the records on a free list.

use std::{
    cell::{Cell, UnsafeCell},
    marker::PhantomData,
    ops::Range,
    ptr::{self, NonNull},
    sync::atomic::{self, AtomicPtr, AtomicU32, Ordering},
};

use crossbeam_utils::{Backoff, CachePadded};
use smallvec::SmallVec;

use crate::{common::error::Error, directory::GrowableDirectory};

#[cfg(feature = "unstable-debug-counters")]
use crate::common::debug_counters::InternalGlobalDebugCounters as Counters;

/// Number of pin slots in each pin set.
pub const PINS_PER_SET: usize = 4;

/// Number of retired records a pin set collects before it scans the pins of
/// the other workers.
pub const PURGATORY_SIZE: usize = 10;

/// Upper bound (exclusive) of pin set indices. Index 0 marks the empty stack.
pub(crate) const MAX_PIN_SETS: u32 = 1 << 16;

/// Receives retired records once no pin references them any more.
pub trait Reclaim {
    /// Takes ownership of every record in `chain`.
    ///
    /// # Safety
    ///
    /// Callers must guarantee that the records in `chain` are unreachable from
    /// the shared structure and that no pin references them.
    unsafe fn reclaim(&self, chain: RetiredChain);
}

/// A non-empty chain of retired records, linked through their free links.
#[derive(Debug)]
pub struct RetiredChain {
    head: NonNull<u8>,
    tail: NonNull<u8>,
    len: usize,
    link_offset: usize,
}

impl RetiredChain {
    /// The first record.
    pub fn head(&self) -> NonNull<u8> {
        self.head
    }

    /// The last record. Its free link is unspecified.
    pub fn tail(&self) -> NonNull<u8> {
        self.tail
    }

    /// Number of records in the chain. Never zero.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always `false`: a chain holds at least one record.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Iterates over the records. The free link of a record is read before the
    /// record is yielded, so the caller may free each record as it goes.
    pub fn iter(&self) -> RetiredIter {
        RetiredIter {
            next: self.head.as_ptr(),
            remaining: self.len,
            link_offset: self.link_offset,
        }
    }
}

/// Iterator over the records of a [`RetiredChain`].
pub struct RetiredIter {
    next: *mut u8,
    remaining: usize,
    link_offset: usize,
}

impl Iterator for RetiredIter {
    type Item = NonNull<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let current = NonNull::new(self.next)?;
        self.remaining -= 1;
        if self.remaining > 0 {
            self.next = unsafe { free_link(current.as_ptr(), self.link_offset) }
                .load(Ordering::Relaxed);
        }
        Some(current)
    }
}

/// Returns the free link of `record`.
///
/// # Safety
///
/// `record` must point to a live allocation that holds an `AtomicPtr<u8>` at
/// `offset`.
#[inline]
pub(crate) unsafe fn free_link<'a>(record: *mut u8, offset: usize) -> &'a AtomicPtr<u8> {
    &*(record.add(offset) as *const AtomicPtr<u8>)
}

struct Purgatory {
    head: *mut u8,
    len: usize,
}

impl Default for Purgatory {
    fn default() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }
}

impl Purgatory {
    unsafe fn push(&mut self, record: *mut u8, link_offset: usize) {
        free_link(record, link_offset).store(self.head, Ordering::Relaxed);
        self.head = record;
        self.len += 1;
    }

    /// Empties the purgatory and returns its records as a chain.
    unsafe fn take(&mut self, link_offset: usize) -> Option<RetiredChain> {
        let head = NonNull::new(self.head)?;
        let len = std::mem::take(&mut self.len);
        self.head = ptr::null_mut();

        let mut tail = head;
        for _ in 1..len {
            let next = free_link(tail.as_ptr(), link_offset).load(Ordering::Relaxed);
            tail = NonNull::new_unchecked(next);
        }

        Some(RetiredChain {
            head,
            tail,
            len,
            link_offset,
        })
    }
}

#[derive(Default)]
pub(crate) struct PinSet {
    pins: [AtomicPtr<u8>; PINS_PER_SET],
    // Only touched by the owner of the set, or by the registry on drop.
    purgatory: UnsafeCell<Purgatory>,
    // Next free set while on the stack, own index while in use.
    link: AtomicU32,
}

// SAFETY: other threads only read `pins` and `link`, which are atomic.
unsafe impl Send for PinSet {}
unsafe impl Sync for PinSet {}

impl PinSet {
    fn purgatory_len(&self) -> usize {
        unsafe { (*self.purgatory.get()).len }
    }

    fn clear_pins(&self) {
        for pin in &self.pins {
            pin.store(ptr::null_mut(), Ordering::Release);
        }
        atomic::fence(Ordering::SeqCst);
    }
}

/// Clears a pin slot the same way `Pins::pin` sets one, so that a scan that
/// starts afterwards no longer sees the old address.
#[inline]
fn clear_pin(slot: &AtomicPtr<u8>) {
    slot.store(ptr::null_mut(), Ordering::Release);
    atomic::fence(Ordering::SeqCst);
}

/// The registry of pin sets shared by every worker of one structure.
pub struct PinRegistry<R: Reclaim> {
    sets: GrowableDirectory<CachePadded<PinSet>>,
    top_ver: AtomicU32,
    sets_in_array: AtomicU32,
    free_link_offset: usize,
    reclaimer: R,
}

impl<R: Reclaim> PinRegistry<R> {
    /// Creates a registry for records that carry their free link at
    /// `free_link_offset`. Unpinned retired records go to `reclaimer`.
    ///
    /// # Panics
    ///
    /// Panics if `free_link_offset` is not aligned for an `AtomicPtr`.
    pub fn new(free_link_offset: usize, reclaimer: R) -> Self {
        assert_eq!(
            free_link_offset % std::mem::align_of::<AtomicPtr<u8>>(),
            0,
            "the free link must be aligned for an AtomicPtr"
        );

        Self {
            sets: GrowableDirectory::new(),
            top_ver: AtomicU32::new(0),
            sets_in_array: AtomicU32::new(0),
            free_link_offset,
            reclaimer,
        }
    }

    /// The reclaimer that receives unpinned retired records.
    pub fn reclaimer(&self) -> &R {
        &self.reclaimer
    }

    /// Offset of the free link within every managed record.
    pub fn free_link_offset(&self) -> usize {
        self.free_link_offset
    }

    /// Number of pin sets created so far. Sets are recycled, so this is the
    /// highest number of handles that were alive at the same time.
    pub fn pin_sets(&self) -> usize {
        self.sets_in_array
            .load(Ordering::Acquire)
            .min(MAX_PIN_SETS - 1) as usize
    }

    /// Takes a pin set for the calling worker.
    ///
    /// Pops a free set off the stack, or creates a new one when the stack is
    /// empty. Never waits for other workers.
    pub fn acquire(&self) -> Result<Pins<'_, R>, Error> {
        let mut top_ver = self.top_ver.load(Ordering::Acquire);

        let (index, set) = loop {
            let index = top_ver % MAX_PIN_SETS;

            if index == 0 {
                // The stack of free sets is empty.
                let index = self.sets_in_array.fetch_add(1, Ordering::AcqRel) + 1;
                if index >= MAX_PIN_SETS {
                    self.sets_in_array.fetch_sub(1, Ordering::AcqRel);
                    #[cfg(feature = "logging")]
                    log::warn!("All {} pin sets are in use", MAX_PIN_SETS - 1);
                    return Err(Error::TooManyPinSets);
                }

                let set = match self.sets.slot_for_write(index) {
                    Ok(set) => set,
                    Err(e) => {
                        self.cancel_reservation(index);
                        return Err(e);
                    }
                };

                #[cfg(feature = "unstable-debug-counters")]
                Counters::pin_set_created();
                #[cfg(feature = "logging")]
                log::trace!("Created pin set {index}");

                break (index, set);
            }

            let set = self.sets.slot_for_write(index)?;
            let next = set.link.load(Ordering::Relaxed);
            let new_top_ver = top_ver
                .wrapping_sub(index)
                .wrapping_add(next)
                .wrapping_add(MAX_PIN_SETS);

            match self.top_ver.compare_exchange_weak(
                top_ver,
                new_top_ver,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break (index, set),
                Err(actual) => top_ver = actual,
            }
        };

        set.link.store(index, Ordering::Relaxed);

        Ok(Pins {
            registry: self,
            set,
            index,
            _not_sync: PhantomData,
        })
    }

    /// Gives back a freshly reserved set index that could not be backed by
    /// memory. Only the latest reservation can be undone; if another worker
    /// reserved an index since, `index` stays a hole whose slot is never used.
    fn cancel_reservation(&self, index: u32) {
        let _ = self.sets_in_array.compare_exchange(
            index,
            index - 1,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    fn release(&self, index: u32, set: &PinSet) {
        let backoff = Backoff::new();
        loop {
            self.reclaim_unpinned(set);
            if set.purgatory_len() == 0 || backoff.is_completed() {
                break;
            }
            backoff.snooze();
        }

        #[cfg(feature = "logging")]
        if set.purgatory_len() > 0 {
            log::debug!(
                "Pin set {index} released with {} records still pinned by other workers",
                set.purgatory_len()
            );
        }

        let mut top_ver = self.top_ver.load(Ordering::Acquire);
        loop {
            let top = top_ver % MAX_PIN_SETS;
            set.link.store(top, Ordering::Relaxed);
            let new_top_ver = top_ver
                .wrapping_sub(top)
                .wrapping_add(index)
                .wrapping_add(MAX_PIN_SETS);

            match self.top_ver.compare_exchange_weak(
                top_ver,
                new_top_ver,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => top_ver = actual,
            }
        }
    }

    /// Hands every record of `own`'s purgatory that no other pin set pins to
    /// the reclaimer.
    fn reclaim_unpinned(&self, own: &PinSet) {
        let offset = self.free_link_offset;
        // SAFETY: only the owner of `own` calls this.
        let purgatory = unsafe { &mut *own.purgatory.get() };
        if purgatory.len == 0 {
            return;
        }

        // Pairs with the fence in `Pins::pin`.
        atomic::fence(Ordering::SeqCst);

        let mut pinned: SmallVec<[*mut u8; 64]> = SmallVec::new();
        self.sets.for_each(|_, set| {
            if ptr::eq::<PinSet>(&**set, own) {
                return;
            }
            for pin in &set.pins {
                let addr = pin.load(Ordering::Acquire);
                if !addr.is_null() {
                    pinned.push(addr);
                }
            }
        });
        pinned.sort_unstable();

        let mut kept = Purgatory::default();
        let mut freed: Option<RetiredChain> = None;
        let mut current = purgatory.head;

        for _ in 0..purgatory.len {
            let next = unsafe { free_link(current, offset) }.load(Ordering::Relaxed);

            if pinned.binary_search(&current).is_ok() {
                unsafe { kept.push(current, offset) };
            } else {
                let record = unsafe { NonNull::new_unchecked(current) };
                match &mut freed {
                    Some(chain) => {
                        unsafe { free_link(current, offset) }
                            .store(chain.head.as_ptr(), Ordering::Relaxed);
                        chain.head = record;
                        chain.len += 1;
                    }
                    None => {
                        freed = Some(RetiredChain {
                            head: record,
                            tail: record,
                            len: 1,
                            link_offset: offset,
                        })
                    }
                }
            }

            current = next;
        }

        *purgatory = kept;

        if let Some(chain) = freed {
            #[cfg(feature = "unstable-debug-counters")]
            Counters::records_reclaimed(chain.len as u64);

            unsafe { self.reclaimer.reclaim(chain) };
        }
    }

    /// Hands every record still parked in a purgatory to the reclaimer.
    /// Requires exclusive access, so no handle can be alive.
    pub(crate) fn drain_purgatories(&mut self) {
        let offset = self.free_link_offset;
        let reclaimer = &self.reclaimer;
        self.sets.for_each(|_, set| {
            let purgatory = unsafe { &mut *set.purgatory.get() };
            if let Some(chain) = unsafe { purgatory.take(offset) } {
                unsafe { reclaimer.reclaim(chain) };
            }
        });
    }
}

impl<R: Reclaim> Drop for PinRegistry<R> {
    fn drop(&mut self) {
        self.drain_purgatories();
    }
}

/// A worker's handle on a pin set.
///
/// The handle may be moved to another thread but not shared: all operations
/// that go through it belong to one worker at a time. Dropping it releases the
/// pin set back to the registry.
pub struct Pins<'r, R: Reclaim> {
    registry: &'r PinRegistry<R>,
    set: &'r PinSet,
    index: u32,
    _not_sync: PhantomData<Cell<()>>,
}

impl<'r, R: Reclaim> Pins<'r, R> {
    /// Publishes `ptr` in pin slot `slot`, followed by a full fence. Callers
    /// must re-validate that the record is still reachable before they
    /// dereference it.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is not below `PINS_PER_SET`.
    #[inline]
    pub fn pin<T>(&self, slot: usize, ptr: *const T) {
        self.set.pins[slot].store(ptr as *mut u8, Ordering::Release);
        atomic::fence(Ordering::SeqCst);
    }

    /// Clears pin slot `slot`, followed by a full fence.
    #[inline]
    pub fn unpin(&self, slot: usize) {
        clear_pin(&self.set.pins[slot]);
    }

    /// Returns the address currently published in `slot`.
    pub fn pinned(&self, slot: usize) -> *const u8 {
        self.set.pins[slot].load(Ordering::Relaxed)
    }

    /// Pins `ptr` in `slot` until the returned guard is dropped.
    pub fn guard<T>(&self, slot: usize, ptr: *const T) -> PinGuard<'_> {
        self.pin(slot, ptr);
        PinGuard {
            slot: &self.set.pins[slot],
        }
    }

    /// Returns a guard that unpins every slot in `slots` when dropped, however
    /// the enclosing scope is left.
    pub fn scope(&self, slots: Range<usize>) -> PinScope<'_> {
        assert!(slots.end <= PINS_PER_SET);
        PinScope {
            set: self.set,
            slots,
        }
    }

    /// Retires `record`. It is handed to the reclaimer once no other worker
    /// pins it.
    ///
    /// # Safety
    ///
    /// `record` must be a record managed by this handle's registry, already
    /// unreachable for workers that have not pinned it yet, and retired only
    /// once.
    pub unsafe fn retire(&self, record: NonNull<u8>) {
        let len = {
            let purgatory = &mut *self.set.purgatory.get();
            purgatory.push(record.as_ptr(), self.registry.free_link_offset);
            purgatory.len
        };

        if len >= PURGATORY_SIZE {
            self.registry.reclaim_unpinned(self.set);
        }
    }

    /// Scans the other workers' pins now, whatever the purgatory size, and
    /// reclaims every retired record that is no longer pinned.
    pub fn flush(&self) {
        self.registry.reclaim_unpinned(self.set);
    }

    /// Number of retired records waiting in this handle's purgatory.
    pub fn purgatory_len(&self) -> usize {
        self.set.purgatory_len()
    }

    /// The registry this handle's pin set belongs to.
    pub fn registry(&self) -> &'r PinRegistry<R> {
        self.registry
    }
}

impl<'r, R: Reclaim> Drop for Pins<'r, R> {
    fn drop(&mut self) {
        self.set.clear_pins();
        self.registry.release(self.index, self.set);
    }
}

// SAFETY: the pin set is owned by whoever holds the handle.
unsafe impl<'r, R: Reclaim + Sync> Send for Pins<'r, R> {}

/// Keeps one pin published; unpins on drop.
#[must_use]
pub struct PinGuard<'p> {
    slot: &'p AtomicPtr<u8>,
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        clear_pin(self.slot);
    }
}

/// Unpins a range of slots on drop.
#[must_use]
pub struct PinScope<'p> {
    set: &'p PinSet,
    slots: Range<usize>,
}

impl Drop for PinScope<'_> {
    fn drop(&mut self) {
        for slot in self.slots.clone() {
            self.set.pins[slot].store(ptr::null_mut(), Ordering::Release);
        }
        atomic::fence(Ordering::SeqCst);
    }
}
