//! A lock-free pool of fixed-size records.
//!
//! Records freed through the pool are retired into the caller's purgatory
//! first. Only when the pin scan proves that nobody references them any more
//! are they pushed on the pool's free stack, from where `allocate` hands them
//! out again. The system allocator is used when the stack is empty.
//!
//! Popping from the free stack pins the top record before reading its link.
//! A pinned record cannot be reclaimed, so it cannot come back to the top of
//! the stack while a pop that read it is still in flight, and the pop's
//! compare-and-swap cannot succeed against a stale link.

use std::{
    alloc::{self, Layout},
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use crossbeam_utils::Backoff;

use crate::{
    common::error::Error,
    pin::{free_link, PinRegistry, Pins, Reclaim, RetiredChain},
};

#[cfg(feature = "unstable-debug-counters")]
use crate::common::debug_counters::InternalGlobalDebugCounters as Counters;

const PIN_TOP: usize = 0;

/// The free stack of a [`PooledAllocator`]. Reclaimed records are pushed on
/// it, a whole chain at a time.
pub struct FreeStack {
    top: AtomicPtr<u8>,
    link_offset: usize,
    layout: Layout,
    mallocs: AtomicUsize,
}

impl Reclaim for FreeStack {
    unsafe fn reclaim(&self, chain: RetiredChain) {
        let tail_link = free_link(chain.tail().as_ptr(), self.link_offset);
        let mut top = self.top.load(Ordering::Relaxed);
        loop {
            tail_link.store(top, Ordering::Relaxed);
            match self.top.compare_exchange_weak(
                top,
                chain.head().as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => top = actual,
            }
        }
    }
}

/// Hands out fixed-size records and takes them back once no pin references
/// them.
pub struct PooledAllocator {
    registry: PinRegistry<FreeStack>,
}

impl PooledAllocator {
    /// Creates a pool of records of `layout`, each carrying an
    /// `AtomicPtr<u8>` free link at `free_link_offset`.
    ///
    /// # Panics
    ///
    /// Panics if the free link does not fit in the record or is misaligned.
    pub fn new(layout: Layout, free_link_offset: usize) -> Self {
        assert!(
            layout.size() >= free_link_offset + std::mem::size_of::<AtomicPtr<u8>>(),
            "the free link must fit in the record"
        );
        assert!(layout.align() >= std::mem::align_of::<AtomicPtr<u8>>());

        let stack = FreeStack {
            top: AtomicPtr::default(),
            link_offset: free_link_offset,
            layout,
            mallocs: AtomicUsize::default(),
        };

        Self {
            registry: PinRegistry::new(free_link_offset, stack),
        }
    }

    /// The layout of every record of this pool.
    pub fn layout(&self) -> Layout {
        self.registry.reclaimer().layout
    }

    /// Acquires a pin set of this pool's registry.
    pub fn pins(&self) -> Result<Pins<'_, FreeStack>, Error> {
        self.registry.acquire()
    }

    pub(crate) fn registry(&self) -> &PinRegistry<FreeStack> {
        &self.registry
    }

    /// Returns a record, recycled from the free stack if possible.
    ///
    /// A recycled record keeps whatever its previous user wrote into it. A
    /// fresh one is zeroed.
    ///
    /// Uses pin slot 0 and clears it before returning.
    ///
    /// # Panics
    ///
    /// Panics if `pins` belongs to a different pool.
    pub fn allocate(&self, pins: &Pins<'_, FreeStack>) -> Result<NonNull<u8>, Error> {
        assert!(
            ptr::eq(pins.registry(), &self.registry),
            "pins belong to a different pool"
        );

        let stack = self.registry.reclaimer();
        let _scope = pins.scope(PIN_TOP..PIN_TOP + 1);
        let backoff = Backoff::new();

        loop {
            let top = loop {
                let top = stack.top.load(Ordering::Acquire);
                pins.pin(PIN_TOP, top);
                if top == stack.top.load(Ordering::Acquire) {
                    break top;
                }
                backoff.spin();
            };

            let Some(record) = NonNull::new(top) else {
                return self.allocate_fresh();
            };

            let next = unsafe { free_link(top, stack.link_offset) }.load(Ordering::Relaxed);
            if stack
                .top
                .compare_exchange(top, next, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(record);
            }
            backoff.spin();
        }
    }

    fn allocate_fresh(&self) -> Result<NonNull<u8>, Error> {
        let stack = self.registry.reclaimer();
        let record = NonNull::new(unsafe { alloc::alloc_zeroed(stack.layout) })
            .ok_or(Error::OutOfMemory)?;
        stack.mallocs.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "unstable-debug-counters")]
        Counters::record_allocated();

        Ok(record)
    }

    /// Frees `record` once no pin references it any more. Until then it is
    /// neither reused nor returned to the system.
    ///
    /// # Safety
    ///
    /// `record` must come from this pool, be unreachable for workers that have
    /// not pinned it yet, and be freed only once.
    pub unsafe fn free(&self, pins: &Pins<'_, FreeStack>, record: NonNull<u8>) {
        pins.retire(record);
    }

    /// Returns `record` straight to the system allocator.
    ///
    /// # Safety
    ///
    /// `record` must come from this pool and nobody may reference it any more.
    pub unsafe fn release(&self, record: NonNull<u8>) {
        alloc::dealloc(record.as_ptr(), self.layout());

        #[cfg(feature = "unstable-debug-counters")]
        Counters::record_released();
    }

    /// Number of records currently waiting on the free stack.
    ///
    /// Exact while no other worker uses the pool. Otherwise it is a snapshot
    /// that may be off by the records pushed and popped during the walk, and
    /// never exceeds [`mallocs`](Self::mallocs).
    pub fn in_pool(&self) -> usize {
        let stack = self.registry.reclaimer();
        let limit = self.mallocs();
        let mut count = 0;
        let mut record = stack.top.load(Ordering::Acquire);
        // Records stay allocated until the pool is dropped, so following a
        // stale link is safe; the limit stops a walk that went astray.
        while !record.is_null() && count < limit {
            count += 1;
            record = unsafe { free_link(record, stack.link_offset) }.load(Ordering::Acquire);
        }
        count
    }

    /// Number of records taken from the system allocator so far.
    pub fn mallocs(&self) -> usize {
        self.registry.reclaimer().mallocs.load(Ordering::Relaxed)
    }
}

impl Drop for PooledAllocator {
    fn drop(&mut self) {
        self.registry.drain_purgatories();

        let stack = self.registry.reclaimer();
        let mut record = stack.top.swap(ptr::null_mut(), Ordering::Acquire);
        while let Some(current) = NonNull::new(record) {
            record = unsafe { free_link(record, stack.link_offset) }.load(Ordering::Relaxed);
            unsafe { self.release(current) };
        }
    }
}
