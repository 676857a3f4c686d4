//! A wait-free, append-only, multi-level array indexed by a `u32`.
//!
//! The directory consists of `LEVELS` independent trees. Tree `k` covers the
//! `FANOUT^(k+1)` indices that follow the ones covered by trees `0..k`, and has
//! `k` levels of inner nodes (arrays of `FANOUT` atomic pointers) above its leaf
//! chunks (arrays of `FANOUT` elements). With four levels of 256 entries the
//! directory addresses `256 + 256^2 + 256^3 + 256^4` slots, which is more than
//! any `u32` index can reach.
//!
//! Nothing is ever reallocated or moved: inner nodes and leaf chunks are
//! installed on first use with a single compare-and-swap, and a thread that
//! loses the race frees its speculative allocation and continues with the
//! winner's. A reference returned for an index therefore stays valid, and keeps
//! pointing at the same slot, for the whole life of the directory.

use std::{
    marker::PhantomData,
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

use crate::common::error::Error;

#[cfg(feature = "unstable-debug-counters")]
use crate::common::debug_counters::InternalGlobalDebugCounters as Counters;

pub(crate) const FANOUT: usize = 256;
pub(crate) const LEVELS: usize = 4;

// The first index covered by each tree.
const IDXES_IN_PREV_LEVELS: [u64; LEVELS] = [
    0,
    FANOUT as u64,
    (FANOUT * FANOUT + FANOUT) as u64,
    (FANOUT * FANOUT * FANOUT + FANOUT * FANOUT + FANOUT) as u64,
];

pub struct GrowableDirectory<T> {
    levels: [AtomicPtr<()>; LEVELS],
    _marker: PhantomData<T>,
}

impl<T> Default for GrowableDirectory<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> GrowableDirectory<T> {
    /// Creates an empty directory. No memory is allocated until a slot is
    /// first written.
    pub fn new() -> Self {
        Self {
            levels: Default::default(),
            _marker: PhantomData,
        }
    }

    /// Returns the slot at `index`, or `None` if the chunk holding it has not
    /// been installed yet. Never allocates and never blocks.
    pub fn slot_for_read(&self, index: u32) -> Option<&T> {
        let (level, mut idx) = locate(index);
        let mut chunk = self.levels[level].load(Ordering::Acquire);

        for depth in (1..=level).rev() {
            if chunk.is_null() {
                return None;
            }
            let span = span(depth);
            let entry = unsafe { &*(chunk as *const AtomicPtr<()>).add((idx / span) as usize) };
            chunk = entry.load(Ordering::Acquire);
            idx %= span;
        }

        if chunk.is_null() {
            return None;
        }
        // SAFETY: leaf chunks hold `FANOUT` initialized elements and `idx` is
        // below `FANOUT` here. Chunks are only freed by `drop`.
        Some(unsafe { &*(chunk as *const T).add(idx as usize) })
    }

    /// Iterates over every slot of every installed leaf chunk, together with
    /// its index. Slots of a chunk that were never written still hold
    /// `T::default()`.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(u32, &T),
    {
        for (level, root) in self.levels.iter().enumerate() {
            let chunk = root.load(Ordering::Acquire);
            unsafe { visit(chunk, level, IDXES_IN_PREV_LEVELS[level], &mut f) };
        }
    }
}

impl<T: Default> GrowableDirectory<T> {
    /// Returns the slot at `index`, installing any missing inner node and the
    /// leaf chunk first.
    ///
    /// Returns `Error::OutOfMemory` if an allocation fails. In that case the
    /// directory is left exactly as it was, apart from the levels another
    /// thread (or an earlier step of this call) installed successfully.
    pub fn slot_for_write(&self, index: u32) -> Result<&T, Error> {
        let (level, mut idx) = locate(index);
        let mut entry = &self.levels[level];

        for depth in (1..=level).rev() {
            let inner = install::<AtomicPtr<()>>(entry)? as *const AtomicPtr<()>;
            let span = span(depth);
            entry = unsafe { &*inner.add((idx / span) as usize) };
            idx %= span;
        }

        let leaf = install::<T>(entry)? as *const T;
        Ok(unsafe { &*leaf.add(idx as usize) })
    }
}

impl<T> Drop for GrowableDirectory<T> {
    fn drop(&mut self) {
        for (level, root) in self.levels.iter_mut().enumerate() {
            let chunk = std::mem::replace(root.get_mut(), ptr::null_mut());
            unsafe { drop_subtree::<T>(chunk, level) };
        }
    }
}

/// Returns the tree that covers `index` and the offset of `index` inside it.
fn locate(index: u32) -> (usize, u64) {
    let index = u64::from(index);
    let mut level = LEVELS - 1;
    while index < IDXES_IN_PREV_LEVELS[level] {
        level -= 1;
    }
    (level, index - IDXES_IN_PREV_LEVELS[level])
}

/// Number of slots below one entry of an inner node at `depth`.
fn span(depth: usize) -> u64 {
    (FANOUT as u64).pow(depth as u32)
}

fn install<U: Default>(entry: &AtomicPtr<()>) -> Result<*mut (), Error> {
    let current = entry.load(Ordering::Acquire);
    if !current.is_null() {
        return Ok(current);
    }

    let new_chunk = new_chunk::<U>()? as *mut ();
    match entry.compare_exchange(
        ptr::null_mut(),
        new_chunk,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => Ok(new_chunk),
        Err(winner) => {
            // Lost the race. Nobody else has seen our chunk.
            unsafe { drop_chunk(new_chunk as *mut U) };
            Ok(winner)
        }
    }
}

fn new_chunk<U: Default>() -> Result<*mut U, Error> {
    let mut chunk = Vec::new();
    chunk
        .try_reserve_exact(FANOUT)
        .map_err(|_| Error::OutOfMemory)?;
    chunk.resize_with(FANOUT, U::default);

    #[cfg(feature = "unstable-debug-counters")]
    Counters::directory_chunk_created((FANOUT * std::mem::size_of::<U>()) as u64);

    Ok(Box::into_raw(chunk.into_boxed_slice()) as *mut U)
}

unsafe fn drop_chunk<U>(chunk: *mut U) {
    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(chunk, FANOUT)));
}

unsafe fn drop_subtree<T>(chunk: *mut (), depth: usize) {
    if chunk.is_null() {
        return;
    }
    if depth == 0 {
        drop_chunk(chunk as *mut T);
        return;
    }

    let inner = chunk as *mut AtomicPtr<()>;
    for i in 0..FANOUT {
        let child = (*inner.add(i)).load(Ordering::Relaxed);
        drop_subtree::<T>(child, depth - 1);
    }
    drop_chunk(inner);
}

unsafe fn visit<T, F>(chunk: *mut (), depth: usize, base: u64, f: &mut F)
where
    F: FnMut(u32, &T),
{
    if chunk.is_null() {
        return;
    }
    if depth == 0 {
        let leaf = chunk as *const T;
        for i in 0..FANOUT {
            // Leaf chunks never straddle the end of the `u32` range.
            f((base + i as u64) as u32, &*leaf.add(i));
        }
        return;
    }

    let inner = chunk as *const AtomicPtr<()>;
    let span = span(depth);
    for i in 0..FANOUT {
        let child = (*inner.add(i)).load(Ordering::Acquire);
        visit(child, depth - 1, base + i as u64 * span, f);
    }
}
