//! A lock-free, extensible hash table over a split-ordered list.
//!
//! All elements of the table live in one sorted singly linked list. The list
//! is ordered by the bit-reversed hash code of each element, so that the
//! elements of bucket `b` of a table with `2^k` buckets form one contiguous
//! run, and splitting the table to `2^(k+1)` buckets only splits every run
//! in two without moving anything. Each bucket `b` points into the list at a
//! *dummy* node that carries `reverse_bits(b)`; data nodes carry
//! `reverse_bits(hash) | 1`, so a dummy always sorts before the elements of
//! its bucket.
//!
//! Growing the table is a single compare-and-swap of the bucket count. New
//! buckets are initialized lazily, by the first insert or delete that needs
//! them, starting from the nearest initialized ancestor bucket (the bucket
//! number with its highest set bit cleared). Lookups never initialize buckets;
//! they walk from the nearest initialized ancestor instead.
//!
//! Deletion first tags the node's own link, which makes it logically deleted,
//! and then unlinks it from its predecessor. A walker that meets a tagged
//! node unlinks it on the deleter's behalf. Unlinked nodes are retired to the
//! caller's purgatory and reused only once no pin references them.
//!
//! Every list walk uses pin slots 0, 1 and 2 of the caller's [`Pins`]. A
//! [`Found`] returned by `search` holds slot 3.

use std::{
    cmp::Ordering as CmpOrdering,
    fmt,
    ops::{Deref, Range},
    ptr::{self, NonNull},
    sync::atomic::{AtomicIsize, AtomicU32, Ordering},
};

use crossbeam_utils::Backoff;
use smallvec::SmallVec;

use crate::{
    alloc::{FreeStack, PooledAllocator},
    collation::{BinaryCollation, Collation},
    common::error::Error,
    directory::GrowableDirectory,
    pin::{PinGuard, Pins},
};

pub(crate) mod builder;
pub(crate) mod node;

use self::{
    builder::LfHashBuilder,
    node::{is_deleted, KeyLayout, Link, Node, NodePtr, DELETED_TAG, FREE_LINK_OFFSET},
};

/// A worker's pin set for one [`LfHash`].
pub type HashPins<'a> = Pins<'a, FreeStack>;

const PIN_NEXT: usize = 0;
const PIN_CURR: usize = 1;
const PIN_PREV: usize = 2;
const PIN_FOUND: usize = 3;
const WALK_PINS: Range<usize> = PIN_NEXT..PIN_PREV + 1;

pub(crate) const MAX_BUCKETS: u32 = 1 << 31;
const HASH_MASK: u32 = 0x7fff_ffff;

/// A concurrent hash table of fixed-size elements, keyed by a part of each
/// element.
///
/// Every operation takes the caller's [`HashPins`], acquired once per worker
/// with [`LfHash::pins`]. Operations never block; a worker that loses a race
/// retries its own step.
///
/// # Example
///
/// ```rust
/// use lfhash::{Error, LfHash};
///
/// # fn main() -> Result<(), Error> {
/// // 8-byte elements; the first 4 bytes are the key.
/// let table = LfHash::new(8, 0, 4)?;
/// let mut pins = table.pins()?;
///
/// table.insert(&mut pins, b"key1val1")?;
/// assert_eq!(table.insert(&mut pins, b"key1val2"), Err(Error::DuplicateKey));
///
/// let found = table.search(&mut pins, b"key1").expect("present");
/// assert_eq!(&*found, b"key1val1");
/// drop(found);
///
/// table.delete(&mut pins, b"key1")?;
/// assert!(!table.contains(&mut pins, b"key1"));
/// # Ok(())
/// # }
/// ```
pub struct LfHash<C = BinaryCollation> {
    buckets: GrowableDirectory<Link>,
    alloc: PooledAllocator,
    collation: C,
    key_layout: KeyLayout,
    element_size: usize,
    unique: bool,
    max_load: f64,
    size: AtomicU32,
    count: AtomicIsize,
}

// SAFETY: nodes are only reached through atomic links, and their memory is
// owned by the table.
unsafe impl<C: Send> Send for LfHash<C> {}
unsafe impl<C: Sync> Sync for LfHash<C> {}

impl LfHash<BinaryCollation> {
    /// Creates a table with unique keys of `key_len` bytes at `key_offset` in
    /// elements of `element_size` bytes, compared byte-wise.
    ///
    /// # Panics
    ///
    /// Panics if the key is empty or does not fit in the element.
    pub fn new(element_size: usize, key_offset: usize, key_len: usize) -> Result<Self, Error> {
        LfHashBuilder::new(element_size)
            .key(key_offset, key_len)
            .build()
    }

    /// Returns a builder for a table of elements of `element_size` bytes.
    pub fn builder(element_size: usize) -> LfHashBuilder<BinaryCollation> {
        LfHashBuilder::new(element_size)
    }
}

struct Cursor {
    prev: *const Link,
    curr: *mut Node,
    next: *mut Node,
}

impl<C: Collation> LfHash<C> {
    pub(crate) fn with_everything(
        element_size: usize,
        key_layout: KeyLayout,
        unique: bool,
        initial_buckets: u32,
        max_load: f64,
        collation: C,
    ) -> Result<Self, Error> {
        let table = Self {
            buckets: GrowableDirectory::new(),
            alloc: PooledAllocator::new(Node::record_layout(element_size), FREE_LINK_OFFSET),
            collation,
            key_layout,
            element_size,
            unique,
            max_load,
            size: AtomicU32::new(initial_buckets),
            count: AtomicIsize::new(0),
        };

        let head = table.buckets.slot_for_write(0)?;
        let dummy = Node::alloc_dummy(0)?;
        head.store(NodePtr::new(dummy.as_ptr()));

        Ok(table)
    }

    /// Acquires a pin set for the calling worker. Keep it for as many
    /// operations as convenient; dropping it returns the set to the table.
    pub fn pins(&self) -> Result<HashPins<'_>, Error> {
        self.alloc.pins()
    }

    /// Inserts a copy of `element`.
    ///
    /// Returns `Error::DuplicateKey` if the table has unique keys and an
    /// element with an equal key is present, leaving the table unchanged.
    ///
    /// # Panics
    ///
    /// Panics if `element` is not `element_size` bytes long or `pins` belongs
    /// to another table.
    pub fn insert(&self, pins: &mut HashPins<'_>, element: &[u8]) -> Result<(), Error> {
        self.check_pins(pins);
        assert_eq!(
            element.len(),
            self.element_size,
            "the element must be exactly element_size bytes long"
        );

        let hash = self.hash_of(self.key_layout.key_of(element));
        let record = self.alloc.allocate(pins)?;
        let node = unsafe {
            Node::init_data(
                record,
                element,
                &self.key_layout,
                hash.reverse_bits() | 1,
            )
        };

        let outcome = self
            .bucket_head(hash % self.size.load(Ordering::Acquire), pins)
            .and_then(|head| match unsafe { self.insert_node(head, node, pins, self.unique) } {
                None => Ok(()),
                Some(_) => Err(Error::DuplicateKey),
            });

        if let Err(e) = outcome {
            // The node was never published.
            unsafe { self.alloc.free(pins, record) };
            return Err(e);
        }

        let size = self.size.load(Ordering::Acquire);
        let count = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        if count as f64 / f64::from(size) > self.max_load
            && size < MAX_BUCKETS
            && self
                .size
                .compare_exchange(size, size * 2, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            #[cfg(feature = "logging")]
            log::debug!("Grew the table from {size} to {} buckets", size * 2);
        }

        Ok(())
    }

    /// Deletes an element with a key equal to `key`. If the table allows
    /// duplicates, the first such element in list order is deleted.
    ///
    /// Returns `Error::NotFound` if there is none.
    pub fn delete(&self, pins: &mut HashPins<'_>, key: &[u8]) -> Result<(), Error> {
        self.check_pins(pins);
        let hash = self.hash_of(key);
        let head = self.bucket_head(hash % self.size.load(Ordering::Acquire), pins)?;
        unsafe { self.delete_node(head, hash.reverse_bits() | 1, key, pins) }?;
        self.count.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    /// Looks up an element with a key equal to `key`.
    ///
    /// The element stays pinned, and so cannot be reused, until the returned
    /// [`Found`] is dropped. It may still be deleted from the table by other
    /// workers in the meantime. Never modifies the table.
    pub fn search<'p>(&self, pins: &'p mut HashPins<'_>, key: &[u8]) -> Option<Found<'p>> {
        self.check_pins(pins);
        let pins: &'p HashPins<'_> = pins;

        let hash = self.hash_of(key);
        let head = self.bucket_head_for_read(hash % self.size.load(Ordering::Acquire));

        let _scope = pins.scope(WALK_PINS);
        let (found, cursor) = unsafe { self.find(head, hash.reverse_bits() | 1, key, pins) };
        if !found {
            return None;
        }

        let pin = pins.guard(PIN_FOUND, cursor.curr);
        // SAFETY: the node was pinned in slot 1 when `find` validated it, and
        // is pinned in slot 3 from now on.
        let element = unsafe { (*cursor.curr).element(self.element_size) };
        Some(Found { element, _pin: pin })
    }

    /// Returns `true` if an element with a key equal to `key` is present.
    pub fn contains(&self, pins: &mut HashPins<'_>, key: &[u8]) -> bool {
        self.search(pins, key).is_some()
    }

    /// Number of elements. Momentarily inaccurate while operations are in
    /// flight.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire).max(0) as usize
    }

    /// Returns `true` if the table holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current number of buckets. A power of two that only grows.
    pub fn bucket_count(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    /// Size in bytes of every element.
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// Returns `true` if equal keys are rejected on insert.
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// The average number of elements per bucket above which the table grows.
    pub fn max_load(&self) -> f64 {
        self.max_load
    }

    /// The collation that hashes and compares keys.
    pub fn collation(&self) -> &C {
        &self.collation
    }

    /// Number of element records taken from the system allocator so far.
    pub fn mallocs(&self) -> usize {
        self.alloc.mallocs()
    }

    /// Number of element records waiting for reuse. Exact only while no other
    /// worker uses the table.
    pub fn pooled(&self) -> usize {
        self.alloc.in_pool()
    }

    fn check_pins(&self, pins: &HashPins<'_>) {
        assert!(
            ptr::eq(pins.registry(), self.alloc.registry()),
            "pins belong to a different table"
        );
    }

    #[inline]
    fn hash_of(&self, key: &[u8]) -> u32 {
        self.collation.hash(key) & HASH_MASK
    }

    /// Returns the head of `bucket`, initializing the bucket first if needed.
    fn bucket_head(&self, bucket: u32, pins: &HashPins<'_>) -> Result<&Link, Error> {
        let head = self.buckets.slot_for_write(bucket)?;
        if head.load().is_null() {
            self.initialize_bucket(bucket, pins)?;
        }
        Ok(head)
    }

    /// Returns the head of `bucket` or of its nearest initialized ancestor.
    fn bucket_head_for_read(&self, mut bucket: u32) -> &Link {
        loop {
            if let Some(head) = self.buckets.slot_for_read(bucket) {
                if !head.load().is_null() {
                    return head;
                }
            }
            // Bucket 0 is initialized when the table is created.
            bucket = clear_highest_bit(bucket);
        }
    }

    fn initialize_bucket(&self, bucket: u32, pins: &HashPins<'_>) -> Result<(), Error> {
        let mut uninitialized: SmallVec<[u32; 32]> = SmallVec::new();
        let mut ancestor = bucket;
        while self.buckets.slot_for_write(ancestor)?.load().is_null() {
            uninitialized.push(ancestor);
            ancestor = clear_highest_bit(ancestor);
        }

        // Parents first.
        while let Some(bucket) = uninitialized.pop() {
            let parent = self.buckets.slot_for_write(clear_highest_bit(bucket))?;
            let head = self.buckets.slot_for_write(bucket)?;
            if !head.load().is_null() {
                continue;
            }

            let dummy = Node::alloc_dummy(bucket.reverse_bits())?;
            let node = match unsafe { self.insert_node(parent, dummy.as_ptr(), pins, true) } {
                None => dummy.as_ptr(),
                Some(existing) => {
                    // Another worker linked the dummy first.
                    unsafe { Node::free_dummy(dummy) };
                    existing
                }
            };
            // Losing this race is fine: both point at the same dummy.
            head.cas(NodePtr::null(), NodePtr::new(node));
        }

        Ok(())
    }

    /// Links `node` into the list that starts at `head`. If `unique` and an
    /// equal node is present, returns it instead and leaves `node` unlinked.
    unsafe fn insert_node(
        &self,
        head: &Link,
        node: *mut Node,
        pins: &HashPins<'_>,
        unique: bool,
    ) -> Option<*mut Node> {
        let _scope = pins.scope(WALK_PINS);
        let node_ref = &*node;

        loop {
            let (found, cursor) = self.find(head, node_ref.hashnr, node_ref.key(), pins);
            if found && unique {
                return Some(cursor.curr);
            }
            node_ref.link.store(NodePtr::new(cursor.curr));
            if (*cursor.prev).cas(NodePtr::new(cursor.curr), NodePtr::new(node)) {
                return None;
            }
        }
    }

    unsafe fn delete_node(
        &self,
        head: &Link,
        hashnr: u32,
        key: &[u8],
        pins: &HashPins<'_>,
    ) -> Result<(), Error> {
        let _scope = pins.scope(WALK_PINS);
        let backoff = Backoff::new();

        loop {
            let (found, cursor) = self.find(head, hashnr, key, pins);
            if !found {
                return Err(Error::NotFound);
            }

            let curr = &*cursor.curr;
            let next = NodePtr::new(cursor.next);
            if !curr.link.cas(next, NodePtr::compose(cursor.next, DELETED_TAG)) {
                backoff.spin();
                continue;
            }

            if (*cursor.prev).cas(NodePtr::new(cursor.curr), next) {
                pins.retire(NonNull::new_unchecked(cursor.curr.cast()));
            } else {
                // The predecessor changed. A walk over the node unlinks it.
                self.find(head, hashnr, key, pins);
            }
            return Ok(());
        }
    }

    /// Walks the list from `head` to the first live node that is not below
    /// (`hashnr`, `key`), unlinking deleted nodes on the way.
    ///
    /// On return the cursor's `curr` is pinned in slot 1 and its `next` in
    /// slot 0. The node owning `prev` is pinned in slot 2, unless `prev` is
    /// `head` itself.
    unsafe fn find(
        &self,
        head: &Link,
        hashnr: u32,
        key: &[u8],
        pins: &HashPins<'_>,
    ) -> (bool, Cursor) {
        let backoff = Backoff::new();

        'retry: loop {
            let mut prev: *const Link = head;
            let mut curr = loop {
                let curr = head.load().decompose_ptr();
                pins.pin(PIN_CURR, curr);
                if head.load() == NodePtr::new(curr) {
                    break curr;
                }
                backoff.spin();
            };

            loop {
                let Some(curr_ref) = curr.as_ref() else {
                    let cursor = Cursor {
                        prev,
                        curr,
                        next: ptr::null_mut(),
                    };
                    return (false, cursor);
                };

                let (link, next) = loop {
                    let link = curr_ref.link.load();
                    let next = link.decompose_ptr();
                    pins.pin(PIN_NEXT, next);
                    if curr_ref.link.load() == link {
                        break (link, next);
                    }
                    backoff.spin();
                };

                let cur_hashnr = curr_ref.hashnr;
                let cur_key = curr_ref.key();

                if (*prev).load() != NodePtr::new(curr) {
                    // `curr` was unlinked or `prev` deleted under our feet.
                    backoff.snooze();
                    continue 'retry;
                }

                if !is_deleted(link) {
                    if cur_hashnr >= hashnr {
                        let order = if cur_hashnr > hashnr {
                            CmpOrdering::Greater
                        } else {
                            self.collation.compare(cur_key, key)
                        };
                        if order != CmpOrdering::Less {
                            let cursor = Cursor { prev, curr, next };
                            return (order == CmpOrdering::Equal, cursor);
                        }
                    }
                    prev = &curr_ref.link;
                    pins.pin(PIN_PREV, curr);
                } else if (*prev).cas(NodePtr::new(curr), NodePtr::new(next)) {
                    pins.retire(NonNull::new_unchecked(curr.cast()));
                } else {
                    backoff.snooze();
                    continue 'retry;
                }

                curr = next;
                pins.pin(PIN_CURR, curr);
            }
        }
    }
}

impl<C> Drop for LfHash<C> {
    fn drop(&mut self) {
        let Some(head) = self.buckets.slot_for_read(0) else {
            return;
        };

        let mut node = head.load().decompose_ptr();
        while let Some(current) = NonNull::new(node) {
            let current_ref = unsafe { current.as_ref() };
            node = current_ref.link.load().decompose_ptr();
            if current_ref.is_dummy() {
                unsafe { Node::free_dummy(current) };
            } else {
                unsafe { self.alloc.release(current.cast()) };
            }
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for LfHash<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LfHash")
            .field("len", &self.count.load(Ordering::Relaxed).max(0))
            .field("bucket_count", &self.size.load(Ordering::Relaxed))
            .field("element_size", &self.element_size)
            .field("key_layout", &self.key_layout)
            .field("unique", &self.unique)
            .field("collation", &self.collation)
            .finish()
    }
}

/// A pinned element returned by [`LfHash::search`]. Dereferences to the
/// element bytes.
pub struct Found<'p> {
    element: &'p [u8],
    _pin: PinGuard<'p>,
}

impl Deref for Found<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.element
    }
}

impl fmt::Debug for Found<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Found").field(&self.element).finish()
    }
}

/// The parent of a bucket: its number with the highest set bit cleared.
#[inline]
fn clear_highest_bit(bucket: u32) -> u32 {
    if bucket == 0 {
        0
    } else {
        bucket & !(1 << (31 - bucket.leading_zeros()))
    }
}
