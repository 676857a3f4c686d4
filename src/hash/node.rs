use std::{
    alloc::{self, Layout},
    ptr::{self, NonNull},
    slice,
    sync::atomic::{AtomicPtr, Ordering},
};

use tagptr::{AtomicTagPtr, TagPtr};

use crate::common::error::Error;

#[cfg(feature = "unstable-debug-counters")]
use crate::common::debug_counters::InternalGlobalDebugCounters as Counters;

/// Set in a node's own link once the node is logically deleted.
pub(crate) const DELETED_TAG: usize = 0b1;

pub(crate) type NodePtr = TagPtr<Node, 1>;

/// A forward link, either a node's or a bucket head's. The low bit of the
/// pointer is the deleted tag of the node that owns the link.
pub(crate) struct Link(AtomicTagPtr<Node, 1>);

impl Default for Link {
    fn default() -> Self {
        Self(AtomicTagPtr::null())
    }
}

impl Link {
    #[inline]
    pub(crate) fn load(&self) -> NodePtr {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn store(&self, ptr: NodePtr) {
        self.0.store(ptr, Ordering::Release)
    }

    #[inline]
    pub(crate) fn cas(&self, current: NodePtr, new: NodePtr) -> bool {
        self.0
            .compare_exchange(current, new, (Ordering::AcqRel, Ordering::Acquire))
            .is_ok()
    }
}

#[inline]
pub(crate) fn is_deleted(ptr: NodePtr) -> bool {
    ptr.decompose_tag() & DELETED_TAG != 0
}

/// Where the key lives inside an element.
#[derive(Clone, Copy)]
pub enum KeyLayout {
    /// `len` bytes starting at `offset`.
    Fixed { offset: usize, len: usize },
    /// Computed from the element. The returned slice must be part of the
    /// element passed in, and equal elements must give equal keys.
    Extract(fn(&[u8]) -> &[u8]),
}

impl KeyLayout {
    #[inline]
    pub(crate) fn key_of<'a>(&self, element: &'a [u8]) -> &'a [u8] {
        match *self {
            KeyLayout::Fixed { offset, len } => &element[offset..offset + len],
            KeyLayout::Extract(extract) => extract(element),
        }
    }
}

impl std::fmt::Debug for KeyLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyLayout::Fixed { offset, len } => f
                .debug_struct("Fixed")
                .field("offset", offset)
                .field("len", len)
                .finish(),
            KeyLayout::Extract(_) => f.write_str("Extract(..)"),
        }
    }
}

/// The header of every record in the table's list. Data nodes are followed by
/// the element bytes; dummy nodes have no element.
///
/// Data nodes carry `reverse_bits(hash) | 1`, dummy nodes
/// `reverse_bits(bucket)`, which is always even.
#[repr(C)]
pub(crate) struct Node {
    // Must stay first: the pool's free link lives at offset 0.
    #[allow(dead_code)]
    free_link: AtomicPtr<u8>,
    pub(crate) link: Link,
    pub(crate) hashnr: u32,
    key: *const u8,
    keylen: usize,
}

pub(crate) const FREE_LINK_OFFSET: usize = 0;
const ELEMENT_OFFSET: usize = std::mem::size_of::<Node>();

impl Node {
    pub(crate) fn record_layout(element_size: usize) -> Layout {
        Layout::from_size_align(
            ELEMENT_OFFSET + element_size,
            std::mem::align_of::<Node>(),
        )
        .expect("element size overflows a layout")
    }

    /// Fills a record from the pool with `element` and returns it as a node.
    ///
    /// # Safety
    ///
    /// `record` must be exclusively owned and sized for `element`.
    pub(crate) unsafe fn init_data(
        record: NonNull<u8>,
        element: &[u8],
        key_layout: &KeyLayout,
        hashnr: u32,
    ) -> *mut Node {
        let node = record.cast::<Node>().as_ptr();
        let data = record.as_ptr().add(ELEMENT_OFFSET);
        ptr::copy_nonoverlapping(element.as_ptr(), data, element.len());

        let key = key_layout.key_of(slice::from_raw_parts(data, element.len()));

        ptr::addr_of_mut!((*node).hashnr).write(hashnr);
        ptr::addr_of_mut!((*node).key).write(key.as_ptr());
        ptr::addr_of_mut!((*node).keylen).write(key.len());
        (*node).link.store(NodePtr::null());
        node
    }

    pub(crate) fn alloc_dummy(hashnr: u32) -> Result<NonNull<Node>, Error> {
        debug_assert_eq!(hashnr & 1, 0);
        let layout = Layout::new::<Node>();
        let node = NonNull::new(unsafe { alloc::alloc(layout) })
            .ok_or(Error::OutOfMemory)?
            .cast::<Node>();

        unsafe {
            node.as_ptr().write(Node {
                free_link: AtomicPtr::default(),
                link: Link::default(),
                hashnr,
                key: NonNull::<u8>::dangling().as_ptr(),
                keylen: 0,
            })
        };

        #[cfg(feature = "unstable-debug-counters")]
        Counters::dummy_node_created();

        Ok(node)
    }

    /// # Safety
    ///
    /// `node` must come from `alloc_dummy` and be referenced by nobody.
    pub(crate) unsafe fn free_dummy(node: NonNull<Node>) {
        alloc::dealloc(node.as_ptr().cast(), Layout::new::<Node>());

        #[cfg(feature = "unstable-debug-counters")]
        Counters::dummy_node_dropped();
    }

    #[inline]
    pub(crate) fn is_dummy(&self) -> bool {
        self.hashnr & 1 == 0
    }

    #[inline]
    pub(crate) fn key(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.key, self.keylen) }
    }

    /// # Safety
    ///
    /// `self` must be a data node of a table with `element_size`.
    #[inline]
    pub(crate) unsafe fn element(&self, element_size: usize) -> &[u8] {
        let data = (self as *const Node as *const u8).add(ELEMENT_OFFSET);
        slice::from_raw_parts(data, element_size)
    }
}

#[cfg(test)]
mod tests {
    use super::{is_deleted, KeyLayout, Node, NodePtr, DELETED_TAG, FREE_LINK_OFFSET};
    use std::{alloc::Layout, ptr::NonNull};

    #[test]
    fn free_link_is_first() {
        let node = Node::alloc_dummy(0).unwrap();
        let base = node.as_ptr() as usize;
        let link = unsafe { std::ptr::addr_of!((*node.as_ptr()).free_link) } as usize;
        assert_eq!(link - base, FREE_LINK_OFFSET);
        unsafe { Node::free_dummy(node) };
    }

    #[test]
    fn data_node_points_into_its_element() {
        let layout = Node::record_layout(12);
        assert_eq!(layout.align(), std::mem::align_of::<Node>());

        let record = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) }).unwrap();
        let element = *b"....key!....";
        let node = unsafe {
            Node::init_data(
                record,
                &element,
                &KeyLayout::Fixed { offset: 4, len: 4 },
                0b11,
            )
        };

        let node_ref = unsafe { &*node };
        assert_eq!(node_ref.key(), b"key!");
        assert_eq!(unsafe { node_ref.element(12) }, &element);
        assert!(!node_ref.is_dummy());
        assert!(node_ref.link.load().is_null());

        let key_addr = node_ref.key().as_ptr() as usize;
        assert!(key_addr > record.as_ptr() as usize);
        assert!(key_addr < record.as_ptr() as usize + layout.size());

        unsafe { std::alloc::dealloc(record.as_ptr(), layout) };
    }

    #[test]
    fn extracted_keys() {
        fn first_word(element: &[u8]) -> &[u8] {
            let end = element.iter().position(|&b| b == b' ').unwrap_or(element.len());
            &element[..end]
        }

        let layout = KeyLayout::Extract(first_word);
        assert_eq!(layout.key_of(b"hello world"), b"hello");
        assert_eq!(layout.key_of(b"single"), b"single");
        assert_eq!(format!("{layout:?}"), "Extract(..)");
    }

    #[test]
    fn dummies_are_even_and_keyless() {
        let node = Node::alloc_dummy(0b1010 << 28).unwrap();
        let node_ref = unsafe { node.as_ref() };
        assert!(node_ref.is_dummy());
        assert!(node_ref.key().is_empty());
        assert_eq!(Layout::new::<Node>().size() % std::mem::align_of::<Node>(), 0);
        unsafe { Node::free_dummy(node) };
    }

    #[test]
    fn deleted_tag() {
        let node = Node::alloc_dummy(0).unwrap();
        let live = NodePtr::new(node.as_ptr());
        let deleted = NodePtr::compose(node.as_ptr(), DELETED_TAG);
        assert!(!is_deleted(live));
        assert!(is_deleted(deleted));
        assert_eq!(deleted.decompose_ptr(), node.as_ptr());
        unsafe { Node::free_dummy(node) };
    }
}
