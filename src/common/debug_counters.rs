#![cfg(feature = "unstable-debug-counters")]

use crossbeam_utils::atomic::AtomicCell;
use once_cell::sync::Lazy;

/// Process-wide counters of internal allocations, summed over every table.
#[derive(Clone, Debug)]
pub struct GlobalDebugCounters {
    pub directory_chunk_creation_count: u64,
    pub directory_chunk_allocation_bytes: u64,
    pub pin_set_creation_count: u64,
    pub record_allocation_count: u64,
    pub record_reclaim_count: u64,
    pub record_release_count: u64,
    pub dummy_node_creation_count: u64,
    pub dummy_node_drop_count: u64,
}

impl GlobalDebugCounters {
    pub fn current() -> Self {
        InternalGlobalDebugCounters::current()
    }
}

static COUNTERS: Lazy<InternalGlobalDebugCounters> =
    Lazy::new(InternalGlobalDebugCounters::default);

#[derive(Default)]
pub(crate) struct InternalGlobalDebugCounters {
    directory_chunk_creation_count: AtomicCell<u64>,
    directory_chunk_allocation_bytes: AtomicCell<u64>,
    pin_set_creation_count: AtomicCell<u64>,
    record_allocation_count: AtomicCell<u64>,
    record_reclaim_count: AtomicCell<u64>,
    record_release_count: AtomicCell<u64>,
    dummy_node_creation_count: AtomicCell<u64>,
    dummy_node_drop_count: AtomicCell<u64>,
}

impl InternalGlobalDebugCounters {
    fn current() -> GlobalDebugCounters {
        let c = &COUNTERS;
        GlobalDebugCounters {
            directory_chunk_creation_count: c.directory_chunk_creation_count.load(),
            directory_chunk_allocation_bytes: c.directory_chunk_allocation_bytes.load(),
            pin_set_creation_count: c.pin_set_creation_count.load(),
            record_allocation_count: c.record_allocation_count.load(),
            record_reclaim_count: c.record_reclaim_count.load(),
            record_release_count: c.record_release_count.load(),
            dummy_node_creation_count: c.dummy_node_creation_count.load(),
            dummy_node_drop_count: c.dummy_node_drop_count.load(),
        }
    }

    pub(crate) fn directory_chunk_created(byte_size: u64) {
        COUNTERS.directory_chunk_creation_count.fetch_add(1);
        COUNTERS.directory_chunk_allocation_bytes.fetch_add(byte_size);
    }

    pub(crate) fn pin_set_created() {
        COUNTERS.pin_set_creation_count.fetch_add(1);
    }

    pub(crate) fn record_allocated() {
        COUNTERS.record_allocation_count.fetch_add(1);
    }

    pub(crate) fn records_reclaimed(count: u64) {
        COUNTERS.record_reclaim_count.fetch_add(count);
    }

    pub(crate) fn record_released() {
        COUNTERS.record_release_count.fetch_add(1);
    }

    pub(crate) fn dummy_node_created() {
        COUNTERS.dummy_node_creation_count.fetch_add(1);
    }

    pub(crate) fn dummy_node_dropped() {
        COUNTERS.dummy_node_drop_count.fetch_add(1);
    }
}
