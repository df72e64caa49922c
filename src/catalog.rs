//! Read-only-after-init description of the device's memory heaps.

use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;

use crate::{math, provider::DeviceCapabilities};

/// Trades fewer-but-larger physical allocations against reserved space
/// that may never be used.
const BLOCK_SIZE_FACTOR: u64 = 4;

#[derive(Debug)]
struct HeapEntry {
    capacity_bytes: vk::DeviceSize,
    min_page_bytes: vk::DeviceSize,
    remaining_bytes: AtomicU64,
}

/// Per-heap capacities and page-size floors, computed once at init and
/// immutable afterwards except for the advisory `remaining_bytes`
/// counters.
#[derive(Debug)]
pub struct HeapCatalog {
    heaps: Vec<HeapEntry>,
    type_to_heap: Vec<u32>,
    granularity: vk::DeviceSize,
}

impl HeapCatalog {
    pub(crate) fn new(capabilities: &DeviceCapabilities) -> Self {
        let heap_count = capabilities.heap_capacity.len() as u64;
        let max_allocations =
            u64::from(capabilities.max_allocation_count).max(1);
        let heaps = capabilities
            .heap_capacity
            .iter()
            .map(|&capacity_bytes| {
                // The driver caps how many physical allocations can be
                // live at once. Pages must be large enough that even one
                // page per heap, type, and category stays under that cap.
                let per_allocation_budget =
                    capacity_bytes * heap_count / max_allocations;
                let min_page_bytes = capacity_bytes.min(
                    BLOCK_SIZE_FACTOR
                        * math::next_pow2_ge(per_allocation_budget),
                );
                HeapEntry {
                    capacity_bytes,
                    min_page_bytes,
                    remaining_bytes: AtomicU64::new(capacity_bytes),
                }
            })
            .collect();
        Self {
            heaps,
            type_to_heap: capabilities.type_to_heap.clone(),
            granularity: capabilities.buffer_image_granularity.max(1),
        }
    }

    pub fn heap_count(&self) -> usize {
        self.heaps.len()
    }

    pub fn type_count(&self) -> usize {
        self.type_to_heap.len()
    }

    pub fn capacity_bytes(&self, heap_index: usize) -> vk::DeviceSize {
        self.heaps[heap_index].capacity_bytes
    }

    /// The smallest page the given heap will reserve.
    pub fn min_page_bytes(&self, heap_index: usize) -> vk::DeviceSize {
        self.heaps[heap_index].min_page_bytes
    }

    /// The platform-wide granularity every shared sub-allocation start
    /// offset must be a multiple of.
    pub fn granularity(&self) -> vk::DeviceSize {
        self.granularity
    }

    pub(crate) fn heap_for_type(&self, memory_type_index: u32) -> usize {
        self.type_to_heap[memory_type_index as usize] as usize
    }

    /// Advisory count of bytes not yet reserved from a heap. Reads are
    /// lock-free and may race with allocation; never gate a decision on
    /// this value.
    pub fn remaining_bytes(&self, heap_index: usize) -> u64 {
        self.heaps[heap_index].remaining_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn debit(&self, heap_index: usize, bytes: u64) {
        // Saturating: the driver may grant more than the advertised
        // capacity, and the counter is advisory either way.
        let _ = self.heaps[heap_index].remaining_bytes.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |remaining| Some(remaining.saturating_sub(bytes)),
        );
    }

    pub(crate) fn credit(&self, heap_index: usize, bytes: u64) {
        let capacity = self.heaps[heap_index].capacity_bytes;
        let _ = self.heaps[heap_index].remaining_bytes.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |remaining| Some((remaining + bytes).min(capacity)),
        );
    }
}
