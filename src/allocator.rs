//! The process-wide entry point for device memory sub-allocation.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use ash::vk::{self, Handle};

use crate::{
    catalog::HeapCatalog,
    error::AllocatorError,
    heap::{MemoryCategory, MemoryHeap, SlotIndex},
    provider::{DeviceCapabilities, MemoryProvider},
};

/// A single sub-allocated piece of device memory.
///
/// Present the handle unchanged to [`HeapAllocator::free`]; the private
/// fields route the free in O(1) without searching any list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationHandle {
    memory: vk::DeviceMemory,
    offset: vk::DeviceSize,
    memory_type_index: u32,
    category: MemoryCategory,
    page: SlotIndex,
    block: SlotIndex,
}

impl AllocationHandle {
    /// The backing physical allocation. It is generally shared with other
    /// handles; never free it directly.
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// The byte offset of this sub-allocation within [`Self::memory`].
    pub fn offset(&self) -> vk::DeviceSize {
        self.offset
    }
}

/// Decorates the real provider so the catalog's advisory per-heap
/// counters track every raw allocation and free.
struct TrackedProvider<P> {
    inner: P,
    catalog: Arc<HeapCatalog>,
    live: HashMap<u64, (usize, vk::DeviceSize)>,
}

impl<P: MemoryProvider> MemoryProvider for TrackedProvider<P> {
    fn query_capabilities(&self) -> DeviceCapabilities {
        self.inner.query_capabilities()
    }

    unsafe fn allocate(
        &mut self,
        memory_type_index: u32,
        size_in_bytes: vk::DeviceSize,
        category: MemoryCategory,
        dedicated: bool,
    ) -> Result<vk::DeviceMemory, AllocatorError> {
        let memory = self.inner.allocate(
            memory_type_index,
            size_in_bytes,
            category,
            dedicated,
        )?;
        let heap_index = self.catalog.heap_for_type(memory_type_index);
        self.catalog.debit(heap_index, size_in_bytes);
        self.live.insert(memory.as_raw(), (heap_index, size_in_bytes));
        Ok(memory)
    }

    unsafe fn free(&mut self, memory: vk::DeviceMemory) {
        if let Some((heap_index, size_in_bytes)) =
            self.live.remove(&memory.as_raw())
        {
            self.catalog.credit(heap_index, size_in_bytes);
        }
        self.inner.free(memory);
    }
}

struct AllocatorState<P> {
    provider: TrackedProvider<P>,

    /// One heap per (memory type, category), type-major.
    heaps: Vec<MemoryHeap>,
}

/// The device memory sub-allocator: turns a handful of large physical
/// allocations into many small, precisely-aligned regions.
///
/// One instance per logical device, shared by reference between every
/// call site. A single mutex serializes all of alloc/free; allocation is
/// not the renderer's throughput bottleneck, so correctness and
/// simplicity win over finer-grained locking. The only wait is the mutex
/// itself, held for one page search plus at most one raw device call.
pub struct HeapAllocator<P: MemoryProvider> {
    catalog: Arc<HeapCatalog>,
    state: Mutex<AllocatorState<P>>,
}

impl<P: MemoryProvider> HeapAllocator<P> {
    /// Query the provider's capabilities and build the (still empty) heap
    /// table.
    pub fn new(provider: P) -> Result<Self, AllocatorError> {
        let capabilities = provider.query_capabilities();
        let heap_count = capabilities.heap_capacity.len();
        for (memory_type_index, &heap_index) in
            capabilities.type_to_heap.iter().enumerate()
        {
            if heap_index as usize >= heap_count {
                return Err(AllocatorError::InvalidCapabilities {
                    memory_type_index: memory_type_index as u32,
                    heap_index,
                    heap_count,
                });
            }
        }

        let catalog = Arc::new(HeapCatalog::new(&capabilities));
        let type_count = capabilities.type_to_heap.len();
        let mut heaps = Vec::with_capacity(type_count * MemoryCategory::COUNT);
        for memory_type_index in 0..type_count as u32 {
            let heap_index = catalog.heap_for_type(memory_type_index);
            for &category in MemoryCategory::ALL.iter() {
                heaps.push(MemoryHeap::new(
                    memory_type_index,
                    category,
                    catalog.min_page_bytes(heap_index),
                    catalog.granularity(),
                ));
            }
        }
        log::info!(
            "device heap allocator ready: {} memory types over {} heaps",
            type_count,
            heap_count,
        );

        Ok(Self {
            catalog: catalog.clone(),
            state: Mutex::new(AllocatorState {
                provider: TrackedProvider {
                    inner: provider,
                    catalog,
                    live: HashMap::new(),
                },
                heaps,
            }),
        })
    }

    /// Sub-allocate `size_in_bytes` bytes starting at a multiple of
    /// `alignment_in_bytes`.
    ///
    /// Fails only when the device itself cannot satisfy a raw allocation;
    /// internal growth has already exhausted every other strategy by
    /// then, so the error is never retried here.
    ///
    /// # Panics
    ///
    /// If `memory_type_index` is out of range or the size is zero. Both
    /// indicate a bug in the caller that chose the memory type, not a
    /// runtime condition.
    pub fn allocate(
        &self,
        size_in_bytes: vk::DeviceSize,
        alignment_in_bytes: vk::DeviceSize,
        memory_type_index: u32,
        category: MemoryCategory,
        exclusive: bool,
    ) -> Result<AllocationHandle, AllocatorError> {
        assert!(size_in_bytes > 0, "zero-sized device memory request");
        let slot = self.heap_slot(memory_type_index, category);

        let mut guard = self
            .state
            .lock()
            .expect("unable to acquire the allocator lock");
        let state = &mut *guard;
        let heap = &mut state.heaps[slot];
        let (page, block) = heap.alloc(
            &mut state.provider,
            size_in_bytes,
            alignment_in_bytes,
            exclusive,
        )?;
        let (memory, offset) = heap.block_location(page, block);
        log::trace!(
            "allocated {} bytes at offset {} of {:?} (type {}, {:?})",
            size_in_bytes,
            offset,
            memory,
            memory_type_index,
            category,
        );
        Ok(AllocationHandle {
            memory,
            offset,
            memory_type_index,
            category,
            page,
            block,
        })
    }

    /// Return a sub-allocation to its heap, coalescing as needed and
    /// releasing the backing page when it empties.
    pub fn free(&self, handle: AllocationHandle) {
        let slot = self.heap_slot(handle.memory_type_index, handle.category);
        let mut guard = self
            .state
            .lock()
            .expect("unable to acquire the allocator lock");
        let state = &mut *guard;
        log::trace!(
            "freeing {} byte offset of {:?} (type {}, {:?})",
            handle.offset,
            handle.memory,
            handle.memory_type_index,
            handle.category,
        );
        state.heaps[slot].free(&mut state.provider, handle.page, handle.block);
    }

    /// Tear the allocator down and hand the provider back.
    ///
    /// # Panics
    ///
    /// If any allocation is still outstanding. That is a resource leak in
    /// an upstream caller and is fatal by contract.
    pub fn un_init(self) -> P {
        let state = self
            .state
            .into_inner()
            .expect("unable to acquire the allocator lock");
        for heap in &state.heaps {
            assert!(
                !heap.has_live_allocations(),
                "device memory leaked: a heap still holds bound pages at shutdown"
            );
        }
        state.provider.inner
    }

    /// The catalog built at init: capacities, page-size floors, and
    /// advisory remaining-byte counters.
    pub fn catalog(&self) -> &HeapCatalog {
        &self.catalog
    }

    /// Advisory snapshot of a heap's unreserved bytes. Reads race with
    /// allocation on purpose and may be momentarily stale.
    pub fn heap_remaining_bytes(&self, heap_index: usize) -> u64 {
        self.catalog.remaining_bytes(heap_index)
    }

    /// Walk every heap and verify the structural invariants: blocks tile
    /// their pages exactly and page sizes sum to the recorded totals.
    /// The heavy checks only run in debug builds; the test suite calls
    /// this after every mutating step.
    pub fn check_consistency(&self) {
        let guard = self
            .state
            .lock()
            .expect("unable to acquire the allocator lock");
        for heap in &guard.heaps {
            heap.check();
        }
    }

    fn heap_slot(
        &self,
        memory_type_index: u32,
        category: MemoryCategory,
    ) -> usize {
        let type_count = self.catalog.type_count();
        assert!(
            (memory_type_index as usize) < type_count,
            "memory type index {} out of range ({} types reported)",
            memory_type_index,
            type_count,
        );
        memory_type_index as usize * MemoryCategory::COUNT + category.index()
    }
}
