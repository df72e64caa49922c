//! Integration tests driving the public allocator facade with an
//! in-memory provider. No GPU is required: physical handles are
//! fabricated and every raw allocation is tracked so the tests can
//! observe exactly what the device would have been asked to do.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Once},
};

use ash::vk::{self, Handle};

use ash_heap_allocator::{
    AllocationHandle, AllocatorError, DeviceCapabilities, HeapAllocator,
    MemoryCategory, MemoryProvider,
};

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        if let Ok(logger) = flexi_logger::Logger::try_with_env_or_str("info") {
            if let Ok(handle) = logger.start() {
                std::mem::forget(handle);
            }
        }
    });
}

#[derive(Default)]
struct Stats {
    next_handle: u64,
    live: HashMap<u64, vk::DeviceSize>,
    raw_sizes: Vec<vk::DeviceSize>,
    free_count: usize,
    fail_requests: bool,
}

impl Stats {
    fn live_bytes(&self) -> vk::DeviceSize {
        self.live.values().sum()
    }
}

/// A stand-in for the device which fabricates handles and records every
/// raw operation.
struct FakeProvider {
    capabilities: DeviceCapabilities,
    stats: Arc<Mutex<Stats>>,
}

impl FakeProvider {
    fn new(capabilities: DeviceCapabilities) -> (Self, Arc<Mutex<Stats>>) {
        let stats = Arc::new(Mutex::new(Stats::default()));
        (
            Self {
                capabilities,
                stats: stats.clone(),
            },
            stats,
        )
    }
}

impl MemoryProvider for FakeProvider {
    fn query_capabilities(&self) -> DeviceCapabilities {
        self.capabilities.clone()
    }

    unsafe fn allocate(
        &mut self,
        memory_type_index: u32,
        size_in_bytes: vk::DeviceSize,
        _category: MemoryCategory,
        _dedicated: bool,
    ) -> Result<vk::DeviceMemory, AllocatorError> {
        let mut stats = self.stats.lock().unwrap();
        if stats.fail_requests {
            return Err(AllocatorError::DeviceAllocationFailed {
                memory_type_index,
                size_in_bytes,
                source: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            });
        }
        stats.next_handle += 1;
        let raw = stats.next_handle;
        stats.live.insert(raw, size_in_bytes);
        stats.raw_sizes.push(size_in_bytes);
        Ok(vk::DeviceMemory::from_raw(raw))
    }

    unsafe fn free(&mut self, memory: vk::DeviceMemory) {
        let mut stats = self.stats.lock().unwrap();
        assert!(
            stats.live.remove(&memory.as_raw()).is_some(),
            "raw free of memory that was not live"
        );
        stats.free_count += 1;
    }
}

/// 1 MiB heap, 64-allocation cap, 1 KiB granularity: the minimum page
/// size works out to 64 KiB.
fn single_heap() -> (HeapAllocator<FakeProvider>, Arc<Mutex<Stats>>) {
    init_logging();
    let (provider, stats) = FakeProvider::new(DeviceCapabilities {
        heap_capacity: vec![1 << 20],
        type_to_heap: vec![0],
        max_allocation_count: 64,
        buffer_image_granularity: 1024,
    });
    (HeapAllocator::new(provider).unwrap(), stats)
}

fn shared_alloc(
    allocator: &HeapAllocator<FakeProvider>,
    size: u64,
    alignment: u64,
) -> AllocationHandle {
    let handle = allocator
        .allocate(size, alignment, 0, MemoryCategory::Shared, false)
        .unwrap();
    allocator.check_consistency();
    handle
}

#[test]
fn fills_a_page_then_grows_the_heap() {
    let (allocator, stats) = single_heap();
    assert_eq!(allocator.catalog().min_page_bytes(0), 64 * 1024);

    // The first request binds a minimum-sized page.
    let a = shared_alloc(&allocator, 4096, 256);
    assert_eq!(a.offset(), 0);
    assert_eq!(stats.lock().unwrap().raw_sizes, vec![65536]);

    // The rest of the page is used without a new physical allocation.
    let b = shared_alloc(&allocator, 61440, 256);
    assert_eq!(b.memory(), a.memory());
    assert_eq!(b.offset(), 4096);
    assert_eq!(stats.lock().unwrap().raw_sizes.len(), 1);

    // No room left: the heap grows and the request lands at offset zero
    // of a fresh physical allocation.
    let c = shared_alloc(&allocator, 8192, 256);
    assert_ne!(c.memory(), a.memory());
    assert_eq!(c.offset(), 0);
    // The grown 128 KiB page is shrunk back to the 64 KiB floor before
    // its first bind.
    assert_eq!(stats.lock().unwrap().raw_sizes, vec![65536, 65536]);

    allocator.free(a);
    allocator.free(b);
    allocator.free(c);
    allocator.check_consistency();

    let _provider = allocator.un_init();
    assert_eq!(stats.lock().unwrap().live_bytes(), 0);
}

#[test]
fn coalescing_releases_the_physical_allocation_exactly_once() {
    let (allocator, stats) = single_heap();

    let a = shared_alloc(&allocator, 4096, 256);
    let b = shared_alloc(&allocator, 4096, 256);
    assert_eq!(b.memory(), a.memory());

    allocator.free(a);
    assert_eq!(stats.lock().unwrap().free_count, 0);

    allocator.free(b);
    let stats = stats.lock().unwrap();
    assert_eq!(stats.free_count, 1);
    assert_eq!(stats.live_bytes(), 0);
}

#[test]
fn exclusive_allocations_never_share_a_physical_handle() {
    let (allocator, stats) = single_heap();

    let shared = shared_alloc(&allocator, 4096, 256);
    let dedicated = allocator
        .allocate(16 << 20, 256, 0, MemoryCategory::Shared, true)
        .unwrap();
    allocator.check_consistency();

    // The dedicated page is exactly the request size, independent of the
    // heap's normal 64 KiB page sizing.
    assert_ne!(dedicated.memory(), shared.memory());
    assert_eq!(dedicated.offset(), 0);
    assert_eq!(
        stats.lock().unwrap().raw_sizes,
        vec![65536, 16 << 20]
    );

    let frees_before = stats.lock().unwrap().free_count;
    allocator.free(dedicated);
    assert_eq!(stats.lock().unwrap().free_count, frees_before + 1);

    allocator.free(shared);
    let _provider = allocator.un_init();
    assert_eq!(stats.lock().unwrap().live_bytes(), 0);
}

#[test]
fn round_trip_placement_is_byte_identical() {
    let (allocator, stats) = single_heap();

    let first = shared_alloc(&allocator, 5000, 256);
    let first_offset = first.offset();
    allocator.free(first);

    // With no intervening allocations the same request gets the same
    // placement, proving coalescing restored the page exactly.
    let second = shared_alloc(&allocator, 5000, 256);
    assert_eq!(second.offset(), first_offset);

    let stats = stats.lock().unwrap();
    assert_eq!(stats.raw_sizes, vec![65536, 65536]);
}

#[test]
fn offsets_honor_the_requested_alignment() {
    let (allocator, _stats) = single_heap();

    let mut live = Vec::new();
    for &alignment in &[1u64, 64, 256, 4096, 65536] {
        for &size in &[1u64, 1000, 4096, 100_000] {
            let handle = shared_alloc(&allocator, size, alignment);
            assert_eq!(
                handle.offset() % alignment,
                0,
                "offset {} is not a multiple of alignment {}",
                handle.offset(),
                alignment,
            );
            live.push(handle);
        }
    }
    for handle in live {
        allocator.free(handle);
    }
    allocator.un_init();
}

#[test]
fn live_allocations_never_overlap() {
    let (allocator, _stats) = single_heap();

    // Interleave allocations and frees, checking after every step that
    // the live handles sharing a physical allocation are disjoint.
    let mut live: Vec<(AllocationHandle, u64)> = Vec::new();
    let sizes = [3000u64, 4096, 1024, 20_000, 512, 65536, 7000, 2048];
    for (step, &size) in sizes.iter().cycle().take(64).enumerate() {
        if step % 3 == 2 && !live.is_empty() {
            let (handle, _) = live.remove(step % live.len());
            allocator.free(handle);
        } else {
            let handle = shared_alloc(&allocator, size, 256);
            live.push((handle, size));
        }
        for (i, (a, a_size)) in live.iter().enumerate() {
            for (b, b_size) in live.iter().skip(i + 1) {
                if a.memory() != b.memory() {
                    continue;
                }
                let disjoint = a.offset() + a_size <= b.offset()
                    || b.offset() + b_size <= a.offset();
                assert!(
                    disjoint,
                    "allocations overlap: {}+{} vs {}+{}",
                    a.offset(),
                    a_size,
                    b.offset(),
                    b_size,
                );
            }
        }
    }
    for (handle, _) in live {
        allocator.free(handle);
    }
    allocator.un_init();
}

#[test]
fn freeing_everything_conserves_all_memory() {
    init_logging();
    let (provider, stats) = FakeProvider::new(DeviceCapabilities {
        heap_capacity: vec![1 << 20, 1 << 22],
        type_to_heap: vec![0, 1, 1],
        max_allocation_count: 256,
        buffer_image_granularity: 1024,
    });
    let allocator = HeapAllocator::new(provider).unwrap();

    let categories = [
        MemoryCategory::Shared,
        MemoryCategory::AccelerationStructure,
        MemoryCategory::DeviceAddress,
    ];
    let mut live = Vec::new();
    for memory_type_index in 0..3u32 {
        for (i, &category) in categories.iter().enumerate() {
            let exclusive = i == 2;
            let handle = allocator
                .allocate(
                    4096 * (i as u64 + 1),
                    256,
                    memory_type_index,
                    category,
                    exclusive,
                )
                .unwrap();
            live.push(handle);
        }
    }
    allocator.check_consistency();
    assert!(stats.lock().unwrap().live_bytes() > 0);

    // Free in a scrambled order.
    live.reverse();
    live.swap(0, 5);
    live.swap(2, 7);
    for handle in live {
        allocator.free(handle);
        allocator.check_consistency();
    }

    assert_eq!(stats.lock().unwrap().live_bytes(), 0);
    allocator.un_init();
}

#[test]
fn categories_do_not_share_physical_allocations() {
    let (allocator, _stats) = single_heap();

    let shared = allocator
        .allocate(4096, 256, 0, MemoryCategory::Shared, false)
        .unwrap();
    let acceleration = allocator
        .allocate(4096, 256, 0, MemoryCategory::AccelerationStructure, false)
        .unwrap();
    let device_address = allocator
        .allocate(4096, 256, 0, MemoryCategory::DeviceAddress, false)
        .unwrap();

    assert_ne!(shared.memory(), acceleration.memory());
    assert_ne!(shared.memory(), device_address.memory());
    assert_ne!(acceleration.memory(), device_address.memory());

    allocator.free(shared);
    allocator.free(acceleration);
    allocator.free(device_address);
    allocator.un_init();
}

#[test]
fn physical_exhaustion_propagates_and_is_not_fatal_to_the_allocator() {
    let (allocator, stats) = single_heap();

    stats.lock().unwrap().fail_requests = true;
    let result =
        allocator.allocate(4096, 256, 0, MemoryCategory::Shared, false);
    match result {
        Err(AllocatorError::DeviceAllocationFailed { .. }) => {}
        other => panic!("expected a device allocation failure: {:?}", other),
    }
    allocator.check_consistency();

    // Once the device recovers, the same allocator keeps working.
    stats.lock().unwrap().fail_requests = false;
    let handle = shared_alloc(&allocator, 4096, 256);
    allocator.free(handle);
    allocator.un_init();
}

#[test]
fn stale_remaining_bytes_are_still_bounded() {
    let (allocator, _stats) = single_heap();
    assert_eq!(allocator.heap_remaining_bytes(0), 1 << 20);

    let handle = shared_alloc(&allocator, 4096, 256);
    assert_eq!(allocator.heap_remaining_bytes(0), (1 << 20) - 65536);

    allocator.free(handle);
    assert_eq!(allocator.heap_remaining_bytes(0), 1 << 20);
    allocator.un_init();
}

#[test]
#[should_panic(expected = "device memory leaked")]
fn un_init_panics_when_allocations_leak() {
    let (allocator, _stats) = single_heap();
    let _leaked = shared_alloc(&allocator, 4096, 256);
    allocator.un_init();
}

#[test]
#[should_panic(expected = "out of range")]
fn invalid_memory_type_index_panics() {
    let (allocator, _stats) = single_heap();
    let _ = allocator.allocate(4096, 256, 9, MemoryCategory::Shared, false);
}

#[test]
#[should_panic(expected = "zero-sized")]
fn zero_sized_requests_panic() {
    let (allocator, _stats) = single_heap();
    let _ = allocator.allocate(0, 256, 0, MemoryCategory::Shared, false);
}

#[test]
fn parallel_workers_allocate_and_free_safely() {
    let (allocator, stats) = single_heap();
    let allocator = Arc::new(allocator);

    let mut workers = Vec::new();
    for worker in 0..4u64 {
        let allocator = allocator.clone();
        workers.push(std::thread::spawn(move || {
            for round in 0..50u64 {
                let size = 1024 * (1 + (worker + round) % 8);
                let handle = allocator
                    .allocate(size, 256, 0, MemoryCategory::Shared, false)
                    .unwrap();
                assert_eq!(handle.offset() % 256, 0);
                allocator.free(handle);
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    allocator.check_consistency();
    let allocator =
        Arc::try_unwrap(allocator).unwrap_or_else(|_| panic!("still shared"));
    allocator.un_init();
    assert_eq!(stats.lock().unwrap().live_bytes(), 0);
}
