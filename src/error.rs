use ash::vk;
use thiserror::Error;

/// Errors which can occur while sub-allocating device memory.
///
/// Invalid arguments (an out-of-range memory type index, a zero-sized
/// request) are programmer errors and panic instead of returning a
/// variant here.
#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error(
        "the device was unable to allocate {size_in_bytes} bytes of memory type {memory_type_index}"
    )]
    DeviceAllocationFailed {
        memory_type_index: u32,
        size_in_bytes: u64,
        #[source]
        source: vk::Result,
    },

    #[error(
        "memory type {memory_type_index} names heap {heap_index}, but the device only reports {heap_count} heaps"
    )]
    InvalidCapabilities {
        memory_type_index: u32,
        heap_index: u32,
        heap_count: usize,
    },
}
