//! The seam between the sub-allocator and the device's physical memory.

use ash::vk;

use crate::{error::AllocatorError, heap::MemoryCategory};

/// A snapshot of everything the allocator needs to know about the
/// physical device's memory: heap capacities, the type-to-heap mapping,
/// and the driver limits that shape page sizing.
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    /// Byte capacity of each memory heap.
    pub heap_capacity: Vec<vk::DeviceSize>,

    /// For each memory type, the index of the heap it draws from.
    pub type_to_heap: Vec<u32>,

    /// The driver's cap on simultaneously live physical allocations.
    pub max_allocation_count: u32,

    /// The alignment granularity at which linear and non-linear resources
    /// may alias within one physical allocation
    /// (`bufferImageGranularity`). Every shared sub-allocation starts on a
    /// multiple of this.
    pub buffer_image_granularity: vk::DeviceSize,
}

impl DeviceCapabilities {
    /// Read the capabilities straight from a physical device.
    ///
    /// # Safety
    ///
    /// - `physical_device` must be a live handle owned by `instance`.
    pub unsafe fn from_physical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties =
            instance.get_physical_device_memory_properties(physical_device);
        let heap_capacity = memory_properties.memory_heaps
            [..memory_properties.memory_heap_count as usize]
            .iter()
            .map(|heap| heap.size)
            .collect();
        let type_to_heap = memory_properties.memory_types
            [..memory_properties.memory_type_count as usize]
            .iter()
            .map(|memory_type| memory_type.heap_index)
            .collect();
        Self {
            heap_capacity,
            type_to_heap,
            max_allocation_count: properties.limits.max_memory_allocation_count,
            buffer_image_granularity: properties.limits.buffer_image_granularity,
        }
    }
}

/// The raw operations the sub-allocator consumes. One physical allocation
/// returned by [`MemoryProvider::allocate`] backs one page.
pub trait MemoryProvider {
    /// Describe the device's heaps, memory types, and limits.
    fn query_capabilities(&self) -> DeviceCapabilities;

    /// Allocate one physical chunk of device memory.
    ///
    /// # Safety
    ///
    /// - the caller is responsible for freeing the returned memory when it
    ///   is no longer in use
    /// - `memory_type_index` is assumed to be valid for this device, the
    ///   arguments are not checked
    unsafe fn allocate(
        &mut self,
        memory_type_index: u32,
        size_in_bytes: vk::DeviceSize,
        category: MemoryCategory,
        dedicated: bool,
    ) -> Result<vk::DeviceMemory, AllocatorError>;

    /// Free a chunk previously returned by `allocate`.
    ///
    /// # Safety
    ///
    /// - the caller must ensure no GPU operation still refers to the
    ///   memory
    unsafe fn free(&mut self, memory: vk::DeviceMemory);
}

/// A provider which allocates and frees memory directly on the logical
/// device.
pub struct DeviceMemoryProvider {
    device: ash::Device,
    capabilities: DeviceCapabilities,
}

impl DeviceMemoryProvider {
    /// # Safety
    ///
    /// - `device` must be a logical device created from `physical_device`
    /// - the provider must be dropped before the device is destroyed
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
    ) -> Self {
        let capabilities =
            DeviceCapabilities::from_physical_device(instance, physical_device);
        Self {
            device,
            capabilities,
        }
    }
}

impl MemoryProvider for DeviceMemoryProvider {
    fn query_capabilities(&self) -> DeviceCapabilities {
        self.capabilities.clone()
    }

    unsafe fn allocate(
        &mut self,
        memory_type_index: u32,
        size_in_bytes: vk::DeviceSize,
        category: MemoryCategory,
        _dedicated: bool,
    ) -> Result<vk::DeviceMemory, AllocatorError> {
        // Device-address memory must be allocated with the matching flag,
        // which is the platform rule that keeps the category from sharing
        // pages with anything else.
        let flags_info = vk::MemoryAllocateFlagsInfo {
            flags: vk::MemoryAllocateFlags::DEVICE_ADDRESS,
            ..Default::default()
        };
        let allocate_info = vk::MemoryAllocateInfo {
            allocation_size: size_in_bytes,
            memory_type_index,
            p_next: if category == MemoryCategory::DeviceAddress {
                &flags_info as *const _ as *const std::ffi::c_void
            } else {
                std::ptr::null()
            },
            ..Default::default()
        };
        self.device
            .allocate_memory(&allocate_info, None)
            .map_err(|source| AllocatorError::DeviceAllocationFailed {
                memory_type_index,
                size_in_bytes,
                source,
            })
    }

    unsafe fn free(&mut self, memory: vk::DeviceMemory) {
        self.device.free_memory(memory, None);
    }
}
