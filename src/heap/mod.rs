//! The sub-allocating core: blocks, pages, and per-(type, category)
//! memory heaps.

mod block;
mod memory_heap;
mod page;
mod slab;

pub(crate) use self::{memory_heap::MemoryHeap, slab::SlotIndex};

/// Classification of memory usage which cannot share a physical
/// allocation with other classes due to platform rules.
///
/// Nothing below the heap level cares about the category: it selects
/// which page bucket a request routes to, and tells the provider which
/// allocate flags to chain for [`MemoryCategory::DeviceAddress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryCategory {
    /// General buffers and images, free to share pages with each other.
    Shared,

    /// Acceleration-structure backing memory.
    AccelerationStructure,

    /// Memory addressed through buffer device addresses.
    DeviceAddress,
}

impl MemoryCategory {
    pub(crate) const COUNT: usize = 3;

    pub(crate) const ALL: [MemoryCategory; MemoryCategory::COUNT] = [
        MemoryCategory::Shared,
        MemoryCategory::AccelerationStructure,
        MemoryCategory::DeviceAddress,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            MemoryCategory::Shared => 0,
            MemoryCategory::AccelerationStructure => 1,
            MemoryCategory::DeviceAddress => 2,
        }
    }
}
