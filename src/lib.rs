//! A general-purpose Vulkan device-memory sub-allocator, written from
//! scratch the hard way.
//!
//! Drivers grant a small number of large, expensive physical allocations
//! and cap how many can be live at once; renderers want many small,
//! precisely-aligned regions for buffers, images, and acceleration
//! structures. [`HeapAllocator`] bridges the two: it reserves pages per
//! memory type, binds their physical memory lazily on first use, carves
//! them into blocks with first-fit search and O(1) coalescing, and grows
//! each heap geometrically when demand outruns the pages it already has.
//!
//! The physical device is reached only through the [`MemoryProvider`]
//! trait. [`DeviceMemoryProvider`] implements it on top of a real
//! `ash::Device`; tests drive the allocator with an in-memory fake and
//! never touch a GPU.

mod allocator;
mod catalog;
mod error;
mod heap;
mod math;
mod provider;

pub use self::{
    allocator::{AllocationHandle, HeapAllocator},
    catalog::HeapCatalog,
    error::AllocatorError,
    heap::MemoryCategory,
    provider::{DeviceCapabilities, DeviceMemoryProvider, MemoryProvider},
};
