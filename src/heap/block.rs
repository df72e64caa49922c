use ash::vk;

use super::slab::SlotIndex;

/// One contiguous sub-range of a page, either free or in use.
///
/// The blocks of a page tile it exactly: the first block starts at offset
/// zero, each block ends where its successor begins, and the last block
/// ends at the page size.
#[derive(Debug)]
pub(crate) struct Block {
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub is_free: bool,
    pub prev: Option<SlotIndex>,
    pub next: Option<SlotIndex>,
}
