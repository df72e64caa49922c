//! One lazily-bound physical allocation, tiled by an ordered block list.
//!
//! A page reserves address space the moment it is created but does not
//! touch the device until the first allocation lands in it. The instant
//! every block is free again the physical allocation is released; the
//! page object itself survives so the owning heap can recycle or merge
//! it.

use ash::vk;

use crate::{
    error::AllocatorError,
    heap::{
        block::Block,
        slab::{Slab, SlotIndex},
        MemoryCategory,
    },
    math,
    provider::MemoryProvider,
};

#[derive(Debug)]
pub(crate) struct Page {
    pub memory: Option<vk::DeviceMemory>,
    pub size: vk::DeviceSize,
    pub memory_type_index: u32,
    pub category: MemoryCategory,
    pub exclusive: bool,

    blocks: Slab<Block>,
    head: Option<SlotIndex>,

    /// Sibling links within the owning heap's page list.
    pub prev: Option<SlotIndex>,
    pub next: Option<SlotIndex>,
}

impl Page {
    pub fn new(
        memory_type_index: u32,
        category: MemoryCategory,
        size: vk::DeviceSize,
        exclusive: bool,
    ) -> Self {
        debug_assert!(size > 0);
        Self {
            memory: None,
            size,
            memory_type_index,
            category,
            exclusive,
            blocks: Slab::new(),
            head: None,
            prev: None,
            next: None,
        }
    }

    /// True when no physical memory is bound to this page. An unbound
    /// page holds no device resources at all, only reserved bookkeeping.
    pub fn is_unbound(&self) -> bool {
        self.memory.is_none()
    }

    /// Allocate `size_to_fit` bytes starting at a multiple of
    /// `alignment`. Binds the physical allocation on first use.
    ///
    /// Returns `Ok(None)` when the page has no room; the heap then tries
    /// the next page or grows.
    pub fn alloc(
        &mut self,
        provider: &mut dyn MemoryProvider,
        size_to_fit: vk::DeviceSize,
        alignment: vk::DeviceSize,
    ) -> Result<Option<SlotIndex>, AllocatorError> {
        if size_to_fit > self.size {
            return Ok(None);
        }

        if self.memory.is_none() {
            debug_assert!(self.head.is_none());
            let memory = unsafe {
                provider.allocate(
                    self.memory_type_index,
                    self.size,
                    self.category,
                    self.exclusive,
                )?
            };
            log::debug!(
                "bound {} bytes of memory type {} ({:?}, exclusive: {})",
                self.size,
                self.memory_type_index,
                self.category,
                self.exclusive,
            );
            self.memory = Some(memory);

            let head = self.blocks.insert(Block {
                offset: 0,
                size: self.size,
                is_free: true,
                prev: None,
                next: None,
            });
            self.head = Some(head);

            // Offset zero satisfies any alignment.
            self.split(head, 0, size_to_fit);
            self.blocks.get_mut(head).is_free = false;
            self.check();
            return Ok(Some(head));
        }

        match self.find(size_to_fit, alignment) {
            Some((index, aligned_offset)) => {
                self.split(index, aligned_offset, size_to_fit);
                self.blocks.get_mut(index).is_free = false;
                self.check();
                Ok(Some(index))
            }
            None => Ok(None),
        }
    }

    /// Mark a block free, coalesce it with its free neighbors, and unbind
    /// the physical allocation once the page is a single spanning free
    /// block.
    pub fn free(&mut self, provider: &mut dyn MemoryProvider, index: SlotIndex) {
        {
            let block = self.blocks.get_mut(index);
            assert!(!block.is_free, "double free of a device memory block");
            block.is_free = true;
        }
        self.trim(index);
        self.check();

        let head = self.head.expect("a page with blocks has a head");
        let (head_is_free, head_next, head_size) = {
            let block = self.blocks.get(head);
            (block.is_free, block.next, block.size)
        };
        if head_is_free && head_next.is_none() {
            debug_assert_eq!(head_size, self.size);
            self.blocks.remove(head);
            self.head = None;
            let memory = self.memory.take().expect("the page was bound");
            log::debug!(
                "released {} bytes of memory type {} ({:?})",
                self.size,
                self.memory_type_index,
                self.category,
            );
            unsafe { provider.free(memory) };
        }
    }

    /// First-fit search: the first free block whose start, rounded up to
    /// `alignment`, still leaves room for `size_to_fit`. First-fit rather
    /// than best-fit keeps the scan O(1) on average while pages stay
    /// small.
    fn find(
        &self,
        size_to_fit: vk::DeviceSize,
        alignment: vk::DeviceSize,
    ) -> Option<(SlotIndex, vk::DeviceSize)> {
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let block = self.blocks.get(index);
            if block.is_free {
                let aligned_offset = math::round_up(block.offset, alignment);
                if aligned_offset + size_to_fit <= block.offset + block.size {
                    return Some((index, aligned_offset));
                }
            }
            cursor = block.next;
        }
        None
    }

    /// True if [`Page::alloc`] would succeed, without changing anything.
    pub fn has_space(
        &self,
        size_to_fit: vk::DeviceSize,
        alignment: vk::DeviceSize,
    ) -> bool {
        if size_to_fit > self.size {
            return false;
        }
        if self.memory.is_none() {
            true
        } else {
            self.find(size_to_fit, alignment).is_some()
        }
    }

    /// Carve a free block down to exactly
    /// `[aligned_offset, aligned_offset + size_to_fit)`.
    ///
    /// A leading gap forced by alignment becomes a new free block. The
    /// trailing remainder merges into the following free block when there
    /// is one, otherwise it becomes a new free block of its own.
    fn split(
        &mut self,
        index: SlotIndex,
        aligned_offset: vk::DeviceSize,
        size_to_fit: vk::DeviceSize,
    ) {
        let (start, size, prev, next) = {
            let block = self.blocks.get(index);
            debug_assert!(block.is_free);
            (block.offset, block.size, block.prev, block.next)
        };
        let end = start + size;
        debug_assert!(aligned_offset >= start);
        debug_assert!(aligned_offset + size_to_fit <= end);

        if aligned_offset > start {
            // Free neighbors are merged eagerly, so the block in front of
            // an alignment gap is never free.
            debug_assert!(prev.map_or(true, |p| !self.blocks.get(p).is_free));
            let gap = self.blocks.insert(Block {
                offset: start,
                size: aligned_offset - start,
                is_free: true,
                prev,
                next: Some(index),
            });
            match prev {
                Some(p) => self.blocks.get_mut(p).next = Some(gap),
                None => self.head = Some(gap),
            }
            let block = self.blocks.get_mut(index);
            block.prev = Some(gap);
            block.offset = aligned_offset;
            block.size = end - aligned_offset;
        }

        let remainder = (end - aligned_offset) - size_to_fit;
        if remainder > 0 {
            match next.filter(|&n| self.blocks.get(n).is_free) {
                Some(n) => {
                    let following = self.blocks.get_mut(n);
                    following.offset -= remainder;
                    following.size += remainder;
                }
                None => {
                    let tail = self.blocks.insert(Block {
                        offset: aligned_offset + size_to_fit,
                        size: remainder,
                        is_free: true,
                        prev: Some(index),
                        next,
                    });
                    if let Some(n) = next {
                        self.blocks.get_mut(n).prev = Some(tail);
                    }
                    self.blocks.get_mut(index).next = Some(tail);
                }
            }
        }

        self.blocks.get_mut(index).size = size_to_fit;
    }

    /// Merge a free block with its free neighbors, releasing the
    /// merged-away nodes.
    fn trim(&mut self, index: SlotIndex) {
        debug_assert!(self.blocks.get(index).is_free);

        while let Some(n) = self
            .blocks
            .get(index)
            .next
            .filter(|&n| self.blocks.get(n).is_free)
        {
            let removed = self.blocks.remove(n);
            let block = self.blocks.get_mut(index);
            block.size += removed.size;
            block.next = removed.next;
            if let Some(after) = removed.next {
                self.blocks.get_mut(after).prev = Some(index);
            }
        }

        while let Some(p) = self
            .blocks
            .get(index)
            .prev
            .filter(|&p| self.blocks.get(p).is_free)
        {
            let removed = self.blocks.remove(p);
            let block = self.blocks.get_mut(index);
            block.offset = removed.offset;
            block.size += removed.size;
            block.prev = removed.prev;
            if let Some(before) = removed.prev {
                self.blocks.get_mut(before).next = Some(index);
            }
        }

        if self.blocks.get(index).prev.is_none() {
            self.head = Some(index);
        }
    }

    /// Byte offset of a block, for building allocation handles.
    pub fn block_offset(&self, index: SlotIndex) -> vk::DeviceSize {
        self.blocks.get(index).offset
    }

    /// Brute-force structural check, debug builds only: blocks tile
    /// `[0, size)` with no gaps or overlap, and no two free blocks sit
    /// next to each other.
    pub fn check(&self) {
        if !cfg!(debug_assertions) {
            return;
        }
        if self.head.is_none() {
            assert!(self.memory.is_none());
            assert_eq!(self.blocks.occupied(), 0);
            return;
        }
        let mut expected_offset = 0;
        let mut previous_free = false;
        let mut cursor = self.head;
        let mut walked = 0;
        while let Some(index) = cursor {
            let block = self.blocks.get(index);
            assert_eq!(
                block.offset, expected_offset,
                "blocks must tile the page with no gaps"
            );
            assert!(
                !(previous_free && block.is_free),
                "adjacent free blocks survived a trim"
            );
            expected_offset += block.size;
            previous_free = block.is_free;
            cursor = block.next;
            walked += 1;
        }
        assert_eq!(
            expected_offset, self.size,
            "block sizes must sum to the page size"
        );
        assert_eq!(walked, self.blocks.occupied());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::testing::CountingProvider;

    fn page(size: u64) -> Page {
        Page::new(0, MemoryCategory::Shared, size, false)
    }

    #[test]
    fn binds_lazily_and_splits_the_remainder() {
        let mut provider = CountingProvider::new();
        let mut page = page(65536);
        assert!(page.is_unbound());

        let block = page
            .alloc(&mut provider, 4096, 256)
            .unwrap()
            .expect("the empty page fits the request");
        assert_eq!(page.block_offset(block), 0);
        assert!(!page.is_unbound());
        assert_eq!(provider.raw_sizes, vec![65536]);

        // The remainder is a free block immediately after.
        let second = page
            .alloc(&mut provider, 61440, 256)
            .unwrap()
            .expect("the remainder fits exactly");
        assert_eq!(page.block_offset(second), 4096);
        assert_eq!(provider.raw_sizes.len(), 1);

        assert!(!page.has_space(1, 1));
    }

    #[test]
    fn alignment_gap_is_carved_as_a_free_block() {
        let mut provider = CountingProvider::new();
        let mut page = page(65536);

        let a = page.alloc(&mut provider, 100, 1).unwrap().unwrap();
        let b = page.alloc(&mut provider, 50, 256).unwrap().unwrap();
        assert_eq!(page.block_offset(a), 0);
        assert_eq!(page.block_offset(b), 256);

        // The gap at [100, 256) is free and reusable by a small
        // unaligned request.
        let c = page.alloc(&mut provider, 100, 1).unwrap().unwrap();
        assert_eq!(page.block_offset(c), 100);

        page.free(&mut provider, a);
        page.free(&mut provider, b);
        page.free(&mut provider, c);
        assert!(page.is_unbound());
        assert_eq!(provider.free_count, 1);
    }

    #[test]
    fn trim_merges_in_both_directions() {
        let mut provider = CountingProvider::new();
        let mut page = page(3072);

        let a = page.alloc(&mut provider, 1024, 1).unwrap().unwrap();
        let b = page.alloc(&mut provider, 1024, 1).unwrap().unwrap();
        let c = page.alloc(&mut provider, 1024, 1).unwrap().unwrap();

        page.free(&mut provider, a);
        page.free(&mut provider, c);
        assert!(!page.is_unbound());
        assert_eq!(provider.free_count, 0);

        // Freeing the middle block bridges the two free spans and empties
        // the page in one step.
        page.free(&mut provider, b);
        assert!(page.is_unbound());
        assert_eq!(provider.free_count, 1);
    }

    #[test]
    fn freed_space_is_reused_at_the_same_offset() {
        let mut provider = CountingProvider::new();
        let mut page = page(65536);

        let a = page.alloc(&mut provider, 8192, 256).unwrap().unwrap();
        let b = page.alloc(&mut provider, 8192, 256).unwrap().unwrap();
        assert_eq!(page.block_offset(b), 8192);

        page.free(&mut provider, a);
        let again = page.alloc(&mut provider, 8192, 256).unwrap().unwrap();
        assert_eq!(page.block_offset(again), 0);
    }

    #[test]
    fn requests_larger_than_the_page_are_refused() {
        let mut provider = CountingProvider::new();
        let mut page = page(4096);
        assert!(page.alloc(&mut provider, 8192, 1).unwrap().is_none());
        assert!(page.is_unbound());
        assert!(provider.raw_sizes.is_empty());
    }

    #[test]
    fn bind_failure_leaves_the_page_unbound() {
        let mut provider = CountingProvider::new();
        provider.fail_next = true;
        let mut page = page(4096);
        assert!(page.alloc(&mut provider, 1024, 1).is_err());
        assert!(page.is_unbound());
        page.check();
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut provider = CountingProvider::new();
        let mut page = page(8192);
        let a = page.alloc(&mut provider, 1024, 1).unwrap().unwrap();
        let _b = page.alloc(&mut provider, 1024, 1).unwrap().unwrap();
        page.free(&mut provider, a);
        page.free(&mut provider, a);
    }
}
