//! The set of pages for one (memory type, category) pairing.
//!
//! Shared pages live on an ordered list that grows by geometric doubling;
//! exclusive pages live on a separate no-share list so ordinary requests
//! never match them. Pages whose physical memory has been released are
//! merged with their empty neighbors to keep the list compact over the
//! engine's lifetime.

use ash::vk;

use crate::{
    error::AllocatorError,
    heap::{
        page::Page,
        slab::{Slab, SlotIndex},
        MemoryCategory,
    },
    math,
    provider::MemoryProvider,
};

#[derive(Debug)]
pub(crate) struct MemoryHeap {
    memory_type_index: u32,
    category: MemoryCategory,
    min_page_bytes: vk::DeviceSize,
    granularity: vk::DeviceSize,

    pages: Slab<Page>,
    shared_head: Option<SlotIndex>,
    exclusive_head: Option<SlotIndex>,

    /// Size of the most recently grown page, the seed for doubling.
    last_page_bytes: vk::DeviceSize,

    /// Diagnostic sum of every page's reserved size, bound or not.
    total_page_bytes: vk::DeviceSize,
}

impl MemoryHeap {
    pub fn new(
        memory_type_index: u32,
        category: MemoryCategory,
        min_page_bytes: vk::DeviceSize,
        granularity: vk::DeviceSize,
    ) -> Self {
        Self {
            memory_type_index,
            category,
            min_page_bytes: min_page_bytes.max(1),
            granularity: granularity.max(1),
            pages: Slab::new(),
            shared_head: None,
            exclusive_head: None,
            last_page_bytes: 0,
            total_page_bytes: 0,
        }
    }

    /// Allocate from this heap's pages, growing when none has room.
    ///
    /// Returns the (page, block) route of the new allocation. Fails only
    /// when the provider itself cannot bind a page.
    pub fn alloc(
        &mut self,
        provider: &mut dyn MemoryProvider,
        size_in_bytes: vk::DeviceSize,
        alignment: vk::DeviceSize,
        exclusive: bool,
    ) -> Result<(SlotIndex, SlotIndex), AllocatorError> {
        if exclusive {
            return self.alloc_exclusive(provider, size_in_bytes);
        }

        // Shared sub-allocations start on a multiple of the platform
        // granularity and occupy a whole number of granularity units, so
        // buffers and images in one page never alias the same
        // interference unit.
        let alignment = math::lcm(alignment.max(1), self.granularity);
        let size_to_fit = math::round_up(size_in_bytes, self.granularity);

        let mut cursor = self.shared_head;
        while let Some(page_index) = cursor {
            if self.pages.get(page_index).has_space(size_to_fit, alignment) {
                return self.alloc_in_page(
                    provider, page_index, size_to_fit, alignment,
                );
            }
            cursor = self.pages.get(page_index).next;
        }

        let page_index = self.grow(size_to_fit);
        self.alloc_in_page(provider, page_index, size_to_fit, alignment)
    }

    fn alloc_in_page(
        &mut self,
        provider: &mut dyn MemoryProvider,
        page_index: SlotIndex,
        size_to_fit: vk::DeviceSize,
        alignment: vk::DeviceSize,
    ) -> Result<(SlotIndex, SlotIndex), AllocatorError> {
        if self.pages.get(page_index).is_unbound() {
            self.shrink_before_bind(page_index, size_to_fit);
        }
        let block_index = self
            .pages
            .get_mut(page_index)
            .alloc(provider, size_to_fit, alignment)?
            .expect("the page reported space for this request");
        self.check();
        Ok((page_index, block_index))
    }

    /// A no-share request gets a brand-new page of exactly the requested
    /// size, bound immediately and never offered to shared requests.
    /// Dedicated allocations start at offset zero, which satisfies any
    /// alignment.
    fn alloc_exclusive(
        &mut self,
        provider: &mut dyn MemoryProvider,
        size_in_bytes: vk::DeviceSize,
    ) -> Result<(SlotIndex, SlotIndex), AllocatorError> {
        let mut page = Page::new(
            self.memory_type_index,
            self.category,
            size_in_bytes,
            true,
        );
        page.next = self.exclusive_head;
        let page_index = self.pages.insert(page);
        if let Some(old_head) = self.exclusive_head {
            self.pages.get_mut(old_head).prev = Some(page_index);
        }
        self.exclusive_head = Some(page_index);
        self.total_page_bytes += size_in_bytes;

        match self
            .pages
            .get_mut(page_index)
            .alloc(provider, size_in_bytes, 1)
        {
            Ok(block) => {
                let block_index =
                    block.expect("a fresh dedicated page fits its request");
                log::debug!(
                    "dedicated page of {} bytes for memory type {} ({:?})",
                    size_in_bytes,
                    self.memory_type_index,
                    self.category,
                );
                self.check();
                Ok((page_index, block_index))
            }
            Err(error) => {
                // Unwind the page we just linked in so a failed bind
                // leaves the heap exactly as it was.
                self.unlink(page_index);
                self.pages.remove(page_index);
                self.total_page_bytes -= size_in_bytes;
                self.check();
                Err(error)
            }
        }
    }

    /// Free a block by its route. Exclusive pages are destroyed outright:
    /// one block, one page, one physical allocation, all gone together.
    pub fn free(
        &mut self,
        provider: &mut dyn MemoryProvider,
        page_index: SlotIndex,
        block_index: SlotIndex,
    ) {
        if self.pages.get(page_index).exclusive {
            self.pages.get_mut(page_index).free(provider, block_index);
            debug_assert!(self.pages.get(page_index).is_unbound());
            self.unlink(page_index);
            let page = self.pages.remove(page_index);
            self.total_page_bytes -= page.size;
            self.check();
            return;
        }

        self.pages.get_mut(page_index).free(provider, block_index);
        if self.pages.get(page_index).is_unbound() {
            self.trim_pages(page_index);
        }
        self.check();
    }

    /// Append pages of geometrically doubling size until one can hold the
    /// request. New pages stay unbound, so growth itself cannot fail.
    fn grow(&mut self, size_to_fit: vk::DeviceSize) -> SlotIndex {
        loop {
            let page_bytes = (math::prev_pow2_le(self.last_page_bytes.max(1))
                << 1)
                .max(self.min_page_bytes);
            let page_index = self.push_shared_page(page_bytes);
            self.last_page_bytes = page_bytes;
            self.total_page_bytes += page_bytes;
            log::debug!(
                "memory heap (type {}, {:?}) grew by a {} byte page",
                self.memory_type_index,
                self.category,
                page_bytes,
            );
            if page_bytes >= size_to_fit {
                return page_index;
            }
        }
    }

    /// Cut a still-unbound page down to the smallest power-of-two size,
    /// never below the heap minimum, that fits the request about to bind
    /// it. The cut-off tail joins the next empty page or becomes one, so
    /// a huge growth page does not reserve physical memory nobody asked
    /// for.
    fn shrink_before_bind(
        &mut self,
        page_index: SlotIndex,
        size_to_fit: vk::DeviceSize,
    ) {
        let (page_bytes, next) = {
            let page = self.pages.get(page_index);
            debug_assert!(page.is_unbound() && !page.exclusive);
            (page.size, page.next)
        };
        let target = math::next_pow2_ge(size_to_fit)
            .max(self.min_page_bytes)
            .min(page_bytes);
        let remainder = page_bytes - target;
        if remainder == 0 {
            return;
        }

        match next.filter(|&n| self.pages.get(n).is_unbound()) {
            Some(n) => self.pages.get_mut(n).size += remainder,
            None => {
                let mut tail_page = Page::new(
                    self.memory_type_index,
                    self.category,
                    remainder,
                    false,
                );
                tail_page.prev = Some(page_index);
                tail_page.next = next;
                let tail = self.pages.insert(tail_page);
                if let Some(n) = next {
                    self.pages.get_mut(n).prev = Some(tail);
                }
                self.pages.get_mut(page_index).next = Some(tail);
            }
        }
        self.pages.get_mut(page_index).size = target;
        log::trace!(
            "shrank an unbound page from {} to {} bytes before binding",
            page_bytes,
            target,
        );
    }

    /// Merge an unbound page with its unbound neighbors, summing the
    /// reserved sizes, so long-lived heaps do not fragment into slivers
    /// of empty pages.
    fn trim_pages(&mut self, page_index: SlotIndex) {
        debug_assert!(self.pages.get(page_index).is_unbound());

        while let Some(n) = self
            .pages
            .get(page_index)
            .next
            .filter(|&n| self.pages.get(n).is_unbound())
        {
            let removed = self.pages.remove(n);
            let page = self.pages.get_mut(page_index);
            page.size += removed.size;
            page.next = removed.next;
            if let Some(after) = removed.next {
                self.pages.get_mut(after).prev = Some(page_index);
            }
        }

        while let Some(p) = self
            .pages
            .get(page_index)
            .prev
            .filter(|&p| self.pages.get(p).is_unbound())
        {
            let removed = self.pages.remove(p);
            let page = self.pages.get_mut(page_index);
            page.size += removed.size;
            page.prev = removed.prev;
            if let Some(before) = removed.prev {
                self.pages.get_mut(before).next = Some(page_index);
            }
        }

        if self.pages.get(page_index).prev.is_none() {
            self.shared_head = Some(page_index);
        }
    }

    fn push_shared_page(&mut self, page_bytes: vk::DeviceSize) -> SlotIndex {
        let tail = self.shared_tail();
        let mut page = Page::new(
            self.memory_type_index,
            self.category,
            page_bytes,
            false,
        );
        page.prev = tail;
        let page_index = self.pages.insert(page);
        match tail {
            Some(t) => self.pages.get_mut(t).next = Some(page_index),
            None => self.shared_head = Some(page_index),
        }
        page_index
    }

    fn shared_tail(&self) -> Option<SlotIndex> {
        let mut cursor = self.shared_head?;
        loop {
            match self.pages.get(cursor).next {
                Some(next) => cursor = next,
                None => return Some(cursor),
            }
        }
    }

    /// Unlink a page from whichever list it is on.
    fn unlink(&mut self, page_index: SlotIndex) {
        let (prev, next, exclusive) = {
            let page = self.pages.get(page_index);
            (page.prev, page.next, page.exclusive)
        };
        match prev {
            Some(p) => self.pages.get_mut(p).next = next,
            None => {
                if exclusive {
                    self.exclusive_head = next;
                } else {
                    self.shared_head = next;
                }
            }
        }
        if let Some(n) = next {
            self.pages.get_mut(n).prev = prev;
        }
    }

    /// The physical handle and byte offset behind a block route.
    pub fn block_location(
        &self,
        page_index: SlotIndex,
        block_index: SlotIndex,
    ) -> (vk::DeviceMemory, vk::DeviceSize) {
        let page = self.pages.get(page_index);
        let memory = page.memory.expect("a page with live blocks is bound");
        (memory, page.block_offset(block_index))
    }

    /// True when any page still holds bound physical memory. Unbound
    /// pages are bookkeeping, not leaks.
    pub fn has_live_allocations(&self) -> bool {
        self.pages.iter().any(|(_, page)| !page.is_unbound())
    }

    /// Brute-force structural check, debug builds only: every page checks
    /// out and the page sizes sum to the recorded total.
    pub fn check(&self) {
        if !cfg!(debug_assertions) {
            return;
        }
        let mut sum = 0;
        let mut walked = 0;
        for head in [self.shared_head, self.exclusive_head].iter().copied() {
            let mut cursor = head;
            while let Some(index) = cursor {
                let page = self.pages.get(index);
                page.check();
                sum += page.size;
                cursor = page.next;
                walked += 1;
            }
        }
        assert_eq!(
            sum, self.total_page_bytes,
            "page sizes must sum to the heap total"
        );
        assert_eq!(walked, self.pages.occupied());
    }

    #[cfg(test)]
    fn shared_page_sizes(&self) -> Vec<vk::DeviceSize> {
        let mut sizes = Vec::new();
        let mut cursor = self.shared_head;
        while let Some(index) = cursor {
            let page = self.pages.get(index);
            sizes.push(page.size);
            cursor = page.next;
        }
        sizes
    }
}
