//! First-fit DMA heap allocator over a hugepage-backed region.
//!
//! A [`DmaHeap`] carves allocations out of one contiguous [`Hugepage`]
//! region. Its free list is threaded directly through the backing memory:
//! a [`BlockHeader`] sits immediately before every block, free or
//! allocated, so no side bookkeeping allocation is ever needed.
//!
//! `virt_to_phys` is O(1): the heap keeps one physical base per
//! hugepage-sized chunk of the region (`phys_lut`), resolved once at heap
//! construction, because each chunk may back a physically independent
//! hugepage even though the virtual mapping is one contiguous range.
//!
//! Known limitation, preserved from the source this crate is modeled on:
//! an allocation may be split across a hugepage boundary, in which case
//! `virt_to_phys` addresses within it are not physically contiguous
//! beyond the hugepage they happen to fall in. Callers needing stronger
//! contiguity must reject allocations wider than one hugepage themselves.

use std::mem::size_of;
use std::ptr;

use crate::config::HostMemConfig;
use crate::error::{Error, Result};
use crate::hugepage::{resolve_phys_base, Hugepage};

/// Header immediately preceding every block (free or allocated) in a
/// [`DmaHeap`]'s backing memory.
#[repr(C)]
struct BlockHeader {
    /// Total size of this block, header through the start of the next
    /// block (or heap end), in bytes.
    size: usize,
    free: bool,
    next: *mut BlockHeader,
}

/// A first-fit allocator over one hugepage-backed region.
pub struct DmaHeap {
    hugepage: Hugepage,
    /// Physical base address of each hugepage-sized chunk of the region.
    phys_lut: Vec<u64>,
    config: HostMemConfig,
    free_list: *mut BlockHeader,
}

unsafe impl Send for DmaHeap {}
unsafe impl Sync for DmaHeap {}

impl DmaHeap {
    /// Allocates a new hugepage-backed region of `size` bytes and
    /// initializes it as a single free block spanning the whole heap.
    pub fn new(size: usize, config: &HostMemConfig) -> Result<Self> {
        let hugepage = Hugepage::alloc(size, config)?;
        let num_chunks = size / config.hugepage_size;

        let mut phys_lut = Vec::with_capacity(num_chunks);
        phys_lut.push(hugepage.phys_base());
        for i in 1..num_chunks {
            let chunk_base = unsafe { hugepage.virt_base().add(i * config.hugepage_size) };
            phys_lut.push(resolve_phys_base(chunk_base)?);
        }

        let free_list = hugepage.virt_base() as *mut BlockHeader;
        unsafe {
            ptr::write(
                free_list,
                BlockHeader {
                    size,
                    free: true,
                    next: ptr::null_mut(),
                },
            );
        }

        Ok(Self {
            hugepage,
            phys_lut,
            config: config.clone(),
            free_list,
        })
    }

    fn base(&self) -> *mut u8 {
        self.hugepage.virt_base()
    }

    /// Allocates `size` bytes with the given byte `alignment`. The
    /// returned pointer is `base + alignment` within the winning block, so
    /// the header occupies `[base, base + alignment)`.
    pub fn block_alloc_aligned(&mut self, size: usize, alignment: usize) -> Result<*mut u8> {
        if size == 0 {
            return Err(Error::invalid_argument("allocation size must be non-zero"));
        }
        let required = size
            .checked_add(alignment)
            .ok_or_else(|| Error::invalid_argument("size + alignment overflows"))?;

        let mut prev: *mut BlockHeader = ptr::null_mut();
        let mut cur = self.free_list;
        while !cur.is_null() {
            let block = unsafe { &mut *cur };
            if block.free && block.size >= required {
                return Ok(unsafe { self.take_block(prev, cur, required, alignment) });
            }
            prev = cur;
            cur = block.next;
        }

        log::warn!("DmaHeap out of memory: requested {size} bytes aligned to {alignment}");
        Err(Error::out_of_memory(format!(
            "no free block large enough for {size} bytes aligned to {alignment}"
        )))
    }

    /// Equivalent to `block_alloc_aligned(size, config.page_size)`.
    pub fn block_alloc(&mut self, size: usize) -> Result<*mut u8> {
        let alignment = self.config.page_size;
        self.block_alloc_aligned(size, alignment)
    }

    /// Splices the free block at `cur` out of the list (splitting off a
    /// trailing remainder block when it is larger than a header), marks
    /// it busy, and returns its payload pointer.
    unsafe fn take_block(
        &mut self,
        prev: *mut BlockHeader,
        cur: *mut BlockHeader,
        required: usize,
        alignment: usize,
    ) -> *mut u8 {
        let block = &mut *cur;
        let remainder = block.size - required;
        let next_after = block.next;

        let new_head = if remainder > size_of::<BlockHeader>() {
            let split_ptr = (cur as *mut u8).add(required) as *mut BlockHeader;
            ptr::write(
                split_ptr,
                BlockHeader {
                    size: remainder,
                    free: true,
                    next: next_after,
                },
            );
            block.size = required;
            split_ptr
        } else {
            next_after
        };

        if prev.is_null() {
            self.free_list = new_head;
        } else {
            (*prev).next = new_head;
        }

        block.free = false;
        (cur as *mut u8).add(alignment)
    }

    /// Recovers the header at `ptr - alignment`, marks it free, reinserts
    /// it into the address-ordered free list, and merges it with any
    /// adjacent free neighbor in a single pass. Freeing a null pointer is
    /// a no-op.
    pub fn block_free_aligned(&mut self, ptr: *mut u8, alignment: usize) {
        if ptr.is_null() {
            return;
        }
        let header = unsafe { ptr.sub(alignment) as *mut BlockHeader };
        unsafe {
            (*header).free = true;
        }
        self.insert_and_merge(header);
    }

    /// Equivalent to `block_free_aligned(ptr, config.page_size)`.
    pub fn block_free(&mut self, ptr: *mut u8) {
        let alignment = self.config.page_size;
        self.block_free_aligned(ptr, alignment);
    }

    /// Inserts `header` into the free list in address order, then walks
    /// once coalescing any run of address-adjacent free blocks.
    unsafe fn insert_and_merge(&mut self, header: *mut BlockHeader) {
        let mut prev: *mut BlockHeader = ptr::null_mut();
        let mut cur = self.free_list;
        while !cur.is_null() && (cur as usize) < (header as usize) {
            prev = cur;
            cur = (*cur).next;
        }
        (*header).next = cur;
        if prev.is_null() {
            self.free_list = header;
        } else {
            (*prev).next = header;
        }

        let mut node = self.free_list;
        while !node.is_null() {
            let next = (*node).next;
            if !next.is_null() {
                let node_end = (node as usize) + (*node).size;
                if node_end == next as usize && (*next).free {
                    (*node).size += (*next).size;
                    (*node).next = (*next).next;
                    continue; // re-check the same node against its new next
                }
            }
            node = (*node).next;
        }
    }

    /// Translates a payload pointer returned by this heap into its
    /// physical DMA address: `phys_lut[chunk] + offset within chunk`.
    ///
    /// Valid as a single DMA address only when the allocation it was
    /// carved from lies wholly within one hugepage-sized chunk.
    pub fn virt_to_phys(&self, ptr: *const u8) -> u64 {
        let offset = ptr as usize - self.base() as usize;
        let chunk = offset / self.config.hugepage_size;
        let within = offset % self.config.hugepage_size;
        self.phys_lut[chunk] + within as u64
    }

    pub fn config(&self) -> &HostMemConfig {
        &self.config
    }

    /// Total free bytes across the free list (test/diagnostic use).
    pub fn free_bytes(&self) -> usize {
        let mut total = 0;
        let mut cur = self.free_list;
        unsafe {
            while !cur.is_null() {
                total += (*cur).size;
                cur = (*cur).next;
            }
        }
        total
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::HugepageBackend;
    use crate::hugepage::tests::test_region;

    fn test_config() -> HostMemConfig {
        HostMemConfig {
            page_size: 4096,
            hugepage_size: 2 * 1024 * 1024,
            backend: HugepageBackend::Memfd,
            hugetlb_path: "/mnt/huge".to_string(),
        }
    }

    /// Builds a heap directly over a synthetic (non-privileged) region,
    /// mirroring `DmaHeap::new` without going through `Hugepage::alloc`.
    /// Shared with other modules' tests (e.g. `request`'s PRP-construction
    /// tests) that need a real `DmaHeap` without root/hugepage reservations.
    pub(crate) fn test_heap(size: usize) -> DmaHeap {
        let config = test_config();
        let hugepage = test_region(size, 0x4000_0000);
        let free_list = hugepage.virt_base() as *mut BlockHeader;
        unsafe {
            ptr::write(
                free_list,
                BlockHeader {
                    size,
                    free: true,
                    next: ptr::null_mut(),
                },
            );
        }
        DmaHeap {
            hugepage,
            phys_lut: vec![0x4000_0000],
            config,
            free_list,
        }
    }

    #[test]
    fn alloc_zero_is_invalid_argument() {
        let mut heap = test_heap(4 * 1024 * 1024);
        assert!(matches!(
            heap.block_alloc(0).unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }

    #[test]
    fn alloc_larger_than_heap_is_out_of_memory() {
        let mut heap = test_heap(4 * 1024 * 1024);
        assert!(matches!(
            heap.block_alloc(4 * 1024 * 1024 + 1).unwrap_err(),
            Error::OutOfMemory(_)
        ));
    }

    #[test]
    fn ten_page_allocations_are_distinct_and_in_bounds() {
        let heap_size = 4 * 1024 * 1024;
        let mut heap = test_heap(heap_size);
        let mut ptrs = Vec::new();
        for _ in 0..10 {
            let p = heap.block_alloc(4096).unwrap();
            ptrs.push(p);
        }

        for w in ptrs.windows(2) {
            assert_ne!(w[0], w[1]);
        }
        for &p in &ptrs {
            assert_eq!((p as usize) % 4096, 0);
            let phys = heap.virt_to_phys(p);
            assert!(phys >= 0x4000_0000 && phys < 0x4000_0000 + heap_size as u64);
        }

        for &p in ptrs.iter().rev() {
            heap.block_free(p);
        }
        assert_eq!(heap.free_bytes(), heap_size);
        unsafe {
            assert!(!heap.free_list.is_null());
            assert!((*heap.free_list).next.is_null());
            assert_eq!((*heap.free_list).size, heap_size);
        }
    }

    #[test]
    fn virt_to_phys_matches_base_plus_offset() {
        let mut heap = test_heap(4 * 1024 * 1024);
        let base_phys = heap.virt_to_phys(heap.base());
        let p = heap.block_alloc(4096).unwrap();
        let offset = p as usize - heap.base() as usize;
        assert_eq!(heap.virt_to_phys(p) - base_phys, offset as u64);
    }
}
