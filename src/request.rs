//! Command-identifier lifecycle: a fixed-size pool of `(cid, user pointer)`
//! slots with a stack-based free list, plus optional per-request PRP-list
//! page provisioning.
//!
//! Grounded field-for-field and algorithm-for-algorithm in
//! `examples/original_source/include/upcie/nvme/nvme_request.h`
//! (`nvme_request_pool_init/_alloc/_free/_get`,
//! `nvme_request_prep_command_prps_contig`). The stack-based pool is
//! normative per spec.md §9's Open Questions: an earlier bitmap-based pool
//! in the source carried an `is_cid_in_use` check this one does not.

use crate::command::Command;
use crate::dma::DmaHeap;
use crate::error::{Error, Result};

/// Number of command identifiers a single pool can track.
pub const POOL_LEN: usize = 1024;

/// Per-cid tracking slot.
#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub cid: u16,
    /// Caller-opaque pointer, settable after [`RequestPool::alloc`] and
    /// readable again via [`RequestPool::get`] once the completion for
    /// this cid arrives.
    pub user: usize,
    /// Virtual address of this request's PRP-list page, if
    /// [`RequestPool::init_prps`] was called.
    pub prp: Option<*mut u8>,
    /// Physical address of `prp`.
    pub prp_phys: u64,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            cid: 0,
            user: 0,
            prp: None,
            prp_phys: 0,
        }
    }
}

/// A fixed-size pool of [`Request`] slots with LIFO cid allocation.
///
/// A cid is either "in the stack" (free) or "issued to the caller"
/// (allocated); the two states partition `0..POOL_LEN`. Freeing pushes the
/// cid back onto the stack, so the most recently freed cid is the next one
/// handed out — this keeps hot cids cache-resident and plays well with
/// completion-queue phase tracking (spec.md §4.6).
pub struct RequestPool {
    reqs: Vec<Request>,
    stack: Vec<u16>,
    top: usize,
}

impl RequestPool {
    /// Builds a pool with all `POOL_LEN` cids free, `reqs[i].cid == i`.
    pub fn new() -> Self {
        let mut reqs = vec![Request::default(); POOL_LEN];
        let mut stack = vec![0u16; POOL_LEN];
        for i in 0..POOL_LEN {
            reqs[i].cid = i as u16;
            stack[POOL_LEN - 1 - i] = i as u16;
        }
        Self {
            reqs,
            stack,
            top: POOL_LEN,
        }
    }

    /// Allocates one PRP-list page per request from `heap`, recording each
    /// slot's virtual and physical address. Called once per pool, before
    /// any in-flight allocation, per spec.md §4.6.
    pub fn init_prps(&mut self, heap: &mut DmaHeap) -> Result<()> {
        let page_size = heap.config().page_size;
        for i in 0..POOL_LEN {
            let ptr = heap.block_alloc(page_size)?;
            self.reqs[i].prp = Some(ptr);
            self.reqs[i].prp_phys = heap.virt_to_phys(ptr);
        }
        Ok(())
    }

    /// Pops a free cid off the stack. Returns [`Error::OutOfMemory`] if
    /// none remain.
    pub fn alloc(&mut self) -> Result<&mut Request> {
        if self.top == 0 {
            log::warn!("RequestPool out of memory: no free cid");
            return Err(Error::out_of_memory("no free command identifier"));
        }
        self.top -= 1;
        let cid = self.stack[self.top];
        self.reqs[cid as usize].user = 0;
        Ok(&mut self.reqs[cid as usize])
    }

    /// Pushes `cid` back onto the free stack. The debug-only assertion is
    /// the sole double-free backstop spec.md §9 describes; the stack-based
    /// pool does not diagnose double-free in release builds.
    pub fn free(&mut self, cid: u16) {
        debug_assert!(self.top < POOL_LEN, "RequestPool::free: double free of cid {cid}");
        self.stack[self.top] = cid;
        self.top += 1;
    }

    /// Retrieves the slot for `cid`, for use when a completion arrives.
    pub fn get(&self, cid: u16) -> &Request {
        &self.reqs[cid as usize]
    }

    /// Number of cids currently available for [`RequestPool::alloc`].
    pub fn free_count(&self) -> usize {
        self.top
    }
}

impl Default for RequestPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Fills `cmd.prp1`/`cmd.prp2` (and, for 3+ pages, `request`'s PRP-list
/// page) to describe a physically-contiguous `dbuf_nbytes`-byte buffer at
/// virtual address `dbuf`.
///
/// Chaining is not supported: a buffer spanning more than 513 pages (one
/// `PRP1` plus up to 512 list entries) is rejected with
/// [`Error::InvalidArgument`], mirroring the source's
/// `assert(npages <= 1 + 512)`.
pub fn prep_command_prps_contig(
    request: &Request,
    heap: &DmaHeap,
    dbuf: *mut u8,
    dbuf_nbytes: usize,
    cmd: &mut Command,
) -> Result<()> {
    let page_size = heap.config().page_size;
    let npages = dbuf_nbytes / page_size;
    if npages == 0 || npages > 1 + 512 {
        return Err(Error::invalid_argument(format!(
            "buffer of {npages} pages exceeds PRP1 + 512-entry PRP list (no chaining support)"
        )));
    }

    cmd.prp1 = heap.virt_to_phys(dbuf);

    if npages == 1 {
        return Ok(());
    }
    if npages == 2 {
        cmd.prp2 = heap.virt_to_phys(unsafe { dbuf.add(page_size) });
        return Ok(());
    }

    let prp_list_ptr = request
        .prp
        .ok_or_else(|| Error::invalid_argument("request has no PRP-list page provisioned"))?
        as *mut u64;
    cmd.prp2 = request.prp_phys;
    for i in 1..npages {
        let entry = cmd.prp1 + ((i as u64) << page_size.trailing_zeros());
        unsafe {
            std::ptr::write_volatile(prp_list_ptr.add(i - 1), entry);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifo_reuses_most_recently_freed_cid() {
        let mut pool = RequestPool::new();
        let a_cid = pool.alloc().unwrap().cid;
        pool.free(a_cid);
        let b_cid = pool.alloc().unwrap().cid;
        assert_eq!(a_cid, b_cid);
    }

    #[test]
    fn pool_exhausts_after_pool_len_allocations() {
        let mut pool = RequestPool::new();
        let mut cids = Vec::new();
        for _ in 0..POOL_LEN {
            cids.push(pool.alloc().unwrap().cid);
        }
        assert!(matches!(pool.alloc().unwrap_err(), Error::OutOfMemory(_)));

        pool.free(cids[0]);
        let reused = pool.alloc().unwrap().cid;
        assert_eq!(reused, cids[0]);
    }

    #[test]
    fn all_cids_distinct_on_initial_fill() {
        let mut pool = RequestPool::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..POOL_LEN {
            let cid = pool.alloc().unwrap().cid;
            assert!(seen.insert(cid), "cid {cid} allocated twice");
        }
    }

    /// PRP contiguous, 3 pages, 4 KiB page size: `prp1` is the buffer's own
    /// physical address, `prp2` points at the request's PRP-list page, and
    /// the list holds the buffer's 2nd and 3rd page physical addresses.
    #[test]
    fn prep_command_prps_contig_builds_prp_list_for_three_pages() {
        let mut heap = crate::dma::tests::test_heap(1024 * 1024);
        let page_size = heap.config().page_size;
        assert_eq!(page_size, 4096);

        let prp_list_page = heap.block_alloc(page_size).unwrap();
        let prp_list_phys = heap.virt_to_phys(prp_list_page);
        let request = Request {
            cid: 0,
            user: 0,
            prp: Some(prp_list_page),
            prp_phys: prp_list_phys,
        };

        let dbuf = heap.block_alloc(3 * page_size).unwrap();
        let dbuf_phys = heap.virt_to_phys(dbuf);

        let mut cmd = Command::new(0, 0);
        prep_command_prps_contig(&request, &heap, dbuf, 3 * page_size, &mut cmd).unwrap();

        assert_eq!(cmd.prp1, dbuf_phys);
        assert_eq!(cmd.prp2, prp_list_phys);

        let prp_list_ptr = prp_list_page as *const u64;
        let entry0 = unsafe { std::ptr::read_volatile(prp_list_ptr) };
        let entry1 = unsafe { std::ptr::read_volatile(prp_list_ptr.add(1)) };
        assert_eq!(entry0, dbuf_phys + page_size as u64);
        assert_eq!(entry1, dbuf_phys + 2 * page_size as u64);
    }
}
