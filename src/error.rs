//! Crate-wide error type.
//!
//! One `thiserror` enum covers every failure mode named across the core's
//! subsystems, so callers match on a single type regardless of which layer
//! (hugepage, heap, PCI, queue pair, controller) produced the error.

use thiserror::Error;

/// Result alias used throughout `hostnvme`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed BDF, a size that is not a hugepage multiple, an unknown
    /// `HOSTMEM_BACKEND` value, or a cid outside the request pool range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No free block in a `DmaHeap`, no free cid in a `RequestPool`, or an
    /// allocation failure building the per-hugepage physical LUT.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// No free I/O queue id remains in the controller's qid bitmap.
    #[error("out of resources: {0}")]
    OutOfResources(String),

    /// A syscall failed: `open`, `read`, `mmap`, `mlock`, `ftruncate`, and
    /// similar. Carries the underlying `io::Error` (and therefore errno).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `/proc/self/pagemap` reported the page as not present.
    #[error("physical page not present for {0:#x}")]
    NotPresent(u64),

    /// A polling operation (`wait_until_ready`, `wait_until_not_ready`,
    /// `reap_cpl`) did not observe the expected state within its budget.
    #[error("timed out after {0}")]
    Timeout(String),

    /// A completion carried a non-zero status code.
    #[error("NVMe command failed: sct={sct:#x} sc={sc:#x}")]
    NvmeStatus { sct: u8, sc: u8 },
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn out_of_memory(msg: impl Into<String>) -> Self {
        Error::OutOfMemory(msg.into())
    }

    pub fn out_of_resources(msg: impl Into<String>) -> Self {
        Error::OutOfResources(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }
}
