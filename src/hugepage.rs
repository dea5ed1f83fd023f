//! Hugepage-backed DMA memory.
//!
//! A [`Hugepage`] is one physically-contiguous region, pinned and resolved
//! to a physical address via `/proc/self/pagemap`. [`DmaHeap`] (see
//! [`crate::dma`]) carves allocations out of one such region.
//!
//! Two backends, selected by [`crate::config::HugepageBackend`]:
//! - `memfd`: an anonymous `memfd_create(MFD_HUGETLB | MFD_HUGE_2MB/1GB)`
//!   file, addressable afterwards as `/proc/<pid>/fd/<fd>`.
//! - `hugetlbfs`: a numbered file under the configured mount point.
//!
//! Both backends follow the same sequence once a fd is in hand: truncate
//! to size, `mmap` shared read-write, `mlock`, touch every host page to
//! force population, zero-fill, then resolve the physical base through
//! pagemap. Resolving physical addresses requires `CAP_SYS_ADMIN`.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{HostMemConfig, HugepageBackend};
use crate::error::{Error, Result};

// memfd_create flags; not exposed by every libc version, so named locally.
const MFD_HUGETLB: libc::c_uint = 0x0004;
const MFD_HUGE_SHIFT: libc::c_uint = 26;
const MFD_HUGE_2MB: libc::c_uint = 21 << MFD_HUGE_SHIFT;
const MFD_HUGE_1GB: libc::c_uint = 30 << MFD_HUGE_SHIFT;

static HUGETLBFS_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A pinned, physically-resolved hugepage-backed mapping.
pub struct Hugepage {
    fd: RawFd,
    /// Kept alive so the fd closes when this descriptor drops.
    _file: Option<File>,
    base: *mut u8,
    size: usize,
    phys_base: u64,
    /// A stable path other processes can `import` to share this region.
    path: String,
    backend: HugepageBackend,
    /// Set for hugetlbfs allocations so `free` can unlink the backing file.
    unlink_path: Option<String>,
}

// The mapping addresses pinned DMA memory shared with a device; callers
// already serialize access per the crate's single-owner contract.
unsafe impl Send for Hugepage {}
unsafe impl Sync for Hugepage {}

impl Hugepage {
    /// Allocates a new hugepage-backed region of `size` bytes.
    ///
    /// `size` must be a positive multiple of `config.hugepage_size`.
    pub fn alloc(size: usize, config: &HostMemConfig) -> Result<Self> {
        if size == 0 || size % config.hugepage_size != 0 {
            return Err(Error::invalid_argument(format!(
                "size {size} is not a positive multiple of the hugepage size {}",
                config.hugepage_size
            )));
        }

        let huge_flag = match config.hugepage_size {
            sz if sz == 2 * 1024 * 1024 => MFD_HUGE_2MB,
            sz if sz == 1024 * 1024 * 1024 => MFD_HUGE_1GB,
            other => {
                return Err(Error::invalid_argument(format!(
                    "unsupported hugepage size {other}"
                )))
            }
        };

        match config.backend {
            HugepageBackend::Memfd => Self::alloc_memfd(size, huge_flag),
            HugepageBackend::Hugetlbfs => Self::alloc_hugetlbfs(size, config),
        }
    }

    fn alloc_memfd(size: usize, huge_flag: libc::c_uint) -> Result<Self> {
        let name = CString::new("hostnvme-dma").unwrap();
        let flags = MFD_HUGETLB | huge_flag;
        let fd = unsafe { libc::syscall(libc::SYS_memfd_create, name.as_ptr(), flags) };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let fd = fd as RawFd;

        let path = format!("/proc/{}/fd/{}", std::process::id(), fd);
        let result = Self::finish(fd, size, path.clone(), HugepageBackend::Memfd, None);
        if result.is_err() {
            unsafe {
                libc::close(fd);
            }
        }
        result
    }

    fn alloc_hugetlbfs(size: usize, config: &HostMemConfig) -> Result<Self> {
        let n = HUGETLBFS_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = format!("{}/{}", config.hugetlb_path.trim_end_matches('/'), n);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let fd = file.as_raw_fd();
        let result = Self::finish(
            fd,
            size,
            path.clone(),
            HugepageBackend::Hugetlbfs,
            Some(path.clone()),
        )
        .map(|mut h| {
            h._file = Some(file);
            h
        });
        result
    }

    /// Shared tail: truncate, map, pin, fault in, zero, resolve physical
    /// address. Used by both backends and by [`Hugepage::import`].
    fn finish(
        fd: RawFd,
        size: usize,
        path: String,
        backend: HugepageBackend,
        unlink_path: Option<String>,
    ) -> Result<Self> {
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let base = base as *mut u8;

        if unsafe { libc::mlock(base as *const libc::c_void, size) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::munmap(base as *mut libc::c_void, size);
            }
            return Err(Error::Io(err));
        }

        touch_and_zero(base, size);

        let phys_base = match resolve_phys_base(base) {
            Ok(p) => p,
            Err(e) => {
                unsafe {
                    libc::munlock(base as *const libc::c_void, size);
                    libc::munmap(base as *mut libc::c_void, size);
                }
                return Err(e);
            }
        };

        Ok(Self {
            fd,
            _file: None,
            base,
            size,
            phys_base,
            path,
            backend,
            unlink_path,
        })
    }

    /// Imports a hugepage region another process created, by path.
    ///
    /// Reads every host page after mapping to force the importing
    /// process's page tables to populate, then resolves the physical
    /// address from this process's own pagemap.
    pub fn import(path: &str) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let fd = file.as_raw_fd();
        let size = file.metadata()?.len() as usize;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let base = base as *mut u8;

        // Force population without disturbing existing content.
        let mut sum: u8 = 0;
        for i in (0..size).step_by(4096) {
            sum = sum.wrapping_add(unsafe { std::ptr::read_volatile(base.add(i)) });
        }
        std::hint::black_box(sum);

        let phys_base = match resolve_phys_base(base) {
            Ok(p) => p,
            Err(e) => {
                unsafe {
                    libc::munmap(base as *mut libc::c_void, size);
                }
                return Err(e);
            }
        };

        Ok(Self {
            fd,
            _file: Some(file),
            base,
            size,
            phys_base,
            path: path.to_string(),
            backend: HugepageBackend::Hugetlbfs,
            unlink_path: None,
        })
    }

    pub fn virt_base(&self) -> *mut u8 {
        self.base
    }

    pub fn phys_base(&self) -> u64 {
        self.phys_base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn backend(&self) -> HugepageBackend {
        self.backend
    }

    /// Unmaps, closes, and (for hugetlbfs) unlinks the backing file.
    pub fn free(mut self) -> Result<()> {
        unsafe {
            libc::munlock(self.base as *const libc::c_void, self.size);
            if libc::munmap(self.base as *mut libc::c_void, self.size) != 0 {
                return Err(Error::Io(io::Error::last_os_error()));
            }
        }
        match self._file.take() {
            Some(file) => drop(file),
            None => {
                if self.fd >= 0 {
                    unsafe {
                        libc::close(self.fd);
                    }
                }
            }
        }
        if let Some(path) = &self.unlink_path {
            let _ = std::fs::remove_file(path);
        }
        // The mapping and fd are already torn down above; skip `Drop` so
        // it doesn't double-unmap.
        std::mem::forget(self);
        Ok(())
    }
}

impl Drop for Hugepage {
    fn drop(&mut self) {
        unsafe {
            libc::munlock(self.base as *const libc::c_void, self.size);
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
        if self._file.is_none() {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

fn touch_and_zero(base: *mut u8, size: usize) {
    unsafe {
        std::ptr::write_bytes(base, 0, size);
    }
}

/// Reads `/proc/self/pagemap` to translate a virtual address to its
/// physical frame, then returns the physical base address.
///
/// Each pagemap entry is 8 bytes little-endian; bit 63 is "present", bits
/// 0..=54 are the physical frame number. Requires `CAP_SYS_ADMIN`.
pub(crate) fn resolve_phys_base(virt: *mut u8) -> Result<u64> {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
    let vaddr = virt as u64;
    let page_index = vaddr / page_size;
    let page_offset = vaddr % page_size;

    let mut file = File::open("/proc/self/pagemap")?;
    let mut entry = [0u8; 8];
    {
        use std::io::{Read, Seek, SeekFrom};
        file.seek(SeekFrom::Start(page_index * 8))?;
        file.read_exact(&mut entry)?;
    }
    let raw = u64::from_le_bytes(entry);
    let present = (raw >> 63) & 1;
    if present == 0 {
        return Err(Error::NotPresent(vaddr));
    }
    let pfn = raw & ((1u64 << 55) - 1);
    Ok(pfn * page_size + page_offset)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a `Hugepage` descriptor over a plain anonymous mapping with
    /// a synthetic physical base, bypassing `memfd_create`/pagemap, which
    /// require root and real hugepage reservations unavailable to tests.
    /// This is the one place test code diverges from the production path.
    pub(crate) fn test_region(size: usize, synthetic_phys_base: u64) -> Hugepage {
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(base, libc::MAP_FAILED, "anonymous mmap failed in test");
        unsafe { std::ptr::write_bytes(base as *mut u8, 0, size) };
        Hugepage {
            fd: -1,
            _file: None,
            base: base as *mut u8,
            size,
            phys_base: synthetic_phys_base,
            path: "test://synthetic".to_string(),
            backend: HugepageBackend::Memfd,
            unlink_path: None,
        }
    }

    #[test]
    fn test_region_reports_configured_fields() {
        let region = test_region(4096, 0x1000_0000);
        assert_eq!(region.size(), 4096);
        assert_eq!(region.phys_base(), 0x1000_0000);
        assert!(!region.virt_base().is_null());
    }

    #[test]
    fn alloc_rejects_non_multiple_size() {
        let config = HostMemConfig {
            page_size: 4096,
            hugepage_size: 2 * 1024 * 1024,
            backend: HugepageBackend::Memfd,
            hugetlb_path: "/mnt/huge".to_string(),
        };
        let err = Hugepage::alloc(4096, &config).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
