//! Environment-derived configuration.
//!
//! Replaces the single mutable `g_hostmem_state` process-global the source
//! kept its hugepage size and backend selection in: every caller here
//! threads a `&HostMemConfig` through [`crate::hugepage`] and
//! [`crate::dma`] explicitly. [`HostMemConfig::default_once`] offers the
//! same convenience as the original global for callers (the example
//! binary) that don't want to carry a reference around, without making it
//! the only way to get a config.

use std::fs;
use std::sync::OnceLock;

use crate::error::{Error, Result};

/// Backend used to back hugepage-aligned DMA memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HugepageBackend {
    /// `memfd_create` with `MFD_HUGETLB`; path is `/proc/<pid>/fd/<fd>`.
    Memfd,
    /// A file under a hugetlbfs mount, named by a monotonic counter.
    Hugetlbfs,
}

impl HugepageBackend {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "memfd" => Ok(HugepageBackend::Memfd),
            "hugetlbfs" => Ok(HugepageBackend::Hugetlbfs),
            other => Err(Error::invalid_argument(format!(
                "unknown HOSTMEM_BACKEND {other:?}, expected \"memfd\" or \"hugetlbfs\""
            ))),
        }
    }
}

/// Resolved configuration for hugepage and DMA heap setup.
#[derive(Debug, Clone)]
pub struct HostMemConfig {
    /// Host base page size, from `sysconf(_SC_PAGESIZE)`.
    pub page_size: usize,
    /// Hugepage size in bytes, from `/proc/meminfo`'s `Hugepagesize:` line.
    /// Must be 2 MiB or 1 GiB.
    pub hugepage_size: usize,
    /// Backend selected by `HOSTMEM_BACKEND`.
    pub backend: HugepageBackend,
    /// Mount point for the hugetlbfs backend, from `HOSTMEM_HUGETLB_PATH`.
    pub hugetlb_path: String,
}

const SUPPORTED_HUGEPAGE_SIZES: [usize; 2] = [2 * 1024 * 1024, 1024 * 1024 * 1024];

impl HostMemConfig {
    /// Resolves configuration from the environment and `/proc`.
    pub fn from_env() -> Result<Self> {
        let page_size = host_page_size();
        let hugepage_size = hugepage_size_from_meminfo()?;
        if !SUPPORTED_HUGEPAGE_SIZES.contains(&hugepage_size) {
            return Err(Error::invalid_argument(format!(
                "unsupported hugepage size {hugepage_size} bytes (need 2 MiB or 1 GiB)"
            )));
        }

        let backend = match std::env::var("HOSTMEM_BACKEND") {
            Ok(v) => HugepageBackend::parse(&v)?,
            Err(_) => HugepageBackend::Memfd,
        };

        let hugetlb_path = std::env::var("HOSTMEM_HUGETLB_PATH")
            .unwrap_or_else(|_| "/mnt/huge".to_string());

        Ok(Self {
            page_size,
            hugepage_size,
            backend,
            hugetlb_path,
        })
    }

    /// Returns a process-wide default instance, resolved from the
    /// environment on first use and cached thereafter.
    pub fn default_once() -> &'static HostMemConfig {
        static DEFAULT: OnceLock<HostMemConfig> = OnceLock::new();
        DEFAULT.get_or_init(|| {
            HostMemConfig::from_env().unwrap_or_else(|e| {
                log::warn!("falling back to built-in defaults: {e}");
                HostMemConfig {
                    page_size: host_page_size(),
                    hugepage_size: 2 * 1024 * 1024,
                    backend: HugepageBackend::Memfd,
                    hugetlb_path: "/mnt/huge".to_string(),
                }
            })
        })
    }
}

fn host_page_size() -> usize {
    let rc = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if rc <= 0 {
        4096
    } else {
        rc as usize
    }
}

fn hugepage_size_from_meminfo() -> Result<usize> {
    let text = fs::read_to_string("/proc/meminfo")?;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("Hugepagesize:") {
            let kb: usize = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .map_err(|_| {
                    Error::invalid_argument(format!("unparseable Hugepagesize line: {line:?}"))
                })?;
            return Ok(kb * 1024);
        }
    }
    Err(Error::invalid_argument(
        "no Hugepagesize: line in /proc/meminfo",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_parse_rejects_unknown_values() {
        assert!(HugepageBackend::parse("memfd").is_ok());
        assert!(HugepageBackend::parse("hugetlbfs").is_ok());
        assert!(HugepageBackend::parse("vfio").is_err());
    }

    #[test]
    fn host_page_size_is_positive() {
        assert!(host_page_size() > 0);
    }
}
