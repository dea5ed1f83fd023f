//! `hostnvme` — a userspace NVMe driver core.
//!
//! Bypasses the kernel block stack entirely: BAR0 is mapped directly from
//! sysfs, DMA-capable memory comes from hugepages, and the NVMe
//! submission/completion-queue protocol — doorbell signalling, phase-tag
//! tracking, command-identifier lifecycle — is implemented in this crate.
//!
//! Module layout follows the dependency order of the subsystems it
//! implements, leaves first:
//!
//! - [`bits`] / [`mmio`] — bitfield and volatile MMIO primitives.
//! - [`error`] / [`config`] — the crate-wide error type and
//!   environment-derived configuration.
//! - [`hugepage`] / [`dma`] — hugepage acquisition and the first-fit DMA
//!   heap built over it.
//! - [`pci`] — PCIe function enumeration and BAR mapping via sysfs.
//! - [`regs`] / [`command`] / [`request`] / [`queue`] — the NVMe register
//!   layer, wire-format commands, command-identifier pool, and the
//!   submission/completion queue-pair engine.
//! - [`controller`] — controller lifecycle: bring-up, `IDENTIFY`, and I/O
//!   queue-pair creation.
//!
//! This crate polls for completions; it does not use interrupts, VFIO, or
//! IOMMU-backed translation, and it does not serialize access to a queue
//! pair shared across threads. See each module's documentation for the
//! invariants it upholds.

pub mod bits;
pub mod command;
pub mod config;
pub mod controller;
pub mod dma;
pub mod error;
pub mod hugepage;
pub mod mmio;
pub mod pci;
pub mod regs;
pub mod request;
pub mod queue;

pub use config::HostMemConfig;
pub use controller::{IdentifyController, NvmeController};
pub use dma::DmaHeap;
pub use error::{Error, Result};
pub use pci::{Bdf, PciFunction};
pub use queue::QueuePair;
