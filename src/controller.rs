//! NVMe controller lifecycle: register-level disable→enable handshake,
//! capability decoding, admin-queue bring-up, and `create_io_qpair`.
//!
//! The bring-up sequence is grounded in
//! `examples/original_source/example/upcie_nvme_driver.c` (the full
//! disable→wait→admin-queue-setup→configure→enable→wait flow) and
//! `examples/original_source/include/upcie/nvme_controller.h`
//! (`nvme_controller_open`'s PCI-scan/BAR-map/register-snapshot split from
//! NVMe-level `CC.EN` logic). `IdentifyController`'s field layout is
//! grounded in `examples/nexa-sys-nexa-os/modules/nvme/src/controller.rs`.

use crate::command::{identify_cns, Command, Completion, IoOp};
use crate::dma::DmaHeap;
use crate::error::{Error, Result};
use crate::mmio::MmioRegion;
use crate::pci::PciFunction;
use crate::queue::QueuePair;
use crate::regs::{self, Cap, Cc, Csts};
use crate::request;

const ADMIN_QID: u16 = 0;
const ADMIN_QUEUE_DEPTH: u16 = 256;
const SCRATCH_BYTES: usize = 4096;
/// 65,536 queue ids, one bit each.
const QID_BITMAP_WORDS: usize = 65_536 / 64;

/// Subset of the 4 KiB `IDENTIFY CONTROLLER` data structure this crate
/// decodes: serial number, model number, firmware revision, and the
/// maximum data transfer size exponent. Field layout and offsets follow
/// the NVMe Base Specification.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IdentifyController {
    pub vid: u16,
    pub ssvid: u16,
    pub sn: [u8; 20],
    pub mn: [u8; 40],
    pub fr: [u8; 8],
    pub rab: u8,
    pub ieee: [u8; 3],
    pub cmic: u8,
    pub mdts: u8,
}

impl IdentifyController {
    /// Reinterprets the first `size_of::<IdentifyController>()` bytes of a
    /// 4 KiB `IDENTIFY CONTROLLER` buffer.
    ///
    /// # Safety
    /// `buf` must point to at least `size_of::<IdentifyController>()`
    /// initialized bytes written by a completed `IDENTIFY` command.
    pub unsafe fn from_buffer(buf: *const u8) -> Self {
        std::ptr::read_unaligned(buf as *const IdentifyController)
    }

    pub fn serial_number(&self) -> String {
        String::from_utf8_lossy(&self.sn).trim().to_string()
    }

    pub fn model_number(&self) -> String {
        String::from_utf8_lossy(&self.mn).trim().to_string()
    }
}

/// A 65,536-bit queue-id allocation bitmap. Bit 0 (the admin queue) is set
/// from construction onward and never released.
struct QidBitmap(Vec<u64>);

impl QidBitmap {
    fn new() -> Self {
        let mut bitmap = vec![0u64; QID_BITMAP_WORDS];
        bitmap[0] |= 1;
        Self(bitmap)
    }

    fn alloc(&mut self) -> Result<u16> {
        for (word_idx, word) in self.0.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                *word |= 1 << bit;
                return Ok((word_idx * 64 + bit) as u16);
            }
        }
        Err(Error::out_of_resources("no free I/O queue id"))
    }

    fn release(&mut self, qid: u16) {
        let word = qid as usize / 64;
        let bit = qid as usize % 64;
        self.0[word] &= !(1 << bit);
    }

    fn is_set(&self, qid: u16) -> bool {
        let word = qid as usize / 64;
        let bit = qid as usize % 64;
        (self.0[word] >> bit) & 1 != 0
    }
}

/// A bring-up'd NVMe controller: PCI function, admin queue pair, scratch
/// buffer, and the I/O queue-id allocation bitmap.
pub struct NvmeController<'heap> {
    func: PciFunction,
    bar0: MmioRegion,
    heap: &'heap mut DmaHeap,
    cap: Cap,
    timeout_ms: u64,
    admin: QueuePair,
    scratch: *mut u8,
    qid_bitmap: QidBitmap,
}

unsafe impl Send for NvmeController<'_> {}

impl<'heap> NvmeController<'heap> {
    /// Opens `bdf`, maps BAR0, and runs the full bring-up sequence:
    /// disable, wait-not-ready, admin-queue setup, configure, enable,
    /// wait-ready. `heap` backs the admin queue's SQ/CQ memory and the
    /// scratch buffer for the lifetime of the controller.
    pub fn open(bdf: &str, heap: &'heap mut DmaHeap) -> Result<Self> {
        let mut func = PciFunction::open(bdf)?;
        func.bar_map(0)?;
        let bar0_mapping = func
            .bar(0)
            .and_then(|b| b.base())
            .ok_or_else(|| Error::invalid_argument("BAR0 not mapped"))?;
        let bar0_size = func.bar(0).map(|b| b.size()).unwrap_or(0x2000);
        let bar0 = unsafe { MmioRegion::new(bar0_mapping, bar0_size) };

        let cap = Cap::read(&bar0);
        let timeout_ms = cap.timeout_ms();

        log::info!("NvmeController::open({bdf}): CAP={:#018x} timeout_ms={timeout_ms}", cap.0);

        let scratch = heap.block_alloc(SCRATCH_BYTES)?;

        log::info!("disabling controller");
        regs::cc_disable(&bar0);
        regs::wait_until_not_ready(&bar0, timeout_ms)?;

        log::info!("setting up admin queue (depth={ADMIN_QUEUE_DEPTH})");
        let admin = match QueuePair::init(ADMIN_QID, ADMIN_QUEUE_DEPTH, &bar0, cap.dstrd(), heap) {
            Ok(qp) => qp,
            Err(e) => {
                heap.block_free(scratch);
                return Err(e);
            }
        };
        regs::aq_setup(&bar0, admin.sq_phys(), admin.cq_phys(), ADMIN_QUEUE_DEPTH);

        let cc = Cc::default()
            .set_css(0)
            .set_mps(0)
            .set_ams(0)
            .set_shn(0)
            .set_iosqes(6)
            .set_iocqes(4)
            .set_en(true);
        log::info!("enabling controller (CC={:#010x})", cc.0);
        cc.write(&bar0);
        regs::wait_until_ready(&bar0, timeout_ms)?;
        log::info!("controller enabled");

        let qid_bitmap = QidBitmap::new();

        Ok(Self {
            func,
            bar0,
            heap,
            cap,
            timeout_ms,
            admin,
            scratch,
            qid_bitmap,
        })
    }

    pub fn cap(&self) -> Cap {
        self.cap
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn csts(&self) -> Csts {
        Csts::read(&self.bar0)
    }

    /// Submits `IDENTIFY CONTROLLER` on the admin queue and decodes the
    /// result from the controller's scratch buffer.
    pub fn identify_controller(&mut self) -> Result<IdentifyController> {
        let prp1 = self.heap.virt_to_phys(self.scratch);
        let cmd = Command::identify(0, 0, identify_cns::CONTROLLER, prp1);
        self.admin.submit_sync(cmd, self.timeout_ms * 1000)?;
        Ok(unsafe { IdentifyController::from_buffer(self.scratch) })
    }

    /// Allocates a queue id, builds I/O SQ/CQ DMA memory, and issues
    /// `Create I/O Completion Queue` then `Create I/O Submission Queue` on
    /// the admin queue. On any failure after the id is taken, the id is
    /// released before the error propagates (spec.md §4.8, §7).
    pub fn create_io_qpair(&mut self, depth: u16) -> Result<QueuePair> {
        let qid = self.qid_bitmap.alloc()?;

        let result = self.create_io_qpair_inner(qid, depth);
        if result.is_err() {
            self.qid_bitmap.release(qid);
        }
        result
    }

    fn create_io_qpair_inner(&mut self, qid: u16, depth: u16) -> Result<QueuePair> {
        let mut qp = QueuePair::init(qid, depth, &self.bar0, self.cap.dstrd(), self.heap)?;

        let cq_cmd = Command::create_io_cq(0, qid, depth, qp.cq_phys());
        if let Err(e) = self.admin.submit_sync(cq_cmd, self.timeout_ms * 1000) {
            qp.term(self.heap);
            return Err(e);
        }

        let sq_cmd = Command::create_io_sq(0, qid, depth, qp.sq_phys(), qid);
        if let Err(e) = self.admin.submit_sync(sq_cmd, self.timeout_ms * 1000) {
            qp.term(self.heap);
            return Err(e);
        }

        Ok(qp)
    }

    /// Submits an NVM `Read` or `Write` against `io_qp` for a
    /// physically-contiguous buffer, constructing PRP1/PRP2 (and, for
    /// buffers spanning 3 or more pages, the issuing request's PRP-list
    /// page) from this controller's heap. `dbuf` must lie wholly within
    /// memory allocated from the same heap this controller was opened
    /// with. Out of scope per spec.md §1: this crate's minimal I/O path
    /// does not validate namespace bounds beyond what `IDENTIFY` yields.
    pub fn submit_io(
        &mut self,
        io_qp: &mut QueuePair,
        nsid: u32,
        op: IoOp,
        slba: u64,
        nlb: u16,
        dbuf: *mut u8,
        dbuf_nbytes: usize,
        timeout_us: u64,
    ) -> Result<Completion> {
        let heap: &DmaHeap = self.heap;
        io_qp.submit_data_sync(
            |req| {
                let mut cmd = match op {
                    IoOp::Read => Command::read(0, nsid, slba, nlb, 0, 0),
                    IoOp::Write => Command::write(0, nsid, slba, nlb, 0, 0),
                };
                request::prep_command_prps_contig(req, heap, dbuf, dbuf_nbytes, &mut cmd)?;
                Ok(cmd)
            },
            timeout_us,
        )
    }

    /// Submits an NVM `Flush` against `io_qp`.
    pub fn submit_flush(&mut self, io_qp: &mut QueuePair, nsid: u32, timeout_us: u64) -> Result<Completion> {
        io_qp.submit_sync(Command::flush(0, nsid), timeout_us)
    }

    /// Releases the controller's scratch buffer, admin queue DMA memory,
    /// and PCI function (BAR unmap) in reverse construction order.
    pub fn close(mut self) {
        self.admin.term(self.heap);
        self.heap.block_free(self.scratch);
        self.func.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qid_bitmap_reserves_bit_zero_from_construction() {
        let bitmap = QidBitmap::new();
        assert!(bitmap.is_set(0));
    }

    #[test]
    fn qid_bitmap_alloc_never_returns_bit_zero_or_duplicates() {
        let mut bitmap = QidBitmap::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10 {
            let qid = bitmap.alloc().unwrap();
            assert_ne!(qid, 0);
            assert!(seen.insert(qid), "qid {qid} allocated twice");
        }
    }

    #[test]
    fn qid_bitmap_release_makes_qid_available_again() {
        let mut bitmap = QidBitmap::new();
        let qid = bitmap.alloc().unwrap();
        bitmap.release(qid);
        assert!(!bitmap.is_set(qid));
        let reused = bitmap.alloc().unwrap();
        assert_eq!(reused, qid);
    }

    #[test]
    fn identify_controller_decode_reads_sn_mn_at_fixed_offsets() {
        let mut buf = [0u8; 4096];
        buf[4..24].copy_from_slice(b"SERIAL0123456789ABCD");
        buf[24..64].copy_from_slice(&[b'M'; 40]);
        let id = unsafe { IdentifyController::from_buffer(buf.as_ptr()) };
        assert_eq!(id.serial_number(), "SERIAL0123456789ABCD");
        assert_eq!(id.model_number(), "M".repeat(40));
    }
}
