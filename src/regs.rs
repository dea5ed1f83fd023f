//! NVMe controller register layer: offsets, CAP/CC/CSTS bitfields, doorbell
//! address calculation, and the ready/not-ready wait helpers that bracket
//! every transition of CC.EN.
//!
//! Offsets and field layout follow the NVMe Base Specification, mirrored
//! from `examples/nexa-sys-nexa-os/modules/nvme/src/regs.rs`'s constant
//! names. The polling helpers here follow
//! `examples/original_source/include/upcie/nvme/nvme_controller.h`'s
//! `nvme_mmio_csts_wait_until_ready`/`_not_ready` (1 ms sleep between
//! polls, millisecond timeout budget).

use std::thread::sleep;
use std::time::{Duration, Instant};

use crate::bits;
use crate::error::{Error, Result};
use crate::mmio::MmioRegion;

pub const REG_CAP: u64 = 0x00;
pub const REG_VS: u64 = 0x08;
pub const REG_INTMS: u64 = 0x0C;
pub const REG_INTMC: u64 = 0x10;
pub const REG_CC: u64 = 0x14;
pub const REG_CSTS: u64 = 0x1C;
pub const REG_AQA: u64 = 0x24;
pub const REG_ASQ: u64 = 0x28;
pub const REG_ACQ: u64 = 0x30;

const DOORBELL_BASE: u64 = 0x1000;

/// Submission-queue tail doorbell offset for queue `qid`, given `CAP.DSTRD`.
pub fn sq_tdbl(qid: u16, dstrd: u8) -> u64 {
    DOORBELL_BASE + ((2 * qid as u64) << (2 + dstrd as u64))
}

/// Completion-queue head doorbell offset for queue `qid`, given `CAP.DSTRD`.
pub fn cq_hdbl(qid: u16, dstrd: u8) -> u64 {
    DOORBELL_BASE + ((2 * qid as u64 + 1) << (2 + dstrd as u64))
}

/// Typed view over the 64-bit `CAP` (Controller Capabilities) register.
#[derive(Debug, Clone, Copy)]
pub struct Cap(pub u64);

impl Cap {
    pub fn read(region: &MmioRegion) -> Self {
        Cap(region.read64(REG_CAP))
    }

    pub fn mqes(&self) -> u16 {
        bits::get(self.0, 0, 16) as u16
    }

    pub fn cqr(&self) -> bool {
        bits::get(self.0, 16, 1) != 0
    }

    pub fn ams(&self) -> u8 {
        bits::get(self.0, 17, 2) as u8
    }

    /// Timeout in 500 ms units. Converted to milliseconds by
    /// [`Cap::timeout_ms`]; spec.md §9 fixes milliseconds as the
    /// normative unit despite the source's inconsistent naming.
    pub fn to(&self) -> u8 {
        bits::get(self.0, 24, 8) as u8
    }

    pub fn timeout_ms(&self) -> u64 {
        self.to() as u64 * 500
    }

    pub fn dstrd(&self) -> u8 {
        bits::get(self.0, 32, 4) as u8
    }

    pub fn nssrs(&self) -> bool {
        bits::get(self.0, 36, 1) != 0
    }

    pub fn css(&self) -> u8 {
        bits::get(self.0, 37, 8) as u8
    }

    pub fn bps(&self) -> bool {
        bits::get(self.0, 45, 1) != 0
    }

    pub fn cps(&self) -> u8 {
        bits::get(self.0, 46, 2) as u8
    }

    pub fn mpsmin(&self) -> u8 {
        bits::get(self.0, 48, 4) as u8
    }

    pub fn mpsmax(&self) -> u8 {
        bits::get(self.0, 52, 4) as u8
    }

    pub fn pmrs(&self) -> bool {
        bits::get(self.0, 56, 1) != 0
    }

    pub fn cmbs(&self) -> bool {
        bits::get(self.0, 57, 1) != 0
    }

    pub fn nsss(&self) -> bool {
        bits::get(self.0, 58, 1) != 0
    }

    pub fn crms(&self) -> u8 {
        bits::get(self.0, 59, 2) as u8
    }

    pub fn nsses(&self) -> bool {
        bits::get(self.0, 61, 1) != 0
    }
}

/// Typed read-modify-write helper over the 32-bit `CC` (Controller
/// Configuration) register.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cc(pub u32);

impl Cc {
    pub fn read(region: &MmioRegion) -> Self {
        Cc(region.read32(REG_CC))
    }

    pub fn write(&self, region: &MmioRegion) {
        region.write32(REG_CC, self.0);
    }

    pub fn en(&self) -> bool {
        bits::get(self.0 as u64, 0, 1) != 0
    }

    pub fn set_en(mut self, en: bool) -> Self {
        self.0 = bits::set(self.0 as u64, 0, 1, en as u64) as u32;
        self
    }

    pub fn set_css(mut self, css: u8) -> Self {
        self.0 = bits::set(self.0 as u64, 4, 3, css as u64) as u32;
        self
    }

    pub fn set_mps(mut self, mps: u8) -> Self {
        self.0 = bits::set(self.0 as u64, 7, 4, mps as u64) as u32;
        self
    }

    pub fn set_ams(mut self, ams: u8) -> Self {
        self.0 = bits::set(self.0 as u64, 11, 3, ams as u64) as u32;
        self
    }

    pub fn set_shn(mut self, shn: u8) -> Self {
        self.0 = bits::set(self.0 as u64, 14, 2, shn as u64) as u32;
        self
    }

    pub fn iosqes(&self) -> u8 {
        bits::get(self.0 as u64, 16, 4) as u8
    }

    pub fn set_iosqes(mut self, iosqes: u8) -> Self {
        self.0 = bits::set(self.0 as u64, 16, 4, iosqes as u64) as u32;
        self
    }

    pub fn iocqes(&self) -> u8 {
        bits::get(self.0 as u64, 20, 4) as u8
    }

    pub fn set_iocqes(mut self, iocqes: u8) -> Self {
        self.0 = bits::set(self.0 as u64, 20, 4, iocqes as u64) as u32;
        self
    }

    pub fn set_crime(mut self, crime: bool) -> Self {
        self.0 = bits::set(self.0 as u64, 24, 1, crime as u64) as u32;
        self
    }
}

/// Typed view over the 32-bit `CSTS` (Controller Status) register.
#[derive(Debug, Clone, Copy)]
pub struct Csts(pub u32);

impl Csts {
    pub fn read(region: &MmioRegion) -> Self {
        Csts(region.read32(REG_CSTS))
    }

    pub fn rdy(&self) -> bool {
        bits::get(self.0 as u64, 0, 1) != 0
    }

    pub fn cfs(&self) -> bool {
        bits::get(self.0 as u64, 1, 1) != 0
    }
}

/// Sets `CC.EN = 1` via read-modify-write, preserving every other field.
pub fn cc_enable(region: &MmioRegion) {
    let cc = Cc::read(region).set_en(true);
    cc.write(region);
}

/// Clears `CC.EN` via read-modify-write, preserving every other field.
pub fn cc_disable(region: &MmioRegion) {
    let cc = Cc::read(region).set_en(false);
    cc.write(region);
}

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Polls `CSTS.RDY` until it reads 1, or until `timeout_ms` elapses.
pub fn wait_until_ready(region: &MmioRegion, timeout_ms: u64) -> Result<()> {
    log::debug!("wait_until_ready: polling CSTS.RDY (timeout_ms={timeout_ms})");
    poll_csts_rdy(region, timeout_ms, true)
}

/// Polls `CSTS.RDY` until it reads 0, or until `timeout_ms` elapses.
pub fn wait_until_not_ready(region: &MmioRegion, timeout_ms: u64) -> Result<()> {
    log::debug!("wait_until_not_ready: polling CSTS.RDY (timeout_ms={timeout_ms})");
    poll_csts_rdy(region, timeout_ms, false)
}

fn poll_csts_rdy(region: &MmioRegion, timeout_ms: u64, want: bool) -> Result<()> {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if Csts::read(region).rdy() == want {
            return Ok(());
        }
        if Instant::now() >= deadline {
            log::warn!("timed out waiting for CSTS.RDY == {want}");
            return Err(Error::timeout(format!(
                "CSTS.RDY did not reach {want} within {timeout_ms} ms"
            )));
        }
        sleep(POLL_INTERVAL);
    }
}

/// Writes `ASQ`, `ACQ`, then `AQA` for the admin queue. Must only be called
/// while `CC.EN == 0`.
pub fn aq_setup(region: &MmioRegion, asq_phys: u64, acq_phys: u64, entries: u16) {
    region.write64(REG_ASQ, asq_phys);
    region.write64(REG_ACQ, acq_phys);
    let aqa = (((entries - 1) as u32) << 16) | (entries - 1) as u32;
    region.write32(REG_AQA, aqa);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region_over(buf: &mut [u8]) -> MmioRegion {
        unsafe { MmioRegion::new(buf.as_mut_ptr(), buf.len()) }
    }

    #[test]
    fn cc_bitfield_encode_matches_spec_example() {
        let cc = Cc::default().set_iosqes(6).set_iocqes(4).set_en(true);
        assert_eq!(cc.0, 0x0046_0001);
        assert_eq!(cc.iosqes(), 6);
        assert_eq!(cc.iocqes(), 4);
        assert!(cc.en());
    }

    #[test]
    fn doorbell_addresses_scale_with_dstrd() {
        assert_eq!(sq_tdbl(0, 0), 0x1000);
        assert_eq!(cq_hdbl(0, 0), 0x1004);
        assert_eq!(sq_tdbl(1, 0), 0x1008);
        assert_eq!(sq_tdbl(1, 1), 0x1010);
    }

    #[test]
    fn wait_until_ready_times_out_immediately_when_budget_is_zero() {
        let mut buf = [0u8; 0x20];
        let region = region_over(&mut buf);
        assert!(matches!(
            wait_until_ready(&region, 0).unwrap_err(),
            Error::Timeout(_)
        ));
    }

    #[test]
    fn wait_until_ready_succeeds_once_rdy_bit_is_set() {
        let mut buf = [0u8; 0x20];
        let region = region_over(&mut buf);
        region.write32(REG_CSTS, 1);
        assert!(wait_until_ready(&region, 50).is_ok());
    }

    #[test]
    fn aq_setup_writes_asq_acq_aqa() {
        let mut buf = [0u8; 0x40];
        let region = region_over(&mut buf);
        aq_setup(&region, 0x1000, 0x2000, 256);
        assert_eq!(region.read64(REG_ASQ), 0x1000);
        assert_eq!(region.read64(REG_ACQ), 0x2000);
        assert_eq!(region.read32(REG_AQA), (255u32 << 16) | 255);
    }
}
