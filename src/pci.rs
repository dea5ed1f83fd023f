//! PCIe function enumeration and BAR mapping via sysfs.
//!
//! No kernel driver involvement: everything here goes through
//! `/sys/bus/pci/devices/<bdf>/`, exactly as the userspace-driver model in
//! spec §1 requires.

use std::fs::{self, OpenOptions};
use std::os::unix::io::AsRawFd;

use crate::error::{Error, Result};

const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// A parsed, packed PCI Bus/Device/Function address.
///
/// Packed as `domain(16) << 16 | bus(8) << 8 | device(5) << 3 |
/// function(3)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bdf(u32);

impl Bdf {
    /// Parses the canonical `dddd:bb:dd.f` textual form.
    pub fn parse(text: &str) -> Result<Self> {
        let bad = || Error::invalid_argument(format!("malformed BDF {text:?}"));

        let (domain_bus_dev, function) = text.split_once('.').ok_or_else(bad)?;
        let mut parts = domain_bus_dev.split(':');
        let (domain, bus, device) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(d), Some(b), Some(dev), None) => (d, b, dev),
            _ => return Err(bad()),
        };

        let domain = u16::from_str_radix(domain, 16).map_err(|_| bad())?;
        let bus = u8::from_str_radix(bus, 16).map_err(|_| bad())?;
        let device = u8::from_str_radix(device, 16).map_err(|_| bad())?;
        let function = u8::from_str_radix(function, 16).map_err(|_| bad())?;
        if device > 0x1F || function > 0x7 {
            return Err(bad());
        }

        Ok(Self::pack(domain, bus, device, function))
    }

    pub fn pack(domain: u16, bus: u8, device: u8, function: u8) -> Self {
        let packed = ((domain as u32) << 16)
            | ((bus as u32) << 8)
            | ((device as u32) << 3)
            | (function as u32);
        Bdf(packed)
    }

    pub fn domain(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn bus(&self) -> u8 {
        ((self.0 >> 8) & 0xFF) as u8
    }

    pub fn device(&self) -> u8 {
        ((self.0 >> 3) & 0x1F) as u8
    }

    pub fn function(&self) -> u8 {
        (self.0 & 0x7) as u8
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Renders the canonical lowercase `dddd:bb:dd.f` form.
    pub fn to_text(&self) -> String {
        format!(
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain(),
            self.bus(),
            self.device(),
            self.function()
        )
    }

    fn sysfs_dir(&self) -> String {
        format!("{SYSFS_PCI_DEVICES}/{}", self.to_text())
    }
}

impl std::fmt::Display for Bdf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_text())
    }
}

/// One mapped BAR (Base Address Register) resource.
pub struct BarMapping {
    pub bar_id: u8,
    base: Option<*mut u8>,
    size: usize,
}

unsafe impl Send for BarMapping {}
unsafe impl Sync for BarMapping {}

impl BarMapping {
    fn unmapped(bar_id: u8) -> Self {
        Self {
            bar_id,
            base: None,
            size: 0,
        }
    }

    pub fn base(&self) -> Option<*mut u8> {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_mapped(&self) -> bool {
        self.base.is_some()
    }

    fn unmap(&mut self) {
        if let Some(base) = self.base.take() {
            unsafe {
                libc::munmap(base as *mut libc::c_void, self.size);
            }
            self.size = 0;
        }
    }
}

impl Drop for BarMapping {
    fn drop(&mut self) {
        self.unmap();
    }
}

/// An opened PCIe function with up to six BAR mappings.
pub struct PciFunction {
    bdf: Bdf,
    pub vendor: u16,
    pub device_id: u16,
    pub class: u32,
    bars: [BarMapping; 6],
}

impl PciFunction {
    /// Opens a PCI function by BDF string, reading vendor/device/class
    /// from sysfs. BARs are not mapped until [`PciFunction::bar_map`] is
    /// called.
    pub fn open(bdf_text: &str) -> Result<Self> {
        let bdf = Bdf::parse(bdf_text)?;
        let dir = bdf.sysfs_dir();

        let vendor = read_hex_field(&format!("{dir}/vendor"))? as u16;
        let device_id = read_hex_field(&format!("{dir}/device"))? as u16;
        let class = read_hex_field(&format!("{dir}/class"))?;

        Ok(Self {
            bdf,
            vendor,
            device_id,
            class,
            bars: std::array::from_fn(|i| BarMapping::unmapped(i as u8)),
        })
    }

    pub fn bdf(&self) -> Bdf {
        self.bdf
    }

    /// Opens `resource<id>` read-write, stats it for size, and maps it
    /// shared into the process. Missing resources surface as the
    /// underlying filesystem error; absence of a BAR is not fatal at the
    /// function level — callers decide whether it matters.
    pub fn bar_map(&mut self, id: u8) -> Result<()> {
        if id as usize >= self.bars.len() {
            return Err(Error::invalid_argument(format!("invalid BAR id {id}")));
        }
        let path = format!("{}/resource{id}", self.bdf.sysfs_dir());
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len() as usize;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        self.bars[id as usize] = BarMapping {
            bar_id: id,
            base: Some(base as *mut u8),
            size,
        };
        Ok(())
    }

    pub fn bar(&self, id: u8) -> Option<&BarMapping> {
        self.bars.get(id as usize)
    }

    /// Unmaps every mapped BAR. Called automatically on drop; exposed so
    /// callers can release BARs deterministically before closing other
    /// controller state.
    pub fn close(&mut self) {
        for bar in &mut self.bars {
            bar.unmap();
        }
    }
}

impl Drop for PciFunction {
    fn drop(&mut self) {
        self.close();
    }
}

/// Disposition a [`scan`] callback returns for each discovered function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanAction {
    /// Take ownership: the function is returned to the caller as opened.
    Claim,
    /// Leave the function alone.
    Release,
}

/// Iterates `/sys/bus/pci/devices`, calling `callback` with each
/// discovered BDF's vendor/device/class. Functions the callback claims
/// are opened and returned.
pub fn scan<F>(mut callback: F) -> Result<Vec<PciFunction>>
where
    F: FnMut(Bdf, u16, u16, u32) -> ScanAction,
{
    let mut claimed = Vec::new();
    for entry in fs::read_dir(SYSFS_PCI_DEVICES)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(n) => n,
            None => continue,
        };
        let bdf = match Bdf::parse(name) {
            Ok(b) => b,
            Err(_) => continue,
        };
        let dir = bdf.sysfs_dir();
        let vendor = match read_hex_field(&format!("{dir}/vendor")) {
            Ok(v) => v as u16,
            Err(_) => continue,
        };
        let device_id = match read_hex_field(&format!("{dir}/device")) {
            Ok(v) => v as u16,
            Err(_) => continue,
        };
        let class = read_hex_field(&format!("{dir}/class")).unwrap_or(0);

        if callback(bdf, vendor, device_id, class) == ScanAction::Claim {
            claimed.push(PciFunction::open(&bdf.to_text())?);
        }
    }
    Ok(claimed)
}

fn read_hex_field(path: &str) -> Result<u32> {
    let text = fs::read_to_string(path)?;
    let text = text.trim();
    let text = text.strip_prefix("0x").unwrap_or(text);
    u32::from_str_radix(text, 16)
        .map_err(|_| Error::invalid_argument(format!("unparseable sysfs field {path:?}: {text:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bdf_parse_matches_spec_example() {
        let bdf = Bdf::parse("0000:05:00.0").unwrap();
        assert_eq!(bdf.raw(), 0x0000_0500);
        assert_eq!(bdf.domain(), 0);
        assert_eq!(bdf.bus(), 0x05);
        assert_eq!(bdf.device(), 0);
        assert_eq!(bdf.function(), 0);
    }

    #[test]
    fn bdf_round_trips_through_text() {
        for text in ["0000:05:00.0", "0001:ff:1f.7", "abcd:00:00.0"] {
            let bdf = Bdf::parse(text).unwrap();
            assert_eq!(bdf.to_text(), text);
        }
    }

    #[test]
    fn bdf_rejects_malformed_input() {
        assert!(Bdf::parse("not-a-bdf").is_err());
        assert!(Bdf::parse("0000:05:20.0").is_err()); // device > 0x1F
        assert!(Bdf::parse("0000:05:00.8").is_err()); // function > 7
    }
}
