//! MMIO dispatch
//!
//! Devices register address ranges; the dispatcher routes non-RAM
//! physical accesses to the owning device by containment.

use std::sync::Arc;

use parking_lot::Mutex;

use ox_core::error::MemoryError;

/// Capability set every memory-mapped device implements.
///
/// Addresses handed to a device are absolute physical addresses, not
/// offsets; devices that care subtract their own base.
pub trait SystemDevice: Send {
    fn read(&mut self, addr: u64, out: &mut [u8]);
    fn write(&mut self, addr: u64, data: &[u8]);

    fn memset(&mut self, addr: u64, value: u8, len: u64) {
        let data = vec![value; len as usize];
        self.write(addr, &data);
    }

    /// PCI configuration space read; devices off the config bus ignore it
    fn config_read(&mut self, _addr: u64, out: &mut [u8]) {
        out.fill(0xFF);
    }

    /// PCI configuration space write
    fn config_write(&mut self, _addr: u64, _data: &[u8]) {}

    fn is_address_mapped(&self, _addr: u64) -> bool {
        true
    }
}

/// Registered device descriptor
#[derive(Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub start: u64,
    pub end: u64,
    pub soc_device: bool,
}

struct MmioRegion {
    info: DeviceInfo,
    device: Arc<Mutex<dyn SystemDevice>>,
}

/// What kind of access is being forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    MemSet,
}

/// Address-keyed router for non-RAM physical addresses.
///
/// Regions are kept sorted by start address and never overlap, so a
/// containment lookup is a binary search. The dispatcher holds no lock
/// across the forwarded call; each device serializes itself.
pub struct MmioDispatcher {
    regions: Vec<MmioRegion>,
}

impl MmioDispatcher {
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
        }
    }

    /// Register a device over `[info.start, info.end]`.
    pub fn register(
        &mut self,
        info: DeviceInfo,
        device: Arc<Mutex<dyn SystemDevice>>,
    ) -> Result<(), MemoryError> {
        if info.end < info.start {
            return Err(MemoryError::OverlappingRegion {
                start: info.start,
                end: info.end,
            });
        }
        let idx = self
            .regions
            .partition_point(|r| r.info.start < info.start);
        let overlaps_prev = idx > 0 && self.regions[idx - 1].info.end >= info.start;
        let overlaps_next = self
            .regions
            .get(idx)
            .is_some_and(|r| r.info.start <= info.end);
        if overlaps_prev || overlaps_next {
            return Err(MemoryError::OverlappingRegion {
                start: info.start,
                end: info.end,
            });
        }
        tracing::debug!(
            "MMIO: registered {} at 0x{:016x}-0x{:016x}",
            info.name,
            info.start,
            info.end
        );
        self.regions.insert(idx, MmioRegion { info, device });
        Ok(())
    }

    fn find(&self, addr: u64) -> Option<&MmioRegion> {
        let idx = self.regions.partition_point(|r| r.info.start <= addr);
        if idx == 0 {
            return None;
        }
        let region = &self.regions[idx - 1];
        (addr <= region.info.end).then_some(region)
    }

    /// Route an access to the owning device.
    ///
    /// `data` is the destination for reads and the source for writes;
    /// for `MemSet` its first byte is the fill value.
    pub fn access(
        &self,
        addr: u64,
        kind: AccessKind,
        data: &mut [u8],
        len: u64,
    ) -> Result<(), MemoryError> {
        let region = self
            .find(addr)
            .ok_or(MemoryError::UnmappedPhysical { addr })?;
        let device = Arc::clone(&region.device);
        let mut device = device.lock();
        match kind {
            AccessKind::Read => device.read(addr, data),
            AccessKind::Write => device.write(addr, data),
            AccessKind::MemSet => device.memset(addr, data[0], len),
        }
        Ok(())
    }

    /// True when some registered region contains `addr`
    pub fn is_mapped(&self, addr: u64) -> bool {
        self.find(addr).is_some()
    }

    /// Descriptor of the region containing `addr`, if any
    pub fn region_info(&self, addr: u64) -> Option<DeviceInfo> {
        self.find(addr).map(|r| r.info.clone())
    }
}

impl Default for MmioDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScratchDevice {
        base: u64,
        regs: [u8; 16],
    }

    impl SystemDevice for ScratchDevice {
        fn read(&mut self, addr: u64, out: &mut [u8]) {
            let off = (addr - self.base) as usize;
            out.copy_from_slice(&self.regs[off..off + out.len()]);
        }

        fn write(&mut self, addr: u64, data: &[u8]) {
            let off = (addr - self.base) as usize;
            self.regs[off..off + data.len()].copy_from_slice(data);
        }
    }

    fn scratch(base: u64) -> Arc<Mutex<dyn SystemDevice>> {
        Arc::new(Mutex::new(ScratchDevice {
            base,
            regs: [0; 16],
        }))
    }

    fn info(name: &str, start: u64, end: u64) -> DeviceInfo {
        DeviceInfo {
            name: name.into(),
            start,
            end,
            soc_device: false,
        }
    }

    #[test]
    fn test_dispatch_by_containment() {
        let mut mmio = MmioDispatcher::new();
        mmio.register(info("a", 0x1000, 0x100F), scratch(0x1000))
            .unwrap();
        mmio.register(info("b", 0x2000, 0x200F), scratch(0x2000))
            .unwrap();

        let mut data = [0xAA, 0xBB];
        mmio.access(0x2004, AccessKind::Write, &mut data, 2).unwrap();

        let mut out = [0u8; 2];
        mmio.access(0x2004, AccessKind::Read, &mut out, 2).unwrap();
        assert_eq!(out, [0xAA, 0xBB]);

        // Device "a" stays untouched
        mmio.access(0x1004, AccessKind::Read, &mut out, 2).unwrap();
        assert_eq!(out, [0, 0]);
    }

    #[test]
    fn test_unmapped_access() {
        let mmio = MmioDispatcher::new();
        let mut data = [0u8; 4];
        assert_eq!(
            mmio.access(0x5000, AccessKind::Read, &mut data, 4),
            Err(MemoryError::UnmappedPhysical { addr: 0x5000 })
        );
    }

    #[test]
    fn test_overlap_rejected() {
        let mut mmio = MmioDispatcher::new();
        mmio.register(info("a", 0x1000, 0x1FFF), scratch(0x1000))
            .unwrap();
        // Fully inside
        assert!(mmio
            .register(info("b", 0x1800, 0x18FF), scratch(0x1800))
            .is_err());
        // Straddling the end
        assert!(mmio
            .register(info("c", 0x1FFF, 0x2FFF), scratch(0x1FFF))
            .is_err());
        // Straddling the start
        assert!(mmio
            .register(info("d", 0x0800, 0x1000), scratch(0x0800))
            .is_err());
        // Adjacent is fine
        assert!(mmio
            .register(info("e", 0x2000, 0x2FFF), scratch(0x2000))
            .is_ok());
    }
}
