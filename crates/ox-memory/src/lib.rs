//! Physical memory hierarchy for oxidized-xenon
//!
//! Combines the RAM backing store, the MMIO dispatcher and the global
//! reservation table behind one facade the CPU crate performs all real
//! address accesses through.

pub mod constants;
pub mod mmio;
pub mod ram;
pub mod reservation;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use ox_core::error::MemoryError;

pub use mmio::{AccessKind, DeviceInfo, MmioDispatcher, SystemDevice};
pub use ram::Ram;
pub use reservation::ReservationTable;

/// The full physical address space: RAM below, devices above.
///
/// Every guest-visible store funnels through here so the reservation
/// table sees it, whatever its origin (PPU, DMA, device worker).
pub struct AddressSpace {
    ram: Ram,
    mmio: RwLock<MmioDispatcher>,
    reservations: ReservationTable,
    unmapped_accesses: AtomicU64,
}

impl AddressSpace {
    pub fn new(ram_size: u64) -> Arc<Self> {
        Arc::new(Self {
            ram: Ram::new(ram_size),
            mmio: RwLock::new(MmioDispatcher::new()),
            reservations: ReservationTable::new(),
            unmapped_accesses: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn ram(&self) -> &Ram {
        &self.ram
    }

    #[inline]
    pub fn reservations(&self) -> &ReservationTable {
        &self.reservations
    }

    #[inline]
    pub fn is_ram(&self, addr: u64) -> bool {
        addr < self.ram.size()
    }

    /// Register an MMIO device region
    pub fn register_device(
        &self,
        info: DeviceInfo,
        device: Arc<parking_lot::Mutex<dyn SystemDevice>>,
    ) -> Result<(), MemoryError> {
        self.mmio.write().register(info, device)
    }

    /// How many unmapped physical accesses have been swallowed
    pub fn unmapped_access_count(&self) -> u64 {
        self.unmapped_accesses.load(Ordering::Relaxed)
    }

    fn note_unmapped(&self, addr: u64, kind: AccessKind) {
        self.unmapped_accesses.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            "unmapped physical {:?} at 0x{:016x}",
            kind,
            addr
        );
    }

    /// Read physical memory. Unmapped addresses read as all-ones.
    pub fn read(&self, addr: u64, out: &mut [u8]) {
        if self.is_ram(addr) {
            if self.ram.read(addr, out).is_ok() {
                return;
            }
        } else if self
            .mmio
            .read()
            .access(addr, AccessKind::Read, out, out.len() as u64)
            .is_ok()
        {
            return;
        }
        self.note_unmapped(addr, AccessKind::Read);
        out.fill(0xFF);
    }

    /// Write physical memory and invalidate overlapping reservations.
    /// Unmapped addresses swallow the write.
    pub fn write(&self, addr: u64, data: &[u8]) {
        if self.is_ram(addr) {
            if self.ram.write(addr, data).is_ok() {
                self.reservations.invalidate_range(addr, data.len() as u64);
                return;
            }
        } else {
            let mut buf = data.to_vec();
            if self
                .mmio
                .read()
                .access(addr, AccessKind::Write, &mut buf, data.len() as u64)
                .is_ok()
            {
                return;
            }
        }
        self.note_unmapped(addr, AccessKind::Write);
    }

    /// Fill physical memory (dcbz, DMA clears)
    pub fn memset(&self, addr: u64, value: u8, len: u64) {
        if self.is_ram(addr) {
            if self.ram.memset(addr, value, len).is_ok() {
                self.reservations.invalidate_range(addr, len);
                return;
            }
        } else {
            let mut fill = [value];
            if self
                .mmio
                .read()
                .access(addr, AccessKind::MemSet, &mut fill, len)
                .is_ok()
            {
                return;
            }
        }
        self.note_unmapped(addr, AccessKind::MemSet);
    }

    pub fn read_u8(&self, addr: u64) -> u8 {
        let mut b = [0u8; 1];
        self.read(addr, &mut b);
        b[0]
    }

    pub fn read_be16(&self, addr: u64) -> u16 {
        let mut b = [0u8; 2];
        self.read(addr, &mut b);
        u16::from_be_bytes(b)
    }

    pub fn read_be32(&self, addr: u64) -> u32 {
        let mut b = [0u8; 4];
        self.read(addr, &mut b);
        u32::from_be_bytes(b)
    }

    pub fn read_be64(&self, addr: u64) -> u64 {
        let mut b = [0u8; 8];
        self.read(addr, &mut b);
        u64::from_be_bytes(b)
    }

    pub fn write_u8(&self, addr: u64, value: u8) {
        self.write(addr, &[value]);
    }

    pub fn write_be16(&self, addr: u64, value: u16) {
        self.write(addr, &value.to_be_bytes());
    }

    pub fn write_be32(&self, addr: u64, value: u32) {
        self.write(addr, &value.to_be_bytes());
    }

    pub fn write_be64(&self, addr: u64, value: u64) {
        self.write(addr, &value.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmapped_reads_all_ones() {
        let space = AddressSpace::new(0x1000);
        assert_eq!(space.read_be32(0xEA00_0000), 0xFFFF_FFFF);
        assert_eq!(space.unmapped_access_count(), 1);
        // Writes are swallowed
        space.write_be32(0xEA00_0000, 0x1234_5678);
        assert_eq!(space.unmapped_access_count(), 2);
    }

    #[test]
    fn test_store_invalidates_reservation() {
        let space = AddressSpace::new(0x10000);
        space.reservations().reserve(3, 0x2000);
        space.write_be32(0x2010, 0xABCD_EF01);
        assert!(!space.reservations().has_reservation(3));
    }
}
