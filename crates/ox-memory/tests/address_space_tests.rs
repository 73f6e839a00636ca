//! Physical address space validation

use std::sync::Arc;

use parking_lot::Mutex;

use ox_memory::{constants::*, AddressSpace, DeviceInfo, SystemDevice};

#[test]
fn test_ram_boundaries() {
    let space = AddressSpace::new(0x10_0000);

    space.write_be32(MAIN_RAM_BASE, 0xDEAD_BEEF);
    assert_eq!(space.read_be32(MAIN_RAM_BASE), 0xDEAD_BEEF);

    // Upper boundary of the backing store
    let top = 0x10_0000 - 4;
    space.write_be32(top, 0xCAFE_BABE);
    assert_eq!(space.read_be32(top), 0xCAFE_BABE);
}

#[test]
fn test_big_endian_round_trip_all_widths() {
    let space = AddressSpace::new(0x1000);
    space.write_u8(0x100, 0x7F);
    assert_eq!(space.read_u8(0x100), 0x7F);
    space.write_be16(0x102, 0xBEEF);
    assert_eq!(space.read_be16(0x102), 0xBEEF);
    space.write_be32(0x104, 0x0102_0304);
    assert_eq!(space.read_be32(0x104), 0x0102_0304);
    space.write_be64(0x108, 0x1122_3344_5566_7788);
    assert_eq!(space.read_be64(0x108), 0x1122_3344_5566_7788);
}

struct EchoDevice {
    last_write: u32,
}

impl SystemDevice for EchoDevice {
    fn read(&mut self, _addr: u64, out: &mut [u8]) {
        out.copy_from_slice(&self.last_write.to_be_bytes()[..out.len()]);
    }

    fn write(&mut self, _addr: u64, data: &[u8]) {
        let mut b = [0u8; 4];
        b[..data.len().min(4)].copy_from_slice(&data[..data.len().min(4)]);
        self.last_write = u32::from_be_bytes(b);
    }
}

#[test]
fn test_device_routing_above_ram() {
    let space = AddressSpace::new(0x1000);
    space
        .register_device(
            DeviceInfo {
                name: "echo".into(),
                start: PCI_BRIDGE_BASE,
                end: PCI_BRIDGE_BASE + PCI_BRIDGE_SIZE - 1,
                soc_device: false,
            },
            Arc::new(Mutex::new(EchoDevice { last_write: 0 })),
        )
        .unwrap();

    space.write_be32(PCI_BRIDGE_BASE + 0xC, 0x7CFF);
    assert_eq!(space.read_be32(PCI_BRIDGE_BASE + 0xC), 0x7CFF);
}

#[test]
fn test_device_write_does_not_touch_reservations_in_other_granules() {
    let space = AddressSpace::new(0x10000);
    space.reservations().reserve(0, 0x8000);
    // RAM store inside the granule invalidates
    space.write_be32(0x8040, 1);
    assert!(!space.reservations().has_reservation(0));
}

#[test]
fn test_nand_window_constant() {
    // The flash window bound is carried as-is from the hardware map
    assert_eq!(NAND_WINDOW_SIZE, 0x1FF_FFFF);
    assert!(NAND_BASE + NAND_WINDOW_SIZE < PCI_CONFIG_BASE);
}
