//! Xenon physical memory map constants

/// Main memory base address
pub const MAIN_RAM_BASE: u64 = 0x0000_0000;
/// Main memory size (512 MB on retail boards)
pub const MAIN_RAM_SIZE: u64 = 0x2000_0000;

/// NAND flash window base (backed by the SFCX controller)
pub const NAND_BASE: u64 = 0xC800_0000;
/// NAND flash window size
pub const NAND_WINDOW_SIZE: u64 = 0x1FF_FFFF;

/// PCI configuration space base
pub const PCI_CONFIG_BASE: u64 = 0xD000_0000;
/// PCI configuration space size
pub const PCI_CONFIG_SIZE: u64 = 0x100_0000;

/// PCI bridge register file base
pub const PCI_BRIDGE_BASE: u64 = 0xEA00_0000;
/// PCI bridge register file size
pub const PCI_BRIDGE_SIZE: u64 = 0x1_0000;

/// Per-thread interrupt controller register blocks
pub const IIC_BASE: u64 = 0x0200_0005_0000;
/// Stride between the per-thread IIC register blocks
pub const IIC_THREAD_STRIDE: u64 = 0x1000;
/// Total size of the IIC register window (six threads)
pub const IIC_SIZE: u64 = 0x6000;

/// Standard page size (4 KB)
pub const PAGE_SIZE: u64 = 0x1000;
/// Large page size (16 MB)
pub const LARGE_PAGE_SIZE: u64 = 0x100_0000;

/// Reservation granularity for lwarx/stwcx (128 bytes = cache line)
pub const RESERVATION_GRANULE: u64 = 128;

/// Number of hardware threads (3 cores x 2 threads)
pub const HW_THREAD_COUNT: usize = 6;
