//! PCI host bridge fabric for oxidized-xenon
//!
//! Carries configuration-space addressing and the interrupt routing
//! path from devices into the IIC. Device bodies (SMC, SATA, USB,
//! SFCX, ...) register their own MMIO windows and call back into the
//! bridge to raise interrupts.

pub mod bridge;

pub use bridge::{ConfigAddress, PciBridge};
