//! PCI bridge: configuration space addressing and interrupt routing
//!
//! The bridge owns the per-priority routing registers the guest
//! programs and forwards device interrupts into the IIC accordingly.
//! Device bodies live behind their own MMIO registrations; the bridge
//! only carries the fabric.

use std::sync::Arc;

use parking_lot::Mutex;

use ox_cpu::iic::{prio, Iic};
use ox_memory::SystemDevice;

/// Bus IRQL enable word the kernel writes at reset
const BUS_IRQL_ENABLE: u32 = 0x7CFF;

/// Register offsets in the bridge's MMIO window
mod reg {
    /// Interrupt enable (bus IRQL)
    pub const INT_ENABLE: u64 = 0x0C;
    /// Priority routing registers start here, one u32 per priority slot
    pub const PRIO_BASE: u64 = 0x10;
}

/// A 32-bit PCI configuration address: `{bus[8], device[5], function[3],
/// register[8]}` with the low byte being the register offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub register: u8,
}

impl ConfigAddress {
    pub fn decode(addr: u32) -> Self {
        Self {
            bus: (addr >> 20) as u8,
            device: ((addr >> 15) & 0x1F) as u8,
            function: ((addr >> 12) & 0x7) as u8,
            register: addr as u8,
        }
    }

    pub fn encode(&self) -> u32 {
        ((self.bus as u32) << 20)
            | ((self.device as u32 & 0x1F) << 15)
            | ((self.function as u32 & 0x7) << 12)
            | self.register as u32
    }

    /// Bus 0 device 0 is the bridge itself
    pub fn is_bridge(&self) -> bool {
        self.bus == 0 && self.device == 0
    }
}

/// One per-priority routing register: whether the line is enabled and
/// which hardware thread takes it.
#[derive(Debug, Clone, Copy)]
struct PrioRoute {
    enabled: bool,
    target_cpu: u8,
}

impl Default for PrioRoute {
    fn default() -> Self {
        Self {
            enabled: false,
            target_cpu: 0,
        }
    }
}

/// Routing register encoding used by the guest: bit 28 enables the
/// line, the low 6 bits select the target thread.
impl PrioRoute {
    fn from_word(word: u32) -> Self {
        Self {
            enabled: word & 0x1000_0000 != 0,
            target_cpu: (word & 0x3F) as u8,
        }
    }

    fn to_word(self) -> u32 {
        ((self.enabled as u32) << 28) | self.target_cpu as u32
    }
}

/// 64 priority slots, indexed by priority >> 2
const PRIO_SLOTS: usize = 64;

struct BridgeState {
    int_enable: u32,
    routes: [PrioRoute; PRIO_SLOTS],
    config_space: [u8; 256],
}

/// The PCI bridge.
pub struct PciBridge {
    iic: Arc<Iic>,
    base: u64,
    state: Mutex<BridgeState>,
}

impl PciBridge {
    pub fn new(iic: Arc<Iic>, base: u64, revision_id: u8) -> Self {
        let mut config_space = [0u8; 256];
        // Vendor/device id of the host bridge, big-endian guest view
        config_space[0..4].copy_from_slice(&0x1414_5802u32.to_be_bytes());
        config_space[8] = revision_id;
        let mut routes = [PrioRoute::default(); PRIO_SLOTS];
        // The clock line boots enabled and targeted at thread 0
        routes[(prio::CLOCK >> 2) as usize] = PrioRoute {
            enabled: true,
            target_cpu: 0,
        };
        Self {
            iic,
            base,
            state: Mutex::new(BridgeState {
                int_enable: BUS_IRQL_ENABLE,
                routes,
                config_space,
            }),
        }
    }

    /// Route a device interrupt to its programmed thread.
    ///
    /// Graphics and XPS carry their target with the call; every other
    /// priority uses the routing register and is dropped while its
    /// line is disabled.
    pub fn route_interrupt(&self, priority: u8, target_cpu: Option<u8>) {
        let slot = (priority >> 2) as usize % PRIO_SLOTS;
        match priority {
            prio::GRAPHICS | prio::XPS => {
                let Some(target) = target_cpu else {
                    tracing::error!("routing priority 0x{:02x} without a target thread", priority);
                    return;
                };
                self.iic.raise(target as usize, priority, target as usize);
            }
            _ => {
                let route = self.state.lock().routes[slot];
                if route.enabled {
                    self.iic
                        .raise(route.target_cpu as usize, priority, route.target_cpu as usize);
                }
            }
        }
    }

    /// Withdraw a pending device interrupt.
    pub fn cancel_interrupt(&self, priority: u8) {
        let slot = (priority >> 2) as usize % PRIO_SLOTS;
        let route = self.state.lock().routes[slot];
        if route.enabled {
            self.iic.cancel(route.target_cpu as usize, priority);
        }
    }

    /// Whether a priority line is currently enabled (tests)
    pub fn line_enabled(&self, priority: u8) -> bool {
        self.state.lock().routes[(priority >> 2) as usize % PRIO_SLOTS].enabled
    }
}

impl SystemDevice for PciBridge {
    fn read(&mut self, addr: u64, out: &mut [u8]) {
        let off = addr - self.base;
        let state = self.state.lock();
        let word: u32 = match off {
            reg::INT_ENABLE => state.int_enable,
            o if o >= reg::PRIO_BASE && o < reg::PRIO_BASE + (PRIO_SLOTS as u64 * 4) => {
                let slot = ((o - reg::PRIO_BASE) / 4) as usize;
                state.routes[slot].to_word()
            }
            _ => {
                tracing::warn!("unknown PCI bridge register read at +0x{:x}", off);
                0
            }
        };
        let bytes = word.to_be_bytes();
        let n = out.len().min(4);
        out[..n].copy_from_slice(&bytes[..n]);
        if out.len() > 4 {
            out[4..].fill(0);
        }
    }

    fn write(&mut self, addr: u64, data: &[u8]) {
        let off = addr - self.base;
        let mut bytes = [0u8; 4];
        let n = data.len().min(4);
        bytes[..n].copy_from_slice(&data[..n]);
        let word = u32::from_be_bytes(bytes);
        let mut state = self.state.lock();
        match off {
            reg::INT_ENABLE => state.int_enable = word,
            o if o >= reg::PRIO_BASE && o < reg::PRIO_BASE + (PRIO_SLOTS as u64 * 4) => {
                let slot = ((o - reg::PRIO_BASE) / 4) as usize;
                state.routes[slot] = PrioRoute::from_word(word);
            }
            _ => {
                tracing::warn!("unknown PCI bridge register write at +0x{:x}", off);
            }
        }
    }

    fn config_read(&mut self, addr: u64, out: &mut [u8]) {
        let cfg = ConfigAddress::decode(addr as u32);
        if !cfg.is_bridge() {
            out.fill(0xFF);
            return;
        }
        let state = self.state.lock();
        for (i, b) in out.iter_mut().enumerate() {
            let idx = cfg.register as usize + i;
            *b = if idx < 256 { state.config_space[idx] } else { 0xFF };
        }
    }

    fn config_write(&mut self, addr: u64, data: &[u8]) {
        let cfg = ConfigAddress::decode(addr as u32);
        if !cfg.is_bridge() {
            return;
        }
        let mut state = self.state.lock();
        for (i, b) in data.iter().enumerate() {
            let idx = cfg.register as usize + i;
            // The id words are read-only
            if (8..256).contains(&idx) && idx != 8 {
                state.config_space[idx] = *b;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge() -> (PciBridge, Arc<Iic>) {
        let iic = Iic::new();
        (PciBridge::new(Arc::clone(&iic), 0xEA00_0000, 0x90), iic)
    }

    #[test]
    fn test_config_address_round_trip() {
        let cfg = ConfigAddress {
            bus: 0,
            device: 0xA,
            function: 0,
            register: 0x10,
        };
        assert_eq!(ConfigAddress::decode(cfg.encode()), cfg);
        assert!(!cfg.is_bridge());
        assert!(ConfigAddress::decode(0x0000_0004).is_bridge());
    }

    #[test]
    fn test_clock_routes_to_thread0_only() {
        let (bridge, iic) = bridge();
        bridge.route_interrupt(prio::CLOCK, None);
        assert!(iic.deliverable(0));
        for t in 1..6 {
            assert!(!iic.deliverable(t));
        }
    }

    #[test]
    fn test_disabled_line_drops_interrupt() {
        let (bridge, iic) = bridge();
        // SMM line starts disabled
        bridge.route_interrupt(prio::SMM, None);
        assert!(!iic.deliverable(0));
    }

    #[test]
    fn test_guest_reprograms_routing() {
        let (mut bridge, iic) = bridge();
        // Enable the ethernet line targeting thread 2
        let slot_off = 0x10 + (prio::ENET as u64 >> 2) * 4;
        let word = 0x1000_0000u32 | 2;
        bridge.write(0xEA00_0000 + slot_off, &word.to_be_bytes());

        bridge.route_interrupt(prio::ENET, None);
        assert!(iic.deliverable(2));
        assert!(!iic.deliverable(0));

        // And the readback shows the programmed word
        let mut out = [0u8; 4];
        bridge.read(0xEA00_0000 + slot_off, &mut out);
        assert_eq!(u32::from_be_bytes(out), word);
    }

    #[test]
    fn test_graphics_requires_explicit_target() {
        let (bridge, iic) = bridge();
        bridge.route_interrupt(prio::GRAPHICS, Some(1));
        assert!(iic.deliverable(1));
        // Missing target is dropped, not misrouted
        bridge.route_interrupt(prio::GRAPHICS, None);
        assert!(!iic.deliverable(0));
    }

    #[test]
    fn test_cancel_clears_pending() {
        let (bridge, iic) = bridge();
        bridge.route_interrupt(prio::CLOCK, None);
        assert!(iic.deliverable(0));
        bridge.cancel_interrupt(prio::CLOCK);
        assert!(!iic.deliverable(0));
    }
}
