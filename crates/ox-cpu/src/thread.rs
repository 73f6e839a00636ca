//! Per-hardware-thread register state

use bitflags::bitflags;

bitflags! {
    /// Machine State Register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Msr: u64 {
        /// Sixty-four bit mode
        const SF = 1 << 63;
        /// Hypervisor state
        const HV = 1 << 60;
        /// External interrupt enable
        const EE = 1 << 15;
        /// Problem (user) state
        const PR = 1 << 14;
        /// Floating-point available
        const FP = 1 << 13;
        /// Machine check enable
        const ME = 1 << 12;
        /// FP exception mode 0
        const FE0 = 1 << 11;
        /// Single-step trace enable
        const SE = 1 << 10;
        /// Branch trace enable
        const BE = 1 << 9;
        /// FP exception mode 1
        const FE1 = 1 << 8;
        /// Instruction relocate
        const IR = 1 << 5;
        /// Data relocate
        const DR = 1 << 4;
        /// Recoverable interrupt
        const RI = 1 << 1;
        /// Little-endian (never set on this system)
        const LE = 1 << 0;
    }
}

/// XER summary overflow
pub const XER_SO: u64 = 0x8000_0000;
/// XER overflow
pub const XER_OV: u64 = 0x4000_0000;
/// XER carry
pub const XER_CA: u64 = 0x2000_0000;

/// Per-thread special purpose registers.
///
/// `#[repr(C)]` so the JIT can address individual SPRs by field offset.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct ThreadSprs {
    pub srr0: u64,
    pub srr1: u64,
    pub sprg: [u64; 4],
    pub hsprg: [u64; 2],
    pub dsisr: u32,
    pub dar: u64,
    pub dec: u32,
    /// Processor identification (0-5, unique per hardware thread)
    pub pir: u32,
    pub ctrl: u32,
}

impl Default for ThreadSprs {
    fn default() -> Self {
        Self {
            srr0: 0,
            srr1: 0,
            sprg: [0; 4],
            hsprg: [0; 2],
            dsisr: 0,
            dar: 0,
            dec: 0,
            pir: 0,
            ctrl: 0,
        }
    }
}

/// Architected register file of one hardware thread.
///
/// Field layout is `#[repr(C)]`: the JIT emits loads and stores against
/// these offsets, so reordering fields is an ABI change for emitted code.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct PpuThreadRegisters {
    /// General purpose registers
    pub gpr: [u64; 32],
    /// Condition register, eight 4-bit fields
    pub cr: u32,
    _pad: u32,
    /// Fixed-point exception register (SO/OV/CA + byte count)
    pub xer: u64,
    pub lr: u64,
    pub ctr: u64,
    pub msr: u64,
    /// Current instruction address
    pub cia: u64,
    /// Next instruction address; speculatively CIA+4, branches overwrite
    pub nia: u64,
    /// Floating-point registers
    pub fpr: [f64; 32],
    pub fpscr: u64,
    /// Vector registers (VMX128: 128 of them), big-endian word order
    pub vr: [[u32; 4]; 128],
    pub vscr: u32,
    _pad2: u32,
    pub spr: ThreadSprs,
}

impl Default for PpuThreadRegisters {
    fn default() -> Self {
        Self {
            gpr: [0; 32],
            cr: 0,
            _pad: 0,
            xer: 0,
            lr: 0,
            ctr: 0,
            msr: 0,
            cia: 0,
            nia: 0,
            fpr: [0.0; 32],
            fpscr: 0,
            vr: [[0; 4]; 128],
            vscr: 0,
            _pad2: 0,
            spr: ThreadSprs::default(),
        }
    }
}

impl PpuThreadRegisters {
    #[inline]
    pub fn msr(&self) -> Msr {
        Msr::from_bits_truncate(self.msr)
    }

    #[inline]
    pub fn msr_has(&self, bits: Msr) -> bool {
        self.msr().contains(bits)
    }

    /// Get CR field value (0-7)
    #[inline]
    pub fn cr_field(&self, field: usize) -> u32 {
        (self.cr >> (28 - field * 4)) & 0xF
    }

    /// Set CR field value (0-7)
    #[inline]
    pub fn set_cr_field(&mut self, field: usize, value: u32) {
        let shift = 28 - field * 4;
        self.cr = (self.cr & !(0xF << shift)) | ((value & 0xF) << shift);
    }

    /// CR bit by big-endian bit number (0 = CR0.LT)
    #[inline]
    pub fn cr_bit(&self, bit: usize) -> bool {
        (self.cr >> (31 - bit)) & 1 != 0
    }

    #[inline]
    pub fn set_cr_bit(&mut self, bit: usize, value: bool) {
        let mask = 1u32 << (31 - bit);
        if value {
            self.cr |= mask;
        } else {
            self.cr &= !mask;
        }
    }

    #[inline]
    pub fn xer_so(&self) -> bool {
        self.xer & XER_SO != 0
    }

    #[inline]
    pub fn xer_ca(&self) -> bool {
        self.xer & XER_CA != 0
    }

    #[inline]
    pub fn set_xer_ca(&mut self, value: bool) {
        if value {
            self.xer |= XER_CA;
        } else {
            self.xer &= !XER_CA;
        }
    }

    /// Set OV; SO is sticky
    #[inline]
    pub fn set_xer_ov(&mut self, value: bool) {
        if value {
            self.xer |= XER_OV | XER_SO;
        } else {
            self.xer &= !XER_OV;
        }
    }

    /// Record a comparison of `value` against zero into CR0, the Rc=1
    /// path. Compare width follows MSR.SF.
    pub fn update_cr0(&mut self, value: u64) {
        let field = if self.msr_has(Msr::SF) {
            compare_field_signed(value as i64, 0)
        } else {
            compare_field_signed(value as i32 as i64, 0)
        };
        self.set_cr_field(0, field | self.xer_so() as u32);
    }

    /// CR1 from FPSCR's top nibble, the FP Rc=1 path
    pub fn update_cr1(&mut self) {
        self.set_cr_field(1, ((self.fpscr >> 28) & 0xF) as u32);
    }
}

/// Build a {LT,GT,EQ} field from a signed comparison; SO is OR'd by callers
#[inline]
pub fn compare_field_signed(a: i64, b: i64) -> u32 {
    if a < b {
        0b1000
    } else if a > b {
        0b0100
    } else {
        0b0010
    }
}

/// Build a {LT,GT,EQ} field from an unsigned comparison
#[inline]
pub fn compare_field_unsigned(a: u64, b: u64) -> u32 {
    if a < b {
        0b1000
    } else if a > b {
        0b0100
    } else {
        0b0010
    }
}

/// Run mode of a hardware thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PpuThreadState {
    /// Executing instructions
    Running,
    /// Stopped until another thread pokes CTRL or sends an IPI
    Halted,
    /// Low-power wait for an interrupt
    Napping,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cr_fields() {
        let mut regs = PpuThreadRegisters::default();
        regs.set_cr_field(0, 0b1010);
        assert_eq!(regs.cr_field(0), 0b1010);
        regs.set_cr_field(7, 0b0101);
        assert_eq!(regs.cr_field(7), 0b0101);
        assert_eq!(regs.cr, 0xA000_0005);
    }

    #[test]
    fn test_cr_bits() {
        let mut regs = PpuThreadRegisters::default();
        regs.set_cr_bit(0, true); // CR0.LT
        assert_eq!(regs.cr_field(0), 0b1000);
        assert!(regs.cr_bit(0));
        regs.set_cr_bit(0, false);
        assert_eq!(regs.cr, 0);
    }

    #[test]
    fn test_xer_sticky_so() {
        let mut regs = PpuThreadRegisters::default();
        regs.set_xer_ov(true);
        assert!(regs.xer_so());
        regs.set_xer_ov(false);
        // SO stays set after OV clears
        assert!(regs.xer_so());
        assert_eq!(regs.xer & XER_OV, 0);
    }

    #[test]
    fn test_update_cr0_width() {
        let mut regs = PpuThreadRegisters::default();

        // 32-bit mode: 0xFFFF_FFFF is -1
        regs.msr = 0;
        regs.update_cr0(0xFFFF_FFFF);
        assert_eq!(regs.cr_field(0), 0b1000);

        // 64-bit mode: it is a positive value
        regs.msr = Msr::SF.bits();
        regs.update_cr0(0xFFFF_FFFF);
        assert_eq!(regs.cr_field(0), 0b0100);
    }
}
