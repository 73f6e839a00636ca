//! System instructions: SPR moves, MSR, TLB/SLB management, fences

use std::sync::atomic::{fence, Ordering};

use crate::decoder::PpcDecoder;
use crate::exception::{Exception, ProgramCause};
use crate::interpreter::ExecEnv;
use crate::ppu::PpuThread;
use crate::state::SlbEntry;
use crate::thread::Msr;

/// SPR numbers the core implements
pub mod spr {
    pub const XER: u16 = 1;
    pub const LR: u16 = 8;
    pub const CTR: u16 = 9;
    pub const DSISR: u16 = 18;
    pub const DAR: u16 = 19;
    pub const DEC: u16 = 22;
    pub const SDR1: u16 = 25;
    pub const SRR0: u16 = 26;
    pub const SRR1: u16 = 27;
    pub const CTRL_READ: u16 = 136;
    pub const CTRL_WRITE: u16 = 152;
    pub const TBL_READ: u16 = 268;
    pub const TBU_READ: u16 = 269;
    pub const SPRG0: u16 = 272;
    pub const SPRG1: u16 = 273;
    pub const SPRG2: u16 = 274;
    pub const SPRG3: u16 = 275;
    pub const TBL_WRITE: u16 = 284;
    pub const TBU_WRITE: u16 = 285;
    pub const PVR: u16 = 287;
    pub const HSPRG0: u16 = 304;
    pub const HSPRG1: u16 = 305;
    pub const RMOR: u16 = 312;
    pub const HRMOR: u16 = 313;
    pub const LPCR: u16 = 318;
    pub const LPIDR: u16 = 319;
    pub const HID0: u16 = 1008;
    pub const HID1: u16 = 1009;
    pub const HID4: u16 = 1012;
    pub const HID6: u16 = 1017;
    pub const PIR: u16 = 1023;
}

fn privileged(t: &PpuThread) -> Result<(), Exception> {
    if t.regs.msr_has(Msr::PR) {
        return Err(Exception::Program {
            cause: ProgramCause::PrivilegedInstruction,
        });
    }
    Ok(())
}

/// sc: raised at the boundary; SRR0 gets the next instruction
pub fn sc(_t: &mut PpuThread, _instr: u32) -> Result<(), Exception> {
    Err(Exception::SystemCall)
}

/// rfid: restore MSR from SRR1 and resume at SRR0
pub fn rfid(t: &mut PpuThread, env: &ExecEnv, _instr: u32) -> Result<(), Exception> {
    privileged(t)?;
    t.regs.msr = t.regs.spr.srr1;
    t.regs.nia = t.regs.spr.srr0 & !3;
    // Returning from the handler is a context switch
    env.space.reservations().clear(t.thread_id);
    Ok(())
}

pub fn mfmsr(t: &mut PpuThread, instr: u32) -> Result<(), Exception> {
    privileged(t)?;
    let (rt, _, _, _) = PpcDecoder::x_form(instr);
    t.regs.gpr[rt as usize] = t.regs.msr;
    Ok(())
}

/// mtmsrd (and the 32-bit mtmsr); changing IR/DR/PR moves the thread
/// between translation regimes, which the caller resyncs on.
pub fn mtmsrd(t: &mut PpuThread, instr: u32, wide: bool) -> Result<(), Exception> {
    privileged(t)?;
    let (rs, _, _, _) = PpcDecoder::x_form(instr);
    let value = t.regs.gpr[rs as usize];
    let l = (instr >> 16) & 1 != 0;
    if l {
        // L=1 form only moves EE and RI
        let mask = (Msr::EE | Msr::RI).bits();
        t.regs.msr = (t.regs.msr & !mask) | (value & mask);
    } else if wide {
        t.regs.msr = value;
    } else {
        // 32-bit mtmsr leaves the high word alone
        t.regs.msr = (t.regs.msr & !0xFFFF_FFFF) | (value & 0xFFFF_FFFF);
    }
    Ok(())
}

pub fn mfspr(t: &mut PpuThread, env: &ExecEnv, instr: u32) -> Result<(), Exception> {
    let (rt, _, _, _) = PpcDecoder::x_form(instr);
    let n = PpcDecoder::spr_number(instr);
    if !matches!(n, spr::XER | spr::LR | spr::CTR) {
        privileged(t)?;
    }
    let value = match n {
        spr::XER => t.regs.xer,
        spr::LR => t.regs.lr,
        spr::CTR => t.regs.ctr,
        spr::DSISR => t.regs.spr.dsisr as u64,
        spr::DAR => t.regs.spr.dar,
        spr::DEC => t.regs.spr.dec as u64,
        spr::SRR0 => t.regs.spr.srr0,
        spr::SRR1 => t.regs.spr.srr1,
        spr::SPRG0 => t.regs.spr.sprg[0],
        spr::SPRG1 => t.regs.spr.sprg[1],
        spr::SPRG2 => t.regs.spr.sprg[2],
        spr::SPRG3 => t.regs.spr.sprg[3],
        spr::HSPRG0 => t.regs.spr.hsprg[0],
        spr::HSPRG1 => t.regs.spr.hsprg[1],
        spr::PIR => t.regs.spr.pir as u64,
        spr::CTRL_READ => t.regs.spr.ctrl as u64,
        spr::TBL_READ => env.timebase.read(),
        spr::TBU_READ => env.timebase.read() >> 32,
        spr::SDR1 => t.mmu.core().sprs.read().sdr1,
        spr::PVR => t.mmu.core().sprs.read().pvr as u64,
        spr::HRMOR => t.mmu.core().sprs.read().hrmor,
        spr::RMOR => t.mmu.core().sprs.read().rmor,
        spr::LPCR => t.mmu.core().sprs.read().lpcr,
        spr::LPIDR => t.mmu.core().sprs.read().lpidr as u64,
        spr::HID0 => t.mmu.core().sprs.read().hid0,
        spr::HID1 => t.mmu.core().sprs.read().hid1,
        spr::HID4 => t.mmu.core().sprs.read().hid4,
        spr::HID6 => t.mmu.core().sprs.read().hid6,
        _ => {
            tracing::warn!("mfspr of unimplemented SPR {} at 0x{:08x}", n, t.regs.cia);
            0
        }
    };
    t.regs.gpr[rt as usize] = value;
    Ok(())
}

pub fn mtspr(t: &mut PpuThread, env: &ExecEnv, instr: u32) -> Result<(), Exception> {
    let (rs, _, _, _) = PpcDecoder::x_form(instr);
    let n = PpcDecoder::spr_number(instr);
    if !matches!(n, spr::XER | spr::LR | spr::CTR) {
        privileged(t)?;
    }
    let value = t.regs.gpr[rs as usize];
    match n {
        spr::XER => t.regs.xer = value,
        spr::LR => t.regs.lr = value,
        spr::CTR => t.regs.ctr = value,
        spr::DSISR => t.regs.spr.dsisr = value as u32,
        spr::DAR => t.regs.spr.dar = value,
        spr::DEC => t.dec.write(&mut t.regs.spr.dec, value as u32),
        spr::SRR0 => t.regs.spr.srr0 = value,
        spr::SRR1 => t.regs.spr.srr1 = value,
        spr::SPRG0 => t.regs.spr.sprg[0] = value,
        spr::SPRG1 => t.regs.spr.sprg[1] = value,
        spr::SPRG2 => t.regs.spr.sprg[2] = value,
        spr::SPRG3 => t.regs.spr.sprg[3] = value,
        spr::HSPRG0 => t.regs.spr.hsprg[0] = value,
        spr::HSPRG1 => t.regs.spr.hsprg[1] = value,
        spr::CTRL_WRITE => t.regs.spr.ctrl = value as u32,
        spr::SDR1 => {
            t.mmu.core().sprs.write().sdr1 = value;
            flush_translations(t, env);
        }
        spr::HRMOR => {
            t.mmu.core().sprs.write().hrmor = value;
            flush_translations(t, env);
        }
        spr::RMOR => {
            t.mmu.core().sprs.write().rmor = value;
            flush_translations(t, env);
        }
        spr::LPCR => t.mmu.core().sprs.write().lpcr = value,
        spr::LPIDR => t.mmu.core().sprs.write().lpidr = value as u32,
        spr::HID0 => t.mmu.core().sprs.write().hid0 = value,
        spr::HID1 => t.mmu.core().sprs.write().hid1 = value,
        spr::HID4 => t.mmu.core().sprs.write().hid4 = value,
        spr::HID6 => t.mmu.core().sprs.write().hid6 = value,
        spr::TBL_WRITE | spr::TBU_WRITE => {
            tracing::warn!("guest write to timebase ignored (SPR {})", n);
        }
        spr::PVR | spr::PIR | spr::TBL_READ | spr::TBU_READ => {
            tracing::warn!("mtspr to read-only SPR {} at 0x{:08x}", n, t.regs.cia);
        }
        _ => {
            tracing::warn!("mtspr of unimplemented SPR {} at 0x{:08x}", n, t.regs.cia);
        }
    }
    Ok(())
}

pub fn mftb(t: &mut PpuThread, env: &ExecEnv, instr: u32) -> Result<(), Exception> {
    let (rt, _, _, _) = PpcDecoder::x_form(instr);
    let n = PpcDecoder::spr_number(instr);
    let tb = env.timebase.read();
    t.regs.gpr[rt as usize] = if n == spr::TBU_READ { tb >> 32 } else { tb };
    Ok(())
}

pub fn mfcr(t: &mut PpuThread, instr: u32) -> Result<(), Exception> {
    let (rt, _, _, _) = PpcDecoder::x_form(instr);
    t.regs.gpr[rt as usize] = t.regs.cr as u64;
    Ok(())
}

/// mtcrf / mtocrf: FXM selects which CR fields take the new bits
pub fn mtcrf(t: &mut PpuThread, instr: u32) -> Result<(), Exception> {
    let (rs, _, _, _) = PpcDecoder::x_form(instr);
    let fxm = ((instr >> 12) & 0xFF) as u8;
    let value = t.regs.gpr[rs as usize] as u32;
    for field in 0..8 {
        if fxm & (0x80 >> field) != 0 {
            let shift = 28 - field * 4;
            let bits = (value >> shift) & 0xF;
            t.regs.set_cr_field(field, bits);
        }
    }
    Ok(())
}

/// mcrxr: XER[SO,OV,CA] into a CR field, then cleared
pub fn mcrxr(t: &mut PpuThread, instr: u32) -> Result<(), Exception> {
    let bf = ((instr >> 23) & 0x7) as usize;
    let xer = t.regs.xer;
    let field = (((xer >> 31) & 1) << 3) | (((xer >> 30) & 1) << 2) | (((xer >> 29) & 1) << 1);
    t.regs.set_cr_field(bf, field as u32);
    t.regs.xer &= !(crate::thread::XER_SO | crate::thread::XER_OV | crate::thread::XER_CA);
    Ok(())
}

// Fences. The host-side ordering mirrors the guest semantics; all of
// them are also JIT code barriers handled by the dispatcher.

pub fn sync(_t: &mut PpuThread, _instr: u32) -> Result<(), Exception> {
    // sync, lwsync and ptesync all map onto a full host fence; the L
    // field only weakens guest-side reordering we never introduce.
    fence(Ordering::SeqCst);
    Ok(())
}

pub fn eieio(_t: &mut PpuThread, _instr: u32) -> Result<(), Exception> {
    fence(Ordering::SeqCst);
    Ok(())
}

pub fn isync(_t: &mut PpuThread, env: &ExecEnv, _instr: u32) -> Result<(), Exception> {
    fence(Ordering::SeqCst);
    // Discard any code translated under the old context
    if let Some(jit) = &env.jit {
        jit.flush();
    }
    Ok(())
}

/// Bump the global translation generation and catch up locally
fn flush_translations(t: &mut PpuThread, env: &ExecEnv) {
    env.sync.invalidate();
    t.mmu.sync_generation(&env.sync, t.thread_id);
    t.jit_tlb.clear();
    if let Some(jit) = &env.jit {
        jit.flush();
    }
}

/// tlbie / tlbiel: coarse flush on every thread
pub fn tlbie(t: &mut PpuThread, env: &ExecEnv, _instr: u32) -> Result<(), Exception> {
    privileged(t)?;
    flush_translations(t, env);
    Ok(())
}

/// tlbsync: wait for every thread to acknowledge the invalidation
pub fn tlbsync(t: &mut PpuThread, env: &ExecEnv, _instr: u32) -> Result<(), Exception> {
    privileged(t)?;
    let generation = env.sync.generation();
    t.mmu.sync_generation(&env.sync, t.thread_id);
    // Pseudo-barrier: parked threads acknowledge from their wait loops,
    // so bound the spin rather than risking a deadlock at shutdown.
    for _ in 0..10_000 {
        if env.sync.all_acknowledged(generation) {
            return Ok(());
        }
        std::thread::yield_now();
    }
    tracing::warn!("tlbsync timed out waiting for acknowledgements");
    Ok(())
}

pub fn slbie(t: &mut PpuThread, env: &ExecEnv, instr: u32) -> Result<(), Exception> {
    privileged(t)?;
    let (_, _, rb, _) = PpcDecoder::x_form(instr);
    let esid = t.regs.gpr[rb as usize] >> 28;
    t.mmu.core().slb_invalidate_entry(esid);
    flush_translations(t, env);
    Ok(())
}

pub fn slbia(t: &mut PpuThread, env: &ExecEnv, _instr: u32) -> Result<(), Exception> {
    privileged(t)?;
    t.mmu.core().slb_invalidate_all();
    flush_translations(t, env);
    Ok(())
}

/// slbmte: RB carries the ESID, valid bit and entry index; RS the VSID
/// and protection flags.
pub fn slbmte(t: &mut PpuThread, env: &ExecEnv, instr: u32) -> Result<(), Exception> {
    privileged(t)?;
    let (rs, _, rb, _) = PpcDecoder::x_form(instr);
    let rb_val = t.regs.gpr[rb as usize];
    let rs_val = t.regs.gpr[rs as usize];

    let index = (rb_val & 0xFFF) as usize;
    let valid = rb_val & 0x0800_0000 != 0;
    let esid = rb_val >> 28;
    let entry = SlbEntry {
        esid,
        vsid: rs_val >> 12,
        valid,
        ks: rs_val & (1 << 11) != 0,
        kp: rs_val & (1 << 10) != 0,
        n: rs_val & (1 << 9) != 0,
        large: rs_val & (1 << 8) != 0,
        c: rs_val & (1 << 7) != 0,
    };
    t.mmu.core().slb_insert(index, entry);
    flush_translations(t, env);
    Ok(())
}

/// slbmfev: read back the VSID half of an SLB entry by index
pub fn slbmfev(t: &mut PpuThread, instr: u32) -> Result<(), Exception> {
    privileged(t)?;
    let (rt, _, rb, _) = PpcDecoder::x_form(instr);
    let index = (t.regs.gpr[rb as usize] & 0xF) as usize;
    let slb = t.mmu.core().slb.read();
    let e = &slb[index];
    let mut value = (e.vsid << 12)
        | ((e.ks as u64) << 11)
        | ((e.kp as u64) << 10)
        | ((e.n as u64) << 9)
        | ((e.large as u64) << 8)
        | ((e.c as u64) << 7);
    if !e.valid {
        value = 0;
    }
    drop(slb);
    t.regs.gpr[rt as usize] = value;
    Ok(())
}

/// slbmfee: read back the ESID half of an SLB entry by index
pub fn slbmfee(t: &mut PpuThread, instr: u32) -> Result<(), Exception> {
    privileged(t)?;
    let (rt, _, rb, _) = PpcDecoder::x_form(instr);
    let index = (t.regs.gpr[rb as usize] & 0xF) as usize;
    let slb = t.mmu.core().slb.read();
    let e = &slb[index];
    let value = if e.valid {
        (e.esid << 28) | 0x0800_0000 | index as u64
    } else {
        0
    };
    drop(slb);
    t.regs.gpr[rt as usize] = value;
    Ok(())
}

/// Cache hints: correct as no-ops against emulated flat memory
pub fn cache_op(_t: &mut PpuThread, _instr: u32) -> Result<(), Exception> {
    Ok(())
}
