//! Load and store instructions
//!
//! Every access goes through the MMU; update forms write the effective
//! address back only after translation succeeds, so a fault leaves rA
//! untouched.

use ox_memory::constants::RESERVATION_GRANULE;
use ox_memory::AddressSpace;

use crate::decoder::PpcDecoder;
use crate::exception::Exception;
use crate::ppu::PpuThread;

#[inline]
fn ea_d(t: &PpuThread, ra: u8, d: i16) -> u64 {
    if ra == 0 {
        d as i64 as u64
    } else {
        t.regs.gpr[ra as usize].wrapping_add(d as i64 as u64)
    }
}

#[inline]
fn ea_x(t: &PpuThread, ra: u8, rb: u8) -> u64 {
    if ra == 0 {
        t.regs.gpr[rb as usize]
    } else {
        t.regs.gpr[ra as usize].wrapping_add(t.regs.gpr[rb as usize])
    }
}

#[inline]
fn ea_update_d(t: &PpuThread, ra: u8, d: i16) -> u64 {
    t.regs.gpr[ra as usize].wrapping_add(d as i64 as u64)
}

// Displacement loads

pub fn lbz(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rt, ra, d) = PpcDecoder::d_form(instr);
    let value = t.read_u8(space, ea_d(t, ra, d))?;
    t.regs.gpr[rt as usize] = value as u64;
    Ok(())
}

pub fn lbzu(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rt, ra, d) = PpcDecoder::d_form(instr);
    let ea = ea_update_d(t, ra, d);
    let value = t.read_u8(space, ea)?;
    t.regs.gpr[rt as usize] = value as u64;
    t.regs.gpr[ra as usize] = ea;
    Ok(())
}

pub fn lhz(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rt, ra, d) = PpcDecoder::d_form(instr);
    let value = t.read_u16(space, ea_d(t, ra, d))?;
    t.regs.gpr[rt as usize] = value as u64;
    Ok(())
}

pub fn lhzu(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rt, ra, d) = PpcDecoder::d_form(instr);
    let ea = ea_update_d(t, ra, d);
    let value = t.read_u16(space, ea)?;
    t.regs.gpr[rt as usize] = value as u64;
    t.regs.gpr[ra as usize] = ea;
    Ok(())
}

pub fn lha(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rt, ra, d) = PpcDecoder::d_form(instr);
    let value = t.read_u16(space, ea_d(t, ra, d))? as i16;
    t.regs.gpr[rt as usize] = value as i64 as u64;
    Ok(())
}

pub fn lhau(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rt, ra, d) = PpcDecoder::d_form(instr);
    let ea = ea_update_d(t, ra, d);
    let value = t.read_u16(space, ea)? as i16;
    t.regs.gpr[rt as usize] = value as i64 as u64;
    t.regs.gpr[ra as usize] = ea;
    Ok(())
}

pub fn lwz(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rt, ra, d) = PpcDecoder::d_form(instr);
    let value = t.read_u32(space, ea_d(t, ra, d))?;
    t.regs.gpr[rt as usize] = value as u64;
    Ok(())
}

pub fn lwzu(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rt, ra, d) = PpcDecoder::d_form(instr);
    let ea = ea_update_d(t, ra, d);
    let value = t.read_u32(space, ea)?;
    t.regs.gpr[rt as usize] = value as u64;
    t.regs.gpr[ra as usize] = ea;
    Ok(())
}

/// DS-form: ld (xo 0), ldu (1), lwa (2)
pub fn ld_family(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rt, ra, ds) = PpcDecoder::ds_form(instr);
    match instr & 0x3 {
        0 => {
            let value = t.read_u64(space, ea_d(t, ra, ds))?;
            t.regs.gpr[rt as usize] = value;
        }
        1 => {
            let ea = ea_update_d(t, ra, ds);
            let value = t.read_u64(space, ea)?;
            t.regs.gpr[rt as usize] = value;
            t.regs.gpr[ra as usize] = ea;
        }
        2 => {
            let value = t.read_u32(space, ea_d(t, ra, ds))? as i32;
            t.regs.gpr[rt as usize] = value as i64 as u64;
        }
        _ => {
            return Err(Exception::Program {
                cause: crate::exception::ProgramCause::IllegalInstruction,
            })
        }
    }
    Ok(())
}

// Displacement stores

pub fn stb(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rs, ra, d) = PpcDecoder::d_form(instr);
    t.write_u8(space, ea_d(t, ra, d), t.regs.gpr[rs as usize] as u8)
}

pub fn stbu(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rs, ra, d) = PpcDecoder::d_form(instr);
    let ea = ea_update_d(t, ra, d);
    t.write_u8(space, ea, t.regs.gpr[rs as usize] as u8)?;
    t.regs.gpr[ra as usize] = ea;
    Ok(())
}

pub fn sth(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rs, ra, d) = PpcDecoder::d_form(instr);
    t.write_u16(space, ea_d(t, ra, d), t.regs.gpr[rs as usize] as u16)
}

pub fn sthu(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rs, ra, d) = PpcDecoder::d_form(instr);
    let ea = ea_update_d(t, ra, d);
    t.write_u16(space, ea, t.regs.gpr[rs as usize] as u16)?;
    t.regs.gpr[ra as usize] = ea;
    Ok(())
}

pub fn stw(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rs, ra, d) = PpcDecoder::d_form(instr);
    t.write_u32(space, ea_d(t, ra, d), t.regs.gpr[rs as usize] as u32)
}

pub fn stwu(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rs, ra, d) = PpcDecoder::d_form(instr);
    let ea = ea_update_d(t, ra, d);
    t.write_u32(space, ea, t.regs.gpr[rs as usize] as u32)?;
    t.regs.gpr[ra as usize] = ea;
    Ok(())
}

/// DS-form: std (xo 0), stdu (1)
pub fn std_family(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rs, ra, ds) = PpcDecoder::ds_form(instr);
    match instr & 0x3 {
        0 => t.write_u64(space, ea_d(t, ra, ds), t.regs.gpr[rs as usize]),
        1 => {
            let ea = ea_update_d(t, ra, ds);
            t.write_u64(space, ea, t.regs.gpr[rs as usize])?;
            t.regs.gpr[ra as usize] = ea;
            Ok(())
        }
        _ => Err(Exception::Program {
            cause: crate::exception::ProgramCause::IllegalInstruction,
        }),
    }
}

// Indexed forms

pub fn lbzx(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rt, ra, rb, _) = PpcDecoder::x_form(instr);
    let value = t.read_u8(space, ea_x(t, ra, rb))?;
    t.regs.gpr[rt as usize] = value as u64;
    Ok(())
}

pub fn lhzx(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rt, ra, rb, _) = PpcDecoder::x_form(instr);
    let value = t.read_u16(space, ea_x(t, ra, rb))?;
    t.regs.gpr[rt as usize] = value as u64;
    Ok(())
}

pub fn lhax(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rt, ra, rb, _) = PpcDecoder::x_form(instr);
    let value = t.read_u16(space, ea_x(t, ra, rb))? as i16;
    t.regs.gpr[rt as usize] = value as i64 as u64;
    Ok(())
}

pub fn lwzx(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rt, ra, rb, _) = PpcDecoder::x_form(instr);
    let value = t.read_u32(space, ea_x(t, ra, rb))?;
    t.regs.gpr[rt as usize] = value as u64;
    Ok(())
}

pub fn lwax(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rt, ra, rb, _) = PpcDecoder::x_form(instr);
    let value = t.read_u32(space, ea_x(t, ra, rb))? as i32;
    t.regs.gpr[rt as usize] = value as i64 as u64;
    Ok(())
}

pub fn ldx(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rt, ra, rb, _) = PpcDecoder::x_form(instr);
    let value = t.read_u64(space, ea_x(t, ra, rb))?;
    t.regs.gpr[rt as usize] = value;
    Ok(())
}

pub fn stbx(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rs, ra, rb, _) = PpcDecoder::x_form(instr);
    t.write_u8(space, ea_x(t, ra, rb), t.regs.gpr[rs as usize] as u8)
}

pub fn sthx(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rs, ra, rb, _) = PpcDecoder::x_form(instr);
    t.write_u16(space, ea_x(t, ra, rb), t.regs.gpr[rs as usize] as u16)
}

pub fn stwx(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rs, ra, rb, _) = PpcDecoder::x_form(instr);
    t.write_u32(space, ea_x(t, ra, rb), t.regs.gpr[rs as usize] as u32)
}

pub fn stdx(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rs, ra, rb, _) = PpcDecoder::x_form(instr);
    t.write_u64(space, ea_x(t, ra, rb), t.regs.gpr[rs as usize])
}

// Byte-reversed forms (little-endian access on a big-endian machine)

pub fn lhbrx(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rt, ra, rb, _) = PpcDecoder::x_form(instr);
    let value = t.read_u16(space, ea_x(t, ra, rb))?;
    t.regs.gpr[rt as usize] = value.swap_bytes() as u64;
    Ok(())
}

pub fn lwbrx(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rt, ra, rb, _) = PpcDecoder::x_form(instr);
    let value = t.read_u32(space, ea_x(t, ra, rb))?;
    t.regs.gpr[rt as usize] = value.swap_bytes() as u64;
    Ok(())
}

pub fn sthbrx(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rs, ra, rb, _) = PpcDecoder::x_form(instr);
    let value = (t.regs.gpr[rs as usize] as u16).swap_bytes();
    t.write_u16(space, ea_x(t, ra, rb), value)
}

pub fn stwbrx(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rs, ra, rb, _) = PpcDecoder::x_form(instr);
    let value = (t.regs.gpr[rs as usize] as u32).swap_bytes();
    t.write_u32(space, ea_x(t, ra, rb), value)
}

// Multiple word transfer; traps on the first faulting word

pub fn lmw(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rt, ra, d) = PpcDecoder::d_form(instr);
    let mut ea = ea_d(t, ra, d);
    for r in rt as usize..32 {
        let value = t.read_u32(space, ea)?;
        t.regs.gpr[r] = value as u64;
        ea = ea.wrapping_add(4);
    }
    Ok(())
}

pub fn stmw(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rs, ra, d) = PpcDecoder::d_form(instr);
    let mut ea = ea_d(t, ra, d);
    for r in rs as usize..32 {
        t.write_u32(space, ea, t.regs.gpr[r] as u32)?;
        ea = ea.wrapping_add(4);
    }
    Ok(())
}

// Load-reserved / store-conditional

pub fn lwarx(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rt, ra, rb, _) = PpcDecoder::x_form(instr);
    let ea = ea_x(t, ra, rb);
    if ea & 3 != 0 {
        return Err(Exception::Alignment { addr: ea });
    }
    let real = t.translate_data(space, ea, false)?;
    let value = space.read_be32(real);
    space.reservations().reserve(t.thread_id, real);
    t.regs.gpr[rt as usize] = value as u64;
    Ok(())
}

pub fn ldarx(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rt, ra, rb, _) = PpcDecoder::x_form(instr);
    let ea = ea_x(t, ra, rb);
    if ea & 7 != 0 {
        return Err(Exception::Alignment { addr: ea });
    }
    let real = t.translate_data(space, ea, false)?;
    let value = space.read_be64(real);
    space.reservations().reserve(t.thread_id, real);
    t.regs.gpr[rt as usize] = value;
    Ok(())
}

/// stwcx.: store iff the reservation still stands; CR0 = .EQ on success
pub fn stwcx(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rs, ra, rb, _) = PpcDecoder::x_form(instr);
    let ea = ea_x(t, ra, rb);
    if ea & 3 != 0 {
        return Err(Exception::Alignment { addr: ea });
    }
    let real = t.translate_data(space, ea, true)?;
    let value = t.regs.gpr[rs as usize] as u32;
    let success = space.reservations().store_conditional(t.thread_id, real, 4, || {
        // Commit through RAM directly; the table already serializes us
        // and clears competing reservations itself.
        if space.is_ram(real) {
            let _ = space.ram().write(real, &value.to_be_bytes());
        } else {
            space.write_be32(real, value);
        }
    });
    let field = if success { 0b0010 } else { 0 };
    t.regs.set_cr_field(0, field | t.regs.xer_so() as u32);
    Ok(())
}

pub fn stdcx(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (rs, ra, rb, _) = PpcDecoder::x_form(instr);
    let ea = ea_x(t, ra, rb);
    if ea & 7 != 0 {
        return Err(Exception::Alignment { addr: ea });
    }
    let real = t.translate_data(space, ea, true)?;
    let value = t.regs.gpr[rs as usize];
    let success = space.reservations().store_conditional(t.thread_id, real, 8, || {
        if space.is_ram(real) {
            let _ = space.ram().write(real, &value.to_be_bytes());
        } else {
            space.write_be64(real, value);
        }
    });
    let field = if success { 0b0010 } else { 0 };
    t.regs.set_cr_field(0, field | t.regs.xer_so() as u32);
    Ok(())
}

// FP loads/stores; single-precision converts through f32

pub fn lfs(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (frt, ra, d) = PpcDecoder::d_form(instr);
    let bits = t.read_u32(space, ea_d(t, ra, d))?;
    t.regs.fpr[frt as usize] = f32::from_bits(bits) as f64;
    Ok(())
}

pub fn lfsu(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (frt, ra, d) = PpcDecoder::d_form(instr);
    let ea = ea_update_d(t, ra, d);
    let bits = t.read_u32(space, ea)?;
    t.regs.fpr[frt as usize] = f32::from_bits(bits) as f64;
    t.regs.gpr[ra as usize] = ea;
    Ok(())
}

pub fn lfd(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (frt, ra, d) = PpcDecoder::d_form(instr);
    let bits = t.read_u64(space, ea_d(t, ra, d))?;
    t.regs.fpr[frt as usize] = f64::from_bits(bits);
    Ok(())
}

pub fn lfdu(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (frt, ra, d) = PpcDecoder::d_form(instr);
    let ea = ea_update_d(t, ra, d);
    let bits = t.read_u64(space, ea)?;
    t.regs.fpr[frt as usize] = f64::from_bits(bits);
    t.regs.gpr[ra as usize] = ea;
    Ok(())
}

pub fn stfs(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (frs, ra, d) = PpcDecoder::d_form(instr);
    let bits = (t.regs.fpr[frs as usize] as f32).to_bits();
    t.write_u32(space, ea_d(t, ra, d), bits)
}

pub fn stfsu(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (frs, ra, d) = PpcDecoder::d_form(instr);
    let ea = ea_update_d(t, ra, d);
    let bits = (t.regs.fpr[frs as usize] as f32).to_bits();
    t.write_u32(space, ea, bits)?;
    t.regs.gpr[ra as usize] = ea;
    Ok(())
}

pub fn stfd(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (frs, ra, d) = PpcDecoder::d_form(instr);
    let bits = t.regs.fpr[frs as usize].to_bits();
    t.write_u64(space, ea_d(t, ra, d), bits)
}

pub fn stfdu(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (frs, ra, d) = PpcDecoder::d_form(instr);
    let ea = ea_update_d(t, ra, d);
    let bits = t.regs.fpr[frs as usize].to_bits();
    t.write_u64(space, ea, bits)?;
    t.regs.gpr[ra as usize] = ea;
    Ok(())
}

/// dcbz: zero the 128-byte cache line containing EA
pub fn dcbz(t: &mut PpuThread, space: &AddressSpace, instr: u32) -> Result<(), Exception> {
    let (_, ra, rb, _) = PpcDecoder::x_form(instr);
    let ea = ea_x(t, ra, rb) & !(RESERVATION_GRANULE - 1);
    let real = t.translate_data(space, ea, true)?;
    space.memset(real, 0, RESERVATION_GRANULE);
    Ok(())
}
