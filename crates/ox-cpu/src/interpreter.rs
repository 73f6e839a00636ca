//! PPC interpreter: decoded dispatch into the category handlers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ox_memory::AddressSpace;

use crate::decoder::{InstructionForm, PpcDecoder};
use crate::exception::Exception;
use crate::instructions::{branch, float, integer, load_store, system, vector};
use crate::jit::JitCache;
use crate::mmu::{Access, TranslationSync};
use crate::ppu::PpuThread;
use crate::timebase::TimeBase;

/// Shared pieces every instruction that reaches outside the register
/// file needs: memory, translation sync, timebase and the JIT cache.
pub struct ExecEnv {
    pub space: Arc<AddressSpace>,
    pub sync: Arc<TranslationSync>,
    pub timebase: Arc<TimeBase>,
    pub jit: Option<Arc<JitCache>>,
}

/// The interpreter. Stateless apart from diagnostics counters.
pub struct PpcInterpreter {
    env: ExecEnv,
    unimplemented: AtomicU64,
}

impl PpcInterpreter {
    pub fn new(env: ExecEnv) -> Self {
        Self {
            env,
            unimplemented: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn env(&self) -> &ExecEnv {
        &self.env
    }

    /// How many unknown opcodes have been swallowed
    pub fn unimplemented_count(&self) -> u64 {
        self.unimplemented.load(Ordering::Relaxed)
    }

    /// Fetch and execute one instruction at CIA.
    pub fn step(&self, t: &mut PpuThread) -> Result<(), Exception> {
        let real = t
            .mmu
            .translate(&t.regs, &self.env.space, t.regs.cia, Access::IFetch)?;
        let instr = self.env.space.read_be32(real);
        self.execute(t, instr)
    }

    /// Execute one already-fetched instruction. NIA is speculatively
    /// CIA+4; branch handlers overwrite it; CIA commits on success.
    pub fn execute(&self, t: &mut PpuThread, instr: u32) -> Result<(), Exception> {
        t.regs.nia = t.regs.cia.wrapping_add(4);
        self.dispatch(t, instr)?;
        t.regs.cia = t.regs.nia;
        Ok(())
    }

    fn unimplemented(&self, t: &PpuThread, what: &str, instr: u32) -> Result<(), Exception> {
        self.unimplemented.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            "unimplemented {} 0x{:08x} at 0x{:016x}, treated as no-op",
            what,
            instr,
            t.regs.cia
        );
        Ok(())
    }

    fn dispatch(&self, t: &mut PpuThread, instr: u32) -> Result<(), Exception> {
        let decoded = PpcDecoder::decode(instr);
        let space = &self.env.space;
        match decoded.op {
            2 => integer::tdi(t, instr),
            3 => integer::twi(t, instr),
            4 => self.dispatch_vector(t, instr, decoded.xo, decoded.form),
            7 => integer::mulli(t, instr),
            8 => integer::subfic(t, instr),
            10 => integer::cmpli(t, instr),
            11 => integer::cmpi(t, instr),
            12 => integer::addic(t, instr, false),
            13 => integer::addic(t, instr, true),
            14 => integer::addi(t, instr),
            15 => integer::addis(t, instr),
            16 => branch::bc(t, instr),
            17 => system::sc(t, instr),
            18 => branch::b(t, instr),
            19 => self.dispatch_xl(t, instr, decoded.xo),
            20 => integer::rlwimi(t, instr),
            21 => integer::rlwinm(t, instr),
            23 => integer::rlwnm(t, instr),
            24 => integer::ori(t, instr),
            25 => integer::oris(t, instr),
            26 => integer::xori(t, instr),
            27 => integer::xoris(t, instr),
            28 => integer::andi_rc(t, instr),
            29 => integer::andis_rc(t, instr),
            30 => match decoded.form {
                InstructionForm::MD => match decoded.xo {
                    0 => integer::rldicl(t, instr),
                    1 => integer::rldicr(t, instr),
                    2 => integer::rldic(t, instr),
                    3 => integer::rldimi(t, instr),
                    _ => self.unimplemented(t, "MD-form", instr),
                },
                _ => match decoded.xo {
                    8 => integer::rldcl(t, instr),
                    9 => integer::rldcr(t, instr),
                    _ => self.unimplemented(t, "MDS-form", instr),
                },
            },
            31 => self.dispatch_31(t, instr, decoded.form),
            32 => load_store::lwz(t, space, instr),
            33 => load_store::lwzu(t, space, instr),
            34 => load_store::lbz(t, space, instr),
            35 => load_store::lbzu(t, space, instr),
            36 => load_store::stw(t, space, instr),
            37 => load_store::stwu(t, space, instr),
            38 => load_store::stb(t, space, instr),
            39 => load_store::stbu(t, space, instr),
            40 => load_store::lhz(t, space, instr),
            41 => load_store::lhzu(t, space, instr),
            42 => load_store::lha(t, space, instr),
            43 => load_store::lhau(t, space, instr),
            44 => load_store::sth(t, space, instr),
            45 => load_store::sthu(t, space, instr),
            46 => load_store::lmw(t, space, instr),
            47 => load_store::stmw(t, space, instr),
            48 => load_store::lfs(t, space, instr),
            49 => load_store::lfsu(t, space, instr),
            50 => load_store::lfd(t, space, instr),
            51 => load_store::lfdu(t, space, instr),
            52 => load_store::stfs(t, space, instr),
            53 => load_store::stfsu(t, space, instr),
            54 => load_store::stfd(t, space, instr),
            55 => load_store::stfdu(t, space, instr),
            58 => load_store::ld_family(t, space, instr),
            59 => self.dispatch_fp_single(t, instr),
            62 => load_store::std_family(t, space, instr),
            63 => self.dispatch_fp_double(t, instr, decoded.form, decoded.xo),
            _ => self.unimplemented(t, "opcode", instr),
        }
    }

    fn dispatch_xl(&self, t: &mut PpuThread, instr: u32, xo: u16) -> Result<(), Exception> {
        match xo {
            0 => branch::mcrf(t, instr),
            16 => branch::bclr(t, instr),
            18 => system::rfid(t, &self.env, instr),
            33 => branch::crnor(t, instr),
            129 => branch::crandc(t, instr),
            150 => system::isync(t, &self.env, instr),
            193 => branch::crxor(t, instr),
            225 => branch::crnand(t, instr),
            257 => branch::crand(t, instr),
            289 => branch::creqv(t, instr),
            417 => branch::crorc(t, instr),
            449 => branch::cror(t, instr),
            528 => branch::bcctr(t, instr),
            _ => self.unimplemented(t, "XL-form", instr),
        }
    }

    fn dispatch_31(
        &self,
        t: &mut PpuThread,
        instr: u32,
        form: InstructionForm,
    ) -> Result<(), Exception> {
        let space = &self.env.space;
        let env = &self.env;
        if form == InstructionForm::XO {
            let xo = ((instr >> 1) & 0x1FF) as u16;
            return match xo {
                8 => integer::subfc(t, instr),
                9 => integer::mulhdu(t, instr),
                10 => integer::addc(t, instr),
                11 => integer::mulhwu(t, instr),
                40 => integer::subf(t, instr),
                73 => integer::mulhd(t, instr),
                75 => integer::mulhw(t, instr),
                104 => integer::neg(t, instr),
                136 => integer::subfe(t, instr),
                138 => integer::adde(t, instr),
                200 => integer::subfze(t, instr),
                202 => integer::addze(t, instr),
                232 => integer::subfme(t, instr),
                233 => integer::mulld(t, instr),
                234 => integer::addme(t, instr),
                235 => integer::mullw(t, instr),
                266 => integer::add(t, instr),
                457 => integer::divdu(t, instr),
                459 => integer::divwu(t, instr),
                489 => integer::divd(t, instr),
                491 => integer::divw(t, instr),
                _ => self.unimplemented(t, "XO-form", instr),
            };
        }
        if form == InstructionForm::XS {
            return integer::sradi(t, instr);
        }
        let xo = ((instr >> 1) & 0x3FF) as u16;
        match xo {
            0 => integer::cmp(t, instr),
            4 => integer::tw(t, instr),
            19 => system::mfcr(t, instr),
            20 => load_store::lwarx(t, space, instr),
            21 => load_store::ldx(t, space, instr),
            23 => load_store::lwzx(t, space, instr),
            24 => integer::slw(t, instr),
            26 => integer::cntlzw(t, instr),
            27 => integer::sld(t, instr),
            28 => integer::and(t, instr),
            32 => integer::cmpl(t, instr),
            54 => system::cache_op(t, instr), // dcbst
            58 => integer::cntlzd(t, instr),
            60 => integer::andc(t, instr),
            68 => integer::td(t, instr),
            83 => system::mfmsr(t, instr),
            84 => load_store::ldarx(t, space, instr),
            86 => system::cache_op(t, instr), // dcbf
            87 => load_store::lbzx(t, space, instr),
            103 => vector::lvx(t, space, instr),
            124 => integer::nor(t, instr),
            144 => system::mtcrf(t, instr),
            146 => system::mtmsrd(t, instr, false),
            149 => load_store::stdx(t, space, instr),
            150 => load_store::stwcx(t, space, instr),
            151 => load_store::stwx(t, space, instr),
            178 => system::mtmsrd(t, instr, true),
            214 => load_store::stdcx(t, space, instr),
            215 => load_store::stbx(t, space, instr),
            231 => vector::stvx(t, space, instr),
            246 => system::cache_op(t, instr), // dcbtst
            274 => system::tlbie(t, env, instr), // tlbiel
            278 => system::cache_op(t, instr), // dcbt
            279 => load_store::lhzx(t, space, instr),
            284 => integer::eqv(t, instr),
            306 => system::tlbie(t, env, instr),
            316 => integer::xor(t, instr),
            339 => system::mfspr(t, env, instr),
            341 => load_store::lwax(t, space, instr),
            343 => load_store::lhax(t, space, instr),
            359 => vector::lvx(t, space, instr), // lvxl
            371 => system::mftb(t, env, instr),
            402 => system::slbmte(t, env, instr),
            407 => load_store::sthx(t, space, instr),
            412 => integer::orc(t, instr),
            434 => system::slbie(t, env, instr),
            444 => integer::or(t, instr),
            467 => system::mtspr(t, env, instr),
            476 => integer::nand(t, instr),
            487 => vector::stvx(t, space, instr), // stvxl
            498 => system::slbia(t, env, instr),
            512 => system::mcrxr(t, instr),
            534 => load_store::lwbrx(t, space, instr),
            536 => integer::srw(t, instr),
            539 => integer::srd(t, instr),
            566 => system::tlbsync(t, env, instr),
            598 => system::sync(t, instr),
            662 => load_store::stwbrx(t, space, instr),
            790 => load_store::lhbrx(t, space, instr),
            792 => integer::sraw(t, instr),
            794 => integer::srad(t, instr),
            824 => integer::srawi(t, instr),
            851 => system::slbmfev(t, instr),
            854 => system::eieio(t, instr),
            915 => system::slbmfee(t, instr),
            918 => load_store::sthbrx(t, space, instr),
            922 => integer::extsh(t, instr),
            954 => integer::extsb(t, instr),
            982 => system::cache_op(t, instr), // icbi
            986 => integer::extsw(t, instr),
            1014 => load_store::dcbz(t, space, instr),
            _ => self.unimplemented(t, "X-form", instr),
        }
    }

    fn dispatch_vector(
        &self,
        t: &mut PpuThread,
        instr: u32,
        xo: u16,
        form: InstructionForm,
    ) -> Result<(), Exception> {
        if form == InstructionForm::VA {
            return match xo {
                42 => vector::vsel(t, instr),
                43 => vector::vperm(t, instr),
                44 => vector::vsldoi(t, instr),
                46 => vector::vmaddfp(t, instr),
                47 => vector::vnmsubfp(t, instr),
                _ => self.unimplemented(t, "VA-form", instr),
            };
        }
        // The record bit of vector compares lives above the opcode
        if xo & !0x400 == 134 {
            return vector::vcmpequw(t, instr);
        }
        match xo {
            10 => vector::vaddfp(t, instr),
            74 => vector::vsubfp(t, instr),
            128 => vector::vadduwm(t, instr),
            140 => vector::vmrghw(t, instr),
            388 => vector::vslw(t, instr),
            396 => vector::vmrglw(t, instr),
            644 => vector::vsrw(t, instr),
            652 => vector::vspltw(t, instr),
            900 => vector::vsraw(t, instr),
            908 => vector::vspltisw(t, instr),
            1028 => vector::vand(t, instr),
            1034 => vector::vmaxfp(t, instr),
            1092 => vector::vandc(t, instr),
            1098 => vector::vminfp(t, instr),
            1152 => vector::vsubuwm(t, instr),
            1156 => vector::vor(t, instr),
            1220 => vector::vxor(t, instr),
            1284 => vector::vnor(t, instr),
            1540 => vector::mfvscr(t, instr),
            1604 => vector::mtvscr(t, instr),
            _ => self.unimplemented(t, "VX-form", instr),
        }
    }

    fn dispatch_fp_single(&self, t: &mut PpuThread, instr: u32) -> Result<(), Exception> {
        let xo5 = ((instr >> 1) & 0x1F) as u16;
        match xo5 {
            18 => float::fdiv(t, instr, true),
            20 => float::fsub(t, instr, true),
            21 => float::fadd(t, instr, true),
            22 => float::fsqrt(t, instr, true),
            24 => float::fres(t, instr),
            25 => float::fmul(t, instr, true),
            28 => float::fmadd(t, instr, true, true, false),
            29 => float::fmadd(t, instr, true, false, false),
            30 => float::fmadd(t, instr, true, true, true),
            31 => float::fmadd(t, instr, true, false, true),
            _ => self.unimplemented(t, "FP single", instr),
        }
    }

    fn dispatch_fp_double(
        &self,
        t: &mut PpuThread,
        instr: u32,
        form: InstructionForm,
        xo: u16,
    ) -> Result<(), Exception> {
        if form == InstructionForm::A {
            return match xo {
                18 => float::fdiv(t, instr, false),
                20 => float::fsub(t, instr, false),
                21 => float::fadd(t, instr, false),
                22 => float::fsqrt(t, instr, false),
                23 => float::fsel(t, instr),
                25 => float::fmul(t, instr, false),
                26 => float::frsqrte(t, instr),
                28 => float::fmadd(t, instr, false, true, false),
                29 => float::fmadd(t, instr, false, false, false),
                30 => float::fmadd(t, instr, false, true, true),
                31 => float::fmadd(t, instr, false, false, true),
                _ => self.unimplemented(t, "A-form", instr),
            };
        }
        match xo {
            0 => float::fcmp(t, instr),
            12 => float::frsp(t, instr),
            14 => float::fctiw(t, instr, false),
            15 => float::fctiw(t, instr, true),
            32 => float::fcmp(t, instr), // fcmpo: ordered flags folded in
            40 => float::fneg(t, instr),
            72 => float::fmr(t, instr),
            136 => float::fnabs(t, instr),
            264 => float::fabs(t, instr),
            583 => float::mffs(t, instr),
            711 => float::mtfsf(t, instr),
            814 => float::fctid(t, instr, false),
            815 => float::fctid(t, instr, true),
            846 => float::fcfid(t, instr),
            _ => self.unimplemented(t, "FP double", instr),
        }
    }
}
