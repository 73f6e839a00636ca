//! Block JIT: guest basic blocks compiled to host code
//!
//! Blocks are keyed by guest PC plus the translation-relevant MSR bits
//! and cached until a translation invalidation, an MSR regime change or
//! a store into a compiled page flushes them. Emitted code works
//! directly against the `#[repr(C)]` register file; loads take an
//! inline fast path through a small per-thread translation cache and
//! fall back to helpers that run the full MMU walk and MMIO dispatch.
//!
//! Only the hot integer/branch subset is translated; a block ends at
//! the first instruction the emitter does not know, and the dispatcher
//! interprets onward from there. Correctness is defined by bit-for-bit
//! equivalence with the interpreter.

use std::collections::{HashMap, HashSet};
use std::mem::offset_of;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cranelift::codegen;
use cranelift::prelude::*;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, Linkage, Module};
use parking_lot::Mutex;

use ox_memory::constants::PAGE_SIZE;
use ox_memory::AddressSpace;

use crate::decoder::{InstructionForm, PpcDecoder};
use crate::exception::Exception;
use crate::interpreter::ExecEnv;
use crate::ppu::PpuThread;
use crate::thread::{Msr, PpuThreadRegisters};

/// Cap on guest instructions per block
const BLOCK_LIMIT: usize = 64;

/// Entries in the per-thread fast-path load cache
const JTLB_ENTRIES: usize = 64;

/// One fast-path mapping: guest page tag to host-pointer delta.
/// `tag` is the effective page number plus one so a zeroed entry never
/// matches.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct JitTlbEntry {
    pub tag: u64,
    pub delta: u64,
}

/// Per-thread fast-path load cache; entries must stay at offset 0, the
/// emitted code indexes the array through the context pointer.
#[repr(C)]
pub struct JitTlb {
    pub entries: [JitTlbEntry; JTLB_ENTRIES],
    pub last_msr_key: u64,
}

impl JitTlb {
    pub fn new() -> Self {
        Self {
            entries: [JitTlbEntry::default(); JTLB_ENTRIES],
            last_msr_key: u64::MAX,
        }
    }

    pub fn clear(&mut self) {
        self.entries = [JitTlbEntry::default(); JTLB_ENTRIES];
    }
}

impl Default for JitTlb {
    fn default() -> Self {
        Self::new()
    }
}

/// Call-out context handed to every compiled block.
///
/// Layout is `#[repr(C)]`; emitted code reads only the leading `jtlb`
/// pointer, the helpers use the rest from Rust.
#[repr(C)]
pub struct HostCtx {
    pub jtlb: *mut JitTlb,
    pub thread: *mut PpuThread,
    pub space: *const AddressSpace,
    pub exception: Option<Exception>,
}

/// Compiled entry point: returns the number of guest instructions
/// retired; CIA/NIA are stored back before returning.
type Entry = extern "C" fn(regs: *mut PpuThreadRegisters, ctx: *mut HostCtx) -> u64;

/// How a block ends, recorded at compile time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Ran into an instruction the emitter leaves to the interpreter
    Fallthrough,
    /// Ends in a branch with a compile-time target
    DirectBranch,
    /// Ends in bclr/bcctr
    Indirect,
}

/// Result of running a block
pub enum BlockExit {
    Exception(Exception),
    Continue { instructions: u32 },
}

struct JitBlock {
    #[allow(dead_code)]
    start: u64,
    #[allow(dead_code)]
    end: u64,
    #[allow(dead_code)]
    exit: ExitKind,
    generation: u64,
    entry: Entry,
    module: Option<JITModule>,
}

// The code memory is written once during compilation and only executed
// afterwards; `entry` is a plain function pointer into it. The module
// handle is touched again solely in Drop.
unsafe impl Send for JitBlock {}
unsafe impl Sync for JitBlock {}

impl Drop for JitBlock {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // SAFETY: the cache dropped its reference; nobody can call
            // entry once the Arc count reaches zero.
            unsafe { module.free_memory() };
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BlockKey {
    pc: u64,
    msr_key: u8,
}

/// Translation-relevant MSR bits: a block compiled in one regime must
/// not run in another.
#[inline]
fn msr_key(msr: u64) -> u8 {
    let m = Msr::from_bits_truncate(msr);
    (m.contains(Msr::IR) as u8)
        | ((m.contains(Msr::DR) as u8) << 1)
        | ((m.contains(Msr::PR) as u8) << 2)
        | ((m.contains(Msr::SF) as u8) << 3)
        | ((m.contains(Msr::HV) as u8) << 4)
}

/// Visit count meaning "never try to compile this PC again"
const UNCOMPILABLE: u32 = u32::MAX;

/// The shared block cache.
pub struct JitCache {
    blocks: Mutex<HashMap<BlockKey, Arc<JitBlock>>>,
    visits: Mutex<HashMap<BlockKey, u32>>,
    /// Real pages containing compiled code, for self-modification checks
    code_pages: Mutex<HashSet<u64>>,
    generation: AtomicU64,
    threshold: u32,
    budget: usize,
}

impl JitCache {
    pub fn new(threshold: u32, budget: usize) -> Arc<Self> {
        Arc::new(Self {
            blocks: Mutex::new(HashMap::new()),
            visits: Mutex::new(HashMap::new()),
            code_pages: Mutex::new(HashSet::new()),
            generation: AtomicU64::new(0),
            threshold: threshold.max(1),
            budget,
        })
    }

    /// Coarse flush: every cached block is discarded.
    pub fn flush(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.blocks.lock().clear();
        self.visits.lock().clear();
        self.code_pages.lock().clear();
    }

    /// A store hit this real address; flush if it falls in a page that
    /// holds compiled code.
    pub fn note_store(&self, real: u64) {
        let page = real / PAGE_SIZE;
        if self.code_pages.lock().contains(&page) {
            tracing::debug!(target: "jit", "store into code page 0x{:x}, flushing", page);
            self.flush();
        }
    }

    pub fn block_count(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Execute the cached block for the thread's CIA, if one exists.
    pub fn try_run(&self, t: &mut PpuThread, env: &ExecEnv, _real: u64) -> Option<BlockExit> {
        let key = BlockKey {
            pc: t.regs.cia,
            msr_key: msr_key(t.regs.msr),
        };
        let block = self.blocks.lock().get(&key).cloned()?;
        if block.generation != self.generation.load(Ordering::Acquire) {
            self.blocks.lock().remove(&key);
            return None;
        }

        // The fast-path cache is only valid within one MSR regime
        if t.jit_tlb.last_msr_key != key.msr_key as u64 {
            t.jit_tlb.clear();
            t.jit_tlb.last_msr_key = key.msr_key as u64;
        }

        let mut host_ctx = HostCtx {
            jtlb: t.jit_tlb.as_mut() as *mut JitTlb,
            thread: t as *mut PpuThread,
            space: Arc::as_ptr(&env.space),
            exception: None,
        };
        let regs_ptr = &mut t.regs as *mut PpuThreadRegisters;
        // SAFETY: entry was compiled against this register layout; the
        // raw thread/space pointers outlive the call.
        let retired = (block.entry)(regs_ptr, &mut host_ctx as *mut HostCtx);
        match host_ctx.exception {
            Some(exc) => Some(BlockExit::Exception(exc)),
            None => Some(BlockExit::Continue {
                instructions: retired as u32,
            }),
        }
    }

    /// Count a visit to `pc`; compile its block once the threshold is
    /// reached (one-shot interpretation counts as profiling).
    pub fn profile(&self, pc: u64, real: u64, regs: &PpuThreadRegisters, env: &ExecEnv) {
        let key = BlockKey {
            pc,
            msr_key: msr_key(regs.msr),
        };
        {
            let mut visits = self.visits.lock();
            let count = visits.entry(key).or_insert(0);
            if *count == UNCOMPILABLE {
                return;
            }
            *count += 1;
            if *count < self.threshold {
                return;
            }
        }
        if self.blocks.lock().contains_key(&key) {
            return;
        }
        // Never fetch compile-time instruction words through MMIO
        if !env.space.is_ram(real) {
            self.visits.lock().insert(key, UNCOMPILABLE);
            return;
        }

        match compile_block(pc, real, regs.msr, env, self.generation.load(Ordering::Acquire)) {
            Ok(Some(block)) => {
                let mut blocks = self.blocks.lock();
                if blocks.len() >= self.budget {
                    drop(blocks);
                    tracing::debug!(target: "jit", "block budget reached, flushing");
                    self.flush();
                    blocks = self.blocks.lock();
                }
                // Blocks never cross a page, one entry covers it
                self.code_pages.lock().insert(real / PAGE_SIZE);
                blocks.insert(key, Arc::new(block));
            }
            Ok(None) => {
                self.visits.lock().insert(key, UNCOMPILABLE);
            }
            Err(err) => {
                tracing::warn!(target: "jit", "emission failed at 0x{:x}: {}", pc, err);
                self.visits.lock().insert(key, UNCOMPILABLE);
            }
        }
    }
}

// Runtime helpers called from emitted code. Status 0 is success; on
// failure the exception is parked in the context.

extern "C" fn jit_load(ctx: *mut HostCtx, ea: u64, width: u64, out: *mut u64) -> u64 {
    // SAFETY: the dispatcher built this context around live references.
    let ctx = unsafe { &mut *ctx };
    let t = unsafe { &mut *ctx.thread };
    let space = unsafe { &*ctx.space };
    let result = match width {
        1 => t.read_u8(space, ea).map(u64::from),
        2 => t.read_u16(space, ea).map(u64::from),
        4 => t.read_u32(space, ea).map(u64::from),
        _ => t.read_u64(space, ea),
    };
    match result {
        Ok(value) => {
            unsafe { *out = value };
            fill_fast_path(ctx, t, space, ea);
            0
        }
        Err(exc) => {
            ctx.exception = Some(exc);
            1
        }
    }
}

extern "C" fn jit_store(ctx: *mut HostCtx, ea: u64, width: u64, value: u64) -> u64 {
    let ctx = unsafe { &mut *ctx };
    let t = unsafe { &mut *ctx.thread };
    let space = unsafe { &*ctx.space };
    let result = match width {
        1 => t.write_u8(space, ea, value as u8),
        2 => t.write_u16(space, ea, value as u16),
        4 => t.write_u32(space, ea, value as u32),
        _ => t.write_u64(space, ea, value),
    };
    match result {
        Ok(()) => 0,
        Err(exc) => {
            ctx.exception = Some(exc);
            1
        }
    }
}

/// After a successful load, cache a direct host mapping for the page
/// when it sits wholly in RAM.
fn fill_fast_path(ctx: &mut HostCtx, t: &mut PpuThread, space: &AddressSpace, ea: u64) {
    let page_ea = ea & !(PAGE_SIZE - 1);
    let Ok(ra) = t.translate_data(space, page_ea, false) else {
        return;
    };
    if !space.is_ram(ra) || ra + PAGE_SIZE > space.ram().size() {
        return;
    }
    let Ok(host) = space.ram().host_ptr(ra) else {
        return;
    };
    let jtlb = unsafe { &mut *ctx.jtlb };
    let page = ea / PAGE_SIZE;
    let entry = &mut jtlb.entries[(page as usize) & (JTLB_ENTRIES - 1)];
    entry.tag = page + 1;
    entry.delta = (host as u64).wrapping_sub(page_ea);
}

// Register file offsets the emitter addresses

#[inline]
fn gpr_off(r: u8) -> i32 {
    (offset_of!(PpuThreadRegisters, gpr) + r as usize * 8) as i32
}

const CR_OFF: i32 = offset_of!(PpuThreadRegisters, cr) as i32;
const XER_OFF: i32 = offset_of!(PpuThreadRegisters, xer) as i32;
const LR_OFF: i32 = offset_of!(PpuThreadRegisters, lr) as i32;
const CTR_OFF: i32 = offset_of!(PpuThreadRegisters, ctr) as i32;
const CIA_OFF: i32 = offset_of!(PpuThreadRegisters, cia) as i32;
const NIA_OFF: i32 = offset_of!(PpuThreadRegisters, nia) as i32;

/// Everything the per-instruction emitters need.
struct BlockBuilder<'a> {
    builder: FunctionBuilder<'a>,
    regs_ptr: Value,
    ctx_ptr: Value,
    exc_block: Block,
    cur_pc: Variable,
    count: Variable,
    load_sigref: codegen::ir::SigRef,
    store_sigref: codegen::ir::SigRef,
    out_slot: codegen::ir::StackSlot,
    sf: bool,
    /// Whether anything branched to the exception exit
    used_exc: bool,
}

impl<'a> BlockBuilder<'a> {
    #[inline]
    fn ins(&mut self) -> cranelift::frontend::FuncInstBuilder<'_, 'a> {
        self.builder.ins()
    }

    fn load_gpr(&mut self, r: u8) -> Value {
        let regs = self.regs_ptr;
        self.ins().load(types::I64, MemFlags::trusted(), regs, gpr_off(r))
    }

    fn store_gpr(&mut self, r: u8, value: Value) {
        let regs = self.regs_ptr;
        self.ins().store(MemFlags::trusted(), value, regs, gpr_off(r));
    }

    fn load_field(&mut self, ty: Type, off: i32) -> Value {
        let regs = self.regs_ptr;
        self.ins().load(ty, MemFlags::trusted(), regs, off)
    }

    fn store_field(&mut self, value: Value, off: i32) {
        let regs = self.regs_ptr;
        self.ins().store(MemFlags::trusted(), value, regs, off);
    }

    /// XER.SO as an I32 0/1
    fn so_bit(&mut self) -> Value {
        let xer = self.load_field(types::I64, XER_OFF);
        let so = self.ins().ushr_imm(xer, 31);
        let so = self.ins().band_imm(so, 1);
        self.ins().ireduce(types::I32, so)
    }

    /// Write a 4-bit {LT,GT,EQ,SO} field into CR field `bf` from a
    /// signed compare of two I64 values, width-reduced per MSR.SF.
    /// Mirrors the interpreter's compare_field + set_cr_field exactly.
    fn set_cr_compare(&mut self, bf: usize, a: Value, b: Value, signed: bool) {
        let (a, b) = if self.sf {
            (a, b)
        } else {
            let a32 = self.ins().ireduce(types::I32, a);
            let b32 = self.ins().ireduce(types::I32, b);
            if signed {
                let a64 = self.ins().sextend(types::I64, a32);
                let b64 = self.ins().sextend(types::I64, b32);
                (a64, b64)
            } else {
                let a64 = self.ins().uextend(types::I64, a32);
                let b64 = self.ins().uextend(types::I64, b32);
                (a64, b64)
            }
        };
        let (lt_cc, gt_cc) = if signed {
            (IntCC::SignedLessThan, IntCC::SignedGreaterThan)
        } else {
            (IntCC::UnsignedLessThan, IntCC::UnsignedGreaterThan)
        };
        let lt = self.ins().icmp(lt_cc, a, b);
        let gt = self.ins().icmp(gt_cc, a, b);
        let eq = self.ins().icmp(IntCC::Equal, a, b);
        let lt = self.ins().uextend(types::I32, lt);
        let gt = self.ins().uextend(types::I32, gt);
        let eq = self.ins().uextend(types::I32, eq);
        let so = self.so_bit();

        let lt = self.ins().ishl_imm(lt, 3);
        let gt = self.ins().ishl_imm(gt, 2);
        let eq = self.ins().ishl_imm(eq, 1);
        let field = self.ins().bor(lt, gt);
        let field = self.ins().bor(field, eq);
        let field = self.ins().bor(field, so);

        let shift = 28 - bf as i64 * 4;
        let cr = self.load_field(types::I32, CR_OFF);
        let cleared = self.ins().band_imm(cr, !(0xFi64 << shift));
        let field = self.ins().ishl_imm(field, shift);
        let cr = self.ins().bor(cleared, field);
        self.store_field(cr, CR_OFF);
    }

    /// CR0 record form: compare the result against zero
    fn set_cr0(&mut self, value: Value) {
        let zero = self.ins().iconst(types::I64, 0);
        self.set_cr_compare(0, value, zero, true);
    }

    fn bump_count(&mut self) {
        let c = self.builder.use_var(self.count);
        let c = self.builder.ins().iadd_imm(c, 1);
        self.builder.def_var(self.count, c);
    }

    /// Undo the eager bump when an instruction turns out unsupported
    fn unbump_count(&mut self) {
        let c = self.builder.use_var(self.count);
        let c = self.builder.ins().iadd_imm(c, -1);
        self.builder.def_var(self.count, c);
    }

    fn set_cur_pc(&mut self, pc: u64) {
        let v = self.builder.ins().iconst(types::I64, pc as i64);
        self.builder.def_var(self.cur_pc, v);
    }

    /// Store CIA/NIA = `next` and return the retired-instruction count.
    fn exit_to(&mut self, next: Value) {
        self.store_field(next, CIA_OFF);
        self.store_field(next, NIA_OFF);
        let count = self.builder.use_var(self.count);
        self.builder.ins().return_(&[count]);
    }

    fn exit_to_const(&mut self, next: u64) {
        let v = self.ins().iconst(types::I64, next as i64);
        self.exit_to(v);
    }

    /// Guest load with the inline RAM fast path. Returns the
    /// zero-extended I64 value.
    fn emit_load(&mut self, pc: u64, ea: Value, width: u64) -> Value {
        self.set_cur_pc(pc);
        self.used_exc = true;

        let hit_block = self.builder.create_block();
        let miss_block = self.builder.create_block();
        let cont_block = self.builder.create_block();
        self.builder.append_block_param(cont_block, types::I64);

        let page = self.ins().ushr_imm(ea, PAGE_SIZE.trailing_zeros() as i64);
        let idx = self.ins().band_imm(page, (JTLB_ENTRIES - 1) as i64);
        let ctx = self.ctx_ptr;
        let jtlb = self
            .ins()
            .load(types::I64, MemFlags::trusted(), ctx, 0);
        let off = self.ins().imul_imm(idx, 16);
        let entry = self.ins().iadd(jtlb, off);
        let tag = self.ins().load(types::I64, MemFlags::trusted(), entry, 0);
        let want = self.ins().iadd_imm(page, 1);
        let tag_ok = self.ins().icmp(IntCC::Equal, tag, want);
        // The cached mapping only covers one page
        let in_page = self.ins().band_imm(ea, (PAGE_SIZE - 1) as i64);
        let fits = self.ins().icmp_imm(
            IntCC::UnsignedLessThanOrEqual,
            in_page,
            (PAGE_SIZE - width) as i64,
        );
        let hit = self.ins().band(tag_ok, fits);
        self.builder.ins().brif(hit, hit_block, &[], miss_block, &[]);

        // Fast path: direct host load + byte swap
        self.builder.switch_to_block(hit_block);
        self.builder.seal_block(hit_block);
        let delta = self.ins().load(types::I64, MemFlags::trusted(), entry, 8);
        let haddr = self.ins().iadd(ea, delta);
        let guest = MemFlags::new();
        let value = match width {
            1 => {
                let raw = self.ins().load(types::I8, guest, haddr, 0);
                self.ins().uextend(types::I64, raw)
            }
            2 => {
                let raw = self.ins().load(types::I16, guest, haddr, 0);
                let sw = self.ins().bswap(raw);
                self.ins().uextend(types::I64, sw)
            }
            4 => {
                let raw = self.ins().load(types::I32, guest, haddr, 0);
                let sw = self.ins().bswap(raw);
                self.ins().uextend(types::I64, sw)
            }
            _ => {
                let raw = self.ins().load(types::I64, guest, haddr, 0);
                self.ins().bswap(raw)
            }
        };
        self.builder
            .ins()
            .jump(cont_block, &[value]);

        // Slow path: full MMU walk through the helper
        self.builder.switch_to_block(miss_block);
        self.builder.seal_block(miss_block);
        let callee = self
            .ins()
            .iconst(types::I64, jit_load as usize as i64);
        let width_v = self.ins().iconst(types::I64, width as i64);
        let slot = self.out_slot;
        let out_ptr = self.ins().stack_addr(types::I64, slot, 0);
        let ctx = self.ctx_ptr;
        let call = self.builder.ins().call_indirect(
            self.load_sigref,
            callee,
            &[ctx, ea, width_v, out_ptr],
        );
        let status = self.builder.inst_results(call)[0];
        let ok_block = self.builder.create_block();
        self.builder
            .ins()
            .brif(status, self.exc_block, &[], ok_block, &[]);
        self.builder.switch_to_block(ok_block);
        self.builder.seal_block(ok_block);
        let value = self.ins().stack_load(types::I64, slot, 0);
        self.builder
            .ins()
            .jump(cont_block, &[value]);

        self.builder.switch_to_block(cont_block);
        self.builder.seal_block(cont_block);
        self.builder.block_params(cont_block)[0]
    }

    /// Guest store; always goes through the helper so the reservation
    /// table observes it.
    fn emit_store(&mut self, pc: u64, ea: Value, width: u64, value: Value) {
        self.set_cur_pc(pc);
        self.used_exc = true;
        let callee = self
            .ins()
            .iconst(types::I64, jit_store as usize as i64);
        let width_v = self.ins().iconst(types::I64, width as i64);
        let ctx = self.ctx_ptr;
        let call = self.builder.ins().call_indirect(
            self.store_sigref,
            callee,
            &[ctx, ea, width_v, value],
        );
        let status = self.builder.inst_results(call)[0];
        let ok_block = self.builder.create_block();
        self.builder
            .ins()
            .brif(status, self.exc_block, &[], ok_block, &[]);
        self.builder.switch_to_block(ok_block);
        self.builder.seal_block(ok_block);
    }

    /// EA for D-form memory ops
    fn emit_ea_d(&mut self, ra: u8, d: i64) -> Value {
        if ra == 0 {
            self.ins().iconst(types::I64, d)
        } else {
            let base = self.load_gpr(ra);
            self.ins().iadd_imm(base, d)
        }
    }

    /// BO/BI condition, mirroring the interpreter's branch_taken
    fn emit_branch_cond(&mut self, bo: u8, bi: u8, decrement_ctr: bool) -> Value {
        let ctr_ok = if bo & 0x04 != 0 {
            self.ins().iconst(types::I8, 1)
        } else {
            let ctr = self.load_field(types::I64, CTR_OFF);
            let ctr = if decrement_ctr {
                let v = self.ins().iadd_imm(ctr, -1);
                self.store_field(v, CTR_OFF);
                v
            } else {
                ctr
            };
            let cc = if bo & 0x02 != 0 {
                IntCC::Equal
            } else {
                IntCC::NotEqual
            };
            self.ins().icmp_imm(cc, ctr, 0)
        };
        let cond_ok = if bo & 0x10 != 0 {
            self.ins().iconst(types::I8, 1)
        } else {
            let cr = self.load_field(types::I32, CR_OFF);
            let bit = self.ins().ushr_imm(cr, 31 - bi as i64);
            let bit = self.ins().band_imm(bit, 1);
            let want = if bo & 0x08 != 0 { 1 } else { 0 };
            self.ins().icmp_imm(IntCC::Equal, bit, want)
        };
        self.ins().band(ctr_ok, cond_ok)
    }
}

/// Try to compile the block starting at `pc` (already translated to
/// `real`). `Ok(None)` marks the PC as not worth compiling.
fn compile_block(
    pc: u64,
    real: u64,
    msr: u64,
    env: &ExecEnv,
    generation: u64,
) -> Result<Option<JitBlock>, String> {
    let mut flag_builder = settings::builder();
    flag_builder
        .set("use_colocated_libcalls", "false")
        .map_err(|e| e.to_string())?;
    flag_builder.set("is_pic", "false").map_err(|e| e.to_string())?;
    let isa = cranelift_native::builder()
        .map_err(|e| e.to_string())?
        .finish(settings::Flags::new(flag_builder))
        .map_err(|e| e.to_string())?;
    let mut module = JITModule::new(JITBuilder::with_isa(isa, default_libcall_names()));
    let mut ctx = module.make_context();
    let mut builder_ctx = FunctionBuilderContext::new();

    let ptr_type = module.target_config().pointer_type();
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(ptr_type));
    sig.params.push(AbiParam::new(ptr_type));
    sig.returns.push(AbiParam::new(types::I64));
    ctx.func.signature = sig;

    let load_sig = {
        let mut s = module.make_signature();
        s.params.push(AbiParam::new(ptr_type));
        s.params.push(AbiParam::new(types::I64));
        s.params.push(AbiParam::new(types::I64));
        s.params.push(AbiParam::new(ptr_type));
        s.returns.push(AbiParam::new(types::I64));
        s
    };
    let store_sig = {
        let mut s = module.make_signature();
        s.params.push(AbiParam::new(ptr_type));
        s.params.push(AbiParam::new(types::I64));
        s.params.push(AbiParam::new(types::I64));
        s.params.push(AbiParam::new(types::I64));
        s.returns.push(AbiParam::new(types::I64));
        s
    };

    let (end, exit) = {
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);
        let load_sigref = builder.import_signature(load_sig);
        let store_sigref = builder.import_signature(store_sig);

        let entry_block = builder.create_block();
        builder.append_block_params_for_function_params(entry_block);
        builder.switch_to_block(entry_block);
        builder.seal_block(entry_block);
        let regs_ptr = builder.block_params(entry_block)[0];
        let ctx_ptr = builder.block_params(entry_block)[1];

        let cur_pc = Variable::new(0);
        let count = Variable::new(1);
        builder.declare_var(cur_pc, types::I64);
        builder.declare_var(count, types::I64);
        let zero = builder.ins().iconst(types::I64, 0);
        builder.def_var(count, zero);
        let start = builder.ins().iconst(types::I64, pc as i64);
        builder.def_var(cur_pc, start);

        let exc_block = builder.create_block();
        let out_slot = builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            8,
            3,
        ));

        let mut b = BlockBuilder {
            builder,
            regs_ptr,
            ctx_ptr,
            exc_block,
            cur_pc,
            count,
            load_sigref,
            store_sigref,
            out_slot,
            sf: Msr::from_bits_truncate(msr).contains(Msr::SF),
            used_exc: false,
        };

        let Some(result) = translate_block(&mut b, pc, real, env)? else {
            // Nothing worth compiling; the unfinished function is
            // dropped without being defined.
            return Ok(None);
        };

        // Shared exception exit: the faulting PC becomes CIA. Only laid
        // out when some access can actually branch here.
        if b.used_exc {
            b.builder.switch_to_block(exc_block);
            let fault_pc = b.builder.use_var(cur_pc);
            b.store_field(fault_pc, CIA_OFF);
            let nia = b.builder.ins().iadd_imm(fault_pc, 4);
            b.store_field(nia, NIA_OFF);
            let c = b.builder.use_var(count);
            b.builder.ins().return_(&[c]);
        }

        b.builder.seal_all_blocks();
        b.builder.finalize();
        result
    };

    let id = module
        .declare_function(&format!("block_{pc:x}"), Linkage::Export, &ctx.func.signature)
        .map_err(|e| e.to_string())?;
    module
        .define_function(id, &mut ctx)
        .map_err(|e| e.to_string())?;
    module.clear_context(&mut ctx);
    module
        .finalize_definitions()
        .map_err(|e| e.to_string())?;

    // SAFETY: the signature matches Entry by construction.
    let entry =
        unsafe { std::mem::transmute::<*const u8, Entry>(module.get_finalized_function(id)) };

    tracing::debug!(target: "jit", "compiled block 0x{:x}-0x{:x} ({:?})", pc, end, exit);
    Ok(Some(JitBlock {
        start: pc,
        end,
        exit,
        generation,
        entry,
        module: Some(module),
    }))
}

/// Emit IR for instructions from `pc` until a block ender. Returns
/// `Ok(None)` when even the first instruction is unsupported.
fn translate_block(
    b: &mut BlockBuilder<'_>,
    start_pc: u64,
    real: u64,
    env: &ExecEnv,
) -> Result<Option<(u64, ExitKind)>, String> {
    let mut pc = start_pc;
    let page_end = (real & !(PAGE_SIZE - 1)) + PAGE_SIZE;

    for i in 0..BLOCK_LIMIT {
        let cur_real = real + (pc - start_pc);
        if cur_real >= page_end {
            b.exit_to_const(pc);
            return Ok(Some((pc, ExitKind::Fallthrough)));
        }
        let instr = env.space.read_be32(cur_real);

        // Retired count is bumped up front; a faulting access thus
        // bills its own instruction, which only skews the timebase.
        b.bump_count();
        match emit_instruction(b, pc, instr) {
            Emitted::Ok => {
                pc = pc.wrapping_add(4);
            }
            Emitted::Branch(kind) => {
                return Ok(Some((pc, kind)));
            }
            Emitted::Unsupported => {
                b.unbump_count();
                if i == 0 {
                    return Ok(None);
                }
                b.exit_to_const(pc);
                return Ok(Some((pc, ExitKind::Fallthrough)));
            }
        }
    }
    b.exit_to_const(pc);
    Ok(Some((pc, ExitKind::Fallthrough)))
}

enum Emitted {
    Ok,
    Branch(ExitKind),
    Unsupported,
}

/// Emit one guest instruction; branches terminate the function.
fn emit_instruction(b: &mut BlockBuilder<'_>, pc: u64, instr: u32) -> Emitted {
    let decoded = PpcDecoder::decode(instr);
    match decoded.op {
        14 | 15 => {
            // addi / addis
            let (rt, ra, d) = PpcDecoder::d_form(instr);
            let imm = if decoded.op == 15 {
                (d as i64) << 16
            } else {
                d as i64
            };
            let value = if ra == 0 {
                b.ins().iconst(types::I64, imm)
            } else {
                let base = b.load_gpr(ra);
                b.ins().iadd_imm(base, imm)
            };
            b.store_gpr(rt, value);
            Emitted::Ok
        }
        24 | 25 | 26 | 27 => {
            // ori / oris / xori / xoris
            let (rs, ra, d) = PpcDecoder::d_form(instr);
            let imm = if decoded.op & 1 == 1 {
                ((d as u16 as u64) << 16) as i64
            } else {
                d as u16 as i64
            };
            let src = b.load_gpr(rs);
            let value = if decoded.op < 26 {
                b.ins().bor_imm(src, imm)
            } else {
                b.ins().bxor_imm(src, imm)
            };
            b.store_gpr(ra, value);
            Emitted::Ok
        }
        28 | 29 => {
            // andi. / andis.
            let (rs, ra, d) = PpcDecoder::d_form(instr);
            let imm = if decoded.op == 29 {
                ((d as u16 as u64) << 16) as i64
            } else {
                d as u16 as i64
            };
            let src = b.load_gpr(rs);
            let value = b.ins().band_imm(src, imm);
            b.store_gpr(ra, value);
            b.set_cr0(value);
            Emitted::Ok
        }
        10 | 11 => {
            // cmpli / cmpi against an immediate
            let (rt, ra, d) = PpcDecoder::d_form(instr);
            let bf = (rt >> 2) as usize & 7;
            let signed = decoded.op == 11;
            let a = b.load_gpr(ra);
            let imm = if signed {
                b.ins().iconst(types::I64, d as i64)
            } else {
                b.ins().iconst(types::I64, d as u16 as i64)
            };
            b.set_cr_compare(bf, a, imm, signed);
            Emitted::Ok
        }
        21 => {
            // rlwinm
            let (rs, ra, sh, mb, me, rc) = PpcDecoder::m_form(instr);
            let src = b.load_gpr(rs);
            let w = b.ins().band_imm(src, 0xFFFF_FFFF);
            let hi = b.ins().ishl_imm(w, 32);
            let doubled = b.ins().bor(hi, w);
            let rotated = b.ins().rotl_imm(doubled, sh as i64);
            let mask = crate::instructions::integer::mask64(mb as u32 + 32, me as u32 + 32);
            let value = b.ins().band_imm(rotated, mask as i64);
            b.store_gpr(ra, value);
            if rc {
                b.set_cr0(value);
            }
            Emitted::Ok
        }
        30 if decoded.form == InstructionForm::MD && decoded.xo <= 1 => {
            // rldicl / rldicr
            let (rs, ra, sh, m, rc) = PpcDecoder::md_form(instr);
            let src = b.load_gpr(rs);
            let rotated = b.ins().rotl_imm(src, sh as i64);
            let mask = if decoded.xo == 0 {
                crate::instructions::integer::mask64(m as u32, 63)
            } else {
                crate::instructions::integer::mask64(0, m as u32)
            };
            let value = b.ins().band_imm(rotated, mask as i64);
            b.store_gpr(ra, value);
            if rc {
                b.set_cr0(value);
            }
            Emitted::Ok
        }
        31 => emit_op31(b, pc, instr, decoded.form),
        32 | 34 | 40 => {
            // lwz / lbz / lhz
            let (rt, ra, d) = PpcDecoder::d_form(instr);
            let width = match decoded.op {
                34 => 1,
                40 => 2,
                _ => 4,
            };
            let ea = b.emit_ea_d(ra, d as i64);
            let value = b.emit_load(pc, ea, width);
            b.store_gpr(rt, value);
            Emitted::Ok
        }
        58 if instr & 3 == 0 => {
            // ld
            let (rt, ra, ds) = PpcDecoder::ds_form(instr);
            let ea = b.emit_ea_d(ra, ds as i64);
            let value = b.emit_load(pc, ea, 8);
            b.store_gpr(rt, value);
            Emitted::Ok
        }
        36 | 38 | 44 => {
            // stw / stb / sth
            let (rs, ra, d) = PpcDecoder::d_form(instr);
            let width = match decoded.op {
                38 => 1,
                44 => 2,
                _ => 4,
            };
            let ea = b.emit_ea_d(ra, d as i64);
            let value = b.load_gpr(rs);
            b.emit_store(pc, ea, width, value);
            Emitted::Ok
        }
        62 if instr & 3 == 0 => {
            // std
            let (rs, ra, ds) = PpcDecoder::ds_form(instr);
            let ea = b.emit_ea_d(ra, ds as i64);
            let value = b.load_gpr(rs);
            b.emit_store(pc, ea, 8, value);
            Emitted::Ok
        }
        18 => {
            // b / bl: direct target known at compile time
            let (li, aa, lk) = PpcDecoder::i_form(instr);
            if lk {
                let ret = b.ins().iconst(types::I64, (pc + 4) as i64);
                b.store_field(ret, LR_OFF);
            }
            let target = if aa {
                li as i64 as u64
            } else {
                pc.wrapping_add(li as i64 as u64)
            };
            b.exit_to_const(target);
            Emitted::Branch(ExitKind::DirectBranch)
        }
        16 => {
            // bc
            let (bo, bi, bd, aa, lk) = PpcDecoder::b_form(instr);
            if lk {
                let ret = b.ins().iconst(types::I64, (pc + 4) as i64);
                b.store_field(ret, LR_OFF);
            }
            let taken = b.emit_branch_cond(bo, bi, true);
            let taken_block = b.builder.create_block();
            let fall_block = b.builder.create_block();
            b.builder
                .ins()
                .brif(taken, taken_block, &[], fall_block, &[]);
            b.builder.switch_to_block(taken_block);
            b.builder.seal_block(taken_block);
            let target = if aa {
                bd as i64 as u64
            } else {
                pc.wrapping_add(bd as i64 as u64)
            };
            b.exit_to_const(target);
            b.builder.switch_to_block(fall_block);
            b.builder.seal_block(fall_block);
            b.exit_to_const(pc.wrapping_add(4));
            Emitted::Branch(ExitKind::DirectBranch)
        }
        19 if decoded.xo == 16 || decoded.xo == 528 => {
            // bclr / bcctr
            let bo = ((instr >> 21) & 0x1F) as u8;
            let bi = ((instr >> 16) & 0x1F) as u8;
            let lk = instr & 1 != 0;
            let is_lr = decoded.xo == 16;
            let target_src = if is_lr {
                b.load_field(types::I64, LR_OFF)
            } else {
                b.load_field(types::I64, CTR_OFF)
            };
            let target = b.ins().band_imm(target_src, !3i64);
            if lk {
                let ret = b.ins().iconst(types::I64, (pc + 4) as i64);
                b.store_field(ret, LR_OFF);
            }
            let taken = b.emit_branch_cond(bo, bi, is_lr);
            let taken_block = b.builder.create_block();
            let fall_block = b.builder.create_block();
            b.builder
                .ins()
                .brif(taken, taken_block, &[], fall_block, &[]);
            b.builder.switch_to_block(taken_block);
            b.builder.seal_block(taken_block);
            b.exit_to(target);
            b.builder.switch_to_block(fall_block);
            b.builder.seal_block(fall_block);
            b.exit_to_const(pc.wrapping_add(4));
            Emitted::Branch(ExitKind::Indirect)
        }
        _ => Emitted::Unsupported,
    }
}

/// The primary-31 subset the emitter knows
fn emit_op31(b: &mut BlockBuilder<'_>, _pc: u64, instr: u32, form: InstructionForm) -> Emitted {
    if form == InstructionForm::XO {
        let (rt, ra, rb, oe, rc) = PpcDecoder::xo_form(instr);
        if oe {
            // OV tracking is left to the interpreter
            return Emitted::Unsupported;
        }
        let xo = ((instr >> 1) & 0x1FF) as u16;
        let value = match xo {
            266 => {
                let a = b.load_gpr(ra);
                let v = b.load_gpr(rb);
                b.ins().iadd(a, v)
            }
            40 => {
                let a = b.load_gpr(ra);
                let v = b.load_gpr(rb);
                b.ins().isub(v, a)
            }
            104 => {
                let a = b.load_gpr(ra);
                b.ins().ineg(a)
            }
            _ => return Emitted::Unsupported,
        };
        b.store_gpr(rt, value);
        if rc {
            b.set_cr0(value);
        }
        return Emitted::Ok;
    }
    if form != InstructionForm::X && form != InstructionForm::XFX {
        return Emitted::Unsupported;
    }
    let xo = ((instr >> 1) & 0x3FF) as u16;
    match xo {
        0 | 32 => {
            // cmp / cmpl
            let (rt, ra, rb, _) = PpcDecoder::x_form(instr);
            let bf = (rt >> 2) as usize & 7;
            let a = b.load_gpr(ra);
            let v = b.load_gpr(rb);
            b.set_cr_compare(bf, a, v, xo == 0);
            Emitted::Ok
        }
        28 | 444 | 316 | 476 | 124 | 60 | 412 | 284 => {
            let (rs, ra, rb, rc) = PpcDecoder::x_form(instr);
            let a = b.load_gpr(rs);
            let v = b.load_gpr(rb);
            let value = match xo {
                28 => b.ins().band(a, v),
                444 => b.ins().bor(a, v),
                316 => b.ins().bxor(a, v),
                476 => {
                    let x = b.ins().band(a, v);
                    b.ins().bnot(x)
                }
                124 => {
                    let x = b.ins().bor(a, v);
                    b.ins().bnot(x)
                }
                60 => {
                    let nv = b.ins().bnot(v);
                    b.ins().band(a, nv)
                }
                412 => {
                    let nv = b.ins().bnot(v);
                    b.ins().bor(a, nv)
                }
                _ => {
                    let x = b.ins().bxor(a, v);
                    b.ins().bnot(x)
                }
            };
            b.store_gpr(ra, value);
            if rc {
                b.set_cr0(value);
            }
            Emitted::Ok
        }
        339 => {
            // mfspr for LR/CTR/XER only
            let (rt, _, _, _) = PpcDecoder::x_form(instr);
            let n = PpcDecoder::spr_number(instr);
            let off = match n {
                1 => XER_OFF,
                8 => LR_OFF,
                9 => CTR_OFF,
                _ => return Emitted::Unsupported,
            };
            let value = b.load_field(types::I64, off);
            b.store_gpr(rt, value);
            Emitted::Ok
        }
        467 => {
            let (rs, _, _, _) = PpcDecoder::x_form(instr);
            let n = PpcDecoder::spr_number(instr);
            let off = match n {
                1 => XER_OFF,
                8 => LR_OFF,
                9 => CTR_OFF,
                _ => return Emitted::Unsupported,
            };
            let value = b.load_gpr(rs);
            b.store_field(value, off);
            Emitted::Ok
        }
        _ => Emitted::Unsupported,
    }
}
