//! End-to-end execution scenarios driving the core through the
//! interpreter, the JIT and the interrupt machinery.

use std::sync::Arc;

use ox_core::SystemSignals;
use ox_cpu::iic::{prio, Iic};
use ox_cpu::interpreter::{ExecEnv, PpcInterpreter};
use ox_cpu::jit::JitCache;
use ox_cpu::mmu::TranslationSync;
use ox_cpu::ppu::{Ppu, PpuThread};
use ox_cpu::thread::Msr;
use ox_cpu::timebase::TimeBase;
use ox_memory::AddressSpace;

// Instruction encoders, enough for the scenarios

fn addi(rt: u32, ra: u32, imm: i16) -> u32 {
    (14 << 26) | (rt << 21) | (ra << 16) | (imm as u16 as u32)
}

fn add(rt: u32, ra: u32, rb: u32) -> u32 {
    (31 << 26) | (rt << 21) | (ra << 16) | (rb << 11) | (266 << 1)
}

fn lwz(rt: u32, ra: u32, d: i16) -> u32 {
    (32 << 26) | (rt << 21) | (ra << 16) | (d as u16 as u32)
}

fn stw(rs: u32, ra: u32, d: i16) -> u32 {
    (36 << 26) | (rs << 21) | (ra << 16) | (d as u16 as u32)
}

fn lwarx(rt: u32, ra: u32, rb: u32) -> u32 {
    (31 << 26) | (rt << 21) | (ra << 16) | (rb << 11) | (20 << 1)
}

fn stwcx(rs: u32, ra: u32, rb: u32) -> u32 {
    (31 << 26) | (rs << 21) | (ra << 16) | (rb << 11) | (150 << 1) | 1
}

/// bne to a relative displacement (CR0.EQ clear)
fn bne(bd: i16) -> u32 {
    (16 << 26) | (4 << 21) | (2 << 16) | ((bd as u16 as u32) & 0xFFFC)
}

fn rlwinm(ra: u32, rs: u32, sh: u32, mb: u32, me: u32) -> u32 {
    (21 << 26) | (rs << 21) | (ra << 16) | (sh << 11) | (mb << 6) | (me << 1)
}

fn nop() -> u32 {
    // ori r0, r0, 0
    24 << 26
}

fn write_program(space: &AddressSpace, at: u64, program: &[u32]) {
    for (i, instr) in program.iter().enumerate() {
        space.write_be32(at + i as u64 * 4, *instr);
    }
}

fn make_env(space: &Arc<AddressSpace>, jit: Option<Arc<JitCache>>) -> ExecEnv {
    ExecEnv {
        space: Arc::clone(space),
        sync: Arc::new(TranslationSync::new()),
        timebase: Arc::new(TimeBase::new()),
        jit,
    }
}

fn interpreter(space: &Arc<AddressSpace>) -> PpcInterpreter {
    PpcInterpreter::new(make_env(space, None))
}

#[test]
fn test_arith_sequence_from_reset() {
    let space = AddressSpace::new(0x10_0000);
    let interp = interpreter(&space);
    // addi r3, 0, 5; addi r4, 0, 7; add r5, r3, r4
    write_program(&space, 0x100, &[addi(3, 0, 5), addi(4, 0, 7), add(5, 3, 4)]);

    let mut t = PpuThread::for_tests(0);
    t.regs.cia = 0x100;
    t.regs.msr = 0;

    for _ in 0..3 {
        interp.step(&mut t).unwrap();
    }
    assert_eq!(t.regs.gpr[3], 5);
    assert_eq!(t.regs.gpr[4], 7);
    assert_eq!(t.regs.gpr[5], 12);
    assert_eq!(t.regs.cia, 0x10C);
}

#[test]
fn test_lwarx_stwcx_exclusivity() {
    let space = AddressSpace::new(0x10_0000);
    space.write_be32(0x2000, 0);
    let program = [lwarx(3, 0, 4), stwcx(5, 0, 4), bne(-8)];
    write_program(&space, 0x1000, &program);
    write_program(&space, 0x3000, &program);

    let barrier = Arc::new(std::sync::Barrier::new(2));
    let mut handles = Vec::new();
    for (tid, base, value) in [(0usize, 0x1000u64, 5u64), (1, 0x3000, 9)] {
        let space = Arc::clone(&space);
        let barrier = Arc::clone(&barrier);
        handles.push(std::thread::spawn(move || {
            let interp = interpreter(&space);
            let mut t = PpuThread::for_tests(tid);
            t.regs.cia = base;
            t.regs.gpr[4] = 0x2000;
            t.regs.gpr[5] = value;
            barrier.wait();
            // Run until the stwcx. sticks (bne falls through)
            for _ in 0..10_000 {
                interp.step(&mut t).unwrap();
                if t.regs.cia == base + 12 {
                    return true;
                }
            }
            false
        }));
    }
    for handle in handles {
        assert!(handle.join().unwrap(), "a thread never won its stwcx.");
    }
    let result = space.read_be32(0x2000);
    assert!(result == 5 || result == 9, "memory holds 0x{result:x}");
}

#[test]
fn test_data_storage_fault_vectors_to_0x300() {
    let space = AddressSpace::new(0x10_0000);
    let interp = interpreter(&space);
    // Page table rooted at an empty region: every lookup misses
    let mut t = PpuThread::for_tests(0);
    t.mmu.core().sprs.write().sdr1 = 0x40_0000;
    t.regs.msr = Msr::DR.bits();
    t.regs.cia = 0x100;
    t.regs.gpr[4] = 0x0800_0000; // covered by SLB entry 0, unmapped page
    write_program(&space, 0x100, &[lwz(3, 4, 0)]);

    let err = interp.step(&mut t).unwrap_err();
    t.deliver_exception(err);

    assert_eq!(t.regs.cia, 0x300);
    assert_eq!(t.regs.spr.srr0, 0x100);
    assert_eq!(t.regs.spr.dar, 0x0800_0000);
    assert_ne!(t.regs.spr.dsisr & ox_cpu::exception::DSISR_NOT_FOUND, 0);
}

#[test]
fn test_slb_miss_vectors_to_0x380() {
    let space = AddressSpace::new(0x10_0000);
    let interp = interpreter(&space);
    let mut t = PpuThread::for_tests(0);
    t.regs.msr = Msr::DR.bits();
    t.regs.cia = 0x100;
    // No SLB entry covers this effective segment
    t.regs.gpr[4] = 0x8000_0000_0000;
    write_program(&space, 0x100, &[lwz(3, 4, 0)]);

    let err = interp.step(&mut t).unwrap_err();
    t.deliver_exception(err);
    assert_eq!(t.regs.cia, 0x380);
    assert_eq!(t.regs.spr.dar, 0x8000_0000_0000);
}

#[test]
fn test_decrementer_interrupt_after_countdown() {
    let space = AddressSpace::new(0x10_0000);
    let nops: Vec<u32> = (0..32).map(|_| nop()).collect();
    write_program(&space, 0x100, &nops);

    let interp = Arc::new(interpreter(&space));
    let iic = Iic::new();
    let signals = SystemSignals::new();
    let mut t = PpuThread::for_tests(0);
    t.regs.cia = 0x100;
    t.regs.msr = Msr::EE.bits();
    t.dec.write(&mut t.regs.spr.dec, 10);

    let mut ppu = Ppu::new(t, interp, None, iic, Arc::clone(&signals));
    for _ in 0..12 {
        ppu.step_boundary();
    }

    // Eleven nops retire (ticking DEC to -1), then delivery
    assert_eq!(ppu.thread.regs.cia, 0x900);
    assert_eq!(ppu.thread.regs.spr.srr0, 0x100 + 11 * 4);
    signals.request_shutdown();
}

#[test]
fn test_rotate_mask_extract() {
    let space = AddressSpace::new(0x1000);
    let interp = interpreter(&space);
    let mut t = PpuThread::for_tests(0);
    t.regs.cia = 0x100;
    t.regs.gpr[4] = 0x1234_5678;
    // Low nibble of the rotated value
    space.write_be32(0x100, rlwinm(3, 4, 4, 28, 31));
    interp.step(&mut t).unwrap();
    // rotl32(0x12345678, 4) = 0x23456781; & 0xF
    assert_eq!(t.regs.gpr[3], 0x1);

    // And without rotation the same mask picks the original low nibble
    t.regs.cia = 0x104;
    space.write_be32(0x104, rlwinm(6, 4, 0, 28, 31));
    interp.step(&mut t).unwrap();
    assert_eq!(t.regs.gpr[6], 0x8);
}

#[test]
fn test_external_interrupt_routing() {
    let space = AddressSpace::new(0x1_0000);
    let nops: Vec<u32> = (0..16).map(|_| nop()).collect();
    write_program(&space, 0x100, &nops);

    let iic = Iic::new();
    let signals = SystemSignals::new();

    let mut t0 = PpuThread::for_tests(0);
    t0.regs.cia = 0x100;
    t0.regs.msr = Msr::EE.bits();
    let mut t1 = PpuThread::for_tests(1);
    t1.regs.cia = 0x100;
    t1.regs.msr = Msr::EE.bits();

    iic.raise(0, prio::CLOCK, 5);

    let mut ppu0 = Ppu::new(
        t0,
        Arc::new(interpreter(&space)),
        None,
        Arc::clone(&iic),
        Arc::clone(&signals),
    );
    let mut ppu1 = Ppu::new(
        t1,
        Arc::new(interpreter(&space)),
        None,
        Arc::clone(&iic),
        Arc::clone(&signals),
    );

    for _ in 0..4 {
        ppu0.step_boundary();
        ppu1.step_boundary();
    }

    assert_eq!(ppu0.thread.regs.cia & !0xFF, 0x500 & !0xFF);
    assert_eq!(ppu0.thread.regs.spr.srr0, 0x100);
    // Thread 1 keeps executing nops undisturbed
    assert_ne!(ppu1.thread.regs.cia, 0x500);
    signals.request_shutdown();
}

#[test]
fn test_ipi_wakes_halted_thread_at_reset_vector() {
    let space = AddressSpace::new(0x1_0000);
    let iic = Iic::new();
    let signals = SystemSignals::new();

    let mut t = PpuThread::for_tests(1);
    t.state = ox_cpu::thread::PpuThreadState::Halted;
    t.regs.msr = 0;
    let mut ppu = Ppu::new(
        t,
        Arc::new(interpreter(&space)),
        None,
        Arc::clone(&iic),
        Arc::clone(&signals),
    );

    // Nothing pending: the thread stays parked
    ppu.step_boundary();
    assert_eq!(ppu.thread.state, ox_cpu::thread::PpuThreadState::Halted);

    iic.raise(1, prio::IPI, 0);
    ppu.step_boundary();
    assert_eq!(ppu.thread.state, ox_cpu::thread::PpuThreadState::Running);
    assert_eq!(ppu.thread.regs.cia, 0x100);
    assert!(ppu.thread.regs.msr & Msr::HV.bits() != 0);
    signals.request_shutdown();
}

#[test]
fn test_interpreter_jit_equivalence() {
    let space = AddressSpace::new(0x10_0000);
    let program = [
        addi(3, 0, 5),
        addi(4, 0, 7),
        add(5, 3, 4),
        rlwinm(6, 5, 4, 0, 31),
        stw(6, 0, 0x4000),
        lwz(7, 0, 0x4000),
        add(8, 7, 5) | 1, // add. records CR0
    ];
    write_program(&space, 0x1000, &program);

    // Reference run through the interpreter
    let interp = interpreter(&space);
    let mut ref_t = PpuThread::for_tests(0);
    ref_t.regs.cia = 0x1000;
    ref_t.regs.msr = Msr::SF.bits();
    for _ in 0..program.len() {
        interp.step(&mut ref_t).unwrap();
    }

    // JIT run: threshold 1 compiles on first profile
    let jit = JitCache::new(1, 1024);
    let env = make_env(&space, Some(Arc::clone(&jit)));
    let jit_interp = PpcInterpreter::new(make_env(&space, Some(Arc::clone(&jit))));
    let mut t = PpuThread::for_tests(0);
    t.regs.cia = 0x1000;
    t.regs.msr = Msr::SF.bits();

    // Profile the block, then execute it from a fresh state
    jit.profile(0x1000, 0x1000, &t.regs, &env);
    assert!(jit.block_count() > 0, "block did not compile");

    let mut steps = 0;
    while t.regs.cia < 0x1000 + program.len() as u64 * 4 {
        let cia = t.regs.cia;
        match jit.try_run(&mut t, &env, cia) {
            Some(ox_cpu::jit::BlockExit::Continue { .. }) => {}
            Some(ox_cpu::jit::BlockExit::Exception(e)) => panic!("unexpected exception {e:?}"),
            None => {
                let real = t.regs.cia;
                let instr = space.read_be32(real);
                jit_interp.execute(&mut t, instr).unwrap();
            }
        }
        steps += 1;
        assert!(steps < 100, "runaway execution");
    }

    // Bit-for-bit post-state agreement
    assert_eq!(t.regs.gpr, ref_t.regs.gpr);
    assert_eq!(t.regs.cr, ref_t.regs.cr);
    assert_eq!(t.regs.xer, ref_t.regs.xer);
    assert_eq!(t.regs.lr, ref_t.regs.lr);
    assert_eq!(t.regs.ctr, ref_t.regs.ctr);
    assert_eq!(t.regs.nia, ref_t.regs.nia);
}

#[test]
fn test_jit_branch_agreement() {
    let space = AddressSpace::new(0x10_0000);
    // Count down r3 from 3 with a bne loop over addi
    let program = [
        addi(3, 0, 3),
        addi(4, 0, 0),
        // loop: addi r4, r4, 1; addic. r3, r3, -1; bne loop
        addi(4, 4, 1),
        (13 << 26) | (3 << 21) | (3 << 16) | (-1i16 as u16 as u32), // addic. r3,r3,-1
        bne(-8),
    ];
    write_program(&space, 0x2000, &program);

    let run = |jit: Option<Arc<JitCache>>| -> ox_cpu::PpuThreadRegisters {
        let env = make_env(&space, jit.clone());
        let interp = PpcInterpreter::new(make_env(&space, jit.clone()));
        let mut t = PpuThread::for_tests(0);
        t.regs.cia = 0x2000;
        t.regs.msr = Msr::SF.bits();
        let mut steps = 0;
        while t.regs.cia < 0x2000 + program.len() as u64 * 4 {
            let cia = t.regs.cia;
            let ran = jit
                .as_ref()
                .and_then(|j| j.try_run(&mut t, &env, cia));
            match ran {
                Some(ox_cpu::jit::BlockExit::Continue { .. }) => {}
                Some(ox_cpu::jit::BlockExit::Exception(e)) => panic!("exception {e:?}"),
                None => {
                    let instr = space.read_be32(t.regs.cia);
                    let pc = t.regs.cia;
                    interp.execute(&mut t, instr).unwrap();
                    if let Some(j) = &jit {
                        j.profile(pc, pc, &t.regs, &env);
                    }
                }
            }
            steps += 1;
            assert!(steps < 1000);
        }
        t.regs
    };

    let reference = run(None);
    let jitted = run(Some(JitCache::new(1, 1024)));
    assert_eq!(jitted.gpr, reference.gpr);
    assert_eq!(jitted.cr, reference.cr);
    assert_eq!(jitted.xer, reference.xer);
    assert_eq!(reference.gpr[4], 3);
}
