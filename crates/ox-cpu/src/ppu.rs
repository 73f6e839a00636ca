//! Per-hardware-thread execution driver

use std::sync::Arc;
use std::time::Duration;

use ox_core::SystemSignals;
use ox_memory::constants::PAGE_SIZE;
use ox_memory::AddressSpace;

use crate::exception::Exception;
use crate::iic::Iic;
use crate::interpreter::PpcInterpreter;
use crate::jit::{BlockExit, JitCache, JitTlb};
use crate::mmu::{Access, Mmu};
use crate::state::PpuCoreState;
use crate::thread::{Msr, PpuThreadRegisters, PpuThreadState};
use crate::timebase::Decrementer;

/// How long parked threads sleep between wake checks
const PARK_INTERVAL: Duration = Duration::from_millis(1);

/// One hardware thread: registers, MMU and run mode.
pub struct PpuThread {
    pub thread_id: usize,
    pub regs: PpuThreadRegisters,
    pub mmu: Mmu,
    pub dec: Decrementer,
    pub state: PpuThreadState,
    /// Fast-path load translation cache used by emitted code
    pub jit_tlb: Box<JitTlb>,
    /// Block cache to notify about stores into code pages
    pub jit_watch: Option<Arc<JitCache>>,
}

impl PpuThread {
    pub fn new(thread_id: usize, core: Arc<PpuCoreState>) -> Self {
        let mut regs = PpuThreadRegisters::default();
        regs.spr.pir = thread_id as u32;
        Self {
            thread_id,
            regs,
            mmu: Mmu::new(core),
            dec: Decrementer::default(),
            state: PpuThreadState::Halted,
            jit_tlb: Box::new(JitTlb::new()),
            jit_watch: None,
        }
    }

    /// Standalone thread on a fresh core, for unit tests
    pub fn for_tests(thread_id: usize) -> Self {
        let mut t = Self::new(thread_id, Arc::new(PpuCoreState::new(0)));
        t.state = PpuThreadState::Running;
        t
    }

    /// Translate a data access without performing it
    pub fn translate_data(
        &mut self,
        space: &AddressSpace,
        ea: u64,
        write: bool,
    ) -> Result<u64, Exception> {
        let access = if write {
            Access::DataWrite
        } else {
            Access::DataRead
        };
        self.mmu.translate(&self.regs, space, ea, access)
    }

    /// MMU-checked read; accesses crossing a page boundary translate
    /// each page separately.
    pub fn read_data(
        &mut self,
        space: &AddressSpace,
        ea: u64,
        buf: &mut [u8],
    ) -> Result<(), Exception> {
        let mut done = 0usize;
        while done < buf.len() {
            let cur = ea.wrapping_add(done as u64);
            let page_left = (PAGE_SIZE - (cur & (PAGE_SIZE - 1))) as usize;
            let chunk = (buf.len() - done).min(page_left);
            let ra = self.mmu.translate(&self.regs, space, cur, Access::DataRead)?;
            space.read(ra, &mut buf[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// MMU-checked write; the physical layer invalidates overlapping
    /// reservations after each chunk commits.
    pub fn write_data(
        &mut self,
        space: &AddressSpace,
        ea: u64,
        data: &[u8],
    ) -> Result<(), Exception> {
        let mut done = 0usize;
        while done < data.len() {
            let cur = ea.wrapping_add(done as u64);
            let page_left = (PAGE_SIZE - (cur & (PAGE_SIZE - 1))) as usize;
            let chunk = (data.len() - done).min(page_left);
            let ra = self
                .mmu
                .translate(&self.regs, space, cur, Access::DataWrite)?;
            space.write(ra, &data[done..done + chunk]);
            if let Some(jit) = self.jit_watch.clone() {
                jit.note_store(ra);
            }
            done += chunk;
        }
        Ok(())
    }

    pub fn read_u8(&mut self, space: &AddressSpace, ea: u64) -> Result<u8, Exception> {
        let mut b = [0u8; 1];
        self.read_data(space, ea, &mut b)?;
        Ok(b[0])
    }

    pub fn read_u16(&mut self, space: &AddressSpace, ea: u64) -> Result<u16, Exception> {
        let mut b = [0u8; 2];
        self.read_data(space, ea, &mut b)?;
        Ok(u16::from_be_bytes(b))
    }

    pub fn read_u32(&mut self, space: &AddressSpace, ea: u64) -> Result<u32, Exception> {
        let mut b = [0u8; 4];
        self.read_data(space, ea, &mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    pub fn read_u64(&mut self, space: &AddressSpace, ea: u64) -> Result<u64, Exception> {
        let mut b = [0u8; 8];
        self.read_data(space, ea, &mut b)?;
        Ok(u64::from_be_bytes(b))
    }

    pub fn write_u8(&mut self, space: &AddressSpace, ea: u64, v: u8) -> Result<(), Exception> {
        self.write_data(space, ea, &[v])
    }

    pub fn write_u16(&mut self, space: &AddressSpace, ea: u64, v: u16) -> Result<(), Exception> {
        self.write_data(space, ea, &v.to_be_bytes())
    }

    pub fn write_u32(&mut self, space: &AddressSpace, ea: u64, v: u32) -> Result<(), Exception> {
        self.write_data(space, ea, &v.to_be_bytes())
    }

    pub fn write_u64(&mut self, space: &AddressSpace, ea: u64, v: u64) -> Result<(), Exception> {
        self.write_data(space, ea, &v.to_be_bytes())
    }

    /// Record the exception state and redirect to its vector.
    ///
    /// SRR0 takes the resume address, SRR1 the old MSR plus cause bits;
    /// the new MSR drops translation, external interrupts and problem
    /// state; CIA jumps to the fixed offset.
    pub fn deliver_exception(&mut self, exc: Exception) {
        let regs = &mut self.regs;
        let resume = if exc.resumes_after() {
            regs.nia
        } else {
            regs.cia
        };
        let mut srr1 = regs.msr;
        match exc {
            Exception::DataStorage { addr, dsisr } => {
                regs.spr.dar = addr;
                regs.spr.dsisr = dsisr;
            }
            Exception::DataSegment { addr } => {
                regs.spr.dar = addr;
            }
            Exception::InstStorage { srr1: cause } => {
                srr1 |= cause;
            }
            Exception::Program { cause } => {
                srr1 |= cause.srr1_bit();
            }
            _ => {}
        }
        regs.spr.srr0 = resume;
        regs.spr.srr1 = srr1;

        let keep = Msr::SF | Msr::HV | Msr::ME;
        regs.msr &= keep.bits();
        regs.msr |= (Msr::SF | Msr::HV).bits();

        regs.cia = exc.vector();
        regs.nia = regs.cia.wrapping_add(4);

        tracing::trace!(
            target: "ppu",
            "thread {}: {:?} -> vector 0x{:x}, srr0 0x{:016x}",
            self.thread_id,
            exc,
            exc.vector(),
            resume
        );
    }
}

/// The architectural fetch-execute loop for one hardware thread.
pub struct Ppu {
    pub thread: PpuThread,
    interpreter: Arc<PpcInterpreter>,
    jit: Option<Arc<JitCache>>,
    iic: Arc<Iic>,
    signals: Arc<SystemSignals>,
}

impl Ppu {
    pub fn new(
        thread: PpuThread,
        interpreter: Arc<PpcInterpreter>,
        jit: Option<Arc<JitCache>>,
        iic: Arc<Iic>,
        signals: Arc<SystemSignals>,
    ) -> Self {
        Self {
            thread,
            interpreter,
            jit,
            iic,
            signals,
        }
    }

    /// Drive the thread until global shutdown.
    pub fn run(&mut self) {
        tracing::debug!(target: "ppu", "thread {} starting", self.thread.thread_id);
        while self.signals.is_running() {
            self.step_boundary();
        }
        tracing::debug!(target: "ppu", "thread {} drained", self.thread.thread_id);
    }

    /// One architectural boundary: deliver interrupts, then fetch and
    /// execute through the JIT or the interpreter.
    pub fn step_boundary(&mut self) {
        self.signals.wait_if_paused();
        if !self.signals.is_running() {
            return;
        }

        let t = &mut self.thread;
        let tid = t.thread_id;

        // Catch up with translation invalidations from other threads
        if t.mmu.sync_generation(&self.interpreter.env().sync, tid) {
            t.jit_tlb.clear();
        }

        // Asynchronous interrupts, in architectural priority order.
        // Delivery consumes the boundary; execution resumes at the
        // vector on the next one.
        let ee = t.regs.msr_has(Msr::EE);
        if ee && self.iic.deliverable(tid) {
            if t.state != PpuThreadState::Running {
                t.state = PpuThreadState::Running;
            }
            t.regs.nia = t.regs.cia;
            t.deliver_exception(Exception::External);
            return;
        } else if ee && t.dec.pending {
            t.dec.take_pending();
            t.regs.nia = t.regs.cia;
            t.deliver_exception(Exception::Decrementer);
            return;
        }

        match t.state {
            PpuThreadState::Halted => {
                if self.iic.deliverable(tid) {
                    // An IPI enables a stopped thread; it comes up at
                    // the reset vector in hypervisor real mode.
                    t.state = PpuThreadState::Running;
                    t.regs.msr = (Msr::SF | Msr::HV).bits();
                    t.deliver_exception(Exception::SystemReset);
                    return;
                }
                self.iic.wait_for_interrupt(tid, PARK_INTERVAL);
                return;
            }
            PpuThreadState::Napping => {
                if !self.iic.deliverable(tid) {
                    self.iic.wait_for_interrupt(tid, PARK_INTERVAL);
                    // Credit nap time to the timebase and decrementer
                    self.interpreter.env().timebase.advance(64);
                    t.dec.tick(&mut t.regs.spr.dec, 64);
                    return;
                }
                t.state = PpuThreadState::Running;
            }
            PpuThreadState::Running => {}
        }

        // Instruction fetch
        let env = self.interpreter.env();
        let real = match t
            .mmu
            .translate(&t.regs, &env.space, t.regs.cia, Access::IFetch)
        {
            Ok(ra) => ra,
            Err(exc) => {
                t.deliver_exception(exc);
                return;
            }
        };

        // Try the block cache first, then fall back to one interpreted
        // instruction (which also profiles the PC for compilation).
        let fetch_pc = t.regs.cia;
        let mut executed = 1u32;
        let mut ran_jit = false;
        if let Some(jit) = &self.jit {
            if let Some(exit) = jit.try_run(t, env, real) {
                ran_jit = true;
                match exit {
                    BlockExit::Exception(exc) => t.deliver_exception(exc),
                    BlockExit::Continue { instructions } => executed = instructions,
                }
            }
        }
        if !ran_jit {
            let instr = env.space.read_be32(real);
            if let Err(exc) = self.interpreter.execute(t, instr) {
                t.deliver_exception(exc);
                return;
            }
            if let Some(jit) = &self.jit {
                jit.profile(fetch_pc, real, &t.regs, env);
            }
        }

        // Single-step trace fires after a completed instruction
        if t.regs.msr_has(Msr::SE) {
            t.deliver_exception(Exception::Trace);
        }

        env.timebase.advance(executed as u64);
        t.dec.tick(&mut t.regs.spr.dec, executed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deliver_dsi_sets_dar_and_vector() {
        let mut t = PpuThread::for_tests(0);
        t.regs.cia = 0x1000;
        t.regs.nia = 0x1004;
        t.regs.msr = (Msr::SF | Msr::EE | Msr::DR | Msr::IR).bits();

        t.deliver_exception(Exception::DataStorage {
            addr: 0x8000_0000_0000,
            dsisr: crate::exception::DSISR_NOT_FOUND,
        });

        assert_eq!(t.regs.cia, 0x300);
        assert_eq!(t.regs.spr.srr0, 0x1000);
        assert_eq!(t.regs.spr.dar, 0x8000_0000_0000);
        assert_eq!(t.regs.spr.dsisr, crate::exception::DSISR_NOT_FOUND);
        // Old MSR preserved in SRR1, translation off in the new MSR
        assert_ne!(t.regs.spr.srr1 & Msr::DR.bits(), 0);
        assert_eq!(t.regs.msr & Msr::DR.bits(), 0);
        assert_eq!(t.regs.msr & Msr::EE.bits(), 0);
    }

    #[test]
    fn test_deliver_syscall_resumes_after() {
        let mut t = PpuThread::for_tests(0);
        t.regs.cia = 0x2000;
        t.regs.nia = 0x2004;
        t.deliver_exception(Exception::SystemCall);
        assert_eq!(t.regs.cia, 0xC00);
        assert_eq!(t.regs.spr.srr0, 0x2004);
    }
}
