//! Xenon SOC: three cores, six hardware threads, shared uncore
//!
//! Owns the address space, interrupt controller, timebase, JIT cache
//! and the per-core shared state, spawns one host worker per hardware
//! thread and tears everything down within the shutdown grace window.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ox_core::config::Config;
use ox_core::error::{EmulatorError, Result};
use ox_core::signals::{SystemSignals, SHUTDOWN_GRACE};
use ox_memory::constants::{HW_THREAD_COUNT, IIC_BASE, IIC_SIZE};
use ox_memory::{AddressSpace, DeviceInfo};

use crate::efuse::Efuses;
use crate::iic::{Iic, IicMmio};
use crate::interpreter::{ExecEnv, PpcInterpreter};
use crate::jit::JitCache;
use crate::mmu::TranslationSync;
use crate::ppu::{Ppu, PpuThread};
use crate::state::PpuCoreState;
use crate::thread::{Msr, PpuThreadState};
use crate::timebase::TimeBase;

/// Processor version reported by PVR
pub const PVR_XENON: u32 = 0x0071_0200;

/// Reset vector: thread 0 starts fetching here
pub const RESET_VECTOR: u64 = 0x100;

/// Number of physical cores
pub const CORE_COUNT: usize = 3;

/// The SOC.
pub struct Xenon {
    space: Arc<AddressSpace>,
    iic: Arc<Iic>,
    timebase: Arc<TimeBase>,
    sync: Arc<TranslationSync>,
    jit: Option<Arc<JitCache>>,
    signals: Arc<SystemSignals>,
    cores: Vec<Arc<PpuCoreState>>,
    fuses: Efuses,
    /// Threads not yet handed to workers
    parked: Vec<PpuThread>,
    workers: Vec<JoinHandle<()>>,
}

impl Xenon {
    pub fn new(config: &Config, signals: Arc<SystemSignals>) -> Result<Self> {
        let space = AddressSpace::new(config.memory.ram_size);
        let iic = Iic::new();
        let timebase = Arc::new(TimeBase::new());
        let sync = Arc::new(TranslationSync::new());
        let jit = config
            .cpu
            .jit_enabled
            .then(|| JitCache::new(config.cpu.jit_threshold, config.cpu.jit_cache_blocks));

        let fuses = match &config.system.fuses_path {
            Some(path) => Efuses::from_file(path).map_err(EmulatorError::Io)?,
            None => Efuses::zeroed(),
        };
        tracing::info!(
            "eFuses: console type 0x{:x}, lockdown counter {}",
            fuses.console_type(),
            fuses.lockdown_counter()
        );

        let cores: Vec<Arc<PpuCoreState>> = (0..CORE_COUNT as u32)
            .map(|id| Arc::new(PpuCoreState::new(id)))
            .collect();

        // The IIC register window is an SOC device
        space.register_device(
            DeviceInfo {
                name: "IIC".into(),
                start: IIC_BASE,
                end: IIC_BASE + IIC_SIZE - 1,
                soc_device: true,
            },
            Arc::new(parking_lot::Mutex::new(IicMmio::new(
                Arc::clone(&iic),
                IIC_BASE,
            ))),
        )?;

        let mut parked = Vec::with_capacity(HW_THREAD_COUNT);
        for tid in 0..HW_THREAD_COUNT {
            let core = Arc::clone(&cores[tid / 2]);
            let mut thread = PpuThread::new(tid, core);
            thread.jit_watch = jit.clone();
            // Thread 0 boots at the reset vector in hypervisor real
            // mode; the rest stay halted until an IPI wakes them.
            if tid == 0 {
                thread.regs.cia = RESET_VECTOR;
                thread.regs.nia = RESET_VECTOR + 4;
                thread.regs.msr = (Msr::SF | Msr::HV).bits();
                thread.state = PpuThreadState::Running;
            }
            parked.push(thread);
        }

        Ok(Self {
            space,
            iic,
            timebase,
            sync,
            jit,
            signals,
            cores,
            fuses,
            parked,
            workers: Vec::new(),
        })
    }

    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    pub fn iic(&self) -> &Arc<Iic> {
        &self.iic
    }

    pub fn fuses(&self) -> &Efuses {
        &self.fuses
    }

    pub fn core(&self, index: usize) -> &Arc<PpuCoreState> {
        &self.cores[index]
    }

    fn make_env(&self) -> ExecEnv {
        ExecEnv {
            space: Arc::clone(&self.space),
            sync: Arc::clone(&self.sync),
            timebase: Arc::clone(&self.timebase),
            jit: self.jit.clone(),
        }
    }

    /// Spawn one host worker per hardware thread.
    pub fn start(&mut self) {
        let threads = std::mem::take(&mut self.parked);
        for thread in threads {
            let tid = thread.thread_id;
            let interpreter = Arc::new(PpcInterpreter::new(self.make_env()));
            let jit = self.jit.clone();
            let iic = Arc::clone(&self.iic);
            let signals = Arc::clone(&self.signals);
            let handle = std::thread::Builder::new()
                .name(format!("ppu{tid}"))
                .spawn(move || {
                    let mut ppu = Ppu::new(thread, interpreter, jit, iic, signals);
                    ppu.run();
                })
                .expect("spawning a PPU worker cannot fail");
            self.workers.push(handle);
        }
        tracing::info!("Xenon: {} hardware threads running", HW_THREAD_COUNT);
    }

    /// Request shutdown and join the workers within the grace window.
    pub fn shutdown(&mut self) {
        self.signals.request_shutdown();
        self.iic.wake_all();

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while let Some(handle) = self.workers.pop() {
            if handle.is_finished() || Instant::now() < deadline {
                if handle.join().is_err() {
                    tracing::error!("a PPU worker panicked during shutdown");
                }
            } else {
                tracing::error!("PPU worker did not drain within the grace window");
                break;
            }
        }
    }

    /// Single-step support for integration tests: drive one thread
    /// without spawning workers.
    pub fn take_thread(&mut self, tid: usize) -> Option<(PpuThread, ExecEnv)> {
        let pos = self.parked.iter().position(|t| t.thread_id == tid)?;
        let thread = self.parked.remove(pos);
        Some((thread, self.make_env()))
    }

    /// Pause helpers mirroring the emulator state machine
    pub fn pause(&self) {
        self.signals.pause();
    }

    pub fn resume(&self) {
        self.signals.resume();
    }

    /// Park the calling thread until shutdown is requested.
    pub fn wait_for_shutdown(&self) {
        while self.signals.is_running() {
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soc_construction() {
        let config = Config::default();
        let signals = SystemSignals::new();
        let xenon = Xenon::new(&config, signals).unwrap();
        assert_eq!(xenon.cores.len(), CORE_COUNT);
        assert_eq!(xenon.parked.len(), HW_THREAD_COUNT);
        assert_eq!(xenon.core(0).sprs.read().pvr, PVR_XENON);
    }

    #[test]
    fn test_boot_state() {
        let config = Config::default();
        let signals = SystemSignals::new();
        let mut xenon = Xenon::new(&config, signals).unwrap();

        let (t0, _) = xenon.take_thread(0).unwrap();
        assert_eq!(t0.regs.cia, RESET_VECTOR);
        assert_eq!(t0.state, PpuThreadState::Running);
        assert!(t0.regs.msr_has(Msr::HV));

        let (t3, _) = xenon.take_thread(3).unwrap();
        assert_eq!(t3.state, PpuThreadState::Halted);
        assert_eq!(t3.regs.spr.pir, 3);
    }

    #[test]
    fn test_start_and_shutdown_drains() {
        let mut config = Config::default();
        config.memory.ram_size = 0x10_0000;
        // Interpreter-only keeps the test light
        config.cpu.jit_enabled = false;
        let signals = SystemSignals::new();
        let mut xenon = Xenon::new(&config, Arc::clone(&signals)).unwrap();

        // Park thread 0 too so the workers spin on empty RAM briefly
        xenon.start();
        std::thread::sleep(Duration::from_millis(20));
        xenon.shutdown();
        assert!(!signals.is_running());
        assert!(xenon.workers.is_empty());
    }
}
