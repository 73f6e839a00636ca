//! Software MMU: effective -> virtual -> real translation
//!
//! Per-thread state is the software TLB; the SLB and SDR1 live in the
//! core-shared block. The hashed page table is walked in guest RAM.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ox_memory::constants::HW_THREAD_COUNT;
use ox_memory::AddressSpace;

use crate::exception::{
    Exception, DSISR_NOT_FOUND, DSISR_PROTECTION, DSISR_STORE, SRR1_ISI_NOEXEC,
    SRR1_ISI_NOT_FOUND, SRR1_ISI_PROTECTION,
};
use crate::state::{PpuCoreState, SlbEntry};
use crate::thread::{Msr, PpuThreadRegisters};

/// Access kinds relevant to permission checking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    IFetch,
    DataRead,
    DataWrite,
}

/// Bits of real-mode effective addresses kept before HRMOR is applied
const REAL_MODE_MASK: u64 = 0x0000_03FF_FFFF_FFFF;

/// 28-bit segment offset
const SEGMENT_OFFSET_MASK: u64 = 0x0FFF_FFFF;

const PTE_VALID: u64 = 0x1;
const PTE_HASH: u64 = 0x2;
const PTE_LARGE: u64 = 0x4;
/// PTE low dword flag bits
const PTEL_PP_MASK: u64 = 0x3;
const PTEL_NX: u64 = 0x4;
const PTEL_WIMG_MASK: u64 = 0x78;

const SMALL_PAGE_SHIFT: u32 = 12;
const LARGE_PAGE_SHIFT: u32 = 24;

/// TLB geometry: direct-mapped sets with 4 ways
const TLB_SETS: usize = 128;
const TLB_WAYS: usize = 4;

#[derive(Debug, Clone, Copy, Default)]
struct TlbEntry {
    vpn: u64,
    rpn: u64,
    page_shift: u32,
    wimg: u8,
    pp: u8,
    ks: bool,
    kp: bool,
    no_exec: bool,
    valid: bool,
}

/// Global translation-invalidation rendezvous.
///
/// tlbie/slbie bump the generation; every thread flushes its own TLB
/// and acknowledges at its next architectural boundary. The issuing
/// thread waits on the acknowledgements (threads that are not running
/// are acknowledged by the SOC on their behalf).
pub struct TranslationSync {
    generation: AtomicU64,
    acks: [AtomicU64; HW_THREAD_COUNT],
}

impl TranslationSync {
    pub fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            acks: Default::default(),
        }
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Bump the generation; returns the value every thread must reach
    pub fn invalidate(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Record that `thread_id` has flushed up to `generation`
    #[inline]
    pub fn acknowledge(&self, thread_id: usize, generation: u64) {
        self.acks[thread_id].store(generation, Ordering::Release);
    }

    /// Whether every thread has acknowledged `generation`
    pub fn all_acknowledged(&self, generation: u64) -> bool {
        self.acks
            .iter()
            .all(|a| a.load(Ordering::Acquire) >= generation)
    }
}

impl Default for TranslationSync {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-thread MMU
pub struct Mmu {
    core: Arc<PpuCoreState>,
    tlb: Box<[[TlbEntry; TLB_WAYS]; TLB_SETS]>,
    /// xorshift state for pseudo-random way replacement
    replace_seed: u32,
    /// Local view of the global translation generation
    seen_generation: u64,
}

impl Mmu {
    pub fn new(core: Arc<PpuCoreState>) -> Self {
        Self {
            core,
            tlb: Box::new([[TlbEntry::default(); TLB_WAYS]; TLB_SETS]),
            replace_seed: 0x2545_F491,
            seen_generation: 0,
        }
    }

    #[inline]
    pub fn core(&self) -> &Arc<PpuCoreState> {
        &self.core
    }

    /// Drop all cached translations
    pub fn flush_tlb(&mut self) {
        for set in self.tlb.iter_mut() {
            for way in set.iter_mut() {
                way.valid = false;
            }
        }
    }

    /// Catch up with the global invalidation generation. Returns true
    /// when a flush happened (the JIT must revalidate too).
    pub fn sync_generation(&mut self, sync: &TranslationSync, thread_id: usize) -> bool {
        let gen = sync.generation();
        if gen != self.seen_generation {
            self.flush_tlb();
            self.seen_generation = gen;
            sync.acknowledge(thread_id, gen);
            return true;
        }
        sync.acknowledge(thread_id, gen);
        false
    }

    /// Translate an effective address to a real address.
    pub fn translate(
        &mut self,
        regs: &PpuThreadRegisters,
        space: &AddressSpace,
        ea: u64,
        access: Access,
    ) -> Result<u64, Exception> {
        let msr = regs.msr();
        let relocate = match access {
            Access::IFetch => msr.contains(Msr::IR),
            Access::DataRead | Access::DataWrite => msr.contains(Msr::DR),
        };
        if !relocate {
            // Real mode: the hypervisor offset applies
            let sprs = self.core.sprs.read();
            let offset = if msr.contains(Msr::HV) {
                sprs.hrmor
            } else {
                sprs.rmor
            };
            return Ok((ea & REAL_MODE_MASK) | offset);
        }

        let esid = ea >> 28;
        let Some(slb) = self.core.slb_lookup(esid) else {
            return Err(match access {
                Access::IFetch => Exception::InstSegment,
                _ => Exception::DataSegment { addr: ea },
            });
        };

        if access == Access::IFetch && slb.n {
            return Err(Exception::InstStorage {
                srr1: SRR1_ISI_NOEXEC,
            });
        }

        let page_shift = if slb.large {
            LARGE_PAGE_SHIFT
        } else {
            SMALL_PAGE_SHIFT
        };
        let va = (slb.vsid << 28) | (ea & SEGMENT_OFFSET_MASK);
        let vpn = va >> page_shift;

        if let Some(entry) = self.tlb_lookup(vpn, page_shift) {
            self.check_permissions(&msr, entry, access, ea)?;
            let offset_mask = (1u64 << entry.page_shift) - 1;
            return Ok(entry.rpn | (ea & offset_mask));
        }

        // Walk the hashed page table and install the mapping
        let entry = self.page_table_walk(regs, space, &slb, ea, va, page_shift, access)?;
        self.tlb_install(entry);
        self.check_permissions(&msr, entry, access, ea)?;
        let offset_mask = (1u64 << entry.page_shift) - 1;
        Ok(entry.rpn | (ea & offset_mask))
    }

    fn tlb_lookup(&self, vpn: u64, page_shift: u32) -> Option<TlbEntry> {
        let set = (vpn as usize) & (TLB_SETS - 1);
        self.tlb[set]
            .iter()
            .find(|e| e.valid && e.vpn == vpn && e.page_shift == page_shift)
            .copied()
    }

    fn tlb_install(&mut self, entry: TlbEntry) {
        let set = (entry.vpn as usize) & (TLB_SETS - 1);
        let ways = &mut self.tlb[set];
        let way = match ways.iter().position(|e| !e.valid) {
            Some(idx) => idx,
            None => {
                // xorshift32 pseudo-random eviction
                let mut x = self.replace_seed;
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                self.replace_seed = x;
                (x as usize) & (TLB_WAYS - 1)
            }
        };
        ways[way] = entry;
    }

    fn check_permissions(
        &self,
        msr: &Msr,
        entry: TlbEntry,
        access: Access,
        ea: u64,
    ) -> Result<(), Exception> {
        if access == Access::IFetch && entry.no_exec {
            return Err(Exception::InstStorage {
                srr1: SRR1_ISI_NOEXEC,
            });
        }
        let key = if msr.contains(Msr::PR) {
            entry.kp
        } else {
            entry.ks
        };
        let writable = match (key, entry.pp) {
            (false, 0..=2) => true,
            (false, _) => false,
            (true, 2) => true,
            (true, _) => false,
        };
        let readable = match (key, entry.pp) {
            (false, _) => true,
            (true, 0) => false,
            (true, _) => true,
        };
        let ok = match access {
            Access::IFetch => readable,
            Access::DataRead => readable,
            Access::DataWrite => writable,
        };
        if ok {
            return Ok(());
        }
        match access {
            Access::IFetch => Err(Exception::InstStorage {
                srr1: SRR1_ISI_PROTECTION,
            }),
            Access::DataRead => Err(Exception::DataStorage {
                addr: ea,
                dsisr: DSISR_PROTECTION,
            }),
            Access::DataWrite => Err(Exception::DataStorage {
                addr: ea,
                dsisr: DSISR_PROTECTION | DSISR_STORE,
            }),
        }
    }

    /// PowerPC primary/secondary hashed page-table walk.
    #[allow(clippy::too_many_arguments)]
    fn page_table_walk(
        &self,
        _regs: &PpuThreadRegisters,
        space: &AddressSpace,
        slb: &SlbEntry,
        ea: u64,
        va: u64,
        page_shift: u32,
        access: Access,
    ) -> Result<TlbEntry, Exception> {
        let (htaborg, htab_mask) = {
            let sprs = self.core.sprs.read();
            let htabsize = sprs.sdr1 & 0x1F;
            let htaborg = sprs.sdr1 & 0xFFFF_FFFF_FFC0_0000;
            (htaborg, (1u64 << (11 + htabsize)) - 1)
        };

        let vpn = va >> page_shift;
        let page_index = (ea & SEGMENT_OFFSET_MASK) >> page_shift;
        let hash = (slb.vsid & 0x7F_FFFF_FFFF) ^ page_index;
        // Abbreviated VPN as stored in the PTE high dword
        let avpn = va >> 23;

        for secondary in [false, true] {
            let h = if secondary { !hash } else { hash };
            let pteg_addr = htaborg | ((h & htab_mask) * 128);
            for slot in 0..8 {
                let pte_addr = pteg_addr + slot * 16;
                let pteh = space.read_be64(pte_addr);
                let ptel = space.read_be64(pte_addr + 8);

                if pteh & PTE_VALID == 0 {
                    continue;
                }
                if ((pteh & PTE_HASH) != 0) != secondary {
                    continue;
                }
                if (pteh & PTE_LARGE != 0) != slb.large {
                    continue;
                }
                if pteh >> 7 != avpn {
                    continue;
                }

                let offset_mask = (1u64 << page_shift) - 1;
                return Ok(TlbEntry {
                    vpn,
                    rpn: ptel & !offset_mask & 0x000F_FFFF_FFFF_F000,
                    page_shift,
                    wimg: ((ptel & PTEL_WIMG_MASK) >> 3) as u8,
                    pp: (ptel & PTEL_PP_MASK) as u8,
                    ks: slb.ks,
                    kp: slb.kp,
                    no_exec: ptel & PTEL_NX != 0 || slb.n,
                    valid: true,
                });
            }
        }

        Err(match access {
            Access::IFetch => Exception::InstStorage {
                srr1: SRR1_ISI_NOT_FOUND,
            },
            Access::DataRead => Exception::DataStorage {
                addr: ea,
                dsisr: DSISR_NOT_FOUND,
            },
            Access::DataWrite => Exception::DataStorage {
                addr: ea,
                dsisr: DSISR_NOT_FOUND | DSISR_STORE,
            },
        })
    }
}

/// Helpers to build page table entries, used by boot setup and tests.
pub mod pte {
    /// Compose the high dword of a PTE
    pub fn high(va: u64, secondary: bool, large: bool) -> u64 {
        let avpn = va >> 23;
        (avpn << 7)
            | if large { super::PTE_LARGE } else { 0 }
            | if secondary { super::PTE_HASH } else { 0 }
            | super::PTE_VALID
    }

    /// Compose the low dword of a PTE
    pub fn low(rpn: u64, pp: u8, no_exec: bool) -> u64 {
        rpn | (pp as u64 & super::PTEL_PP_MASK) | if no_exec { super::PTEL_NX } else { 0 }
    }

    /// Primary hash PTEG byte offset for a 4 KiB page
    pub fn pteg_offset(vsid: u64, ea: u64, htab_mask: u64) -> u64 {
        let page_index = (ea & super::SEGMENT_OFFSET_MASK) >> 12;
        let hash = (vsid & 0x7F_FFFF_FFFF) ^ page_index;
        (hash & htab_mask) * 128
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::Msr;

    fn setup() -> (Mmu, PpuThreadRegisters, Arc<AddressSpace>) {
        let core = Arc::new(PpuCoreState::new(0));
        let mmu = Mmu::new(core);
        let regs = PpuThreadRegisters::default();
        let space = AddressSpace::new(0x100_0000);
        (mmu, regs, space)
    }

    #[test]
    fn test_real_mode_passthrough() {
        let (mut mmu, regs, space) = setup();
        // MSR.IR/DR clear: effective == real
        let ra = mmu
            .translate(&regs, &space, 0x1234, Access::DataRead)
            .unwrap();
        assert_eq!(ra, 0x1234);
    }

    #[test]
    fn test_real_mode_hrmor() {
        let (mut mmu, mut regs, space) = setup();
        regs.msr = Msr::HV.bits();
        mmu.core.sprs.write().hrmor = 0x10_0000;
        let ra = mmu
            .translate(&regs, &space, 0x1234, Access::IFetch)
            .unwrap();
        assert_eq!(ra, 0x10_1234);
    }

    #[test]
    fn test_slb_miss_raises_segment_fault() {
        let (mut mmu, mut regs, space) = setup();
        regs.msr = Msr::DR.bits();
        let ea = 0x8000_0000_0000u64;
        let err = mmu
            .translate(&regs, &space, ea, Access::DataRead)
            .unwrap_err();
        assert_eq!(err, Exception::DataSegment { addr: ea });
    }

    fn install_page(space: &AddressSpace, htaborg: u64, vsid: u64, ea: u64, ra: u64) {
        let off = pte::pteg_offset(vsid, ea, 0x7FF);
        let va = (vsid << 28) | (ea & 0x0FFF_FFFF);
        space.write_be64(htaborg + off, pte::high(va, false, false));
        space.write_be64(htaborg + off + 8, pte::low(ra, 2, false));
    }

    #[test]
    fn test_page_table_walk_and_tlb_hit() {
        let (mut mmu, mut regs, space) = setup();
        regs.msr = Msr::DR.bits();
        let htaborg = 0x40_0000u64;
        mmu.core.sprs.write().sdr1 = htaborg; // htabsize 0

        // SLB entry 0 maps ESID 0 -> VSID 0; map EA 0x5000 -> RA 0x9000
        install_page(&space, htaborg, 0, 0x5000, 0x9000);

        let ra = mmu
            .translate(&regs, &space, 0x5123, Access::DataRead)
            .unwrap();
        assert_eq!(ra, 0x9123);

        // Second lookup comes from the TLB: determinism
        let ra2 = mmu
            .translate(&regs, &space, 0x5123, Access::DataRead)
            .unwrap();
        assert_eq!(ra2, ra);
    }

    #[test]
    fn test_unmapped_page_faults_with_cause() {
        let (mut mmu, mut regs, space) = setup();
        regs.msr = Msr::DR.bits();
        mmu.core.sprs.write().sdr1 = 0x40_0000;

        let err = mmu
            .translate(&regs, &space, 0x7000, Access::DataWrite)
            .unwrap_err();
        assert_eq!(
            err,
            Exception::DataStorage {
                addr: 0x7000,
                dsisr: DSISR_NOT_FOUND | DSISR_STORE,
            }
        );
    }

    #[test]
    fn test_nx_blocks_fetch_only() {
        let (mut mmu, mut regs, space) = setup();
        regs.msr = (Msr::IR | Msr::DR).bits();
        let htaborg = 0x40_0000u64;
        mmu.core.sprs.write().sdr1 = htaborg;

        let off = pte::pteg_offset(0, 0x5000, 0x7FF);
        let va = 0x5000u64;
        space.write_be64(htaborg + off, pte::high(va, false, false));
        space.write_be64(htaborg + off + 8, pte::low(0x9000, 2, true));

        assert!(mmu
            .translate(&regs, &space, 0x5000, Access::DataRead)
            .is_ok());
        let err = mmu
            .translate(&regs, &space, 0x5000, Access::IFetch)
            .unwrap_err();
        assert_eq!(
            err,
            Exception::InstStorage {
                srr1: SRR1_ISI_NOEXEC
            }
        );
    }

    #[test]
    fn test_user_key_protection() {
        let (mut mmu, mut regs, space) = setup();
        regs.msr = (Msr::DR | Msr::PR).bits();
        let htaborg = 0x40_0000u64;
        mmu.core.sprs.write().sdr1 = htaborg;

        // Kp set with PP=1: user may read, not write
        mmu.core.slb_insert(
            0,
            SlbEntry {
                esid: 0,
                vsid: 0,
                valid: true,
                kp: true,
                ..SlbEntry::default()
            },
        );
        let off = pte::pteg_offset(0, 0x5000, 0x7FF);
        space.write_be64(htaborg + off, pte::high(0x5000, false, false));
        space.write_be64(htaborg + off + 8, pte::low(0x9000, 1, false));

        assert!(mmu
            .translate(&regs, &space, 0x5000, Access::DataRead)
            .is_ok());
        let err = mmu
            .translate(&regs, &space, 0x5000, Access::DataWrite)
            .unwrap_err();
        assert!(matches!(err, Exception::DataStorage { .. }));
    }

    #[test]
    fn test_generation_sync_flushes() {
        let (mut mmu, mut regs, space) = setup();
        regs.msr = Msr::DR.bits();
        let htaborg = 0x40_0000u64;
        mmu.core.sprs.write().sdr1 = htaborg;
        install_page(&space, htaborg, 0, 0x5000, 0x9000);
        mmu.translate(&regs, &space, 0x5000, Access::DataRead)
            .unwrap();

        let sync = TranslationSync::new();
        let gen = sync.invalidate();
        assert!(mmu.sync_generation(&sync, 0));
        assert!(!sync.all_acknowledged(gen)); // other threads pending
        sync.acknowledge(1, gen);
        sync.acknowledge(2, gen);
        sync.acknowledge(3, gen);
        sync.acknowledge(4, gen);
        sync.acknowledge(5, gen);
        assert!(sync.all_acknowledged(gen));

        // Mapping still resolves after the flush (re-walk)
        let ra = mmu
            .translate(&regs, &space, 0x5000, Access::DataRead)
            .unwrap();
        assert_eq!(ra, 0x9000);
    }
}
