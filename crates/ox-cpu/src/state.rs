//! State shared by the two threads of a physical core

use parking_lot::RwLock;

/// One SLB entry: effective segment to virtual segment
#[derive(Debug, Clone, Copy, Default)]
pub struct SlbEntry {
    /// Effective segment id (ea >> 28)
    pub esid: u64,
    /// Virtual segment id
    pub vsid: u64,
    pub valid: bool,
    /// Large (16 MiB) pages in this segment
    pub large: bool,
    /// Supervisor key
    pub ks: bool,
    /// User key
    pub kp: bool,
    /// No-execute
    pub n: bool,
    /// Class (used by slbie matching)
    pub c: bool,
}

/// Number of SLB entries per core
pub const SLB_ENTRIES: usize = 16;

/// SPRs shared between both threads of a core
#[derive(Debug, Clone)]
pub struct SharedSprs {
    pub hid0: u64,
    pub hid1: u64,
    pub hid4: u64,
    pub hid6: u64,
    pub lpcr: u64,
    pub lpidr: u32,
    /// Hypervisor real mode offset, OR'd into real-mode accesses
    pub hrmor: u64,
    pub rmor: u64,
    /// Page table origin and size
    pub sdr1: u64,
    /// Processor version register
    pub pvr: u32,
    pub tscr: u32,
    pub ttr: u32,
}

impl Default for SharedSprs {
    fn default() -> Self {
        Self {
            hid0: 0,
            hid1: 0,
            hid4: 0,
            hid6: 0,
            lpcr: 0,
            lpidr: 0,
            hrmor: 0,
            rmor: 0,
            sdr1: 0,
            pvr: super::xenon::PVR_XENON,
            tscr: 0,
            ttr: 0,
        }
    }
}

/// Per-core shared state: SPR block and the SLB.
///
/// Both hardware threads of a core share one instance; the SLB sits
/// behind a lightweight lock because slbmte on one thread must be
/// visible to its sibling.
pub struct PpuCoreState {
    pub core_id: u32,
    pub sprs: RwLock<SharedSprs>,
    pub slb: RwLock<[SlbEntry; SLB_ENTRIES]>,
}

impl PpuCoreState {
    pub fn new(core_id: u32) -> Self {
        let mut slb = [SlbEntry::default(); SLB_ENTRIES];
        // Entry 0 maps the default segment after reset
        slb[0] = SlbEntry {
            esid: 0,
            vsid: 0,
            valid: true,
            ..SlbEntry::default()
        };
        Self {
            core_id,
            sprs: RwLock::new(SharedSprs::default()),
            slb: RwLock::new(slb),
        }
    }

    /// Install an SLB entry, displacing any prior mapping of the ESID
    /// so at most one entry ever matches.
    pub fn slb_insert(&self, index: usize, entry: SlbEntry) {
        let mut slb = self.slb.write();
        for e in slb.iter_mut() {
            if e.valid && e.esid == entry.esid {
                e.valid = false;
            }
        }
        slb[index % SLB_ENTRIES] = entry;
    }

    /// Find the entry covering `esid`
    pub fn slb_lookup(&self, esid: u64) -> Option<SlbEntry> {
        self.slb
            .read()
            .iter()
            .find(|e| e.valid && e.esid == esid)
            .copied()
    }

    /// Invalidate the entry for one effective segment
    pub fn slb_invalidate_entry(&self, esid: u64) {
        let mut slb = self.slb.write();
        for e in slb.iter_mut() {
            if e.valid && e.esid == esid {
                e.valid = false;
            }
        }
    }

    /// Invalidate everything except entry 0 (slbia)
    pub fn slb_invalidate_all(&self) {
        let mut slb = self.slb.write();
        for e in slb.iter_mut().skip(1) {
            e.valid = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_segment_after_reset() {
        let core = PpuCoreState::new(0);
        let e = core.slb_lookup(0).unwrap();
        assert_eq!(e.vsid, 0);
    }

    #[test]
    fn test_at_most_one_entry_per_esid() {
        let core = PpuCoreState::new(0);
        core.slb_insert(
            1,
            SlbEntry {
                esid: 0x7,
                vsid: 0x100,
                valid: true,
                ..SlbEntry::default()
            },
        );
        core.slb_insert(
            2,
            SlbEntry {
                esid: 0x7,
                vsid: 0x200,
                valid: true,
                ..SlbEntry::default()
            },
        );
        let e = core.slb_lookup(0x7).unwrap();
        assert_eq!(e.vsid, 0x200);
        // The displaced entry is gone, not duplicated
        let count = core
            .slb
            .read()
            .iter()
            .filter(|e| e.valid && e.esid == 0x7)
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_slbia_keeps_entry_zero() {
        let core = PpuCoreState::new(0);
        core.slb_insert(
            3,
            SlbEntry {
                esid: 0x9,
                vsid: 0x900,
                valid: true,
                ..SlbEntry::default()
            },
        );
        core.slb_invalidate_all();
        assert!(core.slb_lookup(0x9).is_none());
        assert!(core.slb_lookup(0).is_some());
    }
}
