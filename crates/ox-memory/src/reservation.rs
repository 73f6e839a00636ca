//! Reservation tracking for lwarx/stwcx atomics
//!
//! One slot per hardware thread, each covering a 128-byte granule.
//! A conditional store commits while the table is locked, so under
//! contention exactly one stwcx succeeds per reservation.

use parking_lot::Mutex;

use crate::constants::{HW_THREAD_COUNT, RESERVATION_GRANULE};

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    real_addr: u64,
    valid: bool,
}

/// Process-global reservation table shared by all six threads.
pub struct ReservationTable {
    slots: Mutex<[Slot; HW_THREAD_COUNT]>,
}

#[inline]
fn granule(addr: u64) -> u64 {
    addr & !(RESERVATION_GRANULE - 1)
}

impl ReservationTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new([Slot::default(); HW_THREAD_COUNT]),
        }
    }

    /// Record a reservation for `thread_id`, replacing any prior one.
    pub fn reserve(&self, thread_id: usize, real_addr: u64) {
        let mut slots = self.slots.lock();
        slots[thread_id] = Slot {
            real_addr,
            valid: true,
        };
    }

    /// Drop the calling thread's reservation (context switch, rfid).
    pub fn clear(&self, thread_id: usize) {
        self.slots.lock()[thread_id].valid = false;
    }

    /// Atomic check-and-consume: true only when the thread's current
    /// reservation equals `real_addr`; the reservation is cleared
    /// either way.
    pub fn check_and_clear(&self, thread_id: usize, real_addr: u64) -> bool {
        let mut slots = self.slots.lock();
        let slot = &mut slots[thread_id];
        let matched = slot.valid && slot.real_addr == real_addr;
        slot.valid = false;
        matched
    }

    /// Back a stwcx/stdcx: if `thread_id` still holds a reservation on
    /// `real_addr`, run `commit` and clear every reservation whose
    /// granule overlaps the store, all in one atomic step.
    ///
    /// Returns whether the store was performed.
    pub fn store_conditional(
        &self,
        thread_id: usize,
        real_addr: u64,
        len: u64,
        commit: impl FnOnce(),
    ) -> bool {
        let mut slots = self.slots.lock();
        let slot = &mut slots[thread_id];
        if !slot.valid || slot.real_addr != real_addr {
            slot.valid = false;
            return false;
        }
        commit();
        slot.valid = false;
        Self::invalidate_overlapping(&mut slots, real_addr, len, Some(thread_id));
        true
    }

    /// Clear reservations whose granule overlaps `[real_addr, real_addr+len)`.
    ///
    /// Called by every store path (other threads, DMA, MMIO writes into
    /// RAM) after the store commits.
    pub fn invalidate_range(&self, real_addr: u64, len: u64) {
        let mut slots = self.slots.lock();
        Self::invalidate_overlapping(&mut slots, real_addr, len, None);
    }

    fn invalidate_overlapping(
        slots: &mut [Slot; HW_THREAD_COUNT],
        real_addr: u64,
        len: u64,
        skip: Option<usize>,
    ) {
        let first = granule(real_addr);
        let last = granule(real_addr + len.max(1) - 1);
        for (id, slot) in slots.iter_mut().enumerate() {
            if Some(id) == skip || !slot.valid {
                continue;
            }
            let g = granule(slot.real_addr);
            if g >= first && g <= last {
                slot.valid = false;
            }
        }
    }

    /// Whether `thread_id` currently holds a valid reservation (tests).
    pub fn has_reservation(&self, thread_id: usize) -> bool {
        self.slots.lock()[thread_id].valid
    }
}

impl Default for ReservationTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_store() {
        let table = ReservationTable::new();
        table.reserve(0, 0x2000);

        let mut stored = false;
        assert!(table.store_conditional(0, 0x2000, 4, || stored = true));
        assert!(stored);
        // Reservation is consumed
        assert!(!table.store_conditional(0, 0x2000, 4, || unreachable!()));
    }

    #[test]
    fn test_wrong_address_fails() {
        let table = ReservationTable::new();
        table.reserve(0, 0x2000);
        assert!(!table.store_conditional(0, 0x3000, 4, || unreachable!()));
        // A failed stwcx also clears the reservation
        assert!(!table.has_reservation(0));
    }

    #[test]
    fn test_check_and_clear_consumes() {
        let table = ReservationTable::new();
        table.reserve(1, 0x4000);
        assert!(table.check_and_clear(1, 0x4000));
        assert!(!table.check_and_clear(1, 0x4000));

        table.reserve(1, 0x4000);
        // Mismatch still consumes
        assert!(!table.check_and_clear(1, 0x5000));
        assert!(!table.has_reservation(1));
    }

    #[test]
    fn test_contention_single_winner() {
        let table = ReservationTable::new();
        table.reserve(0, 0x2000);
        table.reserve(1, 0x2000);

        assert!(table.store_conditional(0, 0x2000, 4, || {}));
        // The winning store invalidated thread 1's granule
        assert!(!table.store_conditional(1, 0x2000, 4, || unreachable!()));
    }

    #[test]
    fn test_granule_invalidation() {
        let table = ReservationTable::new();
        table.reserve(2, 0x2040);

        // A store elsewhere in the same 128-byte granule kills it
        table.invalidate_range(0x2004, 4);
        assert!(!table.has_reservation(2));

        // A store in the next granule does not
        table.reserve(2, 0x2040);
        table.invalidate_range(0x2080, 4);
        assert!(table.has_reservation(2));
    }

    #[test]
    fn test_invalidate_straddles_granules() {
        let table = ReservationTable::new();
        table.reserve(0, 0x2000);
        table.reserve(1, 0x2080);
        // 16-byte store crossing the boundary hits both granules
        table.invalidate_range(0x2078, 16);
        assert!(!table.has_reservation(0));
        assert!(!table.has_reservation(1));
    }

    #[test]
    fn test_new_reservation_replaces_old() {
        let table = ReservationTable::new();
        table.reserve(0, 0x1000);
        table.reserve(0, 0x2000);
        assert!(!table.store_conditional(0, 0x1000, 4, || unreachable!()));
    }
}
