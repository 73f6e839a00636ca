//! Timebase and decrementer
//!
//! One 64-bit monotonic timebase shared by all threads, advanced by a
//! fixed tick per simulated instruction quantum. Each thread owns a
//! decrementer that counts down in step and latches an interrupt
//! condition when it turns negative.

use std::sync::atomic::{AtomicU64, Ordering};

/// Timebase frequency of the real part, used by nap catch-up math
pub const TIMEBASE_FREQ_HZ: u64 = 49_875_000;

/// Timebase ticks credited per executed instruction
pub const TICKS_PER_INSTRUCTION: u64 = 1;

/// The shared monotonic timebase.
pub struct TimeBase {
    ticks: AtomicU64,
}

impl TimeBase {
    pub fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn read(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Advance by `n` ticks and return the new value
    #[inline]
    pub fn advance(&self, n: u64) -> u64 {
        self.ticks.fetch_add(n, Ordering::Relaxed) + n
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-thread decrementer bookkeeping.
///
/// The architected DEC value itself lives in the thread SPR block; this
/// tracks the pending-interrupt latch and nap catch-up.
#[derive(Debug, Default)]
pub struct Decrementer {
    /// Set when DEC crossed from non-negative to negative
    pub pending: bool,
}

impl Decrementer {
    /// Count `elapsed` ticks off the DEC value, latching the interrupt
    /// condition on the negative-crossing.
    pub fn tick(&mut self, dec: &mut u32, elapsed: u32) {
        let before = *dec;
        *dec = dec.wrapping_sub(elapsed);
        // Crossed from non-negative to negative
        if (before as i32) >= 0 && (*dec as i32) < 0 {
            self.pending = true;
        }
    }

    /// A guest mtdec rewrites DEC; a non-negative write clears the latch,
    /// a negative write raises it.
    pub fn write(&mut self, dec: &mut u32, value: u32) {
        *dec = value;
        self.pending = (value as i32) < 0;
    }

    pub fn take_pending(&mut self) -> bool {
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timebase_monotonic() {
        let tb = TimeBase::new();
        let a = tb.advance(10);
        let b = tb.advance(5);
        assert_eq!(a, 10);
        assert_eq!(b, 15);
        assert_eq!(tb.read(), 15);
    }

    #[test]
    fn test_decrementer_crossing() {
        let mut d = Decrementer::default();
        let mut dec = 2u32;
        d.tick(&mut dec, 1);
        assert!(!d.pending);
        d.tick(&mut dec, 1);
        assert!(!d.pending); // exactly zero is still non-negative
        d.tick(&mut dec, 1);
        assert!(d.pending);
        assert_eq!(dec as i32, -1);
    }

    #[test]
    fn test_decrementer_write_clears_latch() {
        let mut d = Decrementer::default();
        let mut dec = 0u32;
        d.tick(&mut dec, 1);
        assert!(d.pending);
        d.write(&mut dec, 100);
        assert!(!d.pending);
        d.write(&mut dec, 0xFFFF_FFFF);
        assert!(d.pending);
    }

    #[test]
    fn test_take_pending_consumes() {
        let mut d = Decrementer::default();
        d.pending = true;
        assert!(d.take_pending());
        assert!(!d.take_pending());
    }
}
