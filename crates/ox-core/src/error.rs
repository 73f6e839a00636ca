//! Error types shared across the emulator crates

use thiserror::Error;

/// Physical memory and MMIO errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// Access outside the RAM backing store
    #[error("out of range access at 0x{addr:016x} ({len} bytes)")]
    OutOfRangeAccess { addr: u64, len: u64 },

    /// Physical address owned by no device and outside RAM
    #[error("unmapped physical address 0x{addr:016x}")]
    UnmappedPhysical { addr: u64 },

    /// MMIO registration overlaps an existing region
    #[error("MMIO region 0x{start:016x}-0x{end:016x} overlaps an existing region")]
    OverlappingRegion { start: u64, end: u64 },
}

/// CPU / JIT host-side errors
#[derive(Debug, Error)]
pub enum CpuError {
    /// The JIT failed to emit host code for a block
    #[error("JIT emission failed for block at 0x{pc:016x}: {reason}")]
    JitEmission { pc: u64, reason: String },

    /// Thread index outside the six hardware threads
    #[error("invalid hardware thread id {0}")]
    InvalidThread(u32),
}

/// Emulator lifecycle errors
#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("cpu error: {0}")]
    Cpu(#[from] CpuError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for emulator operations
pub type Result<T> = std::result::Result<T, EmulatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MemoryError::UnmappedPhysical { addr: 0xEA00_1000 };
        assert!(err.to_string().contains("ea001000"));

        let err = MemoryError::OutOfRangeAccess {
            addr: 0x2000_0000,
            len: 4,
        };
        assert!(err.to_string().contains("4 bytes"));
    }
}
