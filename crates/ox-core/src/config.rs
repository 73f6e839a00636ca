//! Emulator configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EmulatorError, Result};

/// Log verbosity, mapped onto tracing levels by the logging module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// Console motherboard revision, selects PVR and bridge revision id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleRevision {
    Xenon,
    Zephyr,
    Falcon,
    Jasper,
    Trinity,
    #[default]
    Corona,
    Winchester,
}

/// CPU section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    /// Enable the block JIT; the interpreter is always available
    pub jit_enabled: bool,
    /// Visits to a PC before a block is compiled
    pub jit_threshold: u32,
    /// Block cache budget before a coarse flush
    pub jit_cache_blocks: usize,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            jit_enabled: true,
            jit_threshold: 2,
            jit_cache_blocks: 16384,
        }
    }
}

/// Memory section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Main RAM size in bytes (512 MiB on retail revisions)
    pub ram_size: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            ram_size: 512 * 1024 * 1024,
        }
    }
}

/// Debug / logging section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: LogLevel,
    pub log_to_file: bool,
    pub log_path: PathBuf,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_to_file: false,
            log_path: PathBuf::from("oxidized-xenon.log"),
        }
    }
}

/// System section
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SystemConfig {
    pub revision: ConsoleRevision,
    /// Path to a 96-byte fuse dump; zeroed fuses when absent
    pub fuses_path: Option<PathBuf>,
    /// Path to the NAND image handed to the flash controller
    pub nand_path: Option<PathBuf>,
}

/// Top-level emulator configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub system: SystemConfig,
    pub cpu: CpuConfig,
    pub memory: MemoryConfig,
    pub debug: DebugConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| EmulatorError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.memory.ram_size, 0x2000_0000);
        assert!(config.cpu.jit_enabled);
        assert_eq!(config.cpu.jit_threshold, 2);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [memory]
            ram_size = 0x10000000

            [debug]
            log_level = "trace"
            "#,
        )
        .unwrap();
        assert_eq!(config.memory.ram_size, 0x1000_0000);
        assert_eq!(config.debug.log_level, LogLevel::Trace);
        // Unspecified sections fall back to defaults
        assert!(config.cpu.jit_enabled);
    }
}
