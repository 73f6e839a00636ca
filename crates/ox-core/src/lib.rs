//! Core support crate for the oxidized-xenon emulator
//!
//! Holds configuration, error types, logging setup and the global
//! run/pause signals shared by every subsystem.

pub mod config;
pub mod error;
pub mod logging;
pub mod signals;

pub use config::Config;
pub use signals::SystemSignals;
