//! Shared types and constants for the NIC timestamp probe
//!
//! This crate provides the driver stage event layout and the constants
//! shared between the eBPF tracepoint forwarder and the userspace daemon.

#![no_std]

pub mod types;
pub mod constants;

// Re-export commonly used types
pub use types::DriverStageEvent;
pub use constants::*;
