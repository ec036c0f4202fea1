//! Probe session lifecycle shared by the TX and RX sessions
//!
//! A session moves `Configuring → Running → Stopped` exactly once. It only
//! enters `Running` after its timestamp source has produced a reading, and
//! it observes the stop signal between iterations, never inside a blocked
//! send or receive.

use crate::error::{ProbeError, Result};
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Lifecycle state of a probe session
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Configuring,
    Running,
    Stopped,
}

/// Cooperative stop request shared between a session and its controller
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the session to stop after its current iteration
    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Counters reported when a session stops
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Packets sent (TX) or datagrams received (RX)
    pub packets: u64,
    /// Stage records handed to the sink
    pub records_emitted: u64,
    /// Datagrams dropped because the sequence could not be decoded
    pub decode_failures: u64,
    /// Hardware TX completion timestamps retrieved
    pub tx_completions: u64,
    /// Sent packets for which no hardware TX completion was retrieved
    pub tx_completions_missing: u64,
    /// Datagrams received without a hardware RX timestamp
    pub rx_hardware_missing: u64,
    /// Whether the session ended on the stop signal rather than its count
    pub stopped_early: bool,
}

pub(crate) fn expect_state(actual: SessionState, expected: SessionState) -> Result<()> {
    if actual != expected {
        return Err(ProbeError::InvalidState { expected, actual });
    }
    Ok(())
}
