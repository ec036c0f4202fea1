//! Error taxonomy for capture and correlation
//!
//! Library code returns [`ProbeError`]; the binary and the aya/exporter
//! plumbing wrap it in `anyhow` with context.
//!
//! | Variant | Handling |
//! |---|---|
//! | `MalformedPacket` | dropped and counted by the RX session, never fatal |
//! | `ClockUnavailable` | fatal to the session that owns the clock |
//! | `DuplicateStage` | governed by [`DuplicatePolicy`](crate::config::DuplicatePolicy) |
//! | `SinkUnavailable` | surfaced to the producer, never silently lossy |

use crate::types::{PacketKey, Stage};
use std::{io, path::PathBuf};
use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T, E = ProbeError> = std::result::Result<T, E>;

/// Errors produced by the probe sessions, sinks and the correlator
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Payload too short to carry the sequence field
    #[error("malformed packet: {len} byte payload, sequence field needs {needed}")]
    MalformedPacket { len: usize, needed: usize },

    /// The hardware clock handle could not be opened or read
    #[error("hardware clock {} unavailable: {source}", .device.display())]
    ClockUnavailable {
        device: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A stage was observed twice for one packet within an epoch
    #[error("duplicate {stage} record for {key}")]
    DuplicateStage { key: PacketKey, stage: Stage },

    /// The record sink cannot accept more records
    #[error("record sink unavailable: {reason}")]
    SinkUnavailable { reason: String },

    /// A record log line could not be parsed
    #[error("record log line {line}: {reason}")]
    RecordLog { line: usize, reason: String },

    /// A driver trace line named a stage but its fields could not be parsed
    #[error("malformed trace line: {0}")]
    MalformedTrace(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A session operation was attempted in the wrong state
    #[error("session is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: crate::session::SessionState,
        actual: crate::session::SessionState,
    },

    /// Statistics backend failure
    #[error("statistics: {0}")]
    Stats(String),

    /// Socket or file I/O failure
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProbeError {
    /// True for errors that end the owning session
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProbeError::MalformedPacket { .. } | ProbeError::DuplicateStage { .. }
        )
    }
}
