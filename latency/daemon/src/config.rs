//! Session, sink and correlator configuration
//!
//! The CLI fills these from its arguments; library users build them
//! directly. Every struct has a working `Default` and a `validate()`.

use crate::{
    codec::DEFAULT_PAYLOAD_SIZE,
    error::{ProbeError, Result},
};
use clap::ValueEnum;
use nic_ts_common::constants::{SEQUENCE_SPACE, SEQ_FIELD_LEN};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default correlation epoch window (1 second)
pub const DEFAULT_EPOCH_WINDOW_NS: u64 = 1_000_000_000;

/// Default number of records the sink buffers before applying its policy
pub const DEFAULT_SINK_CAPACITY: usize = 4096;

/// What the correlator does when a stage arrives twice at the same rank
#[derive(Serialize, Deserialize, ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    /// Keep the record with the smaller timestamp and count the duplicate
    #[default]
    KeepEarliest,
    /// Keep the first record seen and return `DuplicateStage` for the second
    Reject,
}

/// What a bounded sink does when its buffer is full
#[derive(Serialize, Deserialize, ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SinkPolicy {
    /// Wait for the writer to make room
    #[default]
    Block,
    /// Evict the oldest buffered record and count it as dropped
    DropOldest,
    /// Fail the append with `SinkUnavailable`
    Abort,
}

/// Correlator settings
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CorrelatorConfig {
    /// Inactivity window after which a timeline is finalized, and the
    /// maximum spread of records sharing one key within an epoch
    pub epoch_window_ns: u64,
    /// Handling of repeated stages
    pub duplicate_policy: DuplicatePolicy,
    /// Key by (queue id, sequence); when false every queue id folds to 0
    pub key_by_queue: bool,
    /// TX and RX timestamps come from the same PHC
    pub shared_clock: bool,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            epoch_window_ns: DEFAULT_EPOCH_WINDOW_NS,
            duplicate_policy: DuplicatePolicy::default(),
            key_by_queue: true,
            shared_clock: true,
        }
    }
}

impl CorrelatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epoch_window_ns == 0 {
            return Err(ProbeError::Config("epoch window must be > 0".into()));
        }
        Ok(())
    }
}

/// Bounded record sink settings
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkConfig {
    pub capacity: usize,
    pub policy: SinkPolicy,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_SINK_CAPACITY,
            policy: SinkPolicy::default(),
        }
    }
}

impl SinkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(ProbeError::Config("sink capacity must be >= 1".into()));
        }
        Ok(())
    }
}

/// TX probe session settings
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TxConfig {
    /// Number of packets to send
    pub count: u32,
    /// Sequence carried by the first packet
    pub first_sequence: u32,
    /// Queue id stamped on emitted records
    pub queue_id: i32,
    /// Datagram size in bytes
    pub payload_size: usize,
    /// Pause between sends
    pub send_interval: Duration,
    /// How long to wait for each hardware TX completion
    pub completion_timeout: Duration,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            count: 1,
            first_sequence: 1,
            queue_id: 0,
            payload_size: DEFAULT_PAYLOAD_SIZE,
            send_interval: Duration::ZERO,
            completion_timeout: Duration::from_millis(10),
        }
    }
}

impl TxConfig {
    /// Validate against the epoch window the records will be correlated with
    pub fn validate(&self, epoch_window_ns: u64) -> Result<()> {
        if self.count == 0 {
            return Err(ProbeError::Config("packet count must be >= 1".into()));
        }
        if self.payload_size < SEQ_FIELD_LEN {
            return Err(ProbeError::Config(format!(
                "payload size {} cannot hold the {}-byte sequence field",
                self.payload_size, SEQ_FIELD_LEN
            )));
        }
        if self.first_sequence.checked_add(self.count - 1).is_none() {
            return Err(ProbeError::Config(
                "sequence range overflows the 32-bit wire field".into(),
            ));
        }
        check_sequence_budget(self.count, self.send_interval, epoch_window_ns)
    }
}

/// Reject runs whose packet keys would repeat inside one epoch window
///
/// Keys wrap every [`SEQUENCE_SPACE`] packets. A reused key is only safe
/// when the previous packet with that key is older than the epoch window.
pub fn check_sequence_budget(count: u32, send_interval: Duration, epoch_window_ns: u64) -> Result<()> {
    if count <= SEQUENCE_SPACE {
        return Ok(());
    }
    let wrap_ns = send_interval.as_nanos().saturating_mul(SEQUENCE_SPACE as u128);
    if wrap_ns <= epoch_window_ns as u128 {
        return Err(ProbeError::Config(format!(
            "{} packets wrap the {}-entry sequence space every {} ns, within the {} ns epoch window; \
             raise the send interval or lower the count",
            count, SEQUENCE_SPACE, wrap_ns, epoch_window_ns
        )));
    }
    Ok(())
}

/// RX probe session settings
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RxConfig {
    /// Stop after this many datagrams (`None` = until stopped)
    pub max_packets: Option<u64>,
    /// Queue id stamped on emitted records
    pub queue_id: i32,
    /// Receive buffer size in bytes
    pub buffer_size: usize,
}

impl Default for RxConfig {
    fn default() -> Self {
        Self {
            max_packets: None,
            queue_id: 0,
            buffer_size: 2048,
        }
    }
}

impl RxConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size < SEQ_FIELD_LEN {
            return Err(ProbeError::Config(format!(
                "receive buffer of {} bytes cannot hold the sequence field",
                self.buffer_size
            )));
        }
        if self.max_packets == Some(0) {
            return Err(ProbeError::Config("packet limit must be >= 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(CorrelatorConfig::default().validate().is_ok());
        assert!(SinkConfig::default().validate().is_ok());
        assert!(TxConfig::default().validate(DEFAULT_EPOCH_WINDOW_NS).is_ok());
        assert!(RxConfig::default().validate().is_ok());
    }

    #[test]
    fn test_sequence_budget() {
        // Below the sequence space nothing can collide
        assert!(check_sequence_budget(65_536, Duration::ZERO, DEFAULT_EPOCH_WINDOW_NS).is_ok());

        // Back-to-back sends past the wrap reuse keys immediately
        assert!(check_sequence_budget(70_000, Duration::ZERO, DEFAULT_EPOCH_WINDOW_NS).is_err());

        // 10us * 65536 = 655ms, inside a 1s window
        assert!(
            check_sequence_budget(70_000, Duration::from_micros(10), DEFAULT_EPOCH_WINDOW_NS)
                .is_err()
        );

        // 20us * 65536 = 1.31s, outside a 1s window
        assert!(
            check_sequence_budget(70_000, Duration::from_micros(20), DEFAULT_EPOCH_WINDOW_NS)
                .is_ok()
        );
    }

    #[test]
    fn test_tx_config_rejects_tiny_payload() {
        let config = TxConfig {
            payload_size: 2,
            ..TxConfig::default()
        };
        assert!(matches!(
            config.validate(DEFAULT_EPOCH_WINDOW_NS),
            Err(ProbeError::Config(_))
        ));
    }

    #[test]
    fn test_policy_serde_names() {
        let json = serde_json::to_string(&DuplicatePolicy::KeepEarliest).unwrap();
        assert_eq!(json, "\"keep-earliest\"");
        let policy: SinkPolicy = serde_json::from_str("\"drop-oldest\"").unwrap();
        assert_eq!(policy, SinkPolicy::DropOldest);
    }
}
