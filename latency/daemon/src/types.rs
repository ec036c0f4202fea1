//! Userspace type definitions
//!
//! Defines the stage record schema shared by every producer and the
//! report structures produced by the correlator.
//!
//! ## Organization
//!
//! - **Kernel Types**: the driver stage event shared with the eBPF program
//! - **Record Types**: stages, provenance, stage records and packet keys
//! - **Report Types**: aggregated latency statistics for export

use crate::config::CorrelatorConfig;
use nic_ts_common::constants::*;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

// ============================================================================
// Kernel Types (from eBPF programs)
// ============================================================================

pub mod kernel {
    //! Types shared between the eBPF forwarder and userspace
    //!
    //! These are re-exported from the nic-ts-common crate and must
    //! maintain binary compatibility with the eBPF program.

    pub use nic_ts_common::constants;
    pub use nic_ts_common::types::DriverStageEvent;
}

pub use kernel::DriverStageEvent;

// ============================================================================
// Record Types
// ============================================================================

/// A canonical point in a packet's lifecycle
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Driver accepted the packet for transmission
    TxEnqueue,
    /// NIC finished transmitting the packet
    TxCompletion,
    /// NIC finished receiving the packet
    RxCompletion,
    /// Driver delivered the packet to the network stack
    RxDeliver,
}

/// Which side of the wire a stage belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Half {
    Tx,
    Rx,
}

impl Stage {
    /// All stages in pipeline order
    pub const ALL: [Stage; STAGE_COUNT] = [
        Stage::TxEnqueue,
        Stage::TxCompletion,
        Stage::RxCompletion,
        Stage::RxDeliver,
    ];

    /// Position of the stage in pipeline order
    pub fn index(self) -> usize {
        self.code() as usize
    }

    /// Stage code used on the kernel/userspace boundary
    pub fn code(self) -> u8 {
        match self {
            Stage::TxEnqueue => STAGE_TX_ENQUEUE,
            Stage::TxCompletion => STAGE_TX_COMPLETION,
            Stage::RxCompletion => STAGE_RX_COMPLETION,
            Stage::RxDeliver => STAGE_RX_DELIVER,
        }
    }

    /// Decode a stage code from a driver stage event
    pub fn from_code(code: u8) -> Option<Stage> {
        match code {
            STAGE_TX_ENQUEUE => Some(Stage::TxEnqueue),
            STAGE_TX_COMPLETION => Some(Stage::TxCompletion),
            STAGE_RX_COMPLETION => Some(Stage::RxCompletion),
            STAGE_RX_DELIVER => Some(Stage::RxDeliver),
            _ => None,
        }
    }

    /// Stable snake_case name used in record logs and reports
    pub fn name(self) -> &'static str {
        match self {
            Stage::TxEnqueue => "tx_enqueue",
            Stage::TxCompletion => "tx_completion",
            Stage::RxCompletion => "rx_completion",
            Stage::RxDeliver => "rx_deliver",
        }
    }

    pub fn half(self) -> Half {
        match self {
            Stage::TxEnqueue | Stage::TxCompletion => Half::Tx,
            Stage::RxCompletion | Stage::RxDeliver => Half::Rx,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.name() == s)
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

/// Where a timestamp value came from
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Taken by the NIC (or read from its clock inside the driver)
    Hardware,
    /// Sampled from userspace or by the kernel stack; carries scheduling jitter
    Software,
}

impl Provenance {
    pub fn name(self) -> &'static str {
        match self {
            Provenance::Hardware => "hardware",
            Provenance::Software => "software",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Provenance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hardware" => Ok(Provenance::Hardware),
            "software" => Ok(Provenance::Software),
            other => Err(format!("unknown provenance '{}'", other)),
        }
    }
}

/// Which producer emitted a record
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// A userspace TX or RX probe session
    Probe,
    /// The driver's stage tracepoints
    Driver,
}

impl Origin {
    pub fn name(self) -> &'static str {
        match self {
            Origin::Probe => "probe",
            Origin::Driver => "driver",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Origin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "probe" => Ok(Origin::Probe),
            "driver" => Ok(Origin::Driver),
            other => Err(format!("unknown origin '{}'", other)),
        }
    }
}

/// How authoritative a record is for its stage
///
/// When several producers report the same stage for one packet, the
/// highest rank wins; lower ranks are kept for the stack deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Rank {
    /// Sampled from userspace around a socket call
    UserspaceEstimate = 0,
    /// Hardware timestamp delivered through a socket control message
    DeliveredHardware = 1,
    /// Emitted by the driver's instrumentation
    Driver = 2,
}

impl Rank {
    pub const COUNT: usize = 3;

    pub fn index(self) -> usize {
        self as usize
    }
}

/// One immutable capture record
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageRecord {
    /// Driver queue index, or the probe's configured queue id
    pub queue_id: i32,
    /// Sequence number as carried by the producer
    pub sequence: u32,
    /// Timestamp in PHC nanoseconds
    pub timestamp_ns: u64,
    /// Pipeline stage
    pub stage: Stage,
    /// Hardware or software sourced
    pub provenance: Provenance,
    /// Emitting producer
    pub origin: Origin,
    /// Payload size in bytes (0 when the producer does not know it)
    pub size: u32,
}

impl StageRecord {
    /// Build a record emitted by a probe session
    pub fn probe(
        queue_id: i32,
        sequence: u32,
        size: u32,
        stage: Stage,
        timestamp_ns: u64,
        provenance: Provenance,
    ) -> Self {
        Self {
            queue_id,
            sequence,
            timestamp_ns,
            stage,
            provenance,
            origin: Origin::Probe,
            size,
        }
    }

    /// Build a record emitted by the driver stage feed
    pub fn driver(queue_id: i32, sequence: u16, stage: Stage, timestamp_ns: u64) -> Self {
        Self {
            queue_id,
            sequence: sequence as u32,
            timestamp_ns,
            stage,
            provenance: Provenance::Hardware,
            origin: Origin::Driver,
            size: 0,
        }
    }

    pub fn rank(&self) -> Rank {
        match (self.origin, self.provenance) {
            (Origin::Driver, _) => Rank::Driver,
            (Origin::Probe, Provenance::Hardware) => Rank::DeliveredHardware,
            (Origin::Probe, Provenance::Software) => Rank::UserspaceEstimate,
        }
    }
}

/// Identity of one packet within a measurement window
///
/// The sequence is the low 16 bits of the wire sequence, which is all the
/// driver tracepoints carry.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketKey {
    pub queue_id: i32,
    pub sequence: u16,
}

impl PacketKey {
    pub fn new(queue_id: i32, sequence: u16) -> Self {
        Self { queue_id, sequence }
    }

    /// Key a record, optionally folding every queue id to 0
    pub fn of(record: &StageRecord, key_by_queue: bool) -> Self {
        Self {
            queue_id: if key_by_queue { record.queue_id } else { 0 },
            sequence: crate::codec::wire_key(record.sequence),
        }
    }
}

impl fmt::Display for PacketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}/seq{}", self.queue_id, self.sequence)
    }
}

/// A stage-to-stage latency component
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    /// Driver enqueue minus userspace pre-send sample
    TxStack,
    /// TX completion minus TX enqueue
    TxNic,
    /// RX completion minus TX completion (shared clock only)
    InFlight,
    /// RX deliver minus RX completion
    RxNic,
    /// Userspace receive sample minus driver delivery
    RxStack,
    /// RX deliver minus TX enqueue (shared clock only)
    EndToEnd,
}

impl DeltaKind {
    pub const ALL: [DeltaKind; 6] = [
        DeltaKind::TxStack,
        DeltaKind::TxNic,
        DeltaKind::InFlight,
        DeltaKind::RxNic,
        DeltaKind::RxStack,
        DeltaKind::EndToEnd,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DeltaKind::TxStack => "tx_stack",
            DeltaKind::TxNic => "tx_nic",
            DeltaKind::InFlight => "in_flight",
            DeltaKind::RxNic => "rx_nic",
            DeltaKind::RxStack => "rx_stack",
            DeltaKind::EndToEnd => "end_to_end",
        }
    }
}

impl fmt::Display for DeltaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Report Types
// ============================================================================

/// Aggregated correlation results for export
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LatencyReport {
    /// ISO 8601 timestamp when the report was generated
    pub timestamp: String,
    /// Correlator settings the report was produced with
    pub config: CorrelatorConfig,
    /// Record and timeline counters
    pub counters: CorrelationCounters,
    /// Per-delta statistics, keyed by delta name
    pub deltas: BTreeMap<String, DeltaSummary>,
    /// Loss breakdown by missing stage
    pub losses: LossBreakdown,
}

/// Record and timeline counters maintained by the correlator
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct CorrelationCounters {
    /// Records accepted into a timeline
    pub records_ingested: u64,
    /// Records reporting a stage already filled at the same rank
    pub duplicate_records: u64,
    /// Records older than the epoch window behind the watermark
    pub late_records: u64,
    /// Timelines with all four stages
    pub complete_timelines: u64,
    /// Timelines missing one or more stages
    pub partial_timelines: u64,
    /// Times a key was reused after its previous epoch closed
    pub epoch_splits: u64,
}

/// Statistics for one latency component
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct DeltaSummary {
    /// Number of samples
    pub samples: u64,
    /// Samples below zero (excluded from percentiles)
    pub negative_samples: u64,
    /// Minimum in nanoseconds
    pub min_ns: i64,
    /// Maximum in nanoseconds
    pub max_ns: i64,
    /// Mean in nanoseconds
    pub mean_ns: f64,
    /// Sample standard deviation in nanoseconds
    pub std_dev_ns: f64,
    /// Percentiles over non-negative samples
    pub percentiles: Percentiles,
    /// Bucketed distribution
    pub histogram: LatencyHistogram,
}

/// Latency histogram buckets
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct LatencyHistogram {
    /// 0-1us bucket
    #[serde(rename = "0-1us")]
    pub bucket_0_1us: u64,
    /// 1-5us bucket
    #[serde(rename = "1-5us")]
    pub bucket_1_5us: u64,
    /// 5-10us bucket
    #[serde(rename = "5-10us")]
    pub bucket_5_10us: u64,
    /// 10-50us bucket
    #[serde(rename = "10-50us")]
    pub bucket_10_50us: u64,
    /// 50-100us bucket
    #[serde(rename = "50-100us")]
    pub bucket_50_100us: u64,
    /// 100us+ bucket
    #[serde(rename = "100us+")]
    pub bucket_100us_plus: u64,
}

impl LatencyHistogram {
    /// Add a sample to the appropriate bucket
    ///
    /// Negative samples land in the first bucket.
    pub fn add_sample(&mut self, latency_ns: i64) {
        match latency_ns {
            l if l < 1_000 => self.bucket_0_1us += 1,
            l if l < 5_000 => self.bucket_1_5us += 1,
            l if l < 10_000 => self.bucket_5_10us += 1,
            l if l < 50_000 => self.bucket_10_50us += 1,
            l if l < 100_000 => self.bucket_50_100us += 1,
            _ => self.bucket_100us_plus += 1,
        }
    }

    /// Get total count across all buckets
    pub fn total_count(&self) -> u64 {
        self.bucket_0_1us
            + self.bucket_1_5us
            + self.bucket_5_10us
            + self.bucket_10_50us
            + self.bucket_50_100us
            + self.bucket_100us_plus
    }
}

/// Latency percentiles in nanoseconds
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct Percentiles {
    /// 50th percentile (median)
    pub p50: u64,
    /// 75th percentile
    pub p75: u64,
    /// 90th percentile
    pub p90: u64,
    /// 95th percentile
    pub p95: u64,
    /// 99th percentile
    pub p99: u64,
    /// 99.9th percentile
    pub p999: u64,
}

/// Loss statistics
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct LossBreakdown {
    /// Partial timelines
    pub total: u64,
    /// How often each stage was missing, keyed by stage name
    pub missing_by_stage: BTreeMap<String, u64>,
}
