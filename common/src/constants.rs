//! Shared constants for the NIC timestamp probe
//!
//! These constants are used by both the eBPF forwarder and the userspace
//! daemon so both agree on stage codes, tracepoint names and limits.

// ============================================================================
// Stages (for DriverStageEvent.stage)
// ============================================================================

/// Driver accepted the packet on its transmit path
pub const STAGE_TX_ENQUEUE: u8 = 0;

/// NIC reported the transmit completion
pub const STAGE_TX_COMPLETION: u8 = 1;

/// NIC reported the receive completion
pub const STAGE_RX_COMPLETION: u8 = 2;

/// Driver handed the packet to the network stack
pub const STAGE_RX_DELIVER: u8 = 3;

/// Number of pipeline stages
pub const STAGE_COUNT: usize = 4;

// ============================================================================
// Wire format
// ============================================================================

/// Width of the sequence field at the start of every UDP payload (bytes)
pub const SEQ_FIELD_LEN: usize = 4;

/// Payload offset of the sequence field
pub const SEQ_FIELD_OFFSET: usize = 0;

/// Size of the sequence space seen by the driver tracepoints (u16)
pub const SEQUENCE_SPACE: u32 = 1 << 16;

// ============================================================================
// Tracepoints
// ============================================================================

/// Tracepoint system the mqnic probe events are registered under
pub const TRACEPOINT_CATEGORY: &str = "mqnic_ts_probe";

/// Tracepoint carrying the driver enqueue timestamp
pub const TRACEPOINT_TX_ENQUEUE: &str = "mqnic_ts_probe_tx_enqueue";

/// Tracepoint carrying the hardware transmit completion timestamp
pub const TRACEPOINT_TX_COMPLETION: &str = "mqnic_ts_probe_tx_cpl";

/// Tracepoint carrying the hardware receive completion timestamp
pub const TRACEPOINT_RX_COMPLETION: &str = "mqnic_ts_probe_rx_cpl";

/// Tracepoint carrying the stack delivery timestamp
pub const TRACEPOINT_RX_DELIVER: &str = "mqnic_ts_probe_rx_deliver";

/// Offset of `int qid` in the tracepoint record (after the 8-byte common header)
pub const TP_QID_OFFSET: usize = 8;

/// Offset of `u16 seq` in the tracepoint record
pub const TP_SEQ_OFFSET: usize = 12;

/// Offset of `u64 ts_ns` in the tracepoint record
pub const TP_TS_OFFSET: usize = 16;

// ============================================================================
// Statistics Counter Indices (for STATS map)
// ============================================================================

/// Total number of tracepoint hits
pub const STAT_TOTAL_EVENTS: u32 = 0;

/// Number of TX enqueue events
pub const STAT_TX_ENQUEUE_EVENTS: u32 = 1;

/// Number of TX completion events
pub const STAT_TX_COMPLETION_EVENTS: u32 = 2;

/// Number of RX completion events
pub const STAT_RX_COMPLETION_EVENTS: u32 = 3;

/// Number of RX deliver events
pub const STAT_RX_DELIVER_EVENTS: u32 = 4;

/// Number of tracepoint records that could not be read
pub const STAT_READ_ERRORS: u32 = 5;

/// Total number of statistics counters
pub const MAX_STATS: u32 = 8;
