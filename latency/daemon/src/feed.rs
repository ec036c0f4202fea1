//! Driver stage feed
//!
//! The mqnic driver reports each stage through a tracepoint carrying
//! `(qid, seq, ts_ns)`. Those reach userspace either as binary
//! [`DriverStageEvent`]s forwarded by the eBPF program, or as ftrace text:
//!
//! ```text
//! <idle>-0  [003] ..s1.  812.104: mqnic_ts_probe_rx_cpl: RX completion: qid=0,seq=3,ts_ns=1718000000123
//! <idle>-0  [003] ..s1.  812.104: mqnic_rx_cpl: RX completion: qid=0 seq=3 ts_ns=1718000000123
//! ```
//!
//! Both forms become driver-origin, hardware-provenance [`StageRecord`]s.

use crate::{
    error::{ProbeError, Result},
    sink::RecordSink,
    types::{DriverStageEvent, Stage, StageRecord},
};
use log::{debug, warn};
use nic_ts_common::constants::*;
use std::io::BufRead;

/// Live ftrace pipe
pub const TRACE_PIPE: &str = "/sys/kernel/tracing/trace_pipe";

/// Tracepoint names and the stage each reports
///
/// Covers the `mqnic_ts_probe` events and the older `mqnic` events, which
/// share fields but separate them with spaces.
const TRACE_EVENTS: [(&str, Stage); 8] = [
    (TRACEPOINT_TX_ENQUEUE, Stage::TxEnqueue),
    (TRACEPOINT_TX_COMPLETION, Stage::TxCompletion),
    (TRACEPOINT_RX_COMPLETION, Stage::RxCompletion),
    (TRACEPOINT_RX_DELIVER, Stage::RxDeliver),
    ("mqnic_tx_enqueue", Stage::TxEnqueue),
    ("mqnic_tx_cpl", Stage::TxCompletion),
    ("mqnic_rx_cpl", Stage::RxCompletion),
    ("mqnic_rx_deliver", Stage::RxDeliver),
];

fn stage_for_event(name: &str) -> Option<Stage> {
    TRACE_EVENTS
        .iter()
        .find(|(event, _)| *event == name)
        .map(|&(_, stage)| stage)
}

/// Convert a forwarded eBPF event; `None` for an unknown stage code
pub fn decode_event(event: &DriverStageEvent) -> Option<StageRecord> {
    Stage::from_code(event.stage)
        .map(|stage| StageRecord::driver(event.qid, event.seq, stage, event.ts_ns))
}

/// Parse one ftrace text line
///
/// Returns `Ok(None)` for comments and events other than the driver stage
/// tracepoints, and `MalformedTrace` when a stage event's fields cannot be
/// read.
pub fn parse_trace_line(line: &str) -> Result<Option<StageRecord>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut tokens = line.split_whitespace();
    let stage = loop {
        match tokens.next() {
            None => return Ok(None),
            Some(token) => {
                if let Some(stage) = token.strip_suffix(':').and_then(stage_for_event) {
                    break stage;
                }
            }
        }
    };

    let mut qid = None;
    let mut seq = None;
    let mut ts_ns = None;
    for field in tokens.flat_map(|token| token.split(',')) {
        match field.split_once('=') {
            Some(("qid", value)) => qid = value.parse::<i32>().ok(),
            Some(("seq", value)) => seq = value.parse::<u16>().ok(),
            Some(("ts_ns", value)) => ts_ns = value.parse::<u64>().ok(),
            _ => {}
        }
    }

    match (qid, seq, ts_ns) {
        (Some(qid), Some(seq), Some(ts_ns)) => Ok(Some(StageRecord::driver(qid, seq, stage, ts_ns))),
        _ => Err(ProbeError::MalformedTrace(line.to_string())),
    }
}

/// Counters for one pass over a driver feed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeedCounters {
    /// Lines or events examined
    pub seen: u64,
    /// Stage records produced
    pub records: u64,
    /// Stage events whose fields could not be read
    pub malformed: u64,
}

/// Turns ftrace lines into stage records for a sink
#[derive(Debug, Default)]
pub struct TraceReader {
    counters: FeedCounters,
}

impl TraceReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> FeedCounters {
        self.counters
    }

    /// Feed one line; malformed stage lines are logged and counted
    pub fn feed_line(&mut self, line: &str, sink: &mut impl RecordSink) -> Result<()> {
        self.counters.seen += 1;
        match parse_trace_line(line) {
            Ok(Some(record)) => {
                sink.append(record)?;
                self.counters.records += 1;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("{}", e);
                self.counters.malformed += 1;
            }
        }
        Ok(())
    }

    /// Read a saved trace to the end
    pub fn read_all(&mut self, reader: impl BufRead, sink: &mut impl RecordSink) -> Result<FeedCounters> {
        for line in reader.lines() {
            self.feed_line(&line?, sink)?;
        }
        sink.flush()?;
        debug!(
            "Trace read: {} lines, {} records, {} malformed",
            self.counters.seen, self.counters.records, self.counters.malformed
        );
        Ok(self.counters)
    }
}

/// Parse a saved trace into records
pub fn read_trace(reader: impl BufRead) -> Result<Vec<StageRecord>> {
    let mut sink = crate::sink::MemorySink::new();
    TraceReader::new().read_all(reader, &mut sink)?;
    Ok(sink.into_records())
}
