//! NIC Timestamp Probe Library
//!
//! Captures per-stage packet timestamps from userspace probe sessions and
//! the mqnic driver, and correlates them into per-packet latency
//! breakdowns.

pub mod clock;
pub mod codec;
pub mod collector;
pub mod config;
pub mod correlator;
pub mod error;
pub mod events;
pub mod exporter;
pub mod feed;
pub mod loader;
pub mod net;
pub mod rx;
pub mod session;
pub mod sink;
pub mod tx;
pub mod types;

pub use clock::{PhcClock, Timestamp, TimestampSource};
pub use collector::LatencyCollector;
pub use config::{CorrelatorConfig, DuplicatePolicy, RxConfig, SinkConfig, SinkPolicy, TxConfig};
pub use correlator::{Correlator, Finalized, IngestOutcome, LatencyTuple, LossRecord};
pub use error::{ProbeError, Result};
pub use events::EventProcessor;
pub use exporter::{ExporterType, JsonExporter, ReportExporter, TimelineExporter};
pub use loader::ProbeLoader;
pub use rx::RxSession;
pub use session::{SessionState, SessionSummary, StopSignal};
pub use sink::{BoundedSink, CsvRecordWriter, MemorySink, RecordSink};
pub use tx::TxSession;
pub use types::*;
