//! Record sinks
//!
//! Every producer (TX/RX sessions, the driver feed) hands its
//! [`StageRecord`]s to a [`RecordSink`]. The on-disk form is an
//! append-only CSV log with a fixed column order:
//!
//! ```text
//! queue_id,sequence,size,stage,provenance,origin,timestamp_ns
//! ```
//!
//! [`BoundedSink`] decouples a producer from a slow writer with a bounded
//! buffer and an explicit full-buffer policy.

use crate::{
    config::{SinkConfig, SinkPolicy},
    error::{ProbeError, Result},
    types::{Origin, Provenance, Stage, StageRecord},
};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    io::{BufRead, Write},
    sync::Arc,
    thread::{self, JoinHandle},
};

/// Column header of the record log
pub const RECORD_LOG_HEADER: &str = "queue_id,sequence,size,stage,provenance,origin,timestamp_ns";

/// Header of the legacy TX prober log
pub const LEGACY_TX_HEADER: &str = "pkt_seq,pkt_size,t_user_tx_ns";

/// Header of the legacy RX prober log
pub const LEGACY_RX_HEADER: &str = "pkt_seq,pkt_size,t_user_rx_ns,t_hw_rx_ns";

/// Append-only destination for stage records
pub trait RecordSink {
    /// Append one record
    fn append(&mut self, record: StageRecord) -> Result<()>;

    /// Make everything appended so far durable
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S: RecordSink + ?Sized> RecordSink for &mut S {
    fn append(&mut self, record: StageRecord) -> Result<()> {
        (**self).append(record)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

impl<S: RecordSink + ?Sized> RecordSink for Box<S> {
    fn append(&mut self, record: StageRecord) -> Result<()> {
        (**self).append(record)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// Collects records in memory
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Vec<StageRecord>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[StageRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<StageRecord> {
        self.records
    }
}

impl RecordSink for MemorySink {
    fn append(&mut self, record: StageRecord) -> Result<()> {
        self.records.push(record);
        Ok(())
    }
}

/// Writes records as CSV lines, emitting the header before the first line
pub struct CsvRecordWriter<W: Write> {
    writer: W,
    header_written: bool,
}

impl<W: Write> CsvRecordWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            header_written: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_header(&mut self) -> Result<()> {
        if !self.header_written {
            writeln!(self.writer, "{}", RECORD_LOG_HEADER)?;
            self.header_written = true;
        }
        Ok(())
    }
}

impl<W: Write> RecordSink for CsvRecordWriter<W> {
    fn append(&mut self, record: StageRecord) -> Result<()> {
        self.write_header()?;
        writeln!(self.writer, "{}", format_record(&record))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.write_header()?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Format one record as a record log line (without newline)
pub fn format_record(record: &StageRecord) -> String {
    format!(
        "{},{},{},{},{},{},{}",
        record.queue_id,
        record.sequence,
        record.size,
        record.stage,
        record.provenance,
        record.origin,
        record.timestamp_ns
    )
}

/// Counters reported when a bounded sink is closed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SinkStats {
    /// Records handed to the inner sink
    pub written: u64,
    /// Records evicted under `drop-oldest`
    pub dropped: u64,
}

struct QueueState {
    buffer: VecDeque<StageRecord>,
    closed: bool,
    writing: bool,
    failed: Option<String>,
    stats: SinkStats,
}

struct Shared {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    idle: Condvar,
}

/// A bounded buffer in front of a sink, drained by a writer thread
///
/// When the buffer is full the configured [`SinkPolicy`] decides whether
/// the producer waits, the oldest buffered record is evicted, or the
/// append fails. Once the writer has failed every append and flush
/// returns [`ProbeError::SinkUnavailable`].
pub struct BoundedSink {
    shared: Arc<Shared>,
    config: SinkConfig,
    writer: Option<JoinHandle<Result<()>>>,
}

impl BoundedSink {
    /// Start a writer thread draining into `inner`
    pub fn spawn<S>(inner: S, config: SinkConfig) -> Result<Self>
    where
        S: RecordSink + Send + 'static,
    {
        config.validate()?;

        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                buffer: VecDeque::with_capacity(config.capacity),
                closed: false,
                writing: false,
                failed: None,
                stats: SinkStats::default(),
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            idle: Condvar::new(),
        });

        let writer_shared = Arc::clone(&shared);
        let writer = thread::Builder::new()
            .name("record-sink".into())
            .spawn(move || drain(inner, writer_shared))?;

        debug!(
            "Record sink started (capacity {}, policy {:?})",
            config.capacity, config.policy
        );

        Ok(Self {
            shared,
            config,
            writer: Some(writer),
        })
    }

    /// Records evicted so far
    pub fn dropped(&self) -> u64 {
        self.shared.state.lock().stats.dropped
    }

    /// Drain the buffer, stop the writer and report its counters
    pub fn close(mut self) -> Result<SinkStats> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<SinkStats> {
        {
            let mut state = self.shared.state.lock();
            state.closed = true;
        }
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();

        if let Some(writer) = self.writer.take() {
            match writer.join() {
                Ok(result) => result?,
                Err(_) => {
                    return Err(ProbeError::SinkUnavailable {
                        reason: "record writer panicked".into(),
                    })
                }
            }
        }

        let state = self.shared.state.lock();
        if state.stats.dropped > 0 {
            warn!("Record sink dropped {} records", state.stats.dropped);
        }
        Ok(state.stats)
    }
}

fn unavailable(reason: &str) -> ProbeError {
    ProbeError::SinkUnavailable {
        reason: reason.to_string(),
    }
}

impl RecordSink for BoundedSink {
    fn append(&mut self, record: StageRecord) -> Result<()> {
        let mut state = self.shared.state.lock();

        loop {
            if let Some(reason) = &state.failed {
                return Err(unavailable(reason));
            }
            if state.closed {
                return Err(unavailable("sink closed"));
            }
            if state.buffer.len() < self.config.capacity {
                break;
            }

            match self.config.policy {
                SinkPolicy::Block => self.shared.not_full.wait(&mut state),
                SinkPolicy::DropOldest => {
                    state.buffer.pop_front();
                    state.stats.dropped += 1;
                    if state.stats.dropped == 1 {
                        warn!("Record sink full, dropping oldest records");
                    }
                    break;
                }
                SinkPolicy::Abort => {
                    return Err(ProbeError::SinkUnavailable {
                        reason: format!("buffer full ({} records)", self.config.capacity),
                    })
                }
            }
        }

        state.buffer.push_back(record);
        drop(state);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Wait until the writer has drained everything appended so far
    fn flush(&mut self) -> Result<()> {
        let mut state = self.shared.state.lock();
        while (!state.buffer.is_empty() || state.writing) && state.failed.is_none() {
            self.shared.idle.wait(&mut state);
        }
        match &state.failed {
            Some(reason) => Err(unavailable(reason)),
            None => Ok(()),
        }
    }
}

impl Drop for BoundedSink {
    fn drop(&mut self) {
        if self.writer.is_some() {
            if let Err(e) = self.shutdown() {
                warn!("Record sink shut down with error: {}", e);
            }
        }
    }
}

fn drain<S: RecordSink>(mut inner: S, shared: Arc<Shared>) -> Result<()> {
    loop {
        let batch: Vec<StageRecord> = {
            let mut state = shared.state.lock();
            while state.buffer.is_empty() && !state.closed {
                shared.not_empty.wait(&mut state);
            }
            if state.buffer.is_empty() {
                break;
            }
            state.writing = true;
            state.buffer.drain(..).collect()
        };
        shared.not_full.notify_all();

        let count = batch.len() as u64;
        let mut result = batch.into_iter().try_for_each(|record| inner.append(record));

        let mut state = shared.state.lock();
        if result.is_ok() && state.buffer.is_empty() {
            // Idle: make the batch durable before reporting it drained
            result = inner.flush();
        }
        state.writing = false;

        if let Err(e) = result {
            warn!("Record writer failed: {}", e);
            state.failed = Some(e.to_string());
            state.buffer.clear();
            drop(state);
            shared.not_full.notify_all();
            shared.idle.notify_all();
            return Err(e);
        }

        state.stats.written += count;
        drop(state);
        shared.idle.notify_all();
    }

    inner.flush()
}

/// Read a record log back into records
///
/// Accepts the canonical log and the two legacy prober logs
/// (read as queue id 0, probe origin). A legacy RX line with a zero
/// hardware column carries no `RxCompletion` record.
pub fn read_record_log(reader: impl BufRead) -> Result<Vec<StageRecord>> {
    let mut lines = reader.lines().enumerate();

    let format = match lines.next() {
        Some((_, header)) => match header?.trim() {
            RECORD_LOG_HEADER => LogFormat::Canonical,
            LEGACY_TX_HEADER => LogFormat::LegacyTx,
            LEGACY_RX_HEADER => LogFormat::LegacyRx,
            other => {
                return Err(ProbeError::RecordLog {
                    line: 1,
                    reason: format!("unrecognized header '{}'", other),
                })
            }
        },
        None => return Ok(Vec::new()),
    };

    let mut records = Vec::new();
    for (index, line) in lines {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let parsed = match format {
            LogFormat::Canonical => parse_canonical(&fields).map(|r| vec![r]),
            LogFormat::LegacyTx => parse_legacy_tx(&fields),
            LogFormat::LegacyRx => parse_legacy_rx(&fields),
        };
        match parsed {
            Ok(mut parsed) => records.append(&mut parsed),
            Err(reason) => {
                return Err(ProbeError::RecordLog {
                    line: index + 1,
                    reason,
                })
            }
        }
    }

    Ok(records)
}

#[derive(Debug, Clone, Copy)]
enum LogFormat {
    Canonical,
    LegacyTx,
    LegacyRx,
}

fn field<T: std::str::FromStr>(fields: &[&str], index: usize, name: &str) -> std::result::Result<T, String>
where
    T::Err: std::fmt::Display,
{
    let raw = fields
        .get(index)
        .ok_or_else(|| format!("missing column '{}'", name))?;
    raw.parse()
        .map_err(|e| format!("column '{}' value '{}': {}", name, raw, e))
}

fn expect_columns(fields: &[&str], expected: usize) -> std::result::Result<(), String> {
    if fields.len() != expected {
        return Err(format!("expected {} columns, found {}", expected, fields.len()));
    }
    Ok(())
}

fn parse_canonical(fields: &[&str]) -> std::result::Result<StageRecord, String> {
    expect_columns(fields, 7)?;
    Ok(StageRecord {
        queue_id: field(fields, 0, "queue_id")?,
        sequence: field(fields, 1, "sequence")?,
        size: field(fields, 2, "size")?,
        stage: field::<Stage>(fields, 3, "stage")?,
        provenance: field::<Provenance>(fields, 4, "provenance")?,
        origin: field::<Origin>(fields, 5, "origin")?,
        timestamp_ns: field(fields, 6, "timestamp_ns")?,
    })
}

fn parse_legacy_tx(fields: &[&str]) -> std::result::Result<Vec<StageRecord>, String> {
    expect_columns(fields, 3)?;
    let sequence: u32 = field(fields, 0, "pkt_seq")?;
    let size: u32 = field(fields, 1, "pkt_size")?;
    let t_user_tx: u64 = field(fields, 2, "t_user_tx_ns")?;
    Ok(vec![StageRecord::probe(
        0,
        sequence,
        size,
        Stage::TxEnqueue,
        t_user_tx,
        Provenance::Software,
    )])
}

fn parse_legacy_rx(fields: &[&str]) -> std::result::Result<Vec<StageRecord>, String> {
    expect_columns(fields, 4)?;
    let sequence: u32 = field(fields, 0, "pkt_seq")?;
    let size: u32 = field(fields, 1, "pkt_size")?;
    let t_user_rx: u64 = field(fields, 2, "t_user_rx_ns")?;
    let t_hw_rx: u64 = field(fields, 3, "t_hw_rx_ns")?;

    let mut records = vec![StageRecord::probe(
        0,
        sequence,
        size,
        Stage::RxDeliver,
        t_user_rx,
        Provenance::Software,
    )];
    if t_hw_rx != 0 {
        records.push(StageRecord::probe(
            0,
            sequence,
            size,
            Stage::RxCompletion,
            t_hw_rx,
            Provenance::Hardware,
        ));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::Cursor,
        sync::mpsc,
        time::Duration,
    };

    fn record(sequence: u32, ts: u64) -> StageRecord {
        StageRecord::probe(0, sequence, 64, Stage::TxEnqueue, ts, Provenance::Software)
    }

    /// Shared view of what a test sink received
    #[derive(Clone, Default)]
    struct Collected(Arc<Mutex<Vec<StageRecord>>>);

    impl Collected {
        fn sequences(&self) -> Vec<u32> {
            self.0.lock().iter().map(|r| r.sequence).collect()
        }
    }

    struct CollectingSink {
        out: Collected,
        delay: Duration,
    }

    impl RecordSink for CollectingSink {
        fn append(&mut self, record: StageRecord) -> Result<()> {
            thread::sleep(self.delay);
            self.out.0.lock().push(record);
            Ok(())
        }
    }

    /// Blocks inside its first append until the test opens the gate
    struct GatedSink {
        out: Collected,
        started: mpsc::Sender<()>,
        gate: mpsc::Receiver<()>,
        opened: bool,
    }

    impl RecordSink for GatedSink {
        fn append(&mut self, record: StageRecord) -> Result<()> {
            if !self.opened {
                self.started.send(()).unwrap();
                self.gate.recv().unwrap();
                self.opened = true;
            }
            self.out.0.lock().push(record);
            Ok(())
        }
    }

    fn gated(config: SinkConfig) -> (BoundedSink, Collected, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let out = Collected::default();
        let (started_tx, started_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel();
        let inner = GatedSink {
            out: out.clone(),
            started: started_tx,
            gate: gate_rx,
            opened: false,
        };
        let sink = BoundedSink::spawn(inner, config).unwrap();
        (sink, out, started_rx, gate_tx)
    }

    struct FailingSink;

    impl RecordSink for FailingSink {
        fn append(&mut self, _record: StageRecord) -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into())
        }
    }

    #[test]
    fn test_csv_writer_format() {
        let mut writer = CsvRecordWriter::new(Vec::new());
        writer
            .append(StageRecord::driver(2, 7, Stage::RxCompletion, 1_000))
            .unwrap();
        writer.flush().unwrap();

        let text = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(
            text,
            "queue_id,sequence,size,stage,provenance,origin,timestamp_ns\n\
             2,7,0,rx_completion,hardware,driver,1000\n"
        );
    }

    #[test]
    fn test_empty_writer_still_writes_header() {
        let mut writer = CsvRecordWriter::new(Vec::new());
        writer.flush().unwrap();
        assert_eq!(writer.into_inner(), format!("{}\n", RECORD_LOG_HEADER).into_bytes());
    }

    #[test]
    fn test_record_log_round_trip() {
        let records = vec![
            StageRecord::probe(1, 3, 256, Stage::TxEnqueue, 100, Provenance::Software),
            StageRecord::probe(1, 3, 256, Stage::TxCompletion, 180, Provenance::Hardware),
            StageRecord::driver(4, 3, Stage::RxDeliver, 400),
        ];
        let mut writer = CsvRecordWriter::new(Vec::new());
        for record in &records {
            writer.append(*record).unwrap();
        }
        let bytes = writer.into_inner();

        assert_eq!(read_record_log(Cursor::new(bytes)).unwrap(), records);
    }

    #[test]
    fn test_reads_legacy_logs() {
        let tx = "pkt_seq,pkt_size,t_user_tx_ns\n1,100,5000\n2,100,6000\n";
        let records = read_record_log(Cursor::new(tx)).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].stage, Stage::TxEnqueue);
        assert_eq!(records[1].provenance, Provenance::Software);
        assert_eq!(records[1].timestamp_ns, 6000);

        let rx = "pkt_seq,pkt_size,t_user_rx_ns,t_hw_rx_ns\n1,100,9000,8000\n2,100,9500,0\n";
        let records = read_record_log(Cursor::new(rx)).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].stage, Stage::RxDeliver);
        assert_eq!(records[1].stage, Stage::RxCompletion);
        assert_eq!(records[1].provenance, Provenance::Hardware);
        assert_eq!(records[2].sequence, 2);
    }

    #[test]
    fn test_bad_log_lines_report_position() {
        let log = format!("{}\n0,1,64,tx_enqueue,software,probe,10\n0,2,64,nowhere,software,probe,11\n", RECORD_LOG_HEADER);
        let err = read_record_log(Cursor::new(log)).unwrap_err();
        assert!(matches!(err, ProbeError::RecordLog { line: 3, .. }));

        let err = read_record_log(Cursor::new("a,b,c\n")).unwrap_err();
        assert!(matches!(err, ProbeError::RecordLog { line: 1, .. }));

        assert!(read_record_log(Cursor::new("")).unwrap().is_empty());
    }

    #[test]
    fn test_block_policy_delivers_everything() {
        let out = Collected::default();
        let inner = CollectingSink {
            out: out.clone(),
            delay: Duration::from_millis(1),
        };
        let config = SinkConfig {
            capacity: 1,
            policy: SinkPolicy::Block,
        };
        let mut sink = BoundedSink::spawn(inner, config).unwrap();

        for seq in 1..=20 {
            sink.append(record(seq, seq as u64)).unwrap();
        }
        let stats = sink.close().unwrap();

        assert_eq!(stats, SinkStats { written: 20, dropped: 0 });
        assert_eq!(out.sequences(), (1..=20).collect::<Vec<_>>());
    }

    #[test]
    fn test_drop_oldest_policy_counts_evictions() {
        let config = SinkConfig {
            capacity: 2,
            policy: SinkPolicy::DropOldest,
        };
        let (mut sink, out, started, gate) = gated(config);

        sink.append(record(1, 1)).unwrap();
        started.recv().unwrap();

        // Writer is stuck on record 1; 2 and 3 are evicted by 4 and 5
        for seq in 2..=5 {
            sink.append(record(seq, seq as u64)).unwrap();
        }
        assert_eq!(sink.dropped(), 2);

        gate.send(()).unwrap();
        let stats = sink.close().unwrap();
        assert_eq!(stats, SinkStats { written: 3, dropped: 2 });
        assert_eq!(out.sequences(), vec![1, 4, 5]);
    }

    #[test]
    fn test_abort_policy_fails_when_full() {
        let config = SinkConfig {
            capacity: 2,
            policy: SinkPolicy::Abort,
        };
        let (mut sink, out, started, gate) = gated(config);

        sink.append(record(1, 1)).unwrap();
        started.recv().unwrap();
        sink.append(record(2, 2)).unwrap();
        sink.append(record(3, 3)).unwrap();

        let err = sink.append(record(4, 4)).unwrap_err();
        assert!(matches!(err, ProbeError::SinkUnavailable { .. }));

        gate.send(()).unwrap();
        let stats = sink.close().unwrap();
        assert_eq!(stats.written, 3);
        assert_eq!(out.sequences(), vec![1, 2, 3]);
    }

    #[test]
    fn test_failed_writer_surfaces_sink_unavailable() {
        let mut sink = BoundedSink::spawn(FailingSink, SinkConfig::default()).unwrap();
        sink.append(record(1, 1)).unwrap();

        let err = sink.flush().unwrap_err();
        assert!(matches!(err, ProbeError::SinkUnavailable { ref reason } if reason.contains("disk full")));

        let err = sink.append(record(2, 2)).unwrap_err();
        assert!(matches!(err, ProbeError::SinkUnavailable { .. }));
        assert!(sink.close().is_err());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = SinkConfig {
            capacity: 0,
            policy: SinkPolicy::Block,
        };
        assert!(matches!(
            BoundedSink::spawn(MemorySink::new(), config),
            Err(ProbeError::Config(_))
        ));
    }
}
