//! End-to-end capture and correlation over a simulated link
//!
//! A TX and an RX session run against in-memory transports that share one
//! simulated PHC, and their records go through the same correlation path
//! the `correlate` command uses.

use nic_ts_probe::{
    clock::{Timestamp, TimestampSource},
    collector::LatencyCollector,
    config::{CorrelatorConfig, RxConfig, SinkConfig, TxConfig},
    correlator::{merge_time_ordered, Correlator, Finalized},
    feed,
    net::{Datagram, RxTransport, TxCompletion, TxTransport},
    rx::RxSession,
    session::StopSignal,
    sink::{read_record_log, BoundedSink, CsvRecordWriter, MemorySink, RecordSink},
    tx::TxSession,
    types::{DeltaKind, Origin, Stage, StageRecord},
    Result,
};
use std::{
    collections::{HashSet, VecDeque},
    fs::File,
    io::{self, BufReader, BufWriter, Cursor},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

/// NIC transmit completion after the userspace pre-send sample
const TX_NIC_NS: u64 = 200;
/// Wire time between TX and RX hardware stamps
const WIRE_NS: u64 = 500;
/// Clock advance per direct read
const READ_STEP_NS: u64 = 1_000;

/// Simulated PHC shared by both ends
#[derive(Clone)]
struct SimClock(Arc<AtomicU64>);

impl SimClock {
    fn new(start: u64) -> Self {
        Self(Arc::new(AtomicU64::new(start)))
    }

    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    fn advance_to(&self, ns: u64) {
        self.0.fetch_max(ns, Ordering::SeqCst);
    }
}

impl TimestampSource for SimClock {
    fn acquire(&mut self) -> Result<Timestamp> {
        Ok(Timestamp::software(
            self.0.fetch_add(READ_STEP_NS, Ordering::SeqCst) + READ_STEP_NS,
        ))
    }
}

/// (payload, hardware RX stamp)
type Wire = Arc<Mutex<VecDeque<(Vec<u8>, u64)>>>;

struct SimTx {
    clock: SimClock,
    wire: Wire,
    sent: u32,
    pending: VecDeque<TxCompletion>,
    /// Zero-based send indexes lost on the wire
    lost: HashSet<u32>,
}

impl TxTransport for SimTx {
    fn send(&mut self, payload: &[u8]) -> io::Result<usize> {
        let tx_hw = self.clock.now() + TX_NIC_NS;
        self.pending.push_back(TxCompletion {
            key: self.sent,
            hardware: Some(Timestamp::hardware(tx_hw)),
            software: None,
        });
        if !self.lost.contains(&self.sent) {
            self.wire
                .lock()
                .unwrap()
                .push_back((payload.to_vec(), tx_hw + WIRE_NS));
        }
        self.sent += 1;
        Ok(payload.len())
    }

    fn tx_completion(&mut self) -> io::Result<Option<TxCompletion>> {
        Ok(self.pending.pop_front())
    }
}

/// Receives whatever is on the wire, then asks the session to stop
struct SimRx {
    clock: SimClock,
    wire: Wire,
    stop: StopSignal,
}

impl RxTransport for SimRx {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<Datagram>> {
        let Some((payload, rx_hw)) = self.wire.lock().unwrap().pop_front() else {
            self.stop.trigger();
            return Ok(None);
        };
        self.clock.advance_to(rx_hw + 50);
        let len = payload.len().min(buf.len());
        buf[..len].copy_from_slice(&payload[..len]);
        Ok(Some(Datagram {
            len,
            hardware: Some(Timestamp::hardware(rx_hw)),
        }))
    }
}

struct Capture {
    tx: Vec<StageRecord>,
    rx: Vec<StageRecord>,
}

/// Send `count` packets from sequence 1, losing the listed sequences
fn capture(count: u32, lost_sequences: &[u32]) -> Capture {
    let clock = SimClock::new(1_000_000);
    let wire: Wire = Arc::default();

    let tx_transport = SimTx {
        clock: clock.clone(),
        wire: Arc::clone(&wire),
        sent: 0,
        pending: VecDeque::new(),
        lost: lost_sequences.iter().map(|seq| seq - 1).collect(),
    };
    let tx_config = TxConfig {
        count,
        first_sequence: 1,
        ..TxConfig::default()
    };
    let mut tx = TxSession::new(tx_config, clock.clone(), tx_transport);
    let mut tx_sink = MemorySink::new();
    tx.configure().unwrap();
    let tx_summary = tx.run(&mut tx_sink, &StopSignal::new()).unwrap();
    assert_eq!(tx_summary.packets, count as u64);
    assert_eq!(tx_summary.tx_completions_missing, 0);

    let stop = StopSignal::new();
    let rx_transport = SimRx {
        clock: clock.clone(),
        wire,
        stop: stop.clone(),
    };
    let mut rx = RxSession::new(RxConfig::default(), clock, rx_transport);
    let mut rx_sink = MemorySink::new();
    rx.configure().unwrap();
    let rx_summary = rx.run(&mut rx_sink, &stop).unwrap();
    assert_eq!(rx_summary.packets, (count as usize - lost_sequences.len()) as u64);
    assert_eq!(rx_summary.rx_hardware_missing, 0);

    Capture {
        tx: tx_sink.into_records(),
        rx: rx_sink.into_records(),
    }
}

fn correlate(streams: Vec<Vec<StageRecord>>) -> (Vec<Finalized>, LatencyCollector) {
    correlate_with(CorrelatorConfig::default(), streams)
}

fn correlate_with(
    config: CorrelatorConfig,
    streams: Vec<Vec<StageRecord>>,
) -> (Vec<Finalized>, LatencyCollector) {
    let mut correlator = Correlator::new(config).unwrap();
    correlator.ingest_all(merge_time_ordered(streams)).unwrap();
    let finalized = correlator.flush();

    let mut collector = LatencyCollector::new().unwrap();
    for timeline in &finalized {
        collector.add(timeline);
    }
    (finalized, collector)
}

#[test]
fn test_all_packets_delivered() {
    let capture = capture(5, &[]);
    assert_eq!(capture.tx.len(), 10);
    assert_eq!(capture.rx.len(), 10);

    let (finalized, collector) = correlate(vec![capture.tx, capture.rx]);

    assert_eq!(finalized.len(), 5);
    let mut sequences = Vec::new();
    for timeline in &finalized {
        match timeline {
            Finalized::Complete(tuple) => {
                assert!(tuple.rx_nic >= 0);
                assert_eq!(tuple.tx_nic, TX_NIC_NS as i64);
                assert_eq!(tuple.in_flight, Some(WIRE_NS as i64));
                sequences.push(tuple.key.sequence);
            }
            Finalized::Loss(loss) => panic!("unexpected loss for {}", loss.key),
        }
    }
    sequences.sort_unstable();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5]);

    assert_eq!(collector.loss_count(), 0);
    let rx_nic = collector.delta(DeltaKind::RxNic).unwrap();
    assert_eq!(rx_nic.samples, 5);
    assert_eq!(rx_nic.negative_samples, 0);
}

#[test]
fn test_lost_packet_becomes_loss_record() {
    let capture = capture(5, &[3]);
    let (finalized, collector) = correlate(vec![capture.tx, capture.rx]);

    let complete: Vec<u16> = finalized
        .iter()
        .filter_map(|f| match f {
            Finalized::Complete(tuple) => Some(tuple.key.sequence),
            Finalized::Loss(_) => None,
        })
        .collect();
    assert_eq!(complete.len(), 4);
    assert!(!complete.contains(&3));

    let losses: Vec<_> = finalized
        .iter()
        .filter_map(|f| match f {
            Finalized::Loss(loss) => Some(loss),
            Finalized::Complete(_) => None,
        })
        .collect();
    assert_eq!(losses.len(), 1);
    assert_eq!(losses[0].key.sequence, 3);
    assert_eq!(losses[0].missing, vec![Stage::RxCompletion, Stage::RxDeliver]);

    assert_eq!(collector.complete_count(), 4);
    assert_eq!(collector.loss_count(), 1);
}

#[test]
fn test_record_logs_through_bounded_sink() {
    let capture = capture(5, &[2]);
    let dir = tempfile::tempdir().unwrap();

    let mut streams = Vec::new();
    for (name, records) in [("tx.csv", &capture.tx), ("rx.csv", &capture.rx)] {
        let path = dir.path().join(name);
        let file = File::create(&path).unwrap();
        let mut sink = BoundedSink::spawn(
            CsvRecordWriter::new(BufWriter::new(file)),
            SinkConfig {
                capacity: 4,
                ..SinkConfig::default()
            },
        )
        .unwrap();
        for record in records.iter() {
            sink.append(*record).unwrap();
        }
        let stats = sink.close().unwrap();
        assert_eq!(stats.written, records.len() as u64);
        assert_eq!(stats.dropped, 0);

        let read = read_record_log(BufReader::new(File::open(&path).unwrap())).unwrap();
        assert_eq!(&read, records);
        streams.push(read);
    }

    let (finalized, collector) = correlate(streams);
    assert_eq!(finalized.len(), 5);
    assert_eq!(collector.complete_count(), 4);
    assert_eq!(collector.loss_count(), 1);
}

#[test]
fn test_driver_trace_refines_probe_records() {
    let capture = capture(3, &[]);

    // Driver sees the enqueue 100ns after the pre-send sample and hands the
    // packet to the stack 30ns before the receive returns. Its TX and RX
    // rings carry their own queue ids.
    let mut trace = String::from("# tracer: nop\n");
    for record in capture.tx.iter().filter(|r| r.stage == Stage::TxEnqueue) {
        trace.push_str(&format!(
            "timestamp_tx-99 [000] ..... 1.0: mqnic_ts_probe_tx_enqueue: TX enqueue: qid=1,seq={},ts_ns={}\n",
            record.sequence,
            record.timestamp_ns + 100
        ));
    }
    for record in capture.rx.iter().filter(|r| r.stage == Stage::RxDeliver) {
        trace.push_str(&format!(
            "<idle>-0 [003] ..s1. 1.0: mqnic_rx_deliver: RX deliver: qid=4 seq={} ts_ns={}\n",
            record.sequence,
            record.timestamp_ns - 30
        ));
    }
    let driver = feed::read_trace(Cursor::new(trace)).unwrap();
    assert_eq!(driver.len(), 6);
    assert!(driver.iter().all(|r| r.origin == Origin::Driver));

    let user_tx: Vec<u64> = capture
        .tx
        .iter()
        .filter(|r| r.stage == Stage::TxEnqueue)
        .map(|r| r.timestamp_ns)
        .collect();

    // Keyed by queue, each driver half stays on its own ring's key
    let (by_queue, by_queue_collector) = correlate(vec![
        capture.tx.clone(),
        capture.rx.clone(),
        driver.clone(),
    ]);
    assert_eq!(by_queue.len(), 9);
    assert_eq!(by_queue_collector.complete_count(), 3);
    assert_eq!(by_queue_collector.loss_count(), 6);
    for timeline in &by_queue {
        match timeline {
            Finalized::Complete(tuple) => {
                assert_eq!(tuple.key.queue_id, 0);
                assert_eq!(tuple.tx_stack, None);
            }
            Finalized::Loss(loss) => assert!([1, 4].contains(&loss.key.queue_id)),
        }
    }

    let config = CorrelatorConfig {
        key_by_queue: false,
        ..CorrelatorConfig::default()
    };
    let (finalized, collector) = correlate_with(config, vec![capture.tx, capture.rx, driver]);
    assert_eq!(finalized.len(), 3);

    for timeline in &finalized {
        let Finalized::Complete(tuple) = timeline else {
            panic!("expected a complete timeline for {}", timeline.key());
        };
        assert_eq!(tuple.tx_stack, Some(100));
        assert_eq!(tuple.rx_stack, Some(30));
        // The driver record wins over the userspace estimate
        let user = user_tx[tuple.key.sequence as usize - 1];
        assert_eq!(tuple.stages[Stage::TxEnqueue.index()], user + 100);
        assert_eq!(tuple.tx_nic, (TX_NIC_NS - 100) as i64);
    }

    let tx_stack = collector.delta(DeltaKind::TxStack).unwrap();
    assert_eq!(tx_stack.samples, 3);
    assert!((tx_stack.mean_ns - 100.0).abs() < 1e-9);
    assert_eq!(collector.delta(DeltaKind::RxStack).unwrap().samples, 3);
}
