//! NIC Timestamp Probe - Userspace Program
//!
//! Runs the TX and RX probe sessions, captures the mqnic driver's stage
//! timestamps and correlates everything into per-packet latency reports.
//!
//! ## Usage
//!
//! ```bash
//! # Receive probe packets on eth1, stamping with its PHC
//! sudo ./nic-ts-probe rx --interface eth1 --phc /dev/ptp1 --output rx.csv
//!
//! # Send 1000 probe packets from eth0
//! sudo ./nic-ts-probe tx --interface eth0 --source 10.0.0.1 --destination 10.0.0.2 \
//!     --count 1000 --output tx.csv
//!
//! # Capture the driver's stage tracepoints for 60 seconds
//! sudo ./nic-ts-probe trace --duration 60 --output driver.csv
//!
//! # Correlate everything into a Prometheus report
//! ./nic-ts-probe correlate --records tx.csv --records rx.csv --records driver.csv \
//!     --format prometheus --output latency.prom
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{info, warn};
use nic_ts_probe::{
    clock::{PhcClock, DEFAULT_PHC_DEVICE},
    collector::LatencyCollector,
    config::{
        CorrelatorConfig, DuplicatePolicy, RxConfig, SinkConfig, SinkPolicy, TxConfig,
        DEFAULT_EPOCH_WINDOW_NS, DEFAULT_SINK_CAPACITY,
    },
    correlator::{merge_time_ordered, Correlator},
    events::EventProcessor,
    exporter::{ExporterType, ReportExporter, TimelineExporter},
    feed::{self, FeedCounters, TRACE_PIPE},
    loader::ProbeLoader,
    net::{RxSocketConfig, TimestampedSocket, TxSocketConfig},
    rx::RxSession,
    session::{SessionSummary, StopSignal},
    sink::{self, BoundedSink, CsvRecordWriter, RecordSink, SinkStats},
    tx::TxSession,
    types::{LatencyReport, StageRecord},
};
use std::{
    fs::File,
    io::BufReader,
    io::BufWriter,
    net::{Ipv4Addr, SocketAddrV4},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader as AsyncBufReader},
    signal,
    sync::mpsc,
    task::JoinHandle,
    time::sleep,
};

/// Default UDP port of the probe traffic
const DEFAULT_PROBE_PORT: u16 = 5000;

/// Records buffered between the driver feed and the record writer
const FEED_CHANNEL_CAPACITY: usize = 8192;

/// Per-stage NIC and driver timestamp probe
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Verbose logging
    #[clap(short, long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send sequence-numbered probe packets and record TX timestamps
    Tx(TxArgs),
    /// Receive probe packets and record RX timestamps
    Rx(RxArgs),
    /// Capture the driver's stage timestamps
    Trace(TraceArgs),
    /// Correlate record logs into a latency report
    Correlate(CorrelateArgs),
}

/// Record log destination shared by the capture commands
#[derive(Args, Debug)]
struct RecordOutput {
    /// Record log to write
    #[clap(short, long)]
    output: PathBuf,

    /// Records buffered ahead of the writer
    #[clap(long, default_value_t = DEFAULT_SINK_CAPACITY)]
    sink_capacity: usize,

    /// What to do when the buffer is full
    #[clap(long, value_enum, default_value_t = SinkPolicy::Block)]
    sink_policy: SinkPolicy,
}

impl RecordOutput {
    fn sink_config(&self) -> SinkConfig {
        SinkConfig {
            capacity: self.sink_capacity,
            policy: self.sink_policy,
        }
    }

    /// Create the log file and start its writer thread
    fn open(&self) -> Result<BoundedSink> {
        let file = File::create(&self.output)
            .with_context(|| format!("Failed to create record log: {:?}", self.output))?;
        let sink = BoundedSink::spawn(CsvRecordWriter::new(BufWriter::new(file)), self.sink_config())?;
        Ok(sink)
    }
}

#[derive(Args, Debug)]
struct TxArgs {
    /// Interface to send from
    #[clap(short, long)]
    interface: String,

    /// Source IPv4 address
    #[clap(long)]
    source: Ipv4Addr,

    /// Source UDP port
    #[clap(long, default_value_t = DEFAULT_PROBE_PORT)]
    source_port: u16,

    /// Destination IPv4 address
    #[clap(long)]
    destination: Ipv4Addr,

    /// Destination UDP port
    #[clap(long, default_value_t = DEFAULT_PROBE_PORT)]
    destination_port: u16,

    /// Number of packets to send
    #[clap(short, long, default_value_t = 1)]
    count: u32,

    /// Sequence number of the first packet
    #[clap(long, default_value_t = 1)]
    first_sequence: u32,

    /// Queue id recorded with every record
    #[clap(long, default_value_t = 0)]
    queue: i32,

    /// Datagram size in bytes
    #[clap(long, default_value_t = nic_ts_probe::codec::DEFAULT_PAYLOAD_SIZE)]
    payload_size: usize,

    /// Pause between packets (microseconds)
    #[clap(long, default_value_t = 0)]
    interval_us: u64,

    /// Wait for each hardware TX completion (milliseconds)
    #[clap(long, default_value_t = 10)]
    completion_timeout_ms: u64,

    /// Epoch window the records will be correlated with (nanoseconds)
    #[clap(long, default_value_t = DEFAULT_EPOCH_WINDOW_NS)]
    epoch_window_ns: u64,

    /// PTP hardware clock of the interface
    #[clap(long, default_value = DEFAULT_PHC_DEVICE)]
    phc: PathBuf,

    #[clap(flatten)]
    output: RecordOutput,
}

#[derive(Args, Debug)]
struct RxArgs {
    /// Interface to receive on
    #[clap(short, long)]
    interface: String,

    /// Address to bind
    #[clap(long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind: Ipv4Addr,

    /// UDP port to bind
    #[clap(long, default_value_t = DEFAULT_PROBE_PORT)]
    port: u16,

    /// Stop after this many packets
    #[clap(short, long)]
    count: Option<u64>,

    /// Stop after the first packet
    #[clap(long, conflicts_with = "count")]
    once: bool,

    /// Queue id recorded with every record
    #[clap(long, default_value_t = 0)]
    queue: i32,

    /// How often a blocked receive checks for a stop request (milliseconds)
    #[clap(long, default_value_t = 100)]
    poll_ms: u64,

    /// PTP hardware clock of the interface
    #[clap(long, default_value = DEFAULT_PHC_DEVICE)]
    phc: PathBuf,

    #[clap(flatten)]
    output: RecordOutput,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum TraceSource {
    /// Attach eBPF forwarders to the driver tracepoints
    Ebpf,
    /// Read ftrace text from trace_pipe or a saved trace
    Tracefs,
}

#[derive(Args, Debug)]
struct TraceArgs {
    /// Where the driver's stage events come from
    #[clap(long, value_enum, default_value_t = TraceSource::Ebpf)]
    source: TraceSource,

    /// Path to eBPF object file (optional, uses embedded if not specified)
    #[clap(long)]
    ebpf_object: Option<PathBuf>,

    /// ftrace text to read with `--source tracefs`
    #[clap(long, default_value = TRACE_PIPE)]
    trace_file: PathBuf,

    /// Duration to capture (in seconds, 0 = until interrupted)
    #[clap(short, long, default_value_t = 0)]
    duration: u64,

    /// Progress report interval (in seconds)
    #[clap(long, default_value_t = 10)]
    progress_interval: u64,

    #[clap(flatten)]
    output: RecordOutput,
}

#[derive(Args, Debug)]
struct CorrelateArgs {
    /// Record logs (canonical or legacy TX/RX format)
    #[clap(short, long)]
    records: Vec<PathBuf>,

    /// Saved ftrace text with driver stage events
    #[clap(short, long)]
    trace: Vec<PathBuf>,

    /// Inactivity window before a timeline is finalized (nanoseconds)
    #[clap(long, default_value_t = DEFAULT_EPOCH_WINDOW_NS)]
    epoch_window_ns: u64,

    /// Handling of repeated stages
    #[clap(long, value_enum, default_value_t = DuplicatePolicy::KeepEarliest)]
    duplicate_policy: DuplicatePolicy,

    /// Key packets by sequence only, folding every queue id together
    ///
    /// The driver reports its own TX and RX queue ids, which usually differ
    /// from each other and from the sessions' `--queue`. Driver stages only
    /// join the session records of the same packet with this flag set.
    #[clap(long)]
    ignore_queue: bool,

    /// TX and RX were stamped by different clocks
    #[clap(long)]
    unshared_clock: bool,

    /// Report format
    #[clap(short, long, value_enum, default_value_t = ExporterType::Json)]
    format: ExporterType,

    /// Report file
    #[clap(short, long, default_value = "latency-report.json")]
    output: PathBuf,

    /// Also write per-packet timelines as CSV
    #[clap(long)]
    timelines: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    print_banner();

    match cli.command {
        Command::Tx(args) => run_tx(args).await,
        Command::Rx(args) => run_rx(args).await,
        Command::Trace(args) => run_trace(args).await,
        Command::Correlate(args) => run_correlate(args),
    }
}

async fn run_tx(args: TxArgs) -> Result<()> {
    let config = TxConfig {
        count: args.count,
        first_sequence: args.first_sequence,
        queue_id: args.queue,
        payload_size: args.payload_size,
        send_interval: Duration::from_micros(args.interval_us),
        completion_timeout: Duration::from_millis(args.completion_timeout_ms),
    };
    config.validate(args.epoch_window_ns)?;

    info!("Starting TX probe...");
    info!("   Interface: {}", args.interface);
    info!("   Packets: {} from sequence {}", config.count, config.first_sequence);
    info!("   Output: {:?}", args.output.output);

    let clock = PhcClock::open(&args.phc)?;
    let socket = TimestampedSocket::open_tx(&TxSocketConfig {
        interface: args.interface.clone(),
        source: SocketAddrV4::new(args.source, args.source_port),
        destination: SocketAddrV4::new(args.destination, args.destination_port),
        completion_timeout: config.completion_timeout,
    })
    .with_context(|| format!("Failed to open TX socket on {}", args.interface))?;
    let mut sink = args.output.open()?;

    let stop = StopSignal::new();
    let session_stop = stop.clone();
    let (summary, stats) = run_session(stop, move || {
        let mut session = TxSession::new(config, clock, socket);
        session.configure()?;
        let summary = session.run(&mut sink, &session_stop)?;
        Ok((summary, sink.close()?))
    })
    .await?;

    print_session_summary("TX", &summary, &stats);
    Ok(())
}

async fn run_rx(args: RxArgs) -> Result<()> {
    let config = RxConfig {
        max_packets: if args.once { Some(1) } else { args.count },
        queue_id: args.queue,
        ..RxConfig::default()
    };
    config.validate()?;

    info!("Starting RX probe...");
    info!("   Interface: {}", args.interface);
    info!("   Listening: {}:{}", args.bind, args.port);
    info!("   Output: {:?}", args.output.output);

    let clock = PhcClock::open(&args.phc)?;
    let socket = TimestampedSocket::open_rx(&RxSocketConfig {
        interface: args.interface.clone(),
        bind: SocketAddrV4::new(args.bind, args.port),
        recv_timeout: Duration::from_millis(args.poll_ms.max(1)),
    })
    .with_context(|| format!("Failed to open RX socket on {}", args.interface))?;
    let mut sink = args.output.open()?;

    let stop = StopSignal::new();
    let session_stop = stop.clone();
    let (summary, stats) = run_session(stop, move || {
        let mut session = RxSession::new(config, clock, socket);
        session.configure()?;
        let summary = session.run(&mut sink, &session_stop)?;
        Ok((summary, sink.close()?))
    })
    .await?;

    print_session_summary("RX", &summary, &stats);
    Ok(())
}

/// Run a blocking probe session, stopping it on Ctrl-C
async fn run_session<F>(stop: StopSignal, session: F) -> Result<(SessionSummary, SinkStats)>
where
    F: FnOnce() -> nic_ts_probe::Result<(SessionSummary, SinkStats)> + Send + 'static,
{
    let mut handle = tokio::task::spawn_blocking(session);

    let joined = tokio::select! {
        joined = &mut handle => joined,
        _ = signal::ctrl_c() => {
            info!("Interrupted, stopping session...");
            stop.trigger();
            handle.await
        }
    };

    let outcome = joined.context("Probe session task failed")?;
    Ok(outcome?)
}

/// Drain a record channel into the sink on a blocking thread
fn spawn_record_writer(
    mut records: mpsc::Receiver<StageRecord>,
    mut sink: BoundedSink,
) -> JoinHandle<nic_ts_probe::Result<SinkStats>> {
    tokio::task::spawn_blocking(move || {
        while let Some(record) = records.blocking_recv() {
            sink.append(record)?;
        }
        sink.close()
    })
}

async fn wait_for_shutdown(duration: u64) -> Result<()> {
    if duration > 0 {
        tokio::select! {
            _ = sleep(Duration::from_secs(duration)) => {
                info!("Duration reached, shutting down...");
            }
            _ = signal::ctrl_c() => {
                info!("Interrupted, shutting down...");
            }
        }
    } else {
        signal::ctrl_c().await?;
        info!("Interrupted, shutting down...");
    }
    Ok(())
}

async fn run_trace(args: TraceArgs) -> Result<()> {
    info!("Starting driver stage capture...");
    info!("   Source: {:?}", args.source);
    info!(
        "   Duration: {} seconds",
        if args.duration == 0 {
            "infinite".to_string()
        } else {
            args.duration.to_string()
        }
    );
    info!("   Output: {:?}", args.output.output);

    let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
    let writer = spawn_record_writer(rx, args.output.open()?);

    match args.source {
        TraceSource::Ebpf => {
            // Load eBPF program
            let mut loader = ProbeLoader::load(args.ebpf_object.clone())?;
            let attached = loader.attach_tracepoints()?;
            info!("Attached {} stage tracepoints", attached);

            let perf_array = loader.get_perf_array()?;
            let processor = EventProcessor::new(tx);
            let readers = processor.spawn_cpu_readers(perf_array)?;
            processor.spawn_progress_reporter(args.progress_interval);

            wait_for_shutdown(args.duration).await?;

            for reader in &readers {
                reader.abort();
            }
            let snapshot = processor.stats();
            drop(processor);

            info!(
                "Driver events: {} forwarded, {} lost, {} malformed",
                snapshot.events, snapshot.lost, snapshot.malformed
            );
            match loader.read_stats() {
                Ok(stats) => {
                    for (name, value) in stats {
                        info!("   kernel {}: {}", name, value);
                    }
                }
                Err(e) => warn!("Failed to read kernel counters: {}", e),
            }
        }
        TraceSource::Tracefs => {
            let counters = tokio::select! {
                counters = stream_trace(&args.trace_file, tx, args.duration) => counters?,
                _ = signal::ctrl_c() => {
                    info!("Interrupted, shutting down...");
                    FeedCounters::default()
                }
            };
            if counters.seen > 0 {
                info!(
                    "Trace lines: {} read, {} stage records, {} malformed",
                    counters.seen, counters.records, counters.malformed
                );
            }
        }
    }

    let stats = writer.await.context("Record writer task failed")??;
    info!("Records written to {:?}", args.output.output);
    info!("   written: {}, dropped: {}", stats.written, stats.dropped);
    Ok(())
}

/// Forward driver stage lines from ftrace text until EOF or the duration ends
async fn stream_trace(path: &Path, records: mpsc::Sender<StageRecord>, duration: u64) -> Result<FeedCounters> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open trace: {:?}", path))?;
    let mut lines = AsyncBufReader::new(file).lines();
    let mut counters = FeedCounters::default();

    let deadline = (duration > 0).then(|| tokio::time::Instant::now() + Duration::from_secs(duration));
    let expired = async {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(expired);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut expired => {
                info!("Duration reached, shutting down...");
                break;
            }
        };
        let Some(line) = line else { break };

        counters.seen += 1;
        match feed::parse_trace_line(&line) {
            Ok(Some(record)) => {
                if records.send(record).await.is_err() {
                    break;
                }
                counters.records += 1;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("{}", e);
                counters.malformed += 1;
            }
        }
    }

    Ok(counters)
}

fn run_correlate(args: CorrelateArgs) -> Result<()> {
    if args.records.is_empty() && args.trace.is_empty() {
        anyhow::bail!("Nothing to correlate: pass --records and/or --trace");
    }

    let config = CorrelatorConfig {
        epoch_window_ns: args.epoch_window_ns,
        duplicate_policy: args.duplicate_policy,
        key_by_queue: !args.ignore_queue,
        shared_clock: !args.unshared_clock,
    };

    let mut streams = Vec::new();
    for path in &args.records {
        let file = File::open(path).with_context(|| format!("Failed to open record log: {:?}", path))?;
        let records = sink::read_record_log(BufReader::new(file))
            .with_context(|| format!("Failed to read record log: {:?}", path))?;
        info!("Loaded {} records from {:?}", records.len(), path);
        streams.push(records);
    }
    for path in &args.trace {
        let file = File::open(path).with_context(|| format!("Failed to open trace: {:?}", path))?;
        let records = feed::read_trace(BufReader::new(file))
            .with_context(|| format!("Failed to read trace: {:?}", path))?;
        info!("Loaded {} driver records from {:?}", records.len(), path);
        streams.push(records);
    }

    let mut correlator = Correlator::new(config)?;
    correlator.ingest_all(merge_time_ordered(streams))?;
    let finalized = correlator.flush();

    let mut collector = LatencyCollector::new()?;
    for timeline in &finalized {
        collector.add(timeline);
    }

    if let Some(path) = &args.timelines {
        TimelineExporter::new(path.clone()).export(&finalized)?;
        info!("Timelines written to {:?}", path);
    }

    info!("Generating latency report...");
    let report = collector.generate_report(correlator.config(), correlator.counters());
    args.format.exporter(args.output.clone()).export(&report)?;
    info!("Report written to {:?}", args.output);

    print_summary(&report);
    Ok(())
}

fn print_banner() {
    println!(
        r#"
╔═══════════════════════════════════════════════════╗
║        NIC Timestamp Probe - mqnic                ║
║        Per-stage Packet Latency                   ║
╚═══════════════════════════════════════════════════╝
    "#
    );
}

fn print_session_summary(side: &str, summary: &SessionSummary, stats: &SinkStats) {
    info!("");
    info!("============================================");
    info!("             {} Session Summary", side);
    info!("============================================");
    info!("");
    info!("  Packets:            {}", summary.packets);
    info!("  Records written:    {}", stats.written);
    info!("  Records dropped:    {}", stats.dropped);
    if side == "TX" {
        info!("  HW completions:     {}", summary.tx_completions);
        info!("  Missing HW stamps:  {}", summary.tx_completions_missing);
    } else {
        info!("  Decode failures:    {}", summary.decode_failures);
        info!("  Missing HW stamps:  {}", summary.rx_hardware_missing);
    }
    if summary.stopped_early {
        info!("  (stopped before completion)");
    }
    info!("");
    info!("============================================");
}

fn print_summary(report: &LatencyReport) {
    let c = &report.counters;

    info!("");
    info!("============================================");
    info!("             Summary Report");
    info!("============================================");
    info!("");
    info!("  Records ingested:   {}", c.records_ingested);
    info!("  Duplicates:         {}", c.duplicate_records);
    info!("  Late records:       {}", c.late_records);
    info!("  Complete packets:   {}", c.complete_timelines);
    info!("  Partial packets:    {}", c.partial_timelines);
    info!("  Epoch splits:       {}", c.epoch_splits);
    info!("");
    info!("  Latency (ns)         samples       p50       p99      p999");
    for (name, delta) in &report.deltas {
        info!(
            "    {:<16} {:>10} {:>9} {:>9} {:>9}",
            name, delta.samples, delta.percentiles.p50, delta.percentiles.p99, delta.percentiles.p999
        );
        if delta.negative_samples > 0 {
            warn!(
                "    {} has {} negative samples; check clock synchronization",
                name, delta.negative_samples
            );
        }
    }
    if report.losses.total > 0 {
        info!("");
        info!("  Missing stages:");
        for (stage, count) in &report.losses.missing_by_stage {
            info!("    {:<16} {:>8}", stage, count);
        }
    }
    info!("");
    info!("============================================");
}
