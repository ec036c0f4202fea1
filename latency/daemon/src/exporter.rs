//! Report exporters
//!
//! Writes the aggregated [`LatencyReport`] as JSON, Prometheus text or
//! InfluxDB line protocol, and per-packet results as a timeline CSV.

use crate::{
    correlator::Finalized,
    types::{DeltaKind, DeltaSummary, LatencyReport, Stage},
};
use anyhow::{Context, Result};
use clap::ValueEnum;
use std::{
    fmt::Write as _,
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
};

/// Trait for report exporters
pub trait ReportExporter {
    /// Export a report
    fn export(&self, report: &LatencyReport) -> Result<()>;
}

/// Export format type
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterType {
    /// JSON format
    Json,
    /// Prometheus text format
    #[value(alias = "prom")]
    Prometheus,
    /// InfluxDB line protocol
    #[value(alias = "influxdb")]
    Influx,
}

impl ExporterType {
    /// Build the exporter for this format
    pub fn exporter(self, output_path: PathBuf) -> Box<dyn ReportExporter> {
        match self {
            ExporterType::Json => Box::new(JsonExporter::new(output_path, true)),
            ExporterType::Prometheus => Box::new(PrometheusExporter::new(output_path)),
            ExporterType::Influx => {
                Box::new(InfluxExporter::new(output_path, "nic_ts_probe".to_string()))
            }
        }
    }
}

fn write_file(path: &PathBuf, data: &str) -> Result<()> {
    let mut file = File::create(path)
        .with_context(|| format!("Failed to create output file: {:?}", path))?;

    file.write_all(data.as_bytes())
        .with_context(|| format!("Failed to write to output file: {:?}", path))?;

    Ok(())
}

/// JSON exporter
pub struct JsonExporter {
    output_path: PathBuf,
    pretty: bool,
}

impl JsonExporter {
    /// Create a new JSON exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    /// * `pretty` - Enable pretty-printing
    pub fn new(output_path: PathBuf, pretty: bool) -> Self {
        Self {
            output_path,
            pretty,
        }
    }
}

impl ReportExporter for JsonExporter {
    fn export(&self, report: &LatencyReport) -> Result<()> {
        let json = if self.pretty {
            serde_json::to_string_pretty(report)?
        } else {
            serde_json::to_string(report)?
        };

        write_file(&self.output_path, &json)
    }
}

/// Prometheus exporter
pub struct PrometheusExporter {
    output_path: PathBuf,
}

impl PrometheusExporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    /// Convert a report to Prometheus text format
    fn to_prometheus_format(report: &LatencyReport) -> String {
        let mut output = String::new();
        let c = &report.counters;

        output.push_str("# HELP nic_ts_records_total Stage records by outcome\n");
        output.push_str("# TYPE nic_ts_records_total counter\n");
        for (outcome, value) in [
            ("ingested", c.records_ingested),
            ("duplicate", c.duplicate_records),
            ("late", c.late_records),
        ] {
            let _ = writeln!(output, "nic_ts_records_total{{outcome=\"{}\"}} {}", outcome, value);
        }
        output.push('\n');

        output.push_str("# HELP nic_ts_timelines_total Finalized packet timelines\n");
        output.push_str("# TYPE nic_ts_timelines_total counter\n");
        let _ = writeln!(output, "nic_ts_timelines_total{{status=\"complete\"}} {}", c.complete_timelines);
        let _ = writeln!(output, "nic_ts_timelines_total{{status=\"partial\"}} {}", c.partial_timelines);
        output.push('\n');

        output.push_str("# HELP nic_ts_epoch_splits_total Keys reused across epochs\n");
        output.push_str("# TYPE nic_ts_epoch_splits_total counter\n");
        let _ = writeln!(output, "nic_ts_epoch_splits_total {}", c.epoch_splits);
        output.push('\n');

        output.push_str("# HELP nic_ts_missing_stage_total Partial timelines by missing stage\n");
        output.push_str("# TYPE nic_ts_missing_stage_total counter\n");
        for stage in Stage::ALL {
            let missing = report.losses.missing_by_stage.get(stage.name()).copied().unwrap_or(0);
            let _ = writeln!(output, "nic_ts_missing_stage_total{{stage=\"{}\"}} {}", stage, missing);
        }
        output.push('\n');

        output.push_str("# HELP nic_ts_delta_nanoseconds Stage-to-stage latency percentiles\n");
        output.push_str("# TYPE nic_ts_delta_nanoseconds gauge\n");
        for (name, delta) in &report.deltas {
            let p = &delta.percentiles;
            for (quantile, value) in [
                ("0.50", p.p50),
                ("0.75", p.p75),
                ("0.90", p.p90),
                ("0.95", p.p95),
                ("0.99", p.p99),
                ("0.999", p.p999),
            ] {
                let _ = writeln!(
                    output,
                    "nic_ts_delta_nanoseconds{{delta=\"{}\",quantile=\"{}\"}} {}",
                    name, quantile, value
                );
            }
        }
        output.push('\n');

        output.push_str("# HELP nic_ts_delta_samples_total Samples per delta\n");
        output.push_str("# TYPE nic_ts_delta_samples_total counter\n");
        for (name, delta) in &report.deltas {
            let _ = writeln!(output, "nic_ts_delta_samples_total{{delta=\"{}\"}} {}", name, delta.samples);
            let _ = writeln!(
                output,
                "nic_ts_delta_negative_samples_total{{delta=\"{}\"}} {}",
                name, delta.negative_samples
            );
        }
        output.push('\n');

        output.push_str("# HELP nic_ts_delta_histogram_bucket Delta histogram buckets (ns)\n");
        output.push_str("# TYPE nic_ts_delta_histogram_bucket gauge\n");
        for (name, delta) in &report.deltas {
            let h = &delta.histogram;
            for (le, count) in [
                ("1000", h.bucket_0_1us),
                ("5000", h.bucket_1_5us),
                ("10000", h.bucket_5_10us),
                ("50000", h.bucket_10_50us),
                ("100000", h.bucket_50_100us),
                ("+Inf", h.bucket_100us_plus),
            ] {
                let _ = writeln!(
                    output,
                    "nic_ts_delta_histogram_bucket{{delta=\"{}\",le=\"{}\"}} {}",
                    name, le, count
                );
            }
        }
        output.push('\n');

        output
    }
}

impl ReportExporter for PrometheusExporter {
    fn export(&self, report: &LatencyReport) -> Result<()> {
        write_file(&self.output_path, &Self::to_prometheus_format(report))
    }
}

/// InfluxDB line protocol exporter
pub struct InfluxExporter {
    output_path: PathBuf,
    measurement: String,
}

impl InfluxExporter {
    /// Create a new InfluxDB exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    /// * `measurement` - Measurement name for InfluxDB
    pub fn new(output_path: PathBuf, measurement: String) -> Self {
        Self {
            output_path,
            measurement,
        }
    }

    fn delta_line(measurement: &str, name: &str, delta: &DeltaSummary, timestamp: i64) -> String {
        let p = &delta.percentiles;
        format!(
            "{},type=delta,delta={} samples={}i,negative={}i,min={}i,max={}i,mean={},std_dev={},p50={}i,p75={}i,p90={}i,p95={}i,p99={}i,p999={}i {}\n",
            measurement,
            name,
            delta.samples,
            delta.negative_samples,
            delta.min_ns,
            delta.max_ns,
            delta.mean_ns,
            delta.std_dev_ns,
            p.p50,
            p.p75,
            p.p90,
            p.p95,
            p.p99,
            p.p999,
            timestamp
        )
    }

    /// Convert a report to InfluxDB line protocol
    fn to_influx_format(report: &LatencyReport, measurement: &str) -> String {
        let mut output = String::new();
        let timestamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);
        let c = &report.counters;

        output.push_str(&format!(
            "{},type=summary records={}i,duplicates={}i,late={}i,complete={}i,partial={}i,epoch_splits={}i {}\n",
            measurement,
            c.records_ingested,
            c.duplicate_records,
            c.late_records,
            c.complete_timelines,
            c.partial_timelines,
            c.epoch_splits,
            timestamp
        ));

        for (name, delta) in &report.deltas {
            output.push_str(&Self::delta_line(measurement, name, delta, timestamp));
        }

        let missing: Vec<String> = Stage::ALL
            .iter()
            .map(|stage| {
                format!(
                    "{}={}i",
                    stage,
                    report.losses.missing_by_stage.get(stage.name()).copied().unwrap_or(0)
                )
            })
            .collect();
        output.push_str(&format!(
            "{},type=losses total={}i,{} {}\n",
            measurement,
            report.losses.total,
            missing.join(","),
            timestamp
        ));

        output
    }
}

impl ReportExporter for InfluxExporter {
    fn export(&self, report: &LatencyReport) -> Result<()> {
        write_file(&self.output_path, &Self::to_influx_format(report, &self.measurement))
    }
}

/// Column header of the timeline CSV
pub const TIMELINE_HEADER: &str = "queue_id,sequence,status,tx_enqueue_ns,tx_completion_ns,rx_completion_ns,rx_deliver_ns,tx_stack_ns,tx_nic_ns,in_flight_ns,rx_nic_ns,rx_stack_ns,end_to_end_ns,missing";

/// Format one finalized timeline as a CSV line
///
/// Absent values are left empty; `missing` lists stage names joined by `|`.
pub fn format_timeline(finalized: &Finalized) -> String {
    let opt = |value: Option<i64>| value.map(|v| v.to_string()).unwrap_or_default();

    match finalized {
        Finalized::Complete(tuple) => {
            let deltas: Vec<String> = DeltaKind::ALL.iter().map(|&kind| opt(tuple.delta(kind))).collect();
            format!(
                "{},{},complete,{},{},{},{},{},",
                tuple.key.queue_id,
                tuple.key.sequence,
                tuple.stages[0],
                tuple.stages[1],
                tuple.stages[2],
                tuple.stages[3],
                deltas.join(",")
            )
        }
        Finalized::Loss(loss) => {
            let stages: Vec<String> = Stage::ALL
                .iter()
                .map(|&stage| {
                    opt(loss
                        .present
                        .iter()
                        .find(|record| record.stage == stage)
                        .map(|record| record.timestamp_ns as i64))
                })
                .collect();
            let missing: Vec<&str> = loss.missing.iter().map(|stage| stage.name()).collect();
            format!(
                "{},{},partial,{},{}{}",
                loss.key.queue_id,
                loss.key.sequence,
                stages.join(","),
                ",".repeat(DeltaKind::ALL.len()),
                missing.join("|")
            )
        }
    }
}

/// Writes per-packet results as CSV
pub struct TimelineExporter {
    output_path: PathBuf,
}

impl TimelineExporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    pub fn export<'a>(&self, timelines: impl IntoIterator<Item = &'a Finalized>) -> Result<()> {
        let file = File::create(&self.output_path)
            .with_context(|| format!("Failed to create output file: {:?}", self.output_path))?;
        let mut writer = BufWriter::new(file);

        writeln!(writer, "{}", TIMELINE_HEADER)?;
        for finalized in timelines {
            writeln!(writer, "{}", format_timeline(finalized))?;
        }
        writer
            .flush()
            .with_context(|| format!("Failed to write to output file: {:?}", self.output_path))?;

        Ok(())
    }
}
