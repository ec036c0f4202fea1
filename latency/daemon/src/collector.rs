//! Latency aggregation
//!
//! Folds finalized timelines into per-delta statistics and a loss
//! breakdown. Every statistic is updated incrementally: a running
//! mean/variance (Welford), an HDR histogram for percentiles and the
//! coarse bucket histogram used in reports.

use crate::{
    config::CorrelatorConfig,
    correlator::{Finalized, LatencyTuple, LossRecord},
    error::{ProbeError, Result},
    types::*,
};
use hdrhistogram::Histogram;
use std::collections::BTreeMap;

/// Upper bound of the percentile histogram (one hour in nanoseconds)
const HISTOGRAM_MAX_NS: u64 = 3_600_000_000_000;

/// Running statistics for one delta kind
struct DeltaStats {
    count: u64,
    negatives: u64,
    min: i64,
    max: i64,
    mean: f64,
    /// Sum of squared deviations from the running mean
    m2: f64,
    percentiles: Histogram<u64>,
    buckets: LatencyHistogram,
}

impl DeltaStats {
    fn new() -> Result<Self> {
        // 1ns to 1 hour, 3 significant digits
        let percentiles = Histogram::new_with_bounds(1, HISTOGRAM_MAX_NS, 3)
            .map_err(|e| ProbeError::Stats(format!("histogram: {}", e)))?;

        Ok(Self {
            count: 0,
            negatives: 0,
            min: i64::MAX,
            max: i64::MIN,
            mean: 0.0,
            m2: 0.0,
            percentiles,
            buckets: LatencyHistogram::default(),
        })
    }

    fn record(&mut self, value_ns: i64) {
        self.count += 1;
        self.min = self.min.min(value_ns);
        self.max = self.max.max(value_ns);

        let x = value_ns as f64;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);

        self.buckets.add_sample(value_ns);

        // Negative deltas mean clock disagreement; keep them out of percentiles
        if value_ns < 0 {
            self.negatives += 1;
        } else {
            self.percentiles.saturating_record(value_ns as u64);
        }
    }

    fn summary(&self) -> DeltaSummary {
        if self.count == 0 {
            return DeltaSummary::default();
        }

        let std_dev = if self.count > 1 {
            (self.m2 / (self.count - 1) as f64).sqrt()
        } else {
            0.0
        };

        let percentiles = if self.percentiles.len() == 0 {
            Percentiles::default()
        } else {
            let h = &self.percentiles;
            Percentiles {
                p50: h.value_at_quantile(0.50),
                p75: h.value_at_quantile(0.75),
                p90: h.value_at_quantile(0.90),
                p95: h.value_at_quantile(0.95),
                p99: h.value_at_quantile(0.99),
                p999: h.value_at_quantile(0.999),
            }
        };

        DeltaSummary {
            samples: self.count,
            negative_samples: self.negatives,
            min_ns: self.min,
            max_ns: self.max,
            mean_ns: self.mean,
            std_dev_ns: std_dev,
            percentiles,
            histogram: self.buckets.clone(),
        }
    }
}

/// Aggregates finalized timelines into a [`LatencyReport`]
pub struct LatencyCollector {
    deltas: BTreeMap<DeltaKind, DeltaStats>,
    losses: LossBreakdown,
    complete: u64,
}

impl LatencyCollector {
    pub fn new() -> Result<Self> {
        let deltas = DeltaKind::ALL
            .into_iter()
            .map(|kind| DeltaStats::new().map(|stats| (kind, stats)))
            .collect::<Result<_>>()?;

        Ok(Self {
            deltas,
            losses: LossBreakdown::default(),
            complete: 0,
        })
    }

    /// Fold one finalized timeline in
    pub fn add(&mut self, finalized: &Finalized) {
        match finalized {
            Finalized::Complete(tuple) => self.add_tuple(tuple),
            Finalized::Loss(loss) => self.add_loss(loss),
        }
    }

    pub fn add_tuple(&mut self, tuple: &LatencyTuple) {
        for (kind, value) in tuple.deltas() {
            if let Some(stats) = self.deltas.get_mut(&kind) {
                stats.record(value);
            }
        }
        self.complete += 1;
    }

    pub fn add_loss(&mut self, loss: &LossRecord) {
        self.losses.total += 1;
        for stage in &loss.missing {
            *self
                .losses
                .missing_by_stage
                .entry(stage.name().to_string())
                .or_insert(0) += 1;
        }
    }

    /// Complete timelines folded in so far
    pub fn complete_count(&self) -> u64 {
        self.complete
    }

    /// Loss records folded in so far
    pub fn loss_count(&self) -> u64 {
        self.losses.total
    }

    /// Current statistics for one delta, if it has samples
    pub fn delta(&self, kind: DeltaKind) -> Option<DeltaSummary> {
        self.deltas
            .get(&kind)
            .filter(|stats| stats.count > 0)
            .map(DeltaStats::summary)
    }

    /// Build the report for export
    pub fn generate_report(
        &self,
        config: &CorrelatorConfig,
        counters: &CorrelationCounters,
    ) -> LatencyReport {
        let deltas = self
            .deltas
            .iter()
            .filter(|(_, stats)| stats.count > 0)
            .map(|(kind, stats)| (kind.name().to_string(), stats.summary()))
            .collect();

        LatencyReport {
            timestamp: chrono::Utc::now().to_rfc3339(),
            config: config.clone(),
            counters: counters.clone(),
            deltas,
            losses: self.losses.clone(),
        }
    }
}
