//! Stage record correlator
//!
//! Joins the interleaved records of every producer into one
//! [`PacketTimeline`] per packet and epoch, then finalizes each timeline
//! into either a [`LatencyTuple`] (all four stages present) or a
//! [`LossRecord`] naming what is missing.
//!
//! ## Epochs
//!
//! Packet keys are only 16 bits wide, so the same key recurs. A record
//! joins an open timeline only when it lies within `epoch_window_ns` of
//! that timeline's span. The watermark (largest timestamp seen so far)
//! drives finalization: a timeline whose newest record is more than one
//! window behind the watermark is closed before the next lookup, so a
//! recurring key starts a fresh timeline. A record more than one window
//! behind the watermark that fits no open timeline is late and dropped.
//!
//! Without a shared clock, TX and RX timestamps live in different
//! domains: epoch checks compare only records of the same half and
//! nothing is finalized before [`Correlator::flush`].
//!
//! ## Ranks
//!
//! Each stage keeps one record per [`Rank`]. The highest rank present is
//! the stage's value; the userspace estimate of a driver-reported stage
//! is kept for the stack deltas.

use crate::{
    config::{CorrelatorConfig, DuplicatePolicy},
    error::{ProbeError, Result},
    types::{CorrelationCounters, DeltaKind, Half, PacketKey, Rank, Stage, StageRecord},
};
use log::{debug, trace, warn};
use nic_ts_common::constants::STAGE_COUNT;
use std::collections::{BTreeSet, HashMap, VecDeque};

/// What happened to an ingested record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored in an existing or new timeline
    Accepted,
    /// Stored in a new timeline after closing the key's previous epoch
    NewEpoch,
    /// The stage was already filled at this rank (keep-earliest policy)
    Duplicate,
    /// Older than the watermark allows and fits no open timeline
    Late,
}

/// Partial or complete record set for one packet
#[derive(Debug, Clone)]
pub struct PacketTimeline {
    key: PacketKey,
    slots: [[Option<StageRecord>; Rank::COUNT]; STAGE_COUNT],
    span: (u64, u64),
    tx_span: Option<(u64, u64)>,
    rx_span: Option<(u64, u64)>,
}

fn widen(span: Option<(u64, u64)>, ts: u64) -> (u64, u64) {
    match span {
        Some((lo, hi)) => (lo.min(ts), hi.max(ts)),
        None => (ts, ts),
    }
}

enum Placement {
    Fits,
    Before,
    After,
}

impl PacketTimeline {
    fn new(key: PacketKey, first: &StageRecord) -> Self {
        Self {
            key,
            slots: Default::default(),
            span: (first.timestamp_ns, first.timestamp_ns),
            tx_span: None,
            rx_span: None,
        }
    }

    pub fn key(&self) -> PacketKey {
        self.key
    }

    /// Timestamp of the newest record
    pub fn last_update(&self) -> u64 {
        self.span.1
    }

    /// Record stored for a stage at a specific rank
    pub fn record(&self, stage: Stage, rank: Rank) -> Option<&StageRecord> {
        self.slots[stage.index()][rank.index()].as_ref()
    }

    /// Highest-ranked record for a stage
    pub fn resolved(&self, stage: Stage) -> Option<&StageRecord> {
        self.slots[stage.index()].iter().rev().flatten().next()
    }

    pub fn is_complete(&self) -> bool {
        Stage::ALL.iter().all(|&stage| self.resolved(stage).is_some())
    }

    pub fn missing_stages(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|&stage| self.resolved(stage).is_none())
            .collect()
    }

    fn place(&self, record: &StageRecord, window: u64, shared_clock: bool) -> Placement {
        let span = if shared_clock {
            Some(self.span)
        } else {
            match record.stage.half() {
                Half::Tx => self.tx_span,
                Half::Rx => self.rx_span,
            }
        };

        match span {
            None => Placement::Fits,
            Some((lo, _)) if record.timestamp_ns.saturating_add(window) < lo => Placement::Before,
            Some((_, hi)) if record.timestamp_ns > hi.saturating_add(window) => Placement::After,
            Some(_) => Placement::Fits,
        }
    }

    fn store(&mut self, record: StageRecord) {
        let ts = record.timestamp_ns;
        self.slots[record.stage.index()][record.rank().index()] = Some(record);
        self.span = widen(Some(self.span), ts);
        match record.stage.half() {
            Half::Tx => self.tx_span = Some(widen(self.tx_span, ts)),
            Half::Rx => self.rx_span = Some(widen(self.rx_span, ts)),
        }
    }
}

/// Per-packet latency components of a complete timeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyTuple {
    pub key: PacketKey,
    /// Resolved stage timestamps in pipeline order
    pub stages: [u64; STAGE_COUNT],
    pub tx_nic: i64,
    pub rx_nic: i64,
    pub in_flight: Option<i64>,
    pub end_to_end: Option<i64>,
    pub tx_stack: Option<i64>,
    pub rx_stack: Option<i64>,
}

impl LatencyTuple {
    /// Every delta present for this packet
    pub fn deltas(&self) -> impl Iterator<Item = (DeltaKind, i64)> + '_ {
        [
            (DeltaKind::TxStack, self.tx_stack),
            (DeltaKind::TxNic, Some(self.tx_nic)),
            (DeltaKind::InFlight, self.in_flight),
            (DeltaKind::RxNic, Some(self.rx_nic)),
            (DeltaKind::RxStack, self.rx_stack),
            (DeltaKind::EndToEnd, self.end_to_end),
        ]
        .into_iter()
        .filter_map(|(kind, value)| value.map(|v| (kind, v)))
    }

    pub fn delta(&self, kind: DeltaKind) -> Option<i64> {
        self.deltas().find(|(k, _)| *k == kind).map(|(_, v)| v)
    }
}

/// A timeline that finalized without every stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LossRecord {
    pub key: PacketKey,
    pub missing: Vec<Stage>,
    /// The resolved records that did arrive
    pub present: Vec<StageRecord>,
}

/// Result of finalizing one timeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finalized {
    Complete(LatencyTuple),
    Loss(LossRecord),
}

impl Finalized {
    pub fn key(&self) -> PacketKey {
        match self {
            Finalized::Complete(tuple) => tuple.key,
            Finalized::Loss(loss) => loss.key,
        }
    }
}

fn diff(later: u64, earlier: u64) -> i64 {
    (later as i128 - earlier as i128).clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Watermark-driven join of stage records into packet timelines
pub struct Correlator {
    config: CorrelatorConfig,
    open: HashMap<PacketKey, PacketTimeline>,
    /// (last update, key) of every open timeline
    expiry: BTreeSet<(u64, PacketKey)>,
    watermark: Option<u64>,
    finalized: VecDeque<Finalized>,
    counters: CorrelationCounters,
}

impl Correlator {
    pub fn new(config: CorrelatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            open: HashMap::new(),
            expiry: BTreeSet::new(),
            watermark: None,
            finalized: VecDeque::new(),
            counters: CorrelationCounters::default(),
        })
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    pub fn counters(&self) -> &CorrelationCounters {
        &self.counters
    }

    /// Largest record timestamp seen so far
    pub fn watermark(&self) -> Option<u64> {
        self.watermark
    }

    /// Number of timelines not yet finalized
    pub fn open_timelines(&self) -> usize {
        self.open.len()
    }

    /// Add one record
    ///
    /// Returns `DuplicateStage` only under [`DuplicatePolicy::Reject`];
    /// the correlator stays usable afterwards.
    pub fn ingest(&mut self, record: StageRecord) -> Result<IngestOutcome> {
        let key = PacketKey::of(&record, self.config.key_by_queue);
        let window = self.config.epoch_window_ns;
        let ts = record.timestamp_ns;

        let watermark = self.watermark.map_or(ts, |w| w.max(ts));
        self.watermark = Some(watermark);
        let was_open = self.open.contains_key(&key);
        if self.config.shared_clock {
            self.sweep(watermark);
        }
        // This record's own watermark advance closed the key's previous epoch
        let swept = was_open && !self.open.contains_key(&key);

        let placement = self
            .open
            .get(&key)
            .map(|timeline| timeline.place(&record, window, self.config.shared_clock));

        let outcome = match placement {
            Some(Placement::Fits) => IngestOutcome::Accepted,
            Some(Placement::Before) => return Ok(self.late(key, &record)),
            Some(Placement::After) => {
                debug!("{} reused beyond the epoch window, closing previous timeline", key);
                self.counters.epoch_splits += 1;
                self.close(key);
                IngestOutcome::NewEpoch
            }
            None => {
                if self.config.shared_clock && ts.saturating_add(window) < watermark {
                    return Ok(self.late(key, &record));
                }
                if swept {
                    debug!("{} reused beyond the epoch window, previous timeline finalized", key);
                    self.counters.epoch_splits += 1;
                    IngestOutcome::NewEpoch
                } else {
                    IngestOutcome::Accepted
                }
            }
        };

        self.insert(key, record).map(|duplicate| {
            if duplicate {
                IngestOutcome::Duplicate
            } else {
                outcome
            }
        })
    }

    /// Ingest a batch, logging rejected duplicates
    pub fn ingest_all(&mut self, records: impl IntoIterator<Item = StageRecord>) -> Result<()> {
        for record in records {
            match self.ingest(record) {
                Ok(_) => {}
                Err(e) if !e.is_fatal() => warn!("{}", e),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Take the timelines finalized so far
    pub fn drain_finalized(&mut self) -> Vec<Finalized> {
        self.finalized.drain(..).collect()
    }

    /// Finalize every open timeline and return everything not yet drained
    ///
    /// Open timelines are finalized in order of last update, then key.
    pub fn flush(&mut self) -> Vec<Finalized> {
        let expiry = std::mem::take(&mut self.expiry);
        for (_, key) in expiry {
            if let Some(timeline) = self.open.remove(&key) {
                self.finalize(timeline);
            }
        }
        self.drain_finalized()
    }

    fn late(&mut self, key: PacketKey, record: &StageRecord) -> IngestOutcome {
        trace!("Late {} record for {} at {}", record.stage, key, record.timestamp_ns);
        self.counters.late_records += 1;
        IngestOutcome::Late
    }

    /// Returns whether the record was a duplicate
    fn insert(&mut self, key: PacketKey, record: StageRecord) -> Result<bool> {
        let timeline = self
            .open
            .entry(key)
            .or_insert_with(|| PacketTimeline::new(key, &record));
        let before = timeline.last_update();
        let fresh = timeline.slots.iter().flatten().all(Option::is_none);

        let duplicate = match timeline.record(record.stage, record.rank()).copied() {
            None => {
                timeline.store(record);
                self.counters.records_ingested += 1;
                false
            }
            Some(existing) => {
                self.counters.duplicate_records += 1;
                match self.config.duplicate_policy {
                    DuplicatePolicy::KeepEarliest => {
                        if record.timestamp_ns < existing.timestamp_ns {
                            timeline.store(record);
                        }
                        true
                    }
                    DuplicatePolicy::Reject => {
                        return Err(ProbeError::DuplicateStage {
                            key,
                            stage: record.stage,
                        })
                    }
                }
            }
        };

        let after = timeline.last_update();
        if fresh {
            self.expiry.insert((after, key));
        } else if after != before {
            self.expiry.remove(&(before, key));
            self.expiry.insert((after, key));
        }
        Ok(duplicate)
    }

    fn sweep(&mut self, watermark: u64) {
        let window = self.config.epoch_window_ns;
        while let Some(&(last_update, key)) = self.expiry.first() {
            if last_update.saturating_add(window) >= watermark {
                break;
            }
            self.expiry.pop_first();
            if let Some(timeline) = self.open.remove(&key) {
                self.finalize(timeline);
            }
        }
    }

    fn close(&mut self, key: PacketKey) {
        if let Some(timeline) = self.open.remove(&key) {
            self.expiry.remove(&(timeline.last_update(), key));
            self.finalize(timeline);
        }
    }

    fn finalize(&mut self, timeline: PacketTimeline) {
        let outcome = match self.latency_tuple(&timeline) {
            Some(tuple) => {
                self.counters.complete_timelines += 1;
                Finalized::Complete(tuple)
            }
            None => {
                self.counters.partial_timelines += 1;
                let missing = timeline.missing_stages();
                debug!("{} finalized without {:?}", timeline.key, missing);
                Finalized::Loss(LossRecord {
                    key: timeline.key,
                    missing,
                    present: Stage::ALL
                        .into_iter()
                        .filter_map(|stage| timeline.resolved(stage).copied())
                        .collect(),
                })
            }
        };
        self.finalized.push_back(outcome);
    }

    fn latency_tuple(&self, timeline: &PacketTimeline) -> Option<LatencyTuple> {
        let mut stages = [0u64; STAGE_COUNT];
        for stage in Stage::ALL {
            stages[stage.index()] = timeline.resolved(stage)?.timestamp_ns;
        }
        let [tx_enqueue, tx_completion, rx_completion, rx_deliver] = stages;
        let shared = self.config.shared_clock;

        let stack = |stage: Stage, driver_first: bool| {
            let user = timeline.record(stage, Rank::UserspaceEstimate)?.timestamp_ns;
            let driver = timeline.record(stage, Rank::Driver)?.timestamp_ns;
            Some(if driver_first {
                diff(user, driver)
            } else {
                diff(driver, user)
            })
        };

        Some(LatencyTuple {
            key: timeline.key,
            stages,
            tx_nic: diff(tx_completion, tx_enqueue),
            rx_nic: diff(rx_deliver, rx_completion),
            in_flight: shared.then(|| diff(rx_completion, tx_completion)),
            end_to_end: shared.then(|| diff(rx_deliver, tx_enqueue)),
            tx_stack: stack(Stage::TxEnqueue, false),
            rx_stack: stack(Stage::RxDeliver, true),
        })
    }
}

/// Merge several record streams into one timestamp-ordered stream
///
/// The sort is stable, so records with equal timestamps keep their
/// input order and replay is deterministic.
pub fn merge_time_ordered(streams: impl IntoIterator<Item = Vec<StageRecord>>) -> Vec<StageRecord> {
    let mut merged: Vec<StageRecord> = streams.into_iter().flatten().collect();
    merged.sort_by_key(|record| record.timestamp_ns);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Provenance;

    const WINDOW: u64 = 1_000;

    fn correlator() -> Correlator {
        Correlator::new(CorrelatorConfig {
            epoch_window_ns: WINDOW,
            ..CorrelatorConfig::default()
        })
        .unwrap()
    }

    /// Probe-only records for one packet starting at `t`
    fn probe_packet(seq: u32, t: u64) -> Vec<StageRecord> {
        vec![
            StageRecord::probe(0, seq, 64, Stage::TxEnqueue, t, Provenance::Software),
            StageRecord::probe(0, seq, 64, Stage::TxCompletion, t + 10, Provenance::Hardware),
            StageRecord::probe(0, seq, 64, Stage::RxCompletion, t + 30, Provenance::Hardware),
            StageRecord::probe(0, seq, 64, Stage::RxDeliver, t + 45, Provenance::Software),
        ]
    }

    fn complete(finalized: &[Finalized]) -> Vec<&LatencyTuple> {
        finalized
            .iter()
            .filter_map(|f| match f {
                Finalized::Complete(tuple) => Some(tuple),
                Finalized::Loss(_) => None,
            })
            .collect()
    }

    fn losses(finalized: &[Finalized]) -> Vec<&LossRecord> {
        finalized
            .iter()
            .filter_map(|f| match f {
                Finalized::Loss(loss) => Some(loss),
                Finalized::Complete(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_complete_packets() {
        let mut correlator = correlator();
        for seq in 1..=5 {
            correlator
                .ingest_all(probe_packet(seq, seq as u64 * 100))
                .unwrap();
        }

        let finalized = correlator.flush();
        assert_eq!(complete(&finalized).len(), 5);
        assert!(losses(&finalized).is_empty());

        let tuple = complete(&finalized)[0];
        assert_eq!(tuple.tx_nic, 10);
        assert_eq!(tuple.in_flight, Some(20));
        assert_eq!(tuple.rx_nic, 15);
        assert_eq!(tuple.end_to_end, Some(45));
        assert_eq!(tuple.tx_stack, None);
        assert_eq!(correlator.counters().complete_timelines, 5);
        assert_eq!(correlator.counters().records_ingested, 20);
    }

    #[test]
    fn test_missing_stage_is_a_loss() {
        let mut correlator = correlator();
        let mut records = probe_packet(7, 100);
        records.remove(2);
        correlator.ingest_all(records).unwrap();

        let finalized = correlator.flush();
        assert!(complete(&finalized).is_empty());
        let loss = losses(&finalized);
        assert_eq!(loss.len(), 1);
        assert_eq!(loss[0].key, PacketKey::new(0, 7));
        assert_eq!(loss[0].missing, vec![Stage::RxCompletion]);
        assert_eq!(loss[0].present.len(), 3);
    }

    #[test]
    fn test_out_of_order_records_join() {
        let mut correlator = correlator();
        let mut records = probe_packet(3, 100);
        records.reverse();
        for record in records {
            assert_eq!(correlator.ingest(record).unwrap(), IngestOutcome::Accepted);
        }

        assert_eq!(correlator.open_timelines(), 1);
        assert_eq!(complete(&correlator.flush()).len(), 1);
    }

    #[test]
    fn test_key_reuse_after_window_starts_new_timeline() {
        let mut correlator = correlator();
        correlator.ingest_all(probe_packet(9, 100)).unwrap();
        // Same key, well past the window: the first timeline closes first
        let reused = probe_packet(9, 100 + 5 * WINDOW);
        assert_eq!(correlator.ingest(reused[0]).unwrap(), IngestOutcome::NewEpoch);
        assert_eq!(correlator.counters().epoch_splits, 1);
        for record in &reused[1..] {
            assert_eq!(correlator.ingest(*record).unwrap(), IngestOutcome::Accepted);
        }

        let early = correlator.drain_finalized();
        assert_eq!(early.len(), 1);

        let finalized = correlator.flush();
        assert_eq!(finalized.len(), 1);
        assert_eq!(correlator.counters().complete_timelines, 2);
        assert_eq!(correlator.counters().epoch_splits, 1);
        assert_eq!(correlator.counters().late_records, 0);
    }

    #[test]
    fn test_single_stage_reuse_counts_epoch_split() {
        let mut reused_key = correlator();
        let first = StageRecord::probe(0, 9, 64, Stage::TxEnqueue, 100, Provenance::Software);
        let again = StageRecord::probe(0, 9, 64, Stage::TxEnqueue, 100 + 5 * WINDOW, Provenance::Software);

        assert_eq!(reused_key.ingest(first).unwrap(), IngestOutcome::Accepted);
        assert_eq!(reused_key.ingest(again).unwrap(), IngestOutcome::NewEpoch);
        assert_eq!(reused_key.counters().epoch_splits, 1);
        assert_eq!(reused_key.counters().duplicate_records, 0);
        assert_eq!(reused_key.drain_finalized().len(), 1);

        // Key 1 closes through key 2's progress, so its next record is not a split
        let mut other_key = correlator();
        other_key.ingest(StageRecord::driver(0, 1, Stage::TxEnqueue, 100)).unwrap();
        other_key.ingest(StageRecord::driver(0, 2, Stage::TxEnqueue, 100 + 5 * WINDOW)).unwrap();
        assert_eq!(
            other_key
                .ingest(StageRecord::driver(0, 1, Stage::TxEnqueue, 100 + 5 * WINDOW))
                .unwrap(),
            IngestOutcome::Accepted
        );
        assert_eq!(other_key.counters().epoch_splits, 0);
    }

    #[test]
    fn test_late_record_is_dropped() {
        let mut correlator = correlator();
        correlator.ingest_all(probe_packet(1, 100)).unwrap();
        correlator.ingest_all(probe_packet(2, 100 + 3 * WINDOW)).unwrap();

        // Stage for an already-finalized packet
        let late = StageRecord::driver(0, 1, Stage::TxEnqueue, 105);
        assert_eq!(correlator.ingest(late).unwrap(), IngestOutcome::Late);
        assert_eq!(correlator.counters().late_records, 1);

        let finalized = correlator.flush();
        assert_eq!(complete(&finalized).len(), 2);
    }

    #[test]
    fn test_old_record_fitting_open_timeline_is_kept() {
        let mut correlator = correlator();
        let packet = probe_packet(4, 100);
        correlator.ingest(packet[0]).unwrap();
        correlator.ingest(packet[3]).unwrap();
        correlator
            .ingest(StageRecord::driver(0, 4, Stage::RxDeliver, 140 + WINDOW))
            .unwrap();
        // More than a window behind the watermark, but inside packet 4's span
        assert_eq!(correlator.ingest(packet[1]).unwrap(), IngestOutcome::Accepted);
        correlator.ingest(packet[2]).unwrap();

        assert_eq!(correlator.counters().late_records, 0);
        assert_eq!(complete(&correlator.flush()).len(), 1);
    }

    #[test]
    fn test_driver_records_outrank_probe_estimates() {
        let mut correlator = correlator();
        correlator.ingest_all(probe_packet(5, 1_000)).unwrap();
        correlator
            .ingest_all([
                StageRecord::driver(0, 5, Stage::TxEnqueue, 1_004),
                StageRecord::driver(0, 5, Stage::TxCompletion, 1_011),
                StageRecord::driver(0, 5, Stage::RxCompletion, 1_031),
                StageRecord::driver(0, 5, Stage::RxDeliver, 1_040),
            ])
            .unwrap();

        let finalized = correlator.flush();
        let tuple = complete(&finalized)[0];
        assert_eq!(tuple.stages, [1_004, 1_011, 1_031, 1_040]);
        assert_eq!(tuple.tx_stack, Some(4));
        assert_eq!(tuple.tx_nic, 7);
        assert_eq!(tuple.rx_nic, 9);
        assert_eq!(tuple.rx_stack, Some(5));
        assert_eq!(correlator.counters().duplicate_records, 0);
    }

    #[test]
    fn test_keep_earliest_duplicate() {
        let mut correlator = correlator();
        correlator
            .ingest(StageRecord::driver(0, 2, Stage::TxEnqueue, 50))
            .unwrap();
        let outcome = correlator
            .ingest(StageRecord::driver(0, 2, Stage::TxEnqueue, 40))
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Duplicate);
        correlator
            .ingest(StageRecord::driver(0, 2, Stage::TxEnqueue, 60))
            .unwrap();

        assert_eq!(correlator.counters().duplicate_records, 2);
        let finalized = correlator.flush();
        let loss = losses(&finalized)[0];
        assert_eq!(loss.present[0].timestamp_ns, 40);
    }

    #[test]
    fn test_reject_duplicate() {
        let mut correlator = Correlator::new(CorrelatorConfig {
            epoch_window_ns: WINDOW,
            duplicate_policy: DuplicatePolicy::Reject,
            ..CorrelatorConfig::default()
        })
        .unwrap();

        correlator
            .ingest(StageRecord::driver(0, 2, Stage::RxDeliver, 50))
            .unwrap();
        let err = correlator
            .ingest(StageRecord::driver(0, 2, Stage::RxDeliver, 40))
            .unwrap_err();
        assert!(matches!(
            err,
            ProbeError::DuplicateStage {
                stage: Stage::RxDeliver,
                ..
            }
        ));
        assert_eq!(correlator.counters().duplicate_records, 1);

        let finalized = correlator.flush();
        assert_eq!(losses(&finalized)[0].present[0].timestamp_ns, 50);
    }

    #[test]
    fn test_unshared_clock_compares_halves() {
        let mut correlator = Correlator::new(CorrelatorConfig {
            epoch_window_ns: WINDOW,
            shared_clock: false,
            ..CorrelatorConfig::default()
        })
        .unwrap();

        // RX clock is far ahead of the TX clock
        let offset = 1_000_000;
        for seq in 1..=3u32 {
            let t = seq as u64 * 100;
            correlator
                .ingest_all([
                    StageRecord::probe(0, seq, 64, Stage::TxEnqueue, t, Provenance::Software),
                    StageRecord::probe(0, seq, 64, Stage::TxCompletion, t + 10, Provenance::Hardware),
                    StageRecord::probe(0, seq, 64, Stage::RxCompletion, offset + t, Provenance::Hardware),
                    StageRecord::probe(0, seq, 64, Stage::RxDeliver, offset + t + 8, Provenance::Software),
                ])
                .unwrap();
        }
        assert!(correlator.drain_finalized().is_empty());

        let finalized = correlator.flush();
        let tuples = complete(&finalized);
        assert_eq!(tuples.len(), 3);
        assert_eq!(tuples[0].in_flight, None);
        assert_eq!(tuples[0].end_to_end, None);
        assert_eq!(tuples[0].rx_nic, 8);
        assert_eq!(correlator.counters().late_records, 0);
    }

    #[test]
    fn test_unshared_clock_splits_reused_key() {
        let mut correlator = Correlator::new(CorrelatorConfig {
            epoch_window_ns: WINDOW,
            shared_clock: false,
            ..CorrelatorConfig::default()
        })
        .unwrap();

        correlator
            .ingest(StageRecord::probe(0, 1, 64, Stage::TxEnqueue, 100, Provenance::Software))
            .unwrap();
        let outcome = correlator
            .ingest(StageRecord::probe(0, 1, 64, Stage::TxEnqueue, 100 + 2 * WINDOW, Provenance::Software))
            .unwrap();
        assert_eq!(outcome, IngestOutcome::NewEpoch);
        assert_eq!(correlator.counters().epoch_splits, 1);
        assert_eq!(correlator.flush().len(), 2);
    }

    #[test]
    fn test_flush_order_is_deterministic() {
        let records = merge_time_ordered(vec![
            vec![StageRecord::driver(0, 3, Stage::TxEnqueue, 30)],
            vec![
                StageRecord::driver(0, 1, Stage::TxEnqueue, 10),
                StageRecord::driver(1, 2, Stage::TxEnqueue, 30),
            ],
        ]);

        let run = |records: &[StageRecord]| {
            let mut correlator = correlator();
            correlator.ingest_all(records.iter().copied()).unwrap();
            correlator
                .flush()
                .iter()
                .map(Finalized::key)
                .collect::<Vec<_>>()
        };

        let keys = run(&records);
        assert_eq!(
            keys,
            vec![PacketKey::new(0, 1), PacketKey::new(0, 3), PacketKey::new(1, 2)]
        );
        assert_eq!(run(&records), keys);
    }

    #[test]
    fn test_ignore_queue_joins_across_queues() {
        let mut correlator = Correlator::new(CorrelatorConfig {
            epoch_window_ns: WINDOW,
            key_by_queue: false,
            ..CorrelatorConfig::default()
        })
        .unwrap();

        correlator
            .ingest_all([
                StageRecord::driver(2, 8, Stage::TxEnqueue, 100),
                StageRecord::driver(2, 8, Stage::TxCompletion, 110),
                StageRecord::driver(5, 8, Stage::RxCompletion, 130),
                StageRecord::driver(5, 8, Stage::RxDeliver, 140),
            ])
            .unwrap();

        let finalized = correlator.flush();
        assert_eq!(complete(&finalized).len(), 1);
        assert_eq!(finalized[0].key(), PacketKey::new(0, 8));
    }
}
