//! Event processing from eBPF perf buffers
//!
//! Reads driver stage events from the per-CPU perf buffers, converts them
//! to stage records and forwards them over a bounded channel to the
//! record writer.

use crate::{feed, types::DriverStageEvent, types::StageRecord};
use anyhow::Result;
use aya::{
    maps::{perf::AsyncPerfEventArray, MapData},
    util::online_cpus,
};
use bytes::BytesMut;
use log::{debug, info, warn};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle, time::interval};

/// Number of events read from a perf buffer per wakeup
const READ_BATCH: usize = 16;

/// Live counters shared by every CPU reader
#[derive(Debug, Default)]
pub struct FeedStats {
    events: AtomicU64,
    lost: AtomicU64,
    malformed: AtomicU64,
}

/// Point-in-time copy of [`FeedStats`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeedSnapshot {
    /// Events decoded into records
    pub events: u64,
    /// Samples the kernel dropped because a perf buffer was full
    pub lost: u64,
    /// Events with an unknown stage code
    pub malformed: u64,
}

impl FeedStats {
    pub fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            events: self.events.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// Event processor that reads from perf buffers
pub struct EventProcessor {
    records: mpsc::Sender<StageRecord>,
    stats: Arc<FeedStats>,
}

impl EventProcessor {
    /// Create a new event processor
    ///
    /// # Arguments
    ///
    /// * `records` - Channel to the record writer
    pub fn new(records: mpsc::Sender<StageRecord>) -> Self {
        Self {
            records,
            stats: Arc::new(FeedStats::default()),
        }
    }

    pub fn stats(&self) -> FeedSnapshot {
        self.stats.snapshot()
    }

    /// Spawn per-CPU event readers
    ///
    /// Creates a task for each CPU to read events from its perf buffer.
    /// A reader stops when the record channel closes; abort the returned
    /// handles to stop readers that are waiting for events.
    pub fn spawn_cpu_readers(
        &self,
        mut perf_array: AsyncPerfEventArray<MapData>,
    ) -> Result<Vec<JoinHandle<()>>> {
        let cpus = online_cpus()?;
        info!("Spawning event readers for {} CPUs", cpus.len());
        let mut readers = Vec::with_capacity(cpus.len());

        for cpu_id in cpus {
            let mut buf = perf_array.open(cpu_id, None)?;
            let records = self.records.clone();
            let stats = Arc::clone(&self.stats);

            readers.push(tokio::spawn(async move {
                // Pre-allocate buffers for reading events
                let mut buffers = (0..READ_BATCH)
                    .map(|_| BytesMut::with_capacity(std::mem::size_of::<DriverStageEvent>()))
                    .collect::<Vec<_>>();

                loop {
                    let events = match buf.read_events(&mut buffers).await {
                        Ok(events) => events,
                        Err(e) => {
                            warn!("Error reading events from CPU {}: {}", cpu_id, e);
                            break;
                        }
                    };

                    if events.lost > 0 {
                        stats.lost.fetch_add(events.lost as u64, Ordering::Relaxed);
                        warn!("CPU {} lost {} driver events", cpu_id, events.lost);
                    }

                    for buf in buffers.iter_mut().take(events.read) {
                        if buf.len() < std::mem::size_of::<DriverStageEvent>() {
                            stats.malformed.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        let ptr = buf.as_ptr() as *const DriverStageEvent;
                        let event = unsafe { ptr.read_unaligned() };

                        let record = match feed::decode_event(&event) {
                            Some(record) => record,
                            None => {
                                stats.malformed.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }
                        };

                        debug!(
                            "Event: cpu={} stage={} qid={} seq={} ts_ns={}",
                            cpu_id, record.stage, record.queue_id, record.sequence, record.timestamp_ns
                        );

                        if records.send(record).await.is_err() {
                            debug!("Record channel closed, stopping reader for CPU {}", cpu_id);
                            return;
                        }
                        stats.events.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }));
        }

        Ok(readers)
    }

    /// Spawn progress reporter
    ///
    /// Creates a task that periodically reports collection progress.
    ///
    /// # Arguments
    ///
    /// * `interval_secs` - Reporting interval in seconds
    pub fn spawn_progress_reporter(&self, interval_secs: u64) {
        let stats = Arc::clone(&self.stats);

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));

            loop {
                ticker.tick().await;

                let snapshot = stats.snapshot();
                info!(
                    "📈 Progress: {} driver events, {} lost, {} malformed",
                    snapshot.events, snapshot.lost, snapshot.malformed
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_processor_creation() {
        let (tx, _rx) = mpsc::channel(8);
        let processor = EventProcessor::new(tx);

        assert_eq!(processor.stats(), FeedSnapshot::default());
    }

    #[test]
    fn test_snapshot_reads_counters() {
        let stats = FeedStats::default();
        stats.events.fetch_add(3, Ordering::Relaxed);
        stats.lost.fetch_add(1, Ordering::Relaxed);

        assert_eq!(
            stats.snapshot(),
            FeedSnapshot {
                events: 3,
                lost: 1,
                malformed: 0
            }
        );
    }
}
