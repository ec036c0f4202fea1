//! TX probe session
//!
//! Sends `count` sequence-numbered datagrams. Around each send it emits a
//! userspace `TxEnqueue` estimate and, when the NIC reports one, the
//! hardware `TxCompletion` read back from the socket error queue.

use crate::{
    clock::TimestampSource,
    codec,
    config::TxConfig,
    error::Result,
    net::{TxCompletion, TxTransport},
    session::{expect_state, SessionState, SessionSummary, StopSignal},
    sink::RecordSink,
    types::{Provenance, Stage, StageRecord},
};
use log::{debug, info, warn};
use std::{collections::HashSet, thread};

/// Transmit-side probe session
pub struct TxSession<C, T> {
    config: TxConfig,
    clock: C,
    transport: T,
    state: SessionState,
    sent: u32,
    completed: HashSet<u32>,
}

impl<C: TimestampSource, T: TxTransport> TxSession<C, T> {
    pub fn new(config: TxConfig, clock: C, transport: T) -> Self {
        Self {
            config,
            clock,
            transport,
            state: SessionState::Configuring,
            sent: 0,
            completed: HashSet::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Probe the clock and move to `Running`
    pub fn configure(&mut self) -> Result<()> {
        expect_state(self.state, SessionState::Configuring)?;
        match self.clock.acquire() {
            Ok(ts) => {
                debug!("TX clock probe read {} ns", ts.ns);
                self.state = SessionState::Running;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Stopped;
                Err(e)
            }
        }
    }

    /// Send every packet, then drain outstanding completions
    ///
    /// The session is `Stopped` afterwards whether or not it succeeded.
    pub fn run(&mut self, sink: &mut impl RecordSink, stop: &StopSignal) -> Result<SessionSummary> {
        expect_state(self.state, SessionState::Running)?;
        let result = self.send_all(sink, stop);
        self.state = SessionState::Stopped;
        result
    }

    fn send_all(&mut self, sink: &mut impl RecordSink, stop: &StopSignal) -> Result<SessionSummary> {
        let mut summary = SessionSummary::default();
        let mut payload = codec::build_payload(self.config.first_sequence, self.config.payload_size);
        let size = payload.len() as u32;

        info!(
            "Sending {} packets starting at sequence {}",
            self.config.count, self.config.first_sequence
        );

        for index in 0..self.config.count {
            if stop.is_triggered() {
                info!("Stop requested after {} packets", summary.packets);
                summary.stopped_early = true;
                break;
            }

            let sequence = self.config.first_sequence + index;
            codec::encode_into(sequence, &mut payload)?;

            let pre_send = self.clock.acquire()?;
            self.transport.send(&payload)?;
            self.sent += 1;
            summary.packets += 1;

            sink.append(StageRecord::probe(
                self.config.queue_id,
                sequence,
                size,
                Stage::TxEnqueue,
                pre_send.ns,
                Provenance::Software,
            ))?;
            summary.records_emitted += 1;
            debug!("[TX][{}] t_user_tx={}", sequence, pre_send.ns);

            if let Some(completion) = self.transport.tx_completion()? {
                self.handle_completion(completion, size, sink, &mut summary)?;
            }

            if !self.config.send_interval.is_zero() && index + 1 < self.config.count {
                thread::sleep(self.config.send_interval);
            }
        }

        // Completions may trail the last send
        while (self.completed.len() as u32) < self.sent {
            match self.transport.tx_completion()? {
                Some(completion) => self.handle_completion(completion, size, sink, &mut summary)?,
                None => break,
            }
        }

        summary.tx_completions_missing = self.sent as u64 - self.completed.len() as u64;
        if summary.tx_completions_missing > 0 {
            warn!(
                "{} of {} packets have no hardware TX completion",
                summary.tx_completions_missing, self.sent
            );
        }

        sink.flush()?;
        Ok(summary)
    }

    fn handle_completion(
        &mut self,
        completion: TxCompletion,
        size: u32,
        sink: &mut impl RecordSink,
        summary: &mut SessionSummary,
    ) -> Result<()> {
        // OPT_ID numbers sends on this socket from 0
        if completion.key >= self.sent {
            warn!("TX completion for unknown key {}", completion.key);
            return Ok(());
        }
        let sequence = self.config.first_sequence + completion.key;

        let hardware = match completion.hardware {
            Some(ts) => ts,
            None => {
                debug!("[TX][{}] completion without hardware timestamp", sequence);
                return Ok(());
            }
        };
        if !self.completed.insert(completion.key) {
            debug!("[TX][{}] repeated completion ignored", sequence);
            return Ok(());
        }

        sink.append(StageRecord::probe(
            self.config.queue_id,
            sequence,
            size,
            Stage::TxCompletion,
            hardware.ns,
            Provenance::Hardware,
        ))?;
        summary.records_emitted += 1;
        summary.tx_completions += 1;
        debug!("[TX][{}] t_hw_tx={}", sequence, hardware.ns);
        Ok(())
    }
}
