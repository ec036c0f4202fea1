//! RX probe session
//!
//! Receives probe datagrams, samples the clock as soon as each receive
//! returns and emits the hardware `RxCompletion` delivered with the
//! datagram plus the userspace `RxDeliver` estimate.

use crate::{
    clock::TimestampSource,
    codec,
    config::RxConfig,
    error::Result,
    net::RxTransport,
    session::{expect_state, SessionState, SessionSummary, StopSignal},
    sink::RecordSink,
    types::{Provenance, Stage, StageRecord},
};
use log::{debug, info, warn};

/// Receive-side probe session
pub struct RxSession<C, T> {
    config: RxConfig,
    clock: C,
    transport: T,
    state: SessionState,
}

impl<C: TimestampSource, T: RxTransport> RxSession<C, T> {
    pub fn new(config: RxConfig, clock: C, transport: T) -> Self {
        Self {
            config,
            clock,
            transport,
            state: SessionState::Configuring,
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
                debug!("RX clock probe read {} ns", ts.ns);
                self.state = SessionState::Running;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Stopped;
                Err(e)
            }
        }
    }

    /// Receive until the packet limit is reached or a stop is requested
    pub fn run(&mut self, sink: &mut impl RecordSink, stop: &StopSignal) -> Result<SessionSummary> {
        expect_state(self.state, SessionState::Running)?;
        let result = self.receive_all(sink, stop);
        self.state = SessionState::Stopped;
        result
    }

    fn receive_all(&mut self, sink: &mut impl RecordSink, stop: &StopSignal) -> Result<SessionSummary> {
        let mut summary = SessionSummary::default();
        let mut buf = vec![0u8; self.config.buffer_size];
        let mut decoded = 0u64;

        match self.config.max_packets {
            Some(max) => info!("Receiving {} packets", max),
            None => info!("Receiving until stopped"),
        }

        loop {
            if self.config.max_packets.is_some_and(|max| decoded >= max) {
                break;
            }
            if stop.is_triggered() {
                info!("Stop requested after {} packets", summary.packets);
                summary.stopped_early = true;
                break;
            }

            let datagram = match self.transport.recv(&mut buf)? {
                Some(datagram) => datagram,
                None => continue,
            };
            let user_rx = self.clock.acquire()?;
            summary.packets += 1;

            let payload = &buf[..datagram.len.min(buf.len())];
            let sequence = match codec::decode(payload) {
                Ok(sequence) => sequence,
                Err(e) => {
                    warn!("Dropping datagram: {}", e);
                    summary.decode_failures += 1;
                    continue;
                }
            };
            decoded += 1;
            let size = payload.len() as u32;

            match datagram.hardware {
                Some(hw) => {
                    sink.append(StageRecord::probe(
                        self.config.queue_id,
                        sequence,
                        size,
                        Stage::RxCompletion,
                        hw.ns,
                        Provenance::Hardware,
                    ))?;
                    summary.records_emitted += 1;
                }
                None => summary.rx_hardware_missing += 1,
            }

            sink.append(StageRecord::probe(
                self.config.queue_id,
                sequence,
                size,
                Stage::RxDeliver,
                user_rx.ns,
                Provenance::Software,
            ))?;
            summary.records_emitted += 1;

            debug!(
                "[RX][{}] t_user_rx={}, t_hw_rx={}",
                sequence,
                user_rx.ns,
                datagram.hardware.map_or(0, |hw| hw.ns)
            );
        }

        if summary.rx_hardware_missing > 0 {
            warn!(
                "{} datagrams arrived without a hardware RX timestamp",
                summary.rx_hardware_missing
            );
        }

        sink.flush()?;
        Ok(summary)
    }
}
