//! NIC Timestamp Probe - Kernel Space Program
//!
//! Forwards the mqnic driver's stage tracepoints to userspace. The driver
//! already reads its PTP hardware clock and passes `(qid, seq, ts_ns)` to
//! each tracepoint; this program only copies those fields into a
//! `DriverStageEvent` and pushes it through a perf event array.
//!
//! ## Architecture
//!
//! ```text
//! mqnic_ts_probe_tx_enqueue  --\
//! mqnic_ts_probe_tx_cpl      ---+-> DriverStageEvent -> EVENTS map
//! mqnic_ts_probe_rx_cpl      ---+
//! mqnic_ts_probe_rx_deliver  --/
//!                                  |
//!                                  v
//! Userspace -> decode events, write stage records, correlate offline
//! ```
//!
//! ## Usage
//!
//! This program must be compiled for the bpfel-unknown-none target:
//!
//! ```bash
//! cargo build --release --target=bpfel-unknown-none
//! ```
//!
//! The compiled bytecode is then loaded by the userspace program.

#![no_std]
#![no_main]

mod handlers;
mod helpers;
mod maps;

// Re-export tracepoint functions so they're visible to the loader
pub use handlers::{mqnic_rx_completion, mqnic_rx_deliver, mqnic_tx_completion, mqnic_tx_enqueue};

// Re-export maps for verification
pub use maps::{EVENTS, STATS};

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    // eBPF programs cannot panic - the verifier rejects any reachable panic
    loop {}
}
