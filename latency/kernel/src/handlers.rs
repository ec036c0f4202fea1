//! Tracepoint handlers for the mqnic timestamp probe events
//!
//! Each handler copies one driver stage event to userspace. No state is
//! kept in the kernel; correlation happens in userspace.

use aya_ebpf::{macros::tracepoint, programs::TracePointContext};
use nic_ts_common::constants::*;

use crate::{helpers::*, maps::*};

/// Attached to: mqnic_ts_probe:mqnic_ts_probe_tx_enqueue
#[tracepoint]
pub fn mqnic_tx_enqueue(ctx: TracePointContext) -> u32 {
    forward(&ctx, STAGE_TX_ENQUEUE, STAT_TX_ENQUEUE_EVENTS)
}

/// Attached to: mqnic_ts_probe:mqnic_ts_probe_tx_cpl
#[tracepoint]
pub fn mqnic_tx_completion(ctx: TracePointContext) -> u32 {
    forward(&ctx, STAGE_TX_COMPLETION, STAT_TX_COMPLETION_EVENTS)
}

/// Attached to: mqnic_ts_probe:mqnic_ts_probe_rx_cpl
#[tracepoint]
pub fn mqnic_rx_completion(ctx: TracePointContext) -> u32 {
    forward(&ctx, STAGE_RX_COMPLETION, STAT_RX_COMPLETION_EVENTS)
}

/// Attached to: mqnic_ts_probe:mqnic_ts_probe_rx_deliver
#[tracepoint]
pub fn mqnic_rx_deliver(ctx: TracePointContext) -> u32 {
    forward(&ctx, STAGE_RX_DELIVER, STAT_RX_DELIVER_EVENTS)
}

#[inline(always)]
fn forward(ctx: &TracePointContext, stage: u8, stat_id: u32) -> u32 {
    match try_forward(ctx, stage, stat_id) {
        Ok(ret) => ret,
        Err(_) => {
            increment_stat(STAT_READ_ERRORS);
            1
        }
    }
}

fn try_forward(ctx: &TracePointContext, stage: u8, stat_id: u32) -> Result<u32, i64> {
    increment_stat(STAT_TOTAL_EVENTS);
    increment_stat(stat_id);

    let event = read_stage_event(ctx, stage)?;

    unsafe {
        EVENTS.output(ctx, &event, 0);
    }

    Ok(0)
}
