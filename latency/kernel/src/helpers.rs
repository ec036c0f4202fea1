//! Helper functions for the tracepoint handlers

use aya_ebpf::programs::TracePointContext;
use nic_ts_common::{constants::*, types::*};

/// Increment a statistics counter
///
/// Safely increments a counter in the STATS map.
#[inline(always)]
pub fn increment_stat(stat_id: u32) {
    use crate::maps::STATS;

    unsafe {
        if let Some(count) = STATS.get(&stat_id) {
            let new_count = *count + 1;
            let _ = STATS.insert(&stat_id, &new_count, 0);
        } else {
            let _ = STATS.insert(&stat_id, &1u64, 0);
        }
    }
}

/// Read `(qid, seq, ts_ns)` out of an mqnic tracepoint record
///
/// All four mqnic_ts_probe events share the same entry layout, so one
/// reader serves every stage.
#[inline(always)]
pub fn read_stage_event(ctx: &TracePointContext, stage: u8) -> Result<DriverStageEvent, i64> {
    let qid = unsafe { ctx.read_at::<i32>(TP_QID_OFFSET)? };
    let seq = unsafe { ctx.read_at::<u16>(TP_SEQ_OFFSET)? };
    let ts_ns = unsafe { ctx.read_at::<u64>(TP_TS_OFFSET)? };

    Ok(DriverStageEvent {
        ts_ns,
        qid,
        seq,
        stage,
        _padding: 0,
    })
}
