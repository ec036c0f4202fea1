//! BPF map definitions for driver stage forwarding

use aya_ebpf::{
    macros::map,
    maps::{HashMap, PerfEventArray},
};
use nic_ts_common::{constants::*, types::*};

/// Perf event array to send driver stage events to userspace
#[map]
pub static EVENTS: PerfEventArray<DriverStageEvent> = PerfEventArray::new(0);

/// Statistics counter map
///
/// Key: stat_id (see STAT_* constants)
/// Value: u64 counter
#[map]
pub static STATS: HashMap<u32, u64> = HashMap::with_max_entries(MAX_STATS, 0);
