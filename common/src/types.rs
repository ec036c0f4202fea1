//! Shared data structures between kernel and userspace
//!
//! These structures must be repr(C) to ensure consistent memory layout
//! between eBPF programs and userspace code.

/// One driver stage event copied out of an mqnic tracepoint
///
/// The driver reads the NIC's PTP hardware clock and passes the value to
/// the tracepoint, so `ts_ns` is already in the PHC domain.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriverStageEvent {
    /// Timestamp in PHC nanoseconds
    pub ts_ns: u64,
    /// TX or RX queue index the driver handled the packet on
    pub qid: i32,
    /// Low 16 bits of the wire sequence number
    pub seq: u16,
    /// Pipeline stage (see STAGE_* constants)
    pub stage: u8,
    /// Padding for alignment
    pub _padding: u8,
}

// Compile-time layout checks
const _: () = {
    assert!(core::mem::size_of::<DriverStageEvent>() == 16);
    assert!(
        core::mem::size_of::<DriverStageEvent>() % core::mem::align_of::<DriverStageEvent>() == 0
    );
};

// Implement Aya's Pod trait for userspace usage
#[cfg(feature = "userspace")]
mod userspace_impls {
    use super::*;

    // Pod trait implementation for reading from perf buffers in userspace
    unsafe impl aya::Pod for DriverStageEvent {}
}
