//! Timestamp sources in the PTP hardware clock domain
//!
//! Two kinds of timestamp reach a probe session:
//!
//! - **direct reads** of the NIC's PHC at a known program point, taken
//!   through a [`TimestampSource`], and
//! - **delivered timestamps** attached by the stack to a socket operation
//!   (`SCM_TIMESTAMPING`), converted with [`delivered`].
//!
//! Both end up as nanoseconds in the PHC domain together with their
//! [`Provenance`]. Each session owns its own [`PhcClock`]; the handle is
//! closed when the clock is dropped.

use crate::{
    error::{ProbeError, Result},
    types::Provenance,
};
use log::debug;
use std::{
    fs::File,
    os::unix::io::{AsRawFd, RawFd},
    path::{Path, PathBuf},
};

/// Default PHC device
pub const DEFAULT_PHC_DEVICE: &str = "/dev/ptp0";

const CLOCKFD: libc::clockid_t = 3;

/// A timestamp normalized to PHC nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub ns: u64,
    pub provenance: Provenance,
}

impl Timestamp {
    pub fn hardware(ns: u64) -> Self {
        Self {
            ns,
            provenance: Provenance::Hardware,
        }
    }

    pub fn software(ns: u64) -> Self {
        Self {
            ns,
            provenance: Provenance::Software,
        }
    }
}

/// Direct-read access to the measurement clock
pub trait TimestampSource {
    /// Sample the clock now
    ///
    /// Fails with [`ProbeError::ClockUnavailable`] when the handle cannot
    /// be read. Callers treat that as fatal and never retry.
    fn acquire(&mut self) -> Result<Timestamp>;
}

impl<T: TimestampSource + ?Sized> TimestampSource for Box<T> {
    fn acquire(&mut self) -> Result<Timestamp> {
        (**self).acquire()
    }
}

/// An open handle to a NIC's PTP hardware clock
#[derive(Debug)]
pub struct PhcClock {
    device: PathBuf,
    clock_id: libc::clockid_t,
    // Keeps the descriptor behind `clock_id` open
    file: File,
}

impl PhcClock {
    /// Open a PHC character device (e.g. `/dev/ptp0`) read-only
    pub fn open(device: impl AsRef<Path>) -> Result<Self> {
        let device = device.as_ref().to_path_buf();
        let file = File::open(&device).map_err(|source| ProbeError::ClockUnavailable {
            device: device.clone(),
            source,
        })?;
        let clock_id = fd_to_clockid(file.as_raw_fd());
        debug!("Opened PHC {:?} as clock id {}", device, clock_id);

        Ok(Self {
            device,
            clock_id,
            file,
        })
    }

    pub fn device(&self) -> &Path {
        &self.device
    }
}

impl TimestampSource for PhcClock {
    fn acquire(&mut self) -> Result<Timestamp> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let ret = unsafe { libc::clock_gettime(self.clock_id, &mut ts) };
        if ret != 0 {
            return Err(ProbeError::ClockUnavailable {
                device: self.device.clone(),
                source: std::io::Error::last_os_error(),
            });
        }

        let ns = timespec_to_ns(&ts).ok_or_else(|| ProbeError::ClockUnavailable {
            device: self.device.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "negative clock value"),
        })?;
        Ok(Timestamp::software(ns))
    }
}

impl AsRawFd for PhcClock {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Dynamic POSIX clock id for an open PHC descriptor (`FD_TO_CLOCKID`)
pub fn fd_to_clockid(fd: RawFd) -> libc::clockid_t {
    ((!(fd as u32) << 3) as libc::clockid_t) | CLOCKFD
}

/// Convert a timespec to nanoseconds
///
/// Returns `None` for negative values and for the all-zero timespec the
/// stack uses to mean "no timestamp in this slot".
pub fn timespec_to_ns(ts: &libc::timespec) -> Option<u64> {
    if ts.tv_sec < 0 || ts.tv_nsec < 0 || (ts.tv_sec == 0 && ts.tv_nsec == 0) {
        return None;
    }
    (ts.tv_sec as u64)
        .checked_mul(1_000_000_000)
        .and_then(|ns| ns.checked_add(ts.tv_nsec as u64))
}

/// Wrap a timestamp delivered by the stack with its provenance
pub fn delivered(ts: &libc::timespec, provenance: Provenance) -> Option<Timestamp> {
    timespec_to_ns(ts).map(|ns| Timestamp { ns, provenance })
}
