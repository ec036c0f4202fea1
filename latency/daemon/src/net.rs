//! UDP sockets with kernel timestamping
//!
//! Provides the transports the probe sessions drive: a send path that
//! reads hardware TX completion timestamps back from the socket error
//! queue, and a receive path that extracts the hardware RX timestamp from
//! `SCM_TIMESTAMPING` control messages.
//!
//! Requires Linux with `SO_TIMESTAMPING`; hardware stamps additionally
//! need a NIC whose driver implements `SIOCSHWTSTAMP`.

use crate::{
    clock::{self, Timestamp},
    types::Provenance,
};
use log::{debug, info};
use socket2::{Domain, Protocol, Socket, Type};
use std::{io, mem, net::SocketAddrV4, os::unix::io::AsRawFd, time::Duration};

// Linux SO_TIMESTAMPING flags (from <linux/net_tstamp.h>)
const SOF_TIMESTAMPING_TX_HARDWARE: u32 = 1 << 0;
const SOF_TIMESTAMPING_TX_SOFTWARE: u32 = 1 << 1;
const SOF_TIMESTAMPING_RX_HARDWARE: u32 = 1 << 2;
const SOF_TIMESTAMPING_RX_SOFTWARE: u32 = 1 << 3;
const SOF_TIMESTAMPING_SOFTWARE: u32 = 1 << 4;
const SOF_TIMESTAMPING_RAW_HARDWARE: u32 = 1 << 6;
const SOF_TIMESTAMPING_OPT_ID: u32 = 1 << 7;
const SOF_TIMESTAMPING_TX_ACK: u32 = 1 << 9;
const SOF_TIMESTAMPING_OPT_TSONLY: u32 = 1 << 11;

/// Flags for the send path: hardware and software TX stamps keyed by OPT_ID
pub const TX_TIMESTAMPING_FLAGS: u32 = SOF_TIMESTAMPING_TX_HARDWARE
    | SOF_TIMESTAMPING_TX_SOFTWARE
    | SOF_TIMESTAMPING_SOFTWARE
    | SOF_TIMESTAMPING_RAW_HARDWARE
    | SOF_TIMESTAMPING_OPT_TSONLY
    | SOF_TIMESTAMPING_OPT_ID
    | SOF_TIMESTAMPING_TX_ACK;

/// Flags for the receive path: raw hardware RX stamps
pub const RX_TIMESTAMPING_FLAGS: u32 =
    SOF_TIMESTAMPING_RX_HARDWARE | SOF_TIMESTAMPING_SOFTWARE | SOF_TIMESTAMPING_RAW_HARDWARE;

/// Software-only receive stamps, usable on interfaces without a PHC
pub const RX_SOFTWARE_TIMESTAMPING_FLAGS: u32 =
    SOF_TIMESTAMPING_RX_SOFTWARE | SOF_TIMESTAMPING_SOFTWARE;

// <linux/sockios.h> and <linux/net_tstamp.h>
const SIOCSHWTSTAMP: libc::c_ulong = 0x89b0;
const HWTSTAMP_TX_OFF: libc::c_int = 0;
const HWTSTAMP_TX_ON: libc::c_int = 1;
const HWTSTAMP_FILTER_NONE: libc::c_int = 0;
const HWTSTAMP_FILTER_ALL: libc::c_int = 1;

// <linux/errqueue.h>
const SO_EE_ORIGIN_TIMESTAMPING: u8 = 4;

/// Index of the raw hardware stamp in the `scm_timestamping` triple
const SCM_TS_HARDWARE: usize = 2;
/// Index of the software stamp (system clock domain, not the PHC)
const SCM_TS_SOFTWARE: usize = 0;

#[repr(C)]
struct HwTstampConfig {
    flags: libc::c_int,
    tx_type: libc::c_int,
    rx_filter: libc::c_int,
}

/// `struct ifreq` with the `ifr_data` union member
#[repr(C)]
struct IfReqData {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_data: *mut libc::c_void,
    _pad: [u8; 16],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SockExtendedErr {
    ee_errno: u32,
    ee_origin: u8,
    ee_type: u8,
    ee_code: u8,
    ee_pad: u8,
    ee_info: u32,
    ee_data: u32,
}

/// A hardware transmit completion read back from the error queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxCompletion {
    /// `SOF_TIMESTAMPING_OPT_ID` key: 0 for the socket's first send
    pub key: u32,
    /// Raw hardware stamp in the PHC domain, when the NIC provided one
    pub hardware: Option<Timestamp>,
    /// Software stamp in the system clock domain
    pub software: Option<Timestamp>,
}

/// A received datagram and the timestamps delivered with it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datagram {
    /// Payload length written to the receive buffer
    pub len: usize,
    /// Raw hardware RX stamp in the PHC domain
    pub hardware: Option<Timestamp>,
}

/// Send side of a probe session
pub trait TxTransport {
    /// Transmit one datagram
    fn send(&mut self, payload: &[u8]) -> io::Result<usize>;

    /// Wait (bounded) for the next transmit completion notification
    ///
    /// Returns `Ok(None)` when nothing arrived within the timeout.
    fn tx_completion(&mut self) -> io::Result<Option<TxCompletion>>;
}

/// Receive side of a probe session
pub trait RxTransport {
    /// Receive one datagram into `buf`
    ///
    /// Returns `Ok(None)` when the receive timeout elapsed so the caller
    /// can check its stop signal.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<Datagram>>;
}

/// Socket settings for the TX probe
#[derive(Debug, Clone)]
pub struct TxSocketConfig {
    pub interface: String,
    pub source: SocketAddrV4,
    pub destination: SocketAddrV4,
    pub completion_timeout: Duration,
}

/// Socket settings for the RX probe
#[derive(Debug, Clone)]
pub struct RxSocketConfig {
    pub interface: String,
    pub bind: SocketAddrV4,
    pub recv_timeout: Duration,
}

/// UDP socket with `SO_TIMESTAMPING` enabled
pub struct TimestampedSocket {
    socket: Socket,
    completion_timeout: Duration,
}

impl TimestampedSocket {
    /// Create, bind and connect the TX probe socket and enable TX stamping
    pub fn open_tx(config: &TxSocketConfig) -> io::Result<Self> {
        info!(
            "Opening TX socket on {} ({} -> {})",
            config.interface, config.source, config.destination
        );
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.bind_device(Some(config.interface.as_bytes()))?;
        socket.bind(&config.source.into())?;
        socket.connect(&config.destination.into())?;

        enable_hw_timestamping(&socket, &config.interface, true, false)?;
        enable_timestamping(&socket, TX_TIMESTAMPING_FLAGS)?;
        enable_recv_err(&socket)?;

        Ok(Self::from_socket(socket, config.completion_timeout))
    }

    /// Create and bind the RX probe socket and enable RX stamping
    pub fn open_rx(config: &RxSocketConfig) -> io::Result<Self> {
        info!("Opening RX socket on {} ({})", config.interface, config.bind);
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.bind_device(Some(config.interface.as_bytes()))?;

        enable_hw_timestamping(&socket, &config.interface, false, true)?;
        enable_timestamping(&socket, RX_TIMESTAMPING_FLAGS)?;

        socket.bind(&config.bind.into())?;
        socket.set_read_timeout(Some(config.recv_timeout))?;

        Ok(Self::from_socket(socket, Duration::ZERO))
    }

    /// Wrap an already configured socket
    pub fn from_socket(socket: Socket, completion_timeout: Duration) -> Self {
        Self {
            socket,
            completion_timeout,
        }
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    fn wait_for_error_queue(&self) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.socket.as_raw_fd(),
            events: libc::POLLERR,
            revents: 0,
        };
        let timeout_ms = self.completion_timeout.as_millis().min(i32::MAX as u128) as libc::c_int;

        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(ret > 0 && pfd.revents & libc::POLLERR != 0)
    }
}

impl TxTransport for TimestampedSocket {
    fn send(&mut self, payload: &[u8]) -> io::Result<usize> {
        self.socket.send(payload)
    }

    fn tx_completion(&mut self) -> io::Result<Option<TxCompletion>> {
        if !self.wait_for_error_queue()? {
            return Ok(None);
        }

        // OPT_TSONLY: the error queue carries no payload, only control data
        let mut data = [0u8; 64];
        let control = match recv_with_control(&self.socket, &mut data, libc::MSG_ERRQUEUE)? {
            Some((_, control)) => control,
            None => return Ok(None),
        };

        let key = match control.extended_err {
            Some(err)
                if err.ee_origin == SO_EE_ORIGIN_TIMESTAMPING
                    && err.ee_errno == libc::ENOMSG as u32 =>
            {
                err.ee_data
            }
            other => {
                debug!("Ignoring error queue message without timestamp key: {:?}", other);
                return Ok(None);
            }
        };

        let (hardware, software) = match control.timestamping {
            Some(ts) => (
                clock::delivered(&ts[SCM_TS_HARDWARE], Provenance::Hardware),
                clock::delivered(&ts[SCM_TS_SOFTWARE], Provenance::Software),
            ),
            None => (None, None),
        };

        Ok(Some(TxCompletion {
            key,
            hardware,
            software,
        }))
    }
}

impl RxTransport for TimestampedSocket {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<Datagram>> {
        let (len, control) = match recv_with_control(&self.socket, buf, 0)? {
            Some(received) => received,
            None => return Ok(None),
        };

        let hardware = control
            .timestamping
            .and_then(|ts| clock::delivered(&ts[SCM_TS_HARDWARE], Provenance::Hardware));

        Ok(Some(Datagram { len, hardware }))
    }
}

/// Control data extracted from one `recvmsg` call
#[derive(Default)]
struct ControlData {
    timestamping: Option<[libc::timespec; 3]>,
    extended_err: Option<SockExtendedErr>,
}

/// `recvmsg` into `buf`, returning the length and parsed control messages
///
/// Timeouts and interrupted calls yield `Ok(None)`.
fn recv_with_control(
    socket: &Socket,
    buf: &mut [u8],
    flags: libc::c_int,
) -> io::Result<Option<(usize, ControlData)>> {
    // u64 backing keeps the control buffer aligned for cmsghdr
    let mut control = [0u64; 64];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = mem::size_of_val(&control) as _;

    let n = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, flags) };
    if n < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                Ok(None)
            }
            _ => Err(err),
        };
    }

    let parsed = unsafe { parse_control(&msg) };
    Ok(Some((n as usize, parsed)))
}

/// Walk the control messages of a filled-in msghdr
///
/// # Safety
///
/// `msg` must come from a successful `recvmsg` whose control buffer is
/// still alive.
unsafe fn parse_control(msg: &libc::msghdr) -> ControlData {
    let mut data = ControlData::default();
    let ts_len = libc::CMSG_LEN(mem::size_of::<[libc::timespec; 3]>() as u32) as usize;
    let err_len = libc::CMSG_LEN(mem::size_of::<SockExtendedErr>() as u32) as usize;

    let mut cmsg = libc::CMSG_FIRSTHDR(msg);
    while !cmsg.is_null() {
        let hdr = &*cmsg;
        let payload = libc::CMSG_DATA(cmsg);
        let len = hdr.cmsg_len as usize;

        match (hdr.cmsg_level, hdr.cmsg_type) {
            (libc::SOL_SOCKET, libc::SCM_TIMESTAMPING) if len >= ts_len => {
                data.timestamping =
                    Some(std::ptr::read_unaligned(payload as *const [libc::timespec; 3]));
            }
            (libc::SOL_IP, libc::IP_RECVERR) if len >= err_len => {
                data.extended_err = Some(std::ptr::read_unaligned(payload as *const SockExtendedErr));
            }
            _ => {}
        }

        cmsg = libc::CMSG_NXTHDR(msg, cmsg);
    }

    data
}

/// Enable `SO_TIMESTAMPING` with the given flags
pub fn enable_timestamping(socket: &Socket, flags: u32) -> io::Result<()> {
    setsockopt_int(socket, libc::SOL_SOCKET, libc::SO_TIMESTAMPING, flags as libc::c_int)
}

/// Enable extended error reporting so TX timestamps reach the error queue
pub fn enable_recv_err(socket: &Socket) -> io::Result<()> {
    setsockopt_int(socket, libc::SOL_IP, libc::IP_RECVERR, 1)
}

/// Switch the NIC's hardware timestamping on for one direction (`SIOCSHWTSTAMP`)
pub fn enable_hw_timestamping(socket: &Socket, interface: &str, tx: bool, rx: bool) -> io::Result<()> {
    let name = interface.as_bytes();
    if name.is_empty() || name.len() >= libc::IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid interface name '{}'", interface),
        ));
    }

    let mut config = HwTstampConfig {
        flags: 0,
        tx_type: if tx { HWTSTAMP_TX_ON } else { HWTSTAMP_TX_OFF },
        rx_filter: if rx {
            HWTSTAMP_FILTER_ALL
        } else {
            HWTSTAMP_FILTER_NONE
        },
    };

    let mut ifr = IfReqData {
        ifr_name: [0; libc::IFNAMSIZ],
        ifr_data: &mut config as *mut HwTstampConfig as *mut libc::c_void,
        _pad: [0; 16],
    };
    for (dst, &src) in ifr.ifr_name.iter_mut().zip(name) {
        *dst = src as libc::c_char;
    }

    let ret = unsafe { libc::ioctl(socket.as_raw_fd(), SIOCSHWTSTAMP as _, &mut ifr) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    debug!(
        "SIOCSHWTSTAMP on {}: tx={} rx={} (driver granted tx_type={} rx_filter={})",
        interface, tx, rx, config.tx_type, config.rx_filter
    );
    Ok(())
}

fn setsockopt_int(
    socket: &Socket,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
