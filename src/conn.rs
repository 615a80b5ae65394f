//! Probe socket construction and deadline-bounded message I/O.
//!
//! Factories open the OS-level socket a protocol needs (datagram ICMP for
//! echo probes, wildcard-bound UDP for STUN) and, when kernel timestamps are
//! requested, enable `SO_TIMESTAMPING_NEW` so the kernel timestamps receives
//! and loops transmitted packets with their send timestamp back onto the
//! socket's error queue. A failed option set aborts setup; a probe must never
//! silently fall back to userspace timing when the caller asked for kernel
//! precision.

use std::{
    io,
    mem,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    os::fd::AsRawFd,
    time::Duration,
};

use async_trait::async_trait;
use socket2::{Domain, Protocol as SockProtocol, SockAddr, Socket, Type};
use thiserror::Error;
use tokio::time::Instant;

use crate::probe::{ProbeError, TimestampSource};

// tx timestamp generation in the device driver, rx timestamp generation in
// the kernel, report software timestamps.
const TIMESTAMPING_FLAGS: libc::c_int = (libc::SOF_TIMESTAMPING_TX_SOFTWARE
    | libc::SOF_TIMESTAMPING_RX_SOFTWARE
    | libc::SOF_TIMESTAMPING_SOFTWARE) as libc::c_int;

/// How often an empty socket is re-polled while a wait deadline is pending.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// SocketError distinguishes an elapsed wait deadline from an I/O failure on
/// the socket itself.
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("receive deadline elapsed")]
    Elapsed(#[from] tokio::time::error::Elapsed),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The capability contract a measurement function needs from a connection:
/// send to a destination, receive with ancillary data under a deadline, and
/// read the error queue under a deadline. Any socket satisfying this is an
/// acceptable probe connection; tests substitute a scripted implementation.
#[async_trait]
pub trait ProbeIo {
    /// Transmits one probe datagram to `dst`.
    async fn send_probe(&self, buf: &[u8], dst: SocketAddr) -> Result<(), ProbeError>;

    /// Receives one datagram plus its ancillary data, returning the payload
    /// and ancillary byte counts. Waits no later than `deadline`.
    async fn recv_msg(
        &self,
        buf: &mut [u8],
        oob: &mut [u8],
        deadline: Instant,
    ) -> Result<(usize, usize), SocketError>;

    /// Like [`ProbeIo::recv_msg`] but reads the socket's error queue, where
    /// the kernel loops transmitted packets with their send timestamp.
    async fn recv_errqueue(
        &self,
        buf: &mut [u8],
        oob: &mut [u8],
        deadline: Instant,
    ) -> Result<(usize, usize), SocketError>;
}

/// An OS-level probe socket, owned by at most one in-flight probe at a time.
#[derive(Debug)]
pub struct ProbeSocket {
    sock: Socket,
}

impl ProbeSocket {
    /// Opens a datagram ICMP socket for the destination's address family.
    ///
    /// With [`TimestampSource::Kernel`] the timestamping socket option is
    /// enabled; if that fails the whole setup fails.
    pub fn icmp(for_dst: IpAddr, source: TimestampSource) -> Result<ProbeSocket, ProbeError> {
        let (domain, proto) = match for_dst {
            IpAddr::V4(_) => (Domain::IPV4, SockProtocol::ICMPV4),
            IpAddr::V6(_) => (Domain::IPV6, SockProtocol::ICMPV6),
        };
        let sock = Socket::new(domain, Type::DGRAM, Some(proto)).map_err(ProbeError::Setup)?;
        allow_addr_reuse(&sock).map_err(ProbeError::Setup)?;
        if source == TimestampSource::Kernel {
            enable_kernel_timestamping(&sock).map_err(ProbeError::Setup)?;
        }
        Ok(ProbeSocket { sock })
    }

    /// Opens a UDP socket bound to the wildcard address for the destination's
    /// family. The destination is supplied per send, so one socket serves
    /// repeated probes (`stable_conn`).
    pub fn udp(for_dst: IpAddr, source: TimestampSource) -> Result<ProbeSocket, ProbeError> {
        let (domain, wildcard) = match for_dst {
            IpAddr::V4(_) => (Domain::IPV4, IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            IpAddr::V6(_) => (Domain::IPV6, IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
        };
        let sock =
            Socket::new(domain, Type::DGRAM, Some(SockProtocol::UDP)).map_err(ProbeError::Setup)?;
        allow_addr_reuse(&sock).map_err(ProbeError::Setup)?;
        sock.bind(&SockAddr::from(SocketAddr::new(wildcard, 0)))
            .map_err(ProbeError::Setup)?;
        if source == TimestampSource::Kernel {
            enable_kernel_timestamping(&sock).map_err(ProbeError::Setup)?;
        }
        Ok(ProbeSocket { sock })
    }

    /// Local address the socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let addr = self.sock.local_addr()?;
        addr.as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "unexpected local address family"))
    }

    fn recvmsg_raw(&self, buf: &mut [u8], oob: &mut [u8], flags: i32) -> io::Result<(usize, usize)> {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = oob.as_mut_ptr().cast();
        msg.msg_controllen = oob.len() as _;

        let n = unsafe { libc::recvmsg(self.sock.as_raw_fd(), &mut msg, flags) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((n as usize, msg.msg_controllen as usize))
    }

    /// Polls the socket with MSG_DONTWAIT until a message arrives or the
    /// deadline passes. Multiple unrelated packets can arrive on the same
    /// socket, so callers loop over this until their match is found.
    async fn recv_bounded(
        &self,
        buf: &mut [u8],
        oob: &mut [u8],
        deadline: Instant,
        flags: i32,
    ) -> Result<(usize, usize), SocketError> {
        let recv = async {
            loop {
                match self.recvmsg_raw(buf, oob, flags) {
                    Ok(v) => return Ok(v),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        tokio::time::sleep(POLL_INTERVAL).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        let res = tokio::time::timeout_at(deadline, recv).await?;
        Ok(res?)
    }
}

#[async_trait]
impl ProbeIo for ProbeSocket {
    async fn send_probe(&self, buf: &[u8], dst: SocketAddr) -> Result<(), ProbeError> {
        self.sock
            .send_to(buf, &SockAddr::from(dst))
            .map_err(ProbeError::Send)?;
        Ok(())
    }

    async fn recv_msg(
        &self,
        buf: &mut [u8],
        oob: &mut [u8],
        deadline: Instant,
    ) -> Result<(usize, usize), SocketError> {
        self.recv_bounded(buf, oob, deadline, libc::MSG_DONTWAIT).await
    }

    async fn recv_errqueue(
        &self,
        buf: &mut [u8],
        oob: &mut [u8],
        deadline: Instant,
    ) -> Result<(usize, usize), SocketError> {
        self.recv_bounded(buf, oob, deadline, libc::MSG_DONTWAIT | libc::MSG_ERRQUEUE)
            .await
    }
}

/// Allows immediate reuse of a recently used local port.
///
/// Probing infrastructure may restart faster than TIME_WAIT can clear, so
/// this is applied to every probe socket right after creation, before any
/// bind. Idempotent.
pub fn allow_addr_reuse(sock: &Socket) -> io::Result<()> {
    sock.set_reuse_address(true)
}

fn enable_kernel_timestamping(sock: &Socket) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_TIMESTAMPING_NEW,
            &TIMESTAMPING_FLAGS as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_factory_binds_wildcard_ephemeral() {
        let sock = ProbeSocket::udp(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            TimestampSource::Userspace,
        )
        .unwrap();
        let local = sock.local_addr().unwrap();
        assert!(local.ip().is_unspecified());
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn addr_reuse_is_idempotent() {
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProtocol::UDP)).unwrap();
        allow_addr_reuse(&sock).unwrap();
        allow_addr_reuse(&sock).unwrap();
    }
}
