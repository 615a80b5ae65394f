use std::{fmt, io, str::FromStr};

use thiserror::Error;

use crate::cmsg::CmsgError;

/// Wire protocol family used for probing.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// STUN binding request/response over UDP.
    Stun,
    /// ICMP echo request/reply (ping sockets).
    Icmp,
    /// TCP handshake, RTT taken from the kernel's TCP_INFO estimate.
    Tcp,
    /// HTTPS request/response on an established TLS connection.
    Https,
}

/// ProtocolParseError is returned when parsing a protocol name fails.
#[derive(Error, Debug)]
pub enum ProtocolParseError {
    #[error("Invalid protocol (expected stun, icmp, tcp or https)")]
    InvalidProtocol,
}

impl FromStr for Protocol {
    type Err = ProtocolParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stun" => Ok(Protocol::Stun),
            "icmp" => Ok(Protocol::Icmp),
            "tcp" => Ok(Protocol::Tcp),
            "https" => Ok(Protocol::Https),
            _ => Err(ProtocolParseError::InvalidProtocol),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Protocol::Stun => write!(f, "stun"),
            Protocol::Icmp => write!(f, "icmp"),
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Https => write!(f, "https"),
        }
    }
}

/// Clock authority trusted for a single probe.
///
/// Selected by the caller per probe and immutable for that probe's duration.
/// Both the transmit and the receive timestamp of one probe always come from
/// the same source.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimestampSource {
    /// OS-reported timestamps from socket control messages.
    Kernel,
    /// Wall-clock sampling around the I/O calls.
    Userspace,
}

/// TimestampSourceParseError is returned when parsing a timestamp source fails.
#[derive(Error, Debug)]
pub enum TimestampSourceParseError {
    #[error("Invalid timestamp source (expected kernel or userspace)")]
    InvalidSource,
}

impl FromStr for TimestampSource {
    type Err = TimestampSourceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kernel" => Ok(TimestampSource::Kernel),
            "userspace" => Ok(TimestampSource::Userspace),
            _ => Err(TimestampSourceParseError::InvalidSource),
        }
    }
}

impl fmt::Display for TimestampSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TimestampSource::Kernel => write!(f, "kernel"),
            TimestampSource::Userspace => write!(f, "userspace"),
        }
    }
}

impl std::error::Error for TimestampSource {}

/// Capability descriptor for a protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProtocolSupport {
    /// Kernel socket timestamping is available.
    pub kernel_ts: bool,
    /// Userspace wall-clock timing is available.
    pub userspace_ts: bool,
    /// The connection may be reused across probes. When false (ICMP) replies
    /// arriving on the socket must never be assumed to belong to the most
    /// recent probe; identity matching is mandatory either way.
    pub stable_conn: bool,
}

/// Returns the static capability table entry for a protocol.
///
/// Callers must consult this before requesting a [`TimestampSource`];
/// requesting kernel timestamps for a protocol without `kernel_ts` is a
/// caller error and is rejected before any socket I/O.
pub fn support_info(p: Protocol) -> ProtocolSupport {
    match p {
        Protocol::Stun => ProtocolSupport {
            kernel_ts: true,
            userspace_ts: true,
            stable_conn: true,
        },
        Protocol::Https => ProtocolSupport {
            kernel_ts: false,
            userspace_ts: true,
            stable_conn: true,
        },
        Protocol::Tcp => ProtocolSupport {
            kernel_ts: true,
            userspace_ts: false,
            stable_conn: true,
        },
        Protocol::Icmp => ProtocolSupport {
            kernel_ts: true,
            userspace_ts: true,
            stable_conn: false,
        },
    }
}

/// Probe failure taxonomy.
///
/// Transmit failures and timestamp-decode failures carry their cause in the
/// message only, so the root cause is not hidden behind a chain. The reply
/// timeout keeps its source so callers can still inspect the underlying
/// deadline condition and treat repeated timeouts as a connectivity signal.
#[derive(Error, Debug)]
pub enum ProbeError {
    /// Socket creation, bind, or option-set failure during probe setup.
    #[error("socket setup error: {0}")]
    Setup(io::Error),

    /// The capability matrix does not allow this (protocol, source) pair.
    #[error("{source} timestamping is not supported for {protocol}")]
    TimestampSourceUnsupported {
        protocol: Protocol,
        source: TimestampSource,
    },

    /// The protocol needs a caller-supplied connection and none was given.
    #[error("no connection supplied for {0} probe")]
    MissingConnection(Protocol),

    /// The hostname is not a valid TLS server name.
    #[error("invalid TLS server name: {0}")]
    InvalidServerName(String),

    #[error("sendto error: {0}")]
    Send(io::Error),

    #[error("recvmsg error: {0}")]
    Recv(io::Error),

    /// The packet was sent but no looped transmit-timestamp notification
    /// arrived on the error queue before the deadline.
    #[error("timed out waiting for transmit timestamp confirmation")]
    TxConfirmTimeout,

    /// No matching reply arrived before the deadline.
    #[error("timed out waiting for probe reply")]
    ReplyTimeout(#[source] tokio::time::error::Elapsed),

    #[error("failed to get tx timestamp: {0}")]
    TxTimestamp(CmsgError),

    #[error("failed to get rx timestamp: {0}")]
    RxTimestamp(CmsgError),

    /// The receive timestamp precedes the transmit timestamp. Reported as a
    /// failure rather than masked as a zero RTT.
    #[error("receive timestamp precedes transmit timestamp")]
    TimestampOrder,
}
