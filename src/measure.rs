//! Per-protocol RTT measurement functions and the protocol dispatcher.
//!
//! Every function follows the same contract: encode a probe carrying a fresh
//! identity, transmit it, correlate the reply (and, for kernel timestamping,
//! the looped transmit confirmation on the error queue) by that identity, and
//! return `receive_timestamp - transmit_timestamp` with both timestamps drawn
//! from the same clock source. Non-matching traffic sharing the socket is
//! skipped and the bounded wait continues; deadline expiry is a typed
//! failure, never a fabricated RTT.

use std::{io, mem, net::SocketAddr, os::fd::AsRawFd, sync::Arc, time::Duration};

use log::debug;
use rand::Rng;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::Instant,
};
use tokio_rustls::{
    rustls::{pki_types::ServerName, ClientConfig, RootCertStore},
    TlsConnector,
};

use crate::{
    cmsg,
    conn::{ProbeIo, ProbeSocket, SocketError},
    echo::{self, EchoFamily, FINGERPRINT},
    probe::{support_info, ProbeError, Protocol, TimestampSource},
    stun::{self, TxId},
    time::Timestamp,
};

const RECV_BUF_LEN: usize = 1024;
const OOB_BUF_LEN: usize = 1024;

/// Measures RTT to `dst` with the given protocol and timestamp source.
///
/// The capability matrix is consulted first: a (protocol, source) pair the
/// matrix disallows is rejected before any socket I/O. STUN and ICMP need a
/// caller-supplied [`ProbeSocket`] from the matching factory; TCP and HTTPS
/// establish their own connection. `hostname` is only used by HTTPS, as the
/// TLS server name.
pub async fn measure_rtt<R: Rng + Send>(
    protocol: Protocol,
    source: TimestampSource,
    conn: Option<&ProbeSocket>,
    hostname: &str,
    dst: SocketAddr,
    timeout: Duration,
    rng: &mut R,
) -> Result<Duration, ProbeError> {
    let support = support_info(protocol);
    let allowed = match source {
        TimestampSource::Kernel => support.kernel_ts,
        TimestampSource::Userspace => support.userspace_ts,
    };
    if !allowed {
        return Err(ProbeError::TimestampSourceUnsupported { protocol, source });
    }

    match protocol {
        Protocol::Stun => {
            let conn = conn.ok_or(ProbeError::MissingConnection(protocol))?;
            match source {
                TimestampSource::Kernel => measure_stun_rtt_kernel(conn, dst, timeout, rng).await,
                TimestampSource::Userspace => measure_stun_rtt(conn, dst, timeout, rng).await,
            }
        }
        Protocol::Icmp => {
            let conn = conn.ok_or(ProbeError::MissingConnection(protocol))?;
            measure_icmp_rtt(source, conn, dst, timeout, rng).await
        }
        Protocol::Tcp => measure_tcp_rtt(dst, timeout).await,
        Protocol::Https => measure_https_rtt(hostname, dst, timeout).await,
    }
}

/// Measures RTT with an ICMP echo exchange.
///
/// The request carries identifier 0 (the kernel rewrites and routes it, so
/// there is no point setting or verifying it), a random sequence number so a
/// late reply from a previous window is never accounted to this probe, and
/// the fixed fingerprint payload.
pub async fn measure_icmp_rtt<C, R>(
    source: TimestampSource,
    conn: &C,
    dst: SocketAddr,
    timeout: Duration,
    rng: &mut R,
) -> Result<Duration, ProbeError>
where
    C: ProbeIo + Sync,
    R: Rng + Send,
{
    let family = EchoFamily::for_addr(dst.ip());
    let seq: u16 = rng.gen();
    let tx_buf = echo::build_echo_request(family, seq, FINGERPRINT);

    // Fallback transmit timestamp, used verbatim for userspace timing and
    // overwritten by the looped kernel timestamp otherwise.
    let mut tx_at = Timestamp::now();
    conn.send_probe(&tx_buf, dst).await?;

    if source == TimestampSource::Kernel {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; RECV_BUF_LEN];
        let mut oob = vec![0u8; OOB_BUF_LEN];
        loop {
            let (n, oobn) = match conn.recv_errqueue(&mut buf, &mut oob, deadline).await {
                Ok(v) => v,
                Err(SocketError::Elapsed(_)) => return Err(ProbeError::TxConfirmTimeout),
                Err(SocketError::Io(e)) => return Err(ProbeError::Recv(e)),
            };
            // The full packet is looped including lower-layer headers, so
            // match our message against the tail.
            if n < tx_buf.len() {
                continue;
            }
            if !echo::matches_looped_request(&buf[n - tx_buf.len()..n], family, seq, FINGERPRINT) {
                debug!("skipping non-matching errqueue read ({} bytes)", n);
                continue;
            }
            tx_at = cmsg::timestamp_from_cmsgs(&oob[..oobn]).map_err(ProbeError::TxTimestamp)?;
            break;
        }
    }

    let deadline = Instant::now() + timeout;
    let mut buf = vec![0u8; RECV_BUF_LEN];
    let mut oob = vec![0u8; OOB_BUF_LEN];
    loop {
        let (n, oobn) = match conn.recv_msg(&mut buf, &mut oob, deadline).await {
            Ok(v) => v,
            Err(SocketError::Elapsed(e)) => return Err(ProbeError::ReplyTimeout(e)),
            Err(SocketError::Io(e)) => return Err(ProbeError::Recv(e)),
        };
        let rx_wall = Timestamp::now();
        if !echo::matches_echo_reply(&buf[..n], family, seq, FINGERPRINT) {
            debug!("skipping non-matching receive ({} bytes)", n);
            continue;
        }
        let rx_at = match source {
            TimestampSource::Kernel => {
                cmsg::timestamp_from_cmsgs(&oob[..oobn]).map_err(ProbeError::RxTimestamp)?
            }
            TimestampSource::Userspace => rx_wall,
        };
        return rx_at
            .checked_duration_since(tx_at)
            .ok_or(ProbeError::TimestampOrder);
    }
}

/// Measures RTT with a STUN binding exchange, timestamps from the kernel.
///
/// The looped transmit copy is matched by byte equality of its tail against
/// the request; the whole request is retransmitted verbatim into the error
/// queue, so no structured parsing is needed there.
pub async fn measure_stun_rtt_kernel<C, R>(
    conn: &C,
    dst: SocketAddr,
    timeout: Duration,
    rng: &mut R,
) -> Result<Duration, ProbeError>
where
    C: ProbeIo + Sync,
    R: Rng + Send,
{
    let txid = TxId::generate(rng);
    let req = stun::binding_request(&txid);
    conn.send_probe(&req, dst).await?;

    let deadline = Instant::now() + timeout;
    let mut buf = vec![0u8; RECV_BUF_LEN];
    let mut oob = vec![0u8; OOB_BUF_LEN];
    let tx_at;
    loop {
        let (n, oobn) = match conn.recv_errqueue(&mut buf, &mut oob, deadline).await {
            Ok(v) => v,
            Err(SocketError::Elapsed(_)) => return Err(ProbeError::TxConfirmTimeout),
            Err(SocketError::Io(e)) => return Err(ProbeError::Recv(e)),
        };
        if n < req.len() || buf[n - req.len()..n] != req[..] {
            debug!("skipping non-matching errqueue read ({} bytes)", n);
            continue;
        }
        tx_at = cmsg::timestamp_from_cmsgs(&oob[..oobn]).map_err(ProbeError::TxTimestamp)?;
        break;
    }

    let deadline = Instant::now() + timeout;
    loop {
        let (n, oobn) = match conn.recv_msg(&mut buf, &mut oob, deadline).await {
            Ok(v) => v,
            Err(SocketError::Elapsed(e)) => return Err(ProbeError::ReplyTimeout(e)),
            Err(SocketError::Io(e)) => return Err(ProbeError::Recv(e)),
        };
        // Extremely late responses from previous intervals may still arrive,
        // so parse failures and foreign transaction IDs alike just spin.
        match stun::parse_binding_response(&buf[..n]) {
            Ok(got) if got == txid => {}
            _ => {
                debug!("skipping non-matching receive ({} bytes)", n);
                continue;
            }
        }
        let rx_at = cmsg::timestamp_from_cmsgs(&oob[..oobn]).map_err(ProbeError::RxTimestamp)?;
        return rx_at
            .checked_duration_since(tx_at)
            .ok_or(ProbeError::TimestampOrder);
    }
}

/// Measures RTT with a STUN binding exchange, wall-clock timed.
pub async fn measure_stun_rtt<C, R>(
    conn: &C,
    dst: SocketAddr,
    timeout: Duration,
    rng: &mut R,
) -> Result<Duration, ProbeError>
where
    C: ProbeIo + Sync,
    R: Rng + Send,
{
    let txid = TxId::generate(rng);
    let req = stun::binding_request(&txid);
    let tx_at = Timestamp::now();
    conn.send_probe(&req, dst).await?;

    let deadline = Instant::now() + timeout;
    let mut buf = vec![0u8; RECV_BUF_LEN];
    let mut oob = vec![0u8; OOB_BUF_LEN];
    loop {
        let (n, _) = match conn.recv_msg(&mut buf, &mut oob, deadline).await {
            Ok(v) => v,
            Err(SocketError::Elapsed(e)) => return Err(ProbeError::ReplyTimeout(e)),
            Err(SocketError::Io(e)) => return Err(ProbeError::Recv(e)),
        };
        let rx_at = Timestamp::now();
        match stun::parse_binding_response(&buf[..n]) {
            Ok(got) if got == txid => {}
            _ => {
                debug!("skipping non-matching receive ({} bytes)", n);
                continue;
            }
        }
        return rx_at
            .checked_duration_since(tx_at)
            .ok_or(ProbeError::TimestampOrder);
    }
}

/// Measures RTT by establishing a TCP connection and reading the kernel's
/// round-trip estimate from TCP_INFO.
///
/// Userspace timing of a handshake would fold scheduling jitter into the
/// result, which is why the capability matrix only offers the kernel source
/// for TCP.
pub async fn measure_tcp_rtt(dst: SocketAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(dst))
        .await
        .map_err(ProbeError::ReplyTimeout)?
        .map_err(ProbeError::Setup)?;
    tcp_info_rtt(&stream)
}

fn tcp_info_rtt(stream: &TcpStream) -> Result<Duration, ProbeError> {
    let mut info: libc::tcp_info = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::tcp_info>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            &mut info as *mut libc::tcp_info as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(ProbeError::Setup(io::Error::last_os_error()));
    }
    // tcpi_rtt is microseconds.
    Ok(Duration::from_micros(info.tcpi_rtt as u64))
}

/// Measures RTT as the time from writing an HTTP request to the first byte
/// of the response, on a freshly established TLS connection.
///
/// The TCP connect and TLS handshake are setup, not part of the measured
/// interval.
pub async fn measure_https_rtt(
    hostname: &str,
    dst: SocketAddr,
    timeout: Duration,
) -> Result<Duration, ProbeError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(hostname.to_string())
        .map_err(|_| ProbeError::InvalidServerName(hostname.to_string()))?;

    let stream = tokio::time::timeout(timeout, TcpStream::connect(dst))
        .await
        .map_err(ProbeError::ReplyTimeout)?
        .map_err(ProbeError::Setup)?;
    let mut tls = tokio::time::timeout(timeout, connector.connect(server_name, stream))
        .await
        .map_err(ProbeError::ReplyTimeout)?
        .map_err(ProbeError::Setup)?;

    let request = format!("HEAD / HTTP/1.1\r\nHost: {hostname}\r\nConnection: close\r\n\r\n");
    let tx_at = Timestamp::now();
    tls.write_all(request.as_bytes())
        .await
        .map_err(ProbeError::Send)?;
    let mut first = [0u8; 1];
    tokio::time::timeout(timeout, tls.read_exact(&mut first))
        .await
        .map_err(ProbeError::ReplyTimeout)?
        .map_err(ProbeError::Recv)?;
    let rx_at = Timestamp::now();

    rx_at
        .checked_duration_since(tx_at)
        .ok_or(ProbeError::TimestampOrder)
}
