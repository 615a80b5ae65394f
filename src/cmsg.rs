//! Decoding of socket ancillary data into kernel timestamps.
//!
//! The kernel attaches an `SO_TIMESTAMPING_NEW` control message to ordinary
//! receives and to looped packets on the error queue. Its payload starts with
//! two native-endian signed 64-bit values: seconds, then nanoseconds.

use std::mem;

use thiserror::Error;

use crate::time::Timestamp;

/// CmsgError is returned when no usable timestamp can be decoded from an
/// ancillary-data buffer.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CmsgError {
    /// The buffer held no socket-level timestamping control message.
    #[error("no timestamp control message present")]
    NoTimestamp,
    /// A control-message header declared a length past the end of the buffer.
    #[error("truncated control message")]
    Truncated,
}

const HDR_LEN: usize = mem::size_of::<libc::cmsghdr>();

// CMSG_ALIGN: control messages are laid out on size_t boundaries.
fn cmsg_align(len: usize) -> usize {
    let align = mem::size_of::<libc::size_t>();
    (len + align - 1) & !(align - 1)
}

/// Extracts the kernel timestamp from a raw ancillary-data buffer.
///
/// Walks the buffer as a sequence of `cmsghdr`-framed records and returns the
/// timestamp from the first record with level `SOL_SOCKET`, type
/// `SO_TIMESTAMPING_NEW`, and at least 16 payload bytes. Absence of such a
/// record is an explicit failure; it is never treated as "timestamp = now",
/// which would silently corrupt the reported RTT.
pub fn timestamp_from_cmsgs(oob: &[u8]) -> Result<Timestamp, CmsgError> {
    let mut off = 0;
    while off + HDR_LEN <= oob.len() {
        // cmsghdr fields are aligned within the buffer the kernel filled, but
        // read unaligned to stay independent of the slice's own alignment.
        let hdr: libc::cmsghdr =
            unsafe { std::ptr::read_unaligned(oob[off..].as_ptr() as *const libc::cmsghdr) };
        let cmsg_len = hdr.cmsg_len as usize;
        if cmsg_len < HDR_LEN || off + cmsg_len > oob.len() {
            return Err(CmsgError::Truncated);
        }
        let data = &oob[off + HDR_LEN..off + cmsg_len];
        if hdr.cmsg_level == libc::SOL_SOCKET
            && hdr.cmsg_type == libc::SO_TIMESTAMPING_NEW
            && data.len() >= 16
        {
            let secs = i64::from_ne_bytes(data[..8].try_into().unwrap_or_default());
            let nanos = i64::from_ne_bytes(data[8..16].try_into().unwrap_or_default());
            return Ok(Timestamp::from_unix(secs, nanos));
        }
        off += cmsg_align(cmsg_len);
    }
    Err(CmsgError::NoTimestamp)
}

/// Encodes a single control message for tests that simulate kernel receives.
#[cfg(test)]
pub(crate) fn encode_cmsg(level: i32, typ: i32, data: &[u8]) -> Vec<u8> {
    let cmsg_len = HDR_LEN + data.len();
    let mut hdr: libc::cmsghdr = unsafe { mem::zeroed() };
    hdr.cmsg_len = cmsg_len as _;
    hdr.cmsg_level = level;
    hdr.cmsg_type = typ;

    let mut buf = vec![0u8; cmsg_align(cmsg_len)];
    unsafe {
        std::ptr::copy_nonoverlapping(
            &hdr as *const libc::cmsghdr as *const u8,
            buf.as_mut_ptr(),
            HDR_LEN,
        );
    }
    buf[HDR_LEN..HDR_LEN + data.len()].copy_from_slice(data);
    buf
}

/// Encodes an `SO_TIMESTAMPING_NEW` control message carrying the given
/// instant, mirroring the kernel's wire layout.
#[cfg(test)]
pub(crate) fn encode_timestamp_cmsg(secs: i64, nanos: i64) -> Vec<u8> {
    let mut data = Vec::with_capacity(16);
    data.extend_from_slice(&secs.to_ne_bytes());
    data.extend_from_slice(&nanos.to_ne_bytes());
    encode_cmsg(libc::SOL_SOCKET, libc::SO_TIMESTAMPING_NEW, &data)
}
