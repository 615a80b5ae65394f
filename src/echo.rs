//! ICMP echo construction and matching for both address families.
//!
//! Probes are plain echo requests with a zero identifier (ping sockets let
//! the kernel rewrite and demultiplex it), a random per-probe sequence
//! number, and a short fixed payload that fingerprints this tool's traffic.
//! Replies and looped transmit copies are matched on type, code, sequence,
//! and payload; anything else on the socket is foreign and gets skipped.

use std::net::IpAddr;

use pnet::packet::{
    icmp::{self, IcmpCode, IcmpPacket, IcmpTypes},
    icmpv6::{Icmpv6Code, Icmpv6Packet, Icmpv6Types},
    Packet,
};

/// Fixed ASCII payload identifying this tool's echo requests on the wire.
pub const FINGERPRINT: &[u8] = b"stunstamp";

/// Length of the fixed ICMP echo header preceding the payload.
pub const ECHO_HEADER_LEN: usize = 8;

/// Address family of an echo exchange, selecting v4 or v6 message types.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EchoFamily {
    V4,
    V6,
}

impl EchoFamily {
    /// Family matching the destination address.
    pub fn for_addr(addr: IpAddr) -> EchoFamily {
        match addr {
            IpAddr::V4(_) => EchoFamily::V4,
            IpAddr::V6(_) => EchoFamily::V6,
        }
    }
}

/// Serializes an echo request with identifier 0 and the given sequence and
/// payload.
///
/// The v4 checksum is filled in; the v6 checksum needs the IP pseudo-header
/// and is left to the kernel, which computes it on ICMPv6 ping sockets.
pub fn build_echo_request(family: EchoFamily, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; ECHO_HEADER_LEN + payload.len()];
    match family {
        EchoFamily::V4 => {
            {
                // Buffer always covers the fixed echo header.
                let mut pkt = icmp::echo_request::MutableEchoRequestPacket::new(&mut buf)
                    .expect("echo request buffer too small");
                pkt.set_icmp_type(IcmpTypes::EchoRequest);
                pkt.set_icmp_code(IcmpCode(0));
                pkt.set_identifier(0);
                pkt.set_sequence_number(seq);
                pkt.set_payload(payload);
            }
            let csum = IcmpPacket::new(&buf)
                .map(|pkt| icmp::checksum(&pkt))
                .unwrap_or(0);
            buf[2..4].copy_from_slice(&csum.to_be_bytes());
        }
        EchoFamily::V6 => {
            let mut pkt = pnet::packet::icmpv6::echo_request::MutableEchoRequestPacket::new(
                &mut buf,
            )
            .expect("echo request buffer too small");
            pkt.set_icmpv6_type(Icmpv6Types::EchoRequest);
            pkt.set_icmpv6_code(Icmpv6Code(0));
            pkt.set_identifier(0);
            pkt.set_sequence_number(seq);
            pkt.set_payload(payload);
        }
    }
    buf
}

/// Checks whether `buf` is a looped copy of our own echo request.
///
/// Used against the tail of error-queue reads; the kernel loops the full
/// transmitted packet back, so the caller slices off any leading headers
/// first. The message type must equal the transmitted request type for the
/// family.
pub fn matches_looped_request(buf: &[u8], family: EchoFamily, seq: u16, payload: &[u8]) -> bool {
    match family {
        EchoFamily::V4 => {
            let Some(pkt) = IcmpPacket::new(buf) else {
                return false;
            };
            if pkt.get_icmp_type() != IcmpTypes::EchoRequest || pkt.get_icmp_code() != IcmpCode(0) {
                return false;
            }
            match icmp::echo_request::EchoRequestPacket::new(buf) {
                Some(echo) => echo.get_sequence_number() == seq && echo.payload() == payload,
                None => false,
            }
        }
        EchoFamily::V6 => {
            let Some(pkt) = Icmpv6Packet::new(buf) else {
                return false;
            };
            if pkt.get_icmpv6_type() != Icmpv6Types::EchoRequest
                || pkt.get_icmpv6_code() != Icmpv6Code(0)
            {
                return false;
            }
            match pnet::packet::icmpv6::echo_request::EchoRequestPacket::new(buf) {
                Some(echo) => echo.get_sequence_number() == seq && echo.payload() == payload,
                None => false,
            }
        }
    }
}

/// Checks whether `buf` is the echo reply correlated with our request.
///
/// The reply type is the family's echo-reply counterpart; code, sequence,
/// and payload must round-trip unchanged from the request.
pub fn matches_echo_reply(buf: &[u8], family: EchoFamily, seq: u16, payload: &[u8]) -> bool {
    match family {
        EchoFamily::V4 => {
            let Some(pkt) = IcmpPacket::new(buf) else {
                return false;
            };
            if pkt.get_icmp_type() != IcmpTypes::EchoReply || pkt.get_icmp_code() != IcmpCode(0) {
                return false;
            }
            match icmp::echo_reply::EchoReplyPacket::new(buf) {
                Some(echo) => echo.get_sequence_number() == seq && echo.payload() == payload,
                None => false,
            }
        }
        EchoFamily::V6 => {
            let Some(pkt) = Icmpv6Packet::new(buf) else {
                return false;
            };
            if pkt.get_icmpv6_type() != Icmpv6Types::EchoReply
                || pkt.get_icmpv6_code() != Icmpv6Code(0)
            {
                return false;
            }
            match pnet::packet::icmpv6::echo_reply::EchoReplyPacket::new(buf) {
                Some(echo) => echo.get_sequence_number() == seq && echo.payload() == payload,
                None => false,
            }
        }
    }
}

/// Builds an echo reply mirroring a request, for loopback tests.
#[cfg(test)]
pub(crate) fn build_echo_reply(family: EchoFamily, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = build_echo_request(family, seq, payload);
    match family {
        EchoFamily::V4 => {
            buf[0] = IcmpTypes::EchoReply.0;
            buf[2..4].copy_from_slice(&[0, 0]);
            let csum = IcmpPacket::new(&buf)
                .map(|pkt| icmp::checksum(&pkt))
                .unwrap_or(0);
            buf[2..4].copy_from_slice(&csum.to_be_bytes());
        }
        EchoFamily::V6 => buf[0] = Icmpv6Types::EchoReply.0,
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_request_fields_round_trip() {
        let buf = build_echo_request(EchoFamily::V4, 0x1234, FINGERPRINT);
        assert_eq!(buf.len(), ECHO_HEADER_LEN + FINGERPRINT.len());
        let echo = icmp::echo_request::EchoRequestPacket::new(&buf).unwrap();
        assert_eq!(echo.get_icmp_type(), IcmpTypes::EchoRequest);
        assert_eq!(echo.get_icmp_code(), IcmpCode(0));
        assert_eq!(echo.get_identifier(), 0);
        assert_eq!(echo.get_sequence_number(), 0x1234);
        assert_eq!(echo.payload(), FINGERPRINT);
        // Checksum must be filled in for v4.
        assert_ne!(echo.get_checksum(), 0);
    }

    #[test]
    fn v6_request_fields_round_trip() {
        let buf = build_echo_request(EchoFamily::V6, 7, FINGERPRINT);
        let echo = pnet::packet::icmpv6::echo_request::EchoRequestPacket::new(&buf).unwrap();
        assert_eq!(echo.get_icmpv6_type(), Icmpv6Types::EchoRequest);
        assert_eq!(echo.get_sequence_number(), 7);
        assert_eq!(echo.payload(), FINGERPRINT);
    }

    #[test]
    fn looped_request_matches_itself() {
        for family in [EchoFamily::V4, EchoFamily::V6] {
            let buf = build_echo_request(family, 900, FINGERPRINT);
            assert!(matches_looped_request(&buf, family, 900, FINGERPRINT));
        }
    }

    #[test]
    fn looped_request_rejects_reply_type() {
        // A reply must never be taken as the transmit confirmation.
        let buf = build_echo_reply(EchoFamily::V4, 900, FINGERPRINT);
        assert!(!matches_looped_request(&buf, EchoFamily::V4, 900, FINGERPRINT));
    }

    #[test]
    fn reply_matches_on_all_fields() {
        for family in [EchoFamily::V4, EchoFamily::V6] {
            let buf = build_echo_reply(family, 321, FINGERPRINT);
            assert!(matches_echo_reply(&buf, family, 321, FINGERPRINT));
        }
    }

    #[test]
    fn reply_with_wrong_sequence_is_rejected() {
        let buf = build_echo_reply(EchoFamily::V4, 321, FINGERPRINT);
        assert!(!matches_echo_reply(&buf, EchoFamily::V4, 322, FINGERPRINT));
    }

    #[test]
    fn reply_with_foreign_payload_is_rejected() {
        let buf = build_echo_reply(EchoFamily::V4, 321, b"other-tool");
        assert!(!matches_echo_reply(&buf, EchoFamily::V4, 321, FINGERPRINT));
    }

    #[test]
    fn request_type_is_not_a_reply() {
        let buf = build_echo_request(EchoFamily::V4, 321, FINGERPRINT);
        assert!(!matches_echo_reply(&buf, EchoFamily::V4, 321, FINGERPRINT));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(!matches_echo_reply(&[0xff; 4], EchoFamily::V4, 1, FINGERPRINT));
        assert!(!matches_looped_request(&[], EchoFamily::V6, 1, FINGERPRINT));
    }
}
