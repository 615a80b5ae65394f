//! stunstamp - protocol-flexible RTT measurement with kernel timestamps.
//!
//! This crate measures round-trip time to remote hosts over STUN, ICMP echo,
//! TCP, or HTTPS, using either kernel socket timestamping (timestamps taken
//! near the network driver, via `SO_TIMESTAMPING_NEW` control messages and
//! the socket error queue) or plain userspace wall-clock sampling. Userspace
//! timing around a blocking send/receive folds scheduling jitter into the
//! result, which dominates RTTs on fast paths; kernel timestamps avoid that.
//!
//! # Usage
//!
//! Probe a STUN server with kernel timestamps:
//! ```bash
//! stunstamp -p 3478 203.0.113.7
//! ```
//!
//! Ping with userspace timing:
//! ```bash
//! stunstamp -P icmp -s userspace 203.0.113.7
//! ```

/// Ancillary-data timestamp decoding.
pub mod cmsg;
/// Command-line configuration and validation.
pub mod configuration;
/// Probe socket factories and deadline-bounded socket I/O.
pub mod conn;
/// ICMP echo construction and matching.
pub mod echo;
/// Per-protocol measurement functions.
pub mod measure;
/// Protocol/timestamp-source model, capability matrix, error taxonomy.
pub mod probe;
/// STUN binding request/response framing.
pub mod stun;
/// Timestamp representation shared by kernel and userspace sources.
pub mod time;
