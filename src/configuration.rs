pub use clap::Parser;
use thiserror::Error;

use crate::probe::{support_info, Protocol, TimestampSource};

/// ConfigurationError is returned when the parsed command line is internally
/// inconsistent.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("{source} timestamping is not supported for {protocol}")]
    UnsupportedTimestampSource {
        protocol: Protocol,
        source: TimestampSource,
    },
    #[error("--hostname is required for https probes")]
    MissingHostname,
}

#[derive(Parser, Debug)]
#[command(version, about = "Measure RTT with kernel or userspace timestamps", long_about = None)]
pub struct Configuration {
    /// Wire protocol used for probing
    #[arg(short = 'P', long, default_value = "stun")]
    pub protocol: Protocol,
    /// Timestamp source to trust for this probe
    #[arg(short = 's', long, default_value = "kernel")]
    pub source: TimestampSource,
    /// Destination address (no name resolution is performed)
    pub remote_addr: std::net::IpAddr,
    /// Destination port (ignored for ICMP)
    #[arg(short = 'p', long, default_value_t = 3478)]
    pub remote_port: u16,
    /// Host name presented during the TLS handshake (https only)
    #[arg(long)]
    pub hostname: Option<String>,
    /// Bound on each transmit-confirmation and reply wait, in milliseconds
    #[arg(short, long, default_value_t = 2000)]
    pub timeout_ms: u64,
    /// Number of probes to run
    #[arg(short, long, default_value_t = 1)]
    pub count: u32,
    /// Delay between consecutive probes, in milliseconds
    #[arg(short, long, default_value_t = 1000)]
    pub interval_ms: u64,
}

impl Configuration {
    /// Rejects combinations the capability matrix disallows, before any
    /// socket is opened.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let support = support_info(self.protocol);
        let allowed = match self.source {
            TimestampSource::Kernel => support.kernel_ts,
            TimestampSource::Userspace => support.userspace_ts,
        };
        if !allowed {
            return Err(ConfigurationError::UnsupportedTimestampSource {
                protocol: self.protocol,
                source: self.source,
            });
        }
        if self.protocol == Protocol::Https && self.hostname.is_none() {
            return Err(ConfigurationError::MissingHostname);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(protocol: Protocol, source: TimestampSource) -> Configuration {
        Configuration {
            protocol,
            source,
            remote_addr: "127.0.0.1".parse().unwrap(),
            remote_port: 3478,
            hostname: None,
            timeout_ms: 2000,
            count: 1,
            interval_ms: 1000,
        }
    }

    #[test]
    fn kernel_https_is_rejected() {
        let c = conf(Protocol::Https, TimestampSource::Kernel);
        assert!(matches!(
            c.validate(),
            Err(ConfigurationError::UnsupportedTimestampSource { .. })
        ));
    }

    #[test]
    fn userspace_tcp_is_rejected() {
        let c = conf(Protocol::Tcp, TimestampSource::Userspace);
        assert!(c.validate().is_err());
    }

    #[test]
    fn https_requires_hostname() {
        let mut c = conf(Protocol::Https, TimestampSource::Userspace);
        assert!(matches!(
            c.validate(),
            Err(ConfigurationError::MissingHostname)
        ));
        c.hostname = Some("example.com".into());
        assert!(c.validate().is_ok());
    }

    #[test]
    fn allowed_pairs_validate() {
        assert!(conf(Protocol::Stun, TimestampSource::Kernel).validate().is_ok());
        assert!(conf(Protocol::Stun, TimestampSource::Userspace).validate().is_ok());
        assert!(conf(Protocol::Icmp, TimestampSource::Kernel).validate().is_ok());
        assert!(conf(Protocol::Icmp, TimestampSource::Userspace).validate().is_ok());
        assert!(conf(Protocol::Tcp, TimestampSource::Kernel).validate().is_ok());
    }
}
