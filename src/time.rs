use std::time::{Duration, SystemTime};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A point in time as seconds + nanoseconds since the Unix epoch.
///
/// Holds either a kernel-reported socket timestamp or a wall-clock sample;
/// the difference of two timestamps from the same source is the RTT.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    secs: i64,
    nanos: u32,
}

impl Timestamp {
    /// Samples the current wall-clock time.
    pub fn now() -> Timestamp {
        let d = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp {
            secs: d.as_secs() as i64,
            nanos: d.subsec_nanos(),
        }
    }

    /// Builds a timestamp from raw seconds/nanoseconds as reported by the
    /// kernel. Nanoseconds outside [0, 1e9) are normalized into the seconds
    /// field.
    pub fn from_unix(secs: i64, nanos: i64) -> Timestamp {
        let extra = nanos.div_euclid(NANOS_PER_SEC);
        let nanos = nanos.rem_euclid(NANOS_PER_SEC);
        Timestamp {
            secs: secs + extra,
            nanos: nanos as u32,
        }
    }

    /// Elapsed time since `earlier`, or `None` if `self` precedes it.
    pub fn checked_duration_since(self, earlier: Timestamp) -> Option<Duration> {
        let secs = (self.secs as i128) - (earlier.secs as i128);
        let nanos = (self.nanos as i128) - (earlier.nanos as i128);
        let total = secs * (NANOS_PER_SEC as i128) + nanos;
        u64::try_from(total).ok().map(Duration::from_nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_since_basic() {
        let tx = Timestamp::from_unix(1_700_000_000, 1_000_000);
        let rx = Timestamp::from_unix(1_700_000_000, 21_000_000);
        assert_eq!(
            rx.checked_duration_since(tx),
            Some(Duration::from_millis(20))
        );
    }

    #[test]
    fn duration_since_crosses_second_boundary() {
        let tx = Timestamp::from_unix(1_700_000_000, 999_000_000);
        let rx = Timestamp::from_unix(1_700_000_001, 1_000_000);
        assert_eq!(
            rx.checked_duration_since(tx),
            Some(Duration::from_millis(2))
        );
    }

    #[test]
    fn negative_difference_is_none() {
        let tx = Timestamp::from_unix(1_700_000_001, 0);
        let rx = Timestamp::from_unix(1_700_000_000, 0);
        assert_eq!(rx.checked_duration_since(tx), None);
    }

    #[test]
    fn nanos_are_normalized() {
        let a = Timestamp::from_unix(10, 1_500_000_000);
        let b = Timestamp::from_unix(11, 500_000_000);
        assert_eq!(a, b);

        let c = Timestamp::from_unix(10, -500_000_000);
        let d = Timestamp::from_unix(9, 500_000_000);
        assert_eq!(c, d);
    }

    #[test]
    fn now_is_monotonic_enough() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(b.checked_duration_since(a).is_some());
    }
}
