use crate::error::{ParloError, Result};
use std::time::Duration;

/// Tuning knobs shared by listeners and clients. The defaults are the
/// protocol's nominal operating point; tests shrink the intervals to keep
/// wall-clock time down.
#[derive(Debug, Clone)]
pub struct ParloConfig {
    /// Interval between outgoing heartbeats. The missed-heartbeat monitor
    /// runs on the same interval, so both peers should agree on this value.
    pub heartbeat_interval: Duration,

    /// Number of heartbeat intervals that may elapse without receiving a
    /// heartbeat before the peer is considered dead.
    pub max_missed_heartbeats: u32,

    /// Payloads smaller than this are never compressed - the frame overhead
    /// and codec latency outweigh any savings.
    pub compression_threshold: usize,

    /// Compression only kicks in when the measured round-trip time exceeds
    /// this many milliseconds; on fast links the CPU cost is not worth it.
    pub rtt_compression_threshold_ms: i64,

    /// SO_LINGER timeout applied to accepted sockets so queued goodbye
    /// frames get a chance to drain on close.
    pub accept_linger: Duration,
}

impl Default for ParloConfig {
    fn default() -> ParloConfig {
        ParloConfig {
            heartbeat_interval: Duration::from_secs(30),
            max_missed_heartbeats: 6,
            compression_threshold: 1024,
            rtt_compression_threshold_ms: 100,
            accept_linger: Duration::from_secs(5),
        }
    }
}

impl ParloConfig {
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(ParloError::InvalidArgument("heartbeat interval must be non-zero"));
        }
        if self.max_missed_heartbeats == 0 {
            return Err(ParloError::InvalidArgument("max missed heartbeats must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(ParloConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_heartbeat_interval() {
        let config = ParloConfig {
            heartbeat_interval: Duration::ZERO,
            ..ParloConfig::default()
        };
        assert!(matches!(config.validate(), Err(ParloError::InvalidArgument(_))));
    }

    #[test]
    fn test_rejects_zero_missed_heartbeats() {
        let config = ParloConfig {
            max_missed_heartbeats: 0,
            ..ParloConfig::default()
        };
        assert!(matches!(config.validate(), Err(ParloError::InvalidArgument(_))));
    }
}
