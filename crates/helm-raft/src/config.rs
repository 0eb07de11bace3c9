//! Timing configuration for the consensus core.

use std::ops::Range;
use std::time::Duration;

// ============================================================================
// Raft Configuration
// ============================================================================

/// Protocol timing for a replica.
///
/// The defaults follow the classic single-datacenter tuning: election
/// timeouts an order of magnitude above the heartbeat interval, redrawn
/// randomly per reset so replicas rarely collide.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Range the election timeout is drawn from, uniformly, at each reset.
    pub election_timeout: Range<Duration>,

    /// Interval between leader heartbeats.
    pub heartbeat_interval: Duration,

    /// How often the election ticker checks for a missed heartbeat.
    pub tick_interval: Duration,

    /// How long a client write waits for commit and apply before
    /// reporting `Timeout`.
    ///
    /// The companion client-side bounds (5s to submit, 15s to read the
    /// reply) live in the client, where that waiting actually happens.
    pub commit_wait: Duration,

    /// Interval of the registry's multi-leader monitor.
    pub monitor_interval: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(150)..Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            tick_interval: Duration::from_millis(15),
            commit_wait: Duration::from_secs(10),
            monitor_interval: Duration::from_secs(1),
        }
    }
}

impl RaftConfig {
    /// Timing for in-process cluster tests: the same shape, compressed.
    pub fn fast() -> Self {
        Self {
            election_timeout: Duration::from_millis(50)..Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(15),
            tick_interval: Duration::from_millis(5),
            commit_wait: Duration::from_millis(500),
            monitor_interval: Duration::from_millis(100),
        }
    }

    /// Draws a fresh election timeout.
    pub fn draw_election_timeout(&self) -> Duration {
        use rand::Rng;
        let start = self.election_timeout.start.as_millis() as u64;
        let end = self.election_timeout.end.as_millis() as u64;
        debug_assert!(start < end, "election timeout range must be non-empty");
        Duration::from_millis(rand::thread_rng().gen_range(start..end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timing_shape() {
        let config = RaftConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_millis(50));
        assert_eq!(config.election_timeout.start, Duration::from_millis(150));
        assert_eq!(config.election_timeout.end, Duration::from_millis(300));
        assert_eq!(config.commit_wait, Duration::from_secs(10));
    }

    #[test]
    fn election_timeout_draws_within_range() {
        let config = RaftConfig::default();
        for _ in 0..100 {
            let timeout = config.draw_election_timeout();
            assert!(config.election_timeout.contains(&timeout));
        }
    }
}
