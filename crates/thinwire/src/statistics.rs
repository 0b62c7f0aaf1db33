//! Per-session round-trip and transfer statistics.

use std::time::Duration;

/// Byte and packet counts for one framer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferCounters {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
}

impl TransferCounters {
    pub(crate) const fn record_sent(&mut self, bytes: usize, packets: usize) {
        self.bytes_sent += bytes as u64;
        self.packets_sent += packets as u64;
    }

    pub(crate) const fn record_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.packets_received += 1;
    }
}

/// Session performance statistics.
///
/// Provides metrics for monitoring round-trip latency and wire volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStatistics {
    /// Number of round trips to the server.
    pub call_count: u32,
    /// Total time spent waiting for replies.
    pub accumulated_wait_time: Duration,
    /// Wire volume, headers included.
    pub transfer: TransferCounters,
}

impl SessionStatistics {
    pub(crate) fn record_call(&mut self, waited: Duration) {
        self.call_count = self.call_count.saturating_add(1);
        self.accumulated_wait_time += waited;
    }

    /// Average wait time per round trip.
    ///
    /// Returns zero if no calls have been made.
    #[must_use]
    pub fn avg_wait_time(&self) -> Duration {
        if self.call_count > 0 {
            self.accumulated_wait_time / self.call_count
        } else {
            Duration::ZERO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avg_wait_time_empty() {
        assert_eq!(SessionStatistics::default().avg_wait_time(), Duration::ZERO);
    }

    #[test]
    fn test_avg_wait_time() {
        let mut stats = SessionStatistics::default();
        stats.record_call(Duration::from_millis(10));
        stats.record_call(Duration::from_millis(30));
        assert_eq!(stats.call_count, 2);
        assert_eq!(stats.avg_wait_time(), Duration::from_millis(20));
    }

    #[test]
    fn test_transfer_counters() {
        let mut counters = TransferCounters::default();
        counters.record_sent(100, 2);
        counters.record_received(40);
        counters.record_received(8);
        assert_eq!(counters.bytes_sent, 100);
        assert_eq!(counters.packets_sent, 2);
        assert_eq!(counters.bytes_received, 48);
        assert_eq!(counters.packets_received, 2);
    }
}
