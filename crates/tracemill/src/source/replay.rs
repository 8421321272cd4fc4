//! In-memory packet replay.
//!
//! Feeds a prepared packet sequence through the real capture topology.
//! Used by the test suites; also handy for soak-testing plugin changes
//! against canned traffic.

use std::collections::VecDeque;
use std::time::Duration;

use crate::source::{PacketSource, SourceError, SourceStats};
use tracemill_plugin::Packet;

pub struct ReplaySource {
    packets: VecDeque<Packet>,
    linger: Option<Duration>,
    stats: SourceStats,
}

impl ReplaySource {
    pub fn new(packets: Vec<Packet>) -> Self {
        Self {
            packets: packets.into(),
            linger: None,
            stats: SourceStats::default(),
        }
    }

    /// Hold the source open for `linger` after the last packet instead
    /// of reporting end-of-stream immediately. Lets real-time ticks fire
    /// while the pipeline is still "live".
    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = Some(linger);
        self
    }

    pub fn with_stats(mut self, dropped: Option<u64>, missing: Option<u64>) -> Self {
        self.stats = SourceStats { dropped, missing };
        self
    }
}

impl PacketSource for ReplaySource {
    fn next_packet(&mut self) -> Result<Option<Packet>, SourceError> {
        if let Some(packet) = self.packets.pop_front() {
            return Ok(Some(packet));
        }
        if let Some(linger) = self.linger.take() {
            std::thread::sleep(linger);
        }
        Ok(None)
    }

    fn stats(&self) -> SourceStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(ts: u32) -> Packet {
        Packet {
            ts_sec: ts,
            ts_usec: 0,
            wire_len: 60,
            flow: None,
            data: Vec::new(),
        }
    }

    #[test]
    fn replays_in_order_then_ends() {
        let mut source = ReplaySource::new(vec![packet(1), packet(2)]);
        assert_eq!(source.next_packet().unwrap().unwrap().ts_sec, 1);
        assert_eq!(source.next_packet().unwrap().unwrap().ts_sec, 2);
        assert!(source.next_packet().unwrap().is_none());
    }

    #[test]
    fn reports_configured_stats() {
        let source = ReplaySource::new(Vec::new()).with_stats(Some(7), None);
        assert_eq!(source.stats().dropped, Some(7));
        assert_eq!(source.stats().missing, None);
    }
}
