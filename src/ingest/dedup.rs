//! Deduplication for inbound messages and traceroutes.

use std::collections::HashMap;

/// Tracks `(fromNodeNum, packetId)` pairs already ingested as a Message.
/// Re-ingesting an identical packet is then a no-op (spec.md §8 property 1).
#[derive(Debug, Default)]
pub struct MessageDedup {
    seen: std::collections::HashSet<(u32, u32)>,
}

impl MessageDedup {
    pub fn new() -> Self {
        MessageDedup::default()
    }

    /// Returns `true` if this is the first time the pair has been seen, in
    /// which case it's recorded; `false` means the caller should drop it.
    pub fn observe(&mut self, from_node_num: u32, packet_id: u32) -> bool {
        self.seen.insert((from_node_num, packet_id))
    }
}

/// Traceroutes dedup by `(fromNodeNum, toNodeNum, timestamp)` within a
/// 1-second window rather than exact equality, since the radio may emit the
/// same logical traceroute reply more than once with a jittered clock.
#[derive(Debug, Default)]
pub struct TracerouteDedup {
    last_seen: HashMap<(u32, u32), i64>,
}

impl TracerouteDedup {
    pub fn new() -> Self {
        TracerouteDedup::default()
    }

    pub fn observe(&mut self, from_node_num: u32, to_node_num: u32, timestamp: i64) -> bool {
        let key = (from_node_num, to_node_num);
        match self.last_seen.get(&key) {
            Some(prev) if (timestamp - prev).abs() <= 1 => false,
            _ => {
                self.last_seen.insert(key, timestamp);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_dedup_drops_repeat_packet_ids() {
        let mut d = MessageDedup::new();
        assert!(d.observe(0x12345678, 0xAAAA));
        assert!(!d.observe(0x12345678, 0xAAAA));
        assert!(d.observe(0x12345678, 0xAAAB));
    }

    #[test]
    fn traceroute_dedup_window_is_one_second() {
        let mut d = TracerouteDedup::new();
        assert!(d.observe(1, 2, 1000));
        assert!(!d.observe(1, 2, 1001));
        assert!(d.observe(1, 2, 1003));
    }
}
