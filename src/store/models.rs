//! Row types for the persistent store, matching spec.md §3's data model.

use serde::{Deserialize, Serialize};

/// Formats a node number as its lowercase hex `!xxxxxxxx` id form.
pub fn node_id_from_num(node_num: u32) -> String {
    format!("!{node_num:08x}")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
    pub alt: Option<f64>,
    pub precision_bits: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeviceMetrics {
    pub battery_level: Option<u32>,
    pub voltage: Option<f64>,
    pub channel_utilization: Option<f64>,
    pub air_util_tx: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_num: u32,
    pub node_id: String,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hw_model: Option<String>,
    pub role: Option<String>,
    pub position: Option<Position>,
    pub device_metrics: DeviceMetrics,
    pub last_heard: Option<i64>,
    pub snr: Option<f32>,
    pub rssi: Option<i32>,
    /// `None` means "unknown" per spec.md §3; `Some(0)` for the local node.
    pub hops_away: Option<u32>,
    pub via_mqtt: bool,
    pub is_favorite: bool,
    pub is_mobile: bool,
    pub welcomed_at: Option<i64>,
    pub firmware_version: Option<String>,
}

impl Node {
    pub fn new(node_num: u32) -> Self {
        Node {
            node_num,
            node_id: node_id_from_num(node_num),
            long_name: None,
            short_name: None,
            hw_model: None,
            role: None,
            position: None,
            device_metrics: DeviceMetrics::default(),
            last_heard: None,
            snr: None,
            rssi: None,
            hops_away: None,
            via_mqtt: false,
            is_favorite: false,
            is_mobile: false,
            welcomed_at: None,
            firmware_version: None,
        }
    }
}

/// `battery_level` is valid only in `[0,100]` or the mains-powered sentinel
/// `101`; anything else must be dropped on ingest per spec.md §3.
pub fn is_valid_battery_level(level: u32) -> bool {
    level <= 100 || level == 101
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from_node_num: u32,
    pub to_node_num: u32,
    pub channel: i32,
    pub portnum: i32,
    pub text: Option<String>,
    pub timestamp: i64,
    pub hop_start: Option<u32>,
    pub hop_limit: Option<u32>,
    pub reply_id: Option<u32>,
    pub emoji: u8,
    pub acknowledged: bool,
    pub ack_failed: bool,
    pub bridge: bool,
}

impl Message {
    pub fn composite_id(from_node_num: u32, packet_id: u32) -> String {
        format!("{from_node_num}_{packet_id}")
    }

    pub fn is_tapback(&self) -> bool {
        self.emoji == 1 && self.reply_id.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i32,
    pub name: String,
    pub psk: String,
    pub role: i32,
    pub uplink_enabled: bool,
    pub downlink_enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Channel {
    pub fn is_visible(&self) -> bool {
        self.role != 0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TelemetryKind {
    Device,
    Environment,
    Power,
    LocalStats,
}

impl TelemetryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryKind::Device => "device",
            TelemetryKind::Environment => "environment",
            TelemetryKind::Power => "power",
            TelemetryKind::LocalStats => "local-stats",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "device" => Some(TelemetryKind::Device),
            "environment" => Some(TelemetryKind::Environment),
            "power" => Some(TelemetryKind::Power),
            "local-stats" => Some(TelemetryKind::LocalStats),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub node_num: u32,
    pub timestamp: i64,
    pub kind: TelemetryKind,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionHistoryPoint {
    pub node_id: String,
    pub lat: f64,
    pub lon: f64,
    pub alt: Option<f64>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Traceroute {
    pub from_node_num: u32,
    pub to_node_num: u32,
    pub route: Vec<u32>,
    pub route_back: Option<Vec<u32>>,
    pub snr_towards: Vec<f32>,
    pub snr_back: Vec<f32>,
    pub hop_count: u32,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborEdge {
    pub node_num: u32,
    pub neighbor_node_num: u32,
    pub snr: Option<f32>,
    pub last_rx_time: Option<i64>,
    pub timestamp: i64,
}

/// Hop-color bucket, presentation-only per spec.md §4.5; the enum's variant
/// names are part of the stable API contract even though they don't touch
/// storage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HopColor {
    Local,
    Green,
    Amber,
    Red,
    Grey,
}

pub fn hop_color(hops_away: Option<u32>) -> HopColor {
    match hops_away {
        None => HopColor::Grey,
        Some(0) => HopColor::Local,
        Some(1..=2) => HopColor::Green,
        Some(3..=4) => HopColor::Amber,
        _ => HopColor::Red,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn battery_level_validity() {
        assert!(is_valid_battery_level(0));
        assert!(is_valid_battery_level(100));
        assert!(is_valid_battery_level(101));
        assert!(!is_valid_battery_level(102));
        assert!(!is_valid_battery_level(255));
    }

    #[test]
    fn node_id_hex_form() {
        assert_eq!(node_id_from_num(0x12345678), "!12345678");
        assert_eq!(node_id_from_num(0xa2e175b8), "!a2e175b8");
    }

    #[test]
    fn message_composite_id_matches_scenario_s1() {
        assert_eq!(
            Message::composite_id(0x12345678, 0xAAAA),
            "305419896_43690"
        );
    }

    #[test]
    fn hop_color_buckets() {
        assert_eq!(hop_color(Some(0)), HopColor::Local);
        assert_eq!(hop_color(Some(1)), HopColor::Green);
        assert_eq!(hop_color(Some(2)), HopColor::Green);
        assert_eq!(hop_color(Some(3)), HopColor::Amber);
        assert_eq!(hop_color(Some(4)), HopColor::Amber);
        assert_eq!(hop_color(Some(5)), HopColor::Red);
        assert_eq!(hop_color(None), HopColor::Grey);
    }

    #[test]
    fn channel_visibility() {
        let mut ch = Channel {
            id: 0,
            name: "disabled".into(),
            psk: "AQ==".into(),
            role: 0,
            uplink_enabled: false,
            downlink_enabled: false,
            created_at: 0,
            updated_at: 0,
        };
        assert!(!ch.is_visible());
        ch.role = 1;
        assert!(ch.is_visible());
    }
}
