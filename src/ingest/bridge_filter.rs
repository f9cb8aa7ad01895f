//! MQTT-bridge heuristic filtering (spec.md §4.3). Messages that look like
//! they leaked through an MQTT bridge rather than originating from a real
//! mesh node are flagged `bridge=true` but still persisted — the UI hides
//! them by default, observability still sees them.

use regex::Regex;
use std::sync::OnceLock;

fn version_triple_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+\.\d+\.\d+\.[a-f0-9]+$").expect("valid regex"))
}

fn path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^/.*\.(js|css|proto|html)$").expect("valid regex"))
}

/// High-bit garbage: a run of bytes outside printable ASCII, the kind of
/// thing that shows up when an MQTT bridge forwards a binary frame as if it
/// were text.
fn looks_like_high_bit_garbage(text: &str) -> bool {
    let non_ascii = text.bytes().filter(|b| *b >= 0x80).count();
    !text.is_empty() && non_ascii * 2 > text.len()
}

/// `sender_known` should be `false` when the Ingest Pipeline has no Node row
/// for `fromNodeNum` yet (an unknown sender is itself a bridge signal).
pub fn is_bridge_traffic(sender_known: bool, text: &str) -> bool {
    if !sender_known {
        return true;
    }
    if text.contains("mqtt.") || text.contains("areyoumeshingwith.us") {
        return true;
    }
    if version_triple_re().is_match(text) {
        return true;
    }
    if path_re().is_match(text) {
        return true;
    }
    looks_like_high_bit_garbage(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_sender_is_bridge_traffic() {
        assert!(is_bridge_traffic(false, "hello"));
    }

    #[test]
    fn mqtt_domain_markers_are_bridge_traffic() {
        assert!(is_bridge_traffic(true, "forwarded via mqtt.example.com"));
        assert!(is_bridge_traffic(true, "see areyoumeshingwith.us for docs"));
    }

    #[test]
    fn version_triple_is_bridge_traffic() {
        assert!(is_bridge_traffic(true, "2.3.15.abc1234"));
    }

    #[test]
    fn static_asset_path_is_bridge_traffic() {
        assert!(is_bridge_traffic(true, "/assets/app.js"));
        assert!(is_bridge_traffic(true, "/index.html"));
    }

    #[test]
    fn ordinary_text_is_not_bridge_traffic() {
        assert!(!is_bridge_traffic(true, "hi"));
        assert!(!is_bridge_traffic(true, "anyone around?"));
    }
}
