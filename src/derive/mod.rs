//! Derivation: pure functions of Store state (spec.md §4.5). Nothing here
//! mutates; callers recompute on read and persist only the narrow slice
//! (`is_mobile`) that's cheap to cache as a column rather than a view.

use crate::store::models::{HopColor, PositionHistoryPoint};

pub use crate::store::models::hop_color;

const EARTH_RADIUS_KM: f64 = 6371.0;
const MOBILE_WINDOW_SECS: i64 = 168 * 3600;
const MOBILE_DISTANCE_KM: f64 = 1.0;

/// Great-circle distance between two lat/lon points, in kilometers.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lon1, lat2, lon2) = (
        lat1.to_radians(),
        lon1.to_radians(),
        lat2.to_radians(),
        lon2.to_radians(),
    );
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_KM * c
}

/// `isMobile(node) = max pairwise great-circle distance of positions in the
/// last 168h > 1km` (spec.md §4.5). Depends only on the set of positions,
/// not their insertion order (spec.md §8 property 4).
pub fn is_mobile(positions: &[PositionHistoryPoint], now: i64) -> bool {
    let window_start = now - MOBILE_WINDOW_SECS;
    let recent: Vec<&PositionHistoryPoint> = positions
        .iter()
        .filter(|p| p.timestamp >= window_start)
        .collect();

    for i in 0..recent.len() {
        for j in (i + 1)..recent.len() {
            let d = haversine_km(recent[i].lat, recent[i].lon, recent[j].lat, recent[j].lon);
            if d > MOBILE_DISTANCE_KM {
                return true;
            }
        }
    }
    false
}

/// Whether displacement from `prev` to `next` (or elapsed time) warrants a
/// new position-history row, per spec.md §4.3's POSITION_APP handler:
/// append if displacement > 10m or Δt > 60s.
pub fn should_append_position(
    prev: Option<(f64, f64, i64)>,
    next_lat: f64,
    next_lon: f64,
    next_ts: i64,
) -> bool {
    match prev {
        None => true,
        Some((plat, plon, pts)) => {
            let displacement_km = haversine_km(plat, plon, next_lat, next_lon);
            displacement_km * 1000.0 > 10.0 || (next_ts - pts) > 60
        }
    }
}

/// Nodes whose most recent position carries `precisionBits < 32` get an
/// "estimated" flag so the UI can draw an uncertainty circle; the radius
/// itself is presentation-only and not part of this data model.
pub fn is_estimated_position(precision_bits: Option<u32>) -> bool {
    matches!(precision_bits, Some(bits) if bits < 32)
}

/// Re-exported for callers that want the stable presentation enum alongside
/// the other derived fields without importing `store::models` directly.
pub fn hop_bucket(hops_away: Option<u32>) -> HopColor {
    hop_color(hops_away)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(lat: f64, lon: f64, ts: i64) -> PositionHistoryPoint {
        PositionHistoryPoint {
            node_id: "!1".into(),
            lat,
            lon,
            alt: None,
            timestamp: ts,
        }
    }

    #[test]
    fn mobility_matches_scenario_s6() {
        let positions = vec![
            pt(40.0000, -74.0000, 0),
            pt(40.0005, -74.0005, 3600),
            pt(40.0200, -74.0200, 7200),
        ];
        assert!(is_mobile(&positions, 7200));

        let stationary = &positions[0..2];
        assert!(!is_mobile(stationary, 7200));
    }

    #[test]
    fn mobility_is_order_independent() {
        let forward = vec![pt(40.0, -74.0, 0), pt(40.02, -74.02, 100)];
        let mut backward = forward.clone();
        backward.reverse();
        assert_eq!(is_mobile(&forward, 1000), is_mobile(&backward, 1000));
    }

    #[test]
    fn mobility_ignores_positions_outside_window() {
        let positions = vec![pt(40.0, -74.0, 0), pt(41.0, -75.0, 10)];
        // both points fall outside a window starting long after them
        assert!(!is_mobile(&positions, 0 + 168 * 3600 + 100_000));
    }

    #[test]
    fn position_history_append_thresholds() {
        assert!(should_append_position(None, 40.0, -74.0, 0));
        assert!(!should_append_position(Some((40.0, -74.0, 0)), 40.00001, -74.00001, 5));
        assert!(should_append_position(Some((40.0, -74.0, 0)), 40.0, -74.0, 61));
        assert!(should_append_position(Some((40.0, -74.0, 0)), 40.01, -74.01, 5));
    }

    #[test]
    fn estimated_position_flag() {
        assert!(is_estimated_position(Some(16)));
        assert!(!is_estimated_position(Some(32)));
        assert!(!is_estimated_position(None));
    }
}
