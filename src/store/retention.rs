//! Hourly retention sweep (spec.md §4.4/§8 property 3): ages out append-only
//! tables at a per-kind horizon while leaving Nodes, Channels and Settings
//! untouched (those are only removed by explicit purge).

use super::Store;
use crate::config::StoreConfig;
use crate::error::StoreError;

/// One kind of append-only row this sweep ages out, paired with its
/// `(table, timestamp column)` and the retention horizon in seconds.
struct RetentionRule {
    table: &'static str,
    column: &'static str,
    horizon_secs: i64,
}

/// Runs one retention pass at time `now` (unix seconds), deleting any row of
/// a governed kind with `timestamp < now - horizon`. Returns the number of
/// rows removed per table for logging/metrics.
pub async fn sweep(store: &Store, cfg: &StoreConfig, now: i64) -> Result<Vec<(&'static str, usize)>, StoreError> {
    let rules = [
        RetentionRule {
            table: "messages",
            column: "timestamp",
            horizon_secs: cfg.retention_messages_days * 86_400,
        },
        RetentionRule {
            table: "telemetry",
            column: "timestamp",
            horizon_secs: cfg.retention_telemetry_days * 86_400,
        },
        RetentionRule {
            table: "position_history",
            column: "timestamp",
            horizon_secs: cfg.retention_position_days * 86_400,
        },
        RetentionRule {
            table: "neighbor_info",
            column: "timestamp",
            horizon_secs: cfg.retention_neighbor_hours * 3_600,
        },
        RetentionRule {
            table: "traceroutes",
            column: "timestamp",
            horizon_secs: cfg.retention_messages_days * 86_400,
        },
        RetentionRule {
            table: "opaque_packets",
            column: "timestamp",
            horizon_secs: cfg.retention_neighbor_hours * 3_600,
        },
    ];

    let mut removed = Vec::with_capacity(rules.len());
    for rule in rules {
        let cutoff = now - rule.horizon_secs;
        let n = store.delete_older_than(rule.table, rule.column, cutoff).await?;
        removed.push((rule.table, n));
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{Message, TelemetryKind, TelemetrySample};
    use tempfile::tempdir;

    #[tokio::test]
    async fn sweep_removes_only_rows_older_than_horizon() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db")).unwrap();
        let cfg = StoreConfig {
            db_path: String::new(),
            retention_messages_days: 1,
            retention_telemetry_days: 1,
            retention_position_days: 1,
            retention_neighbor_hours: 1,
        };

        let now = 1_000_000i64;
        let horizon = cfg.retention_messages_days * 86_400;

        let old = Message {
            id: Message::composite_id(1, 1),
            from_node_num: 1,
            to_node_num: 0xFFFFFFFF,
            channel: 0,
            portnum: 1,
            text: Some("old".into()),
            timestamp: now - horizon - 10,
            hop_start: None,
            hop_limit: None,
            reply_id: None,
            emoji: 0,
            acknowledged: false,
            ack_failed: false,
            bridge: false,
        };
        let fresh = Message {
            id: Message::composite_id(1, 2),
            timestamp: now - 10,
            text: Some("fresh".into()),
            ..old.clone()
        };
        store.insert_message_if_new(old).await.unwrap();
        store.insert_message_if_new(fresh).await.unwrap();

        store
            .append_telemetry(TelemetrySample {
                node_num: 1,
                timestamp: now - horizon - 10,
                kind: TelemetryKind::Device,
                payload: serde_json::json!({"batteryLevel": 80}),
            })
            .await
            .unwrap();

        let removed = sweep(&store, &cfg, now).await.unwrap();
        let messages_removed = removed.iter().find(|(t, _)| *t == "messages").unwrap().1;
        assert_eq!(messages_removed, 1);

        let remaining = store.recent_messages(10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].text.as_deref(), Some("fresh"));
    }
}
