//! Forward-only schema migrations. Each migration is one SQL batch applied
//! inside its own transaction; the current version is recorded as a row in
//! `settings` (`key = 'schema_version'`) so restarts only apply what's new.

use crate::error::StoreError;
use rusqlite::Connection;

/// Migrations run in order, index 0 is version 1. Never edit a migration
/// once released; append a new one instead.
const MIGRATIONS: &[&str] = &[
    // v1: base schema
    r#"
    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS nodes (
        node_num INTEGER PRIMARY KEY,
        node_id TEXT NOT NULL,
        long_name TEXT,
        short_name TEXT,
        hw_model TEXT,
        role TEXT,
        lat REAL,
        lon REAL,
        alt REAL,
        precision_bits INTEGER,
        battery_level INTEGER,
        voltage REAL,
        channel_utilization REAL,
        air_util_tx REAL,
        last_heard INTEGER,
        snr REAL,
        rssi INTEGER,
        hops_away INTEGER,
        via_mqtt INTEGER NOT NULL DEFAULT 0,
        is_favorite INTEGER NOT NULL DEFAULT 0,
        is_mobile INTEGER NOT NULL DEFAULT 0,
        welcomed_at INTEGER,
        firmware_version TEXT
    );

    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        from_node_num INTEGER NOT NULL,
        to_node_num INTEGER NOT NULL,
        channel INTEGER NOT NULL,
        portnum INTEGER NOT NULL,
        text TEXT,
        timestamp INTEGER NOT NULL,
        hop_start INTEGER,
        hop_limit INTEGER,
        reply_id INTEGER,
        emoji INTEGER NOT NULL DEFAULT 0,
        acknowledged INTEGER NOT NULL DEFAULT 0,
        ack_failed INTEGER NOT NULL DEFAULT 0,
        bridge INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
    CREATE INDEX IF NOT EXISTS idx_messages_channel ON messages(channel, timestamp);

    CREATE TABLE IF NOT EXISTS channels (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        psk TEXT NOT NULL,
        role INTEGER NOT NULL,
        uplink_enabled INTEGER NOT NULL DEFAULT 0,
        downlink_enabled INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS telemetry (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        node_num INTEGER NOT NULL,
        timestamp INTEGER NOT NULL,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_telemetry_node_time ON telemetry(node_num, timestamp);

    CREATE TABLE IF NOT EXISTS position_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        node_id TEXT NOT NULL,
        lat REAL NOT NULL,
        lon REAL NOT NULL,
        alt REAL,
        timestamp INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_position_node_time ON position_history(node_id, timestamp);

    CREATE TABLE IF NOT EXISTS traceroutes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_node_num INTEGER NOT NULL,
        to_node_num INTEGER NOT NULL,
        route TEXT NOT NULL,
        route_back TEXT,
        snr_towards TEXT,
        snr_back TEXT,
        hop_count INTEGER NOT NULL,
        timestamp INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_traceroutes_time ON traceroutes(timestamp);

    CREATE TABLE IF NOT EXISTS neighbor_info (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        node_num INTEGER NOT NULL,
        neighbor_node_num INTEGER NOT NULL,
        snr REAL,
        last_rx_time INTEGER,
        timestamp INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_neighbor_node_time ON neighbor_info(node_num, timestamp);

    CREATE TABLE IF NOT EXISTS read_state (
        subject TEXT NOT NULL,
        scope TEXT NOT NULL,
        last_read_timestamp INTEGER NOT NULL,
        PRIMARY KEY (subject, scope)
    );
    "#,
    // v2: opaque packet log for portnums the Ingest Pipeline doesn't
    // interpret (spec.md §4.3 "others" row) plus the node welcome marker
    // added after v1 shipped.
    r#"
    CREATE TABLE IF NOT EXISTS opaque_packets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_node_num INTEGER NOT NULL,
        portnum INTEGER NOT NULL,
        payload_len INTEGER NOT NULL,
        timestamp INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_opaque_time ON opaque_packets(timestamp);
    "#,
];

pub fn current_schema_version(conn: &Connection) -> Result<i64, StoreError> {
    let exists: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='settings'",
            [],
            |_| Ok(true),
        )
        .unwrap_or(false);
    if !exists {
        return Ok(0);
    }
    let version: Option<String> = conn
        .query_row(
            "SELECT value FROM settings WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .ok();
    Ok(version.and_then(|v| v.parse().ok()).unwrap_or(0))
}

/// Applies any migrations above the current version, each in its own
/// transaction, updating `schema_version` as the last statement of each.
pub fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
    let mut version = current_schema_version(conn)?;
    while (version as usize) < MIGRATIONS.len() {
        let idx = version as usize;
        let sql = MIGRATIONS[idx];
        let tx = conn.transaction().map_err(StoreError::Sqlite)?;
        tx.execute_batch(sql)
            .map_err(|e| StoreError::Migration(idx as i64 + 1, e.to_string()))?;
        tx.execute(
            "INSERT INTO settings(key, value) VALUES('schema_version', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [(idx as i64 + 1).to_string()],
        )
        .map_err(|e| StoreError::Migration(idx as i64 + 1, e.to_string()))?;
        tx.commit().map_err(StoreError::Sqlite)?;
        version += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        let v1 = current_schema_version(&conn).unwrap();
        migrate(&mut conn).unwrap();
        let v2 = current_schema_version(&conn).unwrap();
        assert_eq!(v1, v2);
        assert_eq!(v1, MIGRATIONS.len() as i64);
    }
}
