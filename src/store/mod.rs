//! Single-writer SQLite store. All mutation goes through one dedicated
//! writer thread so WAL contention never happens and transactions compose;
//! readers open short-lived read-only connections of their own.
//!
//! Mutations are submitted as jobs (a closure plus a reply channel) and
//! batched by the writer loop: up to 64 jobs or 200ms of accumulation,
//! whichever comes first, then committed as a single transaction. This
//! bounds write amplification the way spec.md §4.4 requires without forcing
//! every caller to hand-roll its own SQL string.

pub mod models;
pub mod retention;
pub mod schema;

use crate::error::StoreError;
use rusqlite::{Connection, OptionalExtension, Transaction};
use std::any::Any;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use models::*;

type BoxAny = Box<dyn Any + Send>;
type JobFn = Box<dyn FnOnce(&Transaction) -> Result<BoxAny, StoreError> + Send>;

struct WriteJob {
    run: JobFn,
    reply: oneshot::Sender<Result<BoxAny, StoreError>>,
}

const BATCH_MAX: usize = 64;
const BATCH_WINDOW: Duration = Duration::from_millis(200);

/// Owns the writer thread's channel; cheap to clone and hand to every
/// subsystem that mutates state (Ingest, Scheduler, Automation, API).
#[derive(Clone)]
pub struct Store {
    write_tx: mpsc::Sender<WriteJob>,
    db_path: PathBuf,
}

impl Store {
    /// Opens (creating if needed) the database at `db_path`, runs pending
    /// migrations, and spawns the writer thread.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let mut conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::migrate(&mut conn)?;

        let (write_tx, write_rx) = mpsc::channel(256);
        let writer_db_path = db_path.clone();
        std::thread::Builder::new()
            .name("meshmonitor-store-writer".into())
            .spawn(move || writer_loop(conn, writer_db_path, write_rx))
            .map_err(|e| StoreError::WriteFailed(e.to_string()))?;

        Ok(Store { write_tx, db_path })
    }

    fn read_conn(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        Ok(conn)
    }

    async fn write<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = WriteJob {
            run: Box::new(move |tx| f(tx).map(|v| Box::new(v) as BoxAny)),
            reply: reply_tx,
        };
        self.write_tx
            .send(job)
            .await
            .map_err(|_| StoreError::WriterGone)?;
        let result = reply_rx.await.map_err(|_| StoreError::WriterGone)??;
        Ok(*result.downcast::<T>().expect("job reply type matches caller"))
    }

    async fn read<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.read_conn()?;
        tokio::task::spawn_blocking(move || f(&conn))
            .await
            .map_err(|e| StoreError::Migration(0, e.to_string()))?
    }

    // ---- Nodes ----------------------------------------------------------

    pub async fn upsert_node(&self, node: Node) -> Result<(), StoreError> {
        self.write(move |tx| {
            tx.execute(
                "INSERT INTO nodes (node_num, node_id, long_name, short_name, hw_model, role,
                    lat, lon, alt, precision_bits, battery_level, voltage, channel_utilization,
                    air_util_tx, last_heard, snr, rssi, hops_away, via_mqtt, is_favorite,
                    is_mobile, welcomed_at, firmware_version)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23)
                 ON CONFLICT(node_num) DO UPDATE SET
                    node_id=excluded.node_id,
                    long_name=COALESCE(excluded.long_name, nodes.long_name),
                    short_name=COALESCE(excluded.short_name, nodes.short_name),
                    hw_model=COALESCE(excluded.hw_model, nodes.hw_model),
                    role=COALESCE(excluded.role, nodes.role),
                    lat=COALESCE(excluded.lat, nodes.lat),
                    lon=COALESCE(excluded.lon, nodes.lon),
                    alt=COALESCE(excluded.alt, nodes.alt),
                    precision_bits=COALESCE(excluded.precision_bits, nodes.precision_bits),
                    battery_level=COALESCE(excluded.battery_level, nodes.battery_level),
                    voltage=COALESCE(excluded.voltage, nodes.voltage),
                    channel_utilization=COALESCE(excluded.channel_utilization, nodes.channel_utilization),
                    air_util_tx=COALESCE(excluded.air_util_tx, nodes.air_util_tx),
                    last_heard=COALESCE(excluded.last_heard, nodes.last_heard),
                    snr=COALESCE(excluded.snr, nodes.snr),
                    rssi=COALESCE(excluded.rssi, nodes.rssi),
                    hops_away=COALESCE(excluded.hops_away, nodes.hops_away),
                    via_mqtt=excluded.via_mqtt,
                    is_mobile=excluded.is_mobile",
                rusqlite::params![
                    node.node_num,
                    node.node_id,
                    node.long_name,
                    node.short_name,
                    node.hw_model,
                    node.role,
                    node.position.as_ref().map(|p| p.lat),
                    node.position.as_ref().map(|p| p.lon),
                    node.position.as_ref().and_then(|p| p.alt),
                    node.position.as_ref().and_then(|p| p.precision_bits),
                    node.device_metrics.battery_level,
                    node.device_metrics.voltage,
                    node.device_metrics.channel_utilization,
                    node.device_metrics.air_util_tx,
                    node.last_heard,
                    node.snr,
                    node.rssi,
                    node.hops_away,
                    node.via_mqtt as i32,
                    node.is_favorite as i32,
                    node.is_mobile as i32,
                    node.welcomed_at,
                    node.firmware_version,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_favorite(&self, node_num: u32, is_favorite: bool) -> Result<(), StoreError> {
        self.write(move |tx| {
            tx.execute(
                "UPDATE nodes SET is_favorite = ?1 WHERE node_num = ?2",
                rusqlite::params![is_favorite as i32, node_num],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn mark_welcomed(&self, node_num: u32, now: i64) -> Result<(), StoreError> {
        self.write(move |tx| {
            tx.execute(
                "UPDATE nodes SET welcomed_at = ?1 WHERE node_num = ?2 AND welcomed_at IS NULL",
                rusqlite::params![now, node_num],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_mobile(&self, node_num: u32, is_mobile: bool) -> Result<(), StoreError> {
        self.write(move |tx| {
            tx.execute(
                "UPDATE nodes SET is_mobile = ?1 WHERE node_num = ?2",
                rusqlite::params![is_mobile as i32, node_num],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_node(&self, node_num: u32) -> Result<Option<Node>, StoreError> {
        self.read(move |conn| {
            conn.query_row(
                "SELECT node_num, node_id, long_name, short_name, hw_model, role, lat, lon, alt,
                    precision_bits, battery_level, voltage, channel_utilization, air_util_tx,
                    last_heard, snr, rssi, hops_away, via_mqtt, is_favorite, is_mobile,
                    welcomed_at, firmware_version
                 FROM nodes WHERE node_num = ?1",
                [node_num],
                row_to_node,
            )
            .optional()
            .map_err(StoreError::Sqlite)
        })
        .await
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT node_num, node_id, long_name, short_name, hw_model, role, lat, lon, alt,
                    precision_bits, battery_level, voltage, channel_utilization, air_util_tx,
                    last_heard, snr, rssi, hops_away, via_mqtt, is_favorite, is_mobile,
                    welcomed_at, firmware_version
                 FROM nodes ORDER BY last_heard DESC",
            )?;
            let rows = stmt.query_map([], row_to_node)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
        .await
    }

    // ---- Messages ---------------------------------------------------------

    /// Inserts `message` if its composite id hasn't been seen before.
    /// Returns `true` if this was a new row (spec.md §8 property 1:
    /// re-ingesting an identical message is a no-op after the first).
    pub async fn insert_message_if_new(&self, message: Message) -> Result<bool, StoreError> {
        self.write(move |tx| {
            let changed = tx.execute(
                "INSERT OR IGNORE INTO messages (id, from_node_num, to_node_num, channel,
                    portnum, text, timestamp, hop_start, hop_limit, reply_id, emoji,
                    acknowledged, ack_failed, bridge)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
                rusqlite::params![
                    message.id,
                    message.from_node_num,
                    message.to_node_num,
                    message.channel,
                    message.portnum,
                    message.text,
                    message.timestamp,
                    message.hop_start,
                    message.hop_limit,
                    message.reply_id,
                    message.emoji as i32,
                    message.acknowledged as i32,
                    message.ack_failed as i32,
                    message.bridge as i32,
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn mark_ack(&self, from_node_num: u32, packet_id: u32, outcome_ack: bool) -> Result<(), StoreError> {
        let id = Message::composite_id(from_node_num, packet_id);
        self.write(move |tx| {
            if outcome_ack {
                tx.execute(
                    "UPDATE messages SET acknowledged = 1 WHERE id = ?1",
                    [id],
                )?;
            } else {
                tx.execute(
                    "UPDATE messages SET ack_failed = 1 WHERE id = ?1",
                    [id],
                )?;
            }
            Ok(())
        })
        .await
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<Message>, StoreError> {
        let id = id.to_string();
        self.read(move |conn| {
            conn.query_row(
                "SELECT id, from_node_num, to_node_num, channel, portnum, text, timestamp,
                    hop_start, hop_limit, reply_id, emoji, acknowledged, ack_failed, bridge
                 FROM messages WHERE id = ?1",
                [id],
                row_to_message,
            )
            .optional()
            .map_err(StoreError::Sqlite)
        })
        .await
    }

    /// The user-visible feed (spec.md §4.3): tapbacks are stored as
    /// ordinary Message rows but rendered under the message they react to
    /// rather than as their own feed entry, so they're excluded here.
    pub async fn recent_messages(&self, limit: i64) -> Result<Vec<Message>, StoreError> {
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, from_node_num, to_node_num, channel, portnum, text, timestamp,
                    hop_start, hop_limit, reply_id, emoji, acknowledged, ack_failed, bridge
                 FROM messages
                 WHERE NOT (reply_id IS NOT NULL AND emoji = 1)
                 ORDER BY timestamp DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit], row_to_message)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn reactions_for(&self, message_id: &str) -> Result<Vec<String>, StoreError> {
        let message_id = message_id.to_string();
        self.read(move |conn| {
            let reply_id: Option<i64> = conn
                .query_row(
                    "SELECT CAST(substr(id, instr(id,'_')+1) AS INTEGER) FROM messages WHERE id = ?1",
                    [&message_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(reply_id) = reply_id else {
                return Ok(Vec::new());
            };
            let mut stmt = conn.prepare(
                "SELECT text FROM messages WHERE reply_id = ?1 AND emoji = 1 ORDER BY timestamp ASC",
            )?;
            let rows = stmt.query_map([reply_id], |row| row.get::<_, Option<String>>(0))?;
            let mut out = Vec::new();
            for r in rows {
                if let Some(text) = r? {
                    out.push(text);
                }
            }
            Ok(out)
        })
        .await
    }

    // ---- Channels -----------------------------------------------------

    pub async fn upsert_channel(&self, channel: Channel) -> Result<(), StoreError> {
        self.write(move |tx| {
            tx.execute(
                "INSERT INTO channels (id, name, psk, role, uplink_enabled, downlink_enabled, created_at, updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
                 ON CONFLICT(id) DO UPDATE SET
                    name=excluded.name, psk=excluded.psk, role=excluded.role,
                    uplink_enabled=excluded.uplink_enabled, downlink_enabled=excluded.downlink_enabled,
                    updated_at=excluded.updated_at",
                rusqlite::params![
                    channel.id,
                    channel.name,
                    channel.psk,
                    channel.role,
                    channel.uplink_enabled as i32,
                    channel.downlink_enabled as i32,
                    channel.created_at,
                    channel.updated_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Never returns a channel with `role=0` (spec.md §8 property 5).
    pub async fn visible_channels(&self) -> Result<Vec<Channel>, StoreError> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, psk, role, uplink_enabled, downlink_enabled, created_at, updated_at
                 FROM channels WHERE role != 0 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([], row_to_channel)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
        .await
    }

    // ---- Telemetry / position / traceroute / neighbor ------------------

    pub async fn append_telemetry(&self, sample: TelemetrySample) -> Result<(), StoreError> {
        self.write(move |tx| {
            tx.execute(
                "INSERT INTO telemetry (node_num, timestamp, kind, payload) VALUES (?1,?2,?3,?4)",
                rusqlite::params![
                    sample.node_num,
                    sample.timestamp,
                    sample.kind.as_str(),
                    sample.payload.to_string(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn append_position(&self, point: PositionHistoryPoint) -> Result<(), StoreError> {
        self.write(move |tx| {
            tx.execute(
                "INSERT INTO position_history (node_id, lat, lon, alt, timestamp) VALUES (?1,?2,?3,?4,?5)",
                rusqlite::params![point.node_id, point.lat, point.lon, point.alt, point.timestamp],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn positions_since(&self, node_id: &str, since_ts: i64) -> Result<Vec<PositionHistoryPoint>, StoreError> {
        let node_id = node_id.to_string();
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT node_id, lat, lon, alt, timestamp FROM position_history
                 WHERE node_id = ?1 AND timestamp >= ?2 ORDER BY timestamp ASC",
            )?;
            let rows = stmt.query_map(rusqlite::params![node_id, since_ts], |row| {
                Ok(PositionHistoryPoint {
                    node_id: row.get(0)?,
                    lat: row.get(1)?,
                    lon: row.get(2)?,
                    alt: row.get(3)?,
                    timestamp: row.get(4)?,
                })
            })?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn upsert_traceroute(&self, tr: Traceroute) -> Result<(), StoreError> {
        self.write(move |tx| {
            tx.execute(
                "INSERT INTO traceroutes (from_node_num, to_node_num, route, route_back,
                    snr_towards, snr_back, hop_count, timestamp) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                rusqlite::params![
                    tr.from_node_num,
                    tr.to_node_num,
                    serde_json::to_string(&tr.route).unwrap_or_default(),
                    tr.route_back.as_ref().map(|r| serde_json::to_string(r).unwrap_or_default()),
                    serde_json::to_string(&tr.snr_towards).unwrap_or_default(),
                    serde_json::to_string(&tr.snr_back).unwrap_or_default(),
                    tr.hop_count,
                    tr.timestamp,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn recent_traceroutes(&self, limit: i64) -> Result<Vec<Traceroute>, StoreError> {
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT from_node_num, to_node_num, route, route_back, snr_towards, snr_back,
                    hop_count, timestamp FROM traceroutes ORDER BY timestamp DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit], row_to_traceroute)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
        .await
    }

    /// Latest traceroute timestamp per destination node, for the scheduler's
    /// "pick the node with the oldest traceroute" rotation rule (spec.md
    /// §4.6). A destination absent from the map has never been traced.
    pub async fn last_traceroute_at(&self) -> Result<std::collections::HashMap<u32, i64>, StoreError> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT to_node_num, MAX(timestamp) FROM traceroutes GROUP BY to_node_num",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, u32>(0)?, row.get::<_, i64>(1)?)))?;
            let mut out = std::collections::HashMap::new();
            for r in rows {
                let (node_num, ts) = r?;
                out.insert(node_num, ts);
            }
            Ok(out)
        })
        .await
    }

    pub async fn replace_neighbors(&self, node_num: u32, edges: Vec<NeighborEdge>) -> Result<(), StoreError> {
        self.write(move |tx| {
            tx.execute("DELETE FROM neighbor_info WHERE node_num = ?1", [node_num])?;
            for e in edges {
                tx.execute(
                    "INSERT INTO neighbor_info (node_num, neighbor_node_num, snr, last_rx_time, timestamp)
                     VALUES (?1,?2,?3,?4,?5)",
                    rusqlite::params![e.node_num, e.neighbor_node_num, e.snr, e.last_rx_time, e.timestamp],
                )?;
            }
            Ok(())
        })
        .await
    }

    pub async fn all_neighbors(&self) -> Result<Vec<NeighborEdge>, StoreError> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT node_num, neighbor_node_num, snr, last_rx_time, timestamp FROM neighbor_info",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(NeighborEdge {
                    node_num: row.get(0)?,
                    neighbor_node_num: row.get(1)?,
                    snr: row.get(2)?,
                    last_rx_time: row.get(3)?,
                    timestamp: row.get(4)?,
                })
            })?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
        .await
    }

    // ---- Read state / unread -------------------------------------------

    /// Marks `scope` (a channel id or peer node id, stringified) read as of
    /// `now`. Idempotent: calling twice in a row with the same `now` leaves
    /// the same unread count (spec.md §8 property 6).
    pub async fn mark_read(&self, subject: String, scope: String, now: i64) -> Result<(), StoreError> {
        self.write(move |tx| {
            tx.execute(
                "INSERT INTO read_state (subject, scope, last_read_timestamp) VALUES (?1,?2,?3)
                 ON CONFLICT(subject, scope) DO UPDATE SET last_read_timestamp = excluded.last_read_timestamp",
                rusqlite::params![subject, scope, now],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn unread_count(&self, subject: &str, scope: &str, channel: i32) -> Result<i64, StoreError> {
        let subject = subject.to_string();
        let scope = scope.to_string();
        self.read(move |conn| {
            let last_read: i64 = conn
                .query_row(
                    "SELECT last_read_timestamp FROM read_state WHERE subject = ?1 AND scope = ?2",
                    rusqlite::params![subject, scope],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0);
            conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE channel = ?1 AND timestamp > ?2",
                rusqlite::params![channel, last_read],
                |row| row.get(0),
            )
            .map_err(StoreError::Sqlite)
        })
        .await
    }

    // ---- Opaque packets -------------------------------------------------

    /// Persists a portnum the Ingest Pipeline doesn't interpret, for
    /// observability only (spec.md §4.3 "others" row).
    pub async fn record_opaque(&self, from_node_num: u32, portnum: i32, payload_len: usize, timestamp: i64) -> Result<(), StoreError> {
        self.write(move |tx| {
            tx.execute(
                "INSERT INTO opaque_packets (from_node_num, portnum, payload_len, timestamp) VALUES (?1,?2,?3,?4)",
                rusqlite::params![from_node_num, portnum, payload_len as i64, timestamp],
            )?;
            Ok(())
        })
        .await
    }

    // ---- Settings -------------------------------------------------------

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.read(move |conn| {
            conn.query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| row.get(0))
                .optional()
                .map_err(StoreError::Sqlite)
        })
        .await
    }

    pub async fn set_setting(&self, key: String, value: String) -> Result<(), StoreError> {
        self.write(move |tx| {
            tx.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                rusqlite::params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    // ---- Purge ------------------------------------------------------------

    pub async fn purge_nodes(&self) -> Result<(), StoreError> {
        self.write(|tx| {
            tx.execute("DELETE FROM nodes", [])?;
            Ok(())
        })
        .await
    }

    pub async fn purge_messages(&self) -> Result<(), StoreError> {
        self.write(|tx| {
            tx.execute("DELETE FROM messages", [])?;
            Ok(())
        })
        .await
    }

    pub async fn purge_telemetry(&self) -> Result<(), StoreError> {
        self.write(|tx| {
            tx.execute("DELETE FROM telemetry", [])?;
            Ok(())
        })
        .await
    }

    /// Exposed for the retention sweep, which issues plain DELETEs with
    /// caller-computed cutoffs so the policy stays out of this module.
    pub async fn delete_older_than(&self, table: &'static str, column: &'static str, cutoff: i64) -> Result<usize, StoreError> {
        self.write(move |tx| {
            let sql = format!("DELETE FROM {table} WHERE {column} < ?1");
            Ok(tx.execute(&sql, [cutoff])?)
        })
        .await
    }
}

fn writer_loop(mut conn: Connection, _db_path: PathBuf, mut rx: mpsc::Receiver<WriteJob>) {
    loop {
        let Some(first) = rx.blocking_recv() else {
            return;
        };
        let mut batch = vec![first];
        let deadline = std::time::Instant::now() + BATCH_WINDOW;
        while batch.len() < BATCH_MAX {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.try_recv() {
                Ok(job) => batch.push(job),
                Err(mpsc::error::TryRecvError::Empty) => {
                    std::thread::sleep(Duration::from_millis(5).min(remaining));
                    if std::time::Instant::now() >= deadline {
                        break;
                    }
                }
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            }
        }

        let tx = match conn.transaction() {
            Ok(tx) => tx,
            Err(e) => {
                let msg = e.to_string();
                for job in batch {
                    let _ = job.reply.send(Err(StoreError::WriteFailed(msg.clone())));
                }
                continue;
            }
        };

        let mut results = Vec::with_capacity(batch.len());
        for job in batch {
            let res = (job.run)(&tx);
            results.push((job.reply, res));
        }
        match tx.commit() {
            Ok(()) => {
                for (reply, res) in results {
                    let _ = reply.send(res);
                }
            }
            Err(e) => {
                let msg = e.to_string();
                for (reply, _) in results {
                    let _ = reply.send(Err(StoreError::WriteFailed(msg.clone())));
                }
            }
        }
    }
}

fn row_to_node(row: &rusqlite::Row) -> rusqlite::Result<Node> {
    let has_position = row.get::<_, Option<f64>>(6)?.is_some();
    Ok(Node {
        node_num: row.get(0)?,
        node_id: row.get(1)?,
        long_name: row.get(2)?,
        short_name: row.get(3)?,
        hw_model: row.get(4)?,
        role: row.get(5)?,
        position: if has_position {
            Some(Position {
                lat: row.get(6)?,
                lon: row.get(7)?,
                alt: row.get(8)?,
                precision_bits: row.get(9)?,
            })
        } else {
            None
        },
        device_metrics: DeviceMetrics {
            battery_level: row.get(10)?,
            voltage: row.get(11)?,
            channel_utilization: row.get(12)?,
            air_util_tx: row.get(13)?,
        },
        last_heard: row.get(14)?,
        snr: row.get(15)?,
        rssi: row.get(16)?,
        hops_away: row.get(17)?,
        via_mqtt: row.get::<_, i32>(18)? != 0,
        is_favorite: row.get::<_, i32>(19)? != 0,
        is_mobile: row.get::<_, i32>(20)? != 0,
        welcomed_at: row.get(21)?,
        firmware_version: row.get(22)?,
    })
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        from_node_num: row.get(1)?,
        to_node_num: row.get(2)?,
        channel: row.get(3)?,
        portnum: row.get(4)?,
        text: row.get(5)?,
        timestamp: row.get(6)?,
        hop_start: row.get(7)?,
        hop_limit: row.get(8)?,
        reply_id: row.get(9)?,
        emoji: row.get::<_, i32>(10)? as u8,
        acknowledged: row.get::<_, i32>(11)? != 0,
        ack_failed: row.get::<_, i32>(12)? != 0,
        bridge: row.get::<_, i32>(13)? != 0,
    })
}

fn row_to_channel(row: &rusqlite::Row) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: row.get(0)?,
        name: row.get(1)?,
        psk: row.get(2)?,
        role: row.get(3)?,
        uplink_enabled: row.get::<_, i32>(4)? != 0,
        downlink_enabled: row.get::<_, i32>(5)? != 0,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn row_to_traceroute(row: &rusqlite::Row) -> rusqlite::Result<Traceroute> {
    let route: String = row.get(2)?;
    let route_back: Option<String> = row.get(3)?;
    let snr_towards: String = row.get(4)?;
    let snr_back: String = row.get(5)?;
    Ok(Traceroute {
        from_node_num: row.get(0)?,
        to_node_num: row.get(1)?,
        route: serde_json::from_str(&route).unwrap_or_default(),
        route_back: route_back.and_then(|s| serde_json::from_str(&s).ok()),
        snr_towards: serde_json::from_str(&snr_towards).unwrap_or_default(),
        snr_back: serde_json::from_str(&snr_back).unwrap_or_default(),
        hop_count: row.get(6)?,
        timestamp: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn open_test_store() -> (Store, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = Store::open(path).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn message_idempotence_matches_property_1() {
        let (store, _dir) = open_test_store().await;
        let msg = Message {
            id: Message::composite_id(0x12345678, 0xAAAA),
            from_node_num: 0x12345678,
            to_node_num: 0xFFFFFFFF,
            channel: 0,
            portnum: 1,
            text: Some("hi".into()),
            timestamp: 1000,
            hop_start: None,
            hop_limit: None,
            reply_id: None,
            emoji: 0,
            acknowledged: false,
            ack_failed: false,
            bridge: false,
        };

        assert!(store.insert_message_if_new(msg.clone()).await.unwrap());
        assert!(!store.insert_message_if_new(msg).await.unwrap());

        let all = store.recent_messages(10).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn channel_role_zero_is_never_visible() {
        let (store, _dir) = open_test_store().await;
        store
            .upsert_channel(Channel {
                id: 0,
                name: "hidden".into(),
                psk: "AQ==".into(),
                role: 0,
                uplink_enabled: false,
                downlink_enabled: false,
                created_at: 0,
                updated_at: 0,
            })
            .await
            .unwrap();
        store
            .upsert_channel(Channel {
                id: 1,
                name: "primary".into(),
                psk: "AQ==".into(),
                role: 1,
                uplink_enabled: true,
                downlink_enabled: true,
                created_at: 0,
                updated_at: 0,
            })
            .await
            .unwrap();

        let visible = store.visible_channels().await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, 1);
    }

    #[tokio::test]
    async fn mark_read_is_idempotent() {
        let (store, _dir) = open_test_store().await;
        store.mark_read("anon".into(), "0".into(), 500).await.unwrap();
        let before = store.unread_count("anon", "0", 0).await.unwrap();
        store.mark_read("anon".into(), "0".into(), 500).await.unwrap();
        let after = store.unread_count("anon", "0", 0).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn last_traceroute_at_tracks_max_timestamp_per_destination() {
        let (store, _dir) = open_test_store().await;
        store
            .upsert_traceroute(Traceroute {
                from_node_num: 1,
                to_node_num: 2,
                route: vec![],
                route_back: None,
                snr_towards: vec![],
                snr_back: vec![],
                hop_count: 0,
                timestamp: 100,
            })
            .await
            .unwrap();
        store
            .upsert_traceroute(Traceroute {
                from_node_num: 1,
                to_node_num: 2,
                route: vec![],
                route_back: None,
                snr_towards: vec![],
                snr_back: vec![],
                hop_count: 0,
                timestamp: 200,
            })
            .await
            .unwrap();

        let latest = store.last_traceroute_at().await.unwrap();
        assert_eq!(latest.get(&2), Some(&200));
        assert_eq!(latest.get(&3), None);
    }
}
