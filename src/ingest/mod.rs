//! Ingest Pipeline: classifies inbound packets by portnum and applies the
//! per-kind handler that updates the Store (spec.md §4.3). Runs as its own
//! task, consuming `DecodedPacket`s off the `DeviceSession`'s unbounded
//! channel in arrival order.

pub mod bridge_filter;
pub mod dedup;

use crate::automation::{self, WelcomeTrigger};
use crate::codec::crypto;
use crate::config::{AutomationConfig, RadioConfig};
use crate::derive;
use crate::error::CoreError;
use crate::proto::meshtastic_generated as pb;
use crate::session::{DecodedPacket, SessionHandle};
use crate::store::models::*;
use crate::store::Store;
use prost::Message as _;
use std::collections::HashMap;
use tokio::sync::mpsc;

use dedup::{MessageDedup, TracerouteDedup};

/// Owns the mutable ingest-local state (dedup windows, last-seen positions)
/// that doesn't belong in the Store itself. One instance per `DeviceSession`.
pub struct IngestPipeline {
    store: Store,
    session: SessionHandle,
    channel_psks: HashMap<u8, String>,
    automation: AutomationConfig,
    message_dedup: MessageDedup,
    traceroute_dedup: TracerouteDedup,
    last_position: HashMap<u32, (f64, f64, i64)>,
}

impl IngestPipeline {
    pub fn new(store: Store, session: SessionHandle, radio: &RadioConfig, automation: AutomationConfig) -> Self {
        IngestPipeline {
            store,
            session,
            channel_psks: radio.channel_psks.clone(),
            automation,
            message_dedup: MessageDedup::new(),
            traceroute_dedup: TracerouteDedup::new(),
            last_position: HashMap::new(),
        }
    }

    /// Consumes decoded packets forever, in arrival order, applying the
    /// dispatch table in spec.md §4.3. Never returns until the channel
    /// closes (session task exited).
    pub async fn run(mut self, mut packet_rx: mpsc::UnboundedReceiver<DecodedPacket>) {
        while let Some(decoded) = packet_rx.recv().await {
            if let Err(e) = self.handle_packet(decoded.packet).await {
                log::warn!("ingest: {e}");
            }
        }
    }

    async fn handle_packet(&mut self, packet: pb::MeshPacket) -> Result<(), CoreError> {
        let data = match self.resolve_payload(&packet) {
            Some(data) => data,
            None => {
                // Stayed encrypted-opaque: never discarded, but nothing more
                // to dispatch on.
                return Ok(());
            }
        };

        let portnum = pb::PortNum::from_i32(data.portnum).unwrap_or(pb::PortNum::UnknownApp);
        let now = now_unix();

        match portnum {
            pb::PortNum::TextMessageApp => self.handle_text_message(&packet, &data, now).await,
            pb::PortNum::PositionApp => self.handle_position(&packet, &data, now).await,
            pb::PortNum::NodeinfoApp => self.handle_nodeinfo(&packet, &data, now).await,
            pb::PortNum::RoutingApp => self.handle_routing(&data).await,
            pb::PortNum::TelemetryApp => self.handle_telemetry(&packet, &data, now).await,
            pb::PortNum::TracerouteApp => self.handle_traceroute(&packet, &data, now).await,
            pb::PortNum::NeighborinfoApp => self.handle_neighborinfo(&packet, &data).await,
            _ => {
                self.store
                    .record_opaque(packet.from, data.portnum, data.payload.len(), now)
                    .await?;
                Ok(())
            }
        }
    }

    /// Returns the packet's `Data` payload, decrypting it first if it
    /// arrived as `encrypted` and a PSK for its channel is known. Per
    /// spec.md §4.1, a decrypt failure (unknown channel, bad PSK, garbled
    /// ciphertext) keeps the packet as encrypted-opaque rather than
    /// discarding it — this returns `None` in that case.
    fn resolve_payload(&self, packet: &pb::MeshPacket) -> Option<pb::Data> {
        use pb::mesh_packet::PayloadVariant as PV;
        match &packet.payload_variant {
            Some(PV::Decoded(data)) => Some(data.clone()),
            Some(PV::Encrypted(ciphertext)) => {
                let psk = self.channel_psks.get(&(packet.channel as u8))?;
                let plain = crypto::decrypt_channel_payload(psk, packet.id, packet.from, ciphertext).ok()?;
                pb::Data::decode(plain.as_slice()).ok()
            }
            None => None,
        }
    }

    async fn handle_text_message(&mut self, packet: &pb::MeshPacket, data: &pb::Data, now: i64) -> Result<(), CoreError> {
        if !self.message_dedup.observe(packet.from, packet.id) {
            return Ok(());
        }

        let text = String::from_utf8_lossy(&data.payload).to_string();
        let existing = self.store.get_node(packet.from).await?;
        let sender_known = existing.is_some();
        let bridge = bridge_filter::is_bridge_traffic(sender_known, &text);

        let mut node = existing.unwrap_or_else(|| Node::new(packet.from));
        node.last_heard = Some(now);
        node.snr = Some(packet.rx_snr);
        node.via_mqtt = packet.via_mqtt;
        self.store.upsert_node(node).await?;

        let channel: i32 = if packet.to != 0xFFFFFFFF { -1 } else { packet.channel as i32 };
        let message = Message {
            id: Message::composite_id(packet.from, packet.id),
            from_node_num: packet.from,
            to_node_num: packet.to,
            channel,
            portnum: data.portnum,
            text: Some(text.clone()),
            timestamp: now,
            hop_start: Some(packet.hop_start),
            hop_limit: Some(packet.hop_limit),
            reply_id: if data.reply_id != 0 { Some(data.reply_id) } else { None },
            emoji: data.emoji as u8,
            acknowledged: false,
            ack_failed: false,
            bridge,
        };
        let is_new = self.store.insert_message_if_new(message).await?;
        if !is_new {
            return Ok(());
        }

        let local_node_num = self.session.local_node_num().await;
        if local_node_num != Some(packet.from) {
            let short_name = self
                .store
                .get_node(packet.from)
                .await?
                .and_then(|n| n.short_name)
                .unwrap_or_else(|| node_id_from_num(packet.from));

            if data.reply_id == 0 {
                // Not a tapback: eligible for first-contact welcome.
                let has_prior = self.store.get_node(packet.from).await?.map(|n| n.welcomed_at.is_some()).unwrap_or(false);
                if !has_prior {
                    let node = self.store.get_node(packet.from).await?;
                    automation::maybe_auto_welcome(
                        &self.automation,
                        &self.store,
                        &self.session,
                        packet.from,
                        &short_name,
                        node.as_ref().and_then(|n| n.long_name.as_deref()),
                        now,
                        WelcomeTrigger::FirstMessage,
                    )
                    .await?;
                }
            }

            automation::maybe_auto_ack(
                &self.automation,
                &self.session,
                local_node_num,
                packet.from,
                &short_name,
                channel,
                &text,
            )
            .await?;
        }
        Ok(())
    }

    async fn handle_position(&mut self, packet: &pb::MeshPacket, data: &pb::Data, now: i64) -> Result<(), CoreError> {
        let Ok(pos) = pb::Position::decode(data.payload.as_ref()) else {
            return Ok(());
        };
        let lat = pos.latitude_i as f64 / 1e7;
        let lon = pos.longitude_i as f64 / 1e7;
        let node_id = node_id_from_num(packet.from);

        let mut node = self.store.get_node(packet.from).await?.unwrap_or_else(|| Node::new(packet.from));
        node.position = Some(Position {
            lat,
            lon,
            alt: Some(pos.altitude as f64),
            precision_bits: Some(pos.precision_bits),
        });
        node.last_heard = Some(now);
        node.snr = Some(packet.rx_snr);
        node.via_mqtt = packet.via_mqtt;
        self.store.upsert_node(node).await?;

        let prev = self.last_position.get(&packet.from).copied();
        if derive::should_append_position(prev, lat, lon, now) {
            self.last_position.insert(packet.from, (lat, lon, now));
            self.store
                .append_position(PositionHistoryPoint { node_id: node_id.clone(), lat, lon, alt: Some(pos.altitude as f64), timestamp: now })
                .await?;
        }

        let window_start = now - 168 * 3600;
        let positions = self.store.positions_since(&node_id, window_start).await?;
        let mobile = derive::is_mobile(&positions, now);
        self.store.set_mobile(packet.from, mobile).await?;
        Ok(())
    }

    async fn handle_nodeinfo(&mut self, packet: &pb::MeshPacket, data: &pb::Data, now: i64) -> Result<(), CoreError> {
        let Ok(user) = pb::User::decode(data.payload.as_ref()) else {
            return Ok(());
        };
        let mut node = self.store.get_node(packet.from).await?.unwrap_or_else(|| Node::new(packet.from));
        if !user.long_name.is_empty() {
            node.long_name = Some(user.long_name.clone());
        }
        if !user.short_name.is_empty() {
            node.short_name = Some(user.short_name.clone());
        }
        node.hw_model = Some(format!("{:?}", pb::HardwareModel::from_i32(user.hw_model).unwrap_or(pb::HardwareModel::Unset)));
        node.role = Some(format!("{:?}", pb::Role::from_i32(user.role).unwrap_or(pb::Role::Client)));
        node.last_heard = Some(now);
        self.store.upsert_node(node).await?;

        if !user.long_name.is_empty() {
            let short_name = if user.short_name.is_empty() { node_id_from_num(packet.from) } else { user.short_name.clone() };
            automation::maybe_auto_welcome(
                &self.automation,
                &self.store,
                &self.session,
                packet.from,
                &short_name,
                Some(user.long_name.as_str()),
                now,
                WelcomeTrigger::NodeInfo,
            )
            .await?;
        }
        Ok(())
    }

    /// Per spec.md §9's open question: unknown ROUTING_APP variants leave
    /// `acknowledged` false with no further inference; only an explicit
    /// success or error reply resolves a pending Message.
    ///
    /// Correlates by the local node number, not `data.source`: outbound
    /// Messages are stored under `Message::composite_id(local_node_num,
    /// packetId)` (see `api::handlers::send_message`/`await_ack`), and
    /// `Data.source` on a real delivered ACK isn't reliably that value.
    async fn handle_routing(&mut self, data: &pb::Data) -> Result<(), CoreError> {
        if data.request_id == 0 {
            return Ok(());
        }
        let Some(local_node_num) = self.session.local_node_num().await else {
            return Ok(());
        };
        let Ok(routing) = pb::Routing::decode(data.payload.as_ref()) else {
            return Ok(());
        };
        use pb::routing::Variant as RV;
        match routing.variant {
            Some(RV::ErrorReason(code)) if code == pb::routing::Error::None as i32 => {
                self.store.mark_ack(local_node_num, data.request_id, true).await?;
            }
            Some(RV::ErrorReason(_)) => {
                self.store.mark_ack(local_node_num, data.request_id, false).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_telemetry(&mut self, packet: &pb::MeshPacket, data: &pb::Data, now: i64) -> Result<(), CoreError> {
        let Ok(t) = pb::Telemetry::decode(data.payload.as_ref()) else {
            return Ok(());
        };
        use pb::telemetry::Variant as TV;
        let device_metrics = match &t.variant {
            Some(TV::DeviceMetrics(m)) => Some(m.clone()),
            _ => None,
        };
        let (kind, payload) = match t.variant {
            Some(TV::DeviceMetrics(m)) => (
                TelemetryKind::Device,
                serde_json::json!({
                    "batteryLevel": m.battery_level,
                    "voltage": m.voltage,
                    "channelUtilization": m.channel_utilization,
                    "airUtilTx": m.air_util_tx,
                    "uptimeSeconds": m.uptime_seconds,
                }),
            ),
            Some(TV::EnvironmentMetrics(m)) => (
                TelemetryKind::Environment,
                serde_json::json!({
                    "temperature": m.temperature,
                    "relativeHumidity": m.relative_humidity,
                    "barometricPressure": m.barometric_pressure,
                }),
            ),
            Some(TV::PowerMetrics(m)) => (
                TelemetryKind::Power,
                serde_json::json!({
                    "ch1Voltage": m.ch1_voltage,
                    "ch1Current": m.ch1_current,
                }),
            ),
            Some(TV::LocalStats(m)) => (
                TelemetryKind::LocalStats,
                serde_json::json!({
                    "uptimeSeconds": m.uptime_seconds,
                    "numOnlineNodes": m.num_online_nodes,
                    "numTotalNodes": m.num_total_nodes,
                }),
            ),
            None => return Ok(()),
        };

        if let TelemetryKind::Device = kind {
            if let Some(level) = payload.get("batteryLevel").and_then(|v| v.as_u64()) {
                if !is_valid_battery_level(level as u32) {
                    return Ok(());
                }
            }
        }

        if let Some(m) = device_metrics {
            let mut node = self.store.get_node(packet.from).await?.unwrap_or_else(|| Node::new(packet.from));
            node.device_metrics = DeviceMetrics {
                battery_level: Some(m.battery_level),
                voltage: Some(m.voltage as f64),
                channel_utilization: Some(m.channel_utilization as f64),
                air_util_tx: Some(m.air_util_tx as f64),
            };
            node.last_heard = Some(now);
            self.store.upsert_node(node).await?;
        }

        self.store
            .append_telemetry(TelemetrySample { node_num: packet.from, timestamp: now, kind, payload })
            .await
    }

    async fn handle_traceroute(&mut self, packet: &pb::MeshPacket, data: &pb::Data, now: i64) -> Result<(), CoreError> {
        if !self.traceroute_dedup.observe(packet.from, packet.to, now) {
            return Ok(());
        }
        let Ok(rd) = pb::RouteDiscovery::decode(data.payload.as_ref()) else {
            return Ok(());
        };
        let hop_count = rd.route.len() as u32;
        self.store
            .upsert_traceroute(Traceroute {
                from_node_num: packet.from,
                to_node_num: packet.to,
                route: rd.route,
                route_back: if rd.route_back.is_empty() { None } else { Some(rd.route_back) },
                snr_towards: rd.snr_towards.iter().map(|v| *v as f32 / 4.0).collect(),
                snr_back: rd.snr_back.iter().map(|v| *v as f32 / 4.0).collect(),
                hop_count,
                timestamp: now,
            })
            .await
    }

    async fn handle_neighborinfo(&mut self, packet: &pb::MeshPacket, data: &pb::Data) -> Result<(), CoreError> {
        let Ok(ni) = pb::NeighborInfo::decode(data.payload.as_ref()) else {
            return Ok(());
        };
        let now = now_unix();
        let edges = ni
            .neighbors
            .into_iter()
            .map(|n| NeighborEdge {
                node_num: packet.from,
                neighbor_node_num: n.node_id,
                snr: Some(n.snr),
                last_rx_time: Some(n.last_rx_time as i64),
                timestamp: now,
            })
            .collect();
        self.store.replace_neighbors(packet.from, edges).await
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
