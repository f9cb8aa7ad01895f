//! End-to-end tests driving real protobuf packets through the Ingest
//! Pipeline into a real (tempfile-backed) Store, exercising the scenarios
//! from spec.md §8 that span more than one module.

use meshmonitor::config::{AutomationConfig, RadioConfig};
use meshmonitor::ingest::IngestPipeline;
use meshmonitor::proto::meshtastic_generated as pb;
use meshmonitor::session::{DecodedPacket, DeviceSession};
use meshmonitor::store::Store;
use prost::Message as _;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Spins up a real `Store` plus an `IngestPipeline` fed from a channel the
/// test controls directly, bypassing the `DeviceSession` read loop. The
/// `DeviceSession` itself is never `run()`, so it never dials a radio; its
/// handle exists only to give the pipeline somewhere to enqueue outbound
/// automation commands.
async fn harness(automation: AutomationConfig) -> (Store, TempDir, mpsc::UnboundedSender<DecodedPacket>, meshmonitor::session::SessionHandle) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("ingest_test.db")).unwrap();
    let (session, _unused_packet_rx) = DeviceSession::new(RadioConfig::default());
    let handle = session.handle();

    let pipeline = IngestPipeline::new(store.clone(), handle.clone(), &RadioConfig::default(), automation);
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(pipeline.run(rx));
    (store, dir, tx, handle)
}

fn decoded(packet: pb::MeshPacket) -> DecodedPacket {
    DecodedPacket { packet }
}

fn text_packet(from: u32, to: u32, id: u32, channel: u32, text: &str, reply_id: u32, emoji: u32) -> pb::MeshPacket {
    let data = pb::Data {
        portnum: pb::PortNum::TextMessageApp as i32,
        payload: text.as_bytes().to_vec().into(),
        reply_id,
        emoji,
        ..Default::default()
    };
    pb::MeshPacket {
        from,
        to,
        channel,
        id,
        payload_variant: Some(pb::mesh_packet::PayloadVariant::Decoded(data)),
        ..Default::default()
    }
}

fn nodeinfo_packet(from: u32, id: u32, long_name: &str, short_name: &str) -> pb::MeshPacket {
    let user = pb::User {
        long_name: long_name.to_string(),
        short_name: short_name.to_string(),
        ..Default::default()
    };
    let data = pb::Data {
        portnum: pb::PortNum::NodeinfoApp as i32,
        payload: user.encode_to_vec().into(),
        ..Default::default()
    };
    pb::MeshPacket {
        from,
        to: 0xFFFF_FFFF,
        id,
        payload_variant: Some(pb::mesh_packet::PayloadVariant::Decoded(data)),
        ..Default::default()
    }
}

/// Gives the pipeline's async task a chance to drain the channel before the
/// test inspects the Store.
async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}

/// spec.md §8 Scenario S1: a NODEINFO followed by a TEXT_MESSAGE_APP
/// produces one Node row and one Message row with the documented composite
/// id, and the recent-messages feed returns it.
#[tokio::test]
async fn scenario_s1_first_message_round_trip() {
    let (store, _dir, tx, _handle) = harness(AutomationConfig::default()).await;

    tx.send(decoded(nodeinfo_packet(0x1234_5678, 1, "N1", "N1X"))).unwrap();
    settle().await;

    tx.send(decoded(text_packet(0x1234_5678, 0xFFFF_FFFF, 0xAAAA, 0, "hi", 0, 0)))
        .unwrap();
    settle().await;

    let node = store.get_node(0x1234_5678).await.unwrap().expect("node upserted");
    assert_eq!(node.long_name.as_deref(), Some("N1"));
    assert_eq!(node.short_name.as_deref(), Some("N1X"));

    let messages = store.recent_messages(10).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, "305419896_43690");
    assert_eq!(messages[0].channel, 0);
    assert!(!messages[0].acknowledged);
    assert_eq!(messages[0].text.as_deref(), Some("hi"));
}

/// spec.md §8 Scenario S2: a ROUTING_APP success reply whose `requestId`
/// matches a pending *outbound* Message flips `acknowledged` to true without
/// touching any other row. Mirrors how `api::handlers::send_message` stores
/// the pending row (keyed by `composite_id(local_node_num, packetId)`) and
/// how a real delivered ACK arrives: `Data.source` on the reply is not the
/// local node, so correlation must go through the session's local node
/// number instead.
#[tokio::test]
async fn scenario_s2_ack_correlation() {
    let (store, _dir, tx, handle) = harness(AutomationConfig::default()).await;
    let local_node_num = 0x1234_5678;
    handle.set_local_node_num(local_node_num).await;

    use meshmonitor::store::models::Message;
    store
        .insert_message_if_new(Message {
            id: Message::composite_id(local_node_num, 0xAAAA),
            from_node_num: local_node_num,
            to_node_num: 0xFFFF_FFFF,
            channel: 0,
            portnum: pb::PortNum::TextMessageApp as i32,
            text: Some("hi".to_string()),
            timestamp: 0,
            hop_start: None,
            hop_limit: None,
            reply_id: None,
            emoji: 0,
            acknowledged: false,
            ack_failed: false,
            bridge: false,
        })
        .await
        .unwrap();
    store
        .insert_message_if_new(Message {
            id: Message::composite_id(local_node_num, 0xBBBB),
            from_node_num: local_node_num,
            to_node_num: 0xFFFF_FFFF,
            channel: 0,
            portnum: pb::PortNum::TextMessageApp as i32,
            text: Some("other".to_string()),
            timestamp: 0,
            hop_start: None,
            hop_limit: None,
            reply_id: None,
            emoji: 0,
            acknowledged: false,
            ack_failed: false,
            bridge: false,
        })
        .await
        .unwrap();

    // A real delivered ACK: `source` is the remote node that actually
    // answered, not the local node the request was sent from.
    let routing = pb::Routing {
        variant: Some(pb::routing::Variant::ErrorReason(pb::routing::Error::None as i32)),
    };
    let data = pb::Data {
        portnum: pb::PortNum::RoutingApp as i32,
        payload: routing.encode_to_vec().into(),
        request_id: 0xAAAA,
        source: 0x9999_9999,
        ..Default::default()
    };
    let packet = pb::MeshPacket {
        from: 0x9999_9999,
        to: local_node_num,
        id: 2,
        payload_variant: Some(pb::mesh_packet::PayloadVariant::Decoded(data)),
        ..Default::default()
    };
    tx.send(decoded(packet)).unwrap();
    settle().await;

    let acked = store
        .get_message(&Message::composite_id(local_node_num, 0xAAAA))
        .await
        .unwrap()
        .expect("message exists");
    assert!(acked.acknowledged);

    let untouched = store
        .get_message(&Message::composite_id(local_node_num, 0xBBBB))
        .await
        .unwrap()
        .expect("message exists");
    assert!(!untouched.acknowledged);
}

/// spec.md §8 Scenario S4: a tapback (emoji=1, reply_id set) never shows up
/// in the user-visible feed, its reaction is queryable against the message
/// it replies to, and re-ingesting it is a no-op.
#[tokio::test]
async fn scenario_s4_tapback_is_hidden_from_feed_and_idempotent() {
    let (store, _dir, tx, _handle) = harness(AutomationConfig::default()).await;

    tx.send(decoded(text_packet(1, 0xFFFF_FFFF, 1, 0, "hello", 0, 0))).unwrap();
    settle().await;
    tx.send(decoded(text_packet(2, 0xFFFF_FFFF, 2, 0, "\u{1F44D}", 1, 1)))
        .unwrap();
    settle().await;

    let feed = store.recent_messages(10).await.unwrap();
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].text.as_deref(), Some("hello"));

    let reactions = store.reactions_for(&meshmonitor::store::models::Message::composite_id(1, 1)).await.unwrap();
    assert_eq!(reactions, vec!["\u{1F44D}".to_string()]);

    // Re-ingest the tapback: dedup must make this a no-op.
    tx.send(decoded(text_packet(2, 0xFFFF_FFFF, 2, 0, "\u{1F44D}", 1, 1)))
        .unwrap();
    settle().await;
    let reactions_again = store.reactions_for(&meshmonitor::store::models::Message::composite_id(1, 1)).await.unwrap();
    assert_eq!(reactions_again.len(), 1);
}

/// Re-ingesting an identical TEXT_MESSAGE_APP any number of times must
/// leave the Store unchanged after the first (spec.md §8 property 1),
/// exercised here through the real dispatch path rather than the Store
/// directly.
#[tokio::test]
async fn repeated_ingest_of_identical_packet_is_idempotent() {
    let (store, _dir, tx, _handle) = harness(AutomationConfig::default()).await;

    for _ in 0..3 {
        tx.send(decoded(text_packet(0xAA, 0xFFFF_FFFF, 7, 0, "dup", 0, 0)))
            .unwrap();
    }
    settle().await;

    let feed = store.recent_messages(10).await.unwrap();
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].text.as_deref(), Some("dup"));
}

/// A DM (to != broadcast) is stored with `channel = -1` per spec.md §3,
/// distinguishing it from a channel broadcast even though both arrive on
/// the same wire `channel` field.
#[tokio::test]
async fn direct_message_is_stored_with_channel_negative_one() {
    let (store, _dir, tx, _handle) = harness(AutomationConfig::default()).await;

    tx.send(decoded(text_packet(0xAA, 0xBB, 9, 0, "psst", 0, 0))).unwrap();
    settle().await;

    let feed = store.recent_messages(10).await.unwrap();
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].channel, -1);
}
