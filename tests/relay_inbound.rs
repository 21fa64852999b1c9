mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{Harness, RecordingPlugin, GENERAL, LOCAL_MESHNET, MY_NODE, OPS};
use meshrelay::format::BROADCAST_ADDR;
use meshrelay::matrix::MessageType;
use meshrelay::meshtastic::{MeshPacket, PortNum};
use meshrelay::plugins::Plugin;
use meshrelay::relay::{DropReason, InboundOutcome};

const ALICE: u32 = 0x0000_1234;

fn broadcast(id: u32, channel: u32, text: &str) -> MeshPacket {
    MeshPacket::text_message(id, ALICE, BROADCAST_ADDR, channel, text)
}

#[tokio::test]
async fn unmapped_channel_touches_nothing() {
    let plugin = RecordingPlugin::new("observer");
    let h = Harness::build(|_| {}, vec![plugin.clone() as Arc<dyn Plugin>]);
    h.transport.add_node(ALICE, "Alice Smith", "ALI");

    let outcome = h.relay.handle_radio_packet(&broadcast(10, 5, "anyone on 5?")).await;

    assert_eq!(outcome, InboundOutcome::Dropped(DropReason::UnmappedChannel));
    assert!(h.chat.posts().is_empty());
    assert_eq!(h.store.message_map_len(), 0);
    assert_eq!(h.store.get_longname(ALICE).unwrap(), None);
    assert!(plugin.radio_seen().is_empty());
}

#[tokio::test]
async fn text_is_relayed_with_metadata_and_mapped() {
    let h = Harness::new();
    h.transport.add_node(ALICE, "Alice Smith", "ALI");

    let outcome = h.relay.handle_radio_packet(&broadcast(500, 0, "hello mesh")).await;
    assert_eq!(outcome, InboundOutcome::Relayed(1));

    let posts = h.chat.posts();
    assert_eq!(posts.len(), 1);
    let (room, content) = &posts[0];
    assert_eq!(room, GENERAL);
    assert_eq!(content.msgtype, MessageType::Text);
    assert_eq!(content.body, "[Alice Smith/Downtown]: hello mesh");
    assert_eq!(content.meta.longname, "Alice Smith");
    assert_eq!(content.meta.shortname, "ALI");
    assert_eq!(content.meta.meshnet, LOCAL_MESHNET);
    assert_eq!(content.meta.mesh_id, Some(500));
    assert_eq!(content.meta.text.as_deref(), Some("hello mesh"));
    assert_eq!(content.meta.portnum.as_deref(), Some("TEXT_MESSAGE_APP"));

    let row = h.store.get_message_map_by_mesh_id(500).unwrap().unwrap();
    assert_eq!(row.event_id, "$ev1");
    assert_eq!(row.room_id, GENERAL);
    assert_eq!(row.meshnet, LOCAL_MESHNET);
    // names learned from the node table are cached
    assert_eq!(h.store.get_longname(ALICE).unwrap().as_deref(), Some("Alice Smith"));
    assert_eq!(h.store.get_shortname(ALICE).unwrap().as_deref(), Some("ALI"));
}

#[tokio::test]
async fn channel_feeds_every_mapped_room() {
    let h = Harness::with_config(|cfg| {
        cfg.matrix_rooms.push(meshrelay::config::RoomMapping {
            id: "!lobby:example.org".into(),
            meshtastic_channel: 2,
        });
    });
    let outcome = h.relay.handle_radio_packet(&broadcast(7, 2, "ops check")).await;
    assert_eq!(outcome, InboundOutcome::Relayed(2));
    let rooms: Vec<String> = h.chat.posts().into_iter().map(|(r, _)| r).collect();
    assert_eq!(rooms, vec![OPS.to_string(), "!lobby:example.org".to_string()]);
}

#[tokio::test]
async fn unknown_sender_falls_back_to_node_id() {
    let h = Harness::new();
    h.relay.handle_radio_packet(&broadcast(1, 0, "who am i")).await;
    let posts = h.chat.posts();
    assert_eq!(posts[0].1.body, "[!00001234/Downtown]: who am i");
    assert_eq!(posts[0].1.meta.shortname, "!00001234");
}

#[tokio::test]
async fn direct_message_goes_to_plugins_only() {
    let plugin = RecordingPlugin::new("observer");
    let h = Harness::build(|_| {}, vec![plugin.clone() as Arc<dyn Plugin>]);
    let dm = MeshPacket::text_message(3, ALICE, MY_NODE, 0, "!help");

    assert_eq!(h.relay.handle_radio_packet(&dm).await, InboundOutcome::DirectMessage);
    assert!(h.chat.posts().is_empty());
    assert_eq!(plugin.radio_seen().len(), 1);
}

#[tokio::test]
async fn handled_packet_is_not_relayed() {
    let first = RecordingPlugin::build("weather", true, false, vec![]);
    let later = RecordingPlugin::new("logger");
    let h = Harness::build(
        |_| {},
        vec![first.clone() as Arc<dyn Plugin>, later.clone() as Arc<dyn Plugin>],
    );

    let outcome = h.relay.handle_radio_packet(&broadcast(4, 0, "!weather")).await;
    assert_eq!(outcome, InboundOutcome::HandledByPlugin("weather".into()));
    assert!(h.chat.posts().is_empty());
    assert!(later.radio_seen().is_empty());
}

#[tokio::test]
async fn reaction_threads_onto_original() {
    let h = Harness::new();
    h.transport.add_node(ALICE, "Alice Smith", "ALI");
    h.relay.handle_radio_packet(&broadcast(500, 0, "hello mesh")).await;

    let tapback = broadcast(501, 0, "👍").with_reply(500, true);
    assert_eq!(h.relay.handle_radio_packet(&tapback).await, InboundOutcome::Reaction);

    let posts = h.chat.posts();
    assert_eq!(posts.len(), 2);
    let (room, content) = &posts[1];
    assert_eq!(room, GENERAL);
    assert_eq!(content.msgtype, MessageType::Emote);
    assert_eq!(content.body, "\n [Alice Smith/Downtown]: reacted 👍 to \"hello mesh\"");
    assert_eq!(content.meta.reply_id, Some(500));
    assert_eq!(content.meta.emoji, Some(1));
    assert_eq!(content.meta.text.as_deref(), Some("hello mesh"));
    // emotes are never mapped
    assert_eq!(h.store.message_map_len(), 1);
}

#[tokio::test]
async fn reaction_to_unknown_packet_is_dropped() {
    let h = Harness::new();
    let tapback = broadcast(9, 0, "❤️").with_reply(12345, true);
    assert_eq!(
        h.relay.handle_radio_packet(&tapback).await,
        InboundOutcome::Dropped(DropReason::OriginalNotFound)
    );
    assert!(h.chat.posts().is_empty());
}

#[tokio::test]
async fn reactions_disabled_drops_tapbacks() {
    let h = Harness::with_config(|cfg| cfg.meshtastic.message_interactions.reactions = false);
    h.relay.handle_radio_packet(&broadcast(500, 0, "hello mesh")).await;
    let tapback = broadcast(501, 0, "👍").with_reply(500, true);
    assert_eq!(
        h.relay.handle_radio_packet(&tapback).await,
        InboundOutcome::Dropped(DropReason::ReactionsDisabled)
    );
    assert_eq!(h.chat.posts().len(), 1);
}

#[tokio::test]
async fn reply_quotes_and_references_original() {
    let h = Harness::new();
    h.transport.add_node(ALICE, "Alice Smith", "ALI");
    h.relay.handle_radio_packet(&broadcast(600, 0, "lunch at noon?")).await;

    let reply = broadcast(601, 0, "count me in").with_reply(600, false);
    assert_eq!(h.relay.handle_radio_packet(&reply).await, InboundOutcome::Reply);

    let posts = h.chat.posts();
    let content = &posts[1].1;
    assert_eq!(content.reply_target(), Some("$ev1"));
    assert_eq!(
        content.body,
        "> <@relay:example.org> [Alice Smith/Downtown]: lunch at noon?\n\n[Alice Smith/Downtown]: count me in"
    );
    assert_eq!(content.meta.reply_id, Some(600));
    let row = h.store.get_message_map_by_mesh_id(601).unwrap().unwrap();
    assert_eq!(row.event_id, "$ev2");
    assert_eq!(row.text, "count me in");
}

#[tokio::test]
async fn chat_failure_leaves_no_mapping() {
    let h = Harness::new();
    h.chat.fail_sends.store(true, Ordering::SeqCst);
    assert_eq!(
        h.relay.handle_radio_packet(&broadcast(1, 0, "lost")).await,
        InboundOutcome::Dropped(DropReason::ChatSendFailed)
    );
    assert_eq!(h.store.message_map_len(), 0);
}

#[tokio::test]
async fn interactions_off_skips_mapping() {
    let h = Harness::with_config(|cfg| {
        cfg.meshtastic.message_interactions.reactions = false;
        cfg.meshtastic.message_interactions.replies = false;
    });
    assert_eq!(
        h.relay.handle_radio_packet(&broadcast(1, 0, "plain")).await,
        InboundOutcome::Relayed(1)
    );
    assert_eq!(h.store.message_map_len(), 0);
}

#[tokio::test]
async fn detection_sensor_respects_toggle() {
    let h = Harness::with_config(|cfg| cfg.meshtastic.detection_sensor = false);
    let mut packet = broadcast(1, 0, "motion detected");
    packet.port = PortNum::DetectionSensor;
    packet.channel = None;
    assert_eq!(
        h.relay.handle_radio_packet(&packet).await,
        InboundOutcome::Dropped(DropReason::DetectionSensorDisabled)
    );
    assert!(h.chat.posts().is_empty());
}

#[tokio::test]
async fn non_text_packets_only_reach_plugins() {
    let plugin = RecordingPlugin::new("telemetry");
    let h = Harness::build(|_| {}, vec![plugin.clone() as Arc<dyn Plugin>]);
    let packet = MeshPacket {
        text: None,
        port: PortNum::Other(67),
        payload: vec![1, 2, 3],
        ..broadcast(1, 0, "")
    };
    assert_eq!(
        h.relay.handle_radio_packet(&packet).await,
        InboundOutcome::Dropped(DropReason::NoText)
    );
    assert_eq!(plugin.radio_seen(), vec![String::new()]);
    assert!(h.chat.posts().is_empty());
}
