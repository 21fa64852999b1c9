//! # Relay Protocol
//!
//! Translation between radio packets and Matrix events in both directions.
//!
//! Radio to Matrix:
//! - tapback reactions and replies are threaded onto the Matrix event that
//!   mirrors the referenced packet
//! - text on a mapped channel is offered to plugins, then posted to every room
//!   mapped to that channel unless it was a direct message to the relay
//!
//! Matrix to radio:
//! - history (anything at or before startup) and the bot's own events are
//!   ignored
//! - reactions and replies to mirrored events reference the original packet id
//! - messages that came from this meshnet through a peer relay are dropped so
//!   they do not loop back onto the mesh
//!
//! Nothing here fails the caller: every path ends in an outcome value that is
//! logged, and store or chat errors degrade to "not relayed".

pub mod service;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::config::Config;
use crate::format::{
    abbreviate, chat_prefix, classify_destination, meshnet_abbrev, radio_prefix, shortname_fallback,
    strip_quoted_lines, truncate_bytes, Destination, BROADCAST_ADDR, PREVIEW_CHARS,
};
use crate::logutil::{describe, escape_log};
use crate::matrix::{ChatClient, ChatContent, ChatEventKind, ChatMessage, MessageType, RelayMetadata};
use crate::meshtastic::queue::TransportSource;
use crate::meshtastic::{MappingHint, MeshPacket, OutboundQueue, PortNum, RadioTransport};
use crate::metrics;
use crate::plugins::{PluginContext, PluginRegistry};
use crate::storage::{MessageMapping, MessageStore};

const ROOM_SEND_TIMEOUT: Duration = Duration::from_secs(10);
const UNKNOWN_REACTION: &str = "⚠️";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Posted to this many rooms.
    Relayed(usize),
    Reaction,
    Reply,
    HandledByPlugin(String),
    DirectMessage,
    Dropped(DropReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundOutcome {
    Queued,
    ReactionQueued,
    ReplyQueued,
    HandledByPlugin(String),
    Command,
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    ReactionsDisabled,
    UnmappedChannel,
    UnmappedRoom,
    UnknownPort,
    DetectionSensorDisabled,
    OriginalNotFound,
    NoText,
    ChatSendFailed,
    BeforeStartup,
    OwnMessage,
    Suppressed,
    LocalMeshnetLoop,
    BroadcastDisabled,
    QueueRejected,
}

pub struct RelayProtocol {
    config: Arc<Config>,
    chat: Arc<dyn ChatClient>,
    queue: OutboundQueue,
    radio: Arc<dyn TransportSource>,
    store: Option<MessageStore>,
    plugins: PluginRegistry,
    started_at: DateTime<Utc>,
}

impl RelayProtocol {
    pub fn new(
        config: Arc<Config>,
        chat: Arc<dyn ChatClient>,
        queue: OutboundQueue,
        radio: Arc<dyn TransportSource>,
        store: Option<MessageStore>,
        plugins: PluginRegistry,
    ) -> Self {
        Self {
            config,
            chat,
            queue,
            radio,
            store,
            plugins,
            started_at: Utc::now(),
        }
    }

    /// Chat events at or before `ts` are treated as history.
    pub fn with_start_time(mut self, ts: DateTime<Utc>) -> Self {
        self.started_at = ts;
        self
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    fn local_meshnet(&self) -> &str {
        self.config.meshnet_name()
    }

    fn storage_enabled(&self) -> bool {
        self.config.interactions().storage_enabled()
    }

    fn plugin_ctx(&self) -> PluginContext<'_> {
        PluginContext {
            chat: self.chat.as_ref(),
            queue: &self.queue,
            store: self.store.as_ref(),
        }
    }

    fn transport(&self) -> Option<Arc<dyn RadioTransport>> {
        self.radio.ready_transport()
    }

    /// Copy the transport's node table into the name cache.
    pub fn refresh_node_names(&self) -> usize {
        let (Some(store), Some(transport)) = (self.store.as_ref(), self.transport()) else {
            return 0;
        };
        match store.update_names_from_nodes(&transport.nodes()) {
            Ok(n) => {
                debug!("Refreshed {} node names from radio", n);
                n
            }
            Err(e) => {
                error!("Failed to refresh node names: {}", e);
                0
            }
        }
    }

    // ---- radio -> matrix ----

    pub async fn handle_radio_packet(&self, packet: &MeshPacket) -> InboundOutcome {
        let outcome = self.relay_radio_packet(packet).await;
        match &outcome {
            InboundOutcome::Dropped(reason) => debug!("Radio packet {} not relayed: {:?}", packet.id, reason),
            other => debug!("Radio packet {} -> {:?}", packet.id, other),
        }
        outcome
    }

    async fn relay_radio_packet(&self, packet: &MeshPacket) -> InboundOutcome {
        let interactions = self.config.interactions();
        if packet.port == PortNum::TextMessage && packet.emoji && !interactions.reactions {
            return InboundOutcome::Dropped(DropReason::ReactionsDisabled);
        }
        let text = match packet.text.as_deref() {
            Some(t) => t,
            None => return self.offer_non_text(packet).await,
        };
        info!("Received radio message: {}", escape_log(text));

        let channel = match packet.channel {
            Some(c) => c,
            None => match packet.port {
                PortNum::TextMessage | PortNum::DetectionSensor => 0,
                PortNum::Other(n) => {
                    debug!("Unknown port {}, cannot determine channel", n);
                    return InboundOutcome::Dropped(DropReason::UnknownPort);
                }
            },
        };
        if !self.config.channel_is_mapped(channel) {
            debug!("Skipping message from unmapped channel {}", channel);
            return InboundOutcome::Dropped(DropReason::UnmappedChannel);
        }

        if let Some(reply_id) = packet.reply_id {
            if packet.emoji && interactions.reactions {
                return self.relay_radio_reaction(packet, reply_id, text).await;
            }
            if !packet.emoji && interactions.replies {
                return self.relay_radio_reply(packet, reply_id, text).await;
            }
        }

        if packet.port == PortNum::DetectionSensor && !self.config.meshtastic.detection_sensor {
            return InboundOutcome::Dropped(DropReason::DetectionSensorDisabled);
        }

        let (longname, shortname) = self.sender_names(packet);
        let meshnet = self.local_meshnet();
        let prefix = chat_prefix(&self.config.matrix, &longname, &shortname, meshnet);
        let formatted = format!("{prefix}{text}");

        let ctx = self.plugin_ctx();
        let handled = self
            .plugins
            .dispatch_radio(&ctx, packet, &formatted, &longname, meshnet)
            .await;

        let my_id = self.transport().and_then(|t| t.my_node_id());
        if classify_destination(packet.to, my_id) == Destination::Direct {
            debug!("Direct message from {}, not relaying to Matrix", longname);
            return InboundOutcome::DirectMessage;
        }
        if let Some(name) = handled {
            return InboundOutcome::HandledByPlugin(name);
        }

        info!("Relaying radio message from {} to Matrix", longname);
        let meta = RelayMetadata {
            longname: longname.clone(),
            shortname: shortname.clone(),
            meshnet: meshnet.to_string(),
            portnum: Some(packet.port.name()),
            mesh_id: Some(packet.id),
            text: Some(text.to_string()),
            ..Default::default()
        };
        let mut relayed = 0;
        for room in self.config.rooms_for_channel(channel) {
            let content = ChatContent::new(MessageType::Text, formatted.clone(), meta.clone());
            if let Some(event_id) = self.send_to_room(&room.id, content).await {
                relayed += 1;
                metrics::record_relay_to_chat(&room.id);
                self.remember(MessageMapping {
                    mesh_id: Some(packet.id),
                    event_id,
                    room_id: room.id.clone(),
                    text: text.to_string(),
                    meshnet: meshnet.to_string(),
                });
            }
        }
        if relayed == 0 {
            InboundOutcome::Dropped(DropReason::ChatSendFailed)
        } else {
            InboundOutcome::Relayed(relayed)
        }
    }

    async fn offer_non_text(&self, packet: &MeshPacket) -> InboundOutcome {
        let ctx = self.plugin_ctx();
        match self.plugins.dispatch_radio(&ctx, packet, "", "", "").await {
            Some(name) => {
                debug!("Processed {} with plugin {}", packet.port.name(), name);
                InboundOutcome::HandledByPlugin(name)
            }
            None => InboundOutcome::Dropped(DropReason::NoText),
        }
    }

    async fn relay_radio_reaction(&self, packet: &MeshPacket, reply_id: u32, text: &str) -> InboundOutcome {
        let Some(orig) = self.lookup_mesh_id(reply_id) else {
            debug!("Original message for reaction to {} not found", reply_id);
            return InboundOutcome::Dropped(DropReason::OriginalNotFound);
        };
        let (longname, shortname) = self.sender_names(packet);
        let meshnet = self.local_meshnet();
        let prefix = chat_prefix(&self.config.matrix, &longname, &shortname, meshnet);
        let symbol = match text.trim() {
            "" => UNKNOWN_REACTION,
            s => s,
        };
        let body = format!(
            "\n {prefix}reacted {symbol} to \"{}\"",
            abbreviate(&orig.text, PREVIEW_CHARS)
        );
        let meta = RelayMetadata {
            longname,
            shortname,
            meshnet: meshnet.to_string(),
            portnum: Some(packet.port.name()),
            mesh_id: Some(packet.id),
            reply_id: Some(reply_id),
            text: Some(orig.text.clone()),
            emoji: Some(1),
        };
        let content = ChatContent::new(MessageType::Emote, body, meta);
        match self.send_to_room(&orig.room_id, content).await {
            Some(_) => {
                metrics::record_relay_to_chat(&orig.room_id);
                InboundOutcome::Reaction
            }
            None => InboundOutcome::Dropped(DropReason::ChatSendFailed),
        }
    }

    async fn relay_radio_reply(&self, packet: &MeshPacket, reply_id: u32, text: &str) -> InboundOutcome {
        let Some(orig) = self.lookup_mesh_id(reply_id) else {
            debug!("Original message for reply to {} not found", reply_id);
            return InboundOutcome::Dropped(DropReason::OriginalNotFound);
        };
        let (longname, shortname) = self.sender_names(packet);
        let meshnet = self.local_meshnet();
        let prefix = chat_prefix(&self.config.matrix, &longname, &shortname, meshnet);
        let formatted = format!("{prefix}{text}");
        let quoted = format!(
            "> <{}> [{}/{}]: {}\n\n{}",
            self.chat.user_id(),
            longname,
            orig.meshnet,
            orig.text,
            formatted
        );
        info!("Relaying radio reply from {} to Matrix", longname);
        let meta = RelayMetadata {
            longname,
            shortname,
            meshnet: meshnet.to_string(),
            portnum: Some(packet.port.name()),
            mesh_id: Some(packet.id),
            reply_id: Some(reply_id),
            text: Some(text.to_string()),
            emoji: None,
        };
        let content = ChatContent::new(MessageType::Text, quoted, meta).in_reply_to(orig.event_id.clone());
        match self.send_to_room(&orig.room_id, content).await {
            Some(event_id) => {
                metrics::record_relay_to_chat(&orig.room_id);
                self.remember(MessageMapping {
                    mesh_id: Some(packet.id),
                    event_id,
                    room_id: orig.room_id,
                    text: text.to_string(),
                    meshnet: meshnet.to_string(),
                });
                InboundOutcome::Reply
            }
            None => InboundOutcome::Dropped(DropReason::ChatSendFailed),
        }
    }

    /// Long and short name for the sender: name cache first, then the radio's
    /// node table (cached for next time), then the raw node id.
    fn sender_names(&self, packet: &MeshPacket) -> (String, String) {
        let mut longname = None;
        let mut shortname = None;
        if let Some(store) = &self.store {
            longname = store.get_longname(packet.from).unwrap_or_else(|e| {
                warn!("Name cache read failed: {}", e);
                None
            });
            shortname = store.get_shortname(packet.from).ok().flatten();
        }
        if longname.is_none() || shortname.is_none() {
            let node = self
                .transport()
                .and_then(|t| t.nodes().into_iter().find(|n| n.num == packet.from));
            match node {
                Some(node) => {
                    if longname.is_none() {
                        if let Some(name) = node.long_name.filter(|n| !n.is_empty()) {
                            if let Some(store) = &self.store {
                                if let Err(e) = store.save_longname(packet.from, &name) {
                                    warn!("Failed to cache long name: {}", e);
                                }
                            }
                            longname = Some(name);
                        }
                    }
                    if shortname.is_none() {
                        if let Some(name) = node.short_name.filter(|n| !n.is_empty()) {
                            if let Some(store) = &self.store {
                                if let Err(e) = store.save_shortname(packet.from, &name) {
                                    warn!("Failed to cache short name: {}", e);
                                }
                            }
                            shortname = Some(name);
                        }
                    }
                }
                None => debug!("Node info for sender {} not available yet", packet.from_id),
            }
        }
        let fallback = if packet.from_id.is_empty() {
            packet.from.to_string()
        } else {
            packet.from_id.clone()
        };
        (
            longname.unwrap_or_else(|| fallback.clone()),
            shortname.unwrap_or(fallback),
        )
    }

    fn lookup_mesh_id(&self, mesh_id: u32) -> Option<MessageMapping> {
        let store = self.store.as_ref()?;
        store.get_message_map_by_mesh_id(mesh_id).unwrap_or_else(|e| {
            error!("Message map lookup for mesh id {} failed: {}", mesh_id, e);
            None
        })
    }

    fn lookup_event_id(&self, event_id: &str) -> Option<MessageMapping> {
        let store = self.store.as_ref()?;
        store.get_message_map_by_event_id(event_id).unwrap_or_else(|e| {
            error!("Message map lookup for event {} failed: {}", event_id, e);
            None
        })
    }

    /// Record a radio-to-chat mapping when interactions are on.
    fn remember(&self, mapping: MessageMapping) {
        if !self.storage_enabled() {
            return;
        }
        let Some(store) = &self.store else { return };
        if let Err(e) = store.store_message_map(&mapping) {
            error!("Error storing message map: {}", e);
            return;
        }
        let keep = self.config.database.msg_map.msgs_to_keep;
        if keep > 0 {
            if let Err(e) = store.prune_message_map(keep) {
                error!("Error pruning message map: {}", e);
            }
        }
    }

    async fn send_to_room(&self, room_id: &str, content: ChatContent) -> Option<String> {
        match tokio::time::timeout(ROOM_SEND_TIMEOUT, self.chat.room_send(room_id, content)).await {
            Ok(Ok(event_id)) => {
                debug!("Sent radio message to {} as {}", room_id, event_id);
                Some(event_id)
            }
            Ok(Err(e)) => {
                error!("Error sending message to Matrix room {}: {}", room_id, e);
                None
            }
            Err(_) => {
                error!("Timeout sending message to Matrix room {}", room_id);
                None
            }
        }
    }

    // ---- matrix -> radio ----

    pub async fn handle_chat_message(&self, msg: &ChatMessage) -> OutboundOutcome {
        let outcome = self.relay_chat_message(msg).await;
        match &outcome {
            OutboundOutcome::Dropped(reason) => debug!("Chat event {} not relayed: {:?}", msg.event_id, reason),
            other => debug!("Chat event {} -> {:?}", msg.event_id, other),
        }
        outcome
    }

    async fn relay_chat_message(&self, msg: &ChatMessage) -> OutboundOutcome {
        if msg.timestamp <= self.started_at {
            return OutboundOutcome::Dropped(DropReason::BeforeStartup);
        }
        if msg.sender == self.chat.user_id() {
            return OutboundOutcome::Dropped(DropReason::OwnMessage);
        }
        let Some(room) = self.config.room(&msg.room_id) else {
            return OutboundOutcome::Dropped(DropReason::UnmappedRoom);
        };
        let channel = room.meshtastic_channel;
        if msg.suppress {
            return OutboundOutcome::Dropped(DropReason::Suppressed);
        }

        let interactions = self.config.interactions();
        let is_reaction = matches!(msg.kind, ChatEventKind::Reaction { .. }) || self.is_remote_reaction_emote(msg);
        if is_reaction && !interactions.reactions {
            return OutboundOutcome::Dropped(DropReason::ReactionsDisabled);
        }
        if is_reaction {
            return self.relay_chat_reaction(msg, channel).await;
        }

        let text = msg.body.trim();
        if interactions.replies {
            if let Some(target) = msg.in_reply_to.as_deref() {
                if let Some(orig) = self.lookup_event_id(target) {
                    return self.relay_chat_reply(msg, channel, text, orig).await;
                }
                debug!("Original message for reply {} not found, relaying as message", target);
            }
        }

        let budget = self.config.meshtastic.message_truncate_bytes;
        let local = self.local_meshnet();
        let (display, full_message, text) = match &msg.relay_meta {
            Some(meta) if !meta.longname.is_empty() && !meta.meshnet.is_empty() => {
                if meta.meshnet == local {
                    metrics::inc_loops_suppressed();
                    return OutboundOutcome::Dropped(DropReason::LocalMeshnetLoop);
                }
                info!("Processing message from remote meshnet: {}", meta.meshnet);
                let shortname = if meta.shortname.is_empty() {
                    shortname_fallback(&meta.longname)
                } else {
                    meta.shortname.clone()
                };
                let original_prefix = chat_prefix(&self.config.matrix, &meta.longname, &shortname, &meta.meshnet);
                let stripped = match text.strip_prefix(original_prefix.as_str()) {
                    Some(rest) if !original_prefix.is_empty() => rest,
                    _ => text,
                };
                let stripped = truncate_bytes(stripped, budget);
                let prefix = chat_prefix(
                    &self.config.matrix,
                    &meta.longname,
                    &shortname,
                    &meshnet_abbrev(&meta.meshnet),
                );
                (
                    format!("{}/{}", meta.longname, meta.meshnet),
                    format!("{prefix}{stripped}"),
                    stripped,
                )
            }
            _ => {
                let display = self.display_name(msg).await;
                let prefix = radio_prefix(&self.config.meshtastic, &display, Some(&msg.sender));
                (display, format!("{prefix}{text}"), truncate_bytes(text, budget))
            }
        };
        if text.is_empty() {
            return OutboundOutcome::Dropped(DropReason::NoText);
        }
        let full_message = truncate_bytes(&full_message, budget);
        debug!("Processing matrix message from [{}]: {}", display, escape_log(&text));

        let ctx = self.plugin_ctx();
        if let Some(name) = self.plugins.dispatch_chat(&ctx, msg, &full_message).await {
            info!("Processed command with plugin {} from {}", name, msg.sender);
            return OutboundOutcome::HandledByPlugin(name);
        }
        let bot_name = self.chat.bot_name();
        if self.plugins.is_command(&msg.body, self.chat.user_id(), bot_name.as_deref()) {
            debug!("Message is a command, not sending to mesh");
            return OutboundOutcome::Command;
        }

        if !self.config.meshtastic.broadcast_enabled {
            debug!("Broadcast not enabled: message from {} dropped", display);
            return OutboundOutcome::Dropped(DropReason::BroadcastDisabled);
        }

        let portnum = msg
            .relay_meta
            .as_ref()
            .and_then(|m| m.portnum.as_deref())
            .and_then(PortNum::from_name);
        let queued = if portnum == Some(PortNum::DetectionSensor) {
            if !self.config.meshtastic.detection_sensor {
                return OutboundOutcome::Dropped(DropReason::DetectionSensorDisabled);
            }
            let data = full_message.into_bytes();
            self.queue.enqueue(
                Box::new(move |t: &dyn RadioTransport| t.send_data(&data, PortNum::DetectionSensor, channel).map(Some)),
                format!("Detection sensor data from {display}"),
                None,
            )
        } else {
            let hint = self.mapping_hint(msg, &text);
            self.queue.enqueue_text(
                full_message,
                channel,
                BROADCAST_ADDR,
                describe(&format!("Message from {display}"), &text),
                hint,
            )
        };
        if !queued {
            error!("Failed to relay message to Meshtastic");
            return OutboundOutcome::Dropped(DropReason::QueueRejected);
        }
        metrics::record_relay_to_radio(&msg.room_id);
        info!(
            "Relaying message from {} to radio broadcast (queued: {})",
            display,
            self.queue.size()
        );
        OutboundOutcome::Queued
    }

    /// `m.emote` posted by a peer relay for a reaction on another meshnet.
    fn is_remote_reaction_emote(&self, msg: &ChatMessage) -> bool {
        msg.kind == ChatEventKind::Emote
            && msg.relay_meta.as_ref().is_some_and(|m| {
                !m.meshnet.is_empty() && m.meshnet != self.local_meshnet() && m.reply_id.is_some()
            })
    }

    async fn relay_chat_reaction(&self, msg: &ChatMessage, channel: u32) -> OutboundOutcome {
        if !self.config.meshtastic.broadcast_enabled {
            return OutboundOutcome::Dropped(DropReason::BroadcastDisabled);
        }
        match &msg.kind {
            ChatEventKind::Reaction { key, target_event } => {
                let Some(orig) = self.lookup_event_id(target_event) else {
                    debug!("Original message for reaction not found, not forwarding");
                    return OutboundOutcome::Dropped(DropReason::OriginalNotFound);
                };
                let display = self.display_name(msg).await;
                let prefix = radio_prefix(&self.config.meshtastic, &display, None);
                let body = format!("{prefix}reacted {key} to \"{}\"", preview(&orig.text));
                let reply_id = orig.mesh_id;
                let queued = self.queue.enqueue(
                    Box::new(move |t: &dyn RadioTransport| match reply_id {
                        Some(id) => t.send_reply(&body, id, channel).map(Some),
                        None => t.send_text(&body, channel, BROADCAST_ADDR).map(Some),
                    }),
                    format!("Local reaction from {display}"),
                    None,
                );
                self.reaction_queued(queued, msg)
            }
            _ => {
                let Some(meta) = msg.relay_meta.as_ref() else {
                    return OutboundOutcome::Dropped(DropReason::OriginalNotFound);
                };
                info!("Relaying reaction from remote meshnet: {}", meta.meshnet);
                let emoji = parse_emote_reaction(&msg.body);
                let shortname = if !meta.shortname.is_empty() {
                    meta.shortname.clone()
                } else if !meta.longname.is_empty() {
                    shortname_fallback(&meta.longname)
                } else {
                    "???".to_string()
                };
                let body = format!(
                    "{}/{} reacted {} to \"{}\"",
                    shortname,
                    meshnet_abbrev(&meta.meshnet),
                    emoji,
                    preview(meta.text.as_deref().unwrap_or(""))
                );
                let queued = self.queue.enqueue_text(
                    body,
                    channel,
                    BROADCAST_ADDR,
                    format!("Remote reaction from {}", meta.meshnet),
                    None,
                );
                self.reaction_queued(queued, msg)
            }
        }
    }

    fn reaction_queued(&self, queued: bool, msg: &ChatMessage) -> OutboundOutcome {
        if queued {
            metrics::record_relay_to_radio(&msg.room_id);
            OutboundOutcome::ReactionQueued
        } else {
            error!("Failed to relay reaction to Meshtastic");
            OutboundOutcome::Dropped(DropReason::QueueRejected)
        }
    }

    async fn relay_chat_reply(&self, msg: &ChatMessage, channel: u32, text: &str, orig: MessageMapping) -> OutboundOutcome {
        if !self.config.meshtastic.broadcast_enabled {
            return OutboundOutcome::Dropped(DropReason::BroadcastDisabled);
        }
        let display = self.display_name(msg).await;
        let prefix = radio_prefix(&self.config.meshtastic, &display, Some(&msg.sender));
        let budget = self.config.meshtastic.message_truncate_bytes;
        let reply = truncate_bytes(&format!("{prefix}{}", strip_quoted_lines(text)), budget);
        let hint = self.mapping_hint(msg, text);
        info!("Relaying Matrix reply from {} to radio", display);
        let queued = match orig.mesh_id {
            Some(reply_id) => self.queue.enqueue(
                Box::new(move |t: &dyn RadioTransport| t.send_reply(&reply, reply_id, channel).map(Some)),
                format!("Reply from {display} to message {reply_id}"),
                hint,
            ),
            None => self.queue.enqueue_text(
                reply,
                channel,
                BROADCAST_ADDR,
                format!("Reply from {display} (regular message)"),
                hint,
            ),
        };
        if !queued {
            error!("Failed to relay reply to Meshtastic");
            return OutboundOutcome::Dropped(DropReason::QueueRejected);
        }
        metrics::record_relay_to_radio(&msg.room_id);
        OutboundOutcome::ReplyQueued
    }

    fn mapping_hint(&self, msg: &ChatMessage, text: &str) -> Option<MappingHint> {
        if !self.storage_enabled() || self.store.is_none() {
            return None;
        }
        Some(MappingHint {
            event_id: msg.event_id.clone(),
            room_id: msg.room_id.clone(),
            text: text.to_string(),
            meshnet: self.local_meshnet().to_string(),
        })
    }

    async fn display_name(&self, msg: &ChatMessage) -> String {
        self.chat
            .display_name(&msg.room_id, &msg.sender)
            .await
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| msg.sender.clone())
    }
}

/// Single-line preview of stored text for reaction messages.
fn preview(text: &str) -> String {
    let flat = strip_quoted_lines(text).replace(['\n', '\r'], " ");
    abbreviate(&flat, PREVIEW_CHARS)
}

/// Emoji from a peer relay's `... reacted 👍 to "..."` emote.
fn parse_emote_reaction(body: &str) -> String {
    body.find("reacted ")
        .map(|i| &body[i + "reacted ".len()..])
        .and_then(|rest| rest.find(" to").map(|j| rest[..j].trim()))
        .filter(|s| !s.is_empty())
        .unwrap_or("?")
        .to_string()
}
