//! Test doubles for the radio and Matrix seams plus config fixtures.
#![allow(dead_code)] // each test binary uses a different subset

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use meshrelay::config::{Config, InteractionConfig, RoomMapping};
use meshrelay::matrix::{ChatClient, ChatContent, ChatError, ChatMessage};
use meshrelay::meshtastic::queue::TransportSource;
use meshrelay::meshtastic::{
    ConnectionLostSink, MeshPacket, NodeInfo, PacketSink, PortNum, RadioConnector, RadioTransport,
    TransportError,
};
use meshrelay::plugins::{Plugin, PluginContext};

pub const BOT: &str = "@relay:example.org";
pub const GENERAL: &str = "!general:example.org";
pub const OPS: &str = "!ops:example.org";
pub const LOCAL_MESHNET: &str = "Downtown";
pub const MY_NODE: u32 = 0xA1B2_C3D4;

/// Two rooms on channel 0 and 2, interactions on, fast reconnects.
pub fn test_config(db_path: &std::path::Path) -> Config {
    let mut cfg = Config::default();
    cfg.matrix.bot_user_id = BOT.to_string();
    cfg.matrix_rooms = vec![
        RoomMapping {
            id: GENERAL.to_string(),
            meshtastic_channel: 0,
        },
        RoomMapping {
            id: OPS.to_string(),
            meshtastic_channel: 2,
        },
    ];
    cfg.meshtastic.meshnet_name = LOCAL_MESHNET.to_string();
    cfg.meshtastic.message_interactions = InteractionConfig {
        reactions: true,
        replies: true,
    };
    cfg.meshtastic.reconnect.backoff_seconds = 1;
    cfg.database.path = db_path.to_string_lossy().into_owned();
    cfg.logging.file = None;
    cfg
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text { text: String, channel: u32, destination: u32 },
    Reply { text: String, reply_id: u32, channel: u32 },
    Data { data: Vec<u8>, port: PortNum, channel: u32 },
}

/// Radio that records every send and hands out sequential packet ids.
pub struct MockTransport {
    node_id: Option<u32>,
    next_id: AtomicU32,
    pub sent: Mutex<Vec<Sent>>,
    pub nodes: Mutex<Vec<NodeInfo>>,
    pub healthy: AtomicBool,
    pub health_checks: AtomicUsize,
    pub closed: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            node_id: Some(MY_NODE),
            next_id: AtomicU32::new(1000),
            sent: Mutex::new(Vec::new()),
            nodes: Mutex::new(Vec::new()),
            healthy: AtomicBool::new(true),
            health_checks: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn add_node(&self, num: u32, long: &str, short: &str) {
        self.nodes.lock().unwrap().push(NodeInfo {
            num,
            user_id: format!("!{num:08x}"),
            long_name: Some(long.to_string()),
            short_name: Some(short.to_string()),
        });
    }

    fn record(&self, sent: Sent) -> u32 {
        self.sent.lock().unwrap().push(sent);
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl RadioTransport for MockTransport {
    fn my_node_id(&self) -> Option<u32> {
        self.node_id
    }

    fn send_text(&self, text: &str, channel: u32, destination: u32) -> Result<u32, TransportError> {
        Ok(self.record(Sent::Text {
            text: text.to_string(),
            channel,
            destination,
        }))
    }

    fn send_reply(&self, text: &str, reply_id: u32, channel: u32) -> Result<u32, TransportError> {
        Ok(self.record(Sent::Reply {
            text: text.to_string(),
            reply_id,
            channel,
        }))
    }

    fn send_data(&self, data: &[u8], port: PortNum, channel: u32) -> Result<u32, TransportError> {
        Ok(self.record(Sent::Data {
            data: data.to_vec(),
            port,
            channel,
        }))
    }

    fn nodes(&self) -> Vec<NodeInfo> {
        self.nodes.lock().unwrap().clone()
    }

    fn health_check(&self) -> Result<(), TransportError> {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Unhealthy("no metadata".into()))
        }
    }

    fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Always hands out the same transport.
pub struct StaticSource(pub Arc<MockTransport>);

impl TransportSource for StaticSource {
    fn ready_transport(&self) -> Option<Arc<dyn RadioTransport>> {
        Some(self.0.clone())
    }
}

/// Radio that never connects.
pub struct Offline;

impl TransportSource for Offline {
    fn ready_transport(&self) -> Option<Arc<dyn RadioTransport>> {
        None
    }
}

/// Connector that counts attempts and keeps the sinks it was given.
pub struct MockConnector {
    pub transport: Arc<MockTransport>,
    pub connects: AtomicUsize,
    pub fail: AtomicBool,
    pub packet_subscriptions: AtomicUsize,
    pub packet_sink: Mutex<Option<PacketSink>>,
    pub lost_sink: Mutex<Option<ConnectionLostSink>>,
    gate: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
}

impl MockConnector {
    pub fn new(transport: Arc<MockTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            connects: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            packet_subscriptions: AtomicUsize::new(0),
            packet_sink: Mutex::new(None),
            lost_sink: Mutex::new(None),
            gate: Mutex::new(None),
        })
    }

    /// Make the next `connect` block until the returned sender fires.
    pub fn hold_next_connect(&self) -> std::sync::mpsc::Sender<()> {
        let (tx, rx) = std::sync::mpsc::channel();
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Push a packet the way the radio library callback would.
    pub fn deliver(&self, packet: MeshPacket) -> bool {
        match self.packet_sink.lock().unwrap().as_ref() {
            Some(sink) => {
                sink.deliver(packet);
                true
            }
            None => false,
        }
    }
}

impl RadioConnector for MockConnector {
    fn connect(&self) -> Result<Arc<dyn RadioTransport>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("device busy".into()));
        }
        Ok(self.transport.clone())
    }

    fn subscribe_packets(&self, sink: PacketSink) {
        self.packet_subscriptions.fetch_add(1, Ordering::SeqCst);
        *self.packet_sink.lock().unwrap() = Some(sink);
    }

    fn subscribe_connection_lost(&self, sink: ConnectionLostSink) {
        *self.lost_sink.lock().unwrap() = Some(sink);
    }
}

/// Matrix session that records posts and returns `$evN` ids.
pub struct MockChat {
    pub posts: Mutex<Vec<(String, ChatContent)>>,
    pub display_names: Mutex<HashMap<String, String>>,
    pub joined: Mutex<Vec<String>>,
    pub fail_sends: AtomicBool,
    next_event: AtomicUsize,
}

impl MockChat {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            posts: Mutex::new(Vec::new()),
            display_names: Mutex::new(HashMap::new()),
            joined: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            next_event: AtomicUsize::new(1),
        })
    }

    pub fn posts(&self) -> Vec<(String, ChatContent)> {
        self.posts.lock().unwrap().clone()
    }

    pub fn set_display_name(&self, user: &str, name: &str) {
        self.display_names
            .lock()
            .unwrap()
            .insert(user.to_string(), name.to_string());
    }
}

#[async_trait]
impl ChatClient for MockChat {
    fn user_id(&self) -> &str {
        BOT
    }

    async fn room_send(&self, room_id: &str, content: ChatContent) -> Result<String, ChatError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ChatError::Send("homeserver unavailable".into()));
        }
        let n = self.next_event.fetch_add(1, Ordering::SeqCst);
        self.posts.lock().unwrap().push((room_id.to_string(), content));
        Ok(format!("$ev{n}"))
    }

    async fn display_name(&self, _room_id: &str, user_id: &str) -> Option<String> {
        self.display_names.lock().unwrap().get(user_id).cloned()
    }

    async fn join_room(&self, room_id: &str) -> Result<(), ChatError> {
        self.joined.lock().unwrap().push(room_id.to_string());
        Ok(())
    }
}

/// Plugin that records what it saw and optionally claims it.
pub struct RecordingPlugin {
    pub name: &'static str,
    pub priority: i32,
    pub claim_radio: bool,
    pub claim_chat: bool,
    pub commands: Vec<String>,
    pub radio_seen: Mutex<Vec<String>>,
    pub chat_seen: Mutex<Vec<String>>,
}

impl RecordingPlugin {
    pub fn new(name: &'static str) -> Arc<Self> {
        Self::build(name, false, false, Vec::new())
    }

    pub fn build(name: &'static str, claim_radio: bool, claim_chat: bool, commands: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            name,
            priority: 10,
            claim_radio,
            claim_chat,
            commands,
            radio_seen: Mutex::new(Vec::new()),
            chat_seen: Mutex::new(Vec::new()),
        })
    }

    pub fn radio_seen(&self) -> Vec<String> {
        self.radio_seen.lock().unwrap().clone()
    }

    pub fn chat_seen(&self) -> Vec<String> {
        self.chat_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Plugin for RecordingPlugin {
    fn name(&self) -> &str {
        self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn chat_commands(&self) -> Vec<String> {
        self.commands.clone()
    }

    async fn handle_radio_packet(
        &self,
        _ctx: &PluginContext<'_>,
        _packet: &MeshPacket,
        formatted: &str,
        _longname: &str,
        _meshnet: &str,
    ) -> bool {
        self.radio_seen.lock().unwrap().push(formatted.to_string());
        self.claim_radio
    }

    async fn handle_chat_message(&self, _ctx: &PluginContext<'_>, _msg: &ChatMessage, full_message: &str) -> bool {
        self.chat_seen.lock().unwrap().push(full_message.to_string());
        self.claim_chat
    }
}

/// A relay wired to mocks with a running queue and a temp database.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub chat: Arc<MockChat>,
    pub transport: Arc<MockTransport>,
    pub store: meshrelay::storage::MessageStore,
    pub relay: meshrelay::relay::RelayProtocol,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(|_| {}, Vec::new())
    }

    pub fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        Self::build(tweak, Vec::new())
    }

    /// Must run inside a tokio runtime; the queue starts immediately.
    pub fn build(tweak: impl FnOnce(&mut Config), plugins: Vec<Arc<dyn Plugin>>) -> Self {
        use meshrelay::meshtastic::OutboundQueue;
        use meshrelay::plugins::PluginRegistry;
        use meshrelay::relay::RelayProtocol;
        use meshrelay::storage::MessageStore;

        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(&dir.path().join("relay.db"));
        tweak(&mut cfg);
        let store = MessageStore::open(&cfg.database.path).unwrap();
        let chat = MockChat::new();
        let transport = MockTransport::new();
        let source: Arc<dyn TransportSource> = Arc::new(StaticSource(transport.clone()));
        let queue = OutboundQueue::with_store(source.clone(), store.clone(), cfg.database.msg_map.msgs_to_keep);
        queue.start(cfg.message_delay());
        let mut registry = PluginRegistry::new();
        for plugin in plugins {
            registry.register(plugin);
        }
        let relay = RelayProtocol::new(Arc::new(cfg), chat.clone(), queue, source, Some(store.clone()), registry)
            .with_start_time(chrono::Utc::now() - chrono::Duration::minutes(1));
        Self {
            dir,
            chat,
            transport,
            store,
            relay,
        }
    }

    /// Wait (real time) until the radio has seen `n` sends.
    pub async fn wait_for_sends(&self, n: usize) -> Vec<Sent> {
        for _ in 0..250 {
            let sent = self.transport.sent();
            if sent.len() >= n {
                return sent;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("expected {} radio sends, got {:?}", n, self.transport.sent());
    }
}

/// Poll `check` every 20ms for up to five seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    false
}
