//! # Meshtastic Radio Side
//!
//! Types and traits for the radio half of the relay. The wire protocol itself
//! lives in an external transport library; this module describes what the relay
//! needs from it and owns everything around it:
//!
//! - [`queue::OutboundQueue`] serialises every send toward the radio and keeps
//!   the firmware's minimum spacing between sends.
//! - [`connection::ConnectionManager`] runs the connect / health-check /
//!   reconnect lifecycle and hands the live transport to the queue.
//!
//! ## Threading
//!
//! Transport libraries deliver packets and connection-lost notices on their own
//! reader thread. Those callbacks must only ever touch a [`PacketSink`] or a
//! [`ConnectionLostSink`]; both are plain channel senders and safe to use from
//! any thread. The async side picks the events up from the matching receivers.
//!
//! ```rust,no_run
//! use meshrelay::meshtastic::{MeshPacket, PacketSink};
//!
//! fn on_receive(sink: &PacketSink, packet: MeshPacket) {
//!     // called on the transport's reader thread
//!     sink.deliver(packet);
//! }
//! ```

pub mod connection;
pub mod queue;

use std::sync::Arc;
use std::time::Duration;

use log::trace;
use thiserror::Error;
use tokio::sync::mpsc;

pub use connection::{ConnectionHandle, ConnectionManager, ConnectionState};
pub use queue::{MappingHint, OutboundQueue, QueueStatus};

pub const TEXT_MESSAGE_APP: u32 = 1;
pub const DETECTION_SENSOR_APP: u32 = 10;

/// Application port a packet was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortNum {
    TextMessage,
    DetectionSensor,
    Other(u32),
}

impl PortNum {
    pub fn from_u32(n: u32) -> Self {
        match n {
            TEXT_MESSAGE_APP => PortNum::TextMessage,
            DETECTION_SENSOR_APP => PortNum::DetectionSensor,
            other => PortNum::Other(other),
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            PortNum::TextMessage => TEXT_MESSAGE_APP,
            PortNum::DetectionSensor => DETECTION_SENSOR_APP,
            PortNum::Other(n) => *n,
        }
    }

    /// Firmware enum name, used in relay metadata.
    pub fn name(&self) -> String {
        match self {
            PortNum::TextMessage => "TEXT_MESSAGE_APP".to_string(),
            PortNum::DetectionSensor => "DETECTION_SENSOR_APP".to_string(),
            PortNum::Other(n) => format!("PORT_{}", n),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "TEXT_MESSAGE_APP" => Some(PortNum::TextMessage),
            "DETECTION_SENSOR_APP" => Some(PortNum::DetectionSensor),
            other => other
                .strip_prefix("PORT_")
                .and_then(|n| n.parse().ok())
                .map(PortNum::from_u32),
        }
    }
}

/// A decoded packet as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshPacket {
    pub id: u32,
    pub from: u32,
    /// `!xxxxxxxx` form of `from`.
    pub from_id: String,
    pub to: u32,
    /// Absent on some firmware for the primary channel.
    pub channel: Option<u32>,
    pub port: PortNum,
    pub text: Option<String>,
    pub payload: Vec<u8>,
    /// Set when the packet answers or reacts to an earlier packet.
    pub reply_id: Option<u32>,
    /// Set together with `reply_id` for tapback reactions.
    pub emoji: bool,
}

impl MeshPacket {
    pub fn text_message(id: u32, from: u32, to: u32, channel: u32, text: &str) -> Self {
        Self {
            id,
            from,
            from_id: node_id_string(from),
            to,
            channel: Some(channel),
            port: PortNum::TextMessage,
            text: Some(text.to_string()),
            payload: text.as_bytes().to_vec(),
            reply_id: None,
            emoji: false,
        }
    }

    pub fn with_reply(mut self, reply_id: u32, emoji: bool) -> Self {
        self.reply_id = Some(reply_id);
        self.emoji = emoji;
        self
    }

    pub fn is_reaction(&self) -> bool {
        self.reply_id.is_some() && self.emoji
    }

    pub fn is_reply(&self) -> bool {
        self.reply_id.is_some() && !self.emoji
    }
}

pub fn node_id_string(num: u32) -> String {
    format!("!{:08x}", num)
}

/// One entry of the transport's node table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub num: u32,
    pub user_id: String,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("radio is not connected")]
    NotConnected,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("health check failed: {0}")]
    Unhealthy(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A connected radio. Methods block; async callers go through
/// `spawn_blocking` (the outbound queue does this for every send).
pub trait RadioTransport: Send + Sync {
    fn my_node_id(&self) -> Option<u32>;

    /// Send text, returning the packet id assigned by the radio.
    fn send_text(&self, text: &str, channel: u32, destination: u32) -> Result<u32, TransportError>;

    /// Send text that references an earlier packet (reply or reaction).
    fn send_reply(&self, text: &str, reply_id: u32, channel: u32) -> Result<u32, TransportError>;

    fn send_data(&self, data: &[u8], port: PortNum, channel: u32) -> Result<u32, TransportError>;

    fn nodes(&self) -> Vec<NodeInfo>;

    /// Cheap round trip to the device (metadata request).
    fn health_check(&self) -> Result<(), TransportError>;

    fn close(&self) -> Result<(), TransportError>;
}

/// Produces transports and routes the library's callbacks into the relay.
pub trait RadioConnector: Send + Sync + 'static {
    /// Open a transport. Blocks until the handshake completes or fails.
    fn connect(&self) -> Result<Arc<dyn RadioTransport>, TransportError>;

    /// Register the packet callback. Called at most once per process.
    fn subscribe_packets(&self, sink: PacketSink);

    /// Register the connection-lost callback. Called at most once per process.
    fn subscribe_connection_lost(&self, sink: ConnectionLostSink);
}

/// Coordination messages for the connection manager's task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    ConnectionLost { source: String },
    Shutdown,
}

/// Thread-safe entry point for packets coming off the radio.
#[derive(Debug, Clone)]
pub struct PacketSink {
    tx: mpsc::UnboundedSender<MeshPacket>,
}

impl PacketSink {
    pub fn new(tx: mpsc::UnboundedSender<MeshPacket>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<MeshPacket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Safe from any thread. Dropped silently once the relay has stopped.
    pub fn deliver(&self, packet: MeshPacket) {
        if self.tx.send(packet).is_err() {
            trace!("packet dropped: relay no longer listening");
        }
    }
}

/// Thread-safe entry point for the transport's connection-lost callback.
#[derive(Debug, Clone)]
pub struct ConnectionLostSink {
    tx: mpsc::UnboundedSender<ControlMessage>,
}

impl ConnectionLostSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ControlMessage>) -> Self {
        Self { tx }
    }

    pub fn notify(&self, source: &str) {
        let _ = self.tx.send(ControlMessage::ConnectionLost {
            source: source.to_string(),
        });
    }
}
