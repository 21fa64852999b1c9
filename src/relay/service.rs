//! Relay runtime: wires the store, radio connection, outbound queue and
//! plugins together and pumps events through [`RelayProtocol`] until shutdown.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # async fn demo(
//! #     connector: Arc<dyn meshrelay::meshtastic::RadioConnector>,
//! #     chat: Arc<dyn meshrelay::matrix::ChatClient>,
//! # ) -> anyhow::Result<()> {
//! use meshrelay::config::Config;
//! use meshrelay::relay::service::RelayService;
//!
//! let config = Config::load("config.toml").await?;
//! let (service, chat_tx) = RelayService::new(config, connector, chat);
//! let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
//! // the Matrix sync loop feeds room events into chat_tx
//! # drop(chat_tx);
//! service.run(stop_rx).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};

use super::RelayProtocol;
use crate::config::Config;
use crate::matrix::{ChatClient, ChatMessage};
use crate::meshtastic::{
    ConnectionHandle, ConnectionManager, ConnectionState, MeshPacket, OutboundQueue, PacketSink, RadioConnector,
};
use crate::meshtastic::connection::ConnectionSettings;
use crate::metrics;
use crate::plugins::{Plugin, PluginRegistry};
use crate::storage::MessageStore;

const MANAGER_STOP_TIMEOUT: Duration = Duration::from_secs(15);

enum Event {
    Packet(MeshPacket),
    Chat(ChatMessage),
    ChatClosed,
    State(ConnectionState),
    Stop(&'static str),
}

pub struct RelayService {
    config: Arc<Config>,
    connector: Arc<dyn RadioConnector>,
    chat: Arc<dyn ChatClient>,
    chat_rx: mpsc::UnboundedReceiver<ChatMessage>,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl RelayService {
    /// Returns the service and the sender the Matrix side pushes room events into.
    pub fn new(
        config: Config,
        connector: Arc<dyn RadioConnector>,
        chat: Arc<dyn ChatClient>,
    ) -> (Self, mpsc::UnboundedSender<ChatMessage>) {
        let (chat_tx, chat_rx) = mpsc::unbounded_channel();
        let service = Self {
            config: Arc::new(config),
            connector,
            chat,
            chat_rx,
            plugins: Vec::new(),
        };
        (service, chat_tx)
    }

    /// Offer a plugin; `[plugins.<name>]` decides whether it is active.
    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    fn open_store(&self) -> Option<MessageStore> {
        let path = &self.config.database.path;
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    warn!("Could not create database directory {}: {}", parent.display(), e);
                }
            }
        }
        match MessageStore::open(path) {
            Ok(store) => Some(store),
            Err(e) => {
                error!("Failed to open database {}: {} (continuing without persistence)", path, e);
                None
            }
        }
    }

    fn wipe_if_configured(&self, store: Option<&MessageStore>, when: &str) {
        if !self.config.database.msg_map.wipe_on_restart {
            return;
        }
        if let Some(store) = store {
            match store.wipe_message_map() {
                Ok(()) => info!("Wiped message map {}", when),
                Err(e) => error!("Failed to wipe message map {}: {}", when, e),
            }
        }
    }

    /// Run until `shutdown` flips to true, Ctrl-C, or the chat stream closes.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.config
            .validate()
            .map_err(|e| anyhow!("Invalid configuration: {}", e))?;
        info!(
            "meshrelay v{} starting for meshnet '{}' ({} rooms)",
            env!("CARGO_PKG_VERSION"),
            self.config.meshnet_name(),
            self.config.matrix_rooms.len()
        );

        let store = self.open_store();
        self.wipe_if_configured(store.as_ref(), "on startup");

        let (packet_sink, mut packet_rx) = PacketSink::channel();
        let settings = ConnectionSettings::from_config(&self.config.meshtastic);
        let (manager, handle) = ConnectionManager::new(self.connector.clone(), settings, packet_sink);
        let manager_task = manager.spawn();

        let source = Arc::new(handle.clone());
        let queue = match &store {
            Some(store) => OutboundQueue::with_store(source.clone(), store.clone(), self.config.database.msg_map.msgs_to_keep),
            None => OutboundQueue::new(source.clone()),
        };
        queue.start(self.config.message_delay());

        let registry = PluginRegistry::from_plugins(std::mem::take(&mut self.plugins), &self.config.plugins);
        if !registry.is_empty() {
            info!("Loaded plugins: {}", registry.names().join(", "));
        }

        for room in &self.config.matrix_rooms {
            if let Err(e) = self.chat.join_room(&room.id).await {
                warn!("Could not join room {}: {}", room.id, e);
            }
        }

        let protocol = RelayProtocol::new(
            self.config.clone(),
            self.chat.clone(),
            queue.clone(),
            source,
            store.clone(),
            registry,
        );
        let mut state_rx = handle.subscribe();
        // registered on first poll and kept across iterations
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        info!("Relay running");

        loop {
            let event = tokio::select! {
                Some(packet) = packet_rx.recv() => Event::Packet(packet),
                msg = self.chat_rx.recv() => match msg {
                    Some(msg) => Event::Chat(msg),
                    None => Event::ChatClosed,
                },
                changed = state_rx.changed() => match changed {
                    Ok(()) => Event::State(*state_rx.borrow_and_update()),
                    Err(_) => Event::Stop("connection manager exited"),
                },
                _ = shutdown.changed() => Event::Stop("shutdown requested"),
                _ = &mut ctrl_c => Event::Stop("received shutdown signal"),
            };
            match event {
                Event::Packet(packet) => {
                    protocol.handle_radio_packet(&packet).await;
                }
                Event::Chat(msg) => {
                    protocol.handle_chat_message(&msg).await;
                }
                Event::State(ConnectionState::Connected) => {
                    info!("Radio connected");
                    protocol.refresh_node_names();
                }
                Event::State(state) => debug!("Radio connection state: {:?}", state),
                Event::ChatClosed => {
                    info!("Chat event stream closed");
                    break;
                }
                Event::Stop(reason) => {
                    info!("Stopping relay: {}", reason);
                    break;
                }
            }
        }

        self.shutdown(queue, handle, manager_task, store).await;
        Ok(())
    }

    async fn shutdown(
        &self,
        queue: OutboundQueue,
        handle: ConnectionHandle,
        manager_task: tokio::task::JoinHandle<()>,
        store: Option<MessageStore>,
    ) {
        info!("Shutting down relay...");
        queue.stop();
        handle.shutdown();
        match tokio::time::timeout(MANAGER_STOP_TIMEOUT, manager_task).await {
            Ok(Ok(())) => debug!("Connection manager stopped"),
            Ok(Err(e)) => error!("Connection manager task failed: {}", e),
            Err(_) => warn!("Connection manager did not stop within {:?}", MANAGER_STOP_TIMEOUT),
        }
        self.wipe_if_configured(store.as_ref(), "on shutdown");
        if let Some(store) = store {
            if let Err(e) = store.flush() {
                warn!("Failed to flush database: {}", e);
            }
        }
        let stats = metrics::snapshot();
        info!(
            "Radio sends: {} queued, {} sent, {} failed, {} rejected, {} abandoned; {} echoes suppressed, {} reconnects",
            stats.jobs_queued,
            stats.jobs_sent,
            stats.jobs_failed,
            stats.jobs_rejected,
            stats.jobs_abandoned,
            stats.loops_suppressed,
            stats.reconnect_attempts
        );
        for (room, counter) in metrics::room_counters_snapshot() {
            debug!("Room {}: {} to chat, {} to radio", room, counter.to_chat, counter.to_radio);
        }
        info!("Relay shutdown complete");
    }
}
