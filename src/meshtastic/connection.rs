//! Radio connection lifecycle.
//!
//! [`ConnectionManager`] is the only owner of the transport and of
//! [`ConnectionState`]. It runs as one task:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connecting ...
//!                      \-> Reconnecting (handshake failed)
//! any state    -> ShuttingDown
//! ```
//!
//! Everything else talks to it through a [`ConnectionHandle`]: reading state,
//! borrowing the live transport, reporting a lost connection (from any thread),
//! or asking it to shut down. Reports arrive as [`ControlMessage`]s on one
//! channel, so at most one reconnect is ever pending.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};

use super::queue::TransportSource;
use super::{ConnectionLostSink, ControlMessage, PacketSink, RadioConnector, RadioTransport, TransportError};
use crate::config::{ConnectionType, MeshtasticConfig};
use crate::metrics;

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub connection_type: ConnectionType,
    pub backoff: Duration,
    /// Consecutive failed connects before giving up; 0 retries forever.
    pub retry_limit: u32,
    pub health_check_enabled: bool,
    pub heartbeat_interval: Duration,
    pub close_timeout: Duration,
}

impl ConnectionSettings {
    pub fn from_config(cfg: &MeshtasticConfig) -> Self {
        Self {
            connection_type: cfg.connection_type,
            backoff: Duration::from_secs(cfg.reconnect.backoff_seconds),
            retry_limit: cfg.reconnect.retry_limit,
            health_check_enabled: cfg.health_check.enabled,
            heartbeat_interval: Duration::from_secs(cfg.health_check.heartbeat_interval),
            close_timeout: Duration::from_secs(cfg.reconnect.close_timeout_seconds),
        }
    }

    /// BLE transports report disconnects themselves.
    fn polls_health(&self) -> bool {
        self.health_check_enabled
            && self.connection_type != ConnectionType::Ble
            && !self.heartbeat_interval.is_zero()
    }
}

struct Inner {
    state_tx: watch::Sender<ConnectionState>,
    transport: RwLock<Option<Arc<dyn RadioTransport>>>,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
}

/// Shared read access to the connection plus the two signals other parts of
/// the relay may raise.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle").field("state", &self.state()).finish()
    }
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// The live transport, only while connected.
    pub fn transport(&self) -> Option<Arc<dyn RadioTransport>> {
        if self.state() != ConnectionState::Connected {
            return None;
        }
        match self.inner.transport.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn my_node_id(&self) -> Option<u32> {
        self.transport().and_then(|t| t.my_node_id())
    }

    /// Safe from any thread, including transport callbacks.
    pub fn report_connection_lost(&self, source: &str) {
        let _ = self.inner.control_tx.send(ControlMessage::ConnectionLost {
            source: source.to_string(),
        });
    }

    pub fn connection_lost_sink(&self) -> ConnectionLostSink {
        ConnectionLostSink::new(self.inner.control_tx.clone())
    }

    pub fn shutdown(&self) {
        let _ = self.inner.control_tx.send(ControlMessage::Shutdown);
    }
}

impl TransportSource for ConnectionHandle {
    fn ready_transport(&self) -> Option<Arc<dyn RadioTransport>> {
        self.transport()
    }
}

enum ConnectOutcome {
    Connected(Arc<dyn RadioTransport>),
    Failed(String),
    Shutdown,
}

enum SessionEnd {
    Lost(String),
    Shutdown,
}

pub struct ConnectionManager {
    connector: Arc<dyn RadioConnector>,
    settings: ConnectionSettings,
    inner: Arc<Inner>,
    control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    packet_sink: PacketSink,
    subscribed_packets: bool,
    subscribed_connection_lost: bool,
    failed_attempts: u32,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn RadioConnector>,
        settings: ConnectionSettings,
        packet_sink: PacketSink,
    ) -> (Self, ConnectionHandle) {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            state_tx,
            transport: RwLock::new(None),
            control_tx,
        });
        let handle = ConnectionHandle { inner: inner.clone() };
        let manager = Self {
            connector,
            settings,
            inner,
            control_rx,
            packet_sink,
            subscribed_packets: false,
            subscribed_connection_lost: false,
            failed_attempts: 0,
        };
        (manager, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Drive the lifecycle until shutdown.
    pub async fn run(mut self) {
        info!(
            "Starting radio connection manager ({})",
            self.settings.connection_type.as_str()
        );
        loop {
            self.set_state(ConnectionState::Connecting);
            match self.connect_once().await {
                ConnectOutcome::Shutdown => break,
                ConnectOutcome::Connected(transport) => {
                    self.failed_attempts = 0;
                    self.install(transport);
                    match self.supervise().await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(source) => {
                            warn!("Radio connection lost ({}), reconnecting", source);
                            self.set_state(ConnectionState::Reconnecting);
                            self.discard_transport();
                        }
                    }
                }
                ConnectOutcome::Failed(reason) => {
                    self.failed_attempts += 1;
                    warn!(
                        "Radio connect attempt {} failed: {}",
                        self.failed_attempts, reason
                    );
                    let limit = self.settings.retry_limit;
                    if limit > 0 && self.failed_attempts >= limit {
                        error!("Giving up on radio after {} attempts", self.failed_attempts);
                        self.set_state(ConnectionState::Disconnected);
                        self.wait_for_shutdown().await;
                        break;
                    }
                    self.set_state(ConnectionState::Reconnecting);
                }
            }
            if !self.backoff().await {
                break;
            }
            metrics::inc_reconnect_attempts();
        }
        self.finish().await;
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.inner.state_tx.send_replace(next);
        if prev != next {
            debug!("Radio connection {:?} -> {:?}", prev, next);
        }
    }

    fn transport_slot(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<dyn RadioTransport>>> {
        match self.inner.transport.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn current_transport(&self) -> Option<Arc<dyn RadioTransport>> {
        self.transport_slot().clone()
    }

    async fn connect_once(&mut self) -> ConnectOutcome {
        let connector = self.connector.clone();
        let mut attempt = tokio::task::spawn_blocking(move || connector.connect());
        loop {
            let event = tokio::select! {
                res = &mut attempt => Ok(res),
                msg = self.control_rx.recv() => Err(msg),
            };
            match event {
                Ok(Ok(Ok(transport))) => return ConnectOutcome::Connected(transport),
                Ok(Ok(Err(e))) => return ConnectOutcome::Failed(e.to_string()),
                Ok(Err(join)) => return ConnectOutcome::Failed(join.to_string()),
                Err(Some(ControlMessage::ConnectionLost { source })) => {
                    debug!("Ignoring connection-lost from {} while connecting", source);
                }
                Err(Some(ControlMessage::Shutdown)) | Err(None) => {
                    info!("Shutdown during radio connect, detaching pending attempt");
                    let close_timeout = self.settings.close_timeout;
                    tokio::spawn(async move {
                        if let Ok(Ok(transport)) = attempt.await {
                            close_transport(transport, close_timeout).await;
                        }
                    });
                    return ConnectOutcome::Shutdown;
                }
            }
        }
    }

    fn install(&mut self, transport: Arc<dyn RadioTransport>) {
        let node = transport.my_node_id();
        *self.transport_slot() = Some(transport);
        self.set_state(ConnectionState::Connected);
        if !self.subscribed_packets {
            self.connector.subscribe_packets(self.packet_sink.clone());
            self.subscribed_packets = true;
        }
        if !self.subscribed_connection_lost {
            self.connector
                .subscribe_connection_lost(ConnectionLostSink::new(self.inner.control_tx.clone()));
            self.subscribed_connection_lost = true;
        }
        match node {
            Some(id) => info!("Connected to radio as !{:08x}", id),
            None => info!("Connected to radio"),
        }
    }

    /// Close the dead transport in the background.
    fn discard_transport(&mut self) {
        if let Some(transport) = self.transport_slot().take() {
            let close_timeout = self.settings.close_timeout;
            tokio::spawn(close_transport(transport, close_timeout));
        }
    }

    async fn supervise(&mut self) -> SessionEnd {
        let period = self.settings.heartbeat_interval.max(Duration::from_millis(1));
        let first_tick = Instant::now().checked_add(period);
        let mut polls = self.settings.polls_health();
        if polls && first_tick.is_none() {
            warn!("Heartbeat interval {:?} is out of range, health checks disabled", period);
            polls = false;
        }
        let mut ticker = interval_at(first_tick.unwrap_or_else(Instant::now), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let control = tokio::select! {
                msg = self.control_rx.recv() => Some(msg),
                _ = ticker.tick(), if polls => None,
            };
            match control {
                Some(Some(ControlMessage::ConnectionLost { source })) => return SessionEnd::Lost(source),
                Some(Some(ControlMessage::Shutdown)) | Some(None) => return SessionEnd::Shutdown,
                None => {
                    if let Some(end) = self.probe().await {
                        return end;
                    }
                }
            }
        }
    }

    /// One health check. `None` means the radio answered.
    async fn probe(&mut self) -> Option<SessionEnd> {
        let transport = match self.current_transport() {
            Some(t) => t,
            None => return Some(SessionEnd::Lost("transport missing".into())),
        };
        let check = timeout(
            HEALTH_CHECK_TIMEOUT,
            tokio::task::spawn_blocking(move || transport.health_check()),
        );
        let event = tokio::select! {
            res = check => Ok(res),
            msg = self.control_rx.recv() => Err(msg),
        };
        let failure = match event {
            Ok(Ok(Ok(Ok(())))) => {
                debug!("Radio health check ok");
                return None;
            }
            Ok(Ok(Ok(Err(e)))) => e.to_string(),
            Ok(Ok(Err(join))) => join.to_string(),
            Ok(Err(_)) => TransportError::Timeout(HEALTH_CHECK_TIMEOUT).to_string(),
            Err(Some(ControlMessage::ConnectionLost { source })) => return Some(SessionEnd::Lost(source)),
            Err(Some(ControlMessage::Shutdown)) | Err(None) => return Some(SessionEnd::Shutdown),
        };
        metrics::inc_health_check_failures();
        warn!("Radio health check failed: {}", failure);
        Some(SessionEnd::Lost("health check".into()))
    }

    /// Wait out one backoff period. Further connection-lost reports are
    /// absorbed; returns false on shutdown.
    async fn backoff(&mut self) -> bool {
        info!("Reconnecting to radio in {}s", self.settings.backoff.as_secs_f64());
        let timer = sleep(self.settings.backoff);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = &mut timer => return true,
                msg = self.control_rx.recv() => match msg {
                    Some(ControlMessage::ConnectionLost { source }) => {
                        debug!("Reconnect already scheduled, ignoring connection-lost from {}", source);
                    }
                    Some(ControlMessage::Shutdown) | None => return false,
                },
            }
        }
    }

    async fn wait_for_shutdown(&mut self) {
        while let Some(msg) = self.control_rx.recv().await {
            if msg == ControlMessage::Shutdown {
                break;
            }
        }
    }

    async fn finish(&mut self) {
        self.set_state(ConnectionState::ShuttingDown);
        let transport = self.transport_slot().take();
        if let Some(transport) = transport {
            close_transport(transport, self.settings.close_timeout).await;
        }
        info!("Radio connection manager stopped");
    }
}

async fn close_transport(transport: Arc<dyn RadioTransport>, limit: Duration) {
    match timeout(limit, tokio::task::spawn_blocking(move || transport.close())).await {
        Ok(Ok(Ok(()))) => debug!("Radio transport closed"),
        Ok(Ok(Err(e))) => warn!("Error closing radio transport: {}", e),
        Ok(Err(e)) => warn!("Radio close task failed: {}", e),
        Err(_) => warn!("Timed out closing radio transport after {}s", limit.as_secs()),
    }
}
