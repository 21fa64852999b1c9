//! Ctrl-C handling. Kept in its own binary since it signals the test process.
#![cfg(unix)]

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{eventually, test_config, MockConnector, MockTransport, BOT};
use meshrelay::format::BROADCAST_ADDR;
use meshrelay::matrix::{ChatClient, ChatContent, ChatError};
use meshrelay::meshtastic::MeshPacket;
use meshrelay::relay::service::RelayService;
use tokio::sync::{watch, Notify};

/// Chat session whose sends park until released.
struct GatedChat {
    sending: AtomicBool,
    release: Notify,
}

#[async_trait]
impl ChatClient for GatedChat {
    fn user_id(&self) -> &str {
        BOT
    }

    async fn room_send(&self, _room_id: &str, _content: ChatContent) -> Result<String, ChatError> {
        self.sending.store(true, Ordering::SeqCst);
        self.release.notified().await;
        Ok("$ev1".to_string())
    }

    async fn display_name(&self, _room_id: &str, _user_id: &str) -> Option<String> {
        None
    }

    async fn join_room(&self, _room_id: &str) -> Result<(), ChatError> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupt_during_event_handling_stops_the_relay() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir.path().join("relay.db"));
    let transport = MockTransport::new();
    let connector = MockConnector::new(transport.clone());
    let chat = Arc::new(GatedChat {
        sending: AtomicBool::new(false),
        release: Notify::new(),
    });

    let (service, _chat_tx) = RelayService::new(config, connector.clone(), chat.clone());
    let (_stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(service.run(stop_rx));

    // keeps SIGINT from terminating the test binary whatever the relay does
    let _guard = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).unwrap();

    assert!(eventually(|| connector.packet_sink.lock().unwrap().is_some()).await);
    // let the event loop go idle once so every branch has been polled
    tokio::time::sleep(Duration::from_millis(300)).await;
    connector.deliver(MeshPacket::text_message(901, 0x42, BROADCAST_ADDR, 0, "mid-send"));
    assert!(eventually(|| chat.sending.load(Ordering::SeqCst)).await);

    // the event loop is busy inside room_send while the interrupt lands
    let status = std::process::Command::new("kill")
        .args(["-INT", &std::process::id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());
    tokio::time::sleep(Duration::from_millis(200)).await;
    chat.release.notify_one();

    tokio::time::timeout(Duration::from_secs(20), task)
        .await
        .expect("relay ignored the interrupt")
        .unwrap()
        .unwrap();
    assert!(transport.closed.load(Ordering::SeqCst));
}
