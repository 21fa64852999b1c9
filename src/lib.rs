//! # meshrelay - Meshtastic to Matrix relay engine
//!
//! meshrelay bridges a Meshtastic radio mesh and one or more Matrix rooms.
//! Text heard on a mapped radio channel is posted to the rooms mapped to that
//! channel; messages in those rooms are sent back out over the radio, paced so
//! the mesh is not flooded.
//!
//! ## Features
//!
//! - **Channel/room mapping**: each Matrix room maps to one radio channel; a
//!   channel may feed several rooms.
//! - **Reactions and replies**: an identity map ties radio packet ids to Matrix
//!   event ids so tapbacks and threaded replies survive the crossing.
//! - **Multi-relay meshes**: relay metadata on every posted event lets peer
//!   relays on other meshnets share a room without echo loops.
//! - **Rate-limited sending**: one outbound queue, at least two seconds
//!   between radio transmissions.
//! - **Connection supervision**: reconnect with backoff and periodic health
//!   probes for serial and TCP radios.
//! - **Plugins**: prioritized hooks that can consume traffic in either
//!   direction before it is relayed.
//!
//! ## Module Organization
//!
//! - [`config`] - TOML configuration, defaults and validation
//! - [`format`] - prefix templates, byte-budget truncation, command matching
//! - [`meshtastic`] - radio transport seam, connection manager, outbound queue
//! - [`matrix`] - chat client seam and Matrix content types
//! - [`storage`] - sled-backed name cache, message map and plugin data
//! - [`plugins`] - plugin trait and registry
//! - [`relay`] - the relay protocol and the service loop that drives it
//! - [`metrics`] - process-wide counters
//! - [`logutil`] - single-line log helpers
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ChatMessage   ┌───────────────┐   SendAction   ┌──────────────┐
//! │ Matrix side  │ ──────────────▶ │ RelayProtocol │ ─────────────▶ │ OutboundQueue│
//! │ (ChatClient) │ ◀────────────── │   + plugins   │                └──────┬───────┘
//! └──────────────┘   room_send     └───────▲───────┘                       │
//!                                          │ MeshPacket                    ▼
//!                                  ┌───────┴────────┐  RadioTransport ┌──────────┐
//!                                  │ConnectionManager│ ◀────────────── │  radio   │
//!                                  └────────────────┘                  └──────────┘
//! ```
//!
//! The Matrix session and the radio library are supplied by the embedding
//! application through [`matrix::ChatClient`] and
//! [`meshtastic::RadioConnector`].

pub mod config;
pub mod format;
pub mod logutil;
pub mod matrix;
pub mod meshtastic;
pub mod metrics;
pub mod plugins;
pub mod relay;
pub mod storage;
