//! # Plugins
//!
//! Plugins see traffic before the default relay does. The registry offers each
//! radio packet and each chat message to plugins in ascending priority order
//! and stops at the first one that reports it handled; a handled message is
//! not relayed.
//!
//! Plugins that keep per-node history get a [`PluginData`] handle scoped to
//! their name, capped at a fixed number of rows per node.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use serde_json::Value;

use crate::config::{PluginConfig, DEFAULT_PLUGIN_PRIORITY};
use crate::format::is_bot_command;
use crate::matrix::{ChatClient, ChatMessage};
use crate::meshtastic::{MeshPacket, OutboundQueue};
use crate::storage::{MessageStore, StoreError};

pub const DEFAULT_MAX_DATA_ROWS_PER_NODE: usize = 100;

/// What a plugin may use while handling a message.
pub struct PluginContext<'a> {
    pub chat: &'a dyn ChatClient,
    pub queue: &'a OutboundQueue,
    pub store: Option<&'a MessageStore>,
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> i32 {
        DEFAULT_PLUGIN_PRIORITY
    }

    /// Chat commands (without `!`) this plugin answers. Messages invoking one
    /// are never relayed to the radio.
    fn chat_commands(&self) -> Vec<String> {
        Vec::new()
    }

    /// Inbound radio packet. `formatted` is the text as it would be relayed.
    async fn handle_radio_packet(
        &self,
        _ctx: &PluginContext<'_>,
        _packet: &MeshPacket,
        _formatted: &str,
        _longname: &str,
        _meshnet: &str,
    ) -> bool {
        false
    }

    /// Inbound chat message. `full_message` includes the relay prefix.
    async fn handle_chat_message(&self, _ctx: &PluginContext<'_>, _msg: &ChatMessage, _full_message: &str) -> bool {
        false
    }
}

struct Entry {
    plugin: Arc<dyn Plugin>,
    priority: i32,
}

/// Active plugins in dispatch order.
#[derive(Default)]
pub struct PluginRegistry {
    entries: Vec<Entry>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from candidate plugins. A `[plugins.<name>]` section with
    /// `active = false` disables that plugin; `priority` overrides its own.
    pub fn from_plugins(plugins: Vec<Arc<dyn Plugin>>, config: &HashMap<String, PluginConfig>) -> Self {
        let mut registry = Self::new();
        for plugin in plugins {
            let section = config.get(plugin.name());
            if section.is_some_and(|c| !c.active) {
                info!("Plugin {} disabled in config", plugin.name());
                continue;
            }
            let priority = section.and_then(|c| c.priority).unwrap_or_else(|| plugin.priority());
            registry.register_with_priority(plugin, priority);
        }
        registry
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        let priority = plugin.priority();
        self.register_with_priority(plugin, priority);
    }

    fn register_with_priority(&mut self, plugin: Arc<dyn Plugin>, priority: i32) {
        debug!("Registered plugin {} (priority {})", plugin.name(), priority);
        self.entries.push(Entry { plugin, priority });
        // stable: equal priorities keep registration order
        self.entries.sort_by_key(|e| e.priority);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.plugin.name()).collect()
    }

    /// Name of the plugin that handled the packet, if any.
    pub async fn dispatch_radio(
        &self,
        ctx: &PluginContext<'_>,
        packet: &MeshPacket,
        formatted: &str,
        longname: &str,
        meshnet: &str,
    ) -> Option<String> {
        for entry in &self.entries {
            if entry
                .plugin
                .handle_radio_packet(ctx, packet, formatted, longname, meshnet)
                .await
            {
                debug!("Radio packet {} handled by plugin {}", packet.id, entry.plugin.name());
                return Some(entry.plugin.name().to_string());
            }
        }
        None
    }

    pub async fn dispatch_chat(&self, ctx: &PluginContext<'_>, msg: &ChatMessage, full_message: &str) -> Option<String> {
        for entry in &self.entries {
            if entry.plugin.handle_chat_message(ctx, msg, full_message).await {
                debug!("Chat event {} handled by plugin {}", msg.event_id, entry.plugin.name());
                return Some(entry.plugin.name().to_string());
            }
        }
        None
    }

    /// True when `body` invokes any registered plugin command.
    pub fn is_command(&self, body: &str, bot_user_id: &str, bot_name: Option<&str>) -> bool {
        self.entries.iter().any(|e| {
            e.plugin
                .chat_commands()
                .iter()
                .any(|cmd| is_bot_command(cmd, body, bot_user_id, bot_name))
        })
    }
}

/// Per-node record lists belonging to one plugin.
#[derive(Debug, Clone)]
pub struct PluginData {
    store: MessageStore,
    plugin: String,
    max_rows: usize,
}

impl PluginData {
    pub fn new(store: MessageStore, plugin: &str, config: Option<&PluginConfig>) -> Self {
        Self {
            store,
            plugin: plugin.to_string(),
            max_rows: config
                .and_then(|c| c.max_data_rows_per_node)
                .unwrap_or(DEFAULT_MAX_DATA_ROWS_PER_NODE),
        }
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    /// Append records for `node`, dropping the oldest beyond the cap.
    pub fn append(&self, node: u32, records: impl IntoIterator<Item = Value>) -> Result<(), StoreError> {
        let mut data = self.store.get_plugin_data(&self.plugin, node)?;
        data.extend(records);
        self.store.store_plugin_data(&self.plugin, node, data, self.max_rows)
    }

    /// Replace all records for `node`.
    pub fn set(&self, node: u32, records: Vec<Value>) -> Result<(), StoreError> {
        self.store.store_plugin_data(&self.plugin, node, records, self.max_rows)
    }

    pub fn get(&self, node: u32) -> Result<Vec<Value>, StoreError> {
        self.store.get_plugin_data(&self.plugin, node)
    }

    pub fn all(&self) -> Result<Vec<(u32, Vec<Value>)>, StoreError> {
        self.store.get_all_plugin_data(&self.plugin)
    }

    pub fn delete(&self, node: u32) -> Result<(), StoreError> {
        self.store.delete_plugin_data(&self.plugin, node)
    }
}
