//! # Storage Module - Relay Persistence
//!
//! Sled-backed store for everything the relay remembers between packets:
//!
//! - **Node names**: last known long and short name for each radio node
//! - **Identity map**: which Matrix event corresponds to which mesh packet, so
//!   reactions and replies can be threaded across the bridge
//! - **Plugin data**: small per-node record lists owned by plugins
//!
//! ## Layout
//!
//! ```text
//! relay_names          long:<node> / short:<node>  -> utf-8 name
//! relay_message_map    <event id>                  -> StoredMapping (bincode)
//! relay_map_order      <seq BE>                    -> <event id>
//! relay_map_by_mesh    <mesh id BE><seq BE>        -> <event id>
//! relay_plugin_data    <plugin>\0<node BE>         -> JSON array
//! ```
//!
//! The event id is the identity map's unique key. Mesh ids are not unique
//! (separate meshnets reuse them), so the mesh index is ordered by insertion
//! and lookups take the newest match.
//!
//! Every write touching more than one tree runs in a single sled transaction.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionError};
use sled::{IVec, Transactional};
use thiserror::Error;

use crate::meshtastic::NodeInfo;

const TREE_NAMES: &str = "relay_names";
const TREE_MESSAGE_MAP: &str = "relay_message_map";
const TREE_MAP_ORDER: &str = "relay_map_order";
const TREE_MAP_BY_MESH: &str = "relay_map_by_mesh";
const TREE_PLUGIN_DATA: &str = "relay_plugin_data";

/// Errors raised by the relay store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("utf-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl From<TransactionError<StoreError>> for StoreError {
    fn from(e: TransactionError<StoreError>) -> Self {
        match e {
            TransactionError::Abort(inner) => inner,
            TransactionError::Storage(s) => StoreError::Sled(s),
        }
    }
}

/// Association between a Matrix event and the mesh packet it mirrors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMapping {
    pub mesh_id: Option<u32>,
    pub event_id: String,
    pub room_id: String,
    pub text: String,
    /// Meshnet the message originated on.
    pub meshnet: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredMapping {
    seq: u64,
    mapping: MessageMapping,
}

#[derive(Clone)]
pub struct MessageStore {
    db: sled::Db,
    path: PathBuf,
    names: sled::Tree,
    message_map: sled::Tree,
    map_order: sled::Tree,
    map_by_mesh: sled::Tree,
    plugin_data: sled::Tree,
    /// Identity map row count, shared by clones so pruning skips a full scan.
    map_rows: Arc<AtomicUsize>,
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore").field("path", &self.path).finish()
    }
}

fn name_key(kind: &str, node: u32) -> Vec<u8> {
    let mut key = kind.as_bytes().to_vec();
    key.push(b':');
    key.extend_from_slice(&node.to_be_bytes());
    key
}

fn mesh_key(mesh_id: u32, seq: u64) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..4].copy_from_slice(&mesh_id.to_be_bytes());
    key[4..].copy_from_slice(&seq.to_be_bytes());
    key
}

fn plugin_prefix(plugin: &str) -> Vec<u8> {
    let mut key = plugin.as_bytes().to_vec();
    key.push(0);
    key
}

fn plugin_key(plugin: &str, node: u32) -> Vec<u8> {
    let mut key = plugin_prefix(plugin);
    key.extend_from_slice(&node.to_be_bytes());
    key
}

fn abort(e: impl Into<StoreError>) -> ConflictableTransactionError<StoreError> {
    ConflictableTransactionError::Abort(e.into())
}

impl MessageStore {
    /// Open (or create) the store rooted at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        std::fs::create_dir_all(path_ref)?;
        let db = sled::open(path_ref)?;
        let message_map = db.open_tree(TREE_MESSAGE_MAP)?;
        let store = Self {
            names: db.open_tree(TREE_NAMES)?,
            map_rows: Arc::new(AtomicUsize::new(message_map.len())),
            message_map,
            map_order: db.open_tree(TREE_MAP_ORDER)?,
            map_by_mesh: db.open_tree(TREE_MAP_BY_MESH)?,
            plugin_data: db.open_tree(TREE_PLUGIN_DATA)?,
            path: path_ref.to_path_buf(),
            db,
        };
        debug!("Opened relay store at {}", store.path.display());
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
        Ok(bincode::serialize(value)?)
    }

    fn deserialize<T: serde::de::DeserializeOwned>(bytes: &IVec) -> Result<T, StoreError> {
        Ok(bincode::deserialize::<T>(bytes)?)
    }

    // ---- node names ----

    pub fn save_longname(&self, node: u32, name: &str) -> Result<(), StoreError> {
        self.names.insert(name_key("long", node), name.as_bytes())?;
        Ok(())
    }

    pub fn save_shortname(&self, node: u32, name: &str) -> Result<(), StoreError> {
        self.names.insert(name_key("short", node), name.as_bytes())?;
        Ok(())
    }

    pub fn get_longname(&self, node: u32) -> Result<Option<String>, StoreError> {
        self.get_name("long", node)
    }

    pub fn get_shortname(&self, node: u32) -> Result<Option<String>, StoreError> {
        self.get_name("short", node)
    }

    fn get_name(&self, kind: &str, node: u32) -> Result<Option<String>, StoreError> {
        match self.names.get(name_key(kind, node))? {
            Some(bytes) => Ok(Some(String::from_utf8(bytes.to_vec())?)),
            None => Ok(None),
        }
    }

    /// Record every advertised name from the transport's node table. Last
    /// write wins. Returns how many names were written.
    pub fn update_names_from_nodes(&self, nodes: &[NodeInfo]) -> Result<usize, StoreError> {
        let mut written = 0;
        for node in nodes {
            if let Some(long) = node.long_name.as_deref().filter(|n| !n.is_empty()) {
                self.save_longname(node.num, long)?;
                written += 1;
            }
            if let Some(short) = node.short_name.as_deref().filter(|n| !n.is_empty()) {
                self.save_shortname(node.num, short)?;
                written += 1;
            }
        }
        Ok(written)
    }

    // ---- identity map ----

    /// Insert or replace the mapping for `mapping.event_id`.
    pub fn store_message_map(&self, mapping: &MessageMapping) -> Result<(), StoreError> {
        let seq = self.db.generate_id()?;
        let event_key = mapping.event_id.as_bytes();
        let encoded = Self::serialize(&StoredMapping {
            seq,
            mapping: mapping.clone(),
        })?;

        let replaced = (&self.message_map, &self.map_order, &self.map_by_mesh).transaction(
            |(map, order, by_mesh)| -> ConflictableTransactionResult<bool, StoreError> {
                let old = map.get(event_key)?;
                let replaced = old.is_some();
                if let Some(old) = old {
                    let old: StoredMapping = Self::deserialize(&old).map_err(abort)?;
                    order.remove(&old.seq.to_be_bytes()[..])?;
                    if let Some(mesh_id) = old.mapping.mesh_id {
                        by_mesh.remove(&mesh_key(mesh_id, old.seq)[..])?;
                    }
                }
                map.insert(event_key, encoded.as_slice())?;
                order.insert(&seq.to_be_bytes()[..], event_key)?;
                if let Some(mesh_id) = mapping.mesh_id {
                    by_mesh.insert(&mesh_key(mesh_id, seq)[..], event_key)?;
                }
                Ok(replaced)
            },
        )?;
        if !replaced {
            self.map_rows.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn get_message_map_by_event_id(&self, event_id: &str) -> Result<Option<MessageMapping>, StoreError> {
        match self.message_map.get(event_id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::deserialize::<StoredMapping>(&bytes)?.mapping)),
            None => Ok(None),
        }
    }

    /// Most recently stored mapping for `mesh_id`.
    pub fn get_message_map_by_mesh_id(&self, mesh_id: u32) -> Result<Option<MessageMapping>, StoreError> {
        let mut matches = self.map_by_mesh.scan_prefix(mesh_id.to_be_bytes());
        while let Some(entry) = matches.next_back() {
            let (_, event_id) = entry?;
            if let Some(bytes) = self.message_map.get(&event_id)? {
                return Ok(Some(Self::deserialize::<StoredMapping>(&bytes)?.mapping));
            }
        }
        Ok(None)
    }

    pub fn message_map_len(&self) -> usize {
        self.map_rows.load(Ordering::SeqCst)
    }

    /// Drop the oldest mappings until at most `keep` remain. Returns how many
    /// were removed.
    pub fn prune_message_map(&self, keep: usize) -> Result<usize, StoreError> {
        let total = self.message_map_len();
        if total <= keep {
            return Ok(0);
        }
        let excess = total - keep;
        let mut victims = Vec::with_capacity(excess);
        for entry in self.map_order.iter().take(excess) {
            let (_, event_id) = entry?;
            victims.push(event_id);
        }
        let mut removed = 0;
        for event_id in victims {
            if self.remove_mapping(&event_id)? {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Pruned {} message map rows (keeping {})", removed, keep);
        }
        Ok(removed)
    }

    fn remove_mapping(&self, event_key: &[u8]) -> Result<bool, StoreError> {
        let removed = (&self.message_map, &self.map_order, &self.map_by_mesh).transaction(
            |(map, order, by_mesh)| -> ConflictableTransactionResult<bool, StoreError> {
                let Some(old) = map.remove(event_key)? else {
                    return Ok(false);
                };
                let old: StoredMapping = Self::deserialize(&old).map_err(abort)?;
                order.remove(&old.seq.to_be_bytes()[..])?;
                if let Some(mesh_id) = old.mapping.mesh_id {
                    by_mesh.remove(&mesh_key(mesh_id, old.seq)[..])?;
                }
                Ok(true)
            },
        )?;
        if removed {
            let _ = self
                .map_rows
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
        }
        Ok(removed)
    }

    pub fn wipe_message_map(&self) -> Result<(), StoreError> {
        let rows = self.map_rows.swap(0, Ordering::SeqCst);
        self.message_map.clear()?;
        self.map_order.clear()?;
        self.map_by_mesh.clear()?;
        self.flush()?;
        info!("Wiped message map ({} rows)", rows);
        Ok(())
    }

    // ---- plugin data ----

    /// Replace a plugin's records for `node`, keeping only the newest
    /// `max_rows` entries.
    pub fn store_plugin_data(
        &self,
        plugin: &str,
        node: u32,
        mut records: Vec<Value>,
        max_rows: usize,
    ) -> Result<(), StoreError> {
        if records.len() > max_rows {
            records.drain(..records.len() - max_rows);
        }
        let encoded = serde_json::to_vec(&records)?;
        self.plugin_data.insert(plugin_key(plugin, node), encoded)?;
        Ok(())
    }

    pub fn get_plugin_data(&self, plugin: &str, node: u32) -> Result<Vec<Value>, StoreError> {
        match self.plugin_data.get(plugin_key(plugin, node))? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn delete_plugin_data(&self, plugin: &str, node: u32) -> Result<(), StoreError> {
        self.plugin_data.remove(plugin_key(plugin, node))?;
        Ok(())
    }

    /// Every node's records for `plugin`, ordered by node id.
    pub fn get_all_plugin_data(&self, plugin: &str) -> Result<Vec<(u32, Vec<Value>)>, StoreError> {
        let prefix = plugin_prefix(plugin);
        let mut out = Vec::new();
        for entry in self.plugin_data.scan_prefix(&prefix) {
            let (key, bytes) = entry?;
            let node_bytes: [u8; 4] = match <[u8; 4]>::try_from(&key[prefix.len()..]) {
                Ok(b) => b,
                Err(_) => continue,
            };
            out.push((u32::from_be_bytes(node_bytes), serde_json::from_slice(&bytes)?));
        }
        Ok(out)
    }
}
