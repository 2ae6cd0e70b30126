//! The hub's node registry.
//!
//! A JSON-file-backed map of enrolled nodes keyed by address, guarded
//! by a mutex that also serializes persistence, plus a broadcast change
//! bus every mutation publishes to. Disk is written before memory
//! flips, so a crash never leaves the registry claiming a node it did
//! not persist.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};

use cohort_common::persist;

use crate::error::HubError;

const CHANGE_BUS_CAPACITY: usize = 64;

/// A node the hub has enrolled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubNode {
    /// Dial address, unique within the registry.
    pub address: String,
    /// Logical name the hub assigned at enrollment.
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// The chain minted for the node at enrollment or last renewal.
    pub cert_chain_pem: String,
    /// SHA-256 of the leaf certificate.
    pub fingerprint: String,
    pub enrolled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Add,
    Update,
    Remove,
}

/// One registry mutation, as published on the change bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeChange {
    pub kind: ChangeKind,
    pub old: Option<HubNode>,
    pub new: Option<HubNode>,
}

impl NodeChange {
    pub fn added(node: HubNode) -> Self {
        Self {
            kind: ChangeKind::Add,
            old: None,
            new: Some(node),
        }
    }
}

pub struct Registry {
    path: PathBuf,
    nodes: Mutex<BTreeMap<String, HubNode>>,
    changes: broadcast::Sender<NodeChange>,
}

impl Registry {
    /// Load the registry file or start empty. Unparseable files are
    /// fatal rather than silently discarded.
    pub fn load_or_create(path: impl Into<PathBuf>) -> Result<Self, HubError> {
        let path = path.into();
        let stored: Option<Vec<HubNode>> = persist::read_json_if_exists(&path)?;
        let nodes = stored
            .unwrap_or_default()
            .into_iter()
            .map(|n| (n.address.clone(), n))
            .collect();
        let (changes, _) = broadcast::channel(CHANGE_BUS_CAPACITY);
        Ok(Self {
            path,
            nodes: Mutex::new(nodes),
            changes,
        })
    }

    pub async fn list(&self) -> Vec<HubNode> {
        self.nodes.lock().await.values().cloned().collect()
    }

    pub async fn get(&self, address: &str) -> Option<HubNode> {
        self.nodes.lock().await.get(address).cloned()
    }

    /// Add a node. The address must be unoccupied.
    pub async fn insert(&self, node: HubNode) -> Result<(), HubError> {
        let mut nodes = self.nodes.lock().await;
        if nodes.contains_key(&node.address) {
            return Err(HubError::AlreadyExists(node.address));
        }
        let mut next = nodes.clone();
        next.insert(node.address.clone(), node.clone());
        self.write(&next)?;
        *nodes = next;

        // Published while the lock is held so subscribers observe
        // mutations in commit order.
        let _ = self.changes.send(NodeChange::added(node));
        Ok(())
    }

    /// Replace an existing node's row.
    pub async fn update(&self, node: HubNode) -> Result<(), HubError> {
        let mut nodes = self.nodes.lock().await;
        let old = nodes
            .get(&node.address)
            .cloned()
            .ok_or_else(|| HubError::NotFound(node.address.clone()))?;
        let mut next = nodes.clone();
        next.insert(node.address.clone(), node.clone());
        self.write(&next)?;
        *nodes = next;

        let _ = self.changes.send(NodeChange {
            kind: ChangeKind::Update,
            old: Some(old),
            new: Some(node),
        });
        Ok(())
    }

    /// Remove a node's row, returning it.
    pub async fn remove(&self, address: &str) -> Result<HubNode, HubError> {
        let mut nodes = self.nodes.lock().await;
        if !nodes.contains_key(address) {
            return Err(HubError::NotFound(address.into()));
        }
        let mut next = nodes.clone();
        let old = next.remove(address).ok_or_else(|| HubError::NotFound(address.into()))?;
        self.write(&next)?;
        *nodes = next;

        let _ = self.changes.send(NodeChange {
            kind: ChangeKind::Remove,
            old: Some(old.clone()),
            new: None,
        });
        Ok(old)
    }

    /// Subscribe to registry mutations. Slow consumers may observe a
    /// lagged-receiver error and should resynchronize from `list`.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeChange> {
        self.changes.subscribe()
    }

    fn write(&self, nodes: &BTreeMap<String, HubNode>) -> Result<(), HubError> {
        let rows: Vec<&HubNode> = nodes.values().collect();
        persist::write_json_pretty(&self.path, &rows)?;
        Ok(())
    }
}
