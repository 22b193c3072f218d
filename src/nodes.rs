//! Attached Node Registry
//!
//! Process-wide map of node key to [`NodeInfo`]. On the master it reflects
//! every session that completed the handshake; on a node it mirrors the
//! master's view through the `ChallengeFinish` snapshot and the
//! `NodeAttached`/`NodeDetached` broadcasts.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

/// Geographic coordinates in decimal degrees
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

impl Location {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Identity and placement of one edge node, sent at login
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Principal name; also the key file name
    pub key: String,
    pub arch: String,
    pub version: String,
    /// Hex SHA-256 of the running binary
    pub hash: String,
    pub pid: u32,
    /// Public addresses DNS answers may hand out for this node
    pub listeners: Vec<IpAddr>,
    pub location: Location,
    pub modules: Vec<String>,
}

impl NodeInfo {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            arch: std::env::consts::ARCH.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hash: String::new(),
            pid: std::process::id(),
            listeners: Vec::new(),
            location: Location::default(),
            modules: Vec::new(),
        }
    }

    pub fn with_listeners(mut self, listeners: Vec<IpAddr>) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    pub fn with_modules(mut self, modules: Vec<String>) -> Self {
        self.modules = modules;
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = hash.into();
        self
    }
}

/// Hex SHA-256 of the running executable
pub fn binary_hash() -> io::Result<String> {
    file_hash(&std::env::current_exe()?)
}

pub fn file_hash(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

struct Entry {
    order: u64,
    info: NodeInfo,
}

#[derive(Default)]
struct Inner {
    next_order: u64,
    nodes: HashMap<String, Entry>,
}

/// Registry of attached nodes
#[derive(Clone, Default)]
pub struct NodeRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach or re-attach a node. A re-attach replaces the previous entry
    /// and moves it to the end of the attach order.
    pub async fn attach(&self, info: NodeInfo) {
        let mut inner = self.inner.write().await;
        let order = inner.next_order;
        inner.next_order += 1;
        inner.nodes.insert(info.key.clone(), Entry { order, info });
    }

    /// Remove a node, returning its last known info
    pub async fn detach(&self, key: &str) -> Option<NodeInfo> {
        self.inner.write().await.nodes.remove(key).map(|e| e.info)
    }

    pub async fn get(&self, key: &str) -> Option<NodeInfo> {
        self.inner.read().await.nodes.get(key).map(|e| e.info.clone())
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.inner.read().await.nodes.contains_key(key)
    }

    /// All nodes in attach order
    pub async fn snapshot(&self) -> Vec<NodeInfo> {
        let inner = self.inner.read().await;
        let mut entries: Vec<&Entry> = inner.nodes.values().collect();
        entries.sort_by_key(|e| e.order);
        entries.into_iter().map(|e| e.info.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.nodes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Replace the whole registry with `nodes`, keeping their order
    pub async fn reset(&self, nodes: Vec<NodeInfo>) {
        let mut inner = self.inner.write().await;
        inner.nodes.clear();
        inner.next_order = 0;
        for info in nodes {
            let order = inner.next_order;
            inner.next_order += 1;
            inner.nodes.insert(info.key.clone(), Entry { order, info });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(key: &str, ip: &str) -> NodeInfo {
        NodeInfo::new(key).with_listeners(vec![ip.parse().unwrap()])
    }

    #[test]
    fn test_file_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bin");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            file_hash(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(file_hash(&dir.path().join("missing")).is_err());
    }

    #[tokio::test]
    async fn test_attach_order_snapshot() {
        let registry = NodeRegistry::new();
        registry.attach(node("edge-a", "192.0.2.10")).await;
        registry.attach(node("edge-b", "198.51.100.20")).await;
        registry.attach(node("edge-c", "203.0.113.5")).await;

        let keys: Vec<String> = registry.snapshot().await.into_iter().map(|n| n.key).collect();
        assert_eq!(keys, vec!["edge-a", "edge-b", "edge-c"]);
    }

    #[tokio::test]
    async fn test_reattach_overwrites() {
        let registry = NodeRegistry::new();
        registry.attach(node("edge-a", "192.0.2.10")).await;
        registry.attach(node("edge-b", "198.51.100.20")).await;
        registry.attach(node("edge-a", "192.0.2.11")).await;

        assert_eq!(registry.len().await, 2);
        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot[1].key, "edge-a");
        assert_eq!(snapshot[1].listeners, vec!["192.0.2.11".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_detach() {
        let registry = NodeRegistry::new();
        registry.attach(node("edge-a", "192.0.2.10")).await;
        assert!(registry.detach("edge-a").await.is_some());
        assert!(registry.detach("edge-a").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_reset_from_snapshot() {
        let registry = NodeRegistry::new();
        registry.attach(node("stale", "192.0.2.99")).await;
        registry
            .reset(vec![node("edge-b", "198.51.100.20"), node("edge-a", "192.0.2.10")])
            .await;

        assert!(!registry.contains("stale").await);
        let keys: Vec<String> = registry.snapshot().await.into_iter().map(|n| n.key).collect();
        assert_eq!(keys, vec!["edge-b", "edge-a"]);
    }
}
