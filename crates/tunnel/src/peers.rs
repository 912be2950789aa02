//! Node name to peer identity mapping

use std::collections::HashMap;
use std::sync::Arc;

use libp2p::PeerId;
use parking_lot::RwLock;
use tracing::debug;

/// Shared `node name -> peer id` map.
///
/// Filled by discovery handshakes and by proxy requests to nodes that have
/// not been discovered yet. One identity per name; the last writer wins.
#[derive(Debug, Clone, Default)]
pub struct NodePeerMap {
    inner: Arc<RwLock<HashMap<String, PeerId>>>,
}

impl NodePeerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node_name: &str) -> Option<PeerId> {
        self.inner.read().get(node_name).copied()
    }

    /// Record `node_name -> peer_id`; returns the identity it replaced
    pub fn insert(&self, node_name: &str, peer_id: PeerId) -> Option<PeerId> {
        let previous = self.inner.write().insert(node_name.to_string(), peer_id);
        if previous != Some(peer_id) {
            debug!("Mapped node {} to {}", node_name, peer_id);
        }
        previous
    }

    /// Whether some node is already mapped to `peer_id`
    pub fn contains_peer(&self, peer_id: &PeerId) -> bool {
        self.inner.read().values().any(|id| id == peer_id)
    }

    /// Node name mapped to `peer_id`, if any
    pub fn node_name_of(&self, peer_id: &PeerId) -> Option<String> {
        self.inner
            .read()
            .iter()
            .find(|(_, id)| *id == peer_id)
            .map(|(name, _)| name.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn snapshot(&self) -> HashMap<String, PeerId> {
        self.inner.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_writer_wins() {
        let map = NodePeerMap::new();
        let first = PeerId::random();
        let second = PeerId::random();
        assert_eq!(map.insert("edge-1", first), None);
        assert_eq!(map.insert("edge-1", second), Some(first));
        assert_eq!(map.get("edge-1"), Some(second));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_reverse_lookup() {
        let map = NodePeerMap::new();
        let peer = PeerId::random();
        map.insert("cloud-1", peer);
        assert!(map.contains_peer(&peer));
        assert_eq!(map.node_name_of(&peer).as_deref(), Some("cloud-1"));
        assert!(!map.contains_peer(&PeerId::random()));
    }

    #[test]
    fn test_clones_share_state() {
        let map = NodePeerMap::new();
        let clone = map.clone();
        clone.insert("edge-2", PeerId::random());
        assert!(map.get("edge-2").is_some());
    }
}
