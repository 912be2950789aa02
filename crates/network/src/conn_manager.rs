//! Connection manager
//!
//! Keeps the number of open connections between two watermarks. Once the
//! count goes above `high_water`, connections older than the grace period are
//! closed, oldest first, until `low_water` is reached. Connections to
//! protected peers (relays) are never trimmed.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use libp2p::swarm::ConnectionId;
use libp2p::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnManagerConfig {
    pub low_water: usize,
    pub high_water: usize,
    pub grace_period: Duration,
}

impl Default for ConnManagerConfig {
    fn default() -> Self {
        Self {
            low_water: 100,
            high_water: 400,
            grace_period: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TrackedConnection {
    peer_id: PeerId,
    opened_at: Instant,
}

#[derive(Debug, Default)]
pub struct ConnManager {
    config: ConnManagerConfig,
    connections: HashMap<ConnectionId, TrackedConnection>,
    protected: HashSet<PeerId>,
}

impl ConnManager {
    pub fn new(config: ConnManagerConfig) -> Self {
        Self {
            config,
            connections: HashMap::new(),
            protected: HashSet::new(),
        }
    }

    pub fn on_established(&mut self, id: ConnectionId, peer_id: PeerId, now: Instant) {
        self.connections.insert(id, TrackedConnection { peer_id, opened_at: now });
    }

    pub fn on_closed(&mut self, id: ConnectionId) {
        self.connections.remove(&id);
    }

    /// Replace the protected peer set
    pub fn set_protected(&mut self, peers: impl IntoIterator<Item = PeerId>) {
        self.protected = peers.into_iter().collect();
    }

    pub fn is_protected(&self, peer_id: &PeerId) -> bool {
        self.protected.contains(peer_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connections to close now, or nothing while under the high watermark
    pub fn connections_to_trim(&self, now: Instant) -> Vec<ConnectionId> {
        if self.connections.len() <= self.config.high_water {
            return Vec::new();
        }
        let excess = self.connections.len() - self.config.low_water;

        let mut candidates: Vec<(ConnectionId, Instant)> = self
            .connections
            .iter()
            .filter(|(_, c)| !self.protected.contains(&c.peer_id))
            .filter(|(_, c)| now.saturating_duration_since(c.opened_at) >= self.config.grace_period)
            .map(|(id, c)| (*id, c.opened_at))
            .collect();
        candidates.sort_by_key(|(_, opened_at)| *opened_at);
        candidates.into_iter().take(excess).map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> ConnManager {
        ConnManager::new(ConnManagerConfig {
            low_water: 2,
            high_water: 4,
            grace_period: Duration::from_secs(60),
        })
    }

    #[test]
    fn test_default_watermarks() {
        let config = ConnManagerConfig::default();
        assert_eq!(config.low_water, 100);
        assert_eq!(config.high_water, 400);
        assert_eq!(config.grace_period, Duration::from_secs(60));
    }

    #[test]
    fn test_no_trim_under_high_water() {
        let mut mgr = small();
        let start = Instant::now();
        for i in 0..4 {
            mgr.on_established(ConnectionId::new_unchecked(i), PeerId::random(), start);
        }
        assert!(mgr.connections_to_trim(start + Duration::from_secs(600)).is_empty());
    }

    #[test]
    fn test_trim_to_low_water_oldest_first() {
        let mut mgr = small();
        let start = Instant::now();
        for i in 0..5 {
            mgr.on_established(
                ConnectionId::new_unchecked(i),
                PeerId::random(),
                start + Duration::from_secs(i as u64),
            );
        }
        let trimmed = mgr.connections_to_trim(start + Duration::from_secs(600));
        assert_eq!(
            trimmed,
            vec![
                ConnectionId::new_unchecked(0),
                ConnectionId::new_unchecked(1),
                ConnectionId::new_unchecked(2),
            ]
        );
    }

    #[test]
    fn test_grace_period_and_protection() {
        let mut mgr = small();
        let start = Instant::now();
        let relay = PeerId::random();
        mgr.set_protected([relay]);

        mgr.on_established(ConnectionId::new_unchecked(0), relay, start);
        mgr.on_established(ConnectionId::new_unchecked(1), PeerId::random(), start);
        for i in 2..5 {
            mgr.on_established(
                ConnectionId::new_unchecked(i),
                PeerId::random(),
                start + Duration::from_secs(100),
            );
        }

        // only connection 1 is out of its grace period and unprotected
        let trimmed = mgr.connections_to_trim(start + Duration::from_secs(120));
        assert_eq!(trimmed, vec![ConnectionId::new_unchecked(1)]);
        assert!(mgr.is_protected(&relay));
    }

    #[test]
    fn test_closed_connections_are_forgotten() {
        let mut mgr = small();
        let id = ConnectionId::new_unchecked(7);
        mgr.on_established(id, PeerId::random(), Instant::now());
        assert_eq!(mgr.len(), 1);
        mgr.on_closed(id);
        assert!(mgr.is_empty());
    }
}
