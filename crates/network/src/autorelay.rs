//! Relay reservation bookkeeping
//!
//! Relay candidates arrive from the relay finder. While the node believes it
//! is not publicly reachable it keeps up to [`DESIRED_RELAYS`] reservations
//! open; a candidate whose reservation fails or closes is skipped for
//! [`RESERVATION_BACKOFF`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use libp2p::core::transport::ListenerId;
use libp2p::{Multiaddr, PeerId};

use crate::relay_map::{is_circuit_addr, PeerAddrInfo};

/// Reservations held at the same time
pub const DESIRED_RELAYS: usize = 2;

/// Pause before a failed candidate is tried again
pub const RESERVATION_BACKOFF: Duration = Duration::from_secs(30);

/// What the node knows about its own reachability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Unknown,
    Public,
    Private,
}

impl fmt::Display for Reachability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reachability::Unknown => "unknown",
            Reachability::Public => "public",
            Reachability::Private => "private",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct AutoRelay {
    reachability: Reachability,
    max_candidates: usize,
    candidates: VecDeque<PeerAddrInfo>,
    reservations: HashMap<PeerId, ListenerId>,
    backoff: HashMap<PeerId, Instant>,
}

impl AutoRelay {
    pub fn new(max_candidates: usize, force_private: bool) -> Self {
        Self {
            reachability: if force_private {
                Reachability::Private
            } else {
                Reachability::Unknown
            },
            max_candidates: max_candidates.max(1),
            candidates: VecDeque::new(),
            reservations: HashMap::new(),
            backoff: HashMap::new(),
        }
    }

    pub fn reachability(&self) -> Reachability {
        self.reachability
    }

    /// Returns whether the value changed
    pub fn set_reachability(&mut self, reachability: Reachability) -> bool {
        let changed = self.reachability != reachability;
        self.reachability = reachability;
        changed
    }

    /// Remember a candidate, evicting the oldest unreserved one when full
    pub fn add_candidate(&mut self, info: PeerAddrInfo) {
        if let Some(existing) = self.candidates.iter_mut().find(|c| c.peer_id == info.peer_id) {
            existing.addrs = info.addrs;
            return;
        }
        if self.candidates.len() >= self.max_candidates {
            let evict = self
                .candidates
                .iter()
                .position(|c| !self.reservations.contains_key(&c.peer_id));
            match evict {
                Some(idx) => {
                    self.candidates.remove(idx);
                }
                None => return,
            }
        }
        self.candidates.push_back(info);
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_reserved(&self, peer_id: &PeerId) -> bool {
        self.reservations.contains_key(peer_id)
    }

    /// Relays to reserve a slot on now, with the address to reach each
    pub fn next_reservations(&mut self, now: Instant) -> Vec<(PeerId, Multiaddr)> {
        if self.reachability != Reachability::Private {
            return Vec::new();
        }
        self.backoff.retain(|_, until| *until > now);

        let wanted = DESIRED_RELAYS.saturating_sub(self.reservations.len());
        self.candidates
            .iter()
            .filter(|c| !self.reservations.contains_key(&c.peer_id))
            .filter(|c| !self.backoff.contains_key(&c.peer_id))
            .filter_map(|c| {
                c.addrs
                    .iter()
                    .find(|a| !is_circuit_addr(a))
                    .map(|a| (c.peer_id, a.clone()))
            })
            .take(wanted)
            .collect()
    }

    pub fn on_reserving(&mut self, relay: PeerId, listener_id: ListenerId) {
        self.reservations.insert(relay, listener_id);
    }

    pub fn on_reservation_failed(&mut self, relay: PeerId, now: Instant) {
        self.reservations.remove(&relay);
        self.backoff.insert(relay, now + RESERVATION_BACKOFF);
    }

    /// A relay listener went away; returns the relay it belonged to
    pub fn on_listener_closed(&mut self, listener_id: ListenerId, now: Instant) -> Option<PeerId> {
        let relay = self
            .reservations
            .iter()
            .find(|(_, id)| **id == listener_id)
            .map(|(peer, _)| *peer)?;
        self.on_reservation_failed(relay, now);
        Some(relay)
    }

    /// Forget every reservation, returning the listeners to close
    pub fn release_all(&mut self) -> Vec<ListenerId> {
        self.reservations.drain().map(|(_, id)| id).collect()
    }
}
