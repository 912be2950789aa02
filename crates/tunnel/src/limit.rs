//! Proxy stream limits
//!
//! Counts open proxy streams globally and per peer, in each direction. A
//! [`StreamPermit`] is held for the lifetime of a stream and releases its slot
//! on drop. With limiting disabled streams are still counted but never refused.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use edgemesh_core::{TunnelError, TunnelLimitConfig};
use libp2p::PeerId;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

/// Open stream counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamUsage {
    pub inbound: usize,
    pub outbound: usize,
}

impl StreamUsage {
    fn get(&self, direction: Direction) -> usize {
        match direction {
            Direction::Inbound => self.inbound,
            Direction::Outbound => self.outbound,
        }
    }

    fn get_mut(&mut self, direction: Direction) -> &mut usize {
        match direction {
            Direction::Inbound => &mut self.inbound,
            Direction::Outbound => &mut self.outbound,
        }
    }

    pub fn total(&self) -> usize {
        self.inbound + self.outbound
    }
}

#[derive(Debug, Default)]
struct Usage {
    total: StreamUsage,
    peers: HashMap<PeerId, StreamUsage>,
}

#[derive(Debug)]
struct LimiterState {
    config: TunnelLimitConfig,
    usage: Mutex<Usage>,
}

impl LimiterState {
    fn limits(&self, direction: Direction) -> (usize, usize) {
        match direction {
            Direction::Inbound => (
                self.config.tunnel_base_stream_in,
                self.config.tunnel_peer_base_stream_in,
            ),
            Direction::Outbound => (
                self.config.tunnel_base_stream_out,
                self.config.tunnel_peer_base_stream_out,
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamLimiter {
    state: Arc<LimiterState>,
}

impl StreamLimiter {
    pub fn new(config: TunnelLimitConfig) -> Self {
        Self {
            state: Arc::new(LimiterState {
                config,
                usage: Mutex::new(Usage::default()),
            }),
        }
    }

    /// A limiter that never refuses a stream
    pub fn unlimited() -> Self {
        Self::new(TunnelLimitConfig {
            enable: false,
            ..Default::default()
        })
    }

    /// Reserve a stream slot for `peer_id`
    pub fn acquire(&self, peer_id: PeerId, direction: Direction) -> Result<StreamPermit, TunnelError> {
        let mut usage = self.state.usage.lock();
        if self.state.config.enable {
            let (global_limit, peer_limit) = self.state.limits(direction);
            if usage.total.get(direction) >= global_limit {
                return Err(TunnelError::StreamLimitExceeded(format!(
                    "{direction} streams at global limit {global_limit}"
                )));
            }
            let peer_usage = usage.peers.get(&peer_id).copied().unwrap_or_default();
            if peer_usage.get(direction) >= peer_limit {
                return Err(TunnelError::StreamLimitExceeded(format!(
                    "{direction} streams for {peer_id} at limit {peer_limit}"
                )));
            }
        }
        *usage.total.get_mut(direction) += 1;
        *usage.peers.entry(peer_id).or_default().get_mut(direction) += 1;

        Ok(StreamPermit {
            state: Arc::clone(&self.state),
            peer_id,
            direction,
        })
    }

    pub fn usage(&self) -> StreamUsage {
        self.state.usage.lock().total
    }

    pub fn peer_usage(&self, peer_id: &PeerId) -> StreamUsage {
        self.state
            .usage
            .lock()
            .peers
            .get(peer_id)
            .copied()
            .unwrap_or_default()
    }
}

/// One reserved stream slot
#[derive(Debug)]
pub struct StreamPermit {
    state: Arc<LimiterState>,
    peer_id: PeerId,
    direction: Direction,
}

impl StreamPermit {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

impl Drop for StreamPermit {
    fn drop(&mut self) {
        let mut usage = self.state.usage.lock();
        let total = usage.total.get_mut(self.direction);
        *total = total.saturating_sub(1);

        let emptied = match usage.peers.get_mut(&self.peer_id) {
            Some(peer) => {
                let count = peer.get_mut(self.direction);
                *count = count.saturating_sub(1);
                peer.total() == 0
            }
            None => false,
        };
        if emptied {
            usage.peers.remove(&self.peer_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_limits() -> TunnelLimitConfig {
        TunnelLimitConfig {
            enable: true,
            tunnel_base_stream_in: 3,
            tunnel_base_stream_out: 3,
            tunnel_peer_base_stream_in: 2,
            tunnel_peer_base_stream_out: 2,
        }
    }

    #[test]
    fn test_per_peer_limit() {
        let limiter = StreamLimiter::new(small_limits());
        let peer = PeerId::random();
        let _a = limiter.acquire(peer, Direction::Inbound).unwrap();
        let _b = limiter.acquire(peer, Direction::Inbound).unwrap();
        assert!(matches!(
            limiter.acquire(peer, Direction::Inbound),
            Err(TunnelError::StreamLimitExceeded(_))
        ));
        // the other direction has its own budget
        assert!(limiter.acquire(peer, Direction::Outbound).is_ok());
    }

    #[test]
    fn test_global_limit() {
        let limiter = StreamLimiter::new(small_limits());
        let _permits: Vec<_> = (0..3)
            .map(|_| limiter.acquire(PeerId::random(), Direction::Outbound).unwrap())
            .collect();
        assert!(limiter.acquire(PeerId::random(), Direction::Outbound).is_err());
        assert_eq!(limiter.usage().outbound, 3);
    }

    #[test]
    fn test_permit_drop_releases_slot() {
        let limiter = StreamLimiter::new(small_limits());
        let peer = PeerId::random();
        let a = limiter.acquire(peer, Direction::Inbound).unwrap();
        let b = limiter.acquire(peer, Direction::Inbound).unwrap();
        assert_eq!(limiter.peer_usage(&peer).inbound, 2);

        drop(a);
        assert!(limiter.acquire(peer, Direction::Inbound).is_ok());
        drop(b);
        assert_eq!(limiter.usage(), StreamUsage::default());
        assert_eq!(limiter.peer_usage(&peer), StreamUsage::default());
    }

    #[test]
    fn test_disabled_limiter_counts_but_never_refuses() {
        let limiter = StreamLimiter::new(TunnelLimitConfig {
            enable: false,
            ..small_limits()
        });
        let peer = PeerId::random();
        let permits: Vec<_> = (0..10)
            .map(|_| limiter.acquire(peer, Direction::Inbound).unwrap())
            .collect();
        assert_eq!(limiter.usage().inbound, 10);
        drop(permits);
        assert_eq!(limiter.usage().total(), 0);
    }
}
