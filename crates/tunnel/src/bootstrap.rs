//! Relay bootstrap and heartbeat
//!
//! Both keep the node connected to the relays in the relay map. Bootstrap runs
//! once at startup in whole rounds and drops relays that never answer;
//! heartbeat runs periodically and only retries relays that went away.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edgemesh_core::TunnelError;
use edgemesh_network::{HostHandle, NetworkError, PeerAddrInfo, PeerId, RelayMap};
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::tunnel::SharedConfig;

/// Relay map shared between the tunnel's background tasks
pub type SharedRelayMap = Arc<RwLock<RelayMap>>;

/// Connection primitives the relay keepers need from the host
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, info: &PeerAddrInfo) -> Result<(), NetworkError>;

    async fn is_connected(&self, peer_id: PeerId) -> bool;
}

#[async_trait]
impl Connector for HostHandle {
    async fn connect(&self, info: &PeerAddrInfo) -> Result<(), NetworkError> {
        HostHandle::connect(self, info.peer_id, info.addrs.clone()).await
    }

    async fn is_connected(&self, peer_id: PeerId) -> bool {
        HostHandle::is_connected(self, peer_id).await
    }
}

/// Round timing of the startup bootstrap
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Pause between rounds, also the bound of each connect
    pub interval: Duration,
    /// No round starts after this much time has passed
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            deadline: Duration::from_secs(60),
        }
    }
}

/// Attempt spacing of the periodic heartbeat
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatPolicy {
    pub attempts: usize,
    pub spacing: Duration,
    pub connect_timeout: Duration,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            spacing: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

fn remote_relays(relays: &SharedRelayMap, local: PeerId) -> Vec<(String, PeerAddrInfo)> {
    relays
        .read()
        .relays()
        .into_iter()
        .filter(|(_, info)| info.peer_id != local)
        .collect()
}

async fn connect_bounded<C: Connector + ?Sized>(
    connector: &C,
    info: &PeerAddrInfo,
    limit: Duration,
) -> Result<(), TunnelError> {
    match timeout(limit, connector.connect(info)).await {
        Ok(result) => result.map_err(TunnelError::from),
        Err(_) => Err(TunnelError::Timeout),
    }
}

/// Connect to every relay other than `local`.
///
/// Rounds repeat until all relays are connected or the deadline passes.
/// Relays that still fail in the last round are removed from the map.
pub async fn bootstrap_connect<C: Connector + ?Sized>(
    connector: &C,
    local: PeerId,
    relays: &SharedRelayMap,
    policy: RetryPolicy,
) -> Result<(), TunnelError> {
    let started = Instant::now();
    let mut pending = remote_relays(relays, local);
    if pending.is_empty() {
        debug!("No relays to bootstrap");
        return Ok(());
    }

    loop {
        let results = join_all(pending.iter().map(|(name, info)| async move {
            let result = connect_bounded(connector, info, policy.interval).await;
            if let Err(e) = &result {
                debug!("Bootstrap connect to relay {} {} failed: {}", name, info, e);
            }
            result
        }))
        .await;

        pending = pending
            .into_iter()
            .zip(results)
            .filter_map(|(relay, result)| result.is_err().then_some(relay))
            .collect();

        if pending.is_empty() {
            info!("Connected to all relays");
            return Ok(());
        }
        if started.elapsed() + policy.interval >= policy.deadline {
            break;
        }
        sleep(policy.interval).await;
    }

    let mut map = relays.write();
    for (name, info) in &pending {
        warn!("Relay {} {} unreachable, removing it from the relay map", name, info.peer_id);
        map.remove(name);
    }
    Err(TunnelError::BootstrapIncomplete {
        failed: pending.len(),
    })
}

/// Reconnect relays that have no live connection. Returns how many stay
/// unreachable after the attempts are used up.
pub async fn heartbeat_round<C: Connector + ?Sized>(
    connector: &C,
    local: PeerId,
    relays: &SharedRelayMap,
    policy: HeartbeatPolicy,
) -> usize {
    let checks = remote_relays(relays, local).into_iter().map(|(name, info)| async move {
        if connector.is_connected(info.peer_id).await {
            return true;
        }
        for attempt in 1..=policy.attempts {
            match connect_bounded(connector, &info, policy.connect_timeout).await {
                Ok(()) => {
                    debug!("Reconnected to relay {} on attempt {}", name, attempt);
                    return true;
                }
                Err(e) => {
                    debug!("Heartbeat to relay {} attempt {} failed: {}", name, attempt, e);
                    if attempt < policy.attempts {
                        sleep(policy.spacing).await;
                    }
                }
            }
        }
        false
    });

    join_all(checks).await.into_iter().filter(|ok| !ok).count()
}

/// Heartbeat rounds every `heartbeatPeriod`, starting one period after launch
pub(crate) async fn run_heartbeat(
    host: HostHandle,
    relays: SharedRelayMap,
    config: SharedConfig,
    policy: HeartbeatPolicy,
    cancel: CancellationToken,
) {
    let local = host.peer_id();
    loop {
        let period = config.read().heartbeat_interval();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(period) => {}
        }
        let unreachable = heartbeat_round(&host, local, &relays, policy).await;
        if unreachable > 0 {
            debug!("{} relay(s) unreachable after heartbeat", unreachable);
        }
    }
    debug!("Heartbeat stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use parking_lot::Mutex;

    /// Connector whose peers start answering after a number of failures
    #[derive(Default)]
    struct ScriptedConnector {
        fail_first: HashMap<PeerId, usize>,
        never: HashSet<PeerId>,
        connected: HashSet<PeerId>,
        calls: Mutex<HashMap<PeerId, usize>>,
        total: AtomicUsize,
    }

    impl ScriptedConnector {
        fn calls(&self, peer: &PeerId) -> usize {
            self.calls.lock().get(peer).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, info: &PeerAddrInfo) -> Result<(), NetworkError> {
            self.total.fetch_add(1, Ordering::SeqCst);
            let n = {
                let mut calls = self.calls.lock();
                let n = calls.entry(info.peer_id).or_default();
                *n += 1;
                *n
            };
            let fail = self.never.contains(&info.peer_id)
                || n <= self.fail_first.get(&info.peer_id).copied().unwrap_or(0);
            if fail {
                Err(NetworkError::Dial {
                    peer_id: info.peer_id,
                    reason: "refused".to_string(),
                })
            } else {
                Ok(())
            }
        }

        async fn is_connected(&self, peer_id: PeerId) -> bool {
            self.connected.contains(&peer_id)
        }
    }

    fn relay_map(names: &[(&str, PeerId)]) -> SharedRelayMap {
        let mut map = RelayMap::new();
        for (name, peer) in names {
            map.insert(
                *name,
                PeerAddrInfo::new(*peer, vec!["/ip4/1.2.3.4/tcp/20006".parse().unwrap()]),
            );
        }
        Arc::new(RwLock::new(map))
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(20),
            deadline: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_bootstrap_skips_self() {
        let local = PeerId::random();
        let relays = relay_map(&[("self", local)]);
        let connector = ScriptedConnector::default();

        bootstrap_connect(&connector, local, &relays, fast_policy()).await.unwrap();
        assert_eq!(connector.total.load(Ordering::SeqCst), 0);
        assert_eq!(relays.read().len(), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_retries_until_connected() {
        let relay = PeerId::random();
        let relays = relay_map(&[("relay-1", relay)]);
        let connector = ScriptedConnector {
            fail_first: HashMap::from([(relay, 2)]),
            ..Default::default()
        };

        bootstrap_connect(&connector, PeerId::random(), &relays, fast_policy())
            .await
            .unwrap();
        assert_eq!(connector.calls(&relay), 3);
        assert!(relays.read().contains("relay-1"));
    }

    #[tokio::test]
    async fn test_bootstrap_removes_unreachable_relays() {
        let good = PeerId::random();
        let bad = PeerId::random();
        let relays = relay_map(&[("good", good), ("bad", bad)]);
        let connector = ScriptedConnector {
            never: HashSet::from([bad]),
            ..Default::default()
        };

        let result = bootstrap_connect(&connector, PeerId::random(), &relays, fast_policy()).await;
        assert!(matches!(result, Err(TunnelError::BootstrapIncomplete { failed: 1 })));

        let map = relays.read();
        assert!(map.contains("good"));
        assert!(!map.contains("bad"));
        // good is only dialed in the first round
        assert_eq!(connector.calls(&good), 1);
        assert!(connector.calls(&bad) > 1);
    }

    #[tokio::test]
    async fn test_heartbeat_skips_connected_relays() {
        let up = PeerId::random();
        let down = PeerId::random();
        let relays = relay_map(&[("up", up), ("down", down)]);
        let connector = ScriptedConnector {
            connected: HashSet::from([up]),
            fail_first: HashMap::from([(down, 1)]),
            ..Default::default()
        };
        let policy = HeartbeatPolicy {
            attempts: 3,
            spacing: Duration::from_millis(5),
            connect_timeout: Duration::from_secs(1),
        };

        let unreachable = heartbeat_round(&connector, PeerId::random(), &relays, policy).await;
        assert_eq!(unreachable, 0);
        assert_eq!(connector.calls(&up), 0);
        assert_eq!(connector.calls(&down), 2);
    }

    #[tokio::test]
    async fn test_heartbeat_gives_up_after_attempts() {
        let down = PeerId::random();
        let relays = relay_map(&[("down", down)]);
        let connector = ScriptedConnector {
            never: HashSet::from([down]),
            ..Default::default()
        };
        let policy = HeartbeatPolicy {
            attempts: 3,
            spacing: Duration::from_millis(5),
            connect_timeout: Duration::from_secs(1),
        };

        assert_eq!(heartbeat_round(&connector, PeerId::random(), &relays, policy).await, 1);
        assert_eq!(connector.calls(&down), 3);
        // heartbeat never edits the relay map
        assert!(relays.read().contains("down"));
    }
}
