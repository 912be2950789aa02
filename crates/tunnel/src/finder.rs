//! Relay finder
//!
//! Feeds relay candidates to the host's autorelay and keeps the relay map in
//! step with what the DHT knows about mapped nodes.

use edgemesh_network::{HostHandle, PeerAddrInfo, PeerId, RelayMap};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bootstrap::SharedRelayMap;
use crate::peers::NodePeerMap;
use crate::tunnel::SharedConfig;

/// Result of folding a closest-peers answer into the relay map
#[derive(Debug, Default)]
pub struct FinderUpdate {
    /// Peers to offer as relay candidates
    pub candidates: Vec<PeerAddrInfo>,
    /// Node names whose relay entry was added or grew
    pub refreshed: Vec<String>,
}

/// Merge `closest` into `relays`.
///
/// Every peer with addresses becomes a candidate. Peers mapped to a node name
/// refresh that node's relay entry.
pub fn apply_closest_peers(
    relays: &mut RelayMap,
    peers: &NodePeerMap,
    local: PeerId,
    closest: Vec<PeerAddrInfo>,
) -> FinderUpdate {
    let mut update = FinderUpdate::default();
    for info in closest {
        if info.peer_id == local || info.addrs.is_empty() {
            continue;
        }
        if let Some(node_name) = peers.node_name_of(&info.peer_id) {
            if relays.refresh(&node_name, info.clone()) {
                update.refreshed.push(node_name);
            }
        }
        update.candidates.push(info);
    }
    update
}

/// One finder pass
pub async fn find_relays(host: &HostHandle, relays: &SharedRelayMap, peers: &NodePeerMap) {
    let local = host.peer_id();

    let known: Vec<PeerAddrInfo> = relays
        .read()
        .iter()
        .filter(|(_, info)| info.peer_id != local)
        .map(|(_, info)| info.clone())
        .collect();
    for info in known {
        host.offer_relay_candidate(info);
    }

    let closest = match host.closest_peers(local).await {
        Ok(closest) => closest,
        Err(e) => {
            debug!("Relay finder DHT query failed: {}", e);
            return;
        }
    };

    let update = apply_closest_peers(&mut relays.write(), peers, local, closest);
    for info in update.candidates {
        host.offer_relay_candidate(info);
    }
    if !update.refreshed.is_empty() {
        info!("Relay map refreshed for {:?}", update.refreshed);
        let snapshot: Vec<PeerAddrInfo> =
            relays.read().iter().map(|(_, info)| info.clone()).collect();
        if let Err(e) = host.set_relays(snapshot).await {
            warn!("Failed to update host relay set: {}", e);
        }
    }
}

/// Run finder passes every `finderPeriod`, the first one right away
pub(crate) async fn run_relay_finder(
    host: HostHandle,
    relays: SharedRelayMap,
    peers: NodePeerMap,
    config: SharedConfig,
    cancel: CancellationToken,
) {
    loop {
        find_relays(&host, &relays, &peers).await;
        let period = config.read().finder_interval();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
    }
    debug!("Relay finder stopped");
}
