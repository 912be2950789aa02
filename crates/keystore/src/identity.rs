//! Node-name derived identities
//!
//! Every node derives its own key pair from its Kubernetes node name, and any
//! other node can compute the same peer ID from the name alone. This removes
//! the need for an identity authority inside the cluster, but it also means
//! the node name is the only secret: whoever knows a name can act as that
//! node. Treat the resulting identity as an address, not as authentication.

use libp2p::identity::Keypair;
use libp2p::PeerId;
use sha2::{Digest, Sha256};

use crate::{KeystoreError, Result};

const IDENTITY_DOMAIN: &[u8] = b"edgemesh/node-identity/v1:";

/// Derive the Ed25519 key pair for `node_name`.
///
/// The name is used byte for byte: `"node-1"` and `"node-1\n"` are different
/// identities.
pub fn keypair_from_node_name(node_name: &str) -> Result<Keypair> {
    if node_name.is_empty() {
        return Err(KeystoreError::EmptyNodeName);
    }

    let mut hasher = Sha256::new();
    hasher.update(IDENTITY_DOMAIN);
    hasher.update(node_name.as_bytes());
    let seed: [u8; 32] = hasher.finalize().into();

    Keypair::ed25519_from_bytes(seed).map_err(|e| KeystoreError::InvalidKey(e.to_string()))
}

/// Peer ID of the node called `node_name`
pub fn peer_id_from_node_name(node_name: &str) -> Result<PeerId> {
    Ok(keypair_from_node_name(node_name)?.public().to_peer_id())
}
