//! EdgeMesh Keystore
//!
//! Key material for the tunnel overlay.
//!
//! ## Features
//!
//! - Deterministic libp2p Ed25519 identity derived from a node name
//! - Private-network pre-shared key loading and generation

mod identity;
mod psk;

pub use identity::{keypair_from_node_name, peer_id_from_node_name};
pub use psk::{generate_psk, load_psk, save_psk};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("Node name is empty")]
    EmptyNodeName,

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Invalid pre-shared key in {path}: {reason}")]
    InvalidPsk { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, KeystoreError>;
