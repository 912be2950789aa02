//! Private network pre-shared keys (v1 format)

use std::path::Path;

use libp2p::pnet::PreSharedKey;
use rand::RngCore;
use tracing::info;

use crate::{KeystoreError, Result};

/// Read and parse a v1 PSK file
pub fn load_psk(path: impl AsRef<Path>) -> Result<PreSharedKey> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let psk: PreSharedKey = content.trim_start().parse().map_err(|e| KeystoreError::InvalidPsk {
        path: path.display().to_string(),
        reason: format!("{e}"),
    })?;
    info!("Loaded pre-shared key {} from {:?}", psk.fingerprint(), path);
    Ok(psk)
}

/// Generate a fresh random key
pub fn generate_psk() -> PreSharedKey {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    PreSharedKey::new(key)
}

/// Write `psk` to `path` in the v1 text format
pub fn save_psk(path: impl AsRef<Path>, psk: &PreSharedKey) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, psk.to_string())?;
    info!("Saved pre-shared key {} to {:?}", psk.fingerprint(), path);
    Ok(())
}
