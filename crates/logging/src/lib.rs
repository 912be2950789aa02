//! EdgeMesh Logging
//!
//! One-time `tracing` subscriber setup shared by the EdgeMesh binaries.

use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Directives used when `RUST_LOG` is not set
pub const DEFAULT_DIRECTIVES: &str = "info,edgemesh=debug";

/// Filter for the given verbosity; `RUST_LOG` wins when present
pub fn build_filter(enable_libp2p_debug: bool) -> EnvFilter {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
    if enable_libp2p_debug {
        match "libp2p=debug".parse() {
            Ok(directive) => filter.add_directive(directive),
            Err(_) => filter,
        }
    } else {
        filter
    }
}

/// Install the global subscriber. Returns false when one was already set.
pub fn init_logging(enable_libp2p_debug: bool) -> bool {
    let filter = build_filter(enable_libp2p_debug);
    let directives = filter.to_string();
    let installed = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .is_ok();
    if installed {
        debug!("Logging initialised with filter {}", directives);
    }
    installed
}
