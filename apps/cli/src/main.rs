//! EdgeMesh Tunnel CLI
//!
//! Runs a tunnel node and offers a few operator helpers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use edgemesh_core::{L4Protocol, ProxyOptions, TunnelConfig};
use edgemesh_keystore::{generate_psk, peer_id_from_node_name, save_psk};
use edgemesh_settings::{default_settings_path, ConfigWatcher, Settings, DEFAULT_POLL_INTERVAL};
use edgemesh_tunnel::{proxy_conn, EdgeTunnel, ProxyStreamProvider};

/// EdgeMesh tunnel agent
#[derive(Parser)]
#[command(name = "edgemesh-tunnel")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file
    #[arg(short, long, default_value_os_t = default_settings_path())]
    config: PathBuf,

    /// Enable verbose libp2p logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel until interrupted, reloading on settings changes
    Run {
        /// Override modules.edgeTunnel.nodeName
        #[arg(long)]
        node_name: Option<String>,
    },

    /// Run the tunnel and forward a local TCP port to a backend behind another node
    Forward {
        /// Local address to accept connections on
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        listen: String,

        /// Node that can reach the backend
        #[arg(short, long)]
        node: String,

        /// Backend IP as seen from that node
        #[arg(long)]
        target_ip: String,

        /// Backend port
        #[arg(long)]
        target_port: u16,
    },

    /// Print the peer ID derived from a node name
    PeerId {
        node_name: String,
    },

    /// Generate a private network key
    GenPsk {
        /// Output file
        #[arg(short, long, default_value = "/etc/edgemesh/psk")]
        out: PathBuf,
    },

    /// Write a settings file with defaults
    InitConfig {
        /// Node name to put in the file
        #[arg(long)]
        node_name: String,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { node_name } => {
            run(&cli.config, node_name, cli.verbose).await?;
        }
        Commands::Forward {
            listen,
            node,
            target_ip,
            target_port,
        } => {
            let opts =
                ProxyOptions::new(L4Protocol::Tcp.as_str(), node, target_ip, target_port.into());
            forward(&cli.config, &listen, opts, cli.verbose).await?;
        }
        Commands::PeerId { node_name } => {
            let peer_id = peer_id_from_node_name(&node_name)?;
            println!("{}", peer_id);
        }
        Commands::GenPsk { out } => {
            save_psk(&out, &generate_psk()).with_context(|| format!("writing {:?}", out))?;
            println!("Wrote pre-shared key to {:?}", out);
        }
        Commands::InitConfig { node_name, force } => {
            init_config(&cli.config, node_name, force)?;
        }
    }

    Ok(())
}

// ============================================================================
// Tunnel
// ============================================================================

fn load_tunnel_config(path: &PathBuf, verbose: bool) -> Result<TunnelConfig> {
    let settings = Settings::load_from(path).with_context(|| format!("loading {:?}", path))?;
    let config = settings.modules.edge_tunnel;
    edgemesh_logging::init_logging(verbose || config.enable_ipfs_log);
    Ok(config)
}

/// Settings for a node that should run, or `None` when the tunnel is disabled
fn enabled_tunnel_config(
    path: &PathBuf,
    node_name: Option<String>,
    verbose: bool,
) -> Result<Option<TunnelConfig>> {
    let mut config = load_tunnel_config(path, verbose)?;
    if let Some(name) = node_name {
        config.node_name = name;
    }
    if !config.enable {
        info!("Tunnel disabled in {:?}, nothing to do", path);
        return Ok(None);
    }
    Ok(Some(config))
}

async fn start_tunnel(config: TunnelConfig) -> Result<Arc<EdgeTunnel>> {
    let tunnel = Arc::new(EdgeTunnel::new(config).context("creating tunnel")?);
    tunnel.start().await.context("starting tunnel")?;
    info!("Node {} is {}", tunnel.node_name(), tunnel.peer_id());
    for addr in tunnel.listen_addrs().await {
        info!("Listening on {}", addr);
    }
    Ok(tunnel)
}

async fn run(path: &PathBuf, node_name: Option<String>, verbose: bool) -> Result<()> {
    let Some(config) = enabled_tunnel_config(path, node_name.clone(), verbose)? else {
        return Ok(());
    };

    let tunnel = start_tunnel(config).await?;
    let mut updates = ConfigWatcher::new(path, DEFAULT_POLL_INTERVAL).spawn();

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
            Some(settings) = updates.recv() => {
                let mut config = settings.modules.edge_tunnel;
                if let Some(name) = node_name.clone() {
                    config.node_name = name;
                }
                if let Err(e) = tunnel.reload(config).await {
                    warn!("Reload failed: {}", e);
                }
            }
        }
    }

    info!("Shutting down...");
    tunnel.shutdown().await;
    Ok(())
}

async fn forward(path: &PathBuf, listen: &str, opts: ProxyOptions, verbose: bool) -> Result<()> {
    let Some(config) = enabled_tunnel_config(path, None, verbose)? else {
        return Ok(());
    };
    let tunnel = start_tunnel(config).await?;

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {}", listen))?;
    info!("Forwarding {} to {} via {}", listen, opts.target(), opts.node_name);

    let provider: Arc<dyn ProxyStreamProvider> = tunnel.clone();
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        result = accept_loop(listener, provider, opts) => result?,
    }

    info!("Shutting down...");
    tunnel.shutdown().await;
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    provider: Arc<dyn ProxyStreamProvider>,
    opts: ProxyOptions,
) -> Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        let provider = provider.clone();
        let opts = opts.clone();
        tokio::spawn(async move {
            let stream = match provider.get_proxy_stream(opts).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Proxy stream for {} failed: {}", peer, e);
                    return;
                }
            };
            match proxy_conn(socket, stream).await {
                Ok((up, down)) => debug!("{} closed ({} bytes up, {} down)", peer, up, down),
                Err(e) => debug!("{} closed: {}", peer, e),
            }
        });
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn init_config(path: &PathBuf, node_name: String, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{:?} already exists, pass --force to overwrite", path);
    }
    let mut settings = Settings::default();
    settings.modules.edge_tunnel.node_name = node_name;
    settings.validate()?;
    settings.save_to(path)?;
    println!("Wrote settings to {:?}", path);
    Ok(())
}
