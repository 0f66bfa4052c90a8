use anyhow::{Context, Result, bail};
use clap::Parser;
use socks5bridge::{BridgeLifecycle, BridgeSettings, Credentials, ProxyConfig};
use std::{net::IpAddr, time::Duration};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "A local anonymous SOCKS5 bridge to an authenticated SOCKS5 proxy", long_about = None)]
struct Args {
    /// Upstream proxy host
    #[arg(long, env = "SOCKS5BRIDGE_PROXY_HOST")]
    proxy_host: String,

    /// Upstream proxy port
    #[arg(long, env = "SOCKS5BRIDGE_PROXY_PORT", default_value_t = 1080)]
    proxy_port: u16,

    /// Username for the upstream proxy
    #[arg(short, long, env = "SOCKS5BRIDGE_USERNAME")]
    username: Option<String>,

    /// Password for the upstream proxy
    #[arg(short, long, env = "SOCKS5BRIDGE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Local port the bridge listens on
    #[arg(short, long, env = "SOCKS5BRIDGE_BRIDGE_PORT", default_value_t = 1081)]
    bridge_port: u16,

    /// Local address the bridge binds to
    #[arg(long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Handshake and connect timeout in seconds
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Seconds a relay direction may stay idle before the session closes
    #[arg(long, default_value_t = 300)]
    idle_timeout: u64,

    /// Relay buffer size in bytes, per direction
    #[arg(long, default_value_t = 16 * 1024)]
    buffer_size: usize,

    /// Maximum number of concurrent sessions
    #[arg(long, default_value_t = 100)]
    max_sessions: usize,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// settings collects the server tunables given on the command line
    fn settings(&self) -> BridgeSettings {
        BridgeSettings::default()
            .with_bind_ip(self.bind)
            .with_io_timeout(Duration::from_secs(self.timeout))
            .with_relay_idle_timeout(Duration::from_secs(self.idle_timeout))
            .with_relay_buffer_size(self.buffer_size)
            .with_max_sessions(self.max_sessions)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    let settings = args.settings();

    // Check for auth and grab it if present
    let credentials = match (args.username, args.password) {
        (Some(u), Some(p)) => {
            info!("Authentication enabled");
            Some(Credentials::new(u, p))
        }
        (None, None) => None,
        _ => bail!("[ERR] must provide both username and password (or neither)"),
    };

    let config = ProxyConfig::new(args.proxy_host, args.proxy_port, args.bridge_port)
        .with_auth(credentials);
    config.validate().context("invalid proxy configuration")?;

    // Start the bridge
    info!("Starting SOCKS5 bridge to {}", config);
    let bridge = BridgeLifecycle::new(config, settings);
    let handle = bridge.acquire().await?;
    info!("Bridge ready on {}", handle.local_addr());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    // Release and wait for the listener to close
    handle.release();
    bridge.wait_stopped().await;
    info!("Bridge stopped");

    Ok(())
}
