use crate::client::UpstreamConnector;
use crate::config::{BridgeSettings, ProxyConfig};
use crate::error::SocksError;
use crate::session::{Session, SessionContext};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::TcpListener,
    select,
    sync::{Semaphore, oneshot},
    time::sleep,
};
use tracing::{debug, error, info};

/// First delay after a failed accept, doubled per consecutive failure
const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// accept_backoff is the pause before the next accept after `failures`
/// consecutive accept errors
fn accept_backoff(failures: u32) -> Duration {
    let doublings = failures.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_BASE
        .saturating_mul(1 << doublings)
        .min(ACCEPT_BACKOFF_MAX)
}

/// BridgeServer is the anonymous SOCKS5 endpoint that local clients talk
/// to. Every accepted connection is bridged to the configured upstream
/// proxy on its own task
pub struct BridgeServer {
    pub listen_addr: SocketAddr,
    ctx: Arc<SessionContext>,
    listener: Option<TcpListener>,
}

/// BridgeServer implementation block
impl BridgeServer {
    /// new is a constructor for the BridgeServer type. The listener binds
    /// `settings.bind_ip` on `config.bridge_port`, where port 0 picks an
    /// ephemeral port
    pub fn new(config: ProxyConfig, settings: BridgeSettings) -> Self {
        let listen_addr = SocketAddr::new(settings.bind_ip, config.bridge_port);
        let connector = UpstreamConnector::new(config, settings.io_timeout);

        Self {
            listen_addr,
            ctx: Arc::new(SessionContext {
                connector,
                settings,
            }),
            listener: None,
        }
    }

    /// bind to the listen address. Binding again returns the address that
    /// is already bound
    pub async fn bind(&mut self) -> Result<SocketAddr, SocksError> {
        if let Some(listener) = &self.listener {
            return Ok(listener.local_addr()?);
        }

        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|source| SocksError::BindFailed {
                addr: self.listen_addr,
                source,
            })?;
        let addr = listener.local_addr()?;

        info!(
            "proxy bridge listening on {} for {}",
            addr,
            self.ctx.connector.config()
        );

        self.listener = Some(listener);
        Ok(addr)
    }

    /// run accepts connections until `shutdown` fires or its sender is
    /// dropped. Only the accept loop stops; sessions already running are
    /// left to drain
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> Result<(), SocksError> {
        self.bind().await?;
        let Some(listener) = self.listener.take() else {
            return Err(SocksError::Protocol("listener vanished after bind".into()));
        };
        let local_addr = listener.local_addr()?;

        let sessions = Arc::new(Semaphore::new(self.ctx.settings.max_sessions));
        let mut accept_failures: u32 = 0;

        loop {
            // Wait for a session slot before taking the next connection
            let permit = select! {
                biased;
                _ = &mut shutdown => break,
                permit = Arc::clone(&sessions).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Accept incoming connection
            let accepted = select! {
                biased;
                _ = &mut shutdown => break,
                accepted = listener.accept() => accepted,
            };
            let (inbound, peer_addr) = match accepted {
                Ok(accepted) => {
                    accept_failures = 0;
                    accepted
                }
                Err(e) => {
                    // Errors like EMFILE persist across retries
                    accept_failures = accept_failures.saturating_add(1);
                    let backoff = accept_backoff(accept_failures);
                    error!(
                        "accept error on {}: {} (retrying in {:?})",
                        local_addr, e, backoff
                    );
                    select! {
                        biased;
                        _ = &mut shutdown => break,
                        _ = sleep(backoff) => {}
                    }
                    continue;
                }
            };

            let ctx = Arc::clone(&self.ctx);

            // Spawn async task
            tokio::spawn(async move {
                let _permit = permit;

                info!("new client: {}", peer_addr);
                if let Err(e) = inbound.set_nodelay(true) {
                    debug!("set_nodelay on {}: {}", peer_addr, e);
                }

                let session = Session::new(inbound, peer_addr);
                let id = session.id();
                match session.run(&ctx).await {
                    Ok(stats) => debug!(
                        "SESSION[{id}] relayed {} bytes out, {} bytes in",
                        stats.client_to_upstream, stats.upstream_to_client
                    ),
                    Err(e) => error!("SESSION[{id}] connection error: {}", e),
                }
            });
        }

        info!("proxy bridge on {} stopped accepting", local_addr);
        Ok(())
    }
}
