//! Per-connection state of the bridge
//!
//! ```text
//! Accepted -> Handshaking -> CommandKnown -> UpstreamConnecting -> Relaying -> Closed
//!                                        \-> AwaitingPeer -------/
//! Accepted | Handshaking | CommandKnown | UpstreamConnecting | AwaitingPeer -> Failed -> Closed
//! ```

use crate::address::Address;
use crate::client::UpstreamConnector;
use crate::config::BridgeSettings;
use crate::error::SocksError;
use crate::handshake::{self, Request};
use crate::protocol::{Command, ReplyCode};
use crate::relay::{Relay, RelayStats};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tracing::{debug, info, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// next_session_id hands out process-wide, strictly increasing ids
pub fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// SessionState is where a session is in its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    Handshaking,
    CommandKnown,
    UpstreamConnecting,
    AwaitingPeer,
    Relaying,
    Failed,
    Closed,
}

/// SessionState implementation block
impl SessionState {
    /// can_transition lists every legal edge of the session state machine
    pub fn can_transition(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Accepted, Handshaking)
                | (Handshaking, CommandKnown)
                | (CommandKnown, UpstreamConnecting)
                | (CommandKnown, AwaitingPeer)
                | (UpstreamConnecting, Relaying)
                | (AwaitingPeer, Relaying)
                | (Relaying, Closed)
                | (Failed, Closed)
                | (
                    Accepted | Handshaking | CommandKnown | UpstreamConnecting | AwaitingPeer,
                    Failed
                )
        )
    }

    /// transition returns the next state or rejects an undefined edge
    pub fn transition(self, to: SessionState) -> Result<SessionState, SocksError> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(SocksError::InvalidTransition { from: self, to })
        }
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }
}

/// SessionContext is what every session needs from the server
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub connector: UpstreamConnector,
    pub settings: BridgeSettings,
}

/// Session owns the accepted local socket and, once established, the
/// remote socket. Nothing else touches either socket
#[derive(Debug)]
pub struct Session {
    id: u64,
    peer_addr: SocketAddr,
    local: TcpStream,
    remote: Option<TcpStream>,
    state: SessionState,
}

/// Session implementation block
impl Session {
    /// new wraps a freshly accepted connection
    pub fn new(local: TcpStream, peer_addr: SocketAddr) -> Self {
        let id = next_session_id();
        info!("SESSION[{id}] opened from {peer_addr}");
        Self {
            id,
            peer_addr,
            local,
            remote: None,
            state: SessionState::Accepted,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn enter(&mut self, to: SessionState) -> Result<(), SocksError> {
        self.state = self.state.transition(to)?;
        debug!("SESSION[{}] -> {:?}", self.id, self.state);
        Ok(())
    }

    /// run drives the session to completion and returns the relayed
    /// byte counts. Errors have already been answered on the local socket
    /// (when a reply was possible) by the time they are returned
    pub async fn run(mut self, ctx: &SessionContext) -> Result<RelayStats, SocksError> {
        match self.establish(ctx).await {
            Ok(remote) => self.remote = Some(remote),
            Err(e) => {
                self.fail(&e, ctx).await;
                return Err(e);
            }
        }

        self.enter(SessionState::Relaying)?;

        let Session {
            id,
            peer_addr,
            local,
            remote,
            mut state,
        } = self;
        let Some(remote) = remote else {
            return Err(SocksError::Protocol("relaying without a remote socket".into()));
        };

        let relay = Relay::new(
            ctx.settings.relay_buffer_size,
            ctx.settings.relay_idle_timeout,
        );
        let stats = relay.run(local, remote).await;

        state = state.transition(SessionState::Closed)?;
        info!("SESSION[{id}] closed from {peer_addr} ({state:?})");

        Ok(stats)
    }

    /// establish runs everything before relaying: handshake, command and
    /// the success reply
    async fn establish(&mut self, ctx: &SessionContext) -> Result<TcpStream, SocksError> {
        let io_timeout = ctx.settings.io_timeout;

        self.enter(SessionState::Handshaking)?;
        let request = timeout(io_timeout, handshake::accept(&mut self.local)).await??;

        info!(
            "SESSION[{}] {:?} {}",
            self.id,
            request.command,
            request.target.with_port(request.port)
        );
        self.enter(SessionState::CommandKnown)?;

        match request.command {
            Command::Connect => self.connect_upstream(ctx, &request).await,
            Command::Bind => self.accept_peer(ctx).await,
        }
    }

    /// connect_upstream opens the authenticated leg and acknowledges it
    /// with the bound address the upstream proxy reported
    async fn connect_upstream(
        &mut self,
        ctx: &SessionContext,
        request: &Request,
    ) -> Result<TcpStream, SocksError> {
        self.enter(SessionState::UpstreamConnecting)?;

        let upstream = ctx
            .connector
            .connect(self.id, &request.target, request.port)
            .await?;

        timeout(
            ctx.settings.io_timeout,
            handshake::send_reply(
                &mut self.local,
                ReplyCode::Succeeded,
                &upstream.bound_addr,
                upstream.bound_port,
            ),
        )
        .await??;

        Ok(upstream.stream)
    }

    /// accept_peer serves BIND: listen on an ephemeral port, announce it,
    /// accept exactly one peer and announce that peer
    async fn accept_peer(&mut self, ctx: &SessionContext) -> Result<TcpStream, SocksError> {
        let io_timeout = ctx.settings.io_timeout;
        self.enter(SessionState::AwaitingPeer)?;

        let local_ip = self.local.local_addr()?.ip();
        let listener = TcpListener::bind((local_ip, 0)).await?;
        let bound = listener.local_addr()?;

        debug!("SESSION[{}] BIND listening on {bound}", self.id);
        timeout(
            io_timeout,
            handshake::send_reply(
                &mut self.local,
                ReplyCode::Succeeded,
                &Address::from(bound),
                bound.port(),
            ),
        )
        .await??;

        let (peer, peer_addr) = timeout(io_timeout, listener.accept()).await??;
        drop(listener);

        info!("SESSION[{}] BIND accepted peer {peer_addr}", self.id);
        timeout(
            io_timeout,
            handshake::send_reply(
                &mut self.local,
                ReplyCode::Succeeded,
                &Address::from(peer_addr),
                peer_addr.port(),
            ),
        )
        .await??;

        Ok(peer)
    }

    /// fail answers the local client with the nearest reply code (when a
    /// reply is allowed) and closes the session
    async fn fail(&mut self, err: &SocksError, ctx: &SessionContext) {
        self.remote = None;

        match err.reply_code() {
            Some(code) => {
                match err {
                    SocksError::Transport(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                        warn!(
                            target: "socks5bridge",
                            "SESSION[{}] permission denied: unable to establish outbound connection to proxy, perhaps blocked by a firewall?",
                            self.id
                        );
                    }
                    _ => info!("SESSION[{}] failed ({code}): {err}", self.id),
                }

                let reply = handshake::send_failure(&mut self.local, code);
                match timeout(ctx.settings.io_timeout, reply).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("SESSION[{}] could not send failure reply: {e}", self.id),
                    Err(_) => debug!("SESSION[{}] failure reply timed out", self.id),
                }
            }
            None => info!("SESSION[{}] closing without reply: {err}", self.id),
        }

        if let Err(e) = self.local.shutdown().await {
            debug!("SESSION[{}] shutdown: {e}", self.id);
        }

        self.state = self
            .state
            .transition(SessionState::Failed)
            .and_then(|s| s.transition(SessionState::Closed))
            .unwrap_or(SessionState::Closed);
        info!("SESSION[{}] closed from {}", self.id, self.peer_addr);
    }
}
