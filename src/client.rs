//! Outbound leg: the SOCKS5 client that talks to the real upstream proxy
//!
//! 1. Method negotiation, with RFC 1929 username/password when the proxy
//!    asks for it
//! 2. CONNECT request for the target the local client asked for
//! 3. Reply parsing, consuming BND.ADDR/BND.PORT to keep the stream aligned

use crate::address::{Address, encode_address, read_address_and_port};
use crate::auth::{Credentials, negotiate_method};
use crate::config::ProxyConfig;
use crate::error::SocksError;
use crate::protocol::{Command, RSV, ReplyCode, Version};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// connect runs the full client handshake on an already-open stream to
/// the upstream proxy and returns the bound address the proxy reported
pub async fn connect<S>(
    stream: &mut S,
    credentials: Option<&Credentials>,
    target: &Address,
    port: u16,
) -> Result<(Address, u16), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_method(stream, credentials).await?;

    // SOCKS5 request format
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    let mut request = vec![Version::SOCKS5 as u8, Command::Connect as u8, RSV];
    request.extend_from_slice(&encode_address(target, port)?);
    stream.write_all(&request).await?;

    debug!("sent CONNECT {} upstream", target.with_port(port));

    read_reply(stream).await
}

/// read_reply reads a SOCKS5 reply frame. The bound address is read even
/// on failure replies
async fn read_reply<S>(stream: &mut S) -> Result<(Address, u16), SocksError>
where
    S: AsyncRead + Unpin,
{
    // SOCKS5 reply format
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    let mut head = [0u8; 3];
    stream.read_exact(&mut head).await?;

    if head[0] != Version::SOCKS5 as u8 {
        return Err(SocksError::ProtocolVersionMismatch(head[0]));
    }

    let (bound, bound_port) = read_address_and_port(stream).await?;

    match ReplyCode::from_byte(head[1]) {
        Some(ReplyCode::Succeeded) => {
            debug!("upstream bound {}", bound.with_port(bound_port));
            Ok((bound, bound_port))
        }
        Some(code) => Err(SocksError::ServerReply(code)),
        None => Err(SocksError::UnknownReply(head[1])),
    }
}

/// Upstream is an established, handshaken connection through the
/// upstream proxy
pub struct Upstream {
    pub stream: TcpStream,
    pub bound_addr: Address,
    pub bound_port: u16,
}

/// UpstreamConnector opens new legs to the configured upstream proxy
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    config: ProxyConfig,
    io_timeout: Duration,
}

/// UpstreamConnector implementation block
impl UpstreamConnector {
    /// new is a constructor for the UpstreamConnector type
    pub fn new(config: ProxyConfig, io_timeout: Duration) -> Self {
        Self { config, io_timeout }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// connect dials the upstream proxy and asks it to CONNECT to the
    /// target. Both the TCP connect and the handshake are bounded by the
    /// I/O timeout. No retries
    pub async fn connect(
        &self,
        session_id: u64,
        target: &Address,
        port: u16,
    ) -> Result<Upstream, SocksError> {
        let upstream_addr = self.config.upstream_addr();

        if self.config.requires_auth() {
            info!(target: "socks5bridge", "SESSION[{session_id}] bridging to remote proxy {}", self.config);
        } else {
            info!(target: "socks5bridge", "SESSION[{session_id}] bridging anonymously to remote proxy {upstream_addr}");
        }

        let mut stream = timeout(self.io_timeout, TcpStream::connect(&upstream_addr)).await??;
        stream.set_nodelay(true)?;

        let (bound_addr, bound_port) = timeout(
            self.io_timeout,
            connect(&mut stream, self.config.credentials.as_ref(), target, port),
        )
        .await?
        .map_err(|e| match e {
            // A bad version from upstream still deserves a reply downstream
            SocksError::ProtocolVersionMismatch(v) => {
                SocksError::Protocol(format!("upstream proxy answered with version {v:#04x}"))
            }
            e => e,
        })?;

        Ok(Upstream {
            stream,
            bound_addr,
            bound_port,
        })
    }
}
