//! Error types for the bridge
//!
//! # Error Categories
//!
//! - **Protocol errors**: malformed bytes, wrong version, unsupported
//!   address or command type
//! - **Upstream errors**: credential rejection, non-success replies
//! - **Transport errors**: I/O failures and timeouts on either leg
//! - **Lifecycle errors**: the listener could not be bound, bad configuration

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::protocol::ReplyCode;
use crate::session::SessionState;

/// Error types for SOCKS5 bridge operations
#[derive(Debug, Error)]
pub enum SocksError {
    /// ATYP byte is not IPv4, domain or IPv6
    #[error("unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    /// Peer closed the stream in the middle of a message
    #[error("unexpected end of stream")]
    UnexpectedEndOfStream,

    /// Domain names are length-prefixed by a single byte
    #[error("domain name too long: {0} bytes (max 255)")]
    DomainTooLong(usize),

    /// Username or password does not fit the RFC 1929 length byte
    #[error("{field} too long: {len} bytes (max 255)")]
    CredentialTooLong {
        /// Which credential field
        field: &'static str,
        /// Its length in bytes
        len: usize,
    },

    /// Version byte of a greeting was not 0x05
    #[error("protocol version mismatch: expected 0x05, got {0:#04x}")]
    ProtocolVersionMismatch(u8),

    /// Any other malformed message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Command byte is neither CONNECT nor BIND
    #[error("command not supported: {0:#04x}")]
    CommandNotSupported(u8),

    /// Upstream picked a method we did not offer
    #[error("no acceptable authentication method (server selected {0:#04x})")]
    NoAcceptableAuthMethod(u8),

    /// Upstream rejected the configured credentials
    #[error("upstream proxy rejected username/password")]
    AuthenticationFailed,

    /// Upstream answered the command with a failure reply
    #[error("upstream proxy replied: {0}")]
    ServerReply(ReplyCode),

    /// Upstream answered with an unassigned reply code
    #[error("upstream proxy replied with unknown code {0:#04x}")]
    UnknownReply(u8),

    /// I/O failure on either leg
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    /// A bounded read, write, connect or accept ran out of time
    #[error("operation timed out")]
    Timeout,

    /// The bridge listener could not be bound
    #[error("failed to bind bridge listener on {addr}: {source}")]
    BindFailed {
        /// Address we tried to bind
        addr: SocketAddr,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Rejected configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The session state machine was asked to take an undefined edge
    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// State before
        from: SessionState,
        /// Requested state
        to: SessionState,
    },
}

impl SocksError {
    /// reply_code is the reply the local client should receive for this
    /// error, or None when no reply may be written (a greeting that is not
    /// SOCKS5 gets the connection closed without an answer)
    pub fn reply_code(&self) -> Option<ReplyCode> {
        match self {
            SocksError::ProtocolVersionMismatch(_) => None,
            SocksError::UnsupportedAddressType(_) => Some(ReplyCode::AddressTypeNotSupported),
            SocksError::CommandNotSupported(_) => Some(ReplyCode::CommandNotSupported),
            SocksError::ServerReply(code) => Some(*code),
            SocksError::Transport(e) => Some(ReplyCode::from_io_error(e)),
            SocksError::Timeout => Some(ReplyCode::TtlExpired),
            SocksError::BindFailed { source, .. } => Some(ReplyCode::from_io_error(source)),
            _ => Some(ReplyCode::GeneralFailure),
        }
    }
}

impl From<io::Error> for SocksError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => SocksError::UnexpectedEndOfStream,
            io::ErrorKind::TimedOut => SocksError::Timeout,
            _ => SocksError::Transport(e),
        }
    }
}

impl From<tokio::time::error::Elapsed> for SocksError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        SocksError::Timeout
    }
}
