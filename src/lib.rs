//! An anonymous-to-authenticated SOCKS5 bridge
//!
//! Local clients that can only speak anonymous SOCKS5 connect to the
//! bridge on a loopback port. Each connection is relayed through a real
//! upstream SOCKS5 proxy that may demand username/password authentication.
//!
//! ## SOCKS5 Implementation
//!
//! - Features:
//!     - CONNECT and BIND towards the local client, no authentication
//!     - CONNECT towards the upstream, no authentication or
//!       username/password
//!     - Async using tokio, one task per session and two per relay
//!     - Reference-counted start/stop of the listener
//!     - Time-out bounded handshakes, connects and idle relays
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)
//!
//! # Example
//! ```no_run
//! use socks5bridge::{BridgeLifecycle, BridgeSettings, Credentials, ProxyConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProxyConfig::new("proxy.example.com", 1080, 1081)
//!         .with_auth(Some(Credentials::new("user", "pass")));
//!     config.validate()?;
//!
//!     let bridge = BridgeLifecycle::new(config, BridgeSettings::default());
//!     let handle = bridge.acquire().await?;
//!     println!("bridge listening on {}", handle.local_addr());
//!
//!     tokio::signal::ctrl_c().await?;
//!     drop(handle);
//!     bridge.wait_stopped().await;
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod handshake;
pub mod lifecycle;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;

// Re-export main types at crate root for convenience
pub use address::Address;
pub use auth::Credentials;
pub use config::{BridgeSettings, ProxyConfig};
pub use error::SocksError;
pub use lifecycle::{BridgeHandle, BridgeLifecycle};
pub use protocol::{AuthMethod, Command, ReplyCode, Version};
pub use relay::{RelayCounters, RelayStats};
pub use server::BridgeServer;
pub use session::SessionState;
