use crate::auth::Credentials;
use crate::error::SocksError;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Default timeout on handshake I/O, upstream connects and BIND accepts
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time a relay direction may sit without data before teardown
pub const DEFAULT_RELAY_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default cap on concurrently handled sessions
pub const DEFAULT_MAX_SESSIONS: usize = 100;

/// Default relay buffer size per direction
pub const DEFAULT_RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// ProxyConfig describes the real upstream proxy and the local port the
/// bridge answers on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub remote_proxy_host: String,
    pub remote_proxy_port: u16,
    pub credentials: Option<Credentials>,
    pub bridge_port: u16,
}

/// ProxyConfig implementation block
impl ProxyConfig {
    /// new is a constructor for an anonymous upstream
    pub fn new(remote_proxy_host: impl Into<String>, remote_proxy_port: u16, bridge_port: u16) -> Self {
        Self {
            remote_proxy_host: remote_proxy_host.into(),
            remote_proxy_port,
            credentials: None,
            bridge_port,
        }
    }

    /// with_auth applies the upstream credentials
    pub fn with_auth(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// requires_auth tells whether the username/password method is offered
    pub fn requires_auth(&self) -> bool {
        self.credentials.is_some()
    }

    /// upstream_addr formats `host:port` for connecting to the upstream
    pub fn upstream_addr(&self) -> String {
        match self.remote_proxy_host.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{ip}]:{}", self.remote_proxy_port),
            _ => format!("{}:{}", self.remote_proxy_host, self.remote_proxy_port),
        }
    }

    /// validate rejects configurations the bridge cannot run with. An
    /// unset bridge port is a caller error, the bridge itself will happily
    /// bind an ephemeral port
    pub fn validate(&self) -> Result<(), SocksError> {
        if self.remote_proxy_host.trim().is_empty() {
            return Err(SocksError::InvalidConfig("remote proxy host is empty".into()));
        }
        if self.remote_proxy_port == 0 {
            return Err(SocksError::InvalidConfig("remote proxy port must not be 0".into()));
        }
        if self.bridge_port == 0 {
            return Err(SocksError::InvalidConfig("proxy bridge port must not be 0".into()));
        }
        if let Some(creds) = &self.credentials {
            creds.validate()?;
        }
        Ok(())
    }
}

impl fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.upstream_addr())?;
        if let Some(creds) = &self.credentials {
            write!(
                f,
                ", username: {}, proxy bridge @ localhost:{}",
                creds.username, self.bridge_port
            )?;
        }
        Ok(())
    }
}

/// BridgeSettings are the tunables of the local server
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// IP the bridge listener binds to
    pub bind_ip: IpAddr,
    pub io_timeout: Duration,
    pub relay_idle_timeout: Duration,
    pub max_sessions: usize,
    pub relay_buffer_size: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            io_timeout: DEFAULT_IO_TIMEOUT,
            relay_idle_timeout: DEFAULT_RELAY_IDLE_TIMEOUT,
            max_sessions: DEFAULT_MAX_SESSIONS,
            relay_buffer_size: DEFAULT_RELAY_BUFFER_SIZE,
        }
    }
}

impl BridgeSettings {
    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn with_relay_idle_timeout(mut self, timeout: Duration) -> Self {
        self.relay_idle_timeout = timeout;
        self
    }

    /// with_max_sessions sets the session cap, at least one
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max.max(1);
        self
    }

    pub fn with_relay_buffer_size(mut self, size: usize) -> Self {
        self.relay_buffer_size = size.max(1);
        self
    }
}
