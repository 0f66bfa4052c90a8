use crate::error::SocksError;
use crate::protocol::AddressType;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Address represents a network address or domain as carried in the
/// DST.ADDR / BND.ADDR field of a SOCKS5 message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    IPv4([u8; 4]),
    DomainName(String),
    IPv6([u8; 16]),
}

/// Address implementation block
impl Address {
    /// unspecified is 0.0.0.0, used as BND.ADDR in failure replies
    pub fn unspecified() -> Self {
        Address::IPv4([0; 4])
    }

    /// address_type returns the ATYP tag for this address
    pub fn address_type(&self) -> AddressType {
        match self {
            Address::IPv4(_) => AddressType::IPv4,
            Address::DomainName(_) => AddressType::DomainName,
            Address::IPv6(_) => AddressType::IPv6,
        }
    }

    /// to_ip returns the address as an IpAddr when it is not a domain
    pub fn to_ip(&self) -> Option<IpAddr> {
        match self {
            Address::IPv4(octets) => Some(IpAddr::V4(Ipv4Addr::from(*octets))),
            Address::IPv6(octets) => Some(IpAddr::V6(Ipv6Addr::from(*octets))),
            Address::DomainName(_) => None,
        }
    }

    /// with_port formats `host:port`, bracketing IPv6 literals
    pub fn with_port(&self, port: u16) -> String {
        match self {
            Address::IPv6(_) => format!("[{self}]:{port}"),
            _ => format!("{self}:{port}"),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::IPv4(octets) => write!(f, "{}", Ipv4Addr::from(*octets)),
            Address::DomainName(domain) => write!(f, "{domain}"),
            Address::IPv6(octets) => write!(f, "{}", Ipv6Addr::from(*octets)),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::IPv4(v4.octets()),
            IpAddr::V6(v6) => Address::IPv6(v6.octets()),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::from(addr.ip())
    }
}

/// read_address reads an ATYP-tagged address from the stream. The
/// domain form is only checked for UTF-8 here, resolving it is left to
/// whoever receives the address
pub async fn read_address<R>(stream: &mut R) -> Result<Address, SocksError>
where
    R: AsyncRead + Unpin,
{
    // Read address type byte from stream
    let atyp = stream.read_u8().await?;

    let address = match AddressType::from_byte(atyp) {
        Some(AddressType::IPv4) => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Address::IPv4(addr)
        }
        Some(AddressType::DomainName) => {
            // First octet in DomainName contains the number of
            // octets to follow
            let len = stream.read_u8().await?;

            let mut domain = vec![0u8; len as usize];
            stream.read_exact(&mut domain).await?;
            let domain = String::from_utf8(domain)
                .map_err(|e| SocksError::Protocol(format!("domain is not valid UTF-8: {e}")))?;

            Address::DomainName(domain)
        }
        Some(AddressType::IPv6) => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            Address::IPv6(addr)
        }
        None => return Err(SocksError::UnsupportedAddressType(atyp)),
    };

    Ok(address)
}

/// read_port reads a big-endian (network order) port
pub async fn read_port<R>(stream: &mut R) -> Result<u16, SocksError>
where
    R: AsyncRead + Unpin,
{
    Ok(stream.read_u16().await?)
}

/// read_address_and_port reads ATYP | ADDR | PORT
pub async fn read_address_and_port<R>(stream: &mut R) -> Result<(Address, u16), SocksError>
where
    R: AsyncRead + Unpin,
{
    let address = read_address(stream).await?;
    let port = read_port(stream).await?;
    Ok((address, port))
}

/// encode_address serializes ATYP | ADDR | PORT
pub fn encode_address(address: &Address, port: u16) -> Result<Vec<u8>, SocksError> {
    let mut buf = Vec::with_capacity(22);
    buf.push(address.address_type() as u8);

    match address {
        Address::IPv4(octets) => buf.extend_from_slice(octets),
        Address::IPv6(octets) => buf.extend_from_slice(octets),
        Address::DomainName(domain) => {
            let len = u8::try_from(domain.len())
                .map_err(|_| SocksError::DomainTooLong(domain.len()))?;
            buf.push(len);
            buf.extend_from_slice(domain.as_bytes());
        }
    }

    // Port in BE -> 2 bytes
    buf.extend_from_slice(&port.to_be_bytes());

    Ok(buf)
}
