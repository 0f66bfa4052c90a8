//! Inbound leg: the anonymous SOCKS5 server side spoken to the trusted
//! local client

use crate::address::{Address, encode_address, read_address_and_port};
use crate::error::SocksError;
use crate::protocol::{AuthMethod, Command, RSV, ReplyCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Request is a parsed command message from the local client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub target: Address,
    pub port: u16,
}

/// accept runs method negotiation and reads the command message.
///
/// A greeting that is not SOCKS5 fails with `ProtocolVersionMismatch`
/// and must be answered by closing the connection. Every other error
/// carries a reply code (see `SocksError::reply_code`) so the caller can
/// send a well-formed reply before closing.
pub async fn accept<S>(stream: &mut S) -> Result<Request, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_no_auth(stream).await?;
    read_request(stream).await
}

/// negotiate_no_auth reads the client greeting and always selects "no
/// authentication required". Whatever the client offers is irrelevant on
/// this leg
async fn negotiate_no_auth<S>(stream: &mut S) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ClientHello format
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    let version = buf[0];
    let n_methods = buf[1];

    // Ensure version is 0x05 -> SOCKS5
    if version != Version::SOCKS5 as u8 {
        return Err(SocksError::ProtocolVersionMismatch(version));
    }

    let mut methods = vec![0u8; n_methods as usize];
    stream.read_exact(&mut methods).await?;
    debug!("client offered methods {:02x?}", methods);

    stream
        .write_all(&[Version::SOCKS5 as u8, AuthMethod::NoAuth as u8])
        .await?;

    Ok(())
}

/// read_request parses the command message. The address is consumed
/// before the command byte is judged so that a rejected request leaves
/// nothing unread on the socket
async fn read_request<S>(stream: &mut S) -> Result<Request, SocksError>
where
    S: AsyncRead + Unpin,
{
    // SOCKS5 request format
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    let mut reqbuf = [0u8; 3];
    stream.read_exact(&mut reqbuf).await?;

    let version = reqbuf[0];
    let command = reqbuf[1];
    // Not checking RSV (RESERVED) -> 0x00

    if version != Version::SOCKS5 as u8 {
        return Err(SocksError::Protocol(format!(
            "request version {version:#04x}, expected 0x05"
        )));
    }

    let (target, port) = read_address_and_port(stream).await?;

    let command = Command::from_byte(command).ok_or(SocksError::CommandNotSupported(command))?;

    Ok(Request {
        command,
        target,
        port,
    })
}

/// send_reply writes a reply frame to the local client
pub async fn send_reply<S>(
    stream: &mut S,
    reply_code: ReplyCode,
    bound_addr: &Address,
    bound_port: u16,
) -> Result<(), SocksError>
where
    S: AsyncWrite + Unpin,
{
    // SOCKS5 reply format
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    let mut reply = vec![Version::SOCKS5 as u8, reply_code as u8, RSV];
    reply.extend_from_slice(&encode_address(bound_addr, bound_port)?);

    stream.write_all(&reply).await?;
    stream.flush().await?;
    Ok(())
}

/// send_failure writes a failure reply with BND 0.0.0.0:0
pub async fn send_failure<S>(stream: &mut S, reply_code: ReplyCode) -> Result<(), SocksError>
where
    S: AsyncWrite + Unpin,
{
    send_reply(stream, reply_code, &Address::unspecified(), 0).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn connect_request_is_parsed() {
        let (mut server, mut client) = duplex(256);

        let client_side = tokio::spawn(async move {
            // offers no-auth and userpass, gets no-auth regardless
            client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
            let mut choice = [0u8; 2];
            client.read_exact(&mut choice).await.unwrap();
            assert_eq!(choice, [0x05, 0x00]);

            client
                .write_all(&[0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x01, 0xBB])
                .await
                .unwrap();
            client
        });

        let request = accept(&mut server).await.unwrap();
        assert_eq!(
            request,
            Request {
                command: Command::Connect,
                target: Address::IPv4([93, 184, 216, 34]),
                port: 443,
            }
        );
        client_side.await.unwrap();
    }

    #[tokio::test]
    async fn bind_request_is_parsed() {
        let (mut server, mut client) = duplex(256);

        tokio::spawn(async move {
            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut choice = [0u8; 2];
            client.read_exact(&mut choice).await.unwrap();
            client
                .write_all(&[0x05, 0x02, 0x00, 0x03, 3, b'f', b't', b'p', 0, 21])
                .await
                .unwrap();
            client
        });

        let request = accept(&mut server).await.unwrap();
        assert_eq!(request.command, Command::Bind);
        assert_eq!(request.target, Address::DomainName("ftp".into()));
        assert_eq!(request.port, 21);
    }

    #[tokio::test]
    async fn socks4_greeting_gets_no_method_reply() {
        let (mut server, mut client) = duplex(256);

        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        let err = accept(&mut server).await.unwrap_err();
        assert!(matches!(err, SocksError::ProtocolVersionMismatch(0x04)));
        assert_eq!(err.reply_code(), None);

        // Nothing was written back
        drop(server);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn unknown_command_is_reportable() {
        let (mut server, mut client) = duplex(256);

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client
            .write_all(&[0x05, 0x09, 0x00, 0x01, 127, 0, 0, 1, 0, 25])
            .await
            .unwrap();

        let err = accept(&mut server).await.unwrap_err();
        assert!(matches!(err, SocksError::CommandNotSupported(0x09)));
        assert_eq!(err.reply_code(), Some(ReplyCode::CommandNotSupported));
    }

    #[tokio::test]
    async fn udp_associate_is_not_supported() {
        let (mut server, mut client) = duplex(256);

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client
            .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let err = accept(&mut server).await.unwrap_err();
        assert_eq!(err.reply_code(), Some(ReplyCode::CommandNotSupported));
    }

    #[tokio::test]
    async fn unsupported_address_type_is_reportable() {
        let (mut server, mut client) = duplex(256);

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00, 0x02]).await.unwrap();

        let err = accept(&mut server).await.unwrap_err();
        assert!(matches!(err, SocksError::UnsupportedAddressType(0x02)));
        assert_eq!(err.reply_code(), Some(ReplyCode::AddressTypeNotSupported));
    }

    #[tokio::test]
    async fn reply_frames_are_well_formed() {
        let (mut server, mut client) = duplex(256);

        send_failure(&mut server, ReplyCode::CommandNotSupported)
            .await
            .unwrap();
        send_reply(
            &mut server,
            ReplyCode::Succeeded,
            &Address::IPv6(std::net::Ipv6Addr::LOCALHOST.octets()),
            2525,
        )
        .await
        .unwrap();
        drop(server);

        let mut bytes = Vec::new();
        client.read_to_end(&mut bytes).await.unwrap();
        assert_eq!(&bytes[..10], &[0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[10..14], &[0x05, 0x00, 0x00, 0x04]);
        assert_eq!(bytes[14 + 15], 1);
        assert_eq!(&bytes[30..], &2525u16.to_be_bytes());
    }
}
