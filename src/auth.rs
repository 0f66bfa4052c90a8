use crate::error::SocksError;
use crate::protocol::{AuthMethod, AuthStatus, USERPASS_VERSION, Version};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Credentials holds the username/password pair the upstream proxy
/// expects
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// new is a constructor for the Credentials type
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// validate checks both fields fit into their RFC 1929 length byte
    pub fn validate(&self) -> Result<(), SocksError> {
        for (field, value) in [("username", &self.username), ("password", &self.password)] {
            if value.len() > u8::MAX as usize {
                return Err(SocksError::CredentialTooLong {
                    field,
                    len: value.len(),
                });
            }
        }
        Ok(())
    }
}

// Never print the password
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// offered_methods lists what we advertise to the upstream proxy:
/// no-auth always, username/password when we have credentials
pub fn offered_methods(credentials: Option<&Credentials>) -> Vec<u8> {
    match credentials {
        Some(_) => vec![AuthMethod::NoAuth as u8, AuthMethod::UserPass as u8],
        None => vec![AuthMethod::NoAuth as u8],
    }
}

/// negotiate_method sends the client greeting to the upstream proxy and
/// runs whatever authentication the proxy selects
pub async fn negotiate_method<S>(
    stream: &mut S,
    credentials: Option<&Credentials>,
) -> Result<AuthMethod, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ClientHello format
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+
    let methods = offered_methods(credentials);
    let mut hello = vec![Version::SOCKS5 as u8, methods.len() as u8];
    hello.extend_from_slice(&methods);
    stream.write_all(&hello).await?;

    // ServerChoice method selection reply format
    // +----+--------+
    // |VER | METHOD |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;

    if choice[0] != Version::SOCKS5 as u8 {
        return Err(SocksError::ProtocolVersionMismatch(choice[0]));
    }

    // The proxy must pick something we offered
    if !methods.contains(&choice[1]) {
        return Err(SocksError::NoAcceptableAuthMethod(choice[1]));
    }

    match (AuthMethod::from_byte(choice[1]), credentials) {
        (Some(AuthMethod::UserPass), Some(creds)) => {
            authenticate_userpass(stream, creds).await?;
            Ok(AuthMethod::UserPass)
        }
        (Some(AuthMethod::NoAuth), _) => {
            debug!("upstream proxy selected no authentication");
            Ok(AuthMethod::NoAuth)
        }
        _ => Err(SocksError::NoAcceptableAuthMethod(choice[1])),
    }
}

/// authenticate_userpass performs the client side of the RFC 1929
/// sub-negotiation
pub async fn authenticate_userpass<S>(stream: &mut S, creds: &Credentials) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Client Username/Password Request
    // +----+------+----------+------+----------+
    // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
    // +----+------+----------+------+----------+
    // | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
    // +----+------+----------+------+----------+
    creds.validate()?;

    let mut request = Vec::with_capacity(3 + creds.username.len() + creds.password.len());
    request.push(USERPASS_VERSION);
    request.push(creds.username.len() as u8);
    request.extend_from_slice(creds.username.as_bytes());
    request.push(creds.password.len() as u8);
    request.extend_from_slice(creds.password.as_bytes());
    stream.write_all(&request).await?;

    // Username/Password Server response
    // +----+--------+
    // |VER | STATUS |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;

    if response[1] != AuthStatus::Success as u8 {
        return Err(SocksError::AuthenticationFailed);
    }

    debug!("authenticated to upstream proxy as {}", creds.username);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn debug_output_hides_password() {
        let creds = Credentials::new("user", "hunter2");
        let printed = format!("{creds:?}");
        assert!(printed.contains("user"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn overlong_username_is_rejected() {
        let creds = Credentials::new("u".repeat(256), "p");
        assert!(matches!(
            creds.validate(),
            Err(SocksError::CredentialTooLong { field: "username", len: 256 })
        ));
    }

    #[test]
    fn methods_offered_depend_on_credentials() {
        assert_eq!(offered_methods(None), vec![0x00]);
        let creds = Credentials::new("u", "p");
        assert_eq!(offered_methods(Some(&creds)), vec![0x00, 0x02]);
    }

    #[tokio::test]
    async fn userpass_subnegotiation_bytes() {
        let (mut client, mut proxy) = duplex(64);
        let creds = Credentials::new("user", "pass");

        let proxy_side = tokio::spawn(async move {
            let mut hello = [0u8; 4];
            proxy.read_exact(&mut hello).await.unwrap();
            assert_eq!(hello, [0x05, 0x02, 0x00, 0x02]);
            proxy.write_all(&[0x05, 0x02]).await.unwrap();

            let mut auth = [0u8; 11];
            proxy.read_exact(&mut auth).await.unwrap();
            assert_eq!(&auth, b"\x01\x04user\x04pass");
            proxy.write_all(&[0x01, 0x00]).await.unwrap();
        });

        let method = negotiate_method(&mut client, Some(&creds)).await.unwrap();
        assert_eq!(method, AuthMethod::UserPass);
        proxy_side.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_credentials_fail() {
        let (mut client, mut proxy) = duplex(64);
        let creds = Credentials::new("user", "wrong");

        tokio::spawn(async move {
            let mut hello = [0u8; 4];
            proxy.read_exact(&mut hello).await.unwrap();
            proxy.write_all(&[0x05, 0x02]).await.unwrap();
            let mut auth = [0u8; 12];
            proxy.read_exact(&mut auth).await.unwrap();
            proxy.write_all(&[0x01, 0x01]).await.unwrap();
        });

        assert!(matches!(
            negotiate_method(&mut client, Some(&creds)).await,
            Err(SocksError::AuthenticationFailed)
        ));
    }

    #[tokio::test]
    async fn method_not_offered_is_refused() {
        let (mut client, mut proxy) = duplex(64);

        tokio::spawn(async move {
            let mut hello = [0u8; 3];
            proxy.read_exact(&mut hello).await.unwrap();
            assert_eq!(hello, [0x05, 0x01, 0x00]);
            // userpass although we never offered it
            proxy.write_all(&[0x05, 0x02]).await.unwrap();
        });

        assert!(matches!(
            negotiate_method(&mut client, None).await,
            Err(SocksError::NoAcceptableAuthMethod(0x02))
        ));
    }

    #[tokio::test]
    async fn no_acceptable_reply_is_refused() {
        let (mut client, mut proxy) = duplex(64);
        let creds = Credentials::new("u", "p");

        tokio::spawn(async move {
            let mut hello = [0u8; 4];
            proxy.read_exact(&mut hello).await.unwrap();
            proxy.write_all(&[0x05, 0xFF]).await.unwrap();
        });

        assert!(matches!(
            negotiate_method(&mut client, Some(&creds)).await,
            Err(SocksError::NoAcceptableAuthMethod(0xFF))
        ));
    }
}
