//! Probe transport for HTTP and SOCKS endpoints
//!
//! A probe succeeds when a tunnel through the endpoint to the configured
//! target is fully established. No payload is exchanged.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};
use tracing::{debug, instrument};
use url::Url;

use crate::error::{PoolError, Result};
use crate::models::{EndpointConfig, ProbeErrorKind, ProxyProtocol};

/// Longest CONNECT status line accepted
const MAX_STATUS_LINE: usize = 1024;

/// Outcome of a single reachability check
pub type ProbeStatus = std::result::Result<(), ProbeErrorKind>;

/// Reachability check against one endpoint
///
/// Implementations must not enforce their own deadline; the prober wraps
/// every call in the configured timeout.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, config: &EndpointConfig) -> ProbeStatus;
}

/// Opens a tunnel through the endpoint to a fixed target
#[derive(Debug, Clone)]
pub struct ConnectProbe {
    target_host: String,
    target_port: u16,
}

impl ConnectProbe {
    pub fn new(target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            target_host: target_host.into(),
            target_port,
        }
    }

    /// Build from a target URL such as `http://www.gstatic.com/generate_204`
    pub fn from_url(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)?;
        let host = url
            .host_str()
            .ok_or_else(|| PoolError::InvalidConfig(format!("probe target has no host: {}", raw)))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| PoolError::InvalidConfig(format!("probe target has no port: {}", raw)))?;
        Ok(Self::new(host, port))
    }

    pub fn target(&self) -> (&str, u16) {
        (&self.target_host, self.target_port)
    }

    /// HTTP CONNECT tunnel
    async fn connect_http(&self, config: &EndpointConfig) -> ProbeStatus {
        let mut stream = TcpStream::connect(config.address())
            .await
            .map_err(|e| ProbeErrorKind::from_io(&e))?;

        let request = self.build_connect_request(config);
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| ProbeErrorKind::from_io(&e))?;

        let status_line = read_status_line(&mut stream).await?;
        debug!(status = %status_line, "CONNECT response");

        match parse_status(&status_line) {
            Some(code) if (200..300).contains(&code) => Ok(()),
            Some(407) => Err(ProbeErrorKind::AuthRejected),
            _ => Err(ProbeErrorKind::Protocol),
        }
    }

    fn build_connect_request(&self, config: &EndpointConfig) -> String {
        let mut request = format!(
            "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n",
            host = self.target_host,
            port = self.target_port
        );

        if let Some(credentials) = &config.credentials {
            let raw = format!("{}:{}", credentials.username, credentials.password);
            let encoded = BASE64.encode(raw.as_bytes());
            request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", encoded));
        }

        request.push_str("\r\n");
        request
    }

    /// SOCKS4 and SOCKS4a; the username is sent as the user id
    async fn connect_socks4(&self, config: &EndpointConfig) -> ProbeStatus {
        let proxy = config.address();
        let target = (self.target_host.as_str(), self.target_port);

        let result = match &config.credentials {
            Some(credentials) => {
                Socks4Stream::connect_with_userid(proxy.as_str(), target, &credentials.username)
                    .await
            }
            None => Socks4Stream::connect(proxy.as_str(), target).await,
        };

        result.map(|_| ()).map_err(|e| classify_socks_error(&e))
    }

    async fn connect_socks5(&self, config: &EndpointConfig) -> ProbeStatus {
        let proxy = config.address();
        let target = (self.target_host.as_str(), self.target_port);

        let result = match &config.credentials {
            Some(credentials) => {
                Socks5Stream::connect_with_password(
                    proxy.as_str(),
                    target,
                    &credentials.username,
                    &credentials.password,
                )
                .await
            }
            None => Socks5Stream::connect(proxy.as_str(), target).await,
        };

        result.map(|_| ()).map_err(|e| classify_socks_error(&e))
    }
}

#[async_trait]
impl Probe for ConnectProbe {
    #[instrument(skip(self, config), fields(endpoint = %config.id()))]
    async fn probe(&self, config: &EndpointConfig) -> ProbeStatus {
        match config.protocol {
            ProxyProtocol::Http | ProxyProtocol::Https => self.connect_http(config).await,
            ProxyProtocol::Socks4 | ProxyProtocol::Socks4a => self.connect_socks4(config).await,
            ProxyProtocol::Socks5 => self.connect_socks5(config).await,
        }
    }
}

/// Read the first response line, which may arrive over several segments
async fn read_status_line<R>(reader: &mut R) -> std::result::Result<String, ProbeErrorKind>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(128);
    let mut chunk = [0u8; 256];

    loop {
        if let Some(end) = buf.windows(2).position(|w| w == b"\r\n") {
            return Ok(String::from_utf8_lossy(&buf[..end]).into_owned());
        }
        if buf.len() > MAX_STATUS_LINE {
            return Err(ProbeErrorKind::Protocol);
        }

        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|e| ProbeErrorKind::from_io(&e))?;
        if n == 0 {
            return Err(ProbeErrorKind::Protocol);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Extract the status code from an HTTP status line
fn parse_status(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

fn classify_socks_error(err: &tokio_socks::Error) -> ProbeErrorKind {
    use tokio_socks::Error;

    match err {
        Error::Io(e) => ProbeErrorKind::from_io(e),
        Error::ConnectionRefused => ProbeErrorKind::ConnectionRefused,
        Error::ProxyServerUnreachable
        | Error::NetworkUnreachable
        | Error::HostUnreachable
        | Error::TtlExpired => ProbeErrorKind::ConnectionFailed,
        Error::PasswordAuthFailure(_)
        | Error::AuthorizationRequired
        | Error::NoAcceptableAuthMethods
        | Error::InvalidAuthValues(_) => ProbeErrorKind::AuthRejected,
        _ => ProbeErrorKind::Protocol,
    }
}
