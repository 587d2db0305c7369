use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use super::ProbeErrorKind;
use crate::error::{PoolError, Result};

/// Score assigned to fresh and reinstated endpoints
pub const NEUTRAL_SCORE: f64 = 50.0;
/// Upper bound of the score range
pub const MAX_SCORE: f64 = 100.0;
/// Lower bound of the score range
pub const MIN_SCORE: f64 = 0.0;

/// Proxy protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Https,
    Socks4,
    Socks4a,
    Socks5,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks4 => "socks4",
            ProxyProtocol::Socks4a => "socks4a",
            ProxyProtocol::Socks5 => "socks5",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(ProxyProtocol::Http),
            "https" => Some(ProxyProtocol::Https),
            "socks4" => Some(ProxyProtocol::Socks4),
            "socks4a" => Some(ProxyProtocol::Socks4a),
            "socks5" | "socks5h" => Some(ProxyProtocol::Socks5),
            _ => None,
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            ProxyProtocol::Http => 80,
            ProxyProtocol::Https => 443,
            ProxyProtocol::Socks4 | ProxyProtocol::Socks4a | ProxyProtocol::Socks5 => 1080,
        }
    }

    pub fn is_socks(&self) -> bool {
        matches!(
            self,
            ProxyProtocol::Socks4 | ProxyProtocol::Socks4a | ProxyProtocol::Socks5
        )
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stable identity of an endpoint: `scheme://[user@]host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EndpointId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EndpointId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Credentials used to authenticate against an upstream proxy
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything needed to register and dial one upstream proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub protocol: ProxyProtocol,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

impl EndpointConfig {
    pub fn new(protocol: ProxyProtocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into().to_lowercase(),
            port,
            credentials: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Parse `scheme://[user[:pass]@]host[:port]`
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let url = Url::parse(raw)?;

        let protocol = ProxyProtocol::from_str(url.scheme())
            .ok_or_else(|| PoolError::UnsupportedProtocol(url.scheme().to_string()))?;

        if !(url.path().is_empty() || url.path() == "/") || url.query().is_some() {
            return Err(PoolError::InvalidEndpointAddress(format!(
                "{} must not include a path or query",
                raw
            )));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| PoolError::InvalidEndpointAddress(format!("{} has no host", raw)))?;
        let port = url.port().unwrap_or_else(|| protocol.default_port());

        let mut config = Self::new(protocol, host, port);
        if !url.username().is_empty() {
            config = config.with_credentials(url.username(), url.password().unwrap_or(""));
        }
        Ok(config)
    }

    /// Derive the registry key for this endpoint
    pub fn id(&self) -> EndpointId {
        match &self.credentials {
            Some(creds) => EndpointId(format!(
                "{}://{}@{}",
                self.protocol,
                creds.username,
                self.address()
            )),
            None => EndpointId(format!("{}://{}", self.protocol, self.address())),
        }
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Health state of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EndpointState {
    #[default]
    Candidate,
    Healthy,
    Degraded,
    Evicted,
}

impl EndpointState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointState::Candidate => "candidate",
            EndpointState::Healthy => "healthy",
            EndpointState::Degraded => "degraded",
            EndpointState::Evicted => "evicted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "candidate" => Some(EndpointState::Candidate),
            "healthy" => Some(EndpointState::Healthy),
            "degraded" => Some(EndpointState::Degraded),
            "evicted" => Some(EndpointState::Evicted),
            _ => None,
        }
    }

    /// The only legal edges of the health state machine
    pub fn can_transition_to(&self, next: EndpointState) -> bool {
        use EndpointState::*;
        matches!(
            (self, next),
            (Candidate, Healthy)
                | (Healthy, Degraded)
                | (Degraded, Healthy)
                | (Degraded, Evicted)
                | (Evicted, Candidate)
        )
    }

    pub fn is_selectable(&self) -> bool {
        matches!(self, EndpointState::Healthy)
    }
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Point-in-time copy of one endpoint's live state
#[derive(Debug, Clone, Serialize)]
pub struct Endpoint {
    pub id: EndpointId,
    pub config: EndpointConfig,
    pub state: EndpointState,
    pub score: f64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_probe_at: Option<DateTime<Utc>>,
    #[serde(with = "optional_millis")]
    pub last_latency: Option<Duration>,
    pub last_error: Option<ProbeErrorKind>,
    pub probes_total: u64,
    pub probes_failed: u64,
    pub evicted_at: Option<DateTime<Utc>>,
    pub reinstatements: u32,
    #[serde(skip)]
    pub generation: u64,
    pub created_at: DateTime<Utc>,
}

impl Endpoint {
    pub fn new(config: EndpointConfig, generation: u64, now: DateTime<Utc>) -> Self {
        Self {
            id: config.id(),
            config,
            state: EndpointState::Candidate,
            score: NEUTRAL_SCORE,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_probe_at: None,
            last_latency: None,
            last_error: None,
            probes_total: 0,
            probes_failed: 0,
            evicted_at: None,
            reinstatements: 0,
            generation,
            created_at: now,
        }
    }

    pub fn address(&self) -> String {
        self.config.address()
    }

    /// Lifetime probe success rate as a percentage
    pub fn success_rate(&self) -> f64 {
        if self.probes_total == 0 {
            0.0
        } else {
            ((self.probes_total - self.probes_failed) as f64 / self.probes_total as f64) * 100.0
        }
    }
}

mod optional_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }
}
