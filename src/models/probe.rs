use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::EndpointId;

/// Why a probe failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeErrorKind {
    Timeout,
    ConnectionRefused,
    ConnectionFailed,
    AuthRejected,
    Protocol,
}

impl ProbeErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeErrorKind::Timeout => "timeout",
            ProbeErrorKind::ConnectionRefused => "connection_refused",
            ProbeErrorKind::ConnectionFailed => "connection_failed",
            ProbeErrorKind::AuthRejected => "auth_rejected",
            ProbeErrorKind::Protocol => "protocol",
        }
    }

    /// Classify an I/O error raised while dialing or talking to a proxy
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => ProbeErrorKind::ConnectionRefused,
            std::io::ErrorKind::TimedOut => ProbeErrorKind::Timeout,
            std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
                ProbeErrorKind::Protocol
            }
            _ => ProbeErrorKind::ConnectionFailed,
        }
    }
}

impl fmt::Display for ProbeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one health check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub endpoint_id: EndpointId,
    /// Registration the probe was issued for; `None` skips the staleness check
    #[serde(skip)]
    pub generation: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub latency: Option<Duration>,
    pub error: Option<ProbeErrorKind>,
}

impl ProbeResult {
    pub fn success(endpoint_id: EndpointId, latency: Duration, timestamp: DateTime<Utc>) -> Self {
        Self {
            endpoint_id,
            generation: None,
            timestamp,
            success: true,
            latency: Some(latency),
            error: None,
        }
    }

    pub fn failure(
        endpoint_id: EndpointId,
        error: ProbeErrorKind,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            endpoint_id,
            generation: None,
            timestamp,
            success: false,
            latency: None,
            error: Some(error),
        }
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = Some(generation);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_from_io() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(ProbeErrorKind::from_io(&refused), ProbeErrorKind::ConnectionRefused);

        let eof = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        assert_eq!(ProbeErrorKind::from_io(&eof), ProbeErrorKind::Protocol);

        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert_eq!(ProbeErrorKind::from_io(&reset), ProbeErrorKind::ConnectionFailed);
    }

    #[test]
    fn test_constructors() {
        let now = Utc::now();
        let ok = ProbeResult::success("http://a:1".into(), Duration::from_millis(20), now);
        assert!(ok.success);
        assert_eq!(ok.latency, Some(Duration::from_millis(20)));

        let failed = ProbeResult::failure("http://a:1".into(), ProbeErrorKind::Timeout, now)
            .with_generation(3);
        assert!(!failed.success);
        assert_eq!(failed.error, Some(ProbeErrorKind::Timeout));
        assert_eq!(failed.generation, Some(3));
    }
}
