//! Error types

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid secret: {0}")]
    InvalidSecret(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),

    #[error("invalid DC {0} (only DC 1-5 are supported)")]
    UnknownDc(i16),

    #[error("cannot dial to DC {dc}: {source}")]
    DcUnreachable { dc: i16, source: io::Error },

    #[error("no addresses known for DC {0}")]
    NoAddresses(i16),

    #[error("circuit breaker is open for DC {0}")]
    CircuitOpen(i16),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("dns resolution failed for {host}: {source}")]
    DnsFailure { host: String, source: io::Error },
}

impl ProxyError {
    /// Broken pipe / connection reset detection for the first post-lease
    /// operation on a pooled connection. Telegram closes idle connections
    /// silently, so a stale socket looks healthy until the first write.
    pub fn is_broken_pipe(&self) -> bool {
        match self {
            ProxyError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broken_pipe_detection() {
        let e = ProxyError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert!(e.is_broken_pipe());

        let e = ProxyError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "rst"));
        assert!(e.is_broken_pipe());

        let e = ProxyError::HandshakeTimeout;
        assert!(!e.is_broken_pipe());
    }
}
