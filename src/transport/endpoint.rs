//! Endpoint URLs.
//!
//! Accepted forms:
//! - `tcp://host:port`
//! - `host:port` (TCP)
//! - `unix:///path/to/socket`

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{BridgeError, Result};

/// Where the bridge connects to, or where a server listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// TCP `host:port`.
    Tcp(String),
    /// Unix domain socket path.
    Unix(PathBuf),
}

impl Endpoint {
    /// Parse an endpoint URL.
    ///
    /// # Example
    ///
    /// ```
    /// use callbridge::transport::Endpoint;
    ///
    /// let ep = Endpoint::parse("tcp://127.0.0.1:7400").unwrap();
    /// assert_eq!(ep, Endpoint::Tcp("127.0.0.1:7400".into()));
    /// assert_eq!(ep.to_string(), "tcp://127.0.0.1:7400");
    /// ```
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        let invalid = |why: &str| BridgeError::InvalidEndpoint(format!("{}: {}", url, why));

        if let Some(path) = url.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(invalid("missing socket path"));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }

        let addr = match url.strip_prefix("tcp://") {
            Some(addr) => addr,
            None if url.contains("://") => return Err(invalid("unsupported scheme")),
            None => url,
        };

        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected host:port"))?;
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        port.parse::<u16>().map_err(|_| invalid("invalid port"))?;

        Ok(Endpoint::Tcp(addr.to_string()))
    }
}

impl FromStr for Endpoint {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        Endpoint::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}
