//! Socket connectors and listeners.
//!
//! - TCP on every platform
//! - Unix domain sockets on Unix
//!
//! Streams are split into boxed read and write halves so the connection and
//! server loops stay independent of the socket kind.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use super::Endpoint;
use crate::error::{BridgeError, Result};
use crate::handler::BoxFuture;

/// Default timeout for establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read half of a connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Opens duplex streams to an endpoint.
///
/// Called on the initial connect and again on every reconnect attempt.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint)
        -> BoxFuture<'a, Result<(BoxedReader, BoxedWriter)>>;
}

/// Connects over TCP or Unix domain sockets.
#[derive(Debug, Clone)]
pub struct SocketConnector {
    connect_timeout: Duration,
}

impl SocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for SocketConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl Connector for SocketConnector {
    fn connect<'a>(
        &'a self,
        endpoint: &'a Endpoint,
    ) -> BoxFuture<'a, Result<(BoxedReader, BoxedWriter)>> {
        Box::pin(async move {
            let timed_out = || {
                BridgeError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connecting to {} timed out", endpoint),
                ))
            };

            match endpoint {
                Endpoint::Tcp(addr) => {
                    let stream =
                        tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr.as_str()))
                            .await
                            .map_err(|_| timed_out())??;
                    stream.set_nodelay(true)?;
                    Ok(split(stream))
                }
                #[cfg(unix)]
                Endpoint::Unix(path) => {
                    let stream = tokio::time::timeout(
                        self.connect_timeout,
                        tokio::net::UnixStream::connect(path),
                    )
                    .await
                    .map_err(|_| timed_out())??;
                    Ok(split(stream))
                }
                #[cfg(not(unix))]
                Endpoint::Unix(_) => Err(BridgeError::InvalidEndpoint(format!(
                    "{}: unix sockets are not supported on this platform",
                    endpoint
                ))),
            }
        })
    }
}

fn split<S>(stream: S) -> (BoxedReader, BoxedWriter)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    (Box::new(reader), Box::new(writer))
}

/// Accepts incoming connections on a TCP or Unix endpoint.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        path: std::path::PathBuf,
    },
}

impl Listener {
    /// Bind to `endpoint`.
    ///
    /// A stale Unix socket file at the path is removed before binding.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr.as_str()).await?)),
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = tokio::net::UnixListener::bind(path)?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(BridgeError::InvalidEndpoint(format!(
                "{}: unix sockets are not supported on this platform",
                endpoint
            ))),
        }
    }

    /// Accept one connection, with the peer address for TCP.
    pub async fn accept(&self) -> Result<(BoxedReader, BoxedWriter, Option<SocketAddr>)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let (reader, writer) = split(stream);
                Ok((reader, writer, Some(addr)))
            }
            #[cfg(unix)]
            Listener::Unix { listener, .. } => {
                let (stream, _addr) = listener.accept().await?;
                let (reader, writer) = split(stream);
                Ok((reader, writer, None))
            }
        }
    }

    /// The endpoint actually bound. For TCP port 0 this carries the assigned port.
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        match self {
            Listener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
            #[cfg(unix)]
            Listener::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if let Listener::Unix { path, .. } = self {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}
