//! Transport module - endpoints and socket handling.
//!
//! Provides:
//! - [`Endpoint`] parsing for `tcp://`, bare `host:port` and `unix://` URLs
//! - [`Connector`], the seam the connection manager dials through
//! - [`Listener`] for the serving side

mod endpoint;
mod socket;

pub use endpoint::Endpoint;
pub use socket::{
    BoxedReader, BoxedWriter, Connector, Listener, SocketConnector, DEFAULT_CONNECT_TIMEOUT,
};
