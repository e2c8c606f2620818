//! Framed TCP transport with router/dealer roles.
//!
//! An [`Endpoint`] is the router side: it accepts connections, learns each
//! peer's identity from a handshake frame, and routes outbound frames by that
//! identity. A [`Channel`] is the dealer side: one identified connection to a
//! remote endpoint. Frames carry `(header, payload)` byte pairs; how those
//! bytes are encoded is the caller's concern.

use thiserror::Error;

pub mod channel;
pub mod endpoint;
mod frame;

pub use channel::Channel;
pub use endpoint::Endpoint;
pub use endpoint::Frame;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad transport address: {0}")]
    InvalidAddress(String),

    #[error("no connected peer with identity {0}")]
    UnknownPeer(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("malformed frame: {0}")]
    BadFrame(&'static str),
}

/// Strips the `tcp://` scheme, leaving a host:port pair for the socket API.
pub(crate) fn socket_addr_of(address: &str) -> Result<String, NetError> {
    let rest = address
        .strip_prefix("tcp://")
        .ok_or_else(|| NetError::InvalidAddress(address.to_string()))?;
    if rest.is_empty() || !rest.contains(':') {
        return Err(NetError::InvalidAddress(address.to_string()));
    }
    // zmq-style wildcard host.
    Ok(rest.replace('*', "0.0.0.0"))
}

/// The address to advertise for a bound socket.
///
/// A wildcard bind host is replaced with the machine's hostname so remote
/// peers get something dialable.
pub(crate) fn advertised_address(bound: std::net::SocketAddr) -> String {
    let host = if bound.ip().is_unspecified() {
        hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| bound.ip().to_string())
    } else {
        bound.ip().to_string()
    };
    format!("tcp://{}:{}", host, bound.port())
}
