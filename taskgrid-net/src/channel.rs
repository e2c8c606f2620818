//! Dealer side of the transport: one identified connection to an endpoint.

use std::time::Duration;

use bytes::Bytes;
use futures_util::SinkExt;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::codec::LengthDelimitedCodec;
use tracing::debug;
use tracing::warn;

use crate::frame;
use crate::socket_addr_of;
use crate::NetError;

/// Client connection to a remote [`crate::Endpoint`].
///
/// The identity sent at connect time is the address the remote will route
/// replies to; workers use their own advertised listen address so data
/// locations stay dialable by other peers.
pub struct Channel {
    remote: String,
    identity: String,
    outbound: mpsc::UnboundedSender<Bytes>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Bytes, Bytes)>>,
}

impl Channel {
    pub async fn connect(
        address: &str,
        identity: &str,
    ) -> Result<Self, NetError> {
        let socket = TcpStream::connect(socket_addr_of(address)?).await?;
        let framed = Framed::new(socket, LengthDelimitedCodec::new());
        let (mut sink, mut stream) = framed.split();

        sink.send(Bytes::copy_from_slice(identity.as_bytes()))
            .await?;
        debug!("connected. remote: {} identity: {}", address, identity);

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(bytes) = out_rx.recv().await {
                if sink.send(bytes).await.is_err() {
                    break;
                }
            }
        });

        let remote = address.to_string();
        let log_remote = remote.clone();
        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(bytes) => {
                        match frame::decode(bytes) {
                            Ok(parts) => {
                                if in_tx.send(parts).is_err() {
                                    break;
                                }
                            },
                            Err(err) => {
                                warn!(
                                    "dropping malformed frame. remote: {} err: {}",
                                    log_remote, err
                                );
                            },
                        }
                    },
                    Err(err) => {
                        debug!("read failed. remote: {} err: {:?}", log_remote, err);
                        break;
                    },
                }
            }
        });

        Ok(Self {
            remote,
            identity: identity.to_string(),
            outbound: out_tx,
            inbound: tokio::sync::Mutex::new(in_rx),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn send(
        &self,
        header: &[u8],
        payload: &[u8],
    ) -> Result<(), NetError> {
        self.outbound
            .send(frame::encode(header, payload))
            .map_err(|_| NetError::ConnectionClosed)
    }

    /// Next `(header, payload)` frame from the remote.
    pub async fn recv(&self) -> Result<(Bytes, Bytes), NetError> {
        let mut inbound = self.inbound.lock().await;
        inbound.recv().await.ok_or(NetError::ConnectionClosed)
    }

    /// Like [`Channel::recv`], returning `Ok(None)` on timeout.
    pub async fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<(Bytes, Bytes)>, NetError> {
        let mut inbound = self.inbound.lock().await;
        match tokio::time::timeout(timeout, inbound.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(parts)) => Ok(Some(parts)),
            Ok(None) => Err(NetError::ConnectionClosed),
        }
    }

    /// Send one frame and wait for the next reply on this connection.
    ///
    /// Only valid on connections with a single request in flight, such as a
    /// dedicated peer-fetch connection.
    pub async fn request(
        &self,
        header: &[u8],
        payload: &[u8],
    ) -> Result<(Bytes, Bytes), NetError> {
        self.send(header, payload)?;
        self.recv().await
    }
}
