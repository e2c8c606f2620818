//! Router side of the transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures_util::SinkExt;
use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::codec::LengthDelimitedCodec;
use tracing::debug;
use tracing::warn;

use crate::advertised_address;
use crate::frame;
use crate::socket_addr_of;
use crate::NetError;

/// One received message, tagged with the sender's identity.
#[derive(Clone, Debug)]
pub struct Frame {
    pub peer: String,
    pub header: Bytes,
    pub payload: Bytes,
}

type PeerTable = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Bytes>>>>;

/// A listening endpoint that routes outbound frames by peer identity.
///
/// The first frame a connecting peer sends is its identity; afterwards every
/// inbound frame is surfaced through [`Endpoint::poll`] tagged with it, and
/// [`Endpoint::send`] routes by it. A reconnecting peer replaces the previous
/// connection under the same identity.
pub struct Endpoint {
    address: String,
    peers: PeerTable,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    accept_task: JoinHandle<()>,
}

impl Endpoint {
    /// Binds to `tcp://host:port`. Port 0 allocates a free port; the
    /// advertised [`Endpoint::address`] carries the actual one.
    pub async fn bind(address: &str) -> Result<Self, NetError> {
        let listener = TcpListener::bind(socket_addr_of(address)?).await?;
        let advertised = advertised_address(listener.local_addr()?);
        let peers: PeerTable = Arc::new(Mutex::new(HashMap::new()));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&peers), inbound_tx));
        debug!("endpoint bound. address: {}", advertised);

        Ok(Self {
            address: advertised,
            peers,
            inbound: tokio::sync::Mutex::new(inbound_rx),
            accept_task,
        })
    }

    /// The dialable address of this endpoint.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Queues one frame for the identified peer.
    ///
    /// Frame assembly is atomic and each connection has a single writer, so
    /// concurrent sends never interleave parts.
    pub fn send(
        &self,
        peer: &str,
        header: &[u8],
        payload: &[u8],
    ) -> Result<(), NetError> {
        let table = self.peers.lock().expect("peer table poisoned");
        let sender = table
            .get(peer)
            .ok_or_else(|| NetError::UnknownPeer(peer.to_string()))?;
        sender
            .send(frame::encode(header, payload))
            .map_err(|_| NetError::ConnectionClosed)
    }

    /// Waits up to `timeout` for the next inbound frame.
    ///
    /// Returns `Ok(None)` on timeout so receive loops can check their
    /// shutdown flag between polls.
    pub async fn poll(
        &self,
        timeout: Duration,
    ) -> Result<Option<Frame>, NetError> {
        let mut inbound = self.inbound.lock().await;
        match tokio::time::timeout(timeout, inbound.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => Err(NetError::ConnectionClosed),
        }
    }

    /// Stops accepting new connections. Existing connections drain on their
    /// own when peers hang up.
    pub fn close(&self) {
        self.accept_task.abort();
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    peers: PeerTable,
    inbound_tx: mpsc::UnboundedSender<Frame>,
) {
    loop {
        match listener.accept().await {
            Ok((socket, remote)) => {
                tokio::spawn(serve_connection(
                    socket,
                    remote.to_string(),
                    Arc::clone(&peers),
                    inbound_tx.clone(),
                ));
            },
            Err(err) => {
                warn!("accept failed. err: {:?}", err);
            },
        }
    }
}

async fn serve_connection(
    socket: TcpStream,
    remote: String,
    peers: PeerTable,
    inbound_tx: mpsc::UnboundedSender<Frame>,
) {
    let framed = Framed::new(socket, LengthDelimitedCodec::new());
    let (mut sink, mut stream) = framed.split();

    let identity = match stream.next().await {
        Some(Ok(bytes)) => {
            match String::from_utf8(bytes.to_vec()) {
                Ok(identity) if !identity.is_empty() => identity,
                _ => {
                    warn!("dropping connection with bad identity. remote: {}", remote);
                    return;
                },
            }
        },
        Some(Err(err)) => {
            warn!("handshake read failed. remote: {} err: {:?}", remote, err);
            return;
        },
        None => {
            debug!("connection closed before handshake. remote: {}", remote);
            return;
        },
    };

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
    let out_probe = out_tx.clone();
    peers
        .lock()
        .expect("peer table poisoned")
        .insert(identity.clone(), out_tx);
    debug!("peer connected. identity: {} remote: {}", identity, remote);

    tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if sink.send(bytes).await.is_err() {
                break;
            }
        }
    });

    while let Some(item) = stream.next().await {
        match item {
            Ok(bytes) => {
                match frame::decode(bytes) {
                    Ok((header, payload)) => {
                        let frame = Frame {
                            peer: identity.clone(),
                            header,
                            payload,
                        };
                        if inbound_tx.send(frame).is_err() {
                            break;
                        }
                    },
                    Err(err) => {
                        warn!("dropping malformed frame. peer: {} err: {}", identity, err);
                    },
                }
            },
            Err(err) => {
                debug!("read failed. peer: {} err: {:?}", identity, err);
                break;
            },
        }
    }

    // Unregister, unless a reconnection already took the identity over.
    let mut table = peers.lock().expect("peer table poisoned");
    if table
        .get(&identity)
        .is_some_and(|sender| sender.same_channel(&out_probe))
    {
        table.remove(&identity);
    }
    debug!("peer disconnected. identity: {}", identity);
}
