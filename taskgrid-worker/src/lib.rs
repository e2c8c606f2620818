//! The worker process.
//!
//! A worker keeps a local key→value store, executes task terms against the
//! builtin operation table, and serves its stored values to peers. It holds
//! one connection to the coordinator (identified by its own listen address,
//! so the coordinator's placement entries stay dialable) and a router
//! endpoint of its own for peer fetches.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use anyhow::bail;
use anyhow::Context;
use bytes::Bytes;
use serde::Serialize;
use taskgrid_messages::payloads::ComputePayload;
use taskgrid_messages::payloads::DelitemPayload;
use taskgrid_messages::payloads::FinishedTaskPayload;
use taskgrid_messages::payloads::GetitemAckPayload;
use taskgrid_messages::payloads::GetitemPayload;
use taskgrid_messages::payloads::RegisterPayload;
use taskgrid_messages::payloads::SetitemAckPayload;
use taskgrid_messages::payloads::SetitemPayload;
use taskgrid_messages::Address;
use taskgrid_messages::Codec;
use taskgrid_messages::Datum;
use taskgrid_messages::Function;
use taskgrid_messages::Header;
use taskgrid_messages::Key;
use taskgrid_messages::Status;
use taskgrid_messages::Term;
use taskgrid_net::Channel;
use taskgrid_net::Endpoint;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::store::Store;

pub mod config;
pub mod ops;
pub mod store;

pub use config::Config;
pub use config::WorkerConfig;

pub struct Worker {
    endpoint: Endpoint,
    coordinator: Channel,
    store: Store,
    poll_interval: Duration,
    closed: AtomicBool,
}

impl Worker {
    /// Binds the peer endpoint, connects to the coordinator, registers, and
    /// spawns the two serving loops.
    pub async fn start(config: &WorkerConfig) -> anyhow::Result<Arc<Self>> {
        let endpoint = Endpoint::bind(&config.listen_address).await?;
        let address = endpoint.address().to_string();
        let coordinator = Channel::connect(&config.scheduler_address, &address)
            .await
            .context("connecting to the coordinator")?;

        let worker = Arc::new(Self {
            endpoint,
            coordinator,
            store: Store::default(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            closed: AtomicBool::new(false),
        });

        worker.send_to_scheduler(
            Header::new(Function::Register),
            &RegisterPayload {
                metadata: Datum::Str(config.name.clone()),
            },
        )?;
        info!(
            "worker started. address: {} coordinator: {}",
            address, config.scheduler_address
        );

        tokio::spawn(Arc::clone(&worker).listen_to_scheduler());
        tokio::spawn(Arc::clone(&worker).listen_to_peers());

        Ok(worker)
    }

    /// The address peers and the coordinator route to.
    pub fn address(&self) -> &str {
        self.endpoint.address()
    }

    pub fn close(&self) {
        info!("worker closing. address: {}", self.address());
        self.closed.store(true, Ordering::SeqCst);
        self.endpoint.close();
    }

    /// Keys currently in the local store, for inspection.
    pub fn held_keys(&self) -> Vec<Key> {
        self.store.keys()
    }

    pub fn value_of(
        &self,
        key: &str,
    ) -> Option<Datum> {
        self.store.get(key)
    }

    // ---- serving loops -------------------------------------------------

    async fn listen_to_scheduler(self: Arc<Self>) {
        while !self.closed.load(Ordering::SeqCst) {
            let (header_bytes, payload) =
                match self.coordinator.recv_timeout(self.poll_interval).await {
                    Ok(Some(parts)) => parts,
                    Ok(None) => continue,
                    Err(err) => {
                        error!("coordinator connection lost. err: {:?}", err);
                        break;
                    },
                };
            let header: Header = match Codec::Json.decode(&header_bytes) {
                Ok(header) => header,
                Err(err) => {
                    warn!("dropping frame with undecodable header. err: {}", err);
                    continue;
                },
            };
            debug!("received from coordinator. function: {}", header.function);

            match header.function {
                Function::Compute => {
                    // Execution can be slow; keep the loop free for data
                    // traffic in the meantime.
                    tokio::spawn(Arc::clone(&self).handle_compute(header, payload));
                },
                Function::Setitem => {
                    if let Err(err) = self.handle_setitem(header, &payload) {
                        error!("setitem failed. err: {:?}", err);
                    }
                },
                Function::Getitem => {
                    if let Err(err) = self.handle_getitem(header, &payload) {
                        error!("getitem failed. err: {:?}", err);
                    }
                },
                Function::Delitem => {
                    if let Err(err) = self.handle_delitem(header, &payload) {
                        error!("delitem failed. err: {:?}", err);
                    }
                },
                Function::Status => {
                    let mut reply = Header::new(Function::StatusAck).with_status(Status::Ok);
                    reply.jobid = header.jobid;
                    if let Err(err) =
                        self.send_to_scheduler(reply, &Datum::Str("OK".to_string()))
                    {
                        error!("status reply failed. err: {:?}", err);
                    }
                },
                other => {
                    warn!("unknown function from coordinator, dropped. function: {}", other);
                },
            }
        }
        info!("scheduler listener stopped. address: {}", self.address());
    }

    /// Serves `getitem` from other workers fetching dependencies.
    async fn listen_to_peers(self: Arc<Self>) {
        while !self.closed.load(Ordering::SeqCst) {
            let frame = match self.endpoint.poll(self.poll_interval).await {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(err) => {
                    error!("peer endpoint failed. err: {:?}", err);
                    break;
                },
            };
            let header: Header = match Codec::Json.decode(&frame.header) {
                Ok(header) => header,
                Err(err) => {
                    warn!(
                        "dropping peer frame with undecodable header. peer: {} err: {}",
                        frame.peer, err
                    );
                    continue;
                },
            };

            match header.function {
                Function::Getitem => {
                    if let Err(err) = self.serve_peer_getitem(&frame.peer, header, &frame.payload)
                    {
                        error!("peer getitem failed. peer: {} err: {:?}", frame.peer, err);
                    }
                },
                other => {
                    warn!(
                        "unknown function from peer, dropped. peer: {} function: {}",
                        frame.peer, other
                    );
                },
            }
        }
        info!("peer listener stopped. address: {}", self.address());
    }

    fn serve_peer_getitem(
        &self,
        peer: &str,
        header: Header,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let request: GetitemPayload = header.payload_codec().decode(payload)?;
        let (status, value) = match self.store.get(&request.key) {
            Some(value) => (Status::Ok, value),
            None => {
                warn!("peer asked for a key not held. key: {} peer: {}", request.key, peer);
                (Status::Error, Datum::Null)
            },
        };
        let reply_payload = GetitemAckPayload {
            key: request.key.clone(),
            value,
            queue: request.queue,
        };
        let mut reply = Header::new(Function::GetitemAck)
            .with_jobid(request.key)
            .with_status(status);
        reply.address = Some(self.address().to_string());
        reply.timestamp = Some(unix_timestamp());
        let header_bytes = Codec::Json.encode(&reply)?;
        let payload_bytes = reply.payload_codec().encode(&reply_payload)?;
        self.endpoint.send(peer, &header_bytes, &payload_bytes)?;
        Ok(())
    }

    // ---- coordinator-originated handlers -------------------------------

    async fn handle_compute(
        self: Arc<Self>,
        header: Header,
        payload: Bytes,
    ) {
        let payload: ComputePayload = match header.payload_codec().decode(&payload) {
            Ok(payload) => payload,
            Err(err) => {
                error!("dropping undecodable compute payload. err: {}", err);
                return;
            },
        };
        let key = payload.key.clone();
        let dependencies: Vec<Key> = payload.task.dependencies().into_iter().collect();
        debug!("compute. key: {} deps: {:?}", key, dependencies);

        let started = Instant::now();
        let result = self.evaluate(&payload.task, &payload.locations).await;
        let duration = started.elapsed().as_secs_f64();

        let (status, error) = match result {
            Ok(value) => {
                self.store.put(key.clone(), value);
                (Status::Ok, None)
            },
            Err(err) => {
                warn!("task failed. key: {} err: {:#}", key, err);
                (Status::Error, Some(format!("{err:#}")))
            },
        };

        let reply = FinishedTaskPayload {
            key: key.clone(),
            duration,
            dependencies,
            queue: payload.queue,
            error,
        };
        let reply_header = Header::new(Function::FinishedTask)
            .with_jobid(key)
            .with_status(status);
        if let Err(err) = self.send_to_scheduler(reply_header, &reply) {
            error!("finished-task report failed. err: {:?}", err);
        }
    }

    fn handle_setitem(
        &self,
        header: Header,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let payload: SetitemPayload = header.payload_codec().decode(payload)?;
        debug!("setitem. key: {}", payload.key);
        self.store.put(payload.key.clone(), payload.value);
        if let Some(queue) = payload.queue {
            let ack = SetitemAckPayload {
                key: payload.key.clone(),
                queue: Some(queue),
            };
            let reply = Header::new(Function::SetitemAck)
                .with_jobid(payload.key)
                .with_status(Status::Ok);
            self.send_to_scheduler(reply, &ack)?;
        }
        Ok(())
    }

    fn handle_getitem(
        &self,
        header: Header,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let payload: GetitemPayload = header.payload_codec().decode(payload)?;
        let (status, value) = match self.store.get(&payload.key) {
            Some(value) => (Status::Ok, value),
            None => {
                warn!("getitem for a key not held. key: {}", payload.key);
                (Status::Error, Datum::Null)
            },
        };
        let ack = GetitemAckPayload {
            key: payload.key.clone(),
            value,
            queue: payload.queue,
        };
        let reply = Header::new(Function::GetitemAck)
            .with_jobid(payload.key)
            .with_status(status);
        self.send_to_scheduler(reply, &ack)?;
        Ok(())
    }

    fn handle_delitem(
        &self,
        header: Header,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let payload: DelitemPayload = header.payload_codec().decode(payload)?;
        debug!("delitem. key: {}", payload.key);
        self.store.remove(&payload.key);
        Ok(())
    }

    // ---- evaluation ----------------------------------------------------

    fn evaluate<'a>(
        &'a self,
        term: &'a Term,
        locations: &'a BTreeMap<Key, Vec<Address>>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Datum>> + Send + 'a>> {
        Box::pin(async move {
            match term {
                Term::Literal(value) => Ok(value.clone()),
                Term::Key(key) => self.resolve(key, locations).await,
                Term::Call { op, args } => {
                    let mut values = Vec::with_capacity(args.len());
                    for arg in args {
                        values.push(self.evaluate(arg, locations).await?);
                    }
                    ops::apply(op, &values)
                },
            }
        })
    }

    /// A referenced key comes from the local store if present, otherwise from
    /// one of the holders the coordinator listed.
    async fn resolve(
        &self,
        key: &str,
        locations: &BTreeMap<Key, Vec<Address>>,
    ) -> anyhow::Result<Datum> {
        if let Some(value) = self.store.get(key) {
            return Ok(value);
        }
        let holders = locations.get(key).cloned().unwrap_or_default();
        for holder in &holders {
            if holder == self.address() {
                continue;
            }
            match self.fetch_from_peer(holder, key).await {
                Ok(value) => {
                    self.store.put(key.to_string(), value.clone());
                    return Ok(value);
                },
                Err(err) => {
                    warn!(
                        "peer fetch failed, trying next holder. key: {} holder: {} err: {:#}",
                        key, holder, err
                    );
                },
            }
        }
        bail!("no holder could provide key {key}")
    }

    async fn fetch_from_peer(
        &self,
        holder: &str,
        key: &str,
    ) -> anyhow::Result<Datum> {
        debug!("fetching from peer. key: {} holder: {}", key, holder);
        let channel = Channel::connect(holder, self.address()).await?;
        let request = GetitemPayload {
            key: key.to_string(),
            queue: None,
        };
        let header = Header::new(Function::Getitem).with_jobid(key);
        let header_bytes = Codec::Json.encode(&header)?;
        let payload_bytes = header.payload_codec().encode(&request)?;

        let (reply_header, reply_payload) =
            channel.request(&header_bytes, &payload_bytes).await?;
        let reply_header: Header = Codec::Json.decode(&reply_header)?;
        if reply_header.function != Function::GetitemAck {
            bail!("unexpected peer reply: {}", reply_header.function);
        }
        if reply_header.status != Some(Status::Ok) {
            bail!("holder {holder} does not have key {key}");
        }
        let ack: GetitemAckPayload = reply_header.payload_codec().decode(&reply_payload)?;
        Ok(ack.value)
    }

    // ---- outbound ------------------------------------------------------

    fn send_to_scheduler<T: Serialize>(
        &self,
        mut header: Header,
        payload: &T,
    ) -> anyhow::Result<()> {
        header.address = Some(self.address().to_string());
        header.timestamp = Some(unix_timestamp());
        let payload_bytes = header.payload_codec().encode(payload)?;
        let header_bytes = Codec::Json.encode(&header)?;
        self.coordinator.send(&header_bytes, &payload_bytes)?;
        Ok(())
    }
}

fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}
