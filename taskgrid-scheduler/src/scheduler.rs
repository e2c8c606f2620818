//! The coordinator: two router endpoints, the shared indexes, and the run
//! loop that drives a graph to completion against the worker fleet.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Serialize;
use taskgrid_dag::finish_task;
use taskgrid_dag::initial_state;
use taskgrid_dag::reshape;
use taskgrid_messages::payloads::ComputePayload;
use taskgrid_messages::payloads::DelitemPayload;
use taskgrid_messages::payloads::FinishedTaskPayload;
use taskgrid_messages::payloads::GetitemAckPayload;
use taskgrid_messages::payloads::GetitemPayload;
use taskgrid_messages::payloads::RegisterPayload;
use taskgrid_messages::payloads::ScheduleAckPayload;
use taskgrid_messages::payloads::SchedulePayload;
use taskgrid_messages::payloads::SetitemAckPayload;
use taskgrid_messages::payloads::SetitemPayload;
use taskgrid_messages::Address;
use taskgrid_messages::Codec;
use taskgrid_messages::Datum;
use taskgrid_messages::Function;
use taskgrid_messages::Graph;
use taskgrid_messages::Header;
use taskgrid_messages::Key;
use taskgrid_messages::KeySpec;
use taskgrid_messages::QueueId;
use taskgrid_messages::Status;
use taskgrid_messages::Term;
use taskgrid_net::Endpoint;
use taskgrid_net::Frame;
use tokio::sync::Semaphore;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::SchedulerConfig;
use crate::correlator::Correlator;
use crate::correlator::Reply;
use crate::error::Error;
use crate::error::Result;
use crate::placement::PlacementIndex;
use crate::registry::IdlePool;
use crate::registry::WorkerRegistry;

/// Per-key execution record, reported by the producing worker.
#[derive(Clone, Copy, Debug)]
pub struct TaskMetadata {
    /// Seconds the task took on the worker.
    pub duration: f64,
}

/// Everything mutated by handlers, behind one coarse lock.
///
/// The lock is held only for brief synchronous sections, never across an
/// await point.
#[derive(Default)]
struct CoreState {
    workers: WorkerRegistry,
    placement: PlacementIndex,
    task_meta: HashMap<Key, TaskMetadata>,
    active_tasks: HashSet<Key>,
}

pub struct Scheduler {
    to_workers: Endpoint,
    to_clients: Endpoint,
    state: Mutex<CoreState>,
    idle: IdlePool,
    replies: Correlator,
    handler_slots: Arc<Semaphore>,
    poll_interval: Duration,
    closed: AtomicBool,
}

impl Scheduler {
    /// Binds both endpoints and spawns the two receive loops.
    pub async fn start(config: &SchedulerConfig) -> Result<Arc<Self>> {
        let to_workers = Endpoint::bind(&config.worker_address).await?;
        let to_clients = Endpoint::bind(&config.client_address).await?;

        let scheduler = Arc::new(Self {
            to_workers,
            to_clients,
            state: Mutex::new(CoreState::default()),
            idle: IdlePool::default(),
            replies: Correlator::default(),
            handler_slots: Arc::new(Semaphore::new(config.handler_pool_size)),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            closed: AtomicBool::new(false),
        });

        info!(
            "scheduler started. workers: {} clients: {}",
            scheduler.to_workers.address(),
            scheduler.to_clients.address(),
        );

        tokio::spawn(Arc::clone(&scheduler).listen_to_workers());
        tokio::spawn(Arc::clone(&scheduler).listen_to_clients());

        Ok(scheduler)
    }

    /// Address workers connect to.
    pub fn worker_address(&self) -> &str {
        self.to_workers.address()
    }

    /// Address clients connect to.
    pub fn client_address(&self) -> &str {
        self.to_clients.address()
    }

    /// Stops both receive loops; they exit within one poll interval.
    ///
    /// Runs still in flight are left undefined, matching the transport-level
    /// contract: no cancellation is attempted.
    pub fn close(&self) {
        info!("scheduler closing");
        self.closed.store(true, Ordering::SeqCst);
        self.to_workers.close();
        self.to_clients.close();
    }

    pub fn known_workers(&self) -> Vec<Address> {
        self.lock_state().workers.snapshot()
    }

    pub fn holders_of(
        &self,
        key: &str,
    ) -> Vec<Address> {
        self.lock_state().placement.holders_of(key)
    }

    pub fn task_metadata(
        &self,
        key: &str,
    ) -> Option<TaskMetadata> {
        self.lock_state().task_meta.get(key).copied()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CoreState> {
        self.state.lock().expect("scheduler state poisoned")
    }

    // ---- receive loops -------------------------------------------------

    async fn listen_to_workers(self: Arc<Self>) {
        while !self.closed.load(Ordering::SeqCst) {
            match self.to_workers.poll(self.poll_interval).await {
                Ok(Some(frame)) => self.dispatch(frame, Role::Worker).await,
                Ok(None) => continue,
                Err(err) => {
                    error!("worker endpoint failed. err: {:?}", err);
                    break;
                },
            }
        }
        info!("worker listener stopped");
    }

    async fn listen_to_clients(self: Arc<Self>) {
        while !self.closed.load(Ordering::SeqCst) {
            match self.to_clients.poll(self.poll_interval).await {
                Ok(Some(frame)) => self.dispatch(frame, Role::Client).await,
                Ok(None) => continue,
                Err(err) => {
                    error!("client endpoint failed. err: {:?}", err);
                    break;
                },
            }
        }
        info!("client listener stopped");
    }

    /// Decodes the header and hands the frame to a pooled handler task, so a
    /// slow handler never stalls the receive loop.
    async fn dispatch(
        self: &Arc<Self>,
        frame: Frame,
        role: Role,
    ) {
        let mut header: Header = match serde_json::from_slice(&frame.header) {
            Ok(header) => header,
            Err(err) => {
                warn!(
                    "dropping frame with undecodable header. peer: {} err: {}",
                    frame.peer, err
                );
                return;
            },
        };
        if header.address.is_none() {
            header.address = Some(frame.peer.clone());
        }
        debug!(
            "received frame. role: {:?} function: {} peer: {}",
            role, header.function, frame.peer
        );

        let permit = match Arc::clone(&self.handler_slots).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            let function = header.function;
            let outcome = match role {
                Role::Worker => scheduler.handle_worker_frame(header, &frame.payload).await,
                Role::Client => scheduler.handle_client_frame(header, &frame.payload).await,
            };
            if let Err(err) = outcome {
                error!("handler failed. function: {} err: {:?}", function, err);
            }
        });
    }

    async fn handle_worker_frame(
        &self,
        header: Header,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        match header.function {
            Function::Register => self.worker_registration(header, payload),
            Function::Status => self.status_to_worker(header),
            Function::FinishedTask => self.worker_finished_task(header, payload),
            Function::SetitemAck => self.setitem_ack(header, payload),
            Function::GetitemAck => self.getitem_ack(header, payload),
            other => {
                warn!("unknown worker function, frame dropped. function: {}", other);
                Ok(())
            },
        }
    }

    async fn handle_client_frame(
        &self,
        header: Header,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        match header.function {
            Function::Status => self.status_to_client(header),
            Function::Schedule => self.schedule_from_client(header, payload).await,
            other => {
                warn!("unknown client function, frame dropped. function: {}", other);
                Ok(())
            },
        }
    }

    // ---- outbound ------------------------------------------------------

    fn send_to_worker<T: Serialize>(
        &self,
        address: &str,
        mut header: Header,
        payload: &T,
    ) -> Result<()> {
        header.address = Some(self.to_workers.address().to_string());
        header.timestamp = Some(unix_timestamp());
        let payload_bytes = header.payload_codec().encode(payload)?;
        let header_bytes = Codec::Json.encode(&header)?;
        debug!(
            "send to worker. address: {} function: {}",
            address, header.function
        );
        self.to_workers.send(address, &header_bytes, &payload_bytes)?;
        Ok(())
    }

    fn send_to_client<T: Serialize>(
        &self,
        address: &str,
        mut header: Header,
        payload: &T,
    ) -> Result<()> {
        header.address = Some(self.to_clients.address().to_string());
        header.timestamp = Some(unix_timestamp());
        let payload_bytes = header.payload_codec().encode(payload)?;
        let header_bytes = Codec::Json.encode(&header)?;
        debug!(
            "send to client. address: {} function: {}",
            address, header.function
        );
        self.to_clients.send(address, &header_bytes, &payload_bytes)?;
        Ok(())
    }

    // ---- worker handlers -----------------------------------------------

    fn worker_registration(
        &self,
        header: Header,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let payload: RegisterPayload = header.payload_codec().decode(payload)?;
        let address = required_address(&header)?;
        info!("worker registered. address: {}", address);
        self.lock_state().workers.add(address.clone(), payload.metadata);
        self.idle.put(address);
        Ok(())
    }

    fn worker_finished_task(
        &self,
        header: Header,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let payload: FinishedTaskPayload = header.payload_codec().decode(payload)?;
        let address = required_address(&header)?;
        debug!(
            "task finished. key: {} worker: {} duration: {:.3}s error: {:?}",
            payload.key, address, payload.duration, payload.error
        );

        {
            let mut state = self.lock_state();
            state.active_tasks.remove(&payload.key);
            state.task_meta.insert(
                payload.key.clone(),
                TaskMetadata {
                    duration: payload.duration,
                },
            );
            // The worker now holds the produced value, and it fetched
            // whatever dependencies it was missing to compute it.
            state.placement.record(&payload.key, &address);
            for dep in &payload.dependencies {
                state.placement.record(dep, &address);
            }
        }
        self.idle.put(address);
        let queue = payload.queue;
        self.replies.post(&queue, Reply::Finished(payload));
        Ok(())
    }

    fn setitem_ack(
        &self,
        header: Header,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let payload: SetitemAckPayload = header.payload_codec().decode(payload)?;
        let address = required_address(&header)?;
        self.lock_state().placement.record(&payload.key, &address);
        if let Some(queue) = payload.queue {
            self.replies.post(&queue, Reply::SetAck { key: payload.key });
        }
        Ok(())
    }

    fn getitem_ack(
        &self,
        header: Header,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        if header.status != Some(Status::Ok) {
            warn!("getitem-ack without OK status, dropped. jobid: {:?}", header.jobid);
            return Ok(());
        }
        let payload: GetitemAckPayload = header.payload_codec().decode(payload)?;
        match payload.queue {
            Some(queue) => {
                self.replies.post(
                    &queue,
                    Reply::GetAck {
                        key: payload.key,
                        value: payload.value,
                    },
                );
            },
            None => {
                warn!("getitem-ack without queue, dropped. key: {}", payload.key);
            },
        }
        Ok(())
    }

    fn status_to_worker(
        &self,
        header: Header,
    ) -> anyhow::Result<()> {
        let address = required_address(&header)?;
        let mut reply = Header::new(Function::StatusAck).with_status(Status::Ok);
        reply.jobid = header.jobid;
        self.send_to_worker(&address, reply, &Datum::Str("OK".to_string()))?;
        Ok(())
    }

    // ---- client handlers -----------------------------------------------

    fn status_to_client(
        &self,
        header: Header,
    ) -> anyhow::Result<()> {
        let address = required_address(&header)?;
        let mut reply = Header::new(Function::StatusAck).with_status(Status::Ok);
        reply.jobid = header.jobid;
        self.send_to_client(&address, reply, &Datum::Str("OK".to_string()))?;
        Ok(())
    }

    async fn schedule_from_client(
        &self,
        header: Header,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let payload: SchedulePayload = header.payload_codec().decode(payload)?;
        let address = required_address(&header)?;
        let reply_codec = header.loads.unwrap_or_default();
        info!(
            "schedule requested. client: {} graph: {} keys",
            address,
            payload.graph.len()
        );

        let mut reply = Header::new(Function::ScheduleAck);
        reply.jobid = header.jobid;
        reply.dumps = Some(reply_codec);

        let ack = match self.schedule(&payload.graph, &payload.keys).await {
            Ok(result) => {
                reply.status = Some(Status::Ok);
                ScheduleAckPayload {
                    keys: payload.keys,
                    result: Some(result),
                    error: None,
                }
            },
            Err(err) => {
                warn!("schedule failed. client: {} err: {}", address, err);
                reply.status = Some(Status::Error);
                ScheduleAckPayload {
                    keys: payload.keys,
                    result: None,
                    error: Some(err.to_string()),
                }
            },
        };
        self.send_to_client(&address, reply, &ack)?;
        Ok(())
    }

    // ---- data plane ----------------------------------------------------

    /// Stores one value on a worker, chosen at random unless pinned.
    ///
    /// With `reply`, blocks until the worker acknowledges the store.
    pub async fn send_data(
        &self,
        key: &str,
        value: Datum,
        address: Option<&str>,
        reply: bool,
    ) -> Result<()> {
        let target = match address {
            Some(address) => address.to_string(),
            None => {
                self.lock_state()
                    .workers
                    .choose(&mut rand::thread_rng())
                    .ok_or_else(|| Error::MissingData { key: key.to_string() })?
            },
        };

        if !reply {
            let payload = SetitemPayload {
                key: key.to_string(),
                value,
                queue: None,
            };
            return self.send_to_worker(&target, Header::new(Function::Setitem).with_jobid(key), &payload);
        }

        let (queue, mut receiver) = self.replies.open();
        let payload = SetitemPayload {
            key: key.to_string(),
            value,
            queue: Some(queue),
        };
        let outcome = async {
            self.send_to_worker(&target, Header::new(Function::Setitem).with_jobid(key), &payload)?;
            receiver.recv().await.ok_or(Error::Shutdown)?;
            Ok(())
        }
        .await;
        self.replies.close(&queue);
        outcome
    }

    /// Spreads key/value pairs round-robin across all known workers.
    ///
    /// With `block`, waits for one ack per pair. Placement is recorded by the
    /// `setitem-ack` handler, not here.
    pub async fn scatter(
        &self,
        pairs: impl IntoIterator<Item = (Key, Datum)>,
        block: bool,
    ) -> Result<()> {
        let pairs: Vec<(Key, Datum)> = pairs.into_iter().collect();
        if pairs.is_empty() {
            return Ok(());
        }
        let workers = self.lock_state().workers.snapshot();
        if workers.is_empty() {
            return Err(Error::MissingData {
                key: pairs[0].0.clone(),
            });
        }
        debug!("scatter. pairs: {} workers: {}", pairs.len(), workers.len());

        let (queue, mut receiver) = self.replies.open();
        let outcome = async {
            for (index, (key, value)) in pairs.iter().enumerate() {
                let worker = &workers[index % workers.len()];
                let payload = SetitemPayload {
                    key: key.clone(),
                    value: value.clone(),
                    queue: block.then_some(queue),
                };
                self.send_to_worker(
                    worker,
                    Header::new(Function::Setitem).with_jobid(key.clone()),
                    &payload,
                )?;
            }
            if block {
                for _ in 0..pairs.len() {
                    receiver.recv().await.ok_or(Error::Shutdown)?;
                }
            }
            Ok(())
        }
        .await;
        self.replies.close(&queue);
        outcome
    }

    /// Collects the values of the requested keys, preserving the request's
    /// nesting in the result.
    pub async fn gather(
        &self,
        keys: &KeySpec,
    ) -> Result<Datum> {
        let leaves = keys.leaves();
        let targets = {
            let state = self.lock_state();
            let mut rng = rand::thread_rng();
            let mut targets = Vec::with_capacity(leaves.len());
            for key in &leaves {
                match state.placement.pick_holder(key, &mut rng) {
                    Some(worker) => targets.push((key.clone(), worker)),
                    None => return Err(Error::MissingData { key: key.clone() }),
                }
            }
            targets
        };

        let (queue, mut receiver) = self.replies.open();
        let outcome = async {
            for (key, worker) in &targets {
                let payload = GetitemPayload {
                    key: key.clone(),
                    queue: Some(queue),
                };
                self.send_to_worker(
                    worker,
                    Header::new(Function::Getitem).with_jobid(key.clone()),
                    &payload,
                )?;
            }

            let mut cache: BTreeMap<Key, Datum> = BTreeMap::new();
            let mut received = 0;
            while received < leaves.len() {
                match receiver.recv().await {
                    Some(Reply::GetAck { key, value }) => {
                        cache.insert(key, value);
                        received += 1;
                    },
                    Some(reply) => {
                        warn!("unexpected reply on gather queue, dropped. reply: {:?}", reply);
                    },
                    None => return Err(Error::Shutdown),
                }
            }
            Ok(reshape(keys, &cache)?)
        }
        .await;
        self.replies.close(&queue);
        outcome
    }

    // ---- the run loop --------------------------------------------------

    /// Executes a graph against the fleet and returns the requested values in
    /// the requested shape.
    pub async fn schedule(
        &self,
        graph: &Graph,
        requested: &KeySpec,
    ) -> Result<Datum> {
        let requested_set: BTreeSet<Key> = requested.leaves().into_iter().collect();
        let (mut state, cache) = initial_state(graph)?;

        if !state.waiting.is_empty() && state.ready_count() == 0 {
            return Err(Error::UnreachableTasks {
                waiting: state.waiting.len(),
            });
        }

        // Seed worker memories with the graph's inline values.
        self.scatter(cache, true).await?;

        let (event_queue, mut events) = self.replies.open();
        let outcome = async {
            self.fire_ready_tasks(graph, &mut state, event_queue).await?;

            while state.has_pending() {
                let event = match events.recv().await {
                    Some(Reply::Finished(payload)) => payload,
                    Some(reply) => {
                        warn!("unexpected reply on event queue, dropped. reply: {:?}", reply);
                        continue;
                    },
                    None => return Err(Error::Shutdown),
                };

                if let Some(error) = event.error {
                    return Err(Error::TaskFailure {
                        key: event.key,
                        error,
                    });
                }

                let mut retired = Vec::new();
                finish_task(&mut state, &event.key, &requested_set, |dep, state| {
                    state.release(dep);
                    retired.push(dep.to_string());
                });
                for key in retired {
                    self.release_key(&key);
                }

                self.fire_ready_tasks(graph, &mut state, event_queue).await?;
            }
            Ok(())
        }
        .await;
        self.replies.close(&event_queue);
        outcome?;

        self.gather(requested).await
    }

    /// Fires ready tasks while idle workers are available.
    async fn fire_ready_tasks(
        &self,
        graph: &Graph,
        state: &mut taskgrid_dag::State,
        queue: QueueId,
    ) -> Result<()> {
        while state.ready_count() > 0 && self.idle.idle_count() > 0 {
            let Some(key) = state.pop_ready() else {
                break;
            };
            state.running.insert(key.clone());
            let task = graph
                .get(&key)
                .cloned()
                .expect("ready keys come from this graph");
            let deps = state.dependencies[&key].clone();
            self.trigger_task(&key, task, &deps, queue).await?;
        }
        Ok(())
    }

    /// Sends one `compute` to the next idle worker.
    async fn trigger_task(
        &self,
        key: &str,
        task: Term,
        deps: &BTreeSet<Key>,
        queue: QueueId,
    ) -> Result<()> {
        let locations = {
            let state = self.lock_state();
            let mut locations = BTreeMap::new();
            for dep in deps {
                let holders = state.placement.holders_of(dep);
                if holders.is_empty() {
                    return Err(Error::MissingData { key: dep.clone() });
                }
                locations.insert(dep.clone(), holders);
            }
            locations
        };

        let worker = self.idle.take().await;
        debug!("fire task. key: {} worker: {}", key, worker);

        let payload = ComputePayload {
            key: key.to_string(),
            task,
            locations,
            queue,
        };
        let header = Header::new(Function::Compute).with_jobid(key).rich();
        self.send_to_worker(&worker, header, &payload)?;
        self.lock_state().active_tasks.insert(key.to_string());
        Ok(())
    }

    /// Tells every known holder to drop `key`, fire-and-forget, and updates
    /// the local index immediately.
    ///
    /// The holder list is snapshotted first; the index mutation below must
    /// not run while iterating the live set.
    fn release_key(
        &self,
        key: &str,
    ) {
        let holders = self.lock_state().placement.holders_of(key);
        if holders.is_empty() {
            return;
        }
        debug!("release data. key: {} holders: {}", key, holders.len());

        let payload = DelitemPayload {
            key: key.to_string(),
        };
        for worker in &holders {
            let header = Header::new(Function::Delitem).with_jobid(key);
            if let Err(err) = self.send_to_worker(worker, header, &payload) {
                warn!("delitem send failed. key: {} worker: {} err: {}", key, worker, err);
            }
        }

        let mut state = self.lock_state();
        for worker in &holders {
            state.placement.forget(key, worker);
        }
    }
}

#[derive(Copy, Clone, Debug)]
enum Role {
    Worker,
    Client,
}

fn required_address(header: &Header) -> anyhow::Result<Address> {
    header
        .address
        .clone()
        .ok_or_else(|| anyhow::anyhow!("frame has no sender address"))
}

fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}
