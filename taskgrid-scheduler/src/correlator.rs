//! UUID-named rendezvous queues for awaiting worker replies.

use std::collections::HashMap;
use std::sync::Mutex;

use taskgrid_messages::payloads::FinishedTaskPayload;
use taskgrid_messages::Datum;
use taskgrid_messages::Key;
use taskgrid_messages::QueueId;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// One item posted to a rendezvous queue.
#[derive(Debug)]
pub enum Reply {
    /// A worker acknowledged a `setitem`.
    SetAck { key: Key },

    /// A worker answered a `getitem`.
    GetAck { key: Key, value: Datum },

    /// A worker finished (or failed) a task.
    Finished(FinishedTaskPayload),
}

/// Registry of live rendezvous queues.
///
/// A queue name exists for the lifetime of exactly one requesting routine:
/// opened before the requests go out, closed once the expected replies are
/// in. Posting to a name that is not registered is a handler-level anomaly;
/// it is logged and the item is dropped.
#[derive(Default)]
pub struct Correlator {
    queues: Mutex<HashMap<QueueId, mpsc::UnboundedSender<Reply>>>,
}

impl Correlator {
    pub fn open(&self) -> (QueueId, mpsc::UnboundedReceiver<Reply>) {
        let name = Uuid::new_v4();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.queues
            .lock()
            .expect("correlator poisoned")
            .insert(name, sender);
        (name, receiver)
    }

    pub fn post(
        &self,
        name: &QueueId,
        reply: Reply,
    ) {
        let queues = self.queues.lock().expect("correlator poisoned");
        match queues.get(name) {
            Some(sender) => {
                if sender.send(reply).is_err() {
                    warn!("reply queue receiver gone. queue: {}", name);
                }
            },
            None => {
                warn!("dropping reply for unknown queue. queue: {}", name);
            },
        }
    }

    pub fn close(
        &self,
        name: &QueueId,
    ) {
        self.queues
            .lock()
            .expect("correlator poisoned")
            .remove(name);
    }
}
