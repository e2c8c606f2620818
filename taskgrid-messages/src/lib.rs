use std::fmt::Display;
use std::fmt::Formatter;

use serde::Deserialize;
use serde::Serialize;

pub mod codec;
pub mod payloads;
pub mod task;

pub use codec::Codec;
pub use task::Datum;
pub use task::Graph;
pub use task::KeySpec;
pub use task::Term;

/// A client-chosen identifier for one value in the data plane.
pub type Key = String;

/// Opaque transport address of a peer, conventionally `tcp://host:port`.
pub type Address = String;

/// Name of a rendezvous queue awaiting replies on the coordinator.
pub type QueueId = uuid::Uuid;

/// Routing key of a frame: which handler the receiver should run.
///
/// The set is closed. Names not in it deserialize to [`Function::Unsupported`]
/// and the frame is dropped by the dispatcher.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Function {
    // Worker-originated.
    Register,
    FinishedTask,
    SetitemAck,
    GetitemAck,

    // Coordinator-originated.
    Compute,
    Setitem,
    Getitem,
    Delitem,
    ScheduleAck,
    StatusAck,

    // Either direction.
    Status,

    // Client-originated.
    Schedule,

    /// Used by serde if the frame's function name is not known.
    #[serde(other)]
    Unsupported,
}

impl Display for Function {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Function::Register => "register",
                Function::FinishedTask => "finished-task",
                Function::SetitemAck => "setitem-ack",
                Function::GetitemAck => "getitem-ack",
                Function::Compute => "compute",
                Function::Setitem => "setitem",
                Function::Getitem => "getitem",
                Function::Delitem => "delitem",
                Function::ScheduleAck => "schedule-ack",
                Function::StatusAck => "status-ack",
                Function::Status => "status",
                Function::Schedule => "schedule",
                Function::Unsupported => "unsupported",
            }
        )
    }
}

/// Outcome flag carried on ack frames.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum Status {
    #[serde(rename = "OK")]
    Ok,
    Error,
}

/// Frame header.
///
/// Always encoded with the portable codec so every peer can route the frame;
/// the payload codec is chosen per call via [`Header::dumps`].
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Header {
    pub function: Function,

    /// Echoed back on acks to relate replies to requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobid: Option<String>,

    /// Sender's listen address. Injected by the dispatcher if missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,

    /// Seconds since the Unix epoch, stamped at send time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,

    /// Codec the payload of this frame was encoded with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dumps: Option<Codec>,

    /// Codec the sender expects reply payloads in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loads: Option<Codec>,
}

impl Header {
    pub fn new(function: Function) -> Self {
        Self {
            function,
            jobid: None,
            address: None,
            status: None,
            timestamp: None,
            dumps: None,
            loads: None,
        }
    }

    pub fn with_jobid(
        mut self,
        jobid: impl Into<String>,
    ) -> Self {
        self.jobid = Some(jobid.into());
        self
    }

    pub fn with_status(
        mut self,
        status: Status,
    ) -> Self {
        self.status = Some(status);
        self
    }

    /// Marks the payload as encoded with the rich codec, replies expected in
    /// the same.
    pub fn rich(mut self) -> Self {
        self.dumps = Some(Codec::Bincode);
        self.loads = Some(Codec::Bincode);
        self
    }

    /// Codec to decode this frame's payload with.
    pub fn payload_codec(&self) -> Codec {
        self.dumps.unwrap_or_default()
    }
}
