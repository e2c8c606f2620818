//! Payload bodies for each RPC function.
//!
//! The `queue` fields name a rendezvous queue on the coordinator; acks echo
//! the name back so the dispatcher can wake the routine waiting on it.

use std::collections::BTreeMap;

use serde_derive::Deserialize;
use serde_derive::Serialize;

use crate::task::Datum;
use crate::task::Graph;
use crate::task::KeySpec;
use crate::task::Term;
use crate::Address;
use crate::Key;
use crate::QueueId;

/// `register`: a worker announces itself.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RegisterPayload {
    /// Opaque worker metadata, kept verbatim in the registry.
    pub metadata: Datum,
}

/// `compute`: execute one task, fetching dependencies from listed holders.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ComputePayload {
    pub key: Key,

    /// Forwarded verbatim from the client's graph.
    pub task: Term,

    /// For each dependency, the workers known to hold its value.
    pub locations: BTreeMap<Key, Vec<Address>>,

    /// Rendezvous queue for the run's completion events.
    pub queue: QueueId,
}

/// `setitem`: store a value locally.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SetitemPayload {
    pub key: Key,
    pub value: Datum,

    /// If set, reply with `setitem-ack` carrying the same queue name.
    #[serde(default)]
    pub queue: Option<QueueId>,
}

/// `setitem-ack`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SetitemAckPayload {
    pub key: Key,

    #[serde(default)]
    pub queue: Option<QueueId>,
}

/// `getitem`: reply with the value via `getitem-ack`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct GetitemPayload {
    pub key: Key,

    /// Unset on direct worker-to-worker fetches, which reply over the
    /// requesting connection instead of a coordinator queue.
    #[serde(default)]
    pub queue: Option<QueueId>,
}

/// `getitem-ack`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct GetitemAckPayload {
    pub key: Key,
    pub value: Datum,

    #[serde(default)]
    pub queue: Option<QueueId>,
}

/// `delitem`: drop a value locally. Fire-and-forget, no reply.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DelitemPayload {
    pub key: Key,
}

/// `finished-task`: a worker reports one task's outcome.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct FinishedTaskPayload {
    pub key: Key,

    /// Elapsed execution time in seconds, as measured by the worker.
    pub duration: f64,

    /// Dependencies the worker resolved to run the task. The worker holds
    /// these now, in addition to the produced key.
    pub dependencies: Vec<Key>,

    /// The run's completion queue, echoed from the `compute` payload.
    pub queue: QueueId,

    /// Set when execution failed; the run aborts with this message.
    #[serde(default)]
    pub error: Option<String>,
}

/// `schedule`: a client submits a graph and the keys it wants back.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SchedulePayload {
    pub graph: Graph,
    pub keys: KeySpec,
}

/// `schedule-ack`: the run's result, or its error.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ScheduleAckPayload {
    /// The requested keys, echoed back.
    pub keys: KeySpec,

    /// Values in the requested shape. Unset when the run failed.
    #[serde(default)]
    pub result: Option<Datum>,

    /// Error details, if any.
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Codec;

    #[test]
    fn compute_payload_roundtrips_under_rich_codec() -> anyhow::Result<()> {
        let payload = ComputePayload {
            key: "y".to_string(),
            task: Term::call("add", vec![Term::key("x"), Term::literal(Datum::Int(2))]),
            locations: BTreeMap::from([(
                "x".to_string(),
                vec!["tcp://127.0.0.1:4000".to_string()],
            )]),
            queue: uuid::Uuid::new_v4(),
        };
        let bytes = Codec::Bincode.encode(&payload)?;
        let back: ComputePayload = Codec::Bincode.decode(&bytes)?;
        assert_eq!(back, payload);
        Ok(())
    }

    #[test]
    fn finished_task_error_field_may_be_absent() -> anyhow::Result<()> {
        let queue = uuid::Uuid::new_v4();
        let json =
            format!(r#"{{"key":"y","duration":0.25,"dependencies":["x"],"queue":"{queue}"}}"#);
        let payload: FinishedTaskPayload = serde_json::from_str(&json)?;
        assert_eq!(payload.error, None);
        Ok(())
    }

    #[test]
    fn ack_options_survive_both_codecs() -> anyhow::Result<()> {
        let payload = ScheduleAckPayload {
            keys: KeySpec::one("y"),
            result: None,
            error: Some("boom".to_string()),
        };
        for codec in [Codec::Json, Codec::Bincode] {
            let bytes = codec.encode(&payload)?;
            let back: ScheduleAckPayload = codec.decode(&bytes)?;
            assert_eq!(back, payload);
        }
        Ok(())
    }
}
