//! End-to-end scenarios: a real coordinator and in-process workers over
//! loopback TCP.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use taskgrid_messages::payloads::ScheduleAckPayload;
use taskgrid_messages::payloads::SchedulePayload;
use taskgrid_messages::Codec;
use taskgrid_messages::Datum;
use taskgrid_messages::Function;
use taskgrid_messages::Graph;
use taskgrid_messages::Header;
use taskgrid_messages::KeySpec;
use taskgrid_messages::Status;
use taskgrid_messages::Term;
use taskgrid_net::Channel;
use taskgrid_worker::Worker;
use taskgrid_worker::WorkerConfig;

use crate::Error;
use crate::Scheduler;
use crate::SchedulerConfig;

async fn start_scheduler() -> anyhow::Result<Arc<Scheduler>> {
    Ok(Scheduler::start(&SchedulerConfig::default()).await?)
}

async fn spawn_worker(
    scheduler: &Scheduler,
    name: &str,
) -> anyhow::Result<Arc<Worker>> {
    let config = WorkerConfig {
        scheduler_address: scheduler.worker_address().to_string(),
        listen_address: "tcp://127.0.0.1:0".to_string(),
        name: name.to_string(),
        poll_interval_ms: 50,
    };
    Ok(Worker::start(&config).await?)
}

async fn wait_until(
    timeout: Duration,
    mut condition: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn wait_for_workers(
    scheduler: &Scheduler,
    count: usize,
) -> anyhow::Result<()> {
    let registered = wait_until(Duration::from_secs(5), || {
        scheduler.known_workers().len() >= count
    })
    .await;
    if !registered {
        bail!("workers did not register in time");
    }
    Ok(())
}

/// Client-side driver speaking the wire protocol.
struct TestClient {
    channel: Channel,
}

impl TestClient {
    async fn connect(scheduler: &Scheduler) -> anyhow::Result<Self> {
        let identity = format!("client-{}", uuid::Uuid::new_v4());
        let channel = Channel::connect(scheduler.client_address(), &identity).await?;
        Ok(Self { channel })
    }

    async fn schedule(
        &self,
        graph: Graph,
        keys: KeySpec,
    ) -> anyhow::Result<(Option<Status>, ScheduleAckPayload)> {
        let header = Header::new(Function::Schedule).rich();
        let payload = SchedulePayload { graph, keys };
        let header_bytes = Codec::Json.encode(&header)?;
        let payload_bytes = header.payload_codec().encode(&payload)?;
        self.channel.send(&header_bytes, &payload_bytes)?;

        let (reply_header, reply_payload) = tokio::time::timeout(
            Duration::from_secs(10),
            self.channel.recv(),
        )
        .await??;
        let reply_header: Header = Codec::Json.decode(&reply_header)?;
        if reply_header.function != Function::ScheduleAck {
            bail!("unexpected reply: {}", reply_header.function);
        }
        let ack: ScheduleAckPayload = reply_header.payload_codec().decode(&reply_payload)?;
        Ok((reply_header.status, ack))
    }

    async fn status(&self) -> anyhow::Result<Option<Status>> {
        let header = Header::new(Function::Status);
        self.channel.send(&Codec::Json.encode(&header)?, b"{}")?;
        let (reply_header, _) = tokio::time::timeout(
            Duration::from_secs(5),
            self.channel.recv(),
        )
        .await??;
        let reply_header: Header = Codec::Json.decode(&reply_header)?;
        Ok(reply_header.status)
    }
}

#[tokio::test]
async fn schedules_a_single_task_on_one_worker() -> anyhow::Result<()> {
    let scheduler = start_scheduler().await?;
    let worker = spawn_worker(&scheduler, "w1").await?;
    wait_for_workers(&scheduler, 1).await?;

    let graph = Graph::from([
        ("x".to_string(), Term::literal(Datum::Int(1))),
        (
            "y".to_string(),
            Term::call("add", vec![Term::key("x"), Term::literal(Datum::Int(2))]),
        ),
    ]);

    let result = scheduler.schedule(&graph, &KeySpec::one("y")).await?;
    assert_eq!(result, Datum::Int(3));
    assert_eq!(scheduler.holders_of("y"), vec![worker.address().to_string()]);
    assert_eq!(worker.value_of("y"), Some(Datum::Int(3)));
    assert!(scheduler.task_metadata("y").is_some());

    scheduler.close();
    worker.close();
    Ok(())
}

#[tokio::test]
async fn schedules_a_diamond_on_two_workers() -> anyhow::Result<()> {
    let scheduler = start_scheduler().await?;
    let w1 = spawn_worker(&scheduler, "w1").await?;
    let w2 = spawn_worker(&scheduler, "w2").await?;
    wait_for_workers(&scheduler, 2).await?;

    let graph = Graph::from([
        ("a".to_string(), Term::literal(Datum::Int(1))),
        ("b".to_string(), Term::literal(Datum::Int(2))),
        (
            "c".to_string(),
            Term::call("add", vec![Term::key("a"), Term::key("b")]),
        ),
        (
            "d".to_string(),
            Term::call("mul", vec![Term::key("c"), Term::literal(Datum::Int(10))]),
        ),
    ]);
    let keys = KeySpec::many([KeySpec::one("c"), KeySpec::one("d")]);

    let result = scheduler.schedule(&graph, &keys).await?;
    assert_eq!(result, Datum::List(vec![Datum::Int(3), Datum::Int(30)]));

    scheduler.close();
    w1.close();
    w2.close();
    Ok(())
}

#[tokio::test]
async fn scatter_and_gather_preserve_shape() -> anyhow::Result<()> {
    let scheduler = start_scheduler().await?;
    let w1 = spawn_worker(&scheduler, "w1").await?;
    let w2 = spawn_worker(&scheduler, "w2").await?;
    wait_for_workers(&scheduler, 2).await?;

    scheduler
        .scatter(
            [
                ("x".to_string(), Datum::Int(1)),
                ("y".to_string(), Datum::Int(2)),
                ("z".to_string(), Datum::Int(3)),
            ],
            true,
        )
        .await?;

    let nested = KeySpec::many([
        KeySpec::many([KeySpec::one("x"), KeySpec::one("y")]),
        KeySpec::many([KeySpec::one("z")]),
    ]);
    let gathered = scheduler.gather(&nested).await?;
    assert_eq!(
        gathered,
        Datum::List(vec![
            Datum::List(vec![Datum::Int(1), Datum::Int(2)]),
            Datum::List(vec![Datum::Int(3)]),
        ])
    );

    // Flat round-trip of the same values.
    let flat = KeySpec::many([KeySpec::one("x"), KeySpec::one("y"), KeySpec::one("z")]);
    assert_eq!(
        scheduler.gather(&flat).await?,
        Datum::List(vec![Datum::Int(1), Datum::Int(2), Datum::Int(3)])
    );

    scheduler.close();
    w1.close();
    w2.close();
    Ok(())
}

#[tokio::test]
async fn failing_task_surfaces_as_error_ack() -> anyhow::Result<()> {
    let scheduler = start_scheduler().await?;
    let worker = spawn_worker(&scheduler, "w1").await?;
    wait_for_workers(&scheduler, 1).await?;

    let graph = Graph::from([(
        "x".to_string(),
        Term::call("throw", vec![Term::literal(Datum::Str("boom".to_string()))]),
    )]);

    let client = TestClient::connect(&scheduler).await?;
    let (status, ack) = client.schedule(graph, KeySpec::one("x")).await?;
    assert_eq!(status, Some(Status::Error));
    assert!(ack.result.is_none());
    let error = ack.error.expect("error detail expected");
    assert!(error.contains("boom"), "unexpected error: {error}");

    scheduler.close();
    worker.close();
    Ok(())
}

#[tokio::test]
async fn cyclic_graph_is_rejected_as_unreachable() -> anyhow::Result<()> {
    let scheduler = start_scheduler().await?;

    let graph = Graph::from([
        ("x".to_string(), Term::call("inc", vec![Term::key("y")])),
        ("y".to_string(), Term::call("inc", vec![Term::key("x")])),
    ]);

    match scheduler.schedule(&graph, &KeySpec::one("x")).await {
        Err(Error::UnreachableTasks { waiting }) => assert_eq!(waiting, 2),
        other => bail!("expected UnreachableTasks, got {:?}", other.map(|_| ())),
    }

    scheduler.close();
    Ok(())
}

#[tokio::test]
async fn concurrent_runs_on_disjoint_graphs_are_independent() -> anyhow::Result<()> {
    let scheduler = start_scheduler().await?;
    let w1 = spawn_worker(&scheduler, "w1").await?;
    let w2 = spawn_worker(&scheduler, "w2").await?;
    wait_for_workers(&scheduler, 2).await?;

    let left = Graph::from([
        ("l-x".to_string(), Term::literal(Datum::Int(10))),
        (
            "l-y".to_string(),
            Term::call("inc", vec![Term::key("l-x")]),
        ),
    ]);
    let right = Graph::from([
        ("r-x".to_string(), Term::literal(Datum::Int(20))),
        (
            "r-y".to_string(),
            Term::call("inc", vec![Term::key("r-x")]),
        ),
    ]);

    let left_key = KeySpec::one("l-y");
    let right_key = KeySpec::one("r-y");
    let (left_result, right_result) = tokio::join!(
        scheduler.schedule(&left, &left_key),
        scheduler.schedule(&right, &right_key),
    );
    assert_eq!(left_result?, Datum::Int(11));
    assert_eq!(right_result?, Datum::Int(21));

    scheduler.close();
    w1.close();
    w2.close();
    Ok(())
}

#[tokio::test]
async fn intermediate_values_are_released() -> anyhow::Result<()> {
    let scheduler = start_scheduler().await?;
    let worker = spawn_worker(&scheduler, "w1").await?;
    wait_for_workers(&scheduler, 1).await?;

    let graph = Graph::from([
        ("a".to_string(), Term::literal(Datum::Int(1))),
        ("b".to_string(), Term::call("inc", vec![Term::key("a")])),
        ("c".to_string(), Term::call("inc", vec![Term::key("b")])),
    ]);

    let result = scheduler.schedule(&graph, &KeySpec::one("c")).await?;
    assert_eq!(result, Datum::Int(3));

    // Only the requested key survives on the fleet.
    assert!(scheduler.holders_of("a").is_empty());
    assert!(scheduler.holders_of("b").is_empty());
    assert!(!scheduler.holders_of("c").is_empty());
    let dropped = wait_until(Duration::from_secs(5), || {
        !worker.held_keys().contains(&"b".to_string())
    })
    .await;
    assert!(dropped, "worker never dropped the released key");

    scheduler.close();
    worker.close();
    Ok(())
}

#[tokio::test]
async fn dependents_fetch_values_from_peers() -> anyhow::Result<()> {
    let scheduler = start_scheduler().await?;
    let w1 = spawn_worker(&scheduler, "w1").await?;
    let w2 = spawn_worker(&scheduler, "w2").await?;
    wait_for_workers(&scheduler, 2).await?;

    // b runs on the first idle worker; c then fires on the other one, which
    // has to pull b's value across.
    let graph = Graph::from([
        ("x".to_string(), Term::literal(Datum::Int(1))),
        ("b".to_string(), Term::call("inc", vec![Term::key("x")])),
        (
            "c".to_string(),
            Term::call("add", vec![Term::key("b"), Term::key("b")]),
        ),
    ]);

    let result = scheduler.schedule(&graph, &KeySpec::one("c")).await?;
    assert_eq!(result, Datum::Int(4));

    scheduler.close();
    w1.close();
    w2.close();
    Ok(())
}

#[tokio::test]
async fn unknown_functions_are_dropped_without_breaking_the_run() -> anyhow::Result<()> {
    let scheduler = start_scheduler().await?;
    let worker = spawn_worker(&scheduler, "w1").await?;
    wait_for_workers(&scheduler, 1).await?;

    let client = TestClient::connect(&scheduler).await?;
    // A frame with an unrecognized function name is logged and dropped.
    client
        .channel
        .send(br#"{"function":"self-destruct"}"#, b"{}")?;
    // A malformed header too.
    client.channel.send(b"not json at all", b"")?;

    assert_eq!(client.status().await?, Some(Status::Ok));

    let graph = Graph::from([
        ("x".to_string(), Term::literal(Datum::Int(5))),
        ("y".to_string(), Term::call("inc", vec![Term::key("x")])),
    ]);
    let (status, ack) = client.schedule(graph, KeySpec::one("y")).await?;
    assert_eq!(status, Some(Status::Ok));
    assert_eq!(ack.result, Some(Datum::Int(6)));

    scheduler.close();
    worker.close();
    Ok(())
}

#[tokio::test]
async fn send_data_pins_a_value_to_a_worker() -> anyhow::Result<()> {
    let scheduler = start_scheduler().await?;
    let w1 = spawn_worker(&scheduler, "w1").await?;
    let w2 = spawn_worker(&scheduler, "w2").await?;
    wait_for_workers(&scheduler, 2).await?;

    scheduler
        .send_data("pinned", Datum::Int(42), Some(w2.address()), true)
        .await?;
    assert_eq!(
        scheduler.holders_of("pinned"),
        vec![w2.address().to_string()]
    );
    assert_eq!(w2.value_of("pinned"), Some(Datum::Int(42)));
    assert_eq!(w1.value_of("pinned"), None);

    assert_eq!(
        scheduler.gather(&KeySpec::one("pinned")).await?,
        Datum::Int(42)
    );

    scheduler.close();
    w1.close();
    w2.close();
    Ok(())
}

#[tokio::test]
async fn gather_of_unknown_key_is_missing_data() -> anyhow::Result<()> {
    let scheduler = start_scheduler().await?;

    match scheduler.gather(&KeySpec::one("ghost")).await {
        Err(Error::MissingData { key }) => assert_eq!(key, "ghost"),
        other => bail!("expected MissingData, got {:?}", other.map(|_| ())),
    }

    scheduler.close();
    Ok(())
}
