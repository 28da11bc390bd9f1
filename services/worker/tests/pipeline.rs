//! Worker loop tests against an in-process broker.
//!
//! An upstream producer publishes into the worker's input queue and a
//! downstream `Receiver` reads what the worker emits, so every test checks
//! the output exactly as the next stage would see it.
use async_trait::async_trait;
use bytes::Bytes;
use conveyor_broker::Broker;
use conveyor_common::{ClientId, Headers, MessageKind, ReplicaId, Seq};
use conveyor_middleware::{
    Checkpoint, Delivery, DeliveryType, InFlight, InProcessTransport, Receiver, Transport,
    topology,
};
use conveyor_wire::batch::{Batch, Row};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use worker::chaos::{CrashMode, Phase, Roulette};
use worker::config::{InputConfig, OutputConfig, StageKind, WorkerConfig};
use worker::worker::{Exit, Worker};

const INPUT_EXCHANGE: &str = "movies";
const INPUT_QUEUE: &str = "stage";
const OUTPUT_EXCHANGE: &str = "stage-out";
const OUTPUT_QUEUE: &str = "sink";
const CLIENT: ClientId = 1;

struct NoCheckpoint;

#[async_trait]
impl Checkpoint for NoCheckpoint {
    async fn checkpoint(&self, _client_id: ClientId) -> conveyor_middleware::Result<()> {
        Ok(())
    }
}

fn config(state_dir: &Path, stage: StageKind) -> WorkerConfig {
    WorkerConfig {
        id: 0,
        broker_url: "tcp://unused:0".to_string(),
        inputs: vec![InputConfig {
            exchange: INPUT_EXCHANGE.to_string(),
            queue: INPUT_QUEUE.to_string(),
            copies: 1,
        }],
        output_exchange: OUTPUT_EXCHANGE.to_string(),
        outputs: vec![OutputConfig {
            queue: OUTPUT_QUEUE.to_string(),
            delivery: DeliveryType::Robin,
            copies: 1,
        }],
        select: Default::default(),
        stage,
        crash_chance: 0.0,
        crash_mode: CrashMode::Halt,
        health_check_port: 0,
        keep_alive_retries: 1,
        state_dir: state_dir.to_path_buf(),
        metrics_bind: None,
    }
}

struct Pipeline {
    transport: Arc<InProcessTransport>,
    sink: mpsc::Receiver<Delivery>,
    _sink_receiver: Receiver,
}

impl Pipeline {
    async fn new() -> Self {
        let transport = Arc::new(InProcessTransport::new(Arc::new(Broker::new())));
        topology::declare_input(transport.as_ref(), INPUT_EXCHANGE, INPUT_QUEUE, 0)
            .await
            .expect("input topology");
        topology::declare_output(transport.as_ref(), OUTPUT_EXCHANGE, OUTPUT_QUEUE, 1)
            .await
            .expect("output topology");
        let mut sink_receiver = Receiver::new(topology::queue_name(OUTPUT_QUEUE, 0), 1, InFlight::new());
        let sink = sink_receiver
            .consume(transport.as_ref(), "downstream", Arc::new(NoCheckpoint))
            .await
            .expect("consume sink");
        Self {
            transport,
            sink,
            _sink_receiver: sink_receiver,
        }
    }

    fn dyn_transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    async fn publish(&self, seq: Seq, kind: MessageKind, body: Bytes) {
        self.publish_as(0, seq, kind, body).await;
    }

    async fn publish_as(&self, replica: ReplicaId, seq: Seq, kind: MessageKind, body: Bytes) {
        self.transport
            .publish(
                INPUT_EXCHANGE,
                &topology::queue_name(INPUT_QUEUE, 0),
                Headers::new(replica, CLIENT, seq, kind).to_table(),
                body,
            )
            .await
            .expect("publish");
    }

    async fn publish_movies(&self, batches: &[&[&str]]) {
        for (seq, ids) in batches.iter().enumerate() {
            self.publish(seq as i32, MessageKind::Batch, movies(ids).encode(&Default::default()))
                .await;
        }
        self.publish(batches.len() as i32, MessageKind::Eof, Bytes::new())
            .await;
    }

    /// Next downstream delivery, acknowledged.
    async fn next(&mut self) -> (Headers, Bytes) {
        let delivery = timeout(Duration::from_secs(2), self.sink.recv())
            .await
            .expect("timely output")
            .expect("sink open");
        let out = (delivery.headers, delivery.body.clone());
        delivery.ack().await.expect("ack");
        out
    }

    async fn outputs(&mut self, n: usize) -> Vec<(MessageKind, Seq)> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let (headers, _) = self.next().await;
            out.push((headers.kind, headers.seq));
        }
        out
    }

    async fn assert_quiet(&mut self) {
        let extra = timeout(Duration::from_millis(150), self.sink.recv()).await;
        assert!(extra.is_err(), "unexpected output: {extra:?}");
    }

    async fn input_settled(&self) {
        let queue = topology::queue_name(INPUT_QUEUE, 0);
        timeout(Duration::from_secs(2), async {
            loop {
                let depth = self
                    .transport
                    .broker()
                    .queue_depth(&queue)
                    .await
                    .expect("depth");
                if depth.unacked == 0 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("input settled");
    }
}

fn movies(ids: &[&str]) -> Batch {
    Batch::new(
        ids.iter()
            .map(|id| Row::from([("movieId".to_string(), id.to_string())]))
            .collect(),
    )
}

fn spawn(worker: Worker) -> (oneshot::Sender<()>, JoinHandle<anyhow::Result<Exit>>) {
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(worker.run(async move {
        let _ = stop_rx.await;
    }));
    (stop_tx, task)
}

async fn assert_crashed(task: JoinHandle<anyhow::Result<Exit>>, phase: Phase) {
    let exit = timeout(Duration::from_secs(2), task)
        .await
        .expect("worker crashes")
        .expect("join")
        .expect("crash is not an error");
    assert_eq!(exit, Exit::Crashed(phase));
}

async fn stop(stop_tx: oneshot::Sender<()>, task: JoinHandle<anyhow::Result<Exit>>) {
    let _ = stop_tx.send(());
    let exit = timeout(Duration::from_secs(2), task)
        .await
        .expect("worker stops")
        .expect("join")
        .expect("clean exit");
    assert_eq!(exit, Exit::Shutdown);
}

// Lets `crash_after` messages through, then fires at `phase` of the next one.
fn crash_at(crash_after: usize, phase: Phase) -> Roulette {
    let skipped = match phase {
        Phase::Received => 0,
        Phase::Processed => 1,
        Phase::Persisted => 2,
    };
    let mut draws = std::iter::repeat_n(0.9, crash_after * 3 + skipped).chain(std::iter::once(0.0));
    Roulette::with_draw(50.0, CrashMode::Halt, move || draws.next().unwrap_or(0.9))
}

async fn assert_relayed(pipeline: &mut Pipeline, batches: &[&[&str]]) {
    for (seq, ids) in batches.iter().enumerate() {
        let (headers, body) = pipeline.next().await;
        assert_eq!(headers.kind, MessageKind::Batch);
        assert_eq!(headers.client_id, CLIENT);
        assert_eq!(headers.seq, seq as i32);
        assert_eq!(Batch::decode(&body).expect("batch"), movies(ids));
    }
    let (headers, _) = pipeline.next().await;
    assert_eq!(headers.kind, MessageKind::Eof);
    assert_eq!(headers.seq, batches.len() as i32);
    pipeline.assert_quiet().await;
}

const BATCHES: [&[&str]; 3] = [&["1", "2"], &["3"], &["4", "5", "6"]];

#[tokio::test]
async fn relay_forwards_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut pipeline = Pipeline::new().await;
    let worker = Worker::new(&config(dir.path(), StageKind::Relay), pipeline.dyn_transport())
        .await
        .expect("worker")
        .with_roulette(Roulette::disabled());
    let (stop_tx, task) = spawn(worker);

    // Out of order on the wire; the worker still sees 0, 1, 2, EOF.
    pipeline
        .publish(1, MessageKind::Batch, movies(BATCHES[1]).encode(&Default::default()))
        .await;
    pipeline
        .publish(0, MessageKind::Batch, movies(BATCHES[0]).encode(&Default::default()))
        .await;
    pipeline.publish(3, MessageKind::Eof, Bytes::new()).await;
    pipeline
        .publish(2, MessageKind::Batch, movies(BATCHES[2]).encode(&Default::default()))
        .await;

    assert_relayed(&mut pipeline, &BATCHES).await;
    stop(stop_tx, task).await;
}

#[tokio::test]
async fn duplicates_are_not_forwarded() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut pipeline = Pipeline::new().await;
    let worker = Worker::new(&config(dir.path(), StageKind::Relay), pipeline.dyn_transport())
        .await
        .expect("worker")
        .with_roulette(Roulette::disabled());
    let (stop_tx, task) = spawn(worker);

    let body = movies(BATCHES[0]).encode(&Default::default());
    pipeline.publish(0, MessageKind::Batch, body.clone()).await;
    pipeline.publish(0, MessageKind::Batch, body).await;
    pipeline.publish(1, MessageKind::Eof, Bytes::new()).await;

    assert_relayed(&mut pipeline, &BATCHES[..1]).await;
    stop(stop_tx, task).await;
}

async fn crash_and_resume(phase: Phase) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut pipeline = Pipeline::new().await;
    let config = config(dir.path(), StageKind::Relay);

    let crashing = Worker::new(&config, pipeline.dyn_transport())
        .await
        .expect("worker")
        .with_roulette(crash_at(1, phase));
    let (_stop_tx, task) = spawn(crashing);
    pipeline.publish_movies(&BATCHES).await;
    assert_crashed(task, phase).await;
    pipeline.input_settled().await;

    let resumed = Worker::new(&config, pipeline.dyn_transport())
        .await
        .expect("worker")
        .with_roulette(Roulette::disabled());
    let (stop_tx, task) = spawn(resumed);
    assert_relayed(&mut pipeline, &BATCHES).await;
    stop(stop_tx, task).await;
}

#[tokio::test]
async fn crash_after_receive_is_recovered() {
    crash_and_resume(Phase::Received).await;
}

#[tokio::test]
async fn crash_after_processing_is_recovered() {
    crash_and_resume(Phase::Processed).await;
}

#[tokio::test]
async fn crash_after_persisting_is_recovered() {
    crash_and_resume(Phase::Persisted).await;
}

#[tokio::test]
async fn flush_keeps_only_the_flush_marker() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut pipeline = Pipeline::new().await;
    let worker = Worker::new(&config(dir.path(), StageKind::Relay), pipeline.dyn_transport())
        .await
        .expect("worker")
        .with_roulette(Roulette::disabled());
    let client_dir = worker.mailer().state_dir().join(CLIENT.to_string());
    let (stop_tx, task) = spawn(worker);

    pipeline.publish_movies(&BATCHES[..1]).await;
    assert_relayed(&mut pipeline, &BATCHES[..1]).await;
    assert!(client_dir.join("state").exists());

    pipeline.publish(2, MessageKind::Flush, Bytes::new()).await;
    let (headers, _) = pipeline.next().await;
    assert_eq!(headers.kind, MessageKind::Flush);
    let marker = format!("flushed {} 0 2\n", topology::queue_name(INPUT_QUEUE, 0));
    timeout(Duration::from_secs(2), async {
        while std::fs::read_to_string(client_dir.join("state")).ok().as_deref()
            != Some(marker.as_str())
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client state reduced to the flush marker");
    stop(stop_tx, task).await;
}

// Session one ends with a FLUSH the worker crashes on; session two reuses the client id.
async fn crash_on_flush_then_reuse_client(phase: Phase) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut pipeline = Pipeline::new().await;
    let config = config(dir.path(), StageKind::Relay);

    let crashing = Worker::new(&config, pipeline.dyn_transport())
        .await
        .expect("worker")
        .with_roulette(crash_at(1, phase));
    let (_stop_tx, task) = spawn(crashing);
    pipeline
        .publish(0, MessageKind::Batch, movies(&["1"]).encode(&Default::default()))
        .await;
    pipeline.publish(1, MessageKind::Flush, Bytes::new()).await;
    assert_crashed(task, phase).await;
    pipeline.input_settled().await;

    let resumed = Worker::new(&config, pipeline.dyn_transport())
        .await
        .expect("worker")
        .with_roulette(Roulette::disabled());
    let (stop_tx, task) = spawn(resumed);
    pipeline.publish_movies(&BATCHES).await;

    let (headers, body) = pipeline.next().await;
    assert_eq!((headers.kind, headers.seq), (MessageKind::Batch, 0));
    assert_eq!(Batch::decode(&body).expect("batch"), movies(&["1"]));
    let (headers, _) = pipeline.next().await;
    assert_eq!((headers.kind, headers.seq), (MessageKind::Flush, 1));
    assert_relayed(&mut pipeline, &BATCHES).await;
    pipeline.input_settled().await;
    stop(stop_tx, task).await;
}

#[tokio::test]
async fn client_reuse_after_crash_on_received_flush() {
    crash_on_flush_then_reuse_client(Phase::Received).await;
}

#[tokio::test]
async fn client_reuse_after_crash_on_processed_flush() {
    crash_on_flush_then_reuse_client(Phase::Processed).await;
}

#[tokio::test]
async fn client_reuse_after_crash_on_persisted_flush() {
    crash_on_flush_then_reuse_client(Phase::Persisted).await;
}

fn two_upstreams(state_dir: &Path) -> WorkerConfig {
    let mut config = config(state_dir, StageKind::Relay);
    config.inputs[0].copies = 2;
    config
}

// Replica 0 finishes first, so its EOF is held back when the worker crashes
// on the EOF of replica 1.
async fn crash_on_completing_eof(phase: Phase) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut pipeline = Pipeline::new().await;
    let config = two_upstreams(dir.path());

    let crashing = Worker::new(&config, pipeline.dyn_transport())
        .await
        .expect("worker")
        .with_roulette(crash_at(2, phase));
    let (_stop_tx, task) = spawn(crashing);
    for (replica, id) in [(0, "1"), (1, "2")] {
        pipeline
            .publish_as(replica, 0, MessageKind::Batch, movies(&[id]).encode(&Default::default()))
            .await;
        pipeline.publish_as(replica, 1, MessageKind::Eof, Bytes::new()).await;
    }
    assert_crashed(task, phase).await;
    pipeline.input_settled().await;

    let resumed = Worker::new(&config, pipeline.dyn_transport())
        .await
        .expect("worker")
        .with_roulette(Roulette::disabled());
    let (stop_tx, task) = spawn(resumed);
    assert_eq!(
        pipeline.outputs(3).await,
        vec![
            (MessageKind::Batch, 0),
            (MessageKind::Batch, 1),
            (MessageKind::Eof, 2),
        ]
    );
    pipeline.assert_quiet().await;
    pipeline.input_settled().await;
    stop(stop_tx, task).await;
}

#[tokio::test]
async fn held_eof_survives_crash_on_received_eof() {
    crash_on_completing_eof(Phase::Received).await;
}

#[tokio::test]
async fn held_eof_survives_crash_on_processed_eof() {
    crash_on_completing_eof(Phase::Processed).await;
}

#[tokio::test]
async fn held_eof_survives_crash_on_persisted_eof() {
    crash_on_completing_eof(Phase::Persisted).await;
}

// Same with FLUSH, followed by a second session on the same client id.
async fn crash_on_completing_flush(phase: Phase) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut pipeline = Pipeline::new().await;
    let config = two_upstreams(dir.path());

    let crashing = Worker::new(&config, pipeline.dyn_transport())
        .await
        .expect("worker")
        .with_roulette(crash_at(3, phase));
    let (_stop_tx, task) = spawn(crashing);
    for (replica, id) in [(0, "1"), (1, "2")] {
        pipeline
            .publish_as(replica, 0, MessageKind::Batch, movies(&[id]).encode(&Default::default()))
            .await;
        pipeline.publish_as(replica, 1, MessageKind::Eof, Bytes::new()).await;
    }
    pipeline.publish_as(0, 2, MessageKind::Flush, Bytes::new()).await;
    pipeline.publish_as(1, 2, MessageKind::Flush, Bytes::new()).await;
    assert_crashed(task, phase).await;
    pipeline.input_settled().await;

    let resumed = Worker::new(&config, pipeline.dyn_transport())
        .await
        .expect("worker")
        .with_roulette(Roulette::disabled());
    let (stop_tx, task) = spawn(resumed);
    assert_eq!(
        pipeline.outputs(4).await,
        vec![
            (MessageKind::Batch, 0),
            (MessageKind::Batch, 1),
            (MessageKind::Eof, 2),
            (MessageKind::Flush, 3),
        ]
    );
    pipeline.assert_quiet().await;

    pipeline
        .publish_as(0, 0, MessageKind::Batch, movies(&["a"]).encode(&Default::default()))
        .await;
    pipeline.publish_as(0, 1, MessageKind::Eof, Bytes::new()).await;
    pipeline.publish_as(1, 0, MessageKind::Eof, Bytes::new()).await;
    let (headers, body) = pipeline.next().await;
    assert_eq!((headers.kind, headers.seq), (MessageKind::Batch, 0));
    assert_eq!(Batch::decode(&body).expect("batch"), movies(&["a"]));
    let (headers, _) = pipeline.next().await;
    assert_eq!((headers.kind, headers.seq), (MessageKind::Eof, 1));
    pipeline.assert_quiet().await;
    pipeline.input_settled().await;
    stop(stop_tx, task).await;
}

#[tokio::test]
async fn held_flush_survives_crash_on_received_flush() {
    crash_on_completing_flush(Phase::Received).await;
}

#[tokio::test]
async fn held_flush_survives_crash_on_processed_flush() {
    crash_on_completing_flush(Phase::Processed).await;
}

#[tokio::test]
async fn held_flush_survives_crash_on_persisted_flush() {
    crash_on_completing_flush(Phase::Persisted).await;
}

fn totals(body: &Bytes) -> Vec<(String, String)> {
    let mut totals: Vec<(String, String)> = Batch::decode(body)
        .expect("batch")
        .rows
        .into_iter()
        .map(|row| (row["movieId"].clone(), row["count"].clone()))
        .collect();
    totals.sort();
    totals
}

#[tokio::test]
async fn counts_survive_a_crash_after_processing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut pipeline = Pipeline::new().await;
    let config = config(dir.path(), StageKind::Count(vec!["movieId".to_string()]));
    let batches: [&[&str]; 3] = [&["1", "2"], &["1"], &["2", "1"]];

    let crashing = Worker::new(&config, pipeline.dyn_transport())
        .await
        .expect("worker")
        .with_roulette(crash_at(1, Phase::Processed));
    let (_stop_tx, task) = spawn(crashing);
    pipeline.publish_movies(&batches).await;
    assert_crashed(task, Phase::Processed).await;
    pipeline.input_settled().await;

    let resumed = Worker::new(&config, pipeline.dyn_transport())
        .await
        .expect("worker")
        .with_roulette(Roulette::disabled());
    let (stop_tx, task) = spawn(resumed);

    let (headers, body) = pipeline.next().await;
    assert_eq!(headers.kind, MessageKind::Batch);
    assert_eq!(
        totals(&body),
        vec![
            ("1".to_string(), "3".to_string()),
            ("2".to_string(), "2".to_string()),
        ]
    );
    let (headers, _) = pipeline.next().await;
    assert_eq!(headers.kind, MessageKind::Eof);
    pipeline.assert_quiet().await;
    stop(stop_tx, task).await;
}

#[tokio::test]
async fn shutdown_without_traffic() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pipeline = Pipeline::new().await;
    let worker = Worker::new(&config(dir.path(), StageKind::Relay), pipeline.dyn_transport())
        .await
        .expect("worker");
    let exit = worker.run(async {}).await.expect("run");
    assert_eq!(exit, Exit::Shutdown);
}

#[tokio::test]
async fn count_stage_needs_a_single_input() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pipeline = Pipeline::new().await;
    let mut config = config(dir.path(), StageKind::Count(vec!["movieId".to_string()]));
    config.inputs.push(InputConfig {
        exchange: "ratings".to_string(),
        queue: "ratings".to_string(),
        copies: 1,
    });
    let err = Worker::new(&config, pipeline.dyn_transport())
        .await
        .err()
        .expect("two inputs rejected");
    assert!(err.to_string().contains("exactly one input"), "{err:#}");
}
