// The worker's view of the broker: one receiver per input queue, one sender
// per output queue, and the per-client state file that lets both resume
// after a crash.
//
// State layout: <state_dir>/mailer/<client_id>/state, holding every receiver
// line followed by every sender line (see `conveyor_wire::state`). After a
// FLUSH only the receivers' `flushed` lines are kept.
use crate::config::WorkerConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use conveyor_common::{
    ALL_CLIENTS, ClientId, HEADER_CLIENT_ID, HEADER_KIND, HEADER_REPLICA_ID, HeaderTable,
    HeaderValue, MessageKind, ReplicaId,
};
use conveyor_middleware::topology;
use conveyor_middleware::{
    Checkpoint, Delivery, InFlight, Receiver, ReceiverState, Sender, Transport, build_sender,
};
use conveyor_storage::{atomic_write, remove_dir_all_if_exists};
use conveyor_wire::batch::{Batch, Columns};
use conveyor_wire::state::StateLine;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

const MAILER_DIR: &str = "mailer";
const STATE_FILE: &str = "state";

pub struct Mailer {
    id: ReplicaId,
    transport: Arc<dyn Transport>,
    select: Columns,
    receivers: Vec<Receiver>,
    state: Arc<MailerState>,
}

// Everything a dump reads. Shared with the receivers as their checkpoint hook.
struct MailerState {
    dir: PathBuf,
    receivers: Vec<ReceiverState>,
    senders: Mutex<Vec<Box<dyn Sender>>>,
}

impl Mailer {
    /// Declares the topology, builds receivers and senders and restores
    /// whatever state a previous run left in `config.state_dir`.
    pub async fn init(config: &WorkerConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let in_flight = InFlight::new();
        let mut receivers = Vec::with_capacity(config.inputs.len());
        for input in &config.inputs {
            let queue =
                topology::declare_input(transport.as_ref(), &input.exchange, &input.queue, config.id)
                    .await
                    .with_context(|| format!("declare input {}", input.queue))?;
            receivers.push(Receiver::new(queue, input.copies, in_flight.clone()));
        }

        let mut senders = Vec::with_capacity(config.outputs.len());
        for output in &config.outputs {
            topology::declare_output(
                transport.as_ref(),
                &config.output_exchange,
                &output.queue,
                output.copies,
            )
            .await
            .with_context(|| format!("declare output {}", output.queue))?;
            senders.push(build_sender(
                Arc::clone(&transport),
                &config.output_exchange,
                &output.queue,
                output.copies,
                &output.delivery,
            ));
        }

        let state = MailerState {
            dir: config.state_dir.join(MAILER_DIR),
            receivers: receivers.iter().map(Receiver::state).collect(),
            senders: Mutex::new(senders),
        };
        state.recover().await;
        Ok(Self {
            id: config.id,
            transport,
            select: config.select.clone(),
            receivers,
            state: Arc::new(state),
        })
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// Starts every receiver; channel `i` carries input `i`.
    pub async fn consume(&mut self) -> Result<Vec<mpsc::Receiver<Delivery>>> {
        let checkpoint: Arc<dyn Checkpoint> = self.state.clone();
        let consumer_tag = format!("worker-{}", self.id);
        let mut channels = Vec::with_capacity(self.receivers.len());
        for receiver in &mut self.receivers {
            let channel = receiver
                .consume(self.transport.as_ref(), &consumer_tag, Arc::clone(&checkpoint))
                .await
                .with_context(|| format!("consume {}", receiver.queue()))?;
            channels.push(channel);
        }
        Ok(channels)
    }

    /// Stops the receivers; their unacknowledged deliveries go back to the broker.
    pub fn stop(&mut self) {
        for receiver in &mut self.receivers {
            receiver.stop();
        }
    }

    pub async fn publish_batch(
        &self,
        batch: &Batch,
        client_id: ClientId,
        extra: &HeaderTable,
    ) -> Result<()> {
        let headers = self.headers(MessageKind::Batch, client_id, extra);
        for sender in self.state.senders.lock().await.iter_mut() {
            sender
                .batch(batch, &self.select, &headers)
                .await
                .with_context(|| format!("publish batch for client {client_id}"))?;
        }
        Ok(())
    }

    pub async fn publish_eof(&self, client_id: ClientId, extra: &HeaderTable) -> Result<()> {
        let headers = self.headers(MessageKind::Eof, client_id, extra);
        for sender in self.state.senders.lock().await.iter_mut() {
            sender
                .eof(&headers)
                .await
                .with_context(|| format!("publish eof for client {client_id}"))?;
        }
        Ok(())
    }

    pub async fn publish_flush(&self, client_id: ClientId, extra: &HeaderTable) -> Result<()> {
        let headers = self.headers(MessageKind::Flush, client_id, extra);
        for sender in self.state.senders.lock().await.iter_mut() {
            sender
                .flush(&headers)
                .await
                .with_context(|| format!("publish flush for client {client_id}"))?;
        }
        Ok(())
    }

    pub async fn publish_purge(&self, extra: &HeaderTable) -> Result<()> {
        let headers = self.headers(MessageKind::Purge, ALL_CLIENTS, extra);
        for sender in self.state.senders.lock().await.iter_mut() {
            sender.purge(&headers).await.context("publish purge")?;
        }
        Ok(())
    }

    // Extra headers win over the base ones.
    fn headers(&self, kind: MessageKind, client_id: ClientId, extra: &HeaderTable) -> HeaderTable {
        let mut headers = HeaderTable::new();
        headers.insert(HEADER_KIND.to_string(), HeaderValue::Int(kind.as_i32()));
        headers.insert(
            HEADER_REPLICA_ID.to_string(),
            HeaderValue::Int(self.id as i32),
        );
        headers.insert(HEADER_CLIENT_ID.to_string(), HeaderValue::Int(client_id));
        headers.extend(extra.iter().map(|(key, value)| (key.clone(), value.clone())));
        headers
    }

    /// Atomically writes the receiver and sender state of `client_id`.
    pub async fn dump(&self, client_id: ClientId) -> Result<()> {
        self.state
            .dump(client_id)
            .await
            .with_context(|| format!("dump mailer state for client {client_id}"))
    }

    /// Drops the state of `client_id`, keeping what is needed to recognize a
    /// replay of the FLUSH that ended its session.
    pub fn flush(&self, client_id: ClientId) -> Result<()> {
        self.state
            .flush(client_id)
            .with_context(|| format!("remove mailer state for client {client_id}"))
    }

    pub fn purge(&self) -> Result<()> {
        remove_dir_all_if_exists(&self.state.dir).context("remove mailer state")
    }

    pub fn state_dir(&self) -> &Path {
        &self.state.dir
    }
}

impl MailerState {
    fn client_dir(&self, client_id: ClientId) -> PathBuf {
        self.dir.join(client_id.to_string())
    }

    async fn dump(&self, client_id: ClientId) -> conveyor_storage::Result<()> {
        if client_id < 0 {
            return Ok(());
        }
        let mut content = String::new();
        for receiver in &self.receivers {
            content.push_str(&receiver.encode(client_id).to_string());
            content.push('\n');
            push_lines(&mut content, receiver.flushed_lines(client_id));
        }
        for sender in self.senders.lock().await.iter() {
            content.push_str(&sender.encode(client_id).to_string());
            content.push('\n');
        }
        atomic_write(&self.client_dir(client_id), STATE_FILE, content.as_bytes())?;
        tracing::trace!(client = client_id, "mailer state dumped");
        Ok(())
    }

    fn flush(&self, client_id: ClientId) -> conveyor_storage::Result<()> {
        let mut content = String::new();
        for receiver in &self.receivers {
            push_lines(&mut content, receiver.flushed_lines(client_id));
        }
        let dir = self.client_dir(client_id);
        if content.is_empty() {
            return remove_dir_all_if_exists(&dir);
        }
        atomic_write(&dir, STATE_FILE, content.as_bytes())?;
        tracing::trace!(client = client_id, "mailer state flushed");
        Ok(())
    }

    async fn recover(&self) {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return,
            Err(err) => {
                tracing::warn!(dir = %self.dir.display(), error = %err, "failed to list mailer state");
                return;
            }
        };
        let mut senders = self.senders.lock().await;
        let mut recovered = 0usize;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(client_id) = name.to_str().and_then(|name| name.parse::<ClientId>().ok()) else {
                tracing::warn!(entry = ?name, "skipping unexpected entry in mailer state");
                continue;
            };
            let path = entry.path().join(STATE_FILE);
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(err) => {
                    tracing::warn!(client = client_id, error = %err, "failed to read mailer state");
                    continue;
                }
            };
            let mut next_sender = 0;
            for line in content.lines().map(str::trim).filter(|line| !line.is_empty()) {
                let parsed = match line.parse::<StateLine>() {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        tracing::warn!(client = client_id, line, error = %err, "undecodable state line");
                        continue;
                    }
                };
                let restored = match &parsed {
                    StateLine::Recv { queue, .. } | StateLine::Flushed { queue, .. } => {
                        match self.receivers.iter().find(|receiver| receiver.queue() == queue) {
                            Some(receiver) => receiver.restore(client_id, &parsed),
                            None => {
                                tracing::warn!(client = client_id, queue = %queue, "state for unknown queue");
                                continue;
                            }
                        }
                    }
                    StateLine::Robin { .. } | StateLine::Shard { .. } => {
                        let Some(sender) = senders.get_mut(next_sender) else {
                            tracing::warn!(client = client_id, line, "state for unknown sender");
                            continue;
                        };
                        next_sender += 1;
                        sender.restore(client_id, &parsed)
                    }
                };
                if let Err(err) = restored {
                    tracing::warn!(client = client_id, line, error = %err, "failed to restore state line");
                }
            }
            recovered += 1;
        }
        tracing::info!(clients = recovered, "mailer recovered");
    }
}

fn push_lines(content: &mut String, lines: Vec<StateLine>) {
    for line in lines {
        content.push_str(&line.to_string());
        content.push('\n');
    }
}

#[async_trait]
impl Checkpoint for MailerState {
    async fn checkpoint(&self, client_id: ClientId) -> conveyor_middleware::Result<()> {
        self.dump(client_id)
            .await
            .map_err(|err| conveyor_middleware::Error::Checkpoint(err.to_string()))
    }
}
