// Ordered, deduplicating consumer of one input queue.
//
// Two tasks run per receiver. The ordering task buffers raw deliveries per
// (replica, client), drops anything already seen and emits the next expected
// seq once the shared in-flight slot is free. The barrier task counts EOF and
// FLUSH markers and forwards a single one after every upstream copy sent it.
//
// A FLUSH removes the client's expecting entry, so a replay of that FLUSH
// would look like the start of a new session. The seq of the last FLUSH per
// (replica, client) is kept until that replica sends the client anything
// else, and a FLUSH matching it is dropped as a duplicate.
use crate::delivery::{Delivery, InFlight};
use crate::transport::{RawConsumer, RawDelivery, Transport};
use crate::{Error, Result};
use async_trait::async_trait;
use conveyor_common::{ClientId, Headers, MessageKind, ReplicaId, Seq};
use conveyor_wire::state::StateLine;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const CHANNEL_CAPACITY: usize = 16;

/// Persists the worker state for a client. Called before a suppressed
/// terminal marker is acknowledged so its count survives a crash.
#[async_trait]
pub trait Checkpoint: Send + Sync {
    async fn checkpoint(&self, client_id: ClientId) -> Result<()>;
}

#[derive(Debug)]
struct Tables {
    // expecting[replica][client]; absent means 0.
    expecting: Vec<HashMap<ClientId, Seq>>,
    flushed: HashMap<(ReplicaId, ClientId), Seq>,
    eofs: HashMap<ClientId, u32>,
    flushes: HashMap<ClientId, u32>,
}

impl Tables {
    fn new(copies: usize) -> Self {
        Self {
            expecting: vec![HashMap::new(); copies],
            flushed: HashMap::new(),
            eofs: HashMap::new(),
            flushes: HashMap::new(),
        }
    }

    fn expecting(&self, replica_id: ReplicaId, client_id: ClientId) -> Seq {
        self.expecting[replica_id]
            .get(&client_id)
            .copied()
            .unwrap_or(0)
    }

    fn replayed_flush(&self, headers: &Headers) -> bool {
        headers.kind == MessageKind::Flush
            && self.flushed.get(&(headers.replica_id, headers.client_id)) == Some(&headers.seq)
    }

    fn advance(&mut self, headers: &Headers) {
        let key = (headers.replica_id, headers.client_id);
        match headers.kind {
            MessageKind::Batch | MessageKind::Eof => {
                self.expecting[headers.replica_id].insert(headers.client_id, headers.seq + 1);
                self.flushed.remove(&key);
            }
            MessageKind::Flush => {
                self.expecting[headers.replica_id].remove(&headers.client_id);
                self.flushed.insert(key, headers.seq);
            }
            MessageKind::Purge => {
                for table in &mut self.expecting {
                    table.clear();
                }
                self.flushed.clear();
                self.eofs.clear();
                self.flushes.clear();
            }
        }
    }

    fn counter(&mut self, kind: MessageKind) -> Option<&mut HashMap<ClientId, u32>> {
        match kind {
            MessageKind::Eof => Some(&mut self.eofs),
            MessageKind::Flush => Some(&mut self.flushes),
            MessageKind::Batch | MessageKind::Purge => None,
        }
    }
}

/// Shared handle on a receiver's tables, used to encode and restore them.
#[derive(Clone, Debug)]
pub struct ReceiverState {
    queue: String,
    copies: usize,
    tables: Arc<Mutex<Tables>>,
}

impl ReceiverState {
    fn new(queue: String, copies: usize) -> Self {
        Self {
            queue,
            copies,
            tables: Arc::new(Mutex::new(Tables::new(copies))),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn copies(&self) -> usize {
        self.copies
    }

    pub fn expecting(&self, replica_id: ReplicaId, client_id: ClientId) -> Seq {
        self.tables.lock().expecting(replica_id, client_id)
    }

    pub fn encode(&self, client_id: ClientId) -> StateLine {
        let tables = self.tables.lock();
        StateLine::Recv {
            queue: self.queue.clone(),
            eofs: tables.eofs.get(&client_id).copied().unwrap_or(0),
            flushes: tables.flushes.get(&client_id).copied().unwrap_or(0),
            expecting: (0..self.copies)
                .map(|replica| tables.expecting(replica, client_id))
                .collect(),
        }
    }

    /// One `flushed` line per replica whose last message for `client_id` was a FLUSH.
    pub fn flushed_lines(&self, client_id: ClientId) -> Vec<StateLine> {
        let tables = self.tables.lock();
        (0..self.copies)
            .filter_map(|replica| {
                tables
                    .flushed
                    .get(&(replica, client_id))
                    .map(|seq| StateLine::Flushed {
                        queue: self.queue.clone(),
                        replica,
                        seq: *seq,
                    })
            })
            .collect()
    }

    /// Restores a `recv` or `flushed` line of `client_id`.
    pub fn restore(&self, client_id: ClientId, line: &StateLine) -> Result<()> {
        match line {
            StateLine::Recv {
                queue,
                eofs,
                flushes,
                expecting,
            } => self.restore_recv(client_id, queue, *eofs, *flushes, expecting),
            StateLine::Flushed {
                queue,
                replica,
                seq,
            } => {
                self.check_queue(queue)?;
                if *replica >= self.copies {
                    return Err(self.mismatch(format!(
                        "replica {replica} out of range for {} copies",
                        self.copies
                    )));
                }
                self.tables.lock().flushed.insert((*replica, client_id), *seq);
                Ok(())
            }
            other => Err(self.mismatch(format!("expected a recv line, got {}", other.tag()))),
        }
    }

    fn check_queue(&self, queue: &str) -> Result<()> {
        if queue != self.queue {
            return Err(self.mismatch(format!("line belongs to queue {queue}")));
        }
        Ok(())
    }

    fn restore_recv(
        &self,
        client_id: ClientId,
        queue: &str,
        eofs: u32,
        flushes: u32,
        expecting: &[Seq],
    ) -> Result<()> {
        self.check_queue(queue)?;
        if expecting.len() != self.copies {
            return Err(self.mismatch(format!(
                "expected {} sequence numbers, got {} for client {client_id}",
                self.copies,
                expecting.len()
            )));
        }
        let mut tables = self.tables.lock();
        for (replica, seq) in expecting.iter().enumerate() {
            tables.expecting[replica].insert(client_id, *seq);
        }
        set_count(&mut tables.eofs, client_id, eofs);
        set_count(&mut tables.flushes, client_id, flushes);
        Ok(())
    }

    fn mismatch(&self, reason: String) -> Error {
        Error::State {
            target: format!("receiver {}", self.queue),
            reason,
        }
    }

    fn replayed_flush(&self, headers: &Headers) -> bool {
        self.tables.lock().replayed_flush(headers)
    }

    fn advance(&self, headers: &Headers) {
        self.tables.lock().advance(headers);
    }

    // Bumps the marker count and returns it; 0 for kinds that are not counted.
    fn count_marker(&self, kind: MessageKind, client_id: ClientId) -> u32 {
        let mut tables = self.tables.lock();
        match tables.counter(kind) {
            Some(counter) => {
                let count = counter.entry(client_id).or_insert(0);
                *count += 1;
                *count
            }
            None => 0,
        }
    }

    fn clear_marker(&self, kind: MessageKind, client_id: ClientId) {
        let mut tables = self.tables.lock();
        if kind == MessageKind::Flush {
            tables.eofs.remove(&client_id);
        }
        if let Some(counter) = tables.counter(kind) {
            counter.remove(&client_id);
        }
    }
}

fn set_count(counter: &mut HashMap<ClientId, u32>, client_id: ClientId, count: u32) {
    if count == 0 {
        counter.remove(&client_id);
    } else {
        counter.insert(client_id, count);
    }
}

/// Consumes one queue fed by `copies` upstream replicas.
#[derive(Debug)]
pub struct Receiver {
    state: ReceiverState,
    in_flight: InFlight,
    tasks: Vec<JoinHandle<()>>,
}

impl Receiver {
    pub fn new(queue: impl Into<String>, copies: usize, in_flight: InFlight) -> Self {
        Self {
            state: ReceiverState::new(queue.into(), copies),
            in_flight,
            tasks: Vec::new(),
        }
    }

    pub fn queue(&self) -> &str {
        self.state.queue()
    }

    pub fn state(&self) -> ReceiverState {
        self.state.clone()
    }

    pub fn encode(&self, client_id: ClientId) -> StateLine {
        self.state.encode(client_id)
    }

    pub fn restore(&self, client_id: ClientId, line: &StateLine) -> Result<()> {
        self.state.restore(client_id, line)
    }

    /// Starts consuming. The returned channel closes when the queue goes away
    /// or the receiver is stopped.
    pub async fn consume(
        &mut self,
        transport: &dyn Transport,
        consumer_tag: &str,
        checkpoint: Arc<dyn Checkpoint>,
    ) -> Result<mpsc::Receiver<Delivery>> {
        let consumer = transport.consume(self.state.queue(), consumer_tag).await?;
        let (ordered_tx, ordered_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let ordering = Ordering {
            state: self.state.clone(),
            in_flight: self.in_flight.clone(),
            pending: HashMap::new(),
        };
        self.tasks
            .push(tokio::spawn(ordering.run(consumer, ordered_tx)));
        self.tasks.push(tokio::spawn(count_markers(
            self.state.clone(),
            checkpoint,
            ordered_rx,
            out_tx,
        )));
        tracing::debug!(queue = %self.state.queue(), consumer_tag, "receiver consuming");
        Ok(out_rx)
    }

    /// Aborts the receiver tasks, releasing the broker consumer.
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Ordering {
    state: ReceiverState,
    in_flight: InFlight,
    pending: HashMap<(ReplicaId, ClientId), BTreeMap<Seq, (Headers, RawDelivery)>>,
}

impl Ordering {
    async fn run(mut self, mut consumer: Box<dyn RawConsumer>, tx: mpsc::Sender<Delivery>) {
        while let Some(raw) = consumer.next().await {
            let Some(headers) = self.decode(&raw) else {
                metrics::counter!("conveyor_receiver_malformed_total", "queue" => self.state.queue.clone())
                    .increment(1);
                self.discard(raw).await;
                continue;
            };
            let key = (headers.replica_id, headers.client_id);
            let expecting = self.state.expecting(headers.replica_id, headers.client_id);
            let buffered = self
                .pending
                .get(&key)
                .is_some_and(|buffer| buffer.contains_key(&headers.seq));
            if headers.seq < expecting || buffered || self.state.replayed_flush(&headers) {
                tracing::debug!(
                    queue = %self.state.queue,
                    id = %headers.id(),
                    expecting,
                    "duplicate delivery dropped"
                );
                metrics::counter!("conveyor_receiver_duplicates_total", "queue" => self.state.queue.clone())
                    .increment(1);
                self.discard(raw).await;
                continue;
            }
            self.pending
                .entry(key)
                .or_default()
                .insert(headers.seq, (headers, raw));
            if let Err(err) = self.drain(key, &tx).await {
                tracing::debug!(queue = %self.state.queue, error = %err, "receiver ordering stopped");
                return;
            }
        }
        tracing::debug!(queue = %self.state.queue, "upstream closed");
    }

    fn decode(&self, raw: &RawDelivery) -> Option<Headers> {
        match Headers::from_table(&raw.headers) {
            Ok(headers) if headers.replica_id < self.state.copies => Some(headers),
            Ok(headers) => {
                tracing::warn!(
                    queue = %self.state.queue,
                    replica = headers.replica_id,
                    copies = self.state.copies,
                    "replica id out of range"
                );
                None
            }
            Err(err) => {
                tracing::warn!(queue = %self.state.queue, error = %err, "malformed headers");
                None
            }
        }
    }

    async fn discard(&self, raw: RawDelivery) {
        if let Err(err) = raw.acker.ack().await {
            tracing::warn!(queue = %self.state.queue, error = %err, "failed to ack dropped delivery");
        }
    }

    async fn discard_stale(&self, stale: impl IntoIterator<Item = (Headers, RawDelivery)>) {
        for (headers, raw) in stale {
            tracing::debug!(queue = %self.state.queue, id = %headers.id(), "stale delivery dropped");
            self.discard(raw).await;
        }
    }

    // Emits buffered deliveries while the lowest one is the next expected seq.
    async fn drain(
        &mut self,
        key: (ReplicaId, ClientId),
        tx: &mpsc::Sender<Delivery>,
    ) -> Result<()> {
        loop {
            let expecting = self.state.expecting(key.0, key.1);
            let Some(buffer) = self.pending.get_mut(&key) else {
                return Ok(());
            };
            let Some(entry) = buffer.first_entry() else {
                return Ok(());
            };
            if *entry.key() != expecting {
                return Ok(());
            }
            let (headers, raw) = entry.remove();
            if buffer.is_empty() {
                self.pending.remove(&key);
            }

            let permit = self.in_flight.acquire().await?;
            self.state.advance(&headers);
            let delivery = Delivery::new(headers, raw.body, raw.redelivered, raw.acker, permit);
            metrics::counter!("conveyor_receiver_emitted_total", "queue" => self.state.queue.clone())
                .increment(1);
            if let Err(mpsc::error::SendError(delivery)) = tx.send(delivery).await {
                delivery.abandon();
                return Err(Error::Transport("receiver output closed".to_string()));
            }
            // FLUSH and PURGE reset the table, so anything still buffered
            // behind them belongs to the ended session.
            match headers.kind {
                MessageKind::Flush => {
                    if let Some(stale) = self.pending.remove(&key) {
                        self.discard_stale(stale.into_values()).await;
                    }
                    return Ok(());
                }
                MessageKind::Purge => {
                    let stale: Vec<_> = self
                        .pending
                        .drain()
                        .flat_map(|(_, buffer)| buffer.into_values())
                        .collect();
                    self.discard_stale(stale).await;
                    return Ok(());
                }
                MessageKind::Batch | MessageKind::Eof => {}
            }
        }
    }
}

async fn count_markers(
    state: ReceiverState,
    checkpoint: Arc<dyn Checkpoint>,
    mut ordered: mpsc::Receiver<Delivery>,
    tx: mpsc::Sender<Delivery>,
) {
    let copies = u32::try_from(state.copies).unwrap_or(u32::MAX);
    while let Some(delivery) = ordered.recv().await {
        let Headers {
            kind, client_id, ..
        } = delivery.headers;
        if kind.is_terminal() {
            let seen = state.count_marker(kind, client_id);
            if seen < copies {
                tracing::debug!(queue = %state.queue, client = client_id, %kind, seen, copies, "marker held back");
                if let Err(err) = checkpoint.checkpoint(client_id).await {
                    tracing::error!(queue = %state.queue, client = client_id, error = %err, "checkpoint failed");
                    delivery.abandon();
                    return;
                }
                if let Err(err) = delivery.ack().await {
                    tracing::error!(queue = %state.queue, client = client_id, error = %err, "failed to ack held marker");
                    return;
                }
                continue;
            }
            state.clear_marker(kind, client_id);
        }
        if let Err(mpsc::error::SendError(delivery)) = tx.send(delivery).await {
            delivery.abandon();
            return;
        }
    }
}
