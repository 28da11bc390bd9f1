// Sequenced fan-out to the replicas of the next stage.
use crate::transport::Transport;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use conveyor_common::{ClientId, HEADER_CLIENT_ID, HEADER_SEQ, HeaderTable, HeaderValue, Seq};
use conveyor_wire::batch::{Batch, Columns};
use conveyor_wire::state::StateLine;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

mod robin;
mod shard;

pub use robin::RobinSender;
pub use shard::{ShardSender, djb2};

/// Publishes one stream of messages to `copies` destination queues, stamping
/// each message with the next seq of its (destination, client) pair.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn batch(&mut self, batch: &Batch, select: &Columns, headers: &HeaderTable) -> Result<()>;
    async fn eof(&mut self, headers: &HeaderTable) -> Result<()>;
    async fn flush(&mut self, headers: &HeaderTable) -> Result<()>;
    async fn purge(&mut self, headers: &HeaderTable) -> Result<()>;
    fn encode(&self, client_id: ClientId) -> StateLine;
    fn restore(&mut self, client_id: ClientId, line: &StateLine) -> Result<()>;
}

/// How a sender spreads batches over its destinations.
///
/// ```
/// use conveyor_middleware::DeliveryType;
///
/// assert_eq!("robin".parse::<DeliveryType>().expect("robin"), DeliveryType::Robin);
/// assert_eq!(
///     "shard:title+year".parse::<DeliveryType>().expect("shard"),
///     DeliveryType::Shard(vec!["title".to_string(), "year".to_string()])
/// );
/// assert!("shard:".parse::<DeliveryType>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryType {
    Robin,
    Shard(Vec<String>),
}

impl FromStr for DeliveryType {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        if value == "robin" {
            return Ok(DeliveryType::Robin);
        }
        let keys = value
            .strip_prefix("shard:")
            .ok_or_else(|| Error::InvalidDeliveryType(value.to_string()))?;
        let keys: Vec<String> = keys.split('+').map(|key| key.trim().to_string()).collect();
        if keys.iter().any(String::is_empty) {
            return Err(Error::InvalidDeliveryType(value.to_string()));
        }
        Ok(DeliveryType::Shard(keys))
    }
}

impl fmt::Display for DeliveryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryType::Robin => f.write_str("robin"),
            DeliveryType::Shard(keys) => write!(f, "shard:{}", keys.join("+")),
        }
    }
}

/// Builds the sender for `queue_base`, publishing to `<queue_base>-<i>` through `exchange`.
pub fn build_sender(
    transport: Arc<dyn Transport>,
    exchange: &str,
    queue_base: &str,
    copies: usize,
    delivery: &DeliveryType,
) -> Box<dyn Sender> {
    match delivery {
        DeliveryType::Robin => Box::new(RobinSender::new(transport, exchange, queue_base, copies)),
        DeliveryType::Shard(keys) => Box::new(ShardSender::new(
            transport,
            exchange,
            queue_base,
            copies,
            keys.clone(),
        )),
    }
}

/// Destinations and per-destination seq counters shared by both strategies.
pub(crate) struct Outbox {
    transport: Arc<dyn Transport>,
    exchange: String,
    base: String,
    routes: Vec<String>,
    // seqs[destination][client]; absent means 0.
    seqs: Vec<HashMap<ClientId, Seq>>,
}

impl Outbox {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        exchange: &str,
        queue_base: &str,
        copies: usize,
    ) -> Self {
        Self {
            transport,
            exchange: exchange.to_string(),
            base: queue_base.to_string(),
            routes: crate::topology::queue_names(queue_base, copies),
            seqs: vec![HashMap::new(); copies],
        }
    }

    pub(crate) fn copies(&self) -> usize {
        self.routes.len()
    }

    pub(crate) fn base(&self) -> &str {
        &self.base
    }

    pub(crate) fn seqs_of(&self, client_id: ClientId) -> Vec<Seq> {
        self.seqs
            .iter()
            .map(|table| table.get(&client_id).copied().unwrap_or(0))
            .collect()
    }

    pub(crate) fn set_seqs(&mut self, client_id: ClientId, seqs: &[Seq]) -> Result<()> {
        if seqs.len() != self.copies() {
            return Err(Error::State {
                target: format!("sender {}", self.base),
                reason: format!(
                    "expected {} sequence numbers, got {} for client {client_id}",
                    self.copies(),
                    seqs.len()
                ),
            });
        }
        for (table, seq) in self.seqs.iter_mut().zip(seqs) {
            table.insert(client_id, *seq);
        }
        Ok(())
    }

    pub(crate) fn mismatch(&self, line: &StateLine) -> Error {
        Error::State {
            target: format!("sender {}", self.base),
            reason: format!("unexpected {} line", line.tag()),
        }
    }

    /// Publishes to destination `dest` with the next seq of `client_id`.
    pub(crate) async fn send(
        &mut self,
        dest: usize,
        client_id: ClientId,
        headers: &HeaderTable,
        body: Bytes,
    ) -> Result<()> {
        let seq = self.seqs[dest].get(&client_id).copied().unwrap_or(0);
        let mut headers = headers.clone();
        headers.insert(HEADER_SEQ.to_string(), HeaderValue::Int(seq));
        self.transport
            .publish(&self.exchange, &self.routes[dest], headers, body)
            .await?;
        self.seqs[dest].insert(client_id, seq + 1);
        metrics::counter!("conveyor_sender_published_total", "queue" => self.routes[dest].clone())
            .increment(1);
        Ok(())
    }

    pub(crate) async fn broadcast(&mut self, headers: &HeaderTable) -> Result<()> {
        let client_id = client_of(headers)?;
        for dest in 0..self.copies() {
            self.send(dest, client_id, headers, Bytes::new()).await?;
        }
        Ok(())
    }

    pub(crate) fn forget_client(&mut self, client_id: ClientId) {
        for table in &mut self.seqs {
            table.remove(&client_id);
        }
    }

    pub(crate) fn forget_all(&mut self) {
        for table in &mut self.seqs {
            table.clear();
        }
    }
}

pub(crate) fn client_of(headers: &HeaderTable) -> Result<ClientId> {
    let value = headers
        .get(HEADER_CLIENT_ID)
        .ok_or(conveyor_common::Error::MissingHeader(HEADER_CLIENT_ID))?;
    value.as_int().ok_or_else(|| {
        Error::Header(conveyor_common::Error::InvalidHeader {
            key: HEADER_CLIENT_ID,
            value: value.to_string(),
        })
    })
}
