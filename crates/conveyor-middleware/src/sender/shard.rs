use super::{Outbox, Sender, client_of};
use crate::transport::Transport;
use crate::{Error, Result};
use async_trait::async_trait;
use conveyor_common::{ClientId, HeaderTable};
use conveyor_wire::batch::{Batch, Columns, Row};
use conveyor_wire::state::StateLine;
use std::sync::Arc;

/// Separator between the values of a composite shard key.
pub const KEY_SEPARATOR: &str = "<|>";

/// DJB2 string hash over the characters of `key`.
///
/// ```
/// assert_eq!(conveyor_middleware::sender::djb2(""), 5381);
/// assert_eq!(conveyor_middleware::sender::djb2("a"), 177_670);
/// ```
pub fn djb2(key: &str) -> u64 {
    key.chars().fold(5381u64, |hash, c| {
        hash.wrapping_mul(33).wrapping_add(u64::from(c))
    })
}

/// Routes every row to the destination owning its key, so rows sharing a key
/// always meet at the same downstream replica.
pub struct ShardSender {
    out: Outbox,
    keys: Vec<String>,
}

impl ShardSender {
    pub fn new(
        transport: Arc<dyn Transport>,
        exchange: &str,
        queue_base: &str,
        copies: usize,
        keys: Vec<String>,
    ) -> Self {
        Self {
            out: Outbox::new(transport, exchange, queue_base, copies),
            keys,
        }
    }

    /// Destination of `row`, or an error when a key field is missing.
    pub fn destination(&self, row: &Row) -> Result<usize> {
        let values = self
            .keys
            .iter()
            .map(|key| {
                row.get(key)
                    .map(String::as_str)
                    .ok_or_else(|| Error::MissingShardKey(key.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        let copies = self.out.copies() as u64;
        Ok((djb2(&values.join(KEY_SEPARATOR)) % copies) as usize)
    }
}

#[async_trait]
impl Sender for ShardSender {
    async fn batch(&mut self, batch: &Batch, select: &Columns, headers: &HeaderTable) -> Result<()> {
        let client_id = client_of(headers)?;
        let mut shards = vec![Vec::new(); self.out.copies()];
        for row in &batch.rows {
            shards[self.destination(row)?].push(row.clone());
        }
        for (dest, rows) in shards.into_iter().enumerate() {
            if rows.is_empty() {
                continue;
            }
            let body = Batch::new(rows).encode(select);
            self.out.send(dest, client_id, headers, body).await?;
        }
        Ok(())
    }

    async fn eof(&mut self, headers: &HeaderTable) -> Result<()> {
        self.out.broadcast(headers).await
    }

    async fn flush(&mut self, headers: &HeaderTable) -> Result<()> {
        self.out.broadcast(headers).await?;
        self.out.forget_client(client_of(headers)?);
        Ok(())
    }

    async fn purge(&mut self, headers: &HeaderTable) -> Result<()> {
        self.out.broadcast(headers).await?;
        self.out.forget_all();
        tracing::debug!(queue = self.out.base(), "shard sender counters reset");
        Ok(())
    }

    fn encode(&self, client_id: ClientId) -> StateLine {
        StateLine::Shard {
            seqs: self.out.seqs_of(client_id),
        }
    }

    fn restore(&mut self, client_id: ClientId, line: &StateLine) -> Result<()> {
        let StateLine::Shard { seqs } = line else {
            return Err(self.out.mismatch(line));
        };
        self.out.set_seqs(client_id, seqs)
    }
}
