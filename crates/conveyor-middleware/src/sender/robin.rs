use super::{Outbox, Sender, client_of};
use crate::transport::Transport;
use crate::Result;
use async_trait::async_trait;
use conveyor_common::{ClientId, HeaderTable};
use conveyor_wire::batch::{Batch, Columns};
use conveyor_wire::state::StateLine;
use std::collections::HashMap;
use std::sync::Arc;

/// Sends each batch of a client to the next destination in turn.
pub struct RobinSender {
    out: Outbox,
    // Next destination per client; absent means 0.
    cur: HashMap<ClientId, usize>,
}

impl RobinSender {
    pub fn new(
        transport: Arc<dyn Transport>,
        exchange: &str,
        queue_base: &str,
        copies: usize,
    ) -> Self {
        Self {
            out: Outbox::new(transport, exchange, queue_base, copies),
            cur: HashMap::new(),
        }
    }
}

#[async_trait]
impl Sender for RobinSender {
    async fn batch(&mut self, batch: &Batch, select: &Columns, headers: &HeaderTable) -> Result<()> {
        let client_id = client_of(headers)?;
        let dest = self.cur.get(&client_id).copied().unwrap_or(0);
        self.out
            .send(dest, client_id, headers, batch.encode(select))
            .await?;
        self.cur.insert(client_id, (dest + 1) % self.out.copies());
        Ok(())
    }

    async fn eof(&mut self, headers: &HeaderTable) -> Result<()> {
        self.out.broadcast(headers).await
    }

    async fn flush(&mut self, headers: &HeaderTable) -> Result<()> {
        self.out.broadcast(headers).await?;
        let client_id = client_of(headers)?;
        self.cur.remove(&client_id);
        self.out.forget_client(client_id);
        Ok(())
    }

    async fn purge(&mut self, headers: &HeaderTable) -> Result<()> {
        self.out.broadcast(headers).await?;
        self.cur.clear();
        self.out.forget_all();
        tracing::debug!(queue = self.out.base(), "robin sender counters reset");
        Ok(())
    }

    fn encode(&self, client_id: ClientId) -> StateLine {
        StateLine::Robin {
            cur: self.cur.get(&client_id).copied().unwrap_or(0),
            seqs: self.out.seqs_of(client_id),
        }
    }

    fn restore(&mut self, client_id: ClientId, line: &StateLine) -> Result<()> {
        let StateLine::Robin { cur, seqs } = line else {
            return Err(self.out.mismatch(line));
        };
        self.out.set_seqs(client_id, seqs)?;
        self.cur.insert(client_id, cur % self.out.copies());
        Ok(())
    }
}
