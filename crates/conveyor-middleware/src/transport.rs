// Broker seam. Receivers and senders only see these traits, so the same code
// runs against the in-process broker and the TCP client.
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use conveyor_broker::{Broker, Consumer, DeliveryAcker};
use conveyor_common::HeaderTable;
use std::sync::Arc;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn declare_exchange(&self, name: &str) -> Result<()>;
    async fn declare_queue(&self, name: &str) -> Result<()>;
    async fn bind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()>;
    /// Returns once the broker has accepted the message.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        headers: HeaderTable,
        body: Bytes,
    ) -> Result<()>;
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Box<dyn RawConsumer>>;
}

/// Stream of unordered broker deliveries. `None` means the queue is gone.
#[async_trait]
pub trait RawConsumer: Send {
    async fn next(&mut self) -> Option<RawDelivery>;
}

#[async_trait]
pub trait RawAcker: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

pub struct RawDelivery {
    pub headers: HeaderTable,
    pub body: Bytes,
    pub redelivered: bool,
    pub acker: Box<dyn RawAcker>,
}

impl std::fmt::Debug for RawDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawDelivery")
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Transport backed by a [`Broker`] living in the same process.
#[derive(Clone, Debug)]
pub struct InProcessTransport {
    broker: Arc<Broker>,
}

impl InProcessTransport {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn declare_exchange(&self, name: &str) -> Result<()> {
        Ok(self.broker.declare_exchange(name).await?)
    }

    async fn declare_queue(&self, name: &str) -> Result<()> {
        Ok(self.broker.declare_queue(name).await?)
    }

    async fn bind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()> {
        Ok(self.broker.bind_queue(queue, routing_key, exchange).await?)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        headers: HeaderTable,
        body: Bytes,
    ) -> Result<()> {
        self.broker
            .publish(exchange, routing_key, headers, body)
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Box<dyn RawConsumer>> {
        let consumer = self.broker.consume(queue, consumer_tag).await?;
        Ok(Box::new(InProcessConsumer { consumer }))
    }
}

struct InProcessConsumer {
    consumer: Consumer,
}

#[async_trait]
impl RawConsumer for InProcessConsumer {
    async fn next(&mut self) -> Option<RawDelivery> {
        let delivery = self.consumer.recv().await?;
        Some(RawDelivery {
            headers: delivery.headers,
            body: delivery.body,
            redelivered: delivery.redelivered,
            acker: Box::new(InProcessAcker(delivery.acker)),
        })
    }
}

struct InProcessAcker(DeliveryAcker);

#[async_trait]
impl RawAcker for InProcessAcker {
    async fn ack(&self) -> Result<()> {
        self.0.ack().map_err(Error::from)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0.nack(requeue).map_err(Error::from)
    }
}
