// In-process message broker with direct exchanges and manual acknowledgment.
// Deliveries stay unacked until the consumer acks them; dropping a consumer
// requeues whatever it still holds, which is how crashed workers get their
// in-flight messages back.
use ahash::RandomState;
use bytes::Bytes;
use conveyor_common::HeaderTable;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Notify, RwLock};

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Name of the exchange that routes straight to the queue named by the routing key.
pub const DEFAULT_EXCHANGE: &str = "";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("exchange not found: {0}")]
    ExchangeNotFound(String),
    #[error("queue not found: {0}")]
    QueueNotFound(String),
    #[error("unknown delivery tag {tag} on queue {queue}")]
    UnknownDeliveryTag { queue: String, tag: u64 },
}

#[derive(Debug, Clone)]
struct Envelope {
    headers: HeaderTable,
    body: Bytes,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueInner {
    ready: VecDeque<Envelope>,
    // Delivery tag -> (consumer id, message). Ordered so requeue keeps tag order.
    unacked: BTreeMap<u64, (u64, Envelope)>,
    next_tag: u64,
    deleted: bool,
}

#[derive(Debug)]
struct QueueState {
    name: String,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl QueueState {
    fn new(name: String) -> Self {
        Self {
            name,
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
        }
    }

    fn push(&self, envelope: Envelope) {
        let depth = {
            let mut inner = self.inner.lock();
            inner.ready.push_back(envelope);
            inner.ready.len()
        };
        self.record_depth(depth);
        self.notify.notify_waiters();
    }

    fn settle(&self, tag: u64, requeue: bool) -> Result<()> {
        let depth = {
            let mut inner = self.inner.lock();
            let Some((_, mut envelope)) = inner.unacked.remove(&tag) else {
                return Err(BrokerError::UnknownDeliveryTag {
                    queue: self.name.clone(),
                    tag,
                });
            };
            if !requeue {
                return Ok(());
            }
            envelope.redelivered = true;
            inner.ready.push_front(envelope);
            inner.ready.len()
        };
        self.record_depth(depth);
        self.notify.notify_waiters();
        Ok(())
    }

    // Puts everything a consumer still holds back at the head, oldest first.
    fn requeue_consumer(&self, consumer_id: u64) {
        let (requeued, depth) = {
            let mut inner = self.inner.lock();
            let tags: Vec<u64> = inner
                .unacked
                .iter()
                .filter(|(_, (owner, _))| *owner == consumer_id)
                .map(|(tag, _)| *tag)
                .collect();
            for tag in tags.iter().rev() {
                if let Some((_, mut envelope)) = inner.unacked.remove(tag) {
                    envelope.redelivered = true;
                    inner.ready.push_front(envelope);
                }
            }
            (tags.len(), inner.ready.len())
        };
        if requeued > 0 {
            tracing::debug!(queue = %self.name, requeued, "requeued deliveries of closed consumer");
            self.record_depth(depth);
            self.notify.notify_waiters();
        }
    }

    fn record_depth(&self, depth: usize) {
        metrics::gauge!("conveyor_broker_queue_depth", "queue" => self.name.clone())
            .set(depth as f64);
    }
}

#[derive(Debug, Default)]
struct Exchange {
    // Routing key -> bound queue names.
    bindings: HashMap<String, Vec<String>, RandomState>,
}

/// Message handed to a consumer, settled through its `acker`.
#[derive(Debug)]
pub struct BrokerDelivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub headers: HeaderTable,
    pub body: Bytes,
    pub acker: DeliveryAcker,
}

/// Settles one delivery. Cloneable so transports can move it across tasks.
#[derive(Debug, Clone)]
pub struct DeliveryAcker {
    queue: Arc<QueueState>,
    tag: u64,
}

impl DeliveryAcker {
    pub fn ack(&self) -> Result<()> {
        self.queue.settle(self.tag, false)
    }

    pub fn nack(&self, requeue: bool) -> Result<()> {
        self.queue.settle(self.tag, requeue)
    }

    pub fn delivery_tag(&self) -> u64 {
        self.tag
    }
}

/// Pulls deliveries from one queue. Dropping it requeues its unacked deliveries.
#[derive(Debug)]
pub struct Consumer {
    queue: Arc<QueueState>,
    id: u64,
    tag: String,
}

impl Consumer {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn queue(&self) -> &str {
        &self.queue.name
    }

    /// Next delivery, or `None` once the queue has been deleted.
    pub async fn recv(&mut self) -> Option<BrokerDelivery> {
        loop {
            // Register before checking so a concurrent push cannot be missed.
            let notified = self.queue.notify.notified();
            {
                let mut inner = self.queue.inner.lock();
                if inner.deleted {
                    return None;
                }
                if let Some(envelope) = inner.ready.pop_front() {
                    inner.next_tag += 1;
                    let tag = inner.next_tag;
                    inner.unacked.insert(tag, (self.id, envelope.clone()));
                    let depth = inner.ready.len();
                    drop(inner);
                    self.queue.record_depth(depth);
                    return Some(BrokerDelivery {
                        delivery_tag: tag,
                        redelivered: envelope.redelivered,
                        headers: envelope.headers,
                        body: envelope.body,
                        acker: DeliveryAcker {
                            queue: Arc::clone(&self.queue),
                            tag,
                        },
                    });
                }
            }
            notified.await;
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.queue.requeue_consumer(self.id);
    }
}

/// Ready and unacked message counts of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDepth {
    pub ready: usize,
    pub unacked: usize,
}

/// In-process broker with direct exchanges and named queues.
///
/// ```
/// use bytes::Bytes;
/// use conveyor_broker::Broker;
/// use conveyor_common::HeaderTable;
///
/// let broker = Broker::new();
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     broker.declare_exchange("movies").await.expect("exchange");
///     broker.declare_queue("filter-0").await.expect("queue");
///     broker
///         .bind_queue("filter-0", "filter-0", "movies")
///         .await
///         .expect("bind");
///     let mut consumer = broker.consume("filter-0", "worker").await.expect("consume");
///     broker
///         .publish("movies", "filter-0", HeaderTable::new(), Bytes::from_static(b"id=1"))
///         .await
///         .expect("publish");
///     let delivery = consumer.recv().await.expect("delivery");
///     assert_eq!(delivery.body, Bytes::from_static(b"id=1"));
///     delivery.acker.ack().expect("ack");
/// });
/// ```
#[derive(Debug, Default)]
pub struct Broker {
    // Exchange name -> bindings.
    exchanges: RwLock<HashMap<String, Exchange, RandomState>>,
    // Queue name -> queue state shared with consumers.
    queues: RwLock<HashMap<String, Arc<QueueState>, RandomState>>,
    next_consumer: AtomicU64,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a direct exchange. Declaring an existing exchange is a no-op.
    pub async fn declare_exchange(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.exchanges.write().await.entry(name).or_default();
        Ok(())
    }

    /// Declares a queue. Declaring an existing queue keeps its messages.
    pub async fn declare_queue(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        let mut queues = self.queues.write().await;
        if !queues.contains_key(&name) {
            tracing::debug!(queue = %name, "queue declared");
            queues.insert(name.clone(), Arc::new(QueueState::new(name)));
        }
        Ok(())
    }

    pub async fn bind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()> {
        if !self.queues.read().await.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        let mut exchanges = self.exchanges.write().await;
        let exchange = exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;
        let bound = exchange.bindings.entry(routing_key.to_string()).or_default();
        if !bound.iter().any(|name| name == queue) {
            bound.push(queue.to_string());
        }
        Ok(())
    }

    /// Routes a message to every queue bound to `exchange` with `routing_key`.
    /// Returns how many queues received it; unroutable messages are dropped.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        headers: HeaderTable,
        body: Bytes,
    ) -> Result<usize> {
        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            vec![routing_key.to_string()]
        } else {
            let exchanges = self.exchanges.read().await;
            let bound = exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;
            bound.bindings.get(routing_key).cloned().unwrap_or_default()
        };

        let queues = self.queues.read().await;
        let mut routed = 0;
        for target in &targets {
            if let Some(queue) = queues.get(target) {
                queue.push(Envelope {
                    headers: headers.clone(),
                    body: body.clone(),
                    redelivered: false,
                });
                routed += 1;
            }
        }
        if routed == 0 {
            tracing::debug!(exchange, routing_key, "message was not routed to any queue");
        }
        metrics::counter!("conveyor_broker_published_total").increment(1);
        Ok(routed)
    }

    pub async fn consume(&self, queue: &str, consumer_tag: impl Into<String>) -> Result<Consumer> {
        let state = self
            .queues
            .read()
            .await
            .get(queue)
            .cloned()
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        let id = self.next_consumer.fetch_add(1, Ordering::Relaxed);
        Ok(Consumer {
            queue: state,
            id,
            tag: consumer_tag.into(),
        })
    }

    /// Removes a queue; its consumers see the end of their stream.
    pub async fn delete_queue(&self, name: &str) -> Result<()> {
        let state = self
            .queues
            .write()
            .await
            .remove(name)
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))?;
        state.inner.lock().deleted = true;
        state.notify.notify_waiters();
        let mut exchanges = self.exchanges.write().await;
        for exchange in exchanges.values_mut() {
            for bound in exchange.bindings.values_mut() {
                bound.retain(|queue| queue != name);
            }
        }
        Ok(())
    }

    pub async fn queue_depth(&self, name: &str) -> Result<QueueDepth> {
        let queues = self.queues.read().await;
        let state = queues
            .get(name)
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))?;
        let inner = state.inner.lock();
        Ok(QueueDepth {
            ready: inner.ready.len(),
            unacked: inner.unacked.len(),
        })
    }
}
