// TCP front end of the in-process broker.
//
// Each connection gets a writer task and one task per consumer. Delivery tags
// are numbered per connection and mapped back to the broker's ackers, so a
// client only ever sees tags it was handed. Closing the connection drops its
// consumers, which requeues whatever they still held.
use anyhow::{Context, Result};
use conveyor_broker::{Broker, Consumer, DeliveryAcker};
use conveyor_wire::{Message, read_frame, write_frame};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::WriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const WRITE_QUEUE_DEPTH: usize = 1024;

pub async fn serve(listener: TcpListener, broker: Arc<Broker>, max_frame_bytes: usize) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("accept connection")?;
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(broker, stream, peer, max_frame_bytes).await {
                tracing::warn!(%peer, error = %err, "broker connection handler failed");
            }
        });
    }
}

#[derive(Default)]
struct Deliveries {
    next_tag: AtomicU64,
    ackers: Mutex<HashMap<u64, DeliveryAcker>>,
}

impl Deliveries {
    fn register(&self, acker: DeliveryAcker) -> u64 {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
        self.ackers.lock().insert(tag, acker);
        tag
    }

    fn take(&self, tag: u64) -> std::result::Result<DeliveryAcker, String> {
        self.ackers
            .lock()
            .remove(&tag)
            .ok_or_else(|| format!("unknown delivery tag {tag}"))
    }
}

struct Connection {
    broker: Arc<Broker>,
    peer: SocketAddr,
    writer: mpsc::Sender<Message>,
    deliveries: Arc<Deliveries>,
    consumers: Vec<JoinHandle<()>>,
}

async fn handle_connection(
    broker: Arc<Broker>,
    stream: TcpStream,
    peer: SocketAddr,
    max_frame_bytes: usize,
) -> Result<()> {
    stream.set_nodelay(true).context("set TCP_NODELAY")?;
    let (mut read_half, write_half) = tokio::io::split(stream);
    let (writer, writer_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
    let write_task = tokio::spawn(write_loop(write_half, writer_rx));
    metrics::counter!("conveyor_broker_connections_total").increment(1);
    tracing::debug!(%peer, "client connected");

    let mut connection = Connection {
        broker,
        peer,
        writer,
        deliveries: Arc::new(Deliveries::default()),
        consumers: Vec::new(),
    };
    let result = async {
        while let Some(frame) = read_frame(&mut read_half, max_frame_bytes)
            .await
            .context("read frame")?
        {
            let message = Message::decode(&frame).context("decode message")?;
            if !connection.dispatch(message).await {
                break;
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    for consumer in connection.consumers.drain(..) {
        consumer.abort();
    }
    drop(connection);
    let _ = write_task.await;
    tracing::debug!(%peer, "client disconnected");
    result
}

impl Connection {
    // Returns false once the writer is gone.
    async fn dispatch(&mut self, message: Message) -> bool {
        let Some(request_id) = message.request_id() else {
            tracing::warn!(peer = %self.peer, "client sent a delivery");
            return true;
        };
        let outcome = match message {
            Message::DeclareExchange { name, .. } => self
                .broker
                .declare_exchange(name)
                .await
                .map_err(|err| err.to_string()),
            Message::DeclareQueue { name, .. } => self
                .broker
                .declare_queue(name)
                .await
                .map_err(|err| err.to_string()),
            Message::BindQueue {
                queue,
                routing_key,
                exchange,
                ..
            } => self
                .broker
                .bind_queue(&queue, &routing_key, &exchange)
                .await
                .map_err(|err| err.to_string()),
            Message::Publish {
                exchange,
                routing_key,
                headers,
                body,
                ..
            } => self
                .broker
                .publish(&exchange, &routing_key, headers, body)
                .await
                .map(|_| ())
                .map_err(|err| err.to_string()),
            Message::Consume {
                queue,
                consumer_tag,
                ..
            } => match self.broker.consume(&queue, consumer_tag).await {
                Ok(consumer) => {
                    // Reply before the first delivery can be pushed.
                    if !self.reply(request_id, Ok(())).await {
                        return false;
                    }
                    let task = tokio::spawn(forward(
                        consumer,
                        Arc::clone(&self.deliveries),
                        self.writer.clone(),
                    ));
                    self.consumers.push(task);
                    return true;
                }
                Err(err) => Err(err.to_string()),
            },
            Message::Ack { delivery_tag, .. } => self
                .deliveries
                .take(delivery_tag)
                .and_then(|acker| acker.ack().map_err(|err| err.to_string())),
            Message::Nack {
                delivery_tag,
                requeue,
                ..
            } => self
                .deliveries
                .take(delivery_tag)
                .and_then(|acker| acker.nack(requeue).map_err(|err| err.to_string())),
            Message::Ok { .. } | Message::Error { .. } | Message::Deliver { .. } => {
                Err("unexpected message from client".to_string())
            }
        };
        if let Err(message) = &outcome {
            tracing::debug!(peer = %self.peer, request_id, error = %message, "request failed");
        }
        self.reply(request_id, outcome).await
    }

    async fn reply(&self, request_id: u64, outcome: std::result::Result<(), String>) -> bool {
        let message = match outcome {
            Ok(()) => Message::Ok { request_id },
            Err(message) => Message::Error {
                request_id,
                message,
            },
        };
        self.writer.send(message).await.is_ok()
    }
}

async fn forward(mut consumer: Consumer, deliveries: Arc<Deliveries>, writer: mpsc::Sender<Message>) {
    while let Some(delivery) = consumer.recv().await {
        let delivery_tag = deliveries.register(delivery.acker);
        let message = Message::Deliver {
            consumer_tag: consumer.tag().to_string(),
            delivery_tag,
            redelivered: delivery.redelivered,
            headers: delivery.headers,
            body: delivery.body,
        };
        if writer.send(message).await.is_err() {
            break;
        }
    }
    tracing::debug!(queue = consumer.queue(), consumer_tag = consumer.tag(), "consumer finished");
}

async fn write_loop(mut write_half: WriteHalf<TcpStream>, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode broker message");
                continue;
            }
        };
        if let Err(err) = write_frame(&mut write_half, &frame).await {
            tracing::info!(error = %err, "client connection write failed");
            return;
        }
    }
}
