// TCP client for the conveyor broker service.
//
// One connection carries every request and every consumer. A single writer
// task owns the write half and a reader task routes replies by request id and
// deliveries by consumer tag, so callers never share the socket directly.
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use conveyor_common::HeaderTable;
use conveyor_middleware::transport::{RawAcker, RawConsumer, RawDelivery, Transport};
use conveyor_wire::{DEFAULT_MAX_FRAME_BYTES, Message, read_frame, write_frame};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const WRITE_QUEUE_DEPTH: usize = 1024;
const URL_SCHEME: &str = "tcp://";

type Reply = std::result::Result<(), String>;

/// Strips the `tcp://` scheme from a broker URL, leaving `host:port`.
///
/// ```
/// assert_eq!(conveyor_client::broker_addr("tcp://broker:5672").expect("addr"), "broker:5672");
/// assert!(conveyor_client::broker_addr("amqp://broker").is_err());
/// ```
pub fn broker_addr(url: &str) -> Result<&str> {
    let addr = url
        .strip_prefix(URL_SCHEME)
        .ok_or_else(|| anyhow!("broker url must start with {URL_SCHEME}: {url}"))?;
    if addr.is_empty() {
        return Err(anyhow!("broker url has no address: {url}"));
    }
    Ok(addr)
}

struct Shared {
    writer: mpsc::Sender<Message>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    // Deliveries are buffered without bound so the reader never stalls replies
    // behind a consumer that is waiting on its own in-flight slot.
    consumers: Mutex<HashMap<String, mpsc::UnboundedSender<RawDelivery>>>,
    next_request: AtomicU64,
    next_consumer: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    async fn request(&self, build: impl FnOnce(u64) -> Message) -> Result<()> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(request_id, reply_tx);
        if self.closed.load(Ordering::SeqCst) || self.writer.send(build(request_id)).await.is_err() {
            self.pending.lock().remove(&request_id);
            return Err(anyhow!("broker connection closed"));
        }
        reply_rx
            .await
            .context("broker connection closed before reply")?
            .map_err(|message| anyhow!("broker error: {message}"))
    }

    fn fail_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for (_, reply) in self.pending.lock().drain() {
            let _ = reply.send(Err("connection closed".to_string()));
        }
        self.consumers.lock().clear();
    }
}

/// Connection to a broker service, usable as a [`Transport`].
pub struct Client {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl Client {
    /// Connects to `host:port`.
    pub async fn connect(addr: &str) -> Result<Self> {
        Self::connect_with_limit(addr, DEFAULT_MAX_FRAME_BYTES).await
    }

    pub async fn connect_url(url: &str) -> Result<Self> {
        Self::connect(broker_addr(url)?).await
    }

    pub async fn connect_with_limit(addr: &str, max_frame_bytes: usize) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect to broker {addr}"))?;
        stream.set_nodelay(true).context("set TCP_NODELAY")?;
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let shared = Arc::new(Shared {
            writer: writer_tx,
            pending: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            next_consumer: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });
        let tasks = vec![
            tokio::spawn(write_loop(write_half, writer_rx)),
            tokio::spawn(read_loop(read_half, Arc::clone(&shared), max_frame_bytes)),
        ];
        tracing::debug!(addr, "connected to broker");
        Ok(Self { shared, tasks })
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.shared.fail_all();
    }
}

async fn write_loop(mut write_half: WriteHalf<TcpStream>, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode broker request");
                continue;
            }
        };
        if let Err(err) = write_frame(&mut write_half, &frame).await {
            tracing::warn!(error = %err, "broker connection write failed");
            return;
        }
    }
}

async fn read_loop(mut read_half: ReadHalf<TcpStream>, shared: Arc<Shared>, max_frame_bytes: usize) {
    loop {
        let frame = match read_frame(&mut read_half, max_frame_bytes).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::info!("broker closed the connection");
                break;
            }
            Err(err) => {
                tracing::warn!(error = %err, "broker connection read failed");
                break;
            }
        };
        let message = match Message::decode(&frame) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(error = %err, "undecodable broker message");
                continue;
            }
        };
        match message {
            Message::Ok { request_id } => complete(&shared, request_id, Ok(())),
            Message::Error {
                request_id,
                message,
            } => complete(&shared, request_id, Err(message)),
            Message::Deliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                headers,
                body,
            } => {
                let delivery = RawDelivery {
                    headers,
                    body,
                    redelivered,
                    acker: Box::new(TcpAcker {
                        shared: Arc::clone(&shared),
                        delivery_tag,
                    }),
                };
                let routed = match shared.consumers.lock().get(&consumer_tag) {
                    Some(consumer) => consumer.send(delivery).is_ok(),
                    None => false,
                };
                if !routed {
                    tracing::debug!(
                        consumer_tag = %consumer_tag,
                        delivery_tag,
                        "delivery for closed consumer"
                    );
                }
            }
            other => tracing::warn!(unexpected = ?other, "unexpected message from broker"),
        }
    }
    shared.fail_all();
}

fn complete(shared: &Shared, request_id: u64, reply: Reply) {
    match shared.pending.lock().remove(&request_id) {
        Some(waiter) => {
            let _ = waiter.send(reply);
        }
        None => tracing::debug!(request_id, "reply for unknown request"),
    }
}

fn transport_error(err: anyhow::Error) -> conveyor_middleware::Error {
    conveyor_middleware::Error::Transport(format!("{err:#}"))
}

#[async_trait]
impl Transport for Client {
    async fn declare_exchange(&self, name: &str) -> conveyor_middleware::Result<()> {
        self.shared
            .request(|request_id| Message::DeclareExchange {
                request_id,
                name: name.to_string(),
            })
            .await
            .map_err(transport_error)
    }

    async fn declare_queue(&self, name: &str) -> conveyor_middleware::Result<()> {
        self.shared
            .request(|request_id| Message::DeclareQueue {
                request_id,
                name: name.to_string(),
            })
            .await
            .map_err(transport_error)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
    ) -> conveyor_middleware::Result<()> {
        self.shared
            .request(|request_id| Message::BindQueue {
                request_id,
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
                exchange: exchange.to_string(),
            })
            .await
            .map_err(transport_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        headers: HeaderTable,
        body: Bytes,
    ) -> conveyor_middleware::Result<()> {
        self.shared
            .request(|request_id| Message::Publish {
                request_id,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                headers,
                body,
            })
            .await
            .map_err(transport_error)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> conveyor_middleware::Result<Box<dyn RawConsumer>> {
        // Tags are made unique per connection so deliveries route unambiguously.
        let serial = self.shared.next_consumer.fetch_add(1, Ordering::Relaxed);
        let tag = format!("{consumer_tag}.{serial}");
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.consumers.lock().insert(tag.clone(), tx);
        let subscribed = self
            .shared
            .request(|request_id| Message::Consume {
                request_id,
                queue: queue.to_string(),
                consumer_tag: tag.clone(),
            })
            .await;
        if let Err(err) = subscribed {
            self.shared.consumers.lock().remove(&tag);
            return Err(transport_error(err));
        }
        Ok(Box::new(TcpConsumer { rx }))
    }
}

struct TcpConsumer {
    rx: mpsc::UnboundedReceiver<RawDelivery>,
}

#[async_trait]
impl RawConsumer for TcpConsumer {
    async fn next(&mut self) -> Option<RawDelivery> {
        self.rx.recv().await
    }
}

struct TcpAcker {
    shared: Arc<Shared>,
    delivery_tag: u64,
}

#[async_trait]
impl RawAcker for TcpAcker {
    async fn ack(&self) -> conveyor_middleware::Result<()> {
        let delivery_tag = self.delivery_tag;
        self.shared
            .request(|request_id| Message::Ack {
                request_id,
                delivery_tag,
            })
            .await
            .map_err(transport_error)
    }

    async fn nack(&self, requeue: bool) -> conveyor_middleware::Result<()> {
        let delivery_tag = self.delivery_tag;
        self.shared
            .request(|request_id| Message::Nack {
                request_id,
                delivery_tag,
                requeue,
            })
            .await
            .map_err(transport_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_wire::Frame;
    use tokio::net::TcpListener;

    #[test]
    fn broker_urls_need_scheme_and_address() {
        assert_eq!(broker_addr("tcp://127.0.0.1:5672").expect("addr"), "127.0.0.1:5672");
        assert!(broker_addr("tcp://").is_err());
        assert!(broker_addr("127.0.0.1:5672").is_err());
    }

    // Answers every request with `Ok`, except publishes to "missing".
    async fn fake_broker() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            while let Ok(Some(frame)) = read_frame(&mut stream, DEFAULT_MAX_FRAME_BYTES).await {
                let message = Message::decode(&frame).expect("decode");
                let reply = match message {
                    Message::Publish {
                        request_id,
                        exchange,
                        ..
                    } if exchange == "missing" => Message::Error {
                        request_id,
                        message: "exchange not found: missing".to_string(),
                    },
                    other => Message::Ok {
                        request_id: other.request_id().expect("request"),
                    },
                };
                let frame: Frame = reply.encode().expect("encode");
                write_frame(&mut stream, &frame).await.expect("write");
            }
        });
        addr
    }

    #[tokio::test]
    async fn requests_wait_for_replies() {
        let addr = fake_broker().await;
        let client = Client::connect(&addr).await.expect("connect");
        client.declare_exchange("ex").await.expect("declare");
        client
            .publish("ex", "q", HeaderTable::new(), Bytes::from_static(b"x"))
            .await
            .expect("publish");
        let err = client
            .publish("missing", "q", HeaderTable::new(), Bytes::new())
            .await
            .expect_err("broker error");
        assert!(err.to_string().contains("exchange not found"));
    }

    #[tokio::test]
    async fn closed_connection_fails_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            drop(stream);
        });
        let client = Client::connect(&addr).await.expect("connect");
        let err = client.declare_queue("q").await.expect_err("closed");
        assert!(matches!(err, conveyor_middleware::Error::Transport(_)));
    }
}
