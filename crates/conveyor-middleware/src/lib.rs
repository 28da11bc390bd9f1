//! Exactly-once plumbing between the broker and a worker stage.
//!
//! [`Receiver`] turns an at-least-once, possibly reordered queue into an ordered,
//! duplicate-free stream of [`Delivery`] values, while [`Sender`] implementations
//! stamp outgoing messages with per-destination sequence numbers. Both encode
//! their tables as [`conveyor_wire::state::StateLine`]s so a worker can persist
//! and restore them.
pub mod delivery;
pub mod receiver;
pub mod sender;
pub mod topology;
pub mod transport;

pub use delivery::{Delivery, InFlight};
pub use receiver::{Checkpoint, Receiver, ReceiverState};
pub use sender::{DeliveryType, RobinSender, Sender, ShardSender, build_sender};
pub use transport::{InProcessTransport, RawAcker, RawConsumer, RawDelivery, Transport};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("broker error: {0}")]
    Broker(#[from] conveyor_broker::BrokerError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("header error: {0}")]
    Header(#[from] conveyor_common::Error),
    #[error("wire error: {0}")]
    Wire(#[from] conveyor_wire::Error),
    #[error("shard key {0} missing from row")]
    MissingShardKey(String),
    #[error("invalid delivery type: {0}")]
    InvalidDeliveryType(String),
    #[error("state does not fit {target}: {reason}")]
    State { target: String, reason: String },
    #[error("checkpoint failed: {0}")]
    Checkpoint(String),
    #[error("in-flight slot closed")]
    SlotClosed,
}
