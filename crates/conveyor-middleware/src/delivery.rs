// Deliveries handed to the worker and the single in-flight slot that gates them.
use crate::transport::RawAcker;
use crate::{Error, Result};
use bytes::Bytes;
use conveyor_common::{DelId, Headers, MessageKind};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Single-slot semaphore shared by every receiver of one worker.
///
/// A receiver takes the slot before it advances its tables for a delivery and
/// the slot comes back only when that delivery is acknowledged, so a state
/// dump never observes a table advanced past a delivery still being processed.
///
/// ```
/// use conveyor_middleware::InFlight;
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let slot = InFlight::new();
///     let permit = slot.acquire().await.expect("permit");
///     assert!(!slot.is_free());
///     drop(permit);
///     assert!(slot.is_free());
/// });
/// ```
#[derive(Clone, Debug)]
pub struct InFlight {
    slot: Arc<Semaphore>,
}

impl InFlight {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.slot)
            .acquire_owned()
            .await
            .map_err(|_| Error::SlotClosed)
    }

    pub fn is_free(&self) -> bool {
        self.slot.available_permits() == 1
    }
}

impl Default for InFlight {
    fn default() -> Self {
        Self::new()
    }
}

/// An in-order, deduplicated message. Acknowledging consumes it.
pub struct Delivery {
    pub headers: Headers,
    pub body: Bytes,
    pub redelivered: bool,
    acker: Option<Box<dyn RawAcker>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Delivery {
    pub(crate) fn new(
        headers: Headers,
        body: Bytes,
        redelivered: bool,
        acker: Box<dyn RawAcker>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            headers,
            body,
            redelivered,
            acker: Some(acker),
            permit: Some(permit),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.headers.kind
    }

    pub fn id(&self) -> DelId {
        self.headers.id()
    }

    /// Acknowledges the broker message and frees the in-flight slot.
    /// On failure the slot stays taken; the broker redelivers after restart.
    pub async fn ack(mut self) -> Result<()> {
        let Some(acker) = self.acker.take() else {
            return Ok(());
        };
        match acker.ack().await {
            Ok(()) => {
                self.permit.take();
                Ok(())
            }
            Err(err) => {
                if let Some(permit) = self.permit.take() {
                    permit.forget();
                }
                Err(err)
            }
        }
    }

    /// Gives up on the delivery without acknowledging it, keeping the slot
    /// taken. Used when the worker stops on purpose mid-delivery.
    pub fn abandon(mut self) {
        tracing::debug!(id = %self.id(), kind = %self.kind(), "delivery abandoned");
        self.acker.take();
        if let Some(permit) = self.permit.take() {
            permit.forget();
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if self.acker.take().is_some() {
            tracing::error!(
                id = %self.headers.id(),
                kind = %self.headers.kind,
                "delivery dropped without ack; in-flight slot stays taken"
            );
            if let Some(permit) = self.permit.take() {
                permit.forget();
            }
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}
