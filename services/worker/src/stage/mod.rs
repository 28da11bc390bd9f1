// Per-stage processing plugged into the worker loop.
use crate::config::{StageKind, WorkerConfig};
use crate::mailer::Mailer;
use anyhow::{Result, ensure};
use async_trait::async_trait;
use conveyor_common::{HEADER_QUERY, HeaderTable, HeaderValue, Headers, NO_QUERY};
use conveyor_middleware::Delivery;
use conveyor_wire::batch::Batch;

mod count;
mod relay;

pub use count::CountStage;
pub use relay::RelayStage;

/// Callbacks run by the worker loop, one delivery at a time. `input` is the
/// index of the queue the delivery came from. An error stops the loop
/// without acknowledging the delivery.
#[async_trait]
pub trait Stage: Send {
    fn name(&self) -> &'static str;
    async fn batch(&mut self, mailer: &Mailer, input: usize, delivery: &Delivery) -> Result<()>;
    async fn eof(&mut self, mailer: &Mailer, input: usize, delivery: &Delivery) -> Result<()>;
    async fn flush(&mut self, mailer: &Mailer, input: usize, delivery: &Delivery) -> Result<()>;
    async fn purge(&mut self, mailer: &Mailer, input: usize, delivery: &Delivery) -> Result<()>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub fn build_stage(config: &WorkerConfig) -> Result<Box<dyn Stage>> {
    match &config.stage {
        StageKind::Relay => Ok(Box::new(RelayStage)),
        StageKind::Count(keys) => {
            ensure!(
                config.inputs.len() == 1,
                "count stage reads exactly one input, got {}",
                config.inputs.len()
            );
            Ok(Box::new(CountStage::new(
                &config.state_dir,
                config.inputs[0].copies,
                keys.clone(),
            )))
        }
    }
}

/// Headers forwarded downstream along with the stage's own identity.
pub(crate) fn passthrough(headers: &Headers) -> HeaderTable {
    let mut extra = HeaderTable::new();
    if headers.query != NO_QUERY {
        extra.insert(HEADER_QUERY.to_string(), HeaderValue::Int(headers.query));
    }
    extra
}

// Undecodable bodies are dropped: retrying them cannot succeed.
pub(crate) fn decode_batch(delivery: &Delivery) -> Option<Batch> {
    match Batch::decode(&delivery.body) {
        Ok(batch) => Some(batch),
        Err(err) => {
            tracing::warn!(id = %delivery.id(), error = %err, "dropping malformed batch");
            metrics::counter!("conveyor_worker_malformed_total").increment(1);
            None
        }
    }
}
