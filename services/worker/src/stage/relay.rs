use super::{Stage, decode_batch, passthrough};
use crate::mailer::Mailer;
use anyhow::Result;
use async_trait::async_trait;
use conveyor_middleware::Delivery;

/// Forwards everything it receives to every output.
#[derive(Debug, Default)]
pub struct RelayStage;

#[async_trait]
impl Stage for RelayStage {
    fn name(&self) -> &'static str {
        "relay"
    }

    async fn batch(&mut self, mailer: &Mailer, _input: usize, delivery: &Delivery) -> Result<()> {
        let Some(batch) = decode_batch(delivery) else {
            return Ok(());
        };
        let headers = &delivery.headers;
        mailer
            .publish_batch(&batch, headers.client_id, &passthrough(headers))
            .await
    }

    async fn eof(&mut self, mailer: &Mailer, _input: usize, delivery: &Delivery) -> Result<()> {
        let headers = &delivery.headers;
        mailer
            .publish_eof(headers.client_id, &passthrough(headers))
            .await
    }

    async fn flush(&mut self, mailer: &Mailer, _input: usize, delivery: &Delivery) -> Result<()> {
        let headers = &delivery.headers;
        mailer
            .publish_flush(headers.client_id, &passthrough(headers))
            .await
    }

    async fn purge(&mut self, mailer: &Mailer, _input: usize, delivery: &Delivery) -> Result<()> {
        mailer.publish_purge(&passthrough(&delivery.headers)).await
    }
}
