// The worker loop: one delivery at a time through the stage, the state dump
// and the acknowledgement, with crash injection between each step.
use crate::chaos::{CrashMode, Phase, Roulette};
use crate::config::WorkerConfig;
use crate::mailer::Mailer;
use crate::stage::{Stage, build_stage};
use anyhow::{Context, Result, bail};
use conveyor_common::MessageKind;
use conveyor_health::Acker;
use conveyor_middleware::{Delivery, Transport};
use futures::stream::{self, BoxStream, SelectAll, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Why [`Worker::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Shutdown,
    /// An injected crash in [`CrashMode::Halt`] fired after this phase.
    Crashed(Phase),
}

enum Inbound {
    Delivery(usize, Delivery),
    Closed(usize),
}

pub struct Worker {
    mailer: Mailer,
    stage: Box<dyn Stage>,
    roulette: Roulette,
    health_check_port: u16,
    keep_alive_retries: u32,
}

impl Worker {
    /// Builds the stage and the mailer, restoring any persisted state.
    pub async fn new(config: &WorkerConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let stage = build_stage(config)?;
        let mailer = Mailer::init(config, transport)
            .await
            .context("initialize mailer")?;
        tracing::info!(
            id = config.id,
            stage = stage.name(),
            inputs = config.inputs.len(),
            outputs = config.outputs.len(),
            "worker ready"
        );
        Ok(Self {
            mailer,
            stage,
            roulette: Roulette::new(config.crash_chance, config.crash_mode),
            health_check_port: config.health_check_port,
            keep_alive_retries: config.keep_alive_retries,
        })
    }

    pub fn with_roulette(mut self, roulette: Roulette) -> Self {
        self.roulette = roulette;
        self
    }

    pub fn mailer(&self) -> &Mailer {
        &self.mailer
    }

    /// Processes deliveries until `shutdown` resolves, an input closes or a
    /// halting crash fires. A delivery being processed is always finished
    /// before shutdown is observed.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<Exit> {
        let acker = Acker::spawn(self.health_check_port, self.keep_alive_retries)
            .await
            .context("start health acker")?;
        let exit = self.consume(shutdown).await;

        self.mailer.stop();
        if let Err(err) = self.stage.close().await {
            tracing::warn!(stage = self.stage.name(), error = %err, "stage close failed");
        }
        acker.stop().await;
        match &exit {
            Ok(exit) => tracing::info!(?exit, "worker stopped"),
            Err(err) => tracing::error!(error = %err, "worker failed"),
        }
        exit
    }

    async fn consume(&mut self, shutdown: impl Future<Output = ()>) -> Result<Exit> {
        let channels = self.mailer.consume().await?;
        let mut inbound: SelectAll<BoxStream<'static, Inbound>> = stream::select_all(
            channels
                .into_iter()
                .enumerate()
                .map(|(input, rx)| inbound(input, rx)),
        );
        tokio::pin!(shutdown);

        loop {
            let next = tokio::select! {
                biased;
                () = &mut shutdown => return Ok(Exit::Shutdown),
                next = inbound.next() => next,
            };
            match next {
                Some(Inbound::Delivery(input, delivery)) => {
                    if let Some(phase) = self.process(input, delivery).await? {
                        return Ok(Exit::Crashed(phase));
                    }
                }
                Some(Inbound::Closed(input)) => bail!("input {input} closed"),
                None => bail!("worker has no inputs"),
            }
        }
    }

    // Returns the phase of a halting crash; the delivery is then left unacknowledged.
    async fn process(&mut self, input: usize, delivery: Delivery) -> Result<Option<Phase>> {
        let kind = delivery.kind();
        let id = delivery.id();
        tracing::trace!(input, %id, %kind, "delivery received");

        if self.crashes(Phase::Received) {
            delivery.abandon();
            return Ok(Some(Phase::Received));
        }

        let handled = match kind {
            MessageKind::Batch => self.stage.batch(&self.mailer, input, &delivery).await,
            MessageKind::Eof => self.stage.eof(&self.mailer, input, &delivery).await,
            MessageKind::Flush => self.stage.flush(&self.mailer, input, &delivery).await,
            MessageKind::Purge => self.stage.purge(&self.mailer, input, &delivery).await,
        };
        if let Err(err) = handled {
            delivery.abandon();
            return Err(err.context(format!("{} stage failed on {kind} {id}", self.stage.name())));
        }

        if self.crashes(Phase::Processed) {
            delivery.abandon();
            return Ok(Some(Phase::Processed));
        }

        let persisted = match kind {
            MessageKind::Batch | MessageKind::Eof => self.mailer.dump(id.client_id).await,
            MessageKind::Flush => self.mailer.flush(id.client_id),
            MessageKind::Purge => self.mailer.purge(),
        };
        if let Err(err) = persisted {
            delivery.abandon();
            return Err(err.context(format!("persist after {kind} {id}")));
        }

        if self.crashes(Phase::Persisted) {
            delivery.abandon();
            return Ok(Some(Phase::Persisted));
        }

        delivery
            .ack()
            .await
            .with_context(|| format!("ack {kind} {id}"))?;
        metrics::counter!("conveyor_worker_processed_total", "kind" => kind.to_string())
            .increment(1);
        Ok(None)
    }

    fn crashes(&mut self, phase: Phase) -> bool {
        if !self.roulette.spin(phase) {
            return false;
        }
        if self.roulette.mode() == CrashMode::Exit {
            std::process::exit(1);
        }
        true
    }
}

// Tags every delivery with its input and reports the channel closing once.
fn inbound(input: usize, rx: mpsc::Receiver<Delivery>) -> BoxStream<'static, Inbound> {
    stream::unfold(Some(rx), move |rx| async move {
        let mut rx = rx?;
        match rx.recv().await {
            Some(delivery) => Some((Inbound::Delivery(input, delivery), Some(rx))),
            None => Some((Inbound::Closed(input), None)),
        }
    })
    .boxed()
}
