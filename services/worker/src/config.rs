use crate::chaos::CrashMode;
use anyhow::{Context, Result, anyhow, bail, ensure};
use conveyor_common::ReplicaId;
use conveyor_middleware::DeliveryType;
use conveyor_wire::batch::Columns;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

const DEFAULT_KEEP_ALIVE_RETRIES: u32 = 3;
const DEFAULT_STATE_DIR: &str = "state";

/// One consumed queue: replica `id` reads `<queue>-<id>` bound to `exchange`,
/// fed by `copies` upstream replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputConfig {
    pub exchange: String,
    pub queue: String,
    pub copies: usize,
}

/// One downstream stage: `copies` queues `<queue>-<i>` on the output exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    pub queue: String,
    pub delivery: DeliveryType,
    pub copies: usize,
}

/// Processing run between the receivers and the senders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageKind {
    /// Republishes every message unchanged apart from the column selection.
    Relay,
    /// Counts rows per key and publishes the totals on EOF.
    Count(Vec<String>),
}

impl FromStr for StageKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        if value == "relay" {
            return Ok(StageKind::Relay);
        }
        let keys = value
            .strip_prefix("count:")
            .ok_or_else(|| anyhow!("unknown stage {value:?}"))?;
        let keys: Vec<String> = keys.split('+').map(|key| key.trim().to_string()).collect();
        ensure!(
            !keys.iter().any(String::is_empty),
            "count stage needs key fields: {value:?}"
        );
        Ok(StageKind::Count(keys))
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Relay => f.write_str("relay"),
            StageKind::Count(keys) => write!(f, "count:{}", keys.join("+")),
        }
    }
}

// Worker configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    // Replica index of this worker within its stage.
    pub id: ReplicaId,
    // tcp://host:port of the broker service.
    pub broker_url: String,
    pub inputs: Vec<InputConfig>,
    pub output_exchange: String,
    // Empty for sinks.
    pub outputs: Vec<OutputConfig>,
    // Columns kept in published batches; empty keeps all.
    pub select: Columns,
    pub stage: StageKind,
    // Percent chance of an injected crash at every phase boundary.
    pub crash_chance: f64,
    pub crash_mode: CrashMode,
    // UDP port answering health pings; 0 picks an ephemeral port.
    pub health_check_port: u16,
    pub keep_alive_retries: u32,
    // Root of the mailer and stage state.
    pub state_dir: PathBuf,
    // Metrics HTTP listener; disabled when unset.
    pub metrics_bind: Option<SocketAddr>,
}

#[derive(Debug, Deserialize)]
struct InputOverride {
    exchange: String,
    queue: String,
    copies: usize,
}

#[derive(Debug, Deserialize)]
struct OutputOverride {
    queue: String,
    delivery: String,
    copies: usize,
}

#[derive(Debug, Deserialize)]
struct WorkerConfigOverride {
    id: Option<ReplicaId>,
    broker_url: Option<String>,
    inputs: Option<Vec<InputOverride>>,
    output_exchange: Option<String>,
    outputs: Option<Vec<OutputOverride>>,
    select: Option<Vec<String>>,
    stage: Option<String>,
    crash_chance: Option<f64>,
    crash_mode: Option<String>,
    health_check_port: Option<u16>,
    keep_alive_retries: Option<u32>,
    state_dir: Option<PathBuf>,
    metrics_bind: Option<String>,
}

fn required(key: &str) -> Result<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| anyhow!("{key} was not provided"))
}

fn list(key: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parsed_list<T>(key: &str) -> Result<Vec<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    list(key)
        .iter()
        .enumerate()
        .map(|(index, item)| {
            item.parse::<T>()
                .map_err(|err| anyhow!("{key}[{index}] = {item:?} is invalid: {err}"))
        })
        .collect()
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let id: ReplicaId = required("ID")?.parse().with_context(|| "parse ID")?;
        let broker_url = required("BROKER_URL")?;

        let exchanges = list("INPUT_EXCHANGE_NAMES");
        let queues = list("INPUT_QUEUE_NAMES");
        let copies: Vec<usize> = parsed_list("INPUT_COPIES")?;
        ensure!(
            exchanges.len() == queues.len() && queues.len() == copies.len(),
            "input lists disagree (exchanges: {}, queues: {}, copies: {})",
            exchanges.len(),
            queues.len(),
            copies.len()
        );
        let inputs = exchanges
            .into_iter()
            .zip(queues)
            .zip(copies)
            .map(|((exchange, queue), copies)| InputConfig {
                exchange,
                queue,
                copies,
            })
            .collect();

        let output_exchange = std::env::var("OUTPUT_EXCHANGE_NAME").unwrap_or_default();
        let queues = list("OUTPUT_QUEUE_NAMES");
        let deliveries: Vec<DeliveryType> = parsed_list("OUTPUT_DELIVERY_TYPES")?;
        let copies: Vec<usize> = parsed_list("OUTPUT_COPIES")?;
        ensure!(
            queues.len() == deliveries.len() && queues.len() == copies.len(),
            "output lists disagree (queues: {}, delivery types: {}, copies: {})",
            queues.len(),
            deliveries.len(),
            copies.len()
        );
        let outputs = queues
            .into_iter()
            .zip(deliveries)
            .zip(copies)
            .map(|((queue, delivery), copies)| OutputConfig {
                queue,
                delivery,
                copies,
            })
            .collect();

        let crash_chance = std::env::var("RUSSIAN_ROULETTE_CHANCE")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(|value| value.trim().parse::<f64>())
            .transpose()
            .with_context(|| "parse RUSSIAN_ROULETTE_CHANCE")?
            .unwrap_or(0.0);
        let crash_mode = std::env::var("CRASH_MODE")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(|value| value.parse::<CrashMode>())
            .transpose()?
            .unwrap_or(CrashMode::Exit);
        let stage = std::env::var("STAGE")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(|value| value.parse::<StageKind>())
            .transpose()?
            .unwrap_or(StageKind::Relay);
        let health_check_port = std::env::var("HEALTH_CHECK_PORT")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(|value| value.trim().parse::<u16>())
            .transpose()
            .with_context(|| "parse HEALTH_CHECK_PORT")?
            .unwrap_or(0);
        let keep_alive_retries = std::env::var("KEEP_ALIVE_RETRIES")
            .ok()
            .and_then(|value| value.trim().parse::<u32>().ok())
            .unwrap_or(DEFAULT_KEEP_ALIVE_RETRIES);
        let state_dir = std::env::var("STATE_DIR")
            .ok()
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));
        let metrics_bind = std::env::var("METRICS_BIND")
            .ok()
            .filter(|value| !value.is_empty())
            .map(|value| value.parse())
            .transpose()
            .with_context(|| "parse METRICS_BIND")?;

        let config = Self {
            id,
            broker_url,
            inputs,
            output_exchange,
            outputs,
            select: list("SELECT").into_iter().collect(),
            stage,
            crash_chance,
            crash_mode,
            health_check_port,
            keep_alive_retries,
            state_dir,
            metrics_bind,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("CONVEYOR_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read CONVEYOR_CONFIG: {path}"))?;
            let override_cfg: WorkerConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse worker config yaml")?;
            config.apply(override_cfg)?;
            config.validate()?;
        }
        Ok(config)
    }

    fn apply(&mut self, override_cfg: WorkerConfigOverride) -> Result<()> {
        if let Some(value) = override_cfg.id {
            self.id = value;
        }
        if let Some(value) = override_cfg.broker_url {
            self.broker_url = value;
        }
        if let Some(inputs) = override_cfg.inputs {
            self.inputs = inputs
                .into_iter()
                .map(|input| InputConfig {
                    exchange: input.exchange,
                    queue: input.queue,
                    copies: input.copies,
                })
                .collect();
        }
        if let Some(value) = override_cfg.output_exchange {
            self.output_exchange = value;
        }
        if let Some(outputs) = override_cfg.outputs {
            self.outputs = outputs
                .into_iter()
                .map(|output| {
                    Ok(OutputConfig {
                        delivery: output
                            .delivery
                            .parse()
                            .with_context(|| format!("parse delivery of {}", output.queue))?,
                        queue: output.queue,
                        copies: output.copies,
                    })
                })
                .collect::<Result<_>>()?;
        }
        if let Some(value) = override_cfg.select {
            self.select = value.into_iter().collect();
        }
        if let Some(value) = override_cfg.stage {
            self.stage = value.parse()?;
        }
        if let Some(value) = override_cfg.crash_chance {
            self.crash_chance = value;
        }
        if let Some(value) = override_cfg.crash_mode {
            self.crash_mode = value.parse()?;
        }
        if let Some(value) = override_cfg.health_check_port {
            self.health_check_port = value;
        }
        if let Some(value) = override_cfg.keep_alive_retries {
            self.keep_alive_retries = value;
        }
        if let Some(value) = override_cfg.state_dir {
            self.state_dir = value;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = Some(value.parse().with_context(|| "parse metrics_bind")?);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.inputs.is_empty(), "at least one input queue is required");
        for input in &self.inputs {
            ensure!(
                !input.exchange.is_empty() && !input.queue.is_empty(),
                "input names must not be empty"
            );
            ensure!(input.copies > 0, "input {} needs at least one copy", input.queue);
        }
        for output in &self.outputs {
            ensure!(output.copies > 0, "output {} needs at least one copy", output.queue);
        }
        if !self.outputs.is_empty() && self.output_exchange.is_empty() {
            bail!("OUTPUT_EXCHANGE_NAME is required when output queues are set");
        }
        ensure!(
            (0.0..=100.0).contains(&self.crash_chance),
            "crash chance must be between 0 and 100: {}",
            self.crash_chance
        );
        Ok(())
    }
}
