// Crash injection between the phases of the worker loop.
use anyhow::anyhow;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::str::FromStr;

/// Point of the loop a crash is injected after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Delivery received, nothing processed yet.
    Received,
    /// Stage callback ran and published, state not dumped.
    Processed,
    /// State dumped, delivery not acknowledged.
    Persisted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Received => "received",
            Phase::Processed => "processed",
            Phase::Persisted => "persisted",
        })
    }
}

/// What an injected crash does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashMode {
    /// Terminate the process with status 1.
    Exit,
    /// Stop the loop without acknowledging, leaving the process alive.
    Halt,
}

impl FromStr for CrashMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value.trim() {
            "exit" => Ok(CrashMode::Exit),
            "halt" => Ok(CrashMode::Halt),
            other => Err(anyhow!("unknown crash mode {other:?}")),
        }
    }
}

/// Draws once per phase boundary and fires with `chance` percent probability.
///
/// ```
/// use worker::chaos::{CrashMode, Phase, Roulette};
///
/// let mut draws = vec![0.9, 0.1].into_iter();
/// let mut roulette = Roulette::with_draw(50.0, CrashMode::Halt, move || {
///     draws.next().unwrap_or(1.0)
/// });
/// assert!(!roulette.spin(Phase::Received));
/// assert!(roulette.spin(Phase::Processed));
/// ```
pub struct Roulette {
    chance: f64,
    mode: CrashMode,
    draw: Box<dyn FnMut() -> f64 + Send>,
}

impl Roulette {
    pub fn new(chance: f64, mode: CrashMode) -> Self {
        let mut rng = StdRng::from_entropy();
        Self::with_draw(chance, mode, move || rng.r#gen::<f64>())
    }

    /// Uses `draw` (values in `[0, 1)`) instead of a random source.
    pub fn with_draw(chance: f64, mode: CrashMode, draw: impl FnMut() -> f64 + Send + 'static) -> Self {
        Self {
            chance,
            mode,
            draw: Box::new(draw),
        }
    }

    pub fn disabled() -> Self {
        Self::with_draw(0.0, CrashMode::Halt, || 1.0)
    }

    pub fn mode(&self) -> CrashMode {
        self.mode
    }

    /// True when the crash fires after `phase`. A zero chance never draws.
    pub fn spin(&mut self, phase: Phase) -> bool {
        if self.chance <= 0.0 {
            return false;
        }
        let fired = (self.draw)() * 100.0 < self.chance;
        if fired {
            tracing::info!(%phase, chance = self.chance, "terminated by chance");
        }
        fired
    }
}

impl fmt::Debug for Roulette {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Roulette")
            .field("chance", &self.chance)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
