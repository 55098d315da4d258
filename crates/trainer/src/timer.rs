//! Scoped phase timers
//!
//! A timer synchronizes the device immediately before starting and
//! immediately before stopping the clock, so a sample measures device-busy
//! time rather than host dispatch latency.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parallel::Accelerator;
use runtime_core::{Error, Result};

/// Phases of one training step
pub mod phase {
    pub const DATA: &str = "data";
    pub const FORWARD: &str = "forward";
    pub const BACKWARD: &str = "backward";
    pub const UPDATE: &str = "update";

    pub const ALL: [&str; 4] = [DATA, FORWARD, BACKWARD, UPDATE];
}

/// Elapsed-time samples of one named phase since the last reset
pub struct PhaseTimer {
    phase: String,
    samples: Vec<Duration>,
    accelerator: Arc<dyn Accelerator>,
}

impl PhaseTimer {
    pub fn new(phase: impl Into<String>, accelerator: Arc<dyn Accelerator>) -> Self {
        Self {
            phase: phase.into(),
            samples: Vec::new(),
            accelerator,
        }
    }

    pub fn phase(&self) -> &str {
        &self.phase
    }

    /// Start timing. The sample is recorded when the guard drops, on every
    /// exit path including early returns and unwinding.
    pub fn start(&mut self) -> TimerGuard<'_> {
        self.accelerator.synchronize();
        TimerGuard {
            start: Instant::now(),
            timer: self,
        }
    }

    pub fn record(&mut self, elapsed: Duration) {
        self.samples.push(elapsed);
    }

    pub fn samples(&self) -> &[Duration] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean of the recorded samples. Errors when there are none.
    pub fn average(&self) -> Result<Duration> {
        if self.samples.is_empty() {
            return Err(Error::EmptyTimer {
                phase: self.phase.clone(),
            });
        }
        let total: Duration = self.samples.iter().sum();
        Ok(total / self.samples.len() as u32)
    }

    pub fn average_ms(&self) -> Result<f64> {
        Ok(self.average()?.as_secs_f64() * 1000.0)
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

/// Running measurement of one phase
pub struct TimerGuard<'a> {
    timer: &'a mut PhaseTimer,
    start: Instant,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.timer.accelerator.synchronize();
        let elapsed = self.start.elapsed();
        self.timer.record(elapsed);
    }
}

/// Ordered collection of phase timers
pub struct TimerSet {
    timers: Vec<PhaseTimer>,
}

impl TimerSet {
    pub fn new<I, S>(phases: I, accelerator: Arc<dyn Accelerator>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            timers: phases
                .into_iter()
                .map(|p| PhaseTimer::new(p, Arc::clone(&accelerator)))
                .collect(),
        }
    }

    /// Timers for data, forward, backward and update
    pub fn standard(accelerator: Arc<dyn Accelerator>) -> Self {
        Self::new(phase::ALL, accelerator)
    }

    pub fn get(&self, phase: &str) -> Option<&PhaseTimer> {
        self.timers.iter().find(|t| t.phase == phase)
    }

    fn get_mut(&mut self, phase: &str) -> Result<&mut PhaseTimer> {
        self.timers
            .iter_mut()
            .find(|t| t.phase == phase)
            .ok_or_else(|| Error::Internal {
                message: format!("no timer for phase {}", phase),
            })
    }

    /// Start timing `phase`
    pub fn start(&mut self, phase: &str) -> Result<TimerGuard<'_>> {
        Ok(self.get_mut(phase)?.start())
    }

    /// Add a measured sample to `phase`
    pub fn record(&mut self, phase: &str, elapsed: Duration) -> Result<()> {
        self.get_mut(phase)?.record(elapsed);
        Ok(())
    }

    /// Average milliseconds of every phase, in phase order
    pub fn averages_ms(&self) -> Result<Vec<(String, f64)>> {
        self.timers
            .iter()
            .map(|t| Ok((t.phase.clone(), t.average_ms()?)))
            .collect()
    }

    /// Sum of the phase averages: the mean duration of a step
    pub fn total_ms(&self) -> Result<f64> {
        self.timers.iter().map(PhaseTimer::average_ms).sum()
    }

    pub fn reset_all(&mut self) {
        for timer in &mut self.timers {
            timer.reset();
        }
    }
}
