//! Cosine annealing learning-rate schedule

use runtime_core::{Error, Result, StateDict};
use std::f64::consts::PI;

use crate::model::LrScheduler;

/// `eta_min + (base_lr - eta_min) * (1 + cos(pi * t / t_max)) / 2`
#[derive(Debug, Clone, PartialEq)]
pub struct CosineAnnealingLr {
    base_lr: f64,
    eta_min: f64,
    t_max: u64,
    last_epoch: u64,
}

impl CosineAnnealingLr {
    pub fn new(base_lr: f64, t_max: u64, eta_min: f64) -> Result<Self> {
        if t_max == 0 {
            return Err(Error::InvalidConfig {
                message: "cosine schedule needs t_max > 0".to_string(),
            });
        }
        Ok(Self {
            base_lr,
            eta_min,
            t_max,
            last_epoch: 0,
        })
    }

    /// Schedule used for large runs: 1000-step period decaying to 1% of the
    /// peak rate
    pub fn standard(base_lr: f64) -> Self {
        Self {
            base_lr,
            eta_min: base_lr * 1e-2,
            t_max: 1000,
            last_epoch: 0,
        }
    }

    /// Scheduler steps taken
    pub fn last_epoch(&self) -> u64 {
        self.last_epoch
    }

    fn lr_at(&self, t: u64) -> f64 {
        let progress = t as f64 / self.t_max as f64;
        self.eta_min + (self.base_lr - self.eta_min) * (1.0 + (PI * progress).cos()) / 2.0
    }
}

impl LrScheduler for CosineAnnealingLr {
    fn step(&mut self) {
        self.last_epoch += 1;
    }

    fn last_lr(&self) -> f64 {
        self.lr_at(self.last_epoch)
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert_scalar("base_lr", self.base_lr);
        state.insert_scalar("eta_min", self.eta_min);
        state.insert_scalar("t_max", self.t_max as f64);
        state.insert_scalar("last_epoch", self.last_epoch as f64);
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let t_max = state.scalar("t_max")? as u64;
        if t_max == 0 {
            return Err(Error::StateMismatch {
                key: "t_max".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        self.base_lr = state.scalar("base_lr")?;
        self.eta_min = state.scalar("eta_min")?;
        self.t_max = t_max;
        self.last_epoch = state.scalar("last_epoch")? as u64;
        Ok(())
    }
}
