//! AdamW optimizer with decoupled weight decay

use runtime_core::{Error, Result, StateDict, Tensor};
use tracing::debug;

use crate::model::{Optimizer, ParameterSet};

/// AdamW hyperparameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamWConfig {
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

/// First and second moment estimates of one parameter
#[derive(Debug, Clone, PartialEq)]
struct Moments {
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
}

/// AdamW. Moments are keyed by parameter index; parameters themselves stay
/// owned by the model.
#[derive(Debug, Clone)]
pub struct AdamW {
    config: AdamWConfig,
    step: u64,
    moments: Vec<Option<Moments>>,
}

impl AdamW {
    pub fn new(config: AdamWConfig) -> Self {
        Self {
            config,
            step: 0,
            moments: Vec::new(),
        }
    }

    /// Completed update steps
    pub fn steps(&self) -> u64 {
        self.step
    }
}

impl Default for AdamW {
    fn default() -> Self {
        Self::new(AdamWConfig::default())
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, params: &mut ParameterSet, lr: f64) -> Result<()> {
        self.check_parameters(params)?;
        if self.moments.len() < params.len() {
            self.moments.resize(params.len(), None);
        }
        self.step += 1;

        let AdamWConfig {
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config;
        let bias_correction1 = 1.0 - beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - beta2.powi(self.step as i32);
        let step_size = lr / bias_correction1;
        let decay = (1.0 - lr * weight_decay) as f32;

        for (index, param) in params.iter_mut().enumerate() {
            let Some(grad) = param.grad.as_ref() else {
                continue;
            };
            let moments = self.moments[index].get_or_insert_with(|| Moments {
                exp_avg: Tensor::zeros(param.value.shape.clone()),
                exp_avg_sq: Tensor::zeros(param.value.shape.clone()),
            });

            for i in 0..param.value.data.len() {
                let g = grad.data[i] as f64;
                let m = beta1 * moments.exp_avg.data[i] as f64 + (1.0 - beta1) * g;
                let v = beta2 * moments.exp_avg_sq.data[i] as f64 + (1.0 - beta2) * g * g;
                moments.exp_avg.data[i] = m as f32;
                moments.exp_avg_sq.data[i] = v as f32;

                let denom = (v / bias_correction2).sqrt() + eps;
                let p = param.value.data[i] * decay;
                param.value.data[i] = (p as f64 - step_size * m / denom) as f32;
            }
        }

        debug!(step = self.step, lr, "AdamW step");
        Ok(())
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert_scalar("step", self.step as f64);
        for (index, moments) in self.moments.iter().enumerate() {
            if let Some(moments) = moments {
                state.insert_tensor(format!("{}.exp_avg", index), moments.exp_avg.clone());
                state.insert_tensor(format!("{}.exp_avg_sq", index), moments.exp_avg_sq.clone());
            }
        }
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let step = state.scalar("step")?;
        let mut moments: Vec<Option<Moments>> = Vec::new();

        for (key, tensor) in &state.tensors {
            let Some((index, kind)) = key.split_once('.') else {
                return Err(Error::StateMismatch {
                    key: key.clone(),
                    reason: "expected <index>.<moment>".to_string(),
                });
            };
            let index: usize = index.parse().map_err(|_| Error::StateMismatch {
                key: key.clone(),
                reason: "parameter index is not a number".to_string(),
            })?;
            if moments.len() <= index {
                moments.resize(index + 1, None);
            }
            let entry = moments[index].get_or_insert_with(|| Moments {
                exp_avg: Tensor::zeros(tensor.shape.clone()),
                exp_avg_sq: Tensor::zeros(tensor.shape.clone()),
            });
            if entry.exp_avg.shape != tensor.shape || entry.exp_avg_sq.shape != tensor.shape {
                return Err(Error::StateMismatch {
                    key: key.clone(),
                    reason: format!(
                        "shape {:?} differs from the other moment of parameter {}",
                        tensor.shape, index
                    ),
                });
            }
            match kind {
                "exp_avg" => entry.exp_avg = tensor.clone(),
                "exp_avg_sq" => entry.exp_avg_sq = tensor.clone(),
                other => {
                    return Err(Error::StateMismatch {
                        key: key.clone(),
                        reason: format!("unknown moment {}", other),
                    })
                }
            }
        }

        self.step = step as u64;
        self.moments = moments;
        Ok(())
    }

    fn check_parameters(&self, params: &ParameterSet) -> Result<()> {
        if self.moments.len() > params.len() {
            return Err(Error::StateMismatch {
                key: format!("{}.exp_avg", self.moments.len() - 1),
                reason: format!(
                    "optimizer holds moments for {} parameters, model has {}",
                    self.moments.len(),
                    params.len()
                ),
            });
        }
        for (index, (moments, param)) in self.moments.iter().zip(params.iter()).enumerate() {
            let Some(moments) = moments else {
                continue;
            };
            if moments.exp_avg.shape != param.value.shape {
                return Err(Error::StateMismatch {
                    key: format!("{}.exp_avg", index),
                    reason: format!(
                        "moment shape {:?} does not match parameter {} shape {:?}",
                        moments.exp_avg.shape, param.name, param.value.shape
                    ),
                });
            }
        }
        Ok(())
    }
}
