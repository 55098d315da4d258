//! Collaborator interfaces consumed by the training loop
//!
//! The model exclusively owns its parameters. Optimizers address them by
//! index into the [`ParameterSet`] and keep only their own auxiliary state.

use data_shard::Batch;
use runtime_core::{Error, Result, StateDict, Tensor};

/// A named parameter and its accumulated gradient
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub value: Tensor,
    pub grad: Option<Tensor>,
}

/// Ordered parameters of a model
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    params: Vec<Parameter>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter and return its index
    pub fn add(&mut self, name: impl Into<String>, value: Tensor) -> usize {
        self.params.push(Parameter {
            name: name.into(),
            value,
            grad: None,
        });
        self.params.len() - 1
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Parameter> {
        self.params.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Parameter> {
        self.params.get_mut(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Parameter> {
        self.params.iter_mut()
    }

    /// Total number of scalar elements
    pub fn numel(&self) -> usize {
        self.params.iter().map(|p| p.value.numel()).sum()
    }

    /// Add `delta` into the gradient of parameter `index`
    pub fn accumulate_grad(&mut self, index: usize, delta: &[f32]) -> Result<()> {
        let param = self.params.get_mut(index).ok_or_else(|| Error::Internal {
            message: format!("no parameter at index {}", index),
        })?;
        if delta.len() != param.value.numel() {
            return Err(Error::Internal {
                message: format!(
                    "gradient for {} has {} elements, parameter has {}",
                    param.name,
                    delta.len(),
                    param.value.numel()
                ),
            });
        }
        let grad = param
            .grad
            .get_or_insert_with(|| Tensor::zeros(param.value.shape.clone()));
        for (g, d) in grad.data.iter_mut().zip(delta) {
            *g += d;
        }
        Ok(())
    }

    /// Drop every gradient
    pub fn zero_grad(&mut self) {
        for param in &mut self.params {
            param.grad = None;
        }
    }

    /// Parameter values keyed by name
    pub fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        for param in &self.params {
            state.insert_tensor(param.name.clone(), param.value.clone());
        }
        state
    }

    /// Overwrite parameter values, requiring every name with a matching shape
    pub fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        for param in &mut self.params {
            let tensor = state.tensor_with_shape(&param.name, &param.value.shape)?;
            param.value = tensor.clone();
            param.grad = None;
        }
        Ok(())
    }
}

/// Opaque model: forward, backward and state access
pub trait Model: Send + Sync {
    /// Compute the mean loss of `batch`, caching what `backward` needs
    fn forward(&mut self, batch: &Batch) -> Result<f64>;

    /// Accumulate gradients of the last forward pass into the parameters
    fn backward(&mut self) -> Result<()>;

    fn parameters(&self) -> &ParameterSet;

    fn parameters_mut(&mut self) -> &mut ParameterSet;

    /// Deterministically (re)initialize every parameter
    fn initialize_weights(&mut self, seed: u64);

    /// Longest sequence the model can attend over
    fn max_positions(&self) -> usize;

    fn state_dict(&self) -> StateDict {
        self.parameters().state_dict()
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        self.parameters_mut().load_state_dict(state)
    }
}

/// Updates parameters from their gradients
pub trait Optimizer: Send + Sync {
    /// Apply one update with learning rate `lr`
    fn step(&mut self, params: &mut ParameterSet, lr: f64) -> Result<()>;

    fn zero_grad(&mut self, params: &mut ParameterSet) {
        params.zero_grad();
    }

    fn state_dict(&self) -> StateDict;

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;

    /// Check that held state fits `params` in count and shape
    fn check_parameters(&self, params: &ParameterSet) -> Result<()>;
}

/// Learning-rate schedule, advanced once per optimizer step
pub trait LrScheduler: Send + Sync {
    fn step(&mut self);

    /// Learning rate for the next optimizer step
    fn last_lr(&self) -> f64;

    fn state_dict(&self) -> StateDict;

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;
}
