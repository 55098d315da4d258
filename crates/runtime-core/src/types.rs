//! Core type definitions for the distributed training harness

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Rank of a participant process
pub type Rank = usize;

/// Training step and epoch counters
pub type Step = u64;
pub type Epoch = u64;

/// Loop progress persisted alongside every checkpoint (`state.json`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Current epoch
    pub epoch: Epoch,

    /// Completed steps across the whole run
    pub global_step: Step,

    /// Completed steps within the current epoch
    pub epoch_step: Step,

    /// Loss accumulated since the last logging interval
    pub running_loss: f64,
}

impl TrainingState {
    /// Record one completed step
    pub fn advance(&mut self, loss: f64) {
        self.global_step += 1;
        self.epoch_step += 1;
        self.running_loss += loss;
    }

    /// Move to the given epoch with a zeroed epoch step
    pub fn begin_epoch(&mut self, epoch: Epoch) {
        self.epoch = epoch;
        self.epoch_step = 0;
    }

    /// Zero the running loss at a logging boundary
    pub fn reset_running_loss(&mut self) {
        self.running_loss = 0.0;
    }
}

/// Dense row-major f32 tensor handed across the model boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    /// Create a tensor, checking that data matches the shape
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::Internal {
                message: format!(
                    "tensor shape {:?} needs {} elements, got {}",
                    shape,
                    expected,
                    data.len()
                ),
            });
        }
        Ok(Self { shape, data })
    }

    /// Zero-filled tensor
    pub fn zeros(shape: Vec<usize>) -> Self {
        let numel = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; numel],
        }
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Take the `index`-th of `parts` equal slices along `dim`
    pub fn chunk(&self, dim: usize, parts: usize, index: usize) -> Result<Self> {
        if dim >= self.shape.len() || parts == 0 || index >= parts {
            return Err(Error::Internal {
                message: format!(
                    "cannot take chunk {}/{} of dim {} from shape {:?}",
                    index, parts, dim, self.shape
                ),
            });
        }
        let size = self.shape[dim];
        if size % parts != 0 {
            return Err(Error::InvalidConfig {
                message: format!(
                    "dimension {} of size {} is not divisible into {} shards",
                    dim, size, parts
                ),
            });
        }

        let chunk = size / parts;
        let outer: usize = self.shape[..dim].iter().product();
        let inner: usize = self.shape[dim + 1..].iter().product();

        let mut data = Vec::with_capacity(outer * chunk * inner);
        for o in 0..outer {
            let start = (o * size + index * chunk) * inner;
            data.extend_from_slice(&self.data[start..start + chunk * inner]);
        }

        let mut shape = self.shape.clone();
        shape[dim] = chunk;
        Ok(Self { shape, data })
    }
}

/// Serializable snapshot of a component's state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    pub tensors: BTreeMap<String, Tensor>,
    pub scalars: BTreeMap<String, f64>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_tensor(&mut self, key: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(key.into(), tensor);
    }

    pub fn insert_scalar(&mut self, key: impl Into<String>, value: f64) {
        self.scalars.insert(key.into(), value);
    }

    /// Look up a tensor, failing if it is absent
    pub fn tensor(&self, key: &str) -> Result<&Tensor> {
        self.tensors.get(key).ok_or_else(|| Error::StateMismatch {
            key: key.to_string(),
            reason: "missing tensor".to_string(),
        })
    }

    /// Look up a tensor and check its shape
    pub fn tensor_with_shape(&self, key: &str, shape: &[usize]) -> Result<&Tensor> {
        let tensor = self.tensor(key)?;
        if tensor.shape != shape {
            return Err(Error::StateMismatch {
                key: key.to_string(),
                reason: format!("expected shape {:?}, found {:?}", shape, tensor.shape),
            });
        }
        Ok(tensor)
    }

    /// Look up a scalar, failing if it is absent
    pub fn scalar(&self, key: &str) -> Result<f64> {
        self.scalars
            .get(key)
            .copied()
            .ok_or_else(|| Error::StateMismatch {
                key: key.to_string(),
                reason: "missing scalar".to_string(),
            })
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty() && self.scalars.is_empty()
    }
}
