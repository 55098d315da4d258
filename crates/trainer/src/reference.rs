//! Bigram language model used to drive the loop end to end
//!
//! `logits = lm_head · (norm ⊙ embed[token])`, trained with next-token
//! cross-entropy. Parameter names follow the decoder-only transformer
//! convention so the standard sharding plan applies to it with zero layers.

use std::collections::BTreeMap;

use data_shard::Batch;
use parallel::{DeviceMesh, ParamSpec, ShardableModel};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use runtime_core::{Error, Result, Tensor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{Model, ParameterSet};

pub const EMBED_MODULE: &str = "model.embed_tokens";
pub const NORM_MODULE: &str = "model.norm";
pub const HEAD_MODULE: &str = "lm_head";

const EMBED: usize = 0;
const NORM: usize = 1;
const HEAD: usize = 2;

const INIT_RANGE: f32 = 0.02;

/// Shape of a [`BigramLm`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BigramLmConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub max_positions: usize,
}

impl Default for BigramLmConfig {
    fn default() -> Self {
        Self {
            vocab_size: 256,
            hidden_size: 32,
            max_positions: 2048,
        }
    }
}

/// Activations of one predicted position, kept for the backward pass
struct Position {
    token: usize,
    target: usize,
    hidden: Vec<f32>,
    probs: Vec<f32>,
}

pub struct BigramLm {
    config: BigramLmConfig,
    params: ParameterSet,
    cache: Vec<Position>,

    /// Sharded dimension of each tp-sharded parameter
    placements: BTreeMap<String, usize>,
    /// Shape of this rank's slice of each sharded parameter
    local_shapes: BTreeMap<String, Vec<usize>>,
    dp_replicated: bool,
}

impl BigramLm {
    pub fn new(config: BigramLmConfig) -> Result<Self> {
        if config.vocab_size == 0 || config.hidden_size == 0 {
            return Err(Error::InvalidConfig {
                message: format!(
                    "bigram model needs positive sizes, got vocab={} hidden={}",
                    config.vocab_size, config.hidden_size
                ),
            });
        }
        let (v, h) = (config.vocab_size, config.hidden_size);

        let mut params = ParameterSet::new();
        params.add(format!("{}.weight", EMBED_MODULE), Tensor::zeros(vec![v, h]));
        params.add(
            format!("{}.weight", NORM_MODULE),
            Tensor::new(vec![h], vec![1.0; h])?,
        );
        params.add(format!("{}.weight", HEAD_MODULE), Tensor::zeros(vec![v, h]));

        Ok(Self {
            config,
            params,
            cache: Vec::new(),
            placements: BTreeMap::new(),
            local_shapes: BTreeMap::new(),
            dp_replicated: false,
        })
    }

    pub fn config(&self) -> &BigramLmConfig {
        &self.config
    }

    /// Parameters sharded over the tp axis and their shard dimension
    pub fn placements(&self) -> &BTreeMap<String, usize> {
        &self.placements
    }

    pub fn local_shape(&self, name: &str) -> Option<&[usize]> {
        self.local_shapes.get(name).map(Vec::as_slice)
    }

    pub fn is_dp_replicated(&self) -> bool {
        self.dp_replicated
    }

    fn value(&self, index: usize) -> &[f32] {
        self.params
            .get(index)
            .map(|p| p.value.data.as_slice())
            .unwrap_or(&[])
    }
}

impl Model for BigramLm {
    fn forward(&mut self, batch: &Batch) -> Result<f64> {
        let (v, h) = (self.config.vocab_size, self.config.hidden_size);
        let mut cache = Vec::new();
        let mut loss = 0.0f64;

        {
            let embed = self.value(EMBED);
            let gain = self.value(NORM);
            let head = self.value(HEAD);

            for block in &batch.input_ids {
                for pair in block.windows(2) {
                    let (token, target) = (pair[0] as usize, pair[1] as usize);
                    if token >= v || target >= v {
                        return Err(Error::InvalidDataset {
                            message: format!(
                                "token {} outside vocabulary of {}",
                                token.max(target),
                                v
                            ),
                        });
                    }

                    let hidden: Vec<f32> = embed[token * h..(token + 1) * h]
                        .iter()
                        .zip(gain)
                        .map(|(x, g)| x * g)
                        .collect();
                    let logits: Vec<f64> = head
                        .chunks_exact(h)
                        .map(|row| row.iter().zip(&hidden).map(|(w, x)| (w * x) as f64).sum())
                        .collect();

                    let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                    let exp: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
                    let norm: f64 = exp.iter().sum();
                    loss -= (exp[target] / norm).ln();

                    cache.push(Position {
                        token,
                        target,
                        hidden,
                        probs: exp.iter().map(|e| (e / norm) as f32).collect(),
                    });
                }
            }
        }

        if cache.is_empty() {
            return Err(Error::InvalidDataset {
                message: format!("batch {} has no next-token pairs", batch.index),
            });
        }
        let mean = loss / cache.len() as f64;
        self.cache = cache;
        Ok(mean)
    }

    fn backward(&mut self) -> Result<()> {
        if self.cache.is_empty() {
            return Err(Error::Internal {
                message: "backward called without a preceding forward".to_string(),
            });
        }
        let (v, h) = (self.config.vocab_size, self.config.hidden_size);
        let scale = 1.0 / self.cache.len() as f32;

        let mut d_embed = vec![0.0f32; v * h];
        let mut d_gain = vec![0.0f32; h];
        let mut d_head = vec![0.0f32; v * h];
        {
            let embed = self.value(EMBED);
            let gain = self.value(NORM);
            let head = self.value(HEAD);

            let mut d_hidden = vec![0.0f32; h];
            for pos in &self.cache {
                d_hidden.iter_mut().for_each(|d| *d = 0.0);
                for (row, p) in pos.probs.iter().enumerate() {
                    let indicator = if row == pos.target { 1.0 } else { 0.0 };
                    let d_logit = (p - indicator) * scale;
                    let weights = &head[row * h..(row + 1) * h];
                    let grads = &mut d_head[row * h..(row + 1) * h];
                    for j in 0..h {
                        grads[j] += d_logit * pos.hidden[j];
                        d_hidden[j] += d_logit * weights[j];
                    }
                }

                let x = &embed[pos.token * h..(pos.token + 1) * h];
                let grads = &mut d_embed[pos.token * h..(pos.token + 1) * h];
                for j in 0..h {
                    d_gain[j] += d_hidden[j] * x[j];
                    grads[j] += d_hidden[j] * gain[j];
                }
            }
        }

        self.params.accumulate_grad(EMBED, &d_embed)?;
        self.params.accumulate_grad(NORM, &d_gain)?;
        self.params.accumulate_grad(HEAD, &d_head)?;
        self.cache.clear();
        Ok(())
    }

    fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    fn initialize_weights(&mut self, seed: u64) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        for index in [EMBED, HEAD] {
            if let Some(param) = self.params.get_mut(index) {
                for x in param.value.data.iter_mut() {
                    *x = rng.gen_range(-INIT_RANGE..INIT_RANGE);
                }
            }
        }
        if let Some(norm) = self.params.get_mut(NORM) {
            norm.value.data.iter_mut().for_each(|g| *g = 1.0);
        }
        self.params.zero_grad();
        self.cache.clear();
        debug!(seed, parameters = self.params.numel(), "Initialized bigram weights");
    }

    fn max_positions(&self) -> usize {
        self.config.max_positions
    }
}

impl ShardableModel for BigramLm {
    fn module_names(&self) -> Vec<String> {
        [EMBED_MODULE, NORM_MODULE, HEAD_MODULE]
            .iter()
            .map(|m| m.to_string())
            .collect()
    }

    fn parameter_specs(&self) -> Vec<ParamSpec> {
        self.params
            .iter()
            .map(|p| ParamSpec::new(p.name.clone(), p.value.shape.clone()))
            .collect()
    }

    /// Numerics stay replicated; the placement and this rank's slice shape
    /// are recorded for the tensor layer and for checkpoint layout decisions.
    fn shard_parameter(&mut self, name: &str, dim: usize, mesh: &DeviceMesh) -> Result<()> {
        let param = self
            .params
            .index_of(name)
            .and_then(|i| self.params.get(i))
            .ok_or_else(|| Error::UnknownModule {
                name: name.to_string(),
            })?;
        let local = param
            .value
            .chunk(dim, mesh.tp_size(), mesh.tp_rank())
            .map_err(|e| Error::InvalidConfig {
                message: format!(
                    "cannot shard {} of shape {:?} on dim {} over tp={}: {}",
                    name,
                    param.value.shape,
                    dim,
                    mesh.tp_size(),
                    e
                ),
            })?;
        debug!(
            parameter = name,
            dim,
            local_shape = ?local.shape,
            tp_rank = mesh.tp_rank(),
            "Parameter sharded"
        );
        self.placements.insert(name.to_string(), dim);
        self.local_shapes.insert(name.to_string(), local.shape);
        Ok(())
    }

    fn replicate_over_dp(&mut self, mesh: &DeviceMesh) -> Result<()> {
        self.dp_replicated = true;
        debug!(dp_size = mesh.dp_size(), "Bigram model replicated over dp axis");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parallel::{ShardingPlanner, TransformerNames};
    use runtime_core::ClusterTopology;

    fn small() -> BigramLm {
        let mut model = BigramLm::new(BigramLmConfig {
            vocab_size: 8,
            hidden_size: 4,
            max_positions: 16,
        })
        .unwrap();
        model.initialize_weights(7);
        model
    }

    fn batch(tokens: Vec<u32>) -> Batch {
        Batch {
            index: 0,
            sample_indices: vec![0],
            input_ids: vec![tokens],
        }
    }

    #[test]
    fn test_initial_loss_is_near_uniform() {
        let mut model = small();
        let loss = model.forward(&batch(vec![1, 2, 3, 4, 5])).unwrap();
        // tiny weights give near-uniform predictions over 8 tokens
        assert!((loss - (8.0f64).ln()).abs() < 0.01, "loss {}", loss);
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let tokens = vec![3, 1, 4, 1, 5];
        let mut model = small();
        model.forward(&batch(tokens.clone())).unwrap();
        model.backward().unwrap();

        let head = model.parameters().index_of("lm_head.weight").unwrap();
        let analytic = model.parameters().get(head).unwrap().grad.clone().unwrap();

        let eps = 1e-2f32;
        for i in [0usize, 5, 17, 30] {
            let mut plus = small();
            plus.parameters_mut().get_mut(head).unwrap().value.data[i] += eps;
            let mut minus = small();
            minus.parameters_mut().get_mut(head).unwrap().value.data[i] -= eps;

            let numeric = (plus.forward(&batch(tokens.clone())).unwrap()
                - minus.forward(&batch(tokens.clone())).unwrap())
                / (2.0 * eps as f64);
            assert!(
                (numeric - analytic.data[i] as f64).abs() < 1e-3,
                "param {}: numeric {} analytic {}",
                i,
                numeric,
                analytic.data[i]
            );
        }
    }

    #[test]
    fn test_rejects_out_of_vocab_and_empty_batches() {
        let mut model = small();
        assert!(matches!(
            model.forward(&batch(vec![1, 99])),
            Err(Error::InvalidDataset { .. })
        ));
        assert!(model.forward(&batch(vec![1])).is_err());
        assert!(model.backward().is_err());
    }

    #[test]
    fn test_initialize_is_deterministic() {
        let a = small();
        let b = small();
        assert_eq!(a.state_dict(), b.state_dict());
    }

    #[test]
    fn test_sharding_plan_applies() {
        let mut model = small();
        let topology = ClusterTopology::new(1, 1, 2, 2).unwrap();
        let mesh = DeviceMesh::new(topology, 2).unwrap();

        let mut plan = ShardingPlanner::for_transformer(&TransformerNames::default(), 0);
        assert!(plan.check_layouts().is_empty());
        plan.apply(&mut model, &mesh).unwrap();

        assert_eq!(model.placements().get("model.embed_tokens.weight"), Some(&1));
        assert_eq!(model.placements().get("lm_head.weight"), Some(&0));
        assert!(model.placements().get("model.norm.weight").is_none());
        assert!(model.is_dp_replicated());
        assert_eq!(model.local_shape("model.embed_tokens.weight"), Some(&[8, 2][..]));
        assert_eq!(model.local_shape("lm_head.weight"), Some(&[4, 4][..]));

        assert!(matches!(
            plan.apply(&mut model, &mesh),
            Err(Error::ShardingAlreadyApplied)
        ));
    }

    #[test]
    fn test_indivisible_shard_is_rejected() {
        // hidden size 3 cannot be split over tp=2
        let mut model = BigramLm::new(BigramLmConfig {
            vocab_size: 8,
            hidden_size: 3,
            max_positions: 16,
        })
        .unwrap();
        let mesh = DeviceMesh::new(ClusterTopology::new(0, 0, 2, 2).unwrap(), 2).unwrap();
        let err = model
            .shard_parameter("model.embed_tokens.weight", 1, &mesh)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
        assert!(model.placements().is_empty());
    }
}
