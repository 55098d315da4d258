//! Tensor-parallel sharding plan for a decoder-only transformer
//!
//! The plan keeps activations sequence-sharded (`Shard(1)`) between blocks
//! and gathers them to `Replicate` only at the entry of attention and MLP,
//! where the column-split projections need the full sequence. Row-split
//! output projections scatter back to `Shard(1)`. The final projection
//! leaves logits vocab-sharded for a loss computed in parallel.

use std::collections::{BTreeMap, HashSet};

use runtime_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::layout::{Layout, ParameterPlacement, ShardingPolicy, ACTIVATION_RANK};
use crate::mesh::DeviceMesh;

/// Names of the top-level modules of the transformer being planned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformerNames {
    pub embedding: String,
    /// Layers are named `{layer_prefix}.{index}`
    pub layer_prefix: String,
    pub final_norm: String,
    pub lm_head: String,
}

impl Default for TransformerNames {
    fn default() -> Self {
        Self {
            embedding: "model.embed_tokens".to_string(),
            layer_prefix: "model.layers".to_string(),
            final_norm: "model.norm".to_string(),
            lm_head: "lm_head".to_string(),
        }
    }
}

/// Name and shape of a model parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            shape,
        }
    }
}

/// Policy for one named submodule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingRule {
    pub module: String,
    pub policy: ShardingPolicy,
}

/// Adjacent modules whose layouts disagree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutMismatch {
    pub producer: String,
    pub consumer: String,
    pub produced: Layout,
    pub expected: Layout,
}

/// Model surface the sharding plan is applied to
pub trait ShardableModel {
    /// Every named submodule
    fn module_names(&self) -> Vec<String>;

    /// Every parameter with its full, unsharded shape
    fn parameter_specs(&self) -> Vec<ParamSpec>;

    /// Keep only this rank's slice of `name` along `dim`
    fn shard_parameter(&mut self, name: &str, dim: usize, mesh: &DeviceMesh) -> Result<()>;

    /// Wrap the whole tp-sharded model for data parallelism over the dp axis
    fn replicate_over_dp(&mut self, mesh: &DeviceMesh) -> Result<()>;
}

/// Builds sharding assignments
pub struct ShardingPlanner;

impl ShardingPlanner {
    /// The sequence-parallel plan for a `num_layers` transformer
    pub fn for_transformer(names: &TransformerNames, num_layers: usize) -> ShardingAssignment {
        let mut plan = ShardingAssignment::new(names.embedding.clone());

        let mut previous = plan.push(
            &names.embedding,
            ShardingPolicy::ColumnShard {
                input: Layout::Replicate,
                output: Layout::Shard(1),
                use_local_output: true,
            },
        );

        let gather = ShardingPolicy::PrepareInput {
            input: Layout::Shard(1),
            desired: Layout::Replicate,
        };
        let scatter = ShardingPolicy::RowShard {
            input: Layout::Shard(-1),
            output: Layout::Shard(1),
            use_local_output: true,
        };

        for layer in 0..num_layers {
            let prefix = format!("{}.{}", names.layer_prefix, layer);
            let module = |name: &str| format!("{}.{}", prefix, name);

            let input_norm = plan.push(&module("input_layernorm"), ShardingPolicy::SequenceShard);
            plan.connect(previous, input_norm);

            let attn = plan.push(&module("self_attn"), gather);
            plan.connect(input_norm, attn);
            let o_proj_inputs: Vec<usize> = ["q_proj", "k_proj", "v_proj"]
                .iter()
                .map(|proj| {
                    let idx = plan.push(&module(&format!("self_attn.{}", proj)), ShardingPolicy::column());
                    plan.connect(attn, idx);
                    idx
                })
                .collect();
            let o_proj = plan.push(&module("self_attn.o_proj"), scatter);
            for idx in o_proj_inputs {
                plan.connect(idx, o_proj);
            }

            let post_norm = plan.push(&module("post_attention_layernorm"), ShardingPolicy::SequenceShard);
            plan.connect(o_proj, post_norm);

            let mlp = plan.push(&module("mlp"), gather);
            plan.connect(post_norm, mlp);
            let gate = plan.push(&module("mlp.gate_proj"), ShardingPolicy::column());
            let up = plan.push(&module("mlp.up_proj"), ShardingPolicy::column());
            plan.connect(mlp, gate);
            plan.connect(mlp, up);
            let down = plan.push(&module("mlp.down_proj"), scatter);
            plan.connect(gate, down);
            plan.connect(up, down);

            previous = down;
        }

        let norm = plan.push(&names.final_norm, ShardingPolicy::SequenceShard);
        plan.connect(previous, norm);
        let head = plan.push(
            &names.lm_head,
            ShardingPolicy::ColumnShard {
                input: Layout::Shard(1),
                output: Layout::Shard(-1),
                // keep logits distributed for the parallel loss
                use_local_output: false,
            },
        );
        plan.connect(norm, head);

        debug!(num_layers, rules = plan.rules.len(), "Built sharding plan");
        plan
    }
}

/// Ordered module -> policy mapping, applied at most once
#[derive(Debug, Clone)]
pub struct ShardingAssignment {
    rules: Vec<ShardingRule>,

    /// Activation flow between rules, as (producer, consumer) indices
    edges: Vec<(usize, usize)>,

    /// Column-split embeddings shard their weight on the hidden dim
    embedding: String,

    applied: bool,
}

impl ShardingAssignment {
    fn new(embedding: String) -> Self {
        Self {
            rules: Vec::new(),
            edges: Vec::new(),
            embedding,
            applied: false,
        }
    }

    fn push(&mut self, module: &str, policy: ShardingPolicy) -> usize {
        self.rules.push(ShardingRule {
            module: module.to_string(),
            policy,
        });
        self.rules.len() - 1
    }

    fn connect(&mut self, producer: usize, consumer: usize) {
        self.edges.push((producer, consumer));
    }

    pub fn rules(&self) -> &[ShardingRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn is_applied(&self) -> bool {
        self.applied
    }

    pub fn policy(&self, module: &str) -> Option<&ShardingPolicy> {
        self.rules
            .iter()
            .find(|rule| rule.module == module)
            .map(|rule| &rule.policy)
    }

    /// Replace the policy of one module before the plan is applied
    pub fn set_policy(&mut self, module: &str, policy: ShardingPolicy) -> Result<()> {
        if self.applied {
            return Err(Error::ShardingAlreadyApplied);
        }
        let rule = self
            .rules
            .iter_mut()
            .find(|rule| rule.module == module)
            .ok_or_else(|| Error::UnknownModule {
                name: module.to_string(),
            })?;
        rule.policy = policy;
        Ok(())
    }

    /// Activation hand-offs where the producer's output layout differs from
    /// what the consumer expects. Empty for a consistent plan.
    pub fn check_layouts(&self) -> Vec<LayoutMismatch> {
        self.edges
            .iter()
            .filter_map(|&(producer, consumer)| {
                let producer = &self.rules[producer];
                let consumer = &self.rules[consumer];
                let produced = producer.policy.output_layout();
                let expected = consumer.policy.input_layout();
                if produced.matches(expected, ACTIVATION_RANK) {
                    None
                } else {
                    Some(LayoutMismatch {
                        producer: producer.module.clone(),
                        consumer: consumer.module.clone(),
                        produced,
                        expected,
                    })
                }
            })
            .collect()
    }

    /// Rule owning a parameter: the longest module name prefixing it
    fn owner_of(&self, param: &str) -> Option<&ShardingRule> {
        self.rules
            .iter()
            .filter(|rule| {
                param.len() > rule.module.len()
                    && param.starts_with(&rule.module)
                    && param.as_bytes()[rule.module.len()] == b'.'
            })
            .max_by_key(|rule| rule.module.len())
    }

    fn placement_for(&self, rule: Option<&ShardingRule>, param: &str) -> ParameterPlacement {
        let Some(rule) = rule else {
            return ParameterPlacement::Replicated;
        };
        let leaf = &param[rule.module.len() + 1..];
        match (&rule.policy, leaf) {
            (ShardingPolicy::ColumnShard { .. }, "weight") if rule.module == self.embedding => {
                ParameterPlacement::Sharded { dim: 1 }
            }
            (ShardingPolicy::ColumnShard { .. }, "weight" | "bias") => {
                ParameterPlacement::Sharded { dim: 0 }
            }
            (ShardingPolicy::RowShard { .. }, "weight") => ParameterPlacement::Sharded { dim: 1 },
            _ => ParameterPlacement::Replicated,
        }
    }

    /// Placement of every parameter over a tp axis of size `tp`
    pub fn placements(
        &self,
        params: &[ParamSpec],
        tp: usize,
    ) -> Result<BTreeMap<String, ParameterPlacement>> {
        let mut placements = BTreeMap::new();
        for spec in params {
            let placement = self.placement_for(self.owner_of(&spec.name), &spec.name);

            if let ParameterPlacement::Sharded { dim } = placement {
                match spec.shape.get(dim) {
                    Some(size) if size % tp == 0 => {}
                    Some(size) => {
                        return Err(Error::InvalidConfig {
                            message: format!(
                                "{} dim {} of size {} is not divisible by tp={}",
                                spec.name, dim, size, tp
                            ),
                        })
                    }
                    None => {
                        return Err(Error::InvalidConfig {
                            message: format!(
                                "{} has shape {:?}, cannot shard dim {}",
                                spec.name, spec.shape, dim
                            ),
                        })
                    }
                }
            }

            if placements.insert(spec.name.clone(), placement).is_some() {
                return Err(Error::Internal {
                    message: format!("parameter {} listed twice", spec.name),
                });
            }
        }
        Ok(placements)
    }

    /// Shard `model` over the tp axis in plan order, then wrap it for data
    /// parallelism over dp. Fails on a second call.
    pub fn apply(&mut self, model: &mut dyn ShardableModel, mesh: &DeviceMesh) -> Result<()> {
        if self.applied {
            return Err(Error::ShardingAlreadyApplied);
        }

        let modules: HashSet<String> = model.module_names().into_iter().collect();
        if let Some(rule) = self.rules.iter().find(|rule| !modules.contains(&rule.module)) {
            return Err(Error::UnknownModule {
                name: rule.module.clone(),
            });
        }

        let specs = model.parameter_specs();
        let placements = self.placements(&specs, mesh.tp_size())?;
        self.applied = true;

        let mut sharded = 0usize;
        for rule in &self.rules {
            for spec in &specs {
                let owned = self
                    .owner_of(&spec.name)
                    .is_some_and(|owner| owner.module == rule.module);
                if !owned {
                    continue;
                }
                if let Some(ParameterPlacement::Sharded { dim }) = placements.get(&spec.name) {
                    model.shard_parameter(&spec.name, *dim, mesh)?;
                    sharded += 1;
                }
            }
        }

        model.replicate_over_dp(mesh)?;

        info!(
            modules = self.rules.len(),
            parameters = specs.len(),
            sharded_parameters = sharded,
            tp_size = mesh.tp_size(),
            dp_size = mesh.dp_size(),
            "Applied sharding plan"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime_core::ClusterTopology;

    const HIDDEN: usize = 8;
    const VOCAB: usize = 16;

    fn llama_params(num_layers: usize) -> Vec<ParamSpec> {
        let mut params = vec![ParamSpec::new("model.embed_tokens.weight", vec![VOCAB, HIDDEN])];
        for layer in 0..num_layers {
            let p = |name: &str| format!("model.layers.{}.{}", layer, name);
            params.push(ParamSpec::new(p("input_layernorm.weight"), vec![HIDDEN]));
            for proj in ["q_proj", "k_proj", "v_proj"] {
                params.push(ParamSpec::new(p(&format!("self_attn.{}.weight", proj)), vec![HIDDEN, HIDDEN]));
            }
            params.push(ParamSpec::new(p("self_attn.o_proj.weight"), vec![HIDDEN, HIDDEN]));
            params.push(ParamSpec::new(p("self_attn.o_proj.bias"), vec![HIDDEN]));
            params.push(ParamSpec::new(p("post_attention_layernorm.weight"), vec![HIDDEN]));
            params.push(ParamSpec::new(p("mlp.gate_proj.weight"), vec![2 * HIDDEN, HIDDEN]));
            params.push(ParamSpec::new(p("mlp.up_proj.weight"), vec![2 * HIDDEN, HIDDEN]));
            params.push(ParamSpec::new(p("mlp.down_proj.weight"), vec![HIDDEN, 2 * HIDDEN]));
        }
        params.push(ParamSpec::new("model.norm.weight", vec![HIDDEN]));
        params.push(ParamSpec::new("lm_head.weight", vec![VOCAB, HIDDEN]));
        params
    }

    struct RecordingModel {
        modules: Vec<String>,
        params: Vec<ParamSpec>,
        sharded: Vec<(String, usize)>,
        dp_wrapped: bool,
    }

    impl RecordingModel {
        fn llama(num_layers: usize) -> Self {
            let plan = ShardingPlanner::for_transformer(&TransformerNames::default(), num_layers);
            Self {
                modules: plan.rules().iter().map(|r| r.module.clone()).collect(),
                params: llama_params(num_layers),
                sharded: Vec::new(),
                dp_wrapped: false,
            }
        }
    }

    impl ShardableModel for RecordingModel {
        fn module_names(&self) -> Vec<String> {
            self.modules.clone()
        }

        fn parameter_specs(&self) -> Vec<ParamSpec> {
            self.params.clone()
        }

        fn shard_parameter(&mut self, name: &str, dim: usize, _mesh: &DeviceMesh) -> Result<()> {
            self.sharded.push((name.to_string(), dim));
            Ok(())
        }

        fn replicate_over_dp(&mut self, _mesh: &DeviceMesh) -> Result<()> {
            self.dp_wrapped = true;
            Ok(())
        }
    }

    fn mesh() -> DeviceMesh {
        DeviceMesh::new(ClusterTopology::new(1, 1, 4, 4).unwrap(), 2).unwrap()
    }

    #[test]
    fn test_plan_order_and_policies() {
        let plan = ShardingPlanner::for_transformer(&TransformerNames::default(), 2);
        assert_eq!(plan.len(), 1 + 2 * 11 + 2);
        assert_eq!(plan.rules()[0].module, "model.embed_tokens");
        assert_eq!(plan.rules()[1].module, "model.layers.0.input_layernorm");
        assert_eq!(plan.rules().last().unwrap().module, "lm_head");

        assert_eq!(
            plan.policy("model.layers.1.self_attn.o_proj"),
            Some(&ShardingPolicy::RowShard {
                input: Layout::Shard(-1),
                output: Layout::Shard(1),
                use_local_output: true,
            })
        );
        assert_eq!(
            plan.policy("lm_head"),
            Some(&ShardingPolicy::ColumnShard {
                input: Layout::Shard(1),
                output: Layout::Shard(-1),
                use_local_output: false,
            })
        );
        assert_eq!(
            plan.policy("model.layers.0.mlp"),
            Some(&ShardingPolicy::PrepareInput {
                input: Layout::Shard(1),
                desired: Layout::Replicate,
            })
        );
    }

    #[test]
    fn test_plan_layouts_are_consistent() {
        let mut plan = ShardingPlanner::for_transformer(&TransformerNames::default(), 3);
        assert!(plan.check_layouts().is_empty());

        // without the gather, the MLP would receive sequence-sharded input
        plan.set_policy("model.layers.1.mlp", ShardingPolicy::Replicate)
            .unwrap();
        let mismatches = plan.check_layouts();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].producer, "model.layers.1.post_attention_layernorm");
        assert_eq!(mismatches[0].consumer, "model.layers.1.mlp");
        assert_eq!(mismatches[0].produced, Layout::Shard(1));

        assert!(matches!(
            plan.set_policy("model.layers.9.mlp", ShardingPolicy::Replicate),
            Err(Error::UnknownModule { .. })
        ));
    }

    #[test]
    fn test_every_parameter_gets_one_placement() {
        let plan = ShardingPlanner::for_transformer(&TransformerNames::default(), 2);
        let params = llama_params(2);
        let placements = plan.placements(&params, 2).unwrap();

        assert_eq!(placements.len(), params.len());
        let sharded = |dim| ParameterPlacement::Sharded { dim };
        assert_eq!(placements["model.embed_tokens.weight"], sharded(1));
        assert_eq!(placements["model.layers.0.self_attn.q_proj.weight"], sharded(0));
        assert_eq!(placements["model.layers.0.self_attn.o_proj.weight"], sharded(1));
        assert_eq!(
            placements["model.layers.0.self_attn.o_proj.bias"],
            ParameterPlacement::Replicated
        );
        assert_eq!(placements["model.layers.1.mlp.down_proj.weight"], sharded(1));
        assert_eq!(
            placements["model.layers.1.input_layernorm.weight"],
            ParameterPlacement::Replicated
        );
        assert_eq!(placements["model.norm.weight"], ParameterPlacement::Replicated);
        assert_eq!(placements["lm_head.weight"], sharded(0));
    }

    #[test]
    fn test_indivisible_parameter_rejected() {
        let plan = ShardingPlanner::for_transformer(&TransformerNames::default(), 1);
        let result = plan.placements(&llama_params(1), 3);
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_apply_once() {
        let mut plan = ShardingPlanner::for_transformer(&TransformerNames::default(), 1);
        let mut model = RecordingModel::llama(1);

        plan.apply(&mut model, &mesh()).unwrap();
        assert!(plan.is_applied());
        assert!(model.dp_wrapped);
        // embed, q, k, v, o, gate, up, down, lm_head
        assert_eq!(model.sharded.len(), 9);
        assert_eq!(model.sharded[0], ("model.embed_tokens.weight".to_string(), 1));
        assert_eq!(model.sharded.last().unwrap().0, "lm_head.weight");

        assert!(matches!(
            plan.apply(&mut model, &mesh()),
            Err(Error::ShardingAlreadyApplied)
        ));
        assert_eq!(model.sharded.len(), 9);
        assert!(plan.set_policy("lm_head", ShardingPolicy::Replicate).is_err());
    }

    #[test]
    fn test_apply_rejects_unknown_module() {
        let mut plan = ShardingPlanner::for_transformer(&TransformerNames::default(), 2);
        let mut model = RecordingModel::llama(1);

        assert!(matches!(
            plan.apply(&mut model, &mesh()),
            Err(Error::UnknownModule { .. })
        ));
        assert!(!plan.is_applied());
        assert!(model.sharded.is_empty());
    }
}
