//! Everything one rank owns for the duration of a run

use std::sync::Arc;

use checkpoint::{CheckpointLayout, CheckpointManager, CheckpointSnapshot, LoadedCheckpoint};
use data_shard::{BatchSource, DataLoader, EpochSampler, SamplerConfig};
use parallel::{
    Accelerator, DeviceMesh, ShardableModel, ShardingAssignment, ShardingPlanner,
    TransformerNames,
};
use runtime_core::{
    ClusterTopology, Error, ProcessGroupHandle, Result, TrainingConfig, TrainingState,
};
use storage::{LocalStorage, StorageBackend};
use tracing::{info, warn};

use crate::model::{LrScheduler, Model, Optimizer};

/// Model, optimizer, scheduler and loop state of one rank, plus the
/// distributed environment they run in.
///
/// The context owns every component; the optimizer addresses the model's
/// parameters by index and never holds them.
pub struct TrainingContext {
    pub config: TrainingConfig,
    pub topology: ClusterTopology,
    pub mesh: DeviceMesh,
    pub group: ProcessGroupHandle,
    pub accelerator: Arc<dyn Accelerator>,
    pub model: Box<dyn Model>,
    pub optimizer: Box<dyn Optimizer>,
    pub scheduler: Box<dyn LrScheduler>,
    pub state: TrainingState,
}

impl TrainingContext {
    /// Validate the configuration against the mesh and process group, then
    /// bind this process to its device.
    pub fn new(
        config: TrainingConfig,
        mesh: DeviceMesh,
        group: ProcessGroupHandle,
        accelerator: Arc<dyn Accelerator>,
        model: Box<dyn Model>,
        optimizer: Box<dyn Optimizer>,
        scheduler: Box<dyn LrScheduler>,
    ) -> Result<Self> {
        config.validate()?;
        let topology = *mesh.topology();
        if config.tp.unwrap_or(1) != mesh.tp_size() {
            return Err(Error::InvalidConfig {
                message: format!(
                    "configured tp={:?} but the mesh has tp={}",
                    config.tp,
                    mesh.tp_size()
                ),
            });
        }
        if group.world_size() != topology.world_size() || group.rank() != topology.rank() {
            return Err(Error::InvalidTopology {
                message: format!(
                    "process group is rank {} of {}, topology is rank {} of {}",
                    group.rank(),
                    group.world_size(),
                    topology.rank(),
                    topology.world_size()
                ),
            });
        }

        mesh.bind(accelerator.as_ref())?;

        Ok(Self {
            config,
            topology,
            mesh,
            group,
            accelerator,
            model,
            optimizer,
            scheduler,
            state: TrainingState::default(),
        })
    }

    /// Sequence length after clamping to the model's positional range
    pub fn seq_length(&self) -> usize {
        self.config.effective_seq_length(self.model.max_positions())
    }

    /// Loader over this rank's data-parallel partition. Ranks in the same tp
    /// group see the same batches.
    pub fn data_loader(&self, source: Arc<dyn BatchSource>) -> Result<DataLoader> {
        let sampler = EpochSampler::new(
            source.len(),
            self.mesh.dp_size(),
            self.mesh.dp_rank(),
            SamplerConfig {
                shuffle: true,
                drop_last: true,
                seed: self.config.seed,
            },
        )?;
        let loader = DataLoader::new(
            source,
            sampler,
            self.config.batch_size,
            self.config.prefetch_depth,
        )?;
        info!(batches_per_epoch = loader.len(), "Built data loader");
        Ok(loader)
    }

    /// Checkpoint layout for this run: sharded whenever tensor parallelism
    /// is on
    pub fn checkpoint_layout(&self) -> CheckpointLayout {
        match self.config.tp {
            Some(tp) => CheckpointLayout::Sharded {
                world_size: self.topology.world_size(),
                tp,
            },
            None => CheckpointLayout::Simple,
        }
    }

    /// Checkpoint manager over `storage`, whose root is the configured save
    /// directory
    pub fn checkpoint_manager(
        &self,
        storage: Arc<dyn StorageBackend>,
        shared_save_dir: bool,
    ) -> Result<CheckpointManager> {
        Ok(CheckpointManager::new(
            storage,
            self.config.experiment_name.clone(),
            self.checkpoint_layout(),
            Arc::clone(&self.group),
            self.topology,
            self.config.ckpt_freq,
        )?
        .with_shared_save_dir(shared_save_dir))
    }

    /// Checkpoint manager rooted at `save_dir` on the local filesystem.
    ///
    /// Unless configured, the experiment directory counts as shared by every
    /// host when it is a mount point.
    pub fn local_checkpoint_manager(&self) -> Result<CheckpointManager> {
        let storage = LocalStorage::new(&self.config.save_dir);
        let shared = self
            .config
            .shared_save_dir
            .unwrap_or_else(|| storage.is_mount_point(&self.config.experiment_name));
        self.checkpoint_manager(Arc::new(storage), shared)
    }

    /// Apply one optimizer update, advance the schedule and clear gradients
    pub fn update(&mut self) -> Result<()> {
        let lr = self.scheduler.last_lr();
        self.optimizer.step(self.model.parameters_mut(), lr)?;
        self.scheduler.step();
        self.optimizer.zero_grad(self.model.parameters_mut());
        Ok(())
    }

    /// Persist model, optimizer, scheduler and loop state. Collective.
    pub async fn save_checkpoint(&self, manager: &mut CheckpointManager) -> Result<()> {
        let model = self.model.state_dict();
        let optimizer = self.optimizer.state_dict();
        let scheduler = self.scheduler.state_dict();
        manager
            .save(CheckpointSnapshot {
                model: &model,
                optimizer: &optimizer,
                scheduler: &scheduler,
                state: &self.state,
            })
            .await
    }

    /// Restore every component from a loaded checkpoint
    pub fn load_checkpoint(&mut self, loaded: LoadedCheckpoint) -> Result<()> {
        self.model.load_state_dict(&loaded.model)?;
        self.optimizer.load_state_dict(&loaded.optimizer)?;
        self.optimizer.check_parameters(self.model.parameters())?;
        self.scheduler.load_state_dict(&loaded.scheduler)?;
        self.state = loaded.state;
        Ok(())
    }
}

/// Device mesh for `config`: `(dp, tp)` when tensor parallelism is
/// configured, pure data parallelism otherwise
pub fn build_mesh(config: &TrainingConfig, topology: ClusterTopology) -> Result<DeviceMesh> {
    match config.tp {
        Some(tp) => DeviceMesh::new(topology, tp),
        None => Ok(DeviceMesh::data_parallel(topology)),
    }
}

/// Shard `model` with the transformer plan when the mesh has a tp axis.
///
/// Returns the applied assignment, or `None` for pure data parallelism.
pub fn shard_model(
    model: &mut dyn ShardableModel,
    mesh: &DeviceMesh,
    num_layers: usize,
) -> Result<Option<ShardingAssignment>> {
    if mesh.tp_size() <= 1 {
        return Ok(None);
    }
    let mut plan = ShardingPlanner::for_transformer(&TransformerNames::default(), num_layers);
    for mismatch in plan.check_layouts() {
        warn!(
            producer = %mismatch.producer,
            consumer = %mismatch.consumer,
            produced = ?mismatch.produced,
            expected = ?mismatch.expected,
            "Activation layout mismatch in sharding plan"
        );
    }
    plan.apply(model, mesh)?;
    Ok(Some(plan))
}
