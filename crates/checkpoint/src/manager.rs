//! Checkpoint manager coordinating save and resume across ranks
//!
//! The manager is a small state machine:
//!
//! ```text
//! Fresh -> Resuming -> Running <-> Checkpointing
//!   \_________________/^                  any -> Terminated
//! ```
//!
//! `state.json` is the commit marker. It is written last, after every other
//! file of the checkpoint is durable, and its presence means "resume".

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use runtime_core::{
    ClusterTopology, Error, ProcessGroupHandle, Rank, Result, StateDict, TrainingState,
};
use storage::StorageBackend;
use tracing::{debug, info, instrument, warn};

use crate::layout::{
    CheckpointLayout, ShardedMetadata, METADATA_FILE, MODEL_FILE, OPTIMIZER_FILE, SHARD_DIR,
    STATE_FILE,
};
use crate::writer::{decode_shard, encode_shard, ShardHeader, ShardKind, CHECKPOINT_VERSION};

/// Lifecycle of a run with respect to its checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointPhase {
    /// No checkpoint has been loaded or written by this process
    Fresh,

    /// Loading an existing checkpoint
    Resuming,

    /// Training steps are executing
    Running,

    /// A checkpoint is being written
    Checkpointing,

    /// The run has ended
    Terminated,
}

impl fmt::Display for CheckpointPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckpointPhase::Fresh => "fresh",
            CheckpointPhase::Resuming => "resuming",
            CheckpointPhase::Running => "running",
            CheckpointPhase::Checkpointing => "checkpointing",
            CheckpointPhase::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

impl CheckpointPhase {
    fn can_transition_to(self, to: CheckpointPhase) -> bool {
        use CheckpointPhase::*;
        matches!(
            (self, to),
            (Fresh, Resuming)
                | (Fresh, Running)
                | (Resuming, Running)
                | (Running, Checkpointing)
                | (Checkpointing, Running)
                | (_, Terminated)
        )
    }
}

/// What `probe` found in the experiment directory
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    /// No `state.json`: start from step zero
    Fresh,

    /// A complete checkpoint committed at the contained state
    Resumable(TrainingState),
}

/// State restored by `resume`, to be loaded into the caller's components
#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    pub model: StateDict,
    pub optimizer: StateDict,
    pub scheduler: StateDict,
    pub state: TrainingState,
}

/// Borrowed view of everything a checkpoint persists
#[derive(Debug, Clone, Copy)]
pub struct CheckpointSnapshot<'a> {
    pub model: &'a StateDict,
    pub optimizer: &'a StateDict,
    pub scheduler: &'a StateDict,
    pub state: &'a TrainingState,
}

/// Saves and restores the checkpoint of one experiment directory.
///
/// Every rank owns a manager; `save`, `resume` and `prepare_directory` are
/// collective and must be called by all ranks in the same order.
pub struct CheckpointManager {
    storage: Arc<dyn StorageBackend>,

    /// Experiment directory, relative to the storage root
    experiment: String,

    layout: CheckpointLayout,
    group: ProcessGroupHandle,
    topology: ClusterTopology,
    ckpt_freq: u64,

    /// Whether every host sees the same save directory
    shared_save_dir: bool,

    phase: CheckpointPhase,
}

impl CheckpointManager {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        experiment: impl Into<String>,
        layout: CheckpointLayout,
        group: ProcessGroupHandle,
        topology: ClusterTopology,
        ckpt_freq: u64,
    ) -> Result<Self> {
        if ckpt_freq == 0 {
            return Err(Error::InvalidConfig {
                message: "ckpt_freq must be positive".to_string(),
            });
        }
        if group.world_size() != topology.world_size() {
            return Err(Error::InvalidTopology {
                message: format!(
                    "process group has {} members but topology world_size is {}",
                    group.world_size(),
                    topology.world_size()
                ),
            });
        }
        if let CheckpointLayout::Sharded { world_size, .. } = layout {
            if world_size != topology.world_size() {
                return Err(Error::InvalidTopology {
                    message: format!(
                        "sharded layout expects {} ranks, topology has {}",
                        world_size,
                        topology.world_size()
                    ),
                });
            }
        }

        Ok(Self {
            storage,
            experiment: experiment.into(),
            layout,
            group,
            topology,
            ckpt_freq,
            shared_save_dir: false,
            phase: CheckpointPhase::Fresh,
        })
    }

    /// Mark the save directory as shared by every host, so that only global
    /// rank 0 creates directories in it
    pub fn with_shared_save_dir(mut self, shared: bool) -> Self {
        self.shared_save_dir = shared;
        self
    }

    pub fn phase(&self) -> CheckpointPhase {
        self.phase
    }

    pub fn layout(&self) -> CheckpointLayout {
        self.layout
    }

    /// Location of the experiment directory, for diagnostics
    pub fn experiment_dir(&self) -> String {
        self.storage.describe(&self.experiment)
    }

    fn path(&self, file: &str) -> String {
        if self.experiment.is_empty() {
            file.to_string()
        } else {
            format!("{}/{}", self.experiment, file)
        }
    }

    fn transition(&mut self, to: CheckpointPhase) -> Result<()> {
        if !self.phase.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.phase.to_string(),
                to: to.to_string(),
            });
        }
        debug!(from = %self.phase, to = %to, "Checkpoint phase transition");
        self.phase = to;
        Ok(())
    }

    /// Whether this process creates directories on its filesystem mount
    pub fn is_designated_creator(&self) -> bool {
        if self.shared_save_dir {
            self.topology.is_global_leader()
        } else {
            self.topology.is_local_leader()
        }
    }

    /// Create the experiment directory, once per filesystem mount
    #[instrument(skip(self), fields(rank = self.topology.rank()))]
    pub async fn prepare_directory(&self) -> Result<()> {
        self.group.barrier().await?;
        if self.is_designated_creator() {
            self.storage.create_dir(&self.experiment).await?;
            info!(
                experiment_dir = %self.experiment_dir(),
                shared = self.shared_save_dir,
                "Created experiment directory"
            );
        }
        self.group.barrier().await
    }

    /// Inspect the experiment directory without loading anything.
    ///
    /// A directory with `state.json` but missing any other file is an error,
    /// never a fresh start.
    pub async fn probe(&self) -> Result<ResumeOutcome> {
        let state_path = self.path(STATE_FILE);
        if !self.storage.exists(&state_path).await? {
            debug!(experiment_dir = %self.experiment_dir(), "No committed checkpoint");
            return Ok(ResumeOutcome::Fresh);
        }

        let mut missing = Vec::new();
        for file in self.layout.required_files() {
            if !self.storage.exists(&self.path(&file)).await? {
                missing.push(file);
            }
        }
        if !missing.is_empty() {
            return Err(Error::CheckpointIncomplete {
                path: self.experiment_dir(),
                missing,
            });
        }

        let raw = self.storage.read(&state_path).await?;
        let state: TrainingState =
            serde_json::from_slice(&raw).map_err(|e| Error::CheckpointCorrupted {
                path: self.storage.describe(&state_path),
                reason: e.to_string(),
            })?;
        Ok(ResumeOutcome::Resumable(state))
    }

    /// Begin a run from step zero
    pub fn start_fresh(&mut self) -> Result<()> {
        self.transition(CheckpointPhase::Running)?;
        info!(experiment_dir = %self.experiment_dir(), "Starting fresh run");
        Ok(())
    }

    /// Load the committed checkpoint. Collective.
    #[instrument(skip(self), fields(rank = self.topology.rank()))]
    pub async fn resume(&mut self) -> Result<LoadedCheckpoint> {
        self.transition(CheckpointPhase::Resuming)?;
        let start = Instant::now();

        let state = match self.probe().await? {
            ResumeOutcome::Resumable(state) => state,
            ResumeOutcome::Fresh => {
                return Err(Error::CheckpointNotFound {
                    path: self.storage.describe(&self.path(STATE_FILE)),
                })
            }
        };

        if let CheckpointLayout::Sharded { world_size, tp } = self.layout {
            self.check_metadata(world_size, tp, &state).await?;
        }

        let own_rank = if self.layout.is_sharded() {
            self.topology.rank()
        } else {
            0
        };
        let model = self.read_state(ShardKind::Model, own_rank, &state).await?;
        let optimizer = self
            .read_state(ShardKind::Optimizer, own_rank, &state)
            .await?;
        let scheduler = self.read_state(ShardKind::Scheduler, 0, &state).await?;

        self.group.barrier().await?;
        self.transition(CheckpointPhase::Running)?;

        info!(
            epoch = state.epoch,
            global_step = state.global_step,
            epoch_step = state.epoch_step,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Resumed from checkpoint"
        );

        Ok(LoadedCheckpoint {
            model,
            optimizer,
            scheduler,
            state,
        })
    }

    async fn check_metadata(&self, world_size: usize, tp: usize, state: &TrainingState) -> Result<()> {
        let path = self.path(METADATA_FILE);
        let raw = self.storage.read(&path).await?;
        let metadata: ShardedMetadata =
            serde_json::from_slice(&raw).map_err(|e| Error::CheckpointCorrupted {
                path: self.storage.describe(&path),
                reason: e.to_string(),
            })?;

        if metadata.world_size != world_size || metadata.tp != tp {
            return Err(Error::StateMismatch {
                key: "mesh".to_string(),
                reason: format!(
                    "checkpoint written with world_size={} tp={}, current run has world_size={} tp={}",
                    metadata.world_size, metadata.tp, world_size, tp
                ),
            });
        }
        if metadata.global_step != state.global_step {
            return Err(Error::CheckpointCorrupted {
                path: self.storage.describe(&path),
                reason: format!(
                    "metadata is from step {}, state.json from step {}",
                    metadata.global_step, state.global_step
                ),
            });
        }
        Ok(())
    }

    async fn read_state(
        &self,
        kind: ShardKind,
        rank: Rank,
        state: &TrainingState,
    ) -> Result<StateDict> {
        let path = self.path(&self.layout.shard_file(kind, rank));
        let display = self.storage.describe(&path);
        let raw = self.storage.read(&path).await?;
        let (header, dict) = decode_shard(&display, raw)?;

        let corrupted = |reason: String| Error::CheckpointCorrupted {
            path: display.clone(),
            reason,
        };
        if header.kind != kind {
            return Err(corrupted(format!(
                "expected {} state, found {}",
                kind.file_stem(),
                header.kind.file_stem()
            )));
        }
        if header.rank != rank {
            return Err(corrupted(format!(
                "expected shard of rank {}, found rank {}",
                rank, header.rank
            )));
        }
        if header.step != state.global_step {
            return Err(corrupted(format!(
                "written at step {}, state.json is at step {}",
                header.step, state.global_step
            )));
        }
        Ok(dict)
    }

    /// Whether a checkpoint is due after completing `global_step`
    pub fn should_checkpoint(&self, global_step: u64) -> bool {
        global_step > 0 && global_step % self.ckpt_freq == 0
    }

    /// Persist a checkpoint. Collective.
    ///
    /// Order: barrier, per-rank shards, barrier, shared files with
    /// `state.json` last, barrier.
    #[instrument(skip(self, snapshot), fields(rank = self.topology.rank(), global_step = snapshot.state.global_step))]
    pub async fn save(&mut self, snapshot: CheckpointSnapshot<'_>) -> Result<()> {
        self.transition(CheckpointPhase::Checkpointing)?;
        let start = Instant::now();
        let state = snapshot.state;
        let rank = self.topology.rank();
        let mut size_bytes = 0u64;

        self.group.barrier().await?;

        if self.layout.is_sharded() {
            size_bytes += self
                .write_state(ShardKind::Model, rank, snapshot.model, state)
                .await?;
            size_bytes += self
                .write_state(ShardKind::Optimizer, rank, snapshot.optimizer, state)
                .await?;
        }

        self.group.barrier().await?;

        if self.topology.is_global_leader() {
            match self.layout {
                CheckpointLayout::Simple => {
                    size_bytes += self
                        .write_state(ShardKind::Model, 0, snapshot.model, state)
                        .await?;
                    size_bytes += self
                        .write_state(ShardKind::Optimizer, 0, snapshot.optimizer, state)
                        .await?;
                }
                CheckpointLayout::Sharded { world_size, tp } => {
                    let metadata = ShardedMetadata {
                        format_version: CHECKPOINT_VERSION,
                        world_size,
                        tp,
                        global_step: state.global_step,
                        saved_at: Utc::now(),
                    };
                    let data = serde_json::to_vec_pretty(&metadata)?;
                    size_bytes += self
                        .storage
                        .write(&self.path(METADATA_FILE), Bytes::from(data))
                        .await?;
                }
            }

            size_bytes += self
                .write_state(ShardKind::Scheduler, 0, snapshot.scheduler, state)
                .await?;

            let data = serde_json::to_vec(state)?;
            size_bytes += self
                .storage
                .write(&self.path(STATE_FILE), Bytes::from(data))
                .await?;

            self.prune_stale_files().await?;
        }

        self.group.barrier().await?;
        self.transition(CheckpointPhase::Running)?;

        let elapsed = start.elapsed();
        info!(
            epoch = state.epoch,
            global_step = state.global_step,
            epoch_step = state.epoch_step,
            size_bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            "Checkpoint saved"
        );
        Ok(())
    }

    async fn write_state(
        &self,
        kind: ShardKind,
        rank: Rank,
        dict: &StateDict,
        state: &TrainingState,
    ) -> Result<u64> {
        let header = ShardHeader::new(kind, rank, state.global_step, state.epoch);
        let data = encode_shard(header, dict)?;
        self.storage
            .write(&self.path(&self.layout.shard_file(kind, rank)), data)
            .await
    }

    /// Delete model and optimizer files the current layout does not name.
    ///
    /// They come from an earlier, never committed, attempt with a different
    /// layout or world size. Runs on the global leader after the commit
    /// marker is written, while every other rank waits at the barrier.
    async fn prune_stale_files(&self) -> Result<usize> {
        let keep: HashSet<String> = self
            .layout
            .required_files()
            .iter()
            .map(|file| self.path(file))
            .collect();
        let prefix = self.path("");
        let shard_prefix = format!("{}/", SHARD_DIR);

        let mut removed = 0;
        for file in self.storage.list(&prefix).await? {
            let relative = file.strip_prefix(&prefix).unwrap_or(&file);
            let is_checkpoint_file = relative == MODEL_FILE
                || relative == OPTIMIZER_FILE
                || relative.starts_with(&shard_prefix);
            if is_checkpoint_file && !keep.contains(&file) {
                self.storage.delete(&file).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Pruned stale checkpoint files");
        }
        Ok(removed)
    }

    /// End the run. Idempotent.
    pub fn finish(&mut self) {
        if self.phase == CheckpointPhase::Checkpointing {
            warn!("Run terminated while a checkpoint was being written");
        }
        self.phase = CheckpointPhase::Terminated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime_core::{LocalProcessGroup, ProcessGroup, SingleProcessGroup, Tensor};
    use storage::LocalStorage;
    use tempfile::TempDir;

    fn single_manager(dir: &TempDir) -> CheckpointManager {
        CheckpointManager::new(
            Arc::new(LocalStorage::new(dir.path())),
            "exp",
            CheckpointLayout::Simple,
            Arc::new(SingleProcessGroup),
            ClusterTopology::single(),
            500,
        )
        .unwrap()
    }

    fn dicts(seed: f32) -> (StateDict, StateDict, StateDict) {
        let mut model = StateDict::new();
        model.insert_tensor(
            "lm_head.weight",
            Tensor::new(vec![2, 2], vec![seed, seed / 3.0, -seed, 1e-8]).unwrap(),
        );
        let mut optimizer = StateDict::new();
        optimizer.insert_tensor("0.exp_avg", Tensor::new(vec![2], vec![seed * 0.1, 0.7]).unwrap());
        optimizer.insert_scalar("step", 500.0);
        let mut scheduler = StateDict::new();
        scheduler.insert_scalar("last_epoch", 500.0);
        (model, optimizer, scheduler)
    }

    async fn save_at(manager: &mut CheckpointManager, state: TrainingState, seed: f32) {
        let (model, optimizer, scheduler) = dicts(seed);
        manager
            .save(CheckpointSnapshot {
                model: &model,
                optimizer: &optimizer,
                scheduler: &scheduler,
                state: &state,
            })
            .await
            .unwrap();
    }

    fn state_at(global_step: u64) -> TrainingState {
        TrainingState {
            epoch: 2,
            global_step,
            epoch_step: 30,
            running_loss: 0.0,
        }
    }

    #[tokio::test]
    async fn test_fresh_directory() {
        let dir = TempDir::new().unwrap();
        let mut manager = single_manager(&dir);

        manager.prepare_directory().await.unwrap();
        assert!(dir.path().join("exp").is_dir());
        assert_eq!(manager.probe().await.unwrap(), ResumeOutcome::Fresh);

        manager.start_fresh().unwrap();
        assert_eq!(manager.phase(), CheckpointPhase::Running);
    }

    #[tokio::test]
    async fn test_save_then_resume_is_bit_identical() {
        let dir = TempDir::new().unwrap();
        let mut manager = single_manager(&dir);
        manager.start_fresh().unwrap();
        save_at(&mut manager, state_at(150), 0.123).await;
        manager.finish();

        let mut resumed = single_manager(&dir);
        assert_eq!(
            resumed.probe().await.unwrap(),
            ResumeOutcome::Resumable(state_at(150))
        );
        let loaded = resumed.resume().await.unwrap();
        assert_eq!(resumed.phase(), CheckpointPhase::Running);

        let (model, optimizer, scheduler) = dicts(0.123);
        assert_eq!(loaded.state, state_at(150));
        assert_eq!(loaded.model, model);
        assert_eq!(loaded.optimizer, optimizer);
        assert_eq!(loaded.scheduler, scheduler);
    }

    #[tokio::test]
    async fn test_commit_prunes_files_of_other_layouts() {
        let dir = TempDir::new().unwrap();
        let exp = dir.path().join("exp");
        std::fs::create_dir_all(exp.join("checkpoint")).unwrap();
        // shards of an uncommitted sharded attempt
        std::fs::write(exp.join("checkpoint/model-rank00003.bin"), b"stale").unwrap();
        std::fs::write(exp.join("checkpoint/.metadata"), b"{}").unwrap();
        std::fs::write(exp.join("metrics.jsonl"), b"{}\n").unwrap();

        let mut manager = single_manager(&dir);
        manager.start_fresh().unwrap();
        save_at(&mut manager, state_at(500), 1.0).await;

        assert!(!exp.join("checkpoint/model-rank00003.bin").exists());
        assert!(!exp.join("checkpoint/.metadata").exists());
        assert!(exp.join("metrics.jsonl").exists());
        for file in ["model.pt", "optimizer.pt", "lr_scheduler.pt", "state.json"] {
            assert!(exp.join(file).exists(), "{} was removed", file);
        }

        let mut resumed = single_manager(&dir);
        assert!(resumed.resume().await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_file_is_incomplete() {
        let dir = TempDir::new().unwrap();
        let mut manager = single_manager(&dir);
        manager.start_fresh().unwrap();
        save_at(&mut manager, state_at(500), 1.0).await;

        std::fs::remove_file(dir.path().join("exp/optimizer.pt")).unwrap();

        let mut resumed = single_manager(&dir);
        match resumed.resume().await {
            Err(Error::CheckpointIncomplete { missing, .. }) => {
                assert_eq!(missing, vec!["optimizer.pt".to_string()]);
            }
            other => panic!("expected incomplete checkpoint, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mixed_step_files_are_corrupted() {
        let dir = TempDir::new().unwrap();
        let mut manager = single_manager(&dir);
        manager.start_fresh().unwrap();
        save_at(&mut manager, state_at(500), 1.0).await;
        let stale_state = std::fs::read(dir.path().join("exp/state.json")).unwrap();
        save_at(&mut manager, state_at(1000), 2.0).await;

        // state.json from the earlier save next to shards from the later one
        std::fs::write(dir.path().join("exp/state.json"), stale_state).unwrap();

        let mut resumed = single_manager(&dir);
        let err = resumed.resume().await.unwrap_err();
        assert!(matches!(err, Error::CheckpointCorrupted { .. }));
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let dir = TempDir::new().unwrap();
        let mut manager = single_manager(&dir);

        let (model, optimizer, scheduler) = dicts(1.0);
        let state = state_at(500);
        let err = manager
            .save(CheckpointSnapshot {
                model: &model,
                optimizer: &optimizer,
                scheduler: &scheduler,
                state: &state,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        manager.start_fresh().unwrap();
        assert!(matches!(
            manager.resume().await,
            Err(Error::InvalidTransition { .. })
        ));

        manager.finish();
        assert_eq!(manager.phase(), CheckpointPhase::Terminated);
        assert!(manager.start_fresh().is_err());
    }

    #[tokio::test]
    async fn test_resume_without_checkpoint() {
        let dir = TempDir::new().unwrap();
        let mut manager = single_manager(&dir);
        assert!(matches!(
            manager.resume().await,
            Err(Error::CheckpointNotFound { .. })
        ));
    }

    #[test]
    fn test_should_checkpoint() {
        let dir = TempDir::new().unwrap();
        let manager = single_manager(&dir);
        assert!(!manager.should_checkpoint(0));
        assert!(!manager.should_checkpoint(499));
        assert!(manager.should_checkpoint(500));
        assert!(manager.should_checkpoint(1000));
    }

    #[tokio::test]
    async fn test_sharded_save_and_resume() {
        let dir = TempDir::new().unwrap();
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path()));
        let layout = CheckpointLayout::Sharded {
            world_size: 2,
            tp: 2,
        };

        let groups = LocalProcessGroup::create(2).unwrap();
        let mut handles = Vec::new();
        for group in groups {
            let storage = Arc::clone(&storage);
            handles.push(tokio::spawn(async move {
                let rank = group.rank();
                let topology = ClusterTopology::new(rank, rank, 2, 2).unwrap();
                let group: ProcessGroupHandle = Arc::new(group);
                let mut manager = CheckpointManager::new(
                    Arc::clone(&storage),
                    "exp",
                    layout,
                    Arc::clone(&group),
                    topology,
                    100,
                )
                .unwrap();
                manager.prepare_directory().await.unwrap();
                manager.start_fresh().unwrap();
                save_at(&mut manager, state_at(100), rank as f32 + 1.0).await;
                manager.finish();

                let mut resumed =
                    CheckpointManager::new(storage, "exp", layout, group, topology, 100).unwrap();
                resumed.resume().await.unwrap()
            }));
        }

        for (rank, handle) in handles.into_iter().enumerate() {
            let loaded = handle.await.unwrap();
            let (model, optimizer, _) = dicts(rank as f32 + 1.0);
            assert_eq!(loaded.model, model);
            assert_eq!(loaded.optimizer, optimizer);
            assert_eq!(loaded.state.global_step, 100);
        }
        assert!(dir.path().join("exp/checkpoint/.metadata").exists());
        assert!(dir.path().join("exp/checkpoint/model-rank00001.bin").exists());
    }

    #[tokio::test]
    async fn test_sharded_resume_rejects_other_mesh() {
        let dir = TempDir::new().unwrap();
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path()));
        let metadata = ShardedMetadata {
            format_version: CHECKPOINT_VERSION,
            world_size: 1,
            tp: 4,
            global_step: 100,
            saved_at: Utc::now(),
        };
        storage
            .write("exp/checkpoint/.metadata", Bytes::from(serde_json::to_vec(&metadata).unwrap()))
            .await
            .unwrap();
        for file in ["checkpoint/model-rank00000.bin", "checkpoint/optimizer-rank00000.bin", "lr_scheduler.pt"] {
            storage
                .write(&format!("exp/{}", file), Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
        storage
            .write("exp/state.json", Bytes::from(serde_json::to_vec(&state_at(100)).unwrap()))
            .await
            .unwrap();

        let mut manager = CheckpointManager::new(
            storage,
            "exp",
            CheckpointLayout::Sharded {
                world_size: 1,
                tp: 2,
            },
            Arc::new(SingleProcessGroup),
            ClusterTopology::single(),
            100,
        )
        .unwrap();
        assert!(matches!(
            manager.resume().await,
            Err(Error::StateMismatch { .. })
        ));
    }

    #[test]
    fn test_designated_creator() {
        let dir = TempDir::new().unwrap();
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path()));
        let mut groups = LocalProcessGroup::create(4).unwrap();
        let group: ProcessGroupHandle = Arc::new(groups.remove(2));

        // rank 2 is local rank 0 on the second host
        let topology = ClusterTopology::new(2, 0, 4, 2).unwrap();
        let manager = CheckpointManager::new(
            storage,
            "exp",
            CheckpointLayout::Simple,
            group,
            topology,
            10,
        )
        .unwrap();
        assert!(manager.is_designated_creator());
        let manager = manager.with_shared_save_dir(true);
        assert!(!manager.is_designated_creator());
    }
}
