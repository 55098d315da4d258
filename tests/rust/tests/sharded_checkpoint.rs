//! Multi-rank checkpoint save and resume over an in-process group

use std::sync::Arc;

use anyhow::Result;
use checkpoint::{
    CheckpointLayout, CheckpointManager, CheckpointSnapshot, LoadedCheckpoint, ResumeOutcome,
    ShardKind,
};
use parallel::DeviceMesh;
use runtime_core::{
    ClusterTopology, Error, LocalProcessGroup, ProcessGroup, StateDict, Tensor, TrainingState,
};
use storage::{LocalStorage, StorageBackend};
use tempfile::TempDir;

const WORLD: usize = 4;
const LOCAL_WORLD: usize = 2;
const TP: usize = 2;
const EXPERIMENT: &str = "sharded-run";

fn topology(rank: usize) -> runtime_core::Result<ClusterTopology> {
    ClusterTopology::new(rank, rank % LOCAL_WORLD, WORLD, LOCAL_WORLD)
}

fn sharded() -> CheckpointLayout {
    CheckpointLayout::Sharded {
        world_size: WORLD,
        tp: TP,
    }
}

fn full_q_proj() -> Tensor {
    Tensor::new(vec![4, 3], (0..12).map(|v| v as f32).collect()).unwrap()
}

/// What rank `rank` holds: its tp slice of q_proj plus a replicated norm
fn model_shard(rank: usize) -> StateDict {
    let mesh = DeviceMesh::new(topology(rank).unwrap(), TP).unwrap();
    let mut dict = StateDict::new();
    dict.insert_tensor(
        "model.layers.0.self_attn.q_proj.weight",
        full_q_proj().chunk(0, TP, mesh.tp_rank()).unwrap(),
    );
    dict.insert_tensor("model.norm.weight", Tensor::new(vec![3], vec![1.0; 3]).unwrap());
    dict.insert_scalar("writer_rank", rank as f64);
    dict
}

fn optimizer_shard(rank: usize) -> StateDict {
    let mut dict = StateDict::new();
    dict.insert_scalar("step", 10.0);
    dict.insert_tensor("exp_avg.0", Tensor::new(vec![2], vec![rank as f32, 0.5]).unwrap());
    dict
}

fn scheduler_state() -> StateDict {
    let mut dict = StateDict::new();
    dict.insert_scalar("last_epoch", 10.0);
    dict
}

fn saved_state() -> TrainingState {
    TrainingState {
        epoch: 1,
        global_step: 10,
        epoch_step: 4,
        running_loss: 0.0,
    }
}

fn managers(
    storage: Arc<dyn StorageBackend>,
    layout: CheckpointLayout,
) -> Result<Vec<CheckpointManager>> {
    let mut managers = Vec::with_capacity(WORLD);
    for group in LocalProcessGroup::create(WORLD)? {
        let topology = topology(group.rank())?;
        let manager = CheckpointManager::new(
            Arc::clone(&storage),
            EXPERIMENT,
            layout,
            Arc::new(group),
            topology,
            10,
        )?
        .with_shared_save_dir(true);
        managers.push(manager);
    }
    Ok(managers)
}

/// Every rank starts fresh and commits one checkpoint with its own shards
async fn save_on_all_ranks(storage: Arc<dyn StorageBackend>, layout: CheckpointLayout) -> Result<()> {
    let mut handles = Vec::new();
    for (rank, mut manager) in managers(storage, layout)?.into_iter().enumerate() {
        handles.push(tokio::spawn(async move {
            manager.start_fresh()?;
            manager.prepare_directory().await?;
            let model = model_shard(rank);
            let optimizer = optimizer_shard(rank);
            let scheduler = scheduler_state();
            let state = saved_state();
            manager
                .save(CheckpointSnapshot {
                    model: &model,
                    optimizer: &optimizer,
                    scheduler: &scheduler,
                    state: &state,
                })
                .await?;
            manager.finish();
            Ok::<_, Error>(())
        }));
    }
    for handle in handles {
        handle.await??;
    }
    Ok(())
}

async fn resume_on_all_ranks(
    storage: Arc<dyn StorageBackend>,
    layout: CheckpointLayout,
) -> Result<Vec<runtime_core::Result<LoadedCheckpoint>>> {
    let mut handles = Vec::new();
    for mut manager in managers(storage, layout)? {
        handles.push(tokio::spawn(async move { manager.resume().await }));
    }
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await?);
    }
    Ok(results)
}

#[tokio::test]
async fn test_sharded_checkpoint_round_trips_each_rank() -> Result<()> {
    let dir = TempDir::new()?;
    let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path()));

    save_on_all_ranks(Arc::clone(&storage), sharded()).await?;

    let experiment = dir.path().join(EXPERIMENT);
    assert!(experiment.join("state.json").exists());
    assert!(experiment.join("checkpoint/.metadata").exists());
    for rank in 0..WORLD {
        assert!(experiment
            .join(sharded().shard_file(ShardKind::Model, rank))
            .exists());
    }
    assert!(!experiment.join("model.pt").exists());

    let results = resume_on_all_ranks(storage, sharded()).await?;
    for (rank, result) in results.into_iter().enumerate() {
        let loaded = result?;
        assert_eq!(loaded.state, saved_state());
        assert_eq!(loaded.model, model_shard(rank));
        assert_eq!(loaded.optimizer, optimizer_shard(rank));
        assert_eq!(loaded.scheduler, scheduler_state());
    }
    Ok(())
}

#[tokio::test]
async fn test_tp_slices_reassemble_the_full_weight() -> Result<()> {
    let dir = TempDir::new()?;
    let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path()));
    save_on_all_ranks(Arc::clone(&storage), sharded()).await?;

    let results = resume_on_all_ranks(storage, sharded()).await?;
    let loaded: Vec<LoadedCheckpoint> = results.into_iter().collect::<runtime_core::Result<_>>()?;

    // ranks 0 and 1 form the first tp group
    let mut rows = Vec::new();
    for rank in [0, 1] {
        let slice = loaded[rank]
            .model
            .tensor_with_shape("model.layers.0.self_attn.q_proj.weight", &[2, 3])?;
        rows.extend_from_slice(&slice.data);
    }
    assert_eq!(rows, full_q_proj().data);
    Ok(())
}

#[tokio::test]
async fn test_resume_rejects_a_different_mesh() -> Result<()> {
    let dir = TempDir::new()?;
    let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path()));
    save_on_all_ranks(Arc::clone(&storage), sharded()).await?;

    let wider = CheckpointLayout::Sharded {
        world_size: WORLD,
        tp: 4,
    };
    for result in resume_on_all_ranks(storage, wider).await? {
        match result {
            Err(Error::StateMismatch { key, .. }) => assert_eq!(key, "mesh"),
            other => panic!("expected a mesh mismatch, got {:?}", other.map(|l| l.state)),
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_missing_shard_is_incomplete_not_fresh() -> Result<()> {
    let dir = TempDir::new()?;
    let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path()));
    save_on_all_ranks(Arc::clone(&storage), sharded()).await?;

    let lost = sharded().shard_file(ShardKind::Optimizer, 3);
    std::fs::remove_file(dir.path().join(EXPERIMENT).join(&lost))?;

    let managers = managers(storage, sharded())?;
    match managers[0].probe().await {
        Err(Error::CheckpointIncomplete { missing, .. }) => assert_eq!(missing, vec![lost]),
        other => panic!("expected an incomplete checkpoint, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_simple_layout_is_written_by_rank_zero_only() -> Result<()> {
    let dir = TempDir::new()?;
    let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path()));
    save_on_all_ranks(Arc::clone(&storage), CheckpointLayout::Simple).await?;

    let experiment = dir.path().join(EXPERIMENT);
    assert!(experiment.join("model.pt").exists());
    assert!(!experiment.join("checkpoint").exists());

    let probe = managers(Arc::clone(&storage), CheckpointLayout::Simple)?[0]
        .probe()
        .await?;
    assert_eq!(probe, ResumeOutcome::Resumable(saved_state()));

    // every rank restores the state rank 0 wrote
    for result in resume_on_all_ranks(storage, CheckpointLayout::Simple).await? {
        let loaded = result?;
        assert_eq!(loaded.model.scalar("writer_rank")?, 0.0);
        assert_eq!(loaded.optimizer, optimizer_shard(0));
    }
    Ok(())
}
