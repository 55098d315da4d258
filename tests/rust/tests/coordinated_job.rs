//! Ranks that meet at a real gRPC coordinator instead of an in-process group

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use coordinator::{
    BarrierService, CoordinatorAddr, CoordinatorProcessGroup, CoordinatorServer, RunningServer,
    ServerConfig,
};
use parallel::CpuAccelerator;
use runtime_core::{ClusterTopology, ProcessGroup, TrainingConfig};
use tempfile::TempDir;
use trainer::{launch, launch_local, launch_with_coordinator, RunConfig, RunSummary, SyntheticCorpus};

const WORLD: usize = 2;

async fn local_coordinator(world_size: usize) -> Result<RunningServer> {
    let config = ServerConfig {
        addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        ..Default::default()
    };
    Ok(CoordinatorServer::with_config(BarrierService::new(world_size)?, config)
        .spawn()
        .await?)
}

fn run_config(save_dir: &Path) -> RunConfig {
    let mut config = RunConfig::new(TrainingConfig {
        experiment_name: "coordinated".to_string(),
        dataset_name: "synthetic".to_string(),
        model_name: "bigram".to_string(),
        save_dir: save_dir.to_path_buf(),
        seed: 3,
        num_epochs: 1,
        lr: 1e-2,
        batch_size: 4,
        log_freq: 8,
        ckpt_freq: 16,
        seq_length: Some(16),
        shared_save_dir: Some(true),
        ..Default::default()
    });
    config.model.vocab_size = 64;
    config.model.hidden_size = 32;
    config.model.max_positions = 64;
    config.corpus = SyntheticCorpus {
        num_tokens: 4096,
        vocab_size: 64,
    };
    config
}

fn logged_losses(save_dir: &Path) -> Result<BTreeMap<u64, f64>> {
    let raw = std::fs::read_to_string(save_dir.join("coordinated").join("metrics.jsonl"))?;
    let mut losses = BTreeMap::new();
    for line in raw.lines() {
        let record: serde_json::Value = serde_json::from_str(line)?;
        losses.insert(
            record["global_step"].as_u64().unwrap(),
            record["running_loss"].as_f64().unwrap(),
        );
    }
    Ok(losses)
}

#[tokio::test]
async fn test_barrier_orders_phases_across_members() -> Result<()> {
    let server = local_coordinator(WORLD).await?;
    let addr = server.local_addr().to_string();
    let before = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for rank in 0..WORLD {
        let addr = addr.clone();
        let before = Arc::clone(&before);
        handles.push(tokio::spawn(async move {
            let group = CoordinatorProcessGroup::connect(addr, rank, WORLD).await?;
            before.fetch_add(1, Ordering::SeqCst);
            group.barrier().await?;
            // every member incremented before anyone passed
            let seen = before.load(Ordering::SeqCst);
            group.barrier().await?;
            Ok::<_, runtime_core::Error>((seen, group.barriers_passed()))
        }));
    }

    for handle in handles {
        let (seen, passed) = handle.await??;
        assert_eq!(seen, WORLD);
        assert_eq!(passed, 2);
    }
    server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_two_ranks_train_through_coordinator() -> Result<()> {
    let dir = TempDir::new()?;
    let server = local_coordinator(WORLD).await?;
    let addr = server.local_addr().to_string();

    let mut handles = Vec::new();
    for rank in 0..WORLD {
        let addr = addr.clone();
        let config = run_config(dir.path());
        handles.push(tokio::spawn(async move {
            let topology = ClusterTopology::new(rank, rank, WORLD, WORLD)?;
            let group = CoordinatorProcessGroup::connect(addr, rank, WORLD).await?;
            launch(
                config,
                topology,
                Arc::new(group),
                Arc::new(CpuAccelerator::new()),
            )
            .await
        }));
    }
    let mut summaries: Vec<RunSummary> = Vec::new();
    for handle in handles {
        summaries.push(handle.await??);
    }
    server.shutdown().await?;

    // 256 blocks over dp=2 with batch 4: 32 steps
    for summary in &summaries {
        assert!(!summary.resumed);
        assert_eq!(summary.steps_executed, 32);
        assert_eq!(summary.checkpoint_steps, vec![16, 32]);
    }
    assert_eq!(summaries[0].final_state, summaries[1].final_state);
    assert!(dir.path().join("coordinated/state.json").exists());

    // the transport does not change the numbers
    let in_process = TempDir::new()?;
    launch_local(run_config(in_process.path()), WORLD, WORLD).await?;
    assert_eq!(logged_losses(dir.path())?, logged_losses(in_process.path())?);
    Ok(())
}

#[tokio::test]
async fn test_rank_zero_hosts_the_coordinator() -> Result<()> {
    let dir = TempDir::new()?;
    let port = portpicker::pick_unused_port().expect("no free port");
    let addr = CoordinatorAddr::new("127.0.0.1", port);

    let mut handles = Vec::new();
    for rank in 0..WORLD {
        let addr = addr.clone();
        let config = run_config(dir.path());
        handles.push(tokio::spawn(async move {
            let topology = ClusterTopology::new(rank, rank, WORLD, WORLD)?;
            launch_with_coordinator(config, topology, &addr).await
        }));
    }
    for handle in handles {
        let summary = handle.await??;
        assert_eq!(summary.final_state.global_step, 32);
    }

    // a second launch resumes from the committed checkpoint
    let mut handles = Vec::new();
    for rank in 0..WORLD {
        let addr = addr.clone();
        let mut config = run_config(dir.path());
        config.training.num_epochs = 2;
        handles.push(tokio::spawn(async move {
            let topology = ClusterTopology::new(rank, rank, WORLD, WORLD)?;
            launch_with_coordinator(config, topology, &addr).await
        }));
    }
    for handle in handles {
        let summary = handle.await??;
        assert!(summary.resumed);
        assert_eq!(summary.steps_executed, 32);
        assert_eq!(summary.final_state.global_step, 64);
    }
    Ok(())
}
