//! Whole jobs run in-process through `launch_local`

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use data_shard::BatchSource;
use runtime_core::{ClusterTopology, LocalProcessGroup, ProcessGroup, TrainingConfig};
use storage::LocalStorage;
use tempfile::TempDir;
use trainer::{launch_local, prepare_token_dataset, BigramLmConfig, RunConfig, SyntheticCorpus};

fn run_config(save_dir: &Path, num_epochs: u64, tp: Option<usize>) -> RunConfig {
    RunConfig {
        training: TrainingConfig {
            experiment_name: "bigram-e2e".to_string(),
            dataset_name: "synthetic".to_string(),
            model_name: "bigram".to_string(),
            save_dir: save_dir.to_path_buf(),
            seed: 7,
            num_epochs,
            lr: 1e-2,
            batch_size: 4,
            log_freq: 8,
            ckpt_freq: 16,
            seq_length: Some(16),
            tp,
            shared_save_dir: Some(true),
            ..Default::default()
        },
        model: BigramLmConfig {
            vocab_size: 64,
            hidden_size: 32,
            max_positions: 64,
        },
        corpus: SyntheticCorpus {
            num_tokens: 4096,
            vocab_size: 64,
        },
    }
}

/// `running_loss` of every metrics record, keyed by global step
fn logged_losses(save_dir: &Path) -> Result<BTreeMap<u64, f64>> {
    let raw = std::fs::read_to_string(save_dir.join("bigram-e2e").join("metrics.jsonl"))?;
    let mut losses = BTreeMap::new();
    for line in raw.lines() {
        let record: serde_json::Value = serde_json::from_str(line)?;
        let step = record["global_step"].as_u64().unwrap();
        let loss = record["running_loss"].as_f64().unwrap();
        assert!(record["time/forward"].is_number());
        assert!(record["tok/s"].is_number());
        losses.insert(step, loss);
    }
    Ok(losses)
}

#[tokio::test]
async fn test_tensor_parallel_job_trains_and_checkpoints() -> Result<()> {
    let dir = TempDir::new()?;

    // 256 blocks over dp=2 with batch 4: 32 steps per epoch
    let summaries = launch_local(run_config(dir.path(), 2, Some(2)), 4, 2).await?;
    assert_eq!(summaries.len(), 4);
    for summary in &summaries {
        assert!(!summary.resumed);
        assert_eq!(summary.steps_executed, 64);
        assert_eq!(summary.checkpoint_steps, vec![16, 32, 48, 64]);
        assert_eq!(summary.log_steps.len(), 8);
        assert_eq!(summary.final_state.global_step, 64);
        assert_eq!(summary.final_state.epoch, 1);
        assert_eq!(summary.final_state.epoch_step, 0);
    }

    let experiment = dir.path().join("bigram-e2e");
    assert!(experiment.join("state.json").exists());
    assert!(experiment.join("checkpoint/.metadata").exists());
    assert!(dir.path().join(".cache/synthetic.tokens.json").exists());

    // only the global leader writes metrics
    assert_eq!(logged_losses(dir.path())?.len(), 8);
    Ok(())
}

#[tokio::test]
async fn test_resumed_job_matches_uninterrupted_job() -> Result<()> {
    let straight = TempDir::new()?;
    launch_local(run_config(straight.path(), 3, None), 2, 2).await?;

    let interrupted = TempDir::new()?;
    let first = launch_local(run_config(interrupted.path(), 2, None), 2, 2).await?;
    assert!(first.iter().all(|s| s.final_state.global_step == 64));

    // same experiment, one more epoch
    let second = launch_local(run_config(interrupted.path(), 3, None), 2, 2).await?;
    for summary in &second {
        assert!(summary.resumed);
        // the checkpoint at step 64 closed epoch 1, so its batches are skipped
        assert_eq!(summary.skipped_batches, 32);
        assert_eq!(summary.steps_executed, 32);
        assert_eq!(summary.final_state.global_step, 96);
        assert_eq!(summary.final_state.epoch, 2);
    }

    let expected = logged_losses(straight.path())?;
    let actual = logged_losses(interrupted.path())?;
    assert_eq!(expected.len(), 12);
    assert_eq!(actual, expected);
    Ok(())
}

#[tokio::test]
async fn test_every_rank_sees_the_same_dataset() -> Result<()> {
    let dir = TempDir::new()?;
    let corpus = SyntheticCorpus {
        num_tokens: 512,
        vocab_size: 32,
    };

    let mut handles = Vec::new();
    for group in LocalProcessGroup::create(4)? {
        let root = dir.path().to_path_buf();
        handles.push(tokio::spawn(async move {
            let topology = ClusterTopology::new(group.rank(), group.rank() % 2, 4, 2)?;
            let storage = LocalStorage::new(root);
            let dataset =
                prepare_token_dataset(&storage, &group, &topology, "shared", corpus, 3, 16).await?;
            Ok::<_, runtime_core::Error>(dataset)
        }));
    }

    let mut datasets = Vec::new();
    for handle in handles {
        datasets.push(handle.await??);
    }
    for dataset in &datasets {
        assert_eq!(dataset.len(), 32);
        assert_eq!(dataset.get(5)?, datasets[0].get(5)?);
    }
    Ok(())
}

#[tokio::test]
async fn test_job_fails_on_every_rank_when_one_rank_cannot_start() -> Result<()> {
    let dir = TempDir::new()?;
    let experiment = dir.path().join("bigram-e2e");
    std::fs::create_dir_all(&experiment)?;
    // a commit marker with none of the files it commits
    std::fs::write(
        experiment.join("state.json"),
        r#"{"epoch":0,"global_step":16,"epoch_step":16,"running_loss":0.0}"#,
    )?;

    let err = launch_local(run_config(dir.path(), 1, None), 2, 2)
        .await
        .unwrap_err();
    assert!(matches!(
        err.root(),
        runtime_core::Error::CheckpointIncomplete { .. }
    ));
    Ok(())
}
