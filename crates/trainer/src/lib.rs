//! Resumable distributed training loop
//!
//! Wires the workspace together: a [`TrainingContext`] owns the model,
//! optimizer, scheduler and loop state of one rank, and a
//! [`ResumableTrainingLoop`] drives it through timed steps with periodic
//! metrics and checkpoints.
//!
//! [`launch`] runs one rank of a job over any process group.
//! [`launch_with_coordinator`] runs one rank of a multi-process job whose
//! barriers go through the gRPC coordinator. [`launch_local`] runs a whole
//! job inside one process, one task per rank.

pub mod context;
pub mod dataset;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod reference;
pub mod scheduler;
pub mod timer;
pub mod training_loop;

use std::path::Path;
use std::sync::Arc;

use coordinator::{
    BarrierService, CoordinatorAddr, CoordinatorProcessGroup, CoordinatorServer, ServerConfig,
};
use data_shard::BatchSource;
use parallel::{Accelerator, CpuAccelerator};
use runtime_core::{
    ClusterTopology, Error, LocalProcessGroup, ProcessGroup, ProcessGroupHandle, Result,
    TrainingConfig,
};
use serde::{Deserialize, Serialize};
use storage::LocalStorage;
use tracing::{error, info};

pub use context::{build_mesh, shard_model, TrainingContext};
pub use dataset::{prepare_token_dataset, SyntheticCorpus};
pub use metrics::{
    JsonLinesSink, MemoryRecord, MetricsAggregator, MetricsRecord, MetricsSink, TracingSink,
};
pub use model::{LrScheduler, Model, Optimizer, Parameter, ParameterSet};
pub use optim::{AdamW, AdamWConfig};
pub use reference::{BigramLm, BigramLmConfig};
pub use scheduler::CosineAnnealingLr;
pub use timer::{PhaseTimer, TimerGuard, TimerSet};
pub use training_loop::{ResumableTrainingLoop, RunSummary};

/// Everything the `trainer` binary reads from its JSON config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(flatten)]
    pub training: TrainingConfig,

    #[serde(default)]
    pub model: BigramLmConfig,

    #[serde(default)]
    pub corpus: SyntheticCorpus,
}

impl RunConfig {
    pub fn new(training: TrainingConfig) -> Self {
        Self {
            training,
            model: BigramLmConfig::default(),
            corpus: SyntheticCorpus::default(),
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.training.validate()?;
        if self.corpus.vocab_size as usize > self.model.vocab_size {
            return Err(Error::InvalidConfig {
                message: format!(
                    "corpus vocabulary of {} does not fit the model vocabulary of {}",
                    self.corpus.vocab_size, self.model.vocab_size
                ),
            });
        }
        Ok(())
    }
}

/// Run one rank of a training job to completion. Collective.
pub async fn launch(
    config: RunConfig,
    topology: ClusterTopology,
    group: ProcessGroupHandle,
    accelerator: Arc<dyn Accelerator>,
) -> Result<RunSummary> {
    config.validate()?;
    let RunConfig {
        training,
        model: model_config,
        corpus,
    } = config;

    let mesh = build_mesh(&training, topology)?;
    let mut model = BigramLm::new(model_config)?;
    model.initialize_weights(training.seed);
    shard_model(&mut model, &mesh, 0)?;
    info!(
        parameters = model.parameters().numel(),
        dp_size = mesh.dp_size(),
        tp_size = mesh.tp_size(),
        "Built model"
    );

    let lr = training.lr;
    let ctx = TrainingContext::new(
        training,
        mesh,
        Arc::clone(&group),
        accelerator,
        Box::new(model),
        Box::new(AdamW::default()),
        Box::new(CosineAnnealingLr::standard(lr)),
    )?;

    let storage = LocalStorage::new(&ctx.config.save_dir);
    let dataset = prepare_token_dataset(
        &storage,
        group.as_ref(),
        &topology,
        &ctx.config.dataset_name,
        corpus,
        ctx.config.seed,
        ctx.seq_length(),
    )
    .await?;
    info!(blocks = dataset.len(), "Prepared training data");

    let loader = ctx.data_loader(Arc::new(dataset))?;
    let checkpoints = ctx.local_checkpoint_manager()?;
    let sink = Arc::new(JsonLinesSink::in_dir(ctx.config.experiment_dir()));

    let mut training_loop = ResumableTrainingLoop::new(ctx, loader, checkpoints, sink);
    training_loop.run().await
}

/// Run one rank of a multi-process job. Collective.
///
/// Global rank 0 hosts the coordinator on `addr`'s port; every rank then
/// joins it. When rank 0 fails, its coordinator fails the barriers its
/// peers are blocked in, so they stop too.
pub async fn launch_with_coordinator(
    config: RunConfig,
    topology: ClusterTopology,
    addr: &CoordinatorAddr,
) -> Result<RunSummary> {
    let server = if topology.is_global_leader() {
        let service = BarrierService::new(topology.world_size())?;
        let server_config = ServerConfig {
            addr: addr.bind_addr(),
            ..Default::default()
        };
        Some(CoordinatorServer::with_config(service, server_config).spawn().await?)
    } else {
        None
    };

    let result = async {
        let group =
            CoordinatorProcessGroup::connect(addr.to_string(), topology.rank(), topology.world_size())
                .await?;
        launch(
            config,
            topology,
            Arc::new(group),
            Arc::new(CpuAccelerator::new()),
        )
        .await
    }
    .await;

    let Some(server) = server else {
        return result;
    };
    match result {
        Ok(summary) => {
            server.shutdown().await?;
            Ok(summary)
        }
        Err(e) => {
            if let Err(abort_error) = server.abort().await {
                error!(error = %abort_error, "Coordinator did not shut down cleanly");
            }
            Err(e)
        }
    }
}

/// Run a `world_size`-rank job inside this process, one task per rank on
/// hosts of `local_world_size` ranks each. Summaries are in rank order.
pub async fn launch_local(
    config: RunConfig,
    world_size: usize,
    local_world_size: usize,
) -> Result<Vec<RunSummary>> {
    if local_world_size == 0 || world_size % local_world_size != 0 {
        return Err(Error::InvalidTopology {
            message: format!(
                "local_world_size={} must divide world_size={}",
                local_world_size, world_size
            ),
        });
    }

    let groups = LocalProcessGroup::create(world_size)?;
    let mut handles = Vec::with_capacity(world_size);
    for group in groups {
        let rank = group.rank();
        let topology = ClusterTopology::new(
            rank,
            rank % local_world_size,
            world_size,
            local_world_size,
        )?;
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            launch(
                config,
                topology,
                Arc::new(group),
                Arc::new(CpuAccelerator::new()),
            )
            .await
        }));
    }

    let mut summaries = Vec::with_capacity(world_size);
    let mut first_error = None;
    for handle in handles {
        let outcome = handle.await.map_err(|e| Error::Internal {
            message: format!("rank task failed: {}", e),
        });
        match outcome.and_then(|result| result) {
            Ok(summary) => summaries.push(summary),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(summaries),
    }
}
