//! Trainer binary entry point
//!
//! Usage: `trainer <config.json>`. The process topology comes from the
//! `RANK`, `WORLD_SIZE`, `LOCAL_RANK` and `LOCAL_WORLD_SIZE` environment
//! variables set by the launcher. Multi-process jobs meet at the
//! coordinator on `MASTER_ADDR:MASTER_PORT`, which global rank 0 hosts.

use std::sync::Arc;

use coordinator::CoordinatorAddr;
use parallel::CpuAccelerator;
use runtime_core::{logging, ClusterTopology, RuntimeManager, SingleProcessGroup};
use trainer::{launch, launch_with_coordinator, RunConfig};

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    logging::init(logging::DEFAULT_DIRECTIVES);

    let path = std::env::args()
        .nth(1)
        .ok_or("usage: trainer <config.json>")?;
    let config = RunConfig::from_json_file(&path)?;
    let topology = ClusterTopology::from_env()?;
    tracing::info!(
        rank = topology.rank(),
        local_rank = topology.local_rank(),
        world_size = topology.world_size(),
        config = %path,
        "Starting trainer"
    );

    let runtime = RuntimeManager::from_config(&config.training)?;
    let summary = if topology.world_size() > 1 {
        let addr = CoordinatorAddr::from_env()?;
        tracing::info!(coordinator = %addr, "Joining multi-process job");
        runtime.block_on(launch_with_coordinator(config, topology, &addr))??
    } else {
        runtime.block_on(launch(
            config,
            topology,
            Arc::new(SingleProcessGroup),
            Arc::new(CpuAccelerator::new()),
        ))??
    };

    tracing::info!(
        global_step = summary.final_state.global_step,
        epoch = summary.final_state.epoch,
        steps = summary.steps_executed,
        resumed = summary.resumed,
        checkpoints = summary.checkpoint_steps.len(),
        "Run complete"
    );
    Ok(())
}
