//! Resumable, instrumented training loop
//!
//! Each step runs `data -> forward -> backward -> update -> advance`, with
//! every phase timed. Logging and checkpointing are keyed off the global
//! step. A resumed run replays the interrupted epoch's deterministic batch
//! order and skips the batches it had already trained on.

use std::sync::Arc;

use checkpoint::{CheckpointManager, ResumeOutcome};
use data_shard::{DataLoader, Prefetcher};
use runtime_core::{logging, Epoch, Error, Result, Step, TrainingState};
use tracing::{info, warn, Instrument};

use crate::context::TrainingContext;
use crate::metrics::{MetricsAggregator, MetricsRecord, MetricsSink};
use crate::timer::{phase, TimerSet};

/// Phase names used in error context besides the timed phases
const STARTUP: &str = "startup";
const METRICS: &str = "metrics";
const CHECKPOINT: &str = "checkpoint";

/// What a call to [`ResumableTrainingLoop::run`] did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Global steps at which a metrics record was produced
    pub log_steps: Vec<Step>,

    /// Global steps at which a checkpoint was committed
    pub checkpoint_steps: Vec<Step>,

    pub final_state: TrainingState,

    /// Whether the run started from a checkpoint
    pub resumed: bool,

    /// Steps trained by this call
    pub steps_executed: u64,

    /// Batches consumed without training while resuming mid-epoch
    pub skipped_batches: u64,

    /// Most recent metrics record
    pub last_record: Option<MetricsRecord>,
}

pub struct ResumableTrainingLoop {
    ctx: TrainingContext,
    loader: DataLoader,
    checkpoints: CheckpointManager,
    metrics: MetricsAggregator,
    timers: TimerSet,
    sink: Arc<dyn MetricsSink>,
    max_steps: Option<u64>,
}

impl ResumableTrainingLoop {
    pub fn new(
        ctx: TrainingContext,
        loader: DataLoader,
        checkpoints: CheckpointManager,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        let metrics = MetricsAggregator::new(
            ctx.config.log_freq,
            ctx.mesh.dp_size(),
            loader.batch_size(),
            loader.seq_length(),
            loader.len(),
        );
        let timers = TimerSet::standard(Arc::clone(&ctx.accelerator));
        Self {
            ctx,
            loader,
            checkpoints,
            metrics,
            timers,
            sink,
            max_steps: None,
        }
    }

    /// Stop after training `max_steps` steps in this call
    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn context(&self) -> &TrainingContext {
        &self.ctx
    }

    pub fn into_context(self) -> TrainingContext {
        self.ctx
    }

    /// Resume or start fresh, then train until `num_epochs` or the step
    /// budget is reached. Collective.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let span = logging::rank_span(&self.ctx.topology);
        let result = self.run_inner().instrument(span).await;
        self.checkpoints.finish();
        result
    }

    async fn run_inner(&mut self) -> Result<RunSummary> {
        let rank = self.ctx.topology.rank();
        let resumed = self
            .startup()
            .await
            .map_err(|e| e.with_context(rank, STARTUP, self.ctx.state.global_step))?;

        let mut summary = RunSummary {
            resumed,
            ..Default::default()
        };

        let num_epochs = self.ctx.config.num_epochs;
        'epochs: for epoch in self.ctx.state.epoch..num_epochs {
            self.ctx.state.epoch = epoch;
            info!(
                epoch,
                epoch_step = self.ctx.state.epoch_step,
                global_step = self.ctx.state.global_step,
                "Begin epoch {} at step {}",
                epoch,
                self.ctx.state.epoch_step
            );

            let mut batches = self.loader.epoch(epoch);
            let skip = self.ctx.state.epoch_step as usize;
            self.skip_batches(&mut batches, epoch, skip).await?;
            summary.skipped_batches += skip as u64;

            for batch_index in skip..self.loader.len() {
                if self.max_steps.is_some_and(|max| summary.steps_executed >= max) {
                    info!(steps = summary.steps_executed, "Reached step budget");
                    break 'epochs;
                }

                self.train_step(&mut batches, epoch, batch_index).await?;
                summary.steps_executed += 1;

                let global_step = self.ctx.state.global_step;
                if self.metrics.should_log(global_step) {
                    let record = self
                        .log_interval(batch_index)
                        .await
                        .map_err(|e| e.with_context(rank, METRICS, global_step))?;
                    summary.log_steps.push(global_step);
                    summary.last_record = Some(record);
                }

                if self.checkpoints.should_checkpoint(global_step) {
                    info!(global_step, "Saving checkpoint");
                    self.ctx
                        .save_checkpoint(&mut self.checkpoints)
                        .await
                        .map_err(|e| e.with_context(rank, CHECKPOINT, global_step))?;
                    summary.checkpoint_steps.push(global_step);
                }
            }

            self.ctx.state.epoch_step = 0;
        }

        summary.final_state = self.ctx.state;
        info!(
            steps = summary.steps_executed,
            global_step = summary.final_state.global_step,
            checkpoints = summary.checkpoint_steps.len(),
            "Training finished"
        );
        Ok(summary)
    }

    /// Load the committed checkpoint if there is one, then make sure the
    /// experiment directory exists. Returns whether the run resumed.
    async fn startup(&mut self) -> Result<bool> {
        let resumed = match self.checkpoints.probe().await? {
            ResumeOutcome::Fresh => {
                self.checkpoints.start_fresh()?;
                false
            }
            ResumeOutcome::Resumable(_) => {
                let loaded = self.checkpoints.resume().await?;
                self.ctx.load_checkpoint(loaded)?;
                true
            }
        };
        info!(
            resumed,
            epoch = self.ctx.state.epoch,
            global_step = self.ctx.state.global_step,
            epoch_step = self.ctx.state.epoch_step,
            running_loss = self.ctx.state.running_loss,
            "Resumed={}",
            resumed
        );

        self.checkpoints.prepare_directory().await?;

        if self.ctx.topology.is_global_leader() {
            let global_step = self.ctx.state.global_step;
            if let Err(e) = self.sink.discard_after(global_step).await {
                warn!(error = %e, global_step, "Metrics sink could not drop replayed records");
            }
        }
        Ok(resumed)
    }

    /// Consume the batches an interrupted run already trained on
    async fn skip_batches(&mut self, batches: &mut Prefetcher, epoch: Epoch, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let rank = self.ctx.topology.rank();
        let global_step = self.ctx.state.global_step;
        for index in 0..count {
            match batches.next_batch().await {
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.with_context(rank, phase::DATA, global_step)),
                None => {
                    return Err(Error::DataExhausted {
                        epoch,
                        batch: index as u64,
                    }
                    .with_context(rank, phase::DATA, global_step))
                }
            }
        }
        info!(epoch, skipped = count, "Skipped already trained batches");
        Ok(())
    }

    async fn train_step(&mut self, batches: &mut Prefetcher, epoch: Epoch, batch_index: usize) -> Result<()> {
        let rank = self.ctx.topology.rank();
        let global_step = self.ctx.state.global_step;
        let context = |name: &'static str| move |e: Error| e.with_context(rank, name, global_step);

        let fetched = {
            let _timer = self.timers.start(phase::DATA).map_err(context(phase::DATA))?;
            batches.next_batch().await
        };
        let batch = match fetched {
            Some(batch) => batch.map_err(context(phase::DATA))?,
            None => {
                return Err(context(phase::DATA)(Error::DataExhausted {
                    epoch,
                    batch: batch_index as u64,
                }))
            }
        };

        let loss = {
            let _timer = self.timers.start(phase::FORWARD).map_err(context(phase::FORWARD))?;
            self.ctx.model.forward(&batch).map_err(context(phase::FORWARD))?
        };
        {
            let _timer = self.timers.start(phase::BACKWARD).map_err(context(phase::BACKWARD))?;
            self.ctx.model.backward().map_err(context(phase::BACKWARD))?;
        }
        {
            let _timer = self.timers.start(phase::UPDATE).map_err(context(phase::UPDATE))?;
            self.ctx.update().map_err(context(phase::UPDATE))?;
        }

        self.ctx.state.advance(loss);
        Ok(())
    }

    /// Summarize the interval, publish it and start a new one
    async fn log_interval(&mut self, batch_index: usize) -> Result<MetricsRecord> {
        let record = self.metrics.summarize(
            &self.ctx.state,
            batch_index,
            self.ctx.scheduler.last_lr(),
            &self.timers,
            self.ctx.accelerator.memory_stats(),
        )?;

        info!(
            global_step = record.global_step,
            epoch = record.epoch,
            lr = record.lr,
            running_loss = record.running_loss,
            tokens_per_sec = record.tokens_per_sec,
            total_ms = record.total_ms,
            num_batches_remaining = record.num_batches_remaining,
            "Step metrics"
        );
        if self.ctx.topology.is_global_leader() {
            if let Err(e) = self.sink.record(&record).await {
                warn!(error = %e, global_step = record.global_step, "Metrics sink rejected record");
            }
        }

        self.ctx.accelerator.reset_peak_memory_stats();
        self.ctx.state.reset_running_loss();
        self.timers.reset_all();
        Ok(record)
    }
}
