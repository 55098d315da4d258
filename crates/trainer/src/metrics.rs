//! Per-interval training metrics and the sinks they are pushed to

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parallel::MemoryStats;
use runtime_core::{Result, Step, TrainingState};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::timer::TimerSet;

/// File written by [`JsonLinesSink`] inside the experiment directory
pub const METRICS_FILE: &str = "metrics.jsonl";

const GB: f64 = 1e9;

/// Key prefix of per-phase timings in a serialized record
const PHASE_PREFIX: &str = "time/";

/// Device memory in GB
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub total_gb: f64,
    pub curr_alloc_gb: f64,
    pub peak_alloc_gb: f64,
    pub curr_resv_gb: f64,
    pub peak_resv_gb: f64,
}

impl From<MemoryStats> for MemoryRecord {
    fn from(stats: MemoryStats) -> Self {
        let gb = |bytes: u64| bytes as f64 / GB;
        Self {
            total_gb: gb(stats.total_bytes),
            curr_alloc_gb: gb(stats.allocated_bytes),
            peak_alloc_gb: gb(stats.peak_allocated_bytes),
            curr_resv_gb: gb(stats.reserved_bytes),
            peak_resv_gb: gb(stats.peak_reserved_bytes),
        }
    }
}

/// One logging interval, serialized as a flat JSON object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub global_step: Step,
    pub lr: f64,

    /// Mean loss over the interval
    pub running_loss: f64,

    pub epoch: u64,
    pub epoch_progress: f64,
    pub num_batches_remaining: u64,

    #[serde(rename = "tok/s")]
    pub tokens_per_sec: f64,

    #[serde(rename = "time/total")]
    pub total_ms: f64,

    /// Average milliseconds per phase, keyed `time/<phase>`
    #[serde(flatten, deserialize_with = "phase_entries")]
    pub phase_ms: BTreeMap<String, f64>,

    #[serde(flatten)]
    pub memory: Option<MemoryRecord>,
}

/// Collect the `time/<phase>` entries of the flattened remainder. The
/// memory fields share that remainder and must not leak into the phases.
fn phase_entries<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
    Ok(entries
        .into_iter()
        .filter(|(key, _)| key.starts_with(PHASE_PREFIX))
        .filter_map(|(key, value)| value.as_f64().map(|ms| (key, ms)))
        .collect())
}

/// Turns loop state and phase timers into [`MetricsRecord`]s
#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    log_freq: u64,
    tokens_per_step: u64,
    batches_per_epoch: u64,
}

impl MetricsAggregator {
    pub fn new(
        log_freq: u64,
        dp_size: usize,
        batch_size: usize,
        seq_length: usize,
        batches_per_epoch: usize,
    ) -> Self {
        Self {
            log_freq: log_freq.max(1),
            tokens_per_step: (dp_size * batch_size * seq_length) as u64,
            batches_per_epoch: batches_per_epoch as u64,
        }
    }

    /// Tokens consumed by one step across every data-parallel replica
    pub fn tokens_per_step(&self) -> u64 {
        self.tokens_per_step
    }

    /// Whether a record is due after completing `global_step`
    pub fn should_log(&self, global_step: Step) -> bool {
        global_step > 0 && global_step % self.log_freq == 0
    }

    /// Summarize the interval ending at `state`, whose last step consumed
    /// batch `batch_index` of the epoch.
    ///
    /// Fails when a phase timer holds no samples.
    pub fn summarize(
        &self,
        state: &TrainingState,
        batch_index: usize,
        lr: f64,
        timers: &TimerSet,
        memory: Option<MemoryStats>,
    ) -> Result<MetricsRecord> {
        let averages = timers.averages_ms()?;
        let total_ms: f64 = averages.iter().map(|(_, ms)| ms).sum();
        let tokens_per_sec = if total_ms > 0.0 {
            1000.0 * self.tokens_per_step as f64 / total_ms
        } else {
            0.0
        };
        let epoch_progress = if self.batches_per_epoch > 0 {
            state.epoch_step as f64 / self.batches_per_epoch as f64
        } else {
            0.0
        };

        Ok(MetricsRecord {
            global_step: state.global_step,
            lr,
            running_loss: state.running_loss / self.log_freq as f64,
            epoch: state.epoch,
            epoch_progress,
            num_batches_remaining: self.batches_per_epoch.saturating_sub(batch_index as u64),
            tokens_per_sec,
            total_ms,
            phase_ms: averages
                .into_iter()
                .map(|(phase, ms)| (format!("{}{}", PHASE_PREFIX, phase), ms))
                .collect(),
            memory: memory.map(MemoryRecord::from),
        })
    }
}

/// Destination for metrics records
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record(&self, record: &MetricsRecord) -> Result<()>;

    /// Drop records for steps after `global_step`, the step a run resumes
    /// from, so the replayed intervals are not recorded twice. Returns the
    /// number of records dropped.
    async fn discard_after(&self, global_step: Step) -> Result<usize> {
        let _ = global_step;
        Ok(0)
    }
}

/// Emits each record as a structured `tracing` event
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl MetricsSink for TracingSink {
    async fn record(&self, record: &MetricsRecord) -> Result<()> {
        info!(
            target: "trainer::metrics",
            global_step = record.global_step,
            epoch = record.epoch,
            lr = record.lr,
            running_loss = record.running_loss,
            tokens_per_sec = record.tokens_per_sec,
            total_ms = record.total_ms,
            "metrics"
        );
        Ok(())
    }
}

/// Appends one JSON object per line to a file
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `metrics.jsonl` inside `experiment_dir`
    pub fn in_dir(experiment_dir: impl AsRef<Path>) -> Self {
        Self::new(experiment_dir.as_ref().join(METRICS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MetricsSink for JsonLinesSink {
    async fn record(&self, record: &MetricsRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn discard_after(&self, global_step: Step) -> Result<usize> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut kept = String::with_capacity(contents.len());
        let mut dropped = 0;
        for line in contents.lines().filter(|line| !line.trim().is_empty()) {
            let record: MetricsRecord = serde_json::from_str(line)?;
            if record.global_step > global_step {
                dropped += 1;
            } else {
                kept.push_str(line);
                kept.push('\n');
            }
        }
        if dropped == 0 {
            return Ok(0);
        }

        // replace through a rename so a crash leaves either version
        let temp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&temp, kept.as_bytes()).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        debug!(dropped, global_step, path = %self.path.display(), "Discarded replayed metrics records");
        Ok(dropped)
    }
}
