//! Checkpoint management for distributed training
//!
//! Persists model, optimizer and scheduler state together with the loop's
//! `TrainingState`, and restores them with completeness and consistency
//! checks so a killed run resumes exactly where its last commit left it.

pub mod layout;
pub mod manager;
pub mod writer;

pub use layout::CheckpointLayout;
pub use manager::{
    CheckpointManager, CheckpointPhase, CheckpointSnapshot, LoadedCheckpoint, ResumeOutcome,
};
pub use writer::{ShardHeader, ShardKind, CHECKPOINT_MAGIC, CHECKPOINT_VERSION};
