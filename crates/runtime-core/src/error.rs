//! Error types for the distributed training harness

use thiserror::Error;

/// Result type alias using the runtime Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the distributed training harness
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Invalid topology: {message}")]
    InvalidTopology { message: String },

    // Resume errors
    #[error("Checkpoint not found: {path}")]
    CheckpointNotFound { path: String },

    #[error("Checkpoint incomplete at {path}: missing {missing:?}")]
    CheckpointIncomplete { path: String, missing: Vec<String> },

    #[error("Checkpoint corrupted: {path} - {reason}")]
    CheckpointCorrupted { path: String, reason: String },

    #[error("State mismatch for {key}: {reason}")]
    StateMismatch { key: String, reason: String },

    #[error("Invalid checkpoint transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // Checkpoint I/O errors
    #[error("Checkpoint write failed: {message}")]
    CheckpointWriteFailed { message: String },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    // Sharding errors
    #[error("Sharding already applied to model")]
    ShardingAlreadyApplied,

    #[error("Unknown module in sharding plan: {name}")]
    UnknownModule { name: String },

    // Collective errors
    #[error("Collective operation failed: {operation} on rank {rank} - {message}")]
    Collective {
        operation: String,
        rank: usize,
        message: String,
    },

    // Statistics errors
    #[error("Timer '{phase}' has no recorded samples")]
    EmptyTimer { phase: String },

    // Data errors
    #[error("Data source exhausted at epoch {epoch}, batch {batch}")]
    DataExhausted { epoch: u64, batch: u64 },

    #[error("Invalid dataset: {message}")]
    InvalidDataset { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Channel errors
    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// An error annotated with where in the run it happened
    #[error("[rank={rank}] {phase} failed at global_step={global_step}: {source}")]
    Step {
        rank: usize,
        phase: String,
        global_step: u64,
        #[source]
        source: Box<Error>,
    },
}

/// Coarse error taxonomy used for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Resume,
    CheckpointIo,
    Collective,
    Statistics,
    Data,
    Internal,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidConfig { .. }
            | Error::InvalidTopology { .. }
            | Error::ShardingAlreadyApplied
            | Error::UnknownModule { .. } => ErrorKind::Configuration,
            Error::CheckpointNotFound { .. }
            | Error::CheckpointIncomplete { .. }
            | Error::CheckpointCorrupted { .. }
            | Error::StateMismatch { .. }
            | Error::InvalidTransition { .. } => ErrorKind::Resume,
            Error::CheckpointWriteFailed { .. }
            | Error::Storage { .. }
            | Error::StoragePathNotFound { .. }
            | Error::Io(_)
            | Error::Serialization(_) => ErrorKind::CheckpointIo,
            Error::Collective { .. } => ErrorKind::Collective,
            Error::EmptyTimer { .. } => ErrorKind::Statistics,
            Error::DataExhausted { .. } | Error::InvalidDataset { .. } => ErrorKind::Data,
            Error::ChannelClosed { .. } | Error::Internal { .. } => ErrorKind::Internal,
            Error::Step { source, .. } => source.kind(),
        }
    }

    /// Returns true if this error must terminate the job.
    ///
    /// There is no local recovery layer: a partially-written checkpoint or a
    /// peer missing from a barrier leaves the run in an ambiguous state.
    pub fn is_fatal(&self) -> bool {
        true
    }

    /// Attach rank, phase and step to an error
    pub fn with_context(self, rank: usize, phase: impl Into<String>, global_step: u64) -> Self {
        match self {
            // keep the innermost context
            Error::Step { .. } => self,
            other => Error::Step {
                rank,
                phase: phase.into(),
                global_step,
                source: Box::new(other),
            },
        }
    }

    /// Strip any diagnostic context
    pub fn root(&self) -> &Error {
        match self {
            Error::Step { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
