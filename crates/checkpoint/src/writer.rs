//! Binary codec for checkpoint state files
//!
//! Every model, optimizer and scheduler file starts with a fixed
//! little-endian header followed by a bincode-encoded `StateDict`. The
//! header records the step the file was written at, which lets a resume
//! detect a checkpoint mixing files from different saves.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use runtime_core::{Epoch, Error, Rank, Result, StateDict, Step};
use tracing::debug;

/// Magic bytes for checkpoint files
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"CKPT";

/// Checkpoint format version
pub const CHECKPOINT_VERSION: u32 = 2;

/// magic + version + step + epoch + kind + rank + payload length
const HEADER_LEN: usize = 4 + 4 + 8 + 8 + 1 + 4 + 8;

/// Which component a state file belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ShardKind {
    Model = 0,
    Optimizer = 1,
    Scheduler = 2,
}

impl ShardKind {
    pub fn file_stem(&self) -> &'static str {
        match self {
            ShardKind::Model => "model",
            ShardKind::Optimizer => "optimizer",
            ShardKind::Scheduler => "lr_scheduler",
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ShardKind::Model),
            1 => Some(ShardKind::Optimizer),
            2 => Some(ShardKind::Scheduler),
            _ => None,
        }
    }
}

/// Checkpoint file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardHeader {
    pub version: u32,
    pub step: Step,
    pub epoch: Epoch,
    pub kind: ShardKind,
    pub rank: Rank,
    pub payload_len: u64,
}

impl ShardHeader {
    pub fn new(kind: ShardKind, rank: Rank, step: Step, epoch: Epoch) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            step,
            epoch,
            kind,
            rank,
            payload_len: 0,
        }
    }
}

/// Serialize a header and state dict into one file body
pub fn encode_shard(header: ShardHeader, state: &StateDict) -> Result<Bytes> {
    let payload =
        bincode::serialize(state).map_err(|e| Error::Serialization(e.to_string()))?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(&CHECKPOINT_MAGIC);
    buf.put_u32_le(header.version);
    buf.put_u64_le(header.step);
    buf.put_u64_le(header.epoch);
    buf.put_u8(header.kind as u8);
    buf.put_u32_le(header.rank as u32);
    buf.put_u64_le(payload.len() as u64);
    buf.put_slice(&payload);

    debug!(
        kind = header.kind.file_stem(),
        rank = header.rank,
        step = header.step,
        size_bytes = buf.len(),
        "Encoded checkpoint file"
    );
    Ok(buf.freeze())
}

/// Parse a file body written by [`encode_shard`]. `path` is only used in
/// error messages.
pub fn decode_shard(path: &str, mut data: Bytes) -> Result<(ShardHeader, StateDict)> {
    let corrupted = |reason: String| Error::CheckpointCorrupted {
        path: path.to_string(),
        reason,
    };

    if data.len() < HEADER_LEN {
        return Err(corrupted(format!(
            "file is {} bytes, shorter than the {} byte header",
            data.len(),
            HEADER_LEN
        )));
    }

    let mut magic = [0u8; 4];
    data.copy_to_slice(&mut magic);
    if magic != CHECKPOINT_MAGIC {
        return Err(corrupted("invalid checkpoint magic".to_string()));
    }

    let version = data.get_u32_le();
    if version != CHECKPOINT_VERSION {
        return Err(corrupted(format!(
            "unsupported format version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }

    let step = data.get_u64_le();
    let epoch = data.get_u64_le();
    let kind_byte = data.get_u8();
    let kind = ShardKind::from_u8(kind_byte)
        .ok_or_else(|| corrupted(format!("unknown state kind {}", kind_byte)))?;
    let rank = data.get_u32_le() as Rank;
    let payload_len = data.get_u64_le();

    if data.remaining() as u64 != payload_len {
        return Err(corrupted(format!(
            "payload is {} bytes, header says {}",
            data.remaining(),
            payload_len
        )));
    }

    let state: StateDict = bincode::deserialize(&data)
        .map_err(|e| corrupted(format!("failed to decode state: {}", e)))?;

    Ok((
        ShardHeader {
            version,
            step,
            epoch,
            kind,
            rank,
            payload_len,
        },
        state,
    ))
}
