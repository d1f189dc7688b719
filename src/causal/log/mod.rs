//! Epoch-sliced causal logs.
//!
//! A thread log is the unit of append: one per logical thread of a vertex
//! (the main thread plus one per output subpartition). Vertex logs aggregate
//! thread logs, the job log aggregates the local vertex log with mirrors of
//! every upstream vertex. Reclamation flows strictly downward through
//! checkpoint-completion calls; logs hold no references back up.

use bytes::Bytes;

use crate::causal::ChannelId;
use crate::error::CausalError;

pub mod job;
pub mod thread;
pub mod vertex;

pub use job::JobCausalLog;
pub use thread::ThreadCausalLog;
pub use vertex::{SubpartitionThreadLogDelta, VertexCausalLog, VertexCausalLogDelta};

/// A contiguous run of log bytes together with the logical offset (within
/// the whole append history) at which it starts. Offsets let a receiver
/// discard the already-known prefix when deltas overlap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadLogDelta {
    pub bytes: Bytes,
    pub start_offset: u32,
}

impl ThreadLogDelta {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Capability set of a thread-log backend: append, read, reclaim, length,
/// plus the consumer-cursor and delta-merge operations the vertex layer
/// drives through it.
pub trait ThreadLog: Send + Sync {
    /// Appends encoded bytes under `epoch`. `epoch` must not precede the
    /// writer's current epoch; a greater epoch opens a new slice.
    fn append(&self, bytes: &[u8], epoch: u64) -> Result<(), CausalError>;

    /// All retained bytes from `start_epoch` onward, freshly allocated.
    fn delta_from(&self, start_epoch: u64) -> ThreadLogDelta;

    /// Bytes not yet seen by `consumer`, starting no earlier than `epoch`;
    /// advances that consumer's cursor to the tail.
    fn next_for_consumer(&self, consumer: ChannelId, epoch: u64) -> ThreadLogDelta;

    /// Merges a delta received from the upstream original of this log.
    /// Already-known bytes (by logical offset) are skipped, so re-delivery
    /// is harmless.
    fn process_delta(&self, delta: &ThreadLogDelta, epoch: u64) -> Result<(), CausalError>;

    /// Reclaims every slice with epoch strictly below `epoch`, recycling
    /// their buffers exactly once. Idempotent.
    fn checkpoint_complete(&self, epoch: u64) -> Result<(), CausalError>;

    /// Total retained byte count.
    fn log_length(&self) -> usize;

    /// Convenience form of [`ThreadLog::delta_from`] for bulk queries.
    fn determinants_from(&self, start_epoch: u64) -> Bytes {
        self.delta_from(start_epoch).bytes
    }
}
