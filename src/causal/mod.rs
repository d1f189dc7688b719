//! Causal determinant logging and recovery.
//!
//! Every nondeterministic choice a task makes is encoded as a determinant and
//! appended to the task's own vertex log. Downstream tasks mirror their
//! upstreams' logs via deltas so that, when a task fails, its downstream
//! neighbors collectively hold the determinant history needed to rebuild it.

use std::fmt;

use rand::RngCore;

pub mod determinant;
pub mod log;
pub mod recovery;

/// Identifies an operator instance within the job.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug, Hash)]
pub struct VertexId(pub u16);

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VertexId({})", self.0)
    }
}

/// Identifies an intermediate result partition.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug, Hash)]
pub struct PartitionId(pub uuid::Uuid);

impl PartitionId {
    pub fn random() -> PartitionId {
        PartitionId(uuid::Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartitionId({})", self.0)
    }
}

/// Identifies a downstream input channel consuming this task's output. Used
/// as the consumer key for delta cursors.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug, Hash)]
pub struct ChannelId(pub uuid::Uuid);

impl ChannelId {
    pub fn random() -> ChannelId {
        ChannelId(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.0)
    }
}

/// The ID of a record in a stream. Fixed at four bytes.
///
/// Ordering is plain lexicographic over the bytes. Merging two ids (for
/// records produced by combining inputs) is XOR, which keeps `merge`
/// commutative and self-inverse.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct RecordId(pub [u8; Self::NUM_BYTES]);

impl RecordId {
    pub const NUM_BYTES: usize = 4;

    pub fn random() -> RecordId {
        let mut bytes = [0u8; Self::NUM_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        RecordId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Self::NUM_BYTES] {
        &self.0
    }

    pub fn merge(one: RecordId, two: RecordId) -> RecordId {
        let mut out = one;
        RecordId::merge_into_first(&mut out, two);
        out
    }

    pub fn merge_into_first(one: &mut RecordId, two: RecordId) {
        for i in 0..Self::NUM_BYTES {
            one.0[i] ^= two.0[i];
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self)
    }
}
