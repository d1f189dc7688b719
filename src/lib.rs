//! Causal recovery core for a distributed stream-processing runtime.
//!
//! Two engines plus their coordination: an in-flight data log that retains
//! every emitted record until its checkpoint completes (`inflight`,
//! `network::writer`), and a causal determinant log that records every
//! nondeterministic choice and mirrors it downstream (`causal`). On failure,
//! a replacement task gathers the determinant history from its downstream
//! neighbors (`causal::recovery`) while its upstream neighbors replay the
//! in-flight records the restored state has not yet covered.
//!
//! Everything lives in process memory; the crate is a library embedded in
//! the task runtime, with the transport, the checkpoint coordinator and the
//! scheduler on the far side of the seams in `network` and `buffer`.

pub mod buffer;
pub mod causal;
pub mod error;
pub mod inflight;
pub mod network;
pub mod record;
pub mod wire;

pub use buffer::{Buffer, BufferBuilder, BufferPool, BufferSlice};
pub use error::CausalError;
pub use record::StreamRecord;

/// Callback seam for the checkpoint coordinator: invoked once a checkpoint
/// is complete, which makes all log state below it reclaimable.
pub trait CheckpointListener {
    fn checkpoint_complete(&self, checkpoint_id: u64);
}
