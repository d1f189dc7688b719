//! Per-vertex aggregation of thread logs and the vertex-level delta.
//!
//! The same type serves two roles: the local vertex's own log (written by
//! the task) and a downstream mirror of an upstream vertex's log (written by
//! `process_delta`). A delta's inner maps are kept sorted so that equal logs
//! always encode to identical bytes.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use log::warn;

use crate::buffer::BufferPool;
use crate::causal::log::{ThreadCausalLog, ThreadLog, ThreadLogDelta};
use crate::causal::{ChannelId, PartitionId, VertexId};
use crate::error::CausalError;
use crate::wire::WireReader;

/// A thread-log delta addressed to one output subpartition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubpartitionThreadLogDelta {
    pub subpartition: u32,
    pub delta: ThreadLogDelta,
}

impl SubpartitionThreadLogDelta {
    pub fn new(subpartition: u32, delta: ThreadLogDelta) -> SubpartitionThreadLogDelta {
        SubpartitionThreadLogDelta {
            subpartition,
            delta,
        }
    }
}

/// Everything one vertex has to say since some epoch: the main-thread delta
/// (absent when empty) plus per-(partition, subpartition) deltas in sorted
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexCausalLogDelta {
    pub vertex_id: VertexId,
    pub main_delta: Option<ThreadLogDelta>,
    pub partition_deltas: BTreeMap<PartitionId, BTreeMap<u32, SubpartitionThreadLogDelta>>,
}

impl VertexCausalLogDelta {
    pub fn is_empty(&self) -> bool {
        self.main_delta.is_none() && self.partition_deltas.is_empty()
    }

    /// Flattens the delta into one determinant byte stream: main-thread bytes
    /// first, then every subpartition delta in canonical order. Used by the
    /// recovery coordinator, which only needs a decodable prefix-comparable
    /// stream.
    pub fn flattened(&self) -> Bytes {
        let mut out = BytesMut::new();
        if let Some(main) = &self.main_delta {
            out.put_slice(&main.bytes);
        }
        for subs in self.partition_deltas.values() {
            for sub_delta in subs.values() {
                out.put_slice(&sub_delta.delta.bytes);
            }
        }
        out.freeze()
    }

    pub fn write_to(&self, out: &mut BytesMut) {
        out.put_u16(self.vertex_id.0);
        match &self.main_delta {
            Some(delta) => {
                out.put_u8(1);
                out.put_u32(delta.start_offset);
                out.put_u32(delta.bytes.len() as u32);
                out.put_slice(&delta.bytes);
            }
            None => out.put_u8(0),
        }
        out.put_u32(self.partition_deltas.len() as u32);
        for (partition, subs) in &self.partition_deltas {
            out.put_slice(partition.as_bytes());
            out.put_u32(subs.len() as u32);
            for (&subpartition, sub_delta) in subs {
                out.put_u32(subpartition);
                out.put_u32(sub_delta.delta.start_offset);
                out.put_u32(sub_delta.delta.bytes.len() as u32);
                out.put_slice(&sub_delta.delta.bytes);
            }
        }
    }

    pub fn read_from(reader: &mut WireReader<'_>) -> Result<VertexCausalLogDelta, CausalError> {
        let vertex_id = VertexId(reader.read_u16()?);
        let main_delta = match reader.read_u8()? {
            0 => None,
            1 => {
                let start_offset = reader.read_u32()?;
                let len = reader.read_u32()? as usize;
                Some(ThreadLogDelta {
                    bytes: reader.read_bytes(len)?,
                    start_offset,
                })
            }
            _ => return Err(CausalError::InvalidWire("main delta marker")),
        };
        let num_partitions = reader.read_u32()?;
        let mut partition_deltas = BTreeMap::new();
        for _ in 0..num_partitions {
            let partition = PartitionId(reader.read_uuid()?);
            let num_subs = reader.read_u32()?;
            let mut subs = BTreeMap::new();
            for _ in 0..num_subs {
                let subpartition = reader.read_u32()?;
                let start_offset = reader.read_u32()?;
                let len = reader.read_u32()? as usize;
                subs.insert(
                    subpartition,
                    SubpartitionThreadLogDelta::new(
                        subpartition,
                        ThreadLogDelta {
                            bytes: reader.read_bytes(len)?,
                            start_offset,
                        },
                    ),
                );
            }
            partition_deltas.insert(partition, subs);
        }
        Ok(VertexCausalLogDelta {
            vertex_id,
            main_delta,
            partition_deltas,
        })
    }
}

/// One vertex's causal log: a main-thread log plus a sparse, concurrently
/// grown `(partition, subpartition)` map of thread logs, all drawing from
/// the same buffer pool.
pub struct VertexCausalLog {
    vertex_id: VertexId,
    pool: BufferPool,
    main: Arc<dyn ThreadLog>,
    partitions: DashMap<PartitionId, DashMap<u32, Arc<dyn ThreadLog>>>,
}

impl VertexCausalLog {
    pub fn new(vertex_id: VertexId, pool: BufferPool) -> VertexCausalLog {
        VertexCausalLog {
            vertex_id,
            main: Arc::new(ThreadCausalLog::new(pool.clone())),
            pool,
            partitions: DashMap::new(),
        }
    }

    pub fn vertex_id(&self) -> VertexId {
        self.vertex_id
    }

    /// Find-or-create is atomic per `(partition, subpartition)` pair.
    fn sub_log(&self, partition: PartitionId, subpartition: u32) -> Arc<dyn ThreadLog> {
        let inner = self.partitions.entry(partition).or_insert_with(DashMap::new);
        let log = inner.value().entry(subpartition).or_insert_with(|| {
            Arc::new(ThreadCausalLog::new(self.pool.clone())) as Arc<dyn ThreadLog>
        });
        log.value().clone()
    }

    pub fn append_main(&self, bytes: &[u8], epoch: u64) -> Result<(), CausalError> {
        self.main.append(bytes, epoch)
    }

    pub fn append_subpartition(
        &self,
        partition: PartitionId,
        subpartition: u32,
        bytes: &[u8],
        epoch: u64,
    ) -> Result<(), CausalError> {
        self.sub_log(partition, subpartition).append(bytes, epoch)
    }

    /// Merges a delta received for this vertex into the matching thread logs.
    pub fn process_delta(
        &self,
        delta: &VertexCausalLogDelta,
        epoch: u64,
    ) -> Result<(), CausalError> {
        if let Some(main) = &delta.main_delta {
            self.main.process_delta(main, epoch)?;
        }
        for (partition, subs) in &delta.partition_deltas {
            for sub_delta in subs.values() {
                self.sub_log(*partition, sub_delta.subpartition)
                    .process_delta(&sub_delta.delta, epoch)?;
            }
        }
        Ok(())
    }

    pub fn determinants_from(&self, start_epoch: u64) -> VertexCausalLogDelta {
        self.compose(|log| log.delta_from(start_epoch))
    }

    pub fn next_for_downstream(&self, consumer: ChannelId, epoch: u64) -> VertexCausalLogDelta {
        self.compose(|log| log.next_for_consumer(consumer, epoch))
    }

    fn compose<F>(&self, read: F) -> VertexCausalLogDelta
    where
        F: Fn(&dyn ThreadLog) -> ThreadLogDelta,
    {
        let main = read(self.main.as_ref());
        let main_delta = if main.is_empty() { None } else { Some(main) };

        let mut partition_deltas = BTreeMap::new();
        for partition in self.partitions.iter() {
            let mut subs = BTreeMap::new();
            for sub in partition.value().iter() {
                let delta = read(sub.value().as_ref());
                if !delta.is_empty() {
                    subs.insert(
                        *sub.key(),
                        SubpartitionThreadLogDelta::new(*sub.key(), delta),
                    );
                }
            }
            if !subs.is_empty() {
                partition_deltas.insert(*partition.key(), subs);
            }
        }

        VertexCausalLogDelta {
            vertex_id: self.vertex_id,
            main_delta,
            partition_deltas,
        }
    }

    /// Broadcasts reclamation to every child log; a failing child is logged
    /// and the broadcast keeps going.
    pub fn checkpoint_complete(&self, epoch: u64) {
        if let Err(e) = self.main.checkpoint_complete(epoch) {
            warn!(
                "{} main-thread log failed reclamation for checkpoint {}: {}",
                self.vertex_id, epoch, e
            );
        }
        for partition in self.partitions.iter() {
            for sub in partition.value().iter() {
                if let Err(e) = sub.value().checkpoint_complete(epoch) {
                    warn!(
                        "{} log ({}, {}) failed reclamation for checkpoint {}: {}",
                        self.vertex_id,
                        partition.key(),
                        sub.key(),
                        epoch,
                        e
                    );
                }
            }
        }
    }

    pub fn main_log_length(&self) -> usize {
        self.main.log_length()
    }

    pub fn sub_log_length(&self, partition: PartitionId, subpartition: u32) -> usize {
        self.sub_log(partition, subpartition).log_length()
    }
}
