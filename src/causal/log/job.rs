//! Job-level causal log: the local vertex's log plus mirrors of upstreams.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use log::debug;

use crate::buffer::BufferPool;
use crate::causal::determinant::{Determinant, DeterminantEncoding};
use crate::causal::log::{VertexCausalLog, VertexCausalLogDelta};
use crate::causal::{ChannelId, PartitionId, VertexId};
use crate::error::CausalError;

/// Holds the determinant logs of every upstream vertex and of the local
/// vertex itself, and routes deltas between them.
///
/// Downstream channels register once; the log is deliberately opaque about
/// which partition a channel consumes — every downstream depends on the full
/// vertex history.
pub struct JobCausalLog {
    own: VertexCausalLog,
    upstream: DashMap<VertexId, VertexCausalLog>,
    encoding: Arc<dyn DeterminantEncoding>,
    pool: BufferPool,
    consumers: Mutex<HashSet<ChannelId>>,
}

impl JobCausalLog {
    pub fn new(
        vertex_id: VertexId,
        pool: BufferPool,
        encoding: Arc<dyn DeterminantEncoding>,
    ) -> JobCausalLog {
        JobCausalLog {
            own: VertexCausalLog::new(vertex_id, pool.clone()),
            upstream: DashMap::new(),
            encoding,
            pool,
            consumers: Mutex::new(HashSet::new()),
        }
    }

    pub fn vertex_id(&self) -> VertexId {
        self.own.vertex_id()
    }

    pub fn encoding(&self) -> &Arc<dyn DeterminantEncoding> {
        &self.encoding
    }

    pub fn register_downstream(&self, channel: ChannelId) {
        self.consumers.lock().unwrap().insert(channel);
    }

    pub fn unregister_downstream(&self, channel: ChannelId) {
        self.consumers.lock().unwrap().remove(&channel);
    }

    pub fn downstream_count(&self) -> usize {
        self.consumers.lock().unwrap().len()
    }

    /// Encodes and appends to the local main-thread log.
    pub fn append_determinant(
        &self,
        determinant: &Determinant,
        epoch: u64,
    ) -> Result<(), CausalError> {
        let mut encoded = Vec::new();
        self.encoding.encode_to(&mut encoded, determinant);
        self.own.append_main(&encoded, epoch)
    }

    /// Encodes and appends to the local log of one output subpartition.
    pub fn append_subpartition_determinant(
        &self,
        determinant: &Determinant,
        epoch: u64,
        partition: PartitionId,
        subpartition: u32,
    ) -> Result<(), CausalError> {
        let mut encoded = Vec::new();
        self.encoding.encode_to(&mut encoded, determinant);
        self.own
            .append_subpartition(partition, subpartition, &encoded, epoch)
    }

    /// Routes a delta received from upstream into that vertex's mirror,
    /// creating the mirror on first contact.
    pub fn process_upstream_delta(
        &self,
        delta: &VertexCausalLogDelta,
        epoch: u64,
    ) -> Result<(), CausalError> {
        debug!("merging delta of {} at epoch {}", delta.vertex_id, epoch);
        self.mirror(delta.vertex_id).process_delta(delta, epoch)?;
        Ok(())
    }

    fn mirror(&self, vertex_id: VertexId) -> dashmap::mapref::one::Ref<'_, VertexId, VertexCausalLog> {
        self.upstream
            .entry(vertex_id)
            .or_insert_with(|| VertexCausalLog::new(vertex_id, self.pool.clone()))
            .downgrade()
    }

    /// The full retained log of one vertex, from epoch 0.
    pub fn determinants_of_vertex(&self, vertex_id: VertexId) -> VertexCausalLogDelta {
        if vertex_id == self.own.vertex_id() {
            self.own.determinants_from(0)
        } else {
            self.mirror(vertex_id).determinants_from(0)
        }
    }

    /// New deltas of every known vertex (the local one included) for the
    /// given consumer; empty deltas are suppressed.
    pub fn next_for_downstream(
        &self,
        channel: ChannelId,
        epoch: u64,
    ) -> Vec<VertexCausalLogDelta> {
        let mut vertex_ids: Vec<VertexId> = self.upstream.iter().map(|e| *e.key()).collect();
        vertex_ids.sort();

        let mut deltas = Vec::with_capacity(vertex_ids.len() + 1);
        let own_delta = self.own.next_for_downstream(channel, epoch);
        if !own_delta.is_empty() {
            deltas.push(own_delta);
        }
        for vertex_id in vertex_ids {
            if let Some(mirror) = self.upstream.get(&vertex_id) {
                let delta = mirror.next_for_downstream(channel, epoch);
                if !delta.is_empty() {
                    deltas.push(delta);
                }
            }
        }
        deltas
    }

    pub fn main_log_length(&self) -> usize {
        self.own.main_log_length()
    }

    pub fn sub_log_length(&self, partition: PartitionId, subpartition: u32) -> usize {
        self.own.sub_log_length(partition, subpartition)
    }
}

impl crate::CheckpointListener for JobCausalLog {
    /// Reclaims every log, local and mirrored.
    fn checkpoint_complete(&self, checkpoint_id: u64) {
        self.own.checkpoint_complete(checkpoint_id);
        for mirror in self.upstream.iter() {
            mirror.value().checkpoint_complete(checkpoint_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::causal::determinant::CompactDeterminantEncoding;
    use crate::causal::RecordId;
    use crate::CheckpointListener;

    fn job_log(vertex: u16) -> JobCausalLog {
        JobCausalLog::new(
            VertexId(vertex),
            BufferPool::new(32, 32),
            Arc::new(CompactDeterminantEncoding),
        )
    }

    #[test]
    fn appended_determinants_round_trip_through_the_log() {
        let job = job_log(1);
        let determinants = vec![
            Determinant::Order {
                record: RecordId([1, 2, 3, 4]),
            },
            Determinant::Timer {
                timer_id: 4,
                timestamp: 77,
            },
            Determinant::Rng { value: 13 },
        ];
        for d in &determinants {
            job.append_determinant(d, 1).unwrap();
        }

        let delta = job.determinants_of_vertex(VertexId(1));
        let bytes = delta.main_delta.unwrap().bytes;
        let encoding = CompactDeterminantEncoding;
        let mut pos = 0;
        let mut decoded = Vec::new();
        while let Some(d) = encoding.decode_next(&bytes, &mut pos).unwrap() {
            decoded.push(d);
        }
        assert_eq!(decoded, determinants);
    }

    #[test]
    fn upstream_deltas_create_mirrors_on_first_contact() {
        let upstream_job = job_log(2);
        upstream_job
            .append_determinant(&Determinant::Rng { value: 99 }, 1)
            .unwrap();
        let delta = upstream_job.determinants_of_vertex(VertexId(2));

        let downstream_job = job_log(3);
        downstream_job.process_upstream_delta(&delta, 1).unwrap();
        assert_eq!(
            downstream_job.determinants_of_vertex(VertexId(2)),
            delta
        );
    }

    #[test]
    fn next_for_downstream_suppresses_silent_vertices() {
        let job = job_log(4);
        let channel = ChannelId::random();
        job.register_downstream(channel);
        assert_eq!(job.downstream_count(), 1);
        let other = ChannelId::random();
        job.register_downstream(other);
        job.unregister_downstream(other);
        assert_eq!(job.downstream_count(), 1);

        // Nothing logged anywhere: no deltas at all.
        assert!(job.next_for_downstream(channel, 0).is_empty());

        job.append_determinant(&Determinant::Source { offset: 5 }, 1)
            .unwrap();
        let first = job.next_for_downstream(channel, 0);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].vertex_id, VertexId(4));

        // Cursor advanced: silent again.
        assert!(job.next_for_downstream(channel, 0).is_empty());
    }

    #[test]
    fn deltas_cover_own_and_mirrored_logs() {
        let job = job_log(5);
        let channel = ChannelId::random();
        job.append_determinant(&Determinant::Rng { value: 1 }, 1)
            .unwrap();

        let upstream_job = job_log(6);
        upstream_job
            .append_determinant(&Determinant::Rng { value: 2 }, 1)
            .unwrap();
        job.process_upstream_delta(&upstream_job.determinants_of_vertex(VertexId(6)), 1)
            .unwrap();

        let deltas = job.next_for_downstream(channel, 0);
        let ids: Vec<VertexId> = deltas.iter().map(|d| d.vertex_id).collect();
        assert_eq!(ids, vec![VertexId(5), VertexId(6)]);
    }

    #[test]
    fn checkpoint_completion_reclaims_everywhere() {
        let job = job_log(7);
        job.append_determinant(&Determinant::Rng { value: 1 }, 1)
            .unwrap();
        job.append_determinant(&Determinant::Rng { value: 2 }, 2)
            .unwrap();

        let upstream_job = job_log(8);
        upstream_job
            .append_determinant(&Determinant::Rng { value: 3 }, 1)
            .unwrap();
        job.process_upstream_delta(&upstream_job.determinants_of_vertex(VertexId(8)), 1)
            .unwrap();

        job.checkpoint_complete(2);
        let own = job.determinants_of_vertex(VertexId(7));
        // Only the epoch-2 determinant survives.
        let encoding = CompactDeterminantEncoding;
        let bytes = own.main_delta.unwrap().bytes;
        let mut pos = 0;
        assert_eq!(
            encoding.decode_next(&bytes, &mut pos).unwrap(),
            Some(Determinant::Rng { value: 2 })
        );
        assert_eq!(encoding.decode_next(&bytes, &mut pos).unwrap(), None);
        assert!(job.determinants_of_vertex(VertexId(8)).is_empty());
    }
}
