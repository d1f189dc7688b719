//! Per-task facade over the subpartition in-flight logs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::{debug, warn};

use crate::inflight::{ReplayIterator, SubpartitionInFlightLog};
use crate::network::CheckpointBarrier;
use crate::record::StreamRecord;

/// Owns one in-flight log per output subpartition plus the checkpoint
/// barriers that closed each epoch slice, so a replay can re-emit the exact
/// barrier after the slice's records.
pub struct InFlightLogger<R: StreamRecord> {
    logs: Vec<SubpartitionInFlightLog<R>>,
    barriers: Mutex<BTreeMap<(u32, u64), CheckpointBarrier>>,
    current_epoch: AtomicU64,
}

impl<R: StreamRecord> InFlightLogger<R> {
    /// `initial_epoch` is the epoch of the first record to be logged: one
    /// past the checkpoint this task was restored from (1 on a fresh start).
    pub fn new(num_subpartitions: u32, initial_epoch: u64) -> InFlightLogger<R> {
        InFlightLogger {
            logs: (0..num_subpartitions)
                .map(|_| SubpartitionInFlightLog::new())
                .collect(),
            barriers: Mutex::new(BTreeMap::new()),
            current_epoch: AtomicU64::new(initial_epoch),
        }
    }

    pub fn num_subpartitions(&self) -> u32 {
        self.logs.len() as u32
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::Acquire)
    }

    pub fn log_record(&self, record: &R, subpartition: u32) {
        self.logs[subpartition as usize].log(record, self.current_epoch());
    }

    /// Closes the current epoch on every subpartition: the barrier is what
    /// separated this epoch's records from the next epoch's on the wire, and
    /// a replay has to reproduce that boundary.
    pub fn log_checkpoint_barrier(&self, barrier: CheckpointBarrier) {
        let epoch = self.current_epoch.fetch_add(1, Ordering::AcqRel);
        let mut barriers = self.barriers.lock().unwrap();
        for subpartition in 0..self.logs.len() as u32 {
            barriers.insert((subpartition, epoch), barrier);
        }
        debug!("barrier {} closed epoch {}", barrier.checkpoint_id, epoch);
    }

    /// Epoch ids with logged state newer than what the downstream has seen.
    pub fn checkpoint_ids_to_replay(&self, downstream_last_seen: u64) -> BTreeSet<u64> {
        let mut ids = BTreeSet::new();
        for log in &self.logs {
            ids.extend(log.epochs());
        }
        ids.extend(self.barriers.lock().unwrap().keys().map(|&(_, epoch)| epoch));
        ids.split_off(&(downstream_last_seen + 1))
    }

    /// Records of one epoch on one subpartition, in exact append order.
    pub fn replay_log(&self, subpartition: u32, epoch: u64) -> ReplayIterator<R> {
        self.logs[subpartition as usize].iterator_for(epoch)
    }

    pub fn checkpoint_barrier(&self, subpartition: u32, epoch: u64) -> Option<CheckpointBarrier> {
        self.barriers.lock().unwrap().get(&(subpartition, epoch)).copied()
    }

    /// Reclaims every slice and barrier below `epoch`; a failing child log
    /// is reported and skipped.
    pub fn checkpoint_complete(&self, epoch: u64) {
        for (subpartition, log) in self.logs.iter().enumerate() {
            if let Err(e) = log.checkpoint_complete(epoch) {
                warn!(
                    "in-flight log {} failed reclamation for checkpoint {}: {}",
                    subpartition, epoch, e
                );
            }
        }
        let mut barriers = self.barriers.lock().unwrap();
        barriers.retain(|&(_, e), _| e >= epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Plain(u32);

    impl StreamRecord for Plain {
        fn write_to(&self, out: &mut BytesMut) {
            out.extend_from_slice(&self.0.to_be_bytes());
        }
    }

    fn barrier(id: u64) -> CheckpointBarrier {
        CheckpointBarrier {
            checkpoint_id: id,
            timestamp: 1000 + id,
        }
    }

    #[test]
    fn epochs_advance_with_barriers() {
        let logger: InFlightLogger<Plain> = InFlightLogger::new(2, 1);
        logger.log_record(&Plain(1), 0);
        logger.log_checkpoint_barrier(barrier(1));
        logger.log_record(&Plain(2), 0);
        logger.log_record(&Plain(3), 1);
        logger.log_checkpoint_barrier(barrier(2));

        assert_eq!(logger.current_epoch(), 3);
        assert_eq!(logger.checkpoint_barrier(0, 1), Some(barrier(1)));
        assert_eq!(logger.checkpoint_barrier(1, 2), Some(barrier(2)));
        assert_eq!(logger.checkpoint_barrier(0, 3), None);

        let mut it = logger.replay_log(0, 2);
        assert_eq!(it.next(), Some(Plain(2)));
        assert_eq!(it.next(), None);
    }

    #[test]
    fn replay_ids_are_strictly_after_last_seen() {
        let logger: InFlightLogger<Plain> = InFlightLogger::new(1, 1);
        logger.log_record(&Plain(1), 0);
        logger.log_checkpoint_barrier(barrier(1));
        logger.log_checkpoint_barrier(barrier(2));
        logger.log_record(&Plain(2), 0);

        let ids: Vec<u64> = logger.checkpoint_ids_to_replay(1).into_iter().collect();
        assert_eq!(ids, vec![2, 3]);
        assert!(logger.checkpoint_ids_to_replay(7).is_empty());
    }

    #[test]
    fn completion_prunes_slices_and_barriers() {
        let logger: InFlightLogger<Plain> = InFlightLogger::new(1, 1);
        logger.log_record(&Plain(1), 0);
        logger.log_checkpoint_barrier(barrier(1));
        logger.log_record(&Plain(2), 0);

        logger.checkpoint_complete(2);
        assert_eq!(logger.checkpoint_barrier(0, 1), None);
        let ids: Vec<u64> = logger.checkpoint_ids_to_replay(0).into_iter().collect();
        assert_eq!(ids, vec![2]);
    }
}
