//! In-flight record logging.
//!
//! Every record emitted on an output channel stays logged here until the
//! checkpoint that covers it completes downstream. The lower network stack
//! recycles buffers on send, so each replay takes its own set of retains:
//! creating an iterator retains every covered record once and the iterator
//! releases them all when dropped, which keeps reclamation from stealing
//! buffers out from under a live replay.

use std::collections::BTreeMap;
use std::sync::Mutex;

use log::debug;

use crate::error::CausalError;
use crate::record::StreamRecord;

pub mod logger;

pub use logger::InFlightLogger;

/// Epoch-sliced log of the records emitted on one output subpartition.
/// One mutex covers the full public API; `checkpoint_complete` may run on a
/// checkpoint-completion thread concurrently with the producer.
pub struct SubpartitionInFlightLog<R: StreamRecord> {
    slices: Mutex<BTreeMap<u64, Vec<R>>>,
}

impl<R: StreamRecord> SubpartitionInFlightLog<R> {
    pub fn new() -> SubpartitionInFlightLog<R> {
        SubpartitionInFlightLog {
            slices: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn log(&self, record: &R, epoch: u64) {
        record.retain();
        let mut slices = self.slices.lock().unwrap();
        slices.entry(epoch).or_insert_with(Vec::new).push(record.clone());
        debug!("logged a record for epoch {}", epoch);
    }

    /// Epochs currently holding records, ascending.
    pub fn epochs(&self) -> Vec<u64> {
        self.slices.lock().unwrap().keys().copied().collect()
    }

    pub fn num_records(&self) -> usize {
        self.slices.lock().unwrap().values().map(|v| v.len()).sum()
    }

    /// Snapshot iterator over everything from `start_epoch` onward. Appends
    /// made after creation are not reflected.
    pub fn iterator_from(&self, start_epoch: u64) -> ReplayIterator<R> {
        let slices = self.slices.lock().unwrap();
        Self::snapshot(slices.range(start_epoch..), start_epoch)
    }

    /// Snapshot iterator over exactly one epoch slice.
    pub fn iterator_for(&self, epoch: u64) -> ReplayIterator<R> {
        let slices = self.slices.lock().unwrap();
        Self::snapshot(slices.range(epoch..=epoch), epoch)
    }

    fn snapshot<'a, I>(range: I, start_epoch: u64) -> ReplayIterator<R>
    where
        I: Iterator<Item = (&'a u64, &'a Vec<R>)>,
        R: 'a,
    {
        let mut items = Vec::new();
        for (&epoch, records) in range {
            for record in records {
                record.retain();
                items.push((epoch, record.clone()));
            }
        }
        ReplayIterator::new(items, start_epoch)
    }

    /// Drops and recycles every slice below `epoch`. Idempotent; records a
    /// live iterator retained stay alive through the iterator's own retains.
    pub fn checkpoint_complete(&self, epoch: u64) -> Result<(), CausalError> {
        let mut slices = self.slices.lock().map_err(|_| CausalError::LogPoisoned)?;
        let stale: Vec<u64> = slices.range(..epoch).map(|(&e, _)| e).collect();
        for e in stale {
            debug!("removing in-flight epoch {}", e);
            for record in slices.remove(&e).unwrap() {
                record.recycle();
            }
        }
        Ok(())
    }
}

impl<R: StreamRecord> Default for SubpartitionInFlightLog<R> {
    fn default() -> SubpartitionInFlightLog<R> {
        SubpartitionInFlightLog::new()
    }
}

/// Finite bidirectional cursor over a snapshot of logged records.
///
/// Not restartable; create a new iterator for another pass. Holds one retain
/// per covered record and releases them all on drop.
pub struct ReplayIterator<R: StreamRecord> {
    items: Vec<(u64, R)>,
    cursor: usize,
    current_epoch: u64,
}

impl<R: StreamRecord> ReplayIterator<R> {
    fn new(items: Vec<(u64, R)>, start_epoch: u64) -> ReplayIterator<R> {
        let current_epoch = items.first().map(|(e, _)| *e).unwrap_or(start_epoch);
        ReplayIterator {
            items,
            cursor: 0,
            current_epoch,
        }
    }

    pub fn has_next(&self) -> bool {
        self.cursor < self.items.len()
    }

    pub fn has_previous(&self) -> bool {
        self.cursor > 0
    }

    /// Exact count of records not yet returned in the forward direction.
    pub fn num_remaining(&self) -> usize {
        self.items.len() - self.cursor
    }

    /// Epoch of the record last returned (or about to be returned when
    /// nothing was returned yet).
    pub fn current_epoch(&self) -> u64 {
        self.current_epoch
    }

    pub fn next(&mut self) -> Option<R> {
        let (epoch, record) = self.items.get(self.cursor)?;
        self.current_epoch = *epoch;
        self.cursor += 1;
        Some(record.clone())
    }

    pub fn previous(&mut self) -> Option<R> {
        if self.cursor == 0 {
            return None;
        }
        self.cursor -= 1;
        let (epoch, record) = &self.items[self.cursor];
        self.current_epoch = *epoch;
        Some(record.clone())
    }
}

impl<R: StreamRecord> Drop for ReplayIterator<R> {
    fn drop(&mut self) {
        for (_, record) in &self.items {
            record.recycle();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Buffer, BufferPool};
    use bytes::BytesMut;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Plain(u32);

    impl StreamRecord for Plain {
        fn write_to(&self, out: &mut BytesMut) {
            out.extend_from_slice(&self.0.to_be_bytes());
        }
    }

    fn drain<R: StreamRecord>(it: &mut ReplayIterator<R>) -> Vec<R> {
        let mut out = Vec::new();
        while let Some(r) = it.next() {
            out.push(r);
        }
        out
    }

    #[test]
    fn forward_replay_across_epochs() {
        let log = SubpartitionInFlightLog::new();
        for i in 1..=5 {
            log.log(&Plain(i), 3);
        }
        for i in 6..=8 {
            log.log(&Plain(i), 4);
        }

        let mut it = log.iterator_from(3);
        assert!(it.has_next());
        assert_eq!(it.num_remaining(), 8);
        assert_eq!(it.current_epoch(), 3);

        let mut seen = Vec::new();
        while it.has_next() {
            let epoch_before = it.current_epoch();
            let record = it.next().unwrap();
            if record == Plain(6) {
                assert_eq!(epoch_before, 3);
                assert_eq!(it.current_epoch(), 4);
            }
            seen.push(record);
        }
        assert_eq!(seen, (1..=8).map(Plain).collect::<Vec<_>>());
        assert_eq!(it.num_remaining(), 0);
    }

    #[test]
    fn backward_traversal_returns_the_same_records() {
        let log = SubpartitionInFlightLog::new();
        log.log(&Plain(1), 1);
        log.log(&Plain(2), 2);

        let mut it = log.iterator_from(1);
        assert!(!it.has_previous());
        assert_eq!(it.next(), Some(Plain(1)));
        assert_eq!(it.next(), Some(Plain(2)));
        assert!(!it.has_next());

        assert_eq!(it.previous(), Some(Plain(2)));
        assert_eq!(it.current_epoch(), 2);
        assert_eq!(it.num_remaining(), 1);
        assert_eq!(it.previous(), Some(Plain(1)));
        assert_eq!(it.current_epoch(), 1);
        assert!(!it.has_previous());

        // Forward again after rewinding.
        assert_eq!(drain(&mut it), vec![Plain(1), Plain(2)]);
    }

    #[test]
    fn iterator_skips_empty_start_epoch() {
        let log = SubpartitionInFlightLog::new();
        log.log(&Plain(10), 5);
        let mut it = log.iterator_from(2);
        assert_eq!(it.current_epoch(), 5);
        assert_eq!(drain(&mut it), vec![Plain(10)]);
    }

    #[test]
    fn iterator_past_the_last_epoch_is_exhausted() {
        let log = SubpartitionInFlightLog::new();
        log.log(&Plain(1), 1);
        let it = log.iterator_from(9);
        assert!(!it.has_next());
        assert_eq!(it.num_remaining(), 0);
    }

    #[test]
    fn iterator_observes_a_snapshot() {
        let log = SubpartitionInFlightLog::new();
        log.log(&Plain(1), 1);
        let mut it = log.iterator_from(1);
        log.log(&Plain(2), 1);
        assert_eq!(drain(&mut it), vec![Plain(1)]);
        assert_eq!(log.num_records(), 2);
    }

    fn buffer_with(pool: &BufferPool, content: &[u8]) -> Buffer {
        let mut builder = pool.request_builder_blocking();
        builder.append(content);
        builder.finish()
    }

    #[test]
    fn checkpoint_reclaim_recycles_exactly_once() {
        let pool = BufferPool::new(4, 8);
        let log = SubpartitionInFlightLog::new();

        let a = buffer_with(&pool, b"epoch1");
        let b = buffer_with(&pool, b"epoch2");
        log.log(&a, 1);
        log.log(&b, 2);
        // Producer hands its own references to the network, which recycles.
        a.recycle();
        b.recycle();
        assert_eq!(a.ref_count(), 1);

        log.checkpoint_complete(2).unwrap();
        assert_eq!(a.ref_count(), 0);
        assert_eq!(b.ref_count(), 1);
        assert_eq!(log.num_records(), 1);

        // Idempotent.
        log.checkpoint_complete(2).unwrap();
        assert_eq!(b.ref_count(), 1);
    }

    #[test]
    fn live_iterator_keeps_buffers_out_of_reclamation() {
        let pool = BufferPool::new(4, 8);
        let log = SubpartitionInFlightLog::new();
        let a = buffer_with(&pool, b"payload");
        log.log(&a, 1);
        a.recycle();

        let mut it = log.iterator_from(1);
        log.checkpoint_complete(2).unwrap();

        // The log's reference is gone but the iterator still holds one.
        assert_eq!(a.ref_count(), 1);
        let replayed = it.next().unwrap();
        assert_eq!(replayed.bytes().as_ref(), b"payload");

        drop(it);
        assert_eq!(a.ref_count(), 0);
        assert_eq!(pool.free_segments(), 4);
    }
}
