//! Buffer-chain thread log.
//!
//! Bytes are appended into pool segments chained per epoch slice. Each slice
//! remembers the logical offset of its first byte, which keeps delta offsets
//! stable across reclamation. One mutex guards the slice map, the consumer
//! cursors, and reclamation; critical sections are short copies.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use bytes::{BufMut, BytesMut};
use log::{debug, warn};

use crate::buffer::{Buffer, BufferBuilder, BufferPool};
use crate::causal::log::{ThreadLog, ThreadLogDelta};
use crate::causal::ChannelId;
use crate::error::CausalError;

#[derive(Clone, Copy)]
struct Cursor {
    epoch: u64,
    offset: usize,
}

struct EpochSlice {
    /// Logical offset of this slice's first byte within the append history.
    start: u64,
    len: usize,
    sealed: Vec<Buffer>,
    tail: Option<BufferBuilder>,
}

impl EpochSlice {
    fn new(start: u64) -> EpochSlice {
        EpochSlice {
            start,
            len: 0,
            sealed: Vec::new(),
            tail: None,
        }
    }

    fn seal_tail(&mut self) {
        if let Some(tail) = self.tail.take() {
            if tail.is_empty() {
                tail.finish().recycle();
            } else {
                self.sealed.push(tail.finish());
            }
        }
    }

    /// Copies bytes starting `from` bytes into the slice onto `out`.
    fn copy_from(&self, from: usize, out: &mut BytesMut) {
        let mut skip = from;
        for buffer in &self.sealed {
            let chunk = buffer.bytes();
            if skip >= chunk.len() {
                skip -= chunk.len();
                continue;
            }
            out.put_slice(&chunk[skip..]);
            skip = 0;
        }
        if let Some(tail) = &self.tail {
            let chunk = tail.written();
            if skip < chunk.len() {
                out.put_slice(&chunk[skip..]);
            }
        }
    }
}

struct State {
    slices: BTreeMap<u64, EpochSlice>,
    current_epoch: u64,
    total_appended: u64,
    cursors: HashMap<ChannelId, Cursor>,
}

/// Single-writer, multi-reader epoch-sliced byte log backed by pool buffers.
pub struct ThreadCausalLog {
    pool: BufferPool,
    state: Mutex<State>,
}

impl ThreadCausalLog {
    pub fn new(pool: BufferPool) -> ThreadCausalLog {
        ThreadCausalLog {
            pool,
            state: Mutex::new(State {
                slices: BTreeMap::new(),
                current_epoch: 0,
                total_appended: 0,
                cursors: HashMap::new(),
            }),
        }
    }

    fn append_locked(
        state: &mut State,
        pool: &BufferPool,
        mut bytes: &[u8],
        epoch: u64,
    ) -> Result<(), CausalError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let start = state.total_appended;
        let slice = state
            .slices
            .entry(epoch)
            .or_insert_with(|| EpochSlice::new(start));
        while !bytes.is_empty() {
            if slice.tail.is_none() {
                slice.tail = Some(pool.try_request_builder()?);
            }
            let tail = slice.tail.as_mut().unwrap();
            let copied = tail.append(bytes);
            bytes = &bytes[copied..];
            slice.len += copied;
            state.total_appended += copied as u64;
            if tail.is_full() {
                slice.seal_tail();
            }
        }
        Ok(())
    }

    fn open_epoch(state: &mut State, epoch: u64) {
        if epoch > state.current_epoch {
            let closing = state.current_epoch;
            if let Some(slice) = state.slices.get_mut(&closing) {
                slice.seal_tail();
            }
            state.current_epoch = epoch;
        }
    }
}

impl ThreadLog for ThreadCausalLog {
    fn append(&self, bytes: &[u8], epoch: u64) -> Result<(), CausalError> {
        let mut state = self.state.lock().map_err(|_| CausalError::LogPoisoned)?;
        if epoch < state.current_epoch {
            return Err(CausalError::EpochReclaimed {
                requested: epoch,
                earliest: state.current_epoch,
            });
        }
        Self::open_epoch(&mut state, epoch);
        Self::append_locked(&mut state, &self.pool, bytes, epoch)
    }

    fn delta_from(&self, start_epoch: u64) -> ThreadLogDelta {
        let state = self.state.lock().unwrap();
        let mut out = BytesMut::new();
        let mut first_offset = None;
        for (_, slice) in state.slices.range(start_epoch..) {
            if slice.len == 0 {
                continue;
            }
            if first_offset.is_none() {
                first_offset = Some(slice.start);
            }
            slice.copy_from(0, &mut out);
        }
        ThreadLogDelta {
            bytes: out.freeze(),
            start_offset: first_offset.unwrap_or(state.total_appended) as u32,
        }
    }

    fn next_for_consumer(&self, consumer: ChannelId, epoch: u64) -> ThreadLogDelta {
        let mut state = self.state.lock().unwrap();

        let mut cursor = state
            .cursors
            .get(&consumer)
            .copied()
            .unwrap_or(Cursor { epoch, offset: 0 });
        if cursor.epoch < epoch {
            cursor = Cursor { epoch, offset: 0 };
        }
        if let Some((&earliest, _)) = state.slices.iter().next() {
            if cursor.epoch < earliest {
                warn!(
                    "consumer {} cursor at reclaimed epoch {}; snapping forward to {}",
                    consumer, cursor.epoch, earliest
                );
                cursor = Cursor {
                    epoch: earliest,
                    offset: 0,
                };
            }
        }

        let mut out = BytesMut::new();
        let mut start_offset = state.total_appended;
        let mut started = false;
        for (&e, slice) in state.slices.range(cursor.epoch..) {
            let from = if e == cursor.epoch { cursor.offset } else { 0 };
            if from >= slice.len {
                continue;
            }
            if !started {
                start_offset = slice.start + from as u64;
                started = true;
            }
            slice.copy_from(from, &mut out);
        }

        let tail_epoch = state.current_epoch;
        let tail_len = state.slices.get(&tail_epoch).map(|s| s.len).unwrap_or(0);
        state.cursors.insert(
            consumer,
            Cursor {
                epoch: tail_epoch,
                offset: tail_len,
            },
        );

        ThreadLogDelta {
            bytes: out.freeze(),
            start_offset: start_offset as u32,
        }
    }

    fn process_delta(&self, delta: &ThreadLogDelta, epoch: u64) -> Result<(), CausalError> {
        let mut state = self.state.lock().map_err(|_| CausalError::LogPoisoned)?;
        let start = delta.start_offset as u64;
        let end = start + delta.bytes.len() as u64;
        if end <= state.total_appended {
            return Ok(());
        }
        if start > state.total_appended {
            return Err(CausalError::InvalidWire("noncontiguous log delta"));
        }
        let fresh = &delta.bytes[(state.total_appended - start) as usize..];
        Self::open_epoch(&mut state, epoch);
        let target = state.current_epoch;
        Self::append_locked(&mut state, &self.pool, fresh, target)
    }

    fn checkpoint_complete(&self, epoch: u64) -> Result<(), CausalError> {
        let mut state = self.state.lock().map_err(|_| CausalError::LogPoisoned)?;
        let stale: Vec<u64> = state.slices.range(..epoch).map(|(&e, _)| e).collect();
        for e in stale {
            let mut slice = state.slices.remove(&e).unwrap();
            slice.seal_tail();
            debug!("reclaiming epoch {} ({} bytes)", e, slice.len);
            for buffer in slice.sealed {
                buffer.recycle();
            }
        }
        if state.current_epoch < epoch {
            state.current_epoch = epoch;
        }
        Ok(())
    }

    fn log_length(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.slices.values().map(|s| s.len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with_pool(segments: usize, segment_size: usize) -> (ThreadCausalLog, BufferPool) {
        let pool = BufferPool::new(segments, segment_size);
        (ThreadCausalLog::new(pool.clone()), pool)
    }

    #[test]
    fn append_and_bulk_read() {
        let (log, _pool) = log_with_pool(8, 8);
        log.append(b"aaaa", 1).unwrap();
        log.append(b"bbbbbbbbbb", 1).unwrap();
        log.append(b"cc", 2).unwrap();

        assert_eq!(log.log_length(), 16);
        assert_eq!(log.determinants_from(0).as_ref(), b"aaaabbbbbbbbbbcc");
        assert_eq!(log.determinants_from(2).as_ref(), b"cc");
        assert_eq!(log.determinants_from(3).len(), 0);
    }

    #[test]
    fn bulk_read_is_idempotent() {
        let (log, _pool) = log_with_pool(8, 8);
        log.append(b"0123456789", 1).unwrap();
        let first = log.determinants_from(0);
        let second = log.determinants_from(0);
        assert_eq!(first, second);
    }

    #[test]
    fn append_to_past_epoch_rejected() {
        let (log, _pool) = log_with_pool(8, 8);
        log.append(b"x", 5).unwrap();
        assert!(matches!(
            log.append(b"y", 4),
            Err(CausalError::EpochReclaimed {
                requested: 4,
                earliest: 5
            })
        ));
    }

    #[test]
    fn consumer_deltas_cover_the_append_history() {
        let (log, _pool) = log_with_pool(8, 4);
        let consumer = ChannelId::random();

        log.append(b"abc", 1).unwrap();
        let d1 = log.next_for_consumer(consumer, 0);
        assert_eq!(d1.bytes.as_ref(), b"abc");
        assert_eq!(d1.start_offset, 0);

        log.append(b"de", 1).unwrap();
        log.append(b"fgh", 2).unwrap();
        let d2 = log.next_for_consumer(consumer, 0);
        assert_eq!(d2.bytes.as_ref(), b"defgh");
        assert_eq!(d2.start_offset, 3);

        // Nothing new: empty delta.
        let d3 = log.next_for_consumer(consumer, 0);
        assert!(d3.is_empty());

        let mut seen = Vec::new();
        seen.extend_from_slice(&d1.bytes);
        seen.extend_from_slice(&d2.bytes);
        assert_eq!(seen, b"abcdefgh");
    }

    #[test]
    fn independent_consumers() {
        let (log, _pool) = log_with_pool(8, 8);
        let a = ChannelId::random();
        let b = ChannelId::random();

        log.append(b"1111", 1).unwrap();
        assert_eq!(log.next_for_consumer(a, 0).bytes.as_ref(), b"1111");
        log.append(b"2222", 2).unwrap();
        assert_eq!(log.next_for_consumer(a, 0).bytes.as_ref(), b"2222");
        assert_eq!(log.next_for_consumer(b, 0).bytes.as_ref(), b"11112222");
    }

    #[test]
    fn reclamation_recycles_and_shrinks() {
        let (log, pool) = log_with_pool(4, 4);
        log.append(b"aaaa", 1).unwrap(); // one full segment
        log.append(b"bb", 2).unwrap();
        assert_eq!(pool.free_segments(), 2);

        log.checkpoint_complete(2).unwrap();
        assert_eq!(log.log_length(), 2);
        assert_eq!(pool.free_segments(), 3);
        assert_eq!(log.determinants_from(0).as_ref(), b"bb");

        // Idempotent.
        log.checkpoint_complete(2).unwrap();
        assert_eq!(pool.free_segments(), 3);
    }

    #[test]
    fn stale_consumer_cursor_snaps_forward() {
        let (log, _pool) = log_with_pool(8, 8);
        let consumer = ChannelId::random();
        log.append(b"old", 1).unwrap();
        log.next_for_consumer(consumer, 0);
        log.append(b"mid", 2).unwrap();
        log.append(b"new", 3).unwrap();
        log.checkpoint_complete(3).unwrap();

        // The consumer's cursor points at epoch 1/2 state that is gone; it
        // snaps to the earliest retained epoch and reads everything there.
        let delta = log.next_for_consumer(consumer, 0);
        assert_eq!(delta.bytes.as_ref(), b"new");
    }

    #[test]
    fn delta_merge_dedupes_overlap() {
        let (source, _p1) = log_with_pool(8, 8);
        let (mirror, _p2) = log_with_pool(8, 8);
        source.append(b"abcd", 1).unwrap();

        let d1 = source.delta_from(0);
        mirror.process_delta(&d1, 1).unwrap();
        source.append(b"ef", 1).unwrap();

        // Overlapping re-delivery: full log again plus the new suffix.
        let d2 = source.delta_from(0);
        mirror.process_delta(&d2, 1).unwrap();
        mirror.process_delta(&d2, 1).unwrap();

        assert_eq!(mirror.determinants_from(0).as_ref(), b"abcdef");
    }

    #[test]
    fn exhausted_pool_reports_out_of_buffers() {
        let (log, _pool) = log_with_pool(1, 4);
        assert!(matches!(
            log.append(b"more-than-one-segment", 1),
            Err(CausalError::BufferExhausted)
        ));
    }
}
