//! Fixed-capacity buffer pool with manual reference counting.
//!
//! The transport layer owns buffers with a zero-copy contract: whoever hands
//! a buffer to the network must expect it to be recycled on send, and every
//! additional user (the in-flight log, a replay iterator) takes its own
//! retain. The pool hands out a bounded number of segment permits; a segment
//! is identified by an `(index, generation)` pair so that a recycle arriving
//! after the segment was re-issued is detected rather than silently corrupting
//! an unrelated buffer.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use bytes::{Bytes, BytesMut};

use crate::error::CausalError;

fn quick_hash(bytes: &[u8]) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::Hasher;

    let mut hasher = DefaultHasher::new();
    hasher.write(bytes);
    hasher.finish()
}

struct Slot {
    ref_count: AtomicU32,
    generation: AtomicU32,
}

struct Shared {
    segment_size: usize,
    slots: Vec<Slot>,
    free: Mutex<Vec<u32>>,
    available: Condvar,
}

/// Pool of `num_segments` fixed-capacity segments.
///
/// Cloning the pool clones a handle to the same shared arena. Builders are
/// acquired either blocking (`request_builder_blocking`, the hot emission
/// path) or failing fast (`try_request_builder`, used by the causal logs
/// which surface `BufferExhausted` to their caller).
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<Shared>,
}

impl BufferPool {
    pub fn new(num_segments: usize, segment_size: usize) -> BufferPool {
        assert!(num_segments > 0, "pool needs at least one segment");
        assert!(segment_size > 0, "segments must have nonzero capacity");

        let mut slots = Vec::with_capacity(num_segments);
        let mut free = Vec::with_capacity(num_segments);
        for i in 0..num_segments {
            slots.push(Slot {
                ref_count: AtomicU32::new(0),
                generation: AtomicU32::new(0),
            });
            free.push(i as u32);
        }

        BufferPool {
            shared: Arc::new(Shared {
                segment_size,
                slots,
                free: Mutex::new(free),
                available: Condvar::new(),
            }),
        }
    }

    pub fn segment_size(&self) -> usize {
        self.shared.segment_size
    }

    /// Number of segments currently available for acquisition.
    pub fn free_segments(&self) -> usize {
        self.shared.free.lock().unwrap().len()
    }

    /// Blocks until a segment is available.
    pub fn request_builder_blocking(&self) -> BufferBuilder {
        let mut free = self.shared.free.lock().unwrap();
        while free.is_empty() {
            free = self.shared.available.wait(free).unwrap();
        }
        let index = free.pop().unwrap();
        drop(free);
        self.issue(index)
    }

    /// Fails with `BufferExhausted` when no segment is available.
    pub fn try_request_builder(&self) -> Result<BufferBuilder, CausalError> {
        let index = self
            .shared
            .free
            .lock()
            .unwrap()
            .pop()
            .ok_or(CausalError::BufferExhausted)?;
        Ok(self.issue(index))
    }

    fn issue(&self, index: u32) -> BufferBuilder {
        let slot = &self.shared.slots[index as usize];
        let prev = slot.ref_count.swap(1, Ordering::AcqRel);
        assert_eq!(prev, 0, "issued a segment that still has live references");
        BufferBuilder {
            staging: BytesMut::with_capacity(self.shared.segment_size),
            index,
            generation: slot.generation.load(Ordering::Acquire),
            shared: self.shared.clone(),
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BufferPool(segments: {}, free: {}, segment_size: {})",
            self.shared.slots.len(),
            self.free_segments(),
            self.shared.segment_size
        )
    }
}

/// Write-side view of a single segment. Not thread safe; owned by one
/// producer until `finish` freezes it into a shareable [`Buffer`].
pub struct BufferBuilder {
    staging: BytesMut,
    index: u32,
    generation: u32,
    shared: Arc<Shared>,
}

impl BufferBuilder {
    /// Copies as much of `source` as fits. Returns the number of copied bytes.
    pub fn append(&mut self, source: &[u8]) -> usize {
        let available = self.shared.segment_size - self.staging.len();
        let to_copy = source.len().min(available);
        self.staging.extend_from_slice(&source[..to_copy]);
        to_copy
    }

    pub fn is_full(&self) -> bool {
        self.staging.len() == self.shared.segment_size
    }

    pub fn is_empty(&self) -> bool {
        self.staging.is_empty()
    }

    pub fn written(&self) -> &[u8] {
        &self.staging
    }

    pub fn capacity(&self) -> usize {
        self.shared.segment_size
    }

    /// Freezes the written bytes into a [`Buffer`] holding the segment's
    /// single initial reference.
    pub fn finish(self) -> Buffer {
        Buffer {
            data: self.staging.freeze(),
            index: self.index,
            generation: self.generation,
            shared: self.shared,
        }
    }
}

impl fmt::Debug for BufferBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BufferBuilder(segment: {}, written: {}/{})",
            self.index,
            self.staging.len(),
            self.shared.segment_size
        )
    }
}

/// Read-only, reference-counted handle to a finished segment.
///
/// Clones are cheap views onto the same segment and do NOT adjust the
/// reference count; sharing discipline is explicit. Call `retain` before
/// handing a copy to another owner and `recycle` when an owner is done.
/// The final recycle returns the segment permit to the pool.
#[derive(Clone)]
pub struct Buffer {
    data: Bytes,
    index: u32,
    generation: u32,
    shared: Arc<Shared>,
}

impl Buffer {
    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.segment_size
    }

    /// Zero-copy sub-range of this buffer's content.
    pub fn slice(&self, offset: usize, len: usize) -> BufferSlice {
        BufferSlice {
            data: self.data.slice(offset..offset + len),
            buffer: self.clone(),
        }
    }

    /// Current reference count. Zero means the segment was fully recycled.
    pub fn ref_count(&self) -> u32 {
        let slot = &self.shared.slots[self.index as usize];
        if slot.generation.load(Ordering::Acquire) != self.generation {
            return 0;
        }
        slot.ref_count.load(Ordering::Acquire)
    }

    /// Takes an additional reference.
    ///
    /// # Panics
    ///
    /// Panics if the segment was already fully recycled; retaining a dead
    /// buffer is a programming error.
    pub fn retain(&self) {
        let slot = &self.shared.slots[self.index as usize];
        assert_eq!(
            slot.generation.load(Ordering::Acquire),
            self.generation,
            "retain on a recycled buffer (segment {})",
            self.index
        );
        let prev = slot.ref_count.fetch_add(1, Ordering::AcqRel);
        assert!(prev > 0, "retain on a buffer with no live references");
    }

    /// Releases one reference. The final release returns the segment to the
    /// pool and wakes one blocked requester.
    ///
    /// # Panics
    ///
    /// Panics on double recycle, detected via the generation check.
    pub fn recycle(&self) {
        let slot = &self.shared.slots[self.index as usize];
        assert_eq!(
            slot.generation.load(Ordering::Acquire),
            self.generation,
            "double recycle of buffer (segment {})",
            self.index
        );
        let prev = slot.ref_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "recycle of a buffer with no live references");
        if prev == 1 {
            slot.generation.fetch_add(1, Ordering::AcqRel);
            self.shared.free.lock().unwrap().push(self.index);
            self.shared.available.notify_one();
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Buffer(segment: {}, len: {}, refs: {}, hash: {})",
            self.index,
            self.data.len(),
            self.ref_count(),
            quick_hash(&self.data)
        )
    }
}

/// Sub-range of a [`Buffer`] that keeps the parent handle alongside the view.
#[derive(Clone)]
pub struct BufferSlice {
    data: Bytes,
    buffer: Buffer,
}

impl BufferSlice {
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }
}
