//! Length-prefixed spanning record serialization.
//!
//! A record is staged once into an intermediate buffer (u32 length prefix
//! plus payload) and then copied into pool segments, spanning as many as it
//! takes. The writer drives the copy loop; the serializer only tracks how
//! far the staged bytes have been drained.

use bytes::{BufMut, BytesMut};

use crate::buffer::BufferBuilder;
use crate::record::StreamRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializationResult {
    /// The staged record was copied out completely; the target has room left.
    FullRecord,
    /// The staged record was copied out completely and filled the target.
    FullRecordBufferFull,
    /// The target filled up mid-record; continue with a fresh buffer.
    PartialRecordBufferFull,
}

impl SerializationResult {
    pub fn is_full_record(&self) -> bool {
        !matches!(self, SerializationResult::PartialRecordBufferFull)
    }

    pub fn is_full_buffer(&self) -> bool {
        !matches!(self, SerializationResult::FullRecord)
    }
}

pub struct RecordSerializer {
    staged: BytesMut,
    drained: usize,
}

impl RecordSerializer {
    pub fn new() -> RecordSerializer {
        RecordSerializer {
            staged: BytesMut::new(),
            drained: 0,
        }
    }

    /// Stages one record. The previous record must have been fully drained.
    pub fn add_record<T: StreamRecord>(&mut self, record: &T) {
        debug_assert!(!self.has_serialized_data(), "previous record not drained");
        self.staged.clear();
        self.drained = 0;
        // Reserve the length prefix, serialize, then patch it in.
        self.staged.put_u32(0);
        record.write_to(&mut self.staged);
        let payload_len = (self.staged.len() - 4) as u32;
        self.staged[..4].copy_from_slice(&payload_len.to_be_bytes());
    }

    /// Copies staged bytes into `target` until the record is drained or the
    /// target is full.
    pub fn copy_to(&mut self, target: &mut BufferBuilder) -> SerializationResult {
        self.drained += target.append(&self.staged[self.drained..]);
        if self.drained < self.staged.len() {
            SerializationResult::PartialRecordBufferFull
        } else if target.is_full() {
            SerializationResult::FullRecordBufferFull
        } else {
            SerializationResult::FullRecord
        }
    }

    pub fn has_serialized_data(&self) -> bool {
        self.drained < self.staged.len()
    }

    /// Abandons the in-progress copy position.
    pub fn clear(&mut self) {
        self.drained = self.staged.len();
    }

    /// Drops the intermediate buffer entirely.
    pub fn prune(&mut self) {
        self.staged = BytesMut::new();
        self.drained = 0;
    }
}

impl Default for RecordSerializer {
    fn default() -> RecordSerializer {
        RecordSerializer::new()
    }
}
