//! The record seam between the task runtime and the logging core.

use bytes::BytesMut;

use crate::buffer::Buffer;

/// A value the runtime emits through the record writer.
///
/// `write_to` must be deterministic: replaying a logged record re-serializes
/// it through the same path and the downstream byte stream has to come out
/// identical. Records that hold pool buffers participate in manual lifetime
/// accounting through `retain`/`recycle`; plain owned records use the
/// default no-ops.
pub trait StreamRecord: Clone {
    fn write_to(&self, out: &mut BytesMut);

    /// Takes a reference on any backing buffers.
    fn retain(&self) {}

    /// Releases a reference on any backing buffers.
    fn recycle(&self) {}
}

impl StreamRecord for Buffer {
    fn write_to(&self, out: &mut BytesMut) {
        out.extend_from_slice(self.bytes());
    }

    fn retain(&self) {
        Buffer::retain(self);
    }

    fn recycle(&self) {
        Buffer::recycle(self);
    }
}
