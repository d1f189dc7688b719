//! Wire events exchanged between tasks and the listener that feeds the
//! replay protocol.
//!
//! Prepare and request flow downstream → upstream when a restored task asks
//! its upstream to re-send in-flight records; determinant request/response
//! flow the other way during causal recovery. Checkpoint barriers pass
//! through the writer, which intercepts them for epoch bookkeeping.

use std::fmt;

use bytes::{BufMut, BytesMut};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;

use crate::causal::log::VertexCausalLogDelta;
use crate::causal::VertexId;
use crate::error::CausalError;
use crate::wire::WireReader;

pub mod serializer;
pub mod writer;

pub use serializer::{RecordSerializer, SerializationResult};
pub use writer::{ChannelSelector, RecordSink, RecordWriter, ReplayPhase, ReplaySettings, RoundRobinChannelSelector};

/// Announces that a replay request for `(subpartition, checkpoint_id)` is
/// about to follow; the upstream writer clears its channel state and waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlightLogPrepareEvent {
    pub subpartition: u32,
    pub checkpoint_id: u64,
}

/// Confirms the prepared replay: re-send everything logged for
/// `subpartition` after `checkpoint_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlightLogRequestEvent {
    pub subpartition: u32,
    pub checkpoint_id: u64,
}

impl InFlightLogRequestEvent {
    pub fn matches(&self, prepare: &InFlightLogPrepareEvent) -> bool {
        self.subpartition == prepare.subpartition && self.checkpoint_id == prepare.checkpoint_id
    }
}

/// Asks for the determinant history mirrored for `failed_vertex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeterminantRequestEvent {
    pub failed_vertex: VertexId,
}

/// Carries one reporter's mirror of the failed vertex's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeterminantResponseEvent {
    pub delta: VertexCausalLogDelta,
}

/// Runtime-provided marker separating one epoch's records from the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointBarrier {
    pub checkpoint_id: u64,
    pub timestamp: u64,
}

impl fmt::Display for CheckpointBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CheckpointBarrier({})", self.checkpoint_id)
    }
}

const TAG_PREPARE: u8 = 0;
const TAG_REQUEST: u8 = 1;
const TAG_DETERMINANT_REQUEST: u8 = 2;
const TAG_DETERMINANT_RESPONSE: u8 = 3;
const TAG_BARRIER: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    InFlightLogPrepare(InFlightLogPrepareEvent),
    InFlightLogRequest(InFlightLogRequestEvent),
    DeterminantRequest(DeterminantRequestEvent),
    DeterminantResponse(DeterminantResponseEvent),
    CheckpointBarrier(CheckpointBarrier),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::InFlightLogPrepare(_) => "InFlightLogPrepare",
            Event::InFlightLogRequest(_) => "InFlightLogRequest",
            Event::DeterminantRequest(_) => "DeterminantRequest",
            Event::DeterminantResponse(_) => "DeterminantResponse",
            Event::CheckpointBarrier(_) => "CheckpointBarrier",
        }
    }

    pub fn write_to(&self, out: &mut BytesMut) {
        match self {
            Event::InFlightLogPrepare(e) => {
                out.put_u8(TAG_PREPARE);
                out.put_u32(e.subpartition);
                out.put_u64(e.checkpoint_id);
            }
            Event::InFlightLogRequest(e) => {
                out.put_u8(TAG_REQUEST);
                out.put_u32(e.subpartition);
                out.put_u64(e.checkpoint_id);
            }
            Event::DeterminantRequest(e) => {
                out.put_u8(TAG_DETERMINANT_REQUEST);
                out.put_u16(e.failed_vertex.0);
            }
            Event::DeterminantResponse(e) => {
                out.put_u8(TAG_DETERMINANT_RESPONSE);
                e.delta.write_to(out);
            }
            Event::CheckpointBarrier(b) => {
                out.put_u8(TAG_BARRIER);
                out.put_u64(b.checkpoint_id);
                out.put_u64(b.timestamp);
            }
        }
    }

    pub fn read_from(reader: &mut WireReader<'_>) -> Result<Event, CausalError> {
        match reader.read_u8()? {
            TAG_PREPARE => Ok(Event::InFlightLogPrepare(InFlightLogPrepareEvent {
                subpartition: reader.read_u32()?,
                checkpoint_id: reader.read_u64()?,
            })),
            TAG_REQUEST => Ok(Event::InFlightLogRequest(InFlightLogRequestEvent {
                subpartition: reader.read_u32()?,
                checkpoint_id: reader.read_u64()?,
            })),
            TAG_DETERMINANT_REQUEST => Ok(Event::DeterminantRequest(DeterminantRequestEvent {
                failed_vertex: VertexId(reader.read_u16()?),
            })),
            TAG_DETERMINANT_RESPONSE => Ok(Event::DeterminantResponse(DeterminantResponseEvent {
                delta: VertexCausalLogDelta::read_from(reader)?,
            })),
            TAG_BARRIER => Ok(Event::CheckpointBarrier(CheckpointBarrier {
                checkpoint_id: reader.read_u64()?,
                timestamp: reader.read_u64()?,
            })),
            _ => Err(CausalError::InvalidWire("event tag")),
        }
    }
}

/// Queues replay-protocol events delivered by the transport thread until the
/// producer thread polls them. Accepts nothing but prepare and request
/// events.
pub struct InFlightEventListener {
    prepare_tx: Sender<InFlightLogPrepareEvent>,
    prepare_rx: Receiver<InFlightLogPrepareEvent>,
    request_tx: Sender<InFlightLogRequestEvent>,
    request_rx: Receiver<InFlightLogRequestEvent>,
}

impl InFlightEventListener {
    pub fn new() -> InFlightEventListener {
        let (prepare_tx, prepare_rx) = unbounded();
        let (request_tx, request_rx) = unbounded();
        InFlightEventListener {
            prepare_tx,
            prepare_rx,
            request_tx,
            request_rx,
        }
    }

    pub fn on_event(&self, event: Event) -> Result<(), CausalError> {
        debug!("listener received {} event", event.kind());
        match event {
            Event::InFlightLogPrepare(e) => {
                let _ = self.prepare_tx.send(e);
                Ok(())
            }
            Event::InFlightLogRequest(e) => {
                let _ = self.request_tx.send(e);
                Ok(())
            }
            other => Err(CausalError::UnknownEventType(other.kind())),
        }
    }

    pub fn poll_prepare(&self) -> Option<InFlightLogPrepareEvent> {
        self.prepare_rx.try_recv().ok()
    }

    pub fn poll_request(&self) -> Option<InFlightLogRequestEvent> {
        self.request_rx.try_recv().ok()
    }
}

impl Default for InFlightEventListener {
    fn default() -> InFlightEventListener {
        InFlightEventListener::new()
    }
}
