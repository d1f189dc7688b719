//! Replay-aware record writer.
//!
//! The writer serializes records into pool buffers and hands the finished
//! buffers to the transport sink. Every record additionally lands in the
//! in-flight logger before it goes out, so that a downstream task restored
//! from a checkpoint can ask for everything it had not yet made durable.
//!
//! Replay is driven by a two-step handshake. A prepare event names the
//! subpartition and the last checkpoint the downstream saw; the writer
//! clears that channel's serializer state and waits (bounded) for the
//! matching request. On a match it re-emits the logged records of every
//! newer epoch through the normal serialization path, each epoch followed by
//! the barrier that originally closed it, then returns to normal emission.
//! A timeout or a mismatched request abandons the attempt; the downstream
//! will retry.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::buffer::{Buffer, BufferBuilder, BufferPool};
use crate::error::{CausalError, ReplayAbort};
use crate::inflight::InFlightLogger;
use crate::network::serializer::{RecordSerializer, SerializationResult};
use crate::network::{Event, InFlightEventListener, InFlightLogPrepareEvent};
use crate::record::StreamRecord;

/// Transport seam: receives finished buffers and events per subpartition.
pub trait RecordSink: Send + Sync {
    fn add_buffer(&self, buffer: Buffer, subpartition: u32);
    fn add_event(&self, event: Event, subpartition: u32);
    fn flush(&self, subpartition: u32);
    fn flush_all(&self);
}

/// Picks the output channel for a record.
pub trait ChannelSelector<T>: Send {
    fn select(&mut self, record: &T, num_channels: u32) -> u32;
}

pub struct RoundRobinChannelSelector {
    next: u32,
}

impl RoundRobinChannelSelector {
    pub fn new() -> RoundRobinChannelSelector {
        RoundRobinChannelSelector { next: 0 }
    }
}

impl Default for RoundRobinChannelSelector {
    fn default() -> RoundRobinChannelSelector {
        RoundRobinChannelSelector::new()
    }
}

impl<T> ChannelSelector<T> for RoundRobinChannelSelector {
    fn select(&mut self, _record: &T, num_channels: u32) -> u32 {
        let channel = self.next % num_channels;
        self.next = (self.next + 1) % num_channels;
        channel
    }
}

/// Where the writer currently is in the replay handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayPhase {
    Idle,
    Preparing,
    AwaitRequest,
    Replaying,
}

/// Bounded wait for the request that follows a prepare.
#[derive(Debug, Clone, Copy)]
pub struct ReplaySettings {
    pub poll_interval: Duration,
    pub poll_attempts: u32,
}

impl Default for ReplaySettings {
    fn default() -> ReplaySettings {
        ReplaySettings {
            poll_interval: Duration::from_millis(10),
            poll_attempts: 100,
        }
    }
}

pub struct RecordWriter<T: StreamRecord> {
    sink: Arc<dyn RecordSink>,
    selector: Box<dyn ChannelSelector<T>>,
    listener: Arc<InFlightEventListener>,
    pool: BufferPool,
    num_channels: u32,
    serializers: Vec<RecordSerializer>,
    builders: Vec<Option<BufferBuilder>>,
    logger: InFlightLogger<T>,
    phase: ReplayPhase,
    settings: ReplaySettings,
    flush_always: bool,
    bytes_out: u64,
    rng: StdRng,
}

impl<T: StreamRecord> RecordWriter<T> {
    pub fn new(
        sink: Arc<dyn RecordSink>,
        selector: Box<dyn ChannelSelector<T>>,
        listener: Arc<InFlightEventListener>,
        pool: BufferPool,
        num_channels: u32,
        initial_epoch: u64,
    ) -> RecordWriter<T> {
        Self::with_options(
            sink,
            selector,
            listener,
            pool,
            num_channels,
            initial_epoch,
            false,
            ReplaySettings::default(),
        )
    }

    pub fn with_options(
        sink: Arc<dyn RecordSink>,
        selector: Box<dyn ChannelSelector<T>>,
        listener: Arc<InFlightEventListener>,
        pool: BufferPool,
        num_channels: u32,
        initial_epoch: u64,
        flush_always: bool,
        settings: ReplaySettings,
    ) -> RecordWriter<T> {
        assert!(num_channels > 0, "writer needs at least one channel");
        RecordWriter {
            sink,
            selector,
            listener,
            pool,
            num_channels,
            serializers: (0..num_channels).map(|_| RecordSerializer::new()).collect(),
            builders: (0..num_channels).map(|_| None).collect(),
            logger: InFlightLogger::new(num_channels, initial_epoch),
            phase: ReplayPhase::Idle,
            settings,
            flush_always,
            bytes_out: 0,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn num_channels(&self) -> u32 {
        self.num_channels
    }

    pub fn in_flight_logger(&self) -> &InFlightLogger<T> {
        &self.logger
    }

    pub fn replay_phase(&self) -> ReplayPhase {
        self.phase
    }

    /// Total bytes handed to the sink so far.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    pub fn emit(&mut self, record: &T) -> Result<(), CausalError> {
        let channel = self.selector.select(record, self.num_channels);
        self.send_to_target(record, channel)
    }

    /// Sends to every channel, ignoring the selector. Used for in-band
    /// markers like watermarks.
    pub fn broadcast_emit(&mut self, record: &T) -> Result<(), CausalError> {
        for channel in 0..self.num_channels {
            self.send_to_target(record, channel)?;
        }
        Ok(())
    }

    /// Sends to one uniformly random channel.
    pub fn random_emit(&mut self, record: &T) -> Result<(), CausalError> {
        let channel = self.rng.gen_range(0..self.num_channels);
        self.send_to_target(record, channel)
    }

    /// Broadcasts an event to every channel, finishing open buffers first so
    /// the event sits at a record boundary. Checkpoint barriers are
    /// intercepted for epoch bookkeeping before they go out.
    pub fn broadcast_event(&mut self, event: Event) {
        if let Event::CheckpointBarrier(barrier) = &event {
            self.logger.log_checkpoint_barrier(*barrier);
        }
        for channel in 0..self.num_channels {
            self.finish_builder(channel);
            self.sink.add_event(event.clone(), channel);
        }
        if self.flush_always {
            self.flush_all();
        }
    }

    /// Emits an event on a single channel; used while replaying to re-emit
    /// stored barriers.
    pub fn emit_event(&mut self, event: Event, channel: u32) {
        self.finish_builder(channel);
        self.sink.add_event(event, channel);
        if self.flush_always {
            self.sink.flush(channel);
        }
    }

    /// Ships the channel's open builder (there is no partial-buffer
    /// streaming across the sink seam) and tells the transport to flush.
    pub fn flush(&mut self, channel: u32) {
        self.finish_builder(channel);
        self.sink.flush(channel);
    }

    pub fn flush_all(&mut self) {
        for channel in 0..self.num_channels {
            self.finish_builder(channel);
        }
        self.sink.flush_all();
    }

    /// Discards per-channel serializer state and open builders.
    pub fn clear_buffers(&mut self) {
        debug!("clearing writer buffers");
        for channel in 0..self.num_channels {
            self.close_and_discard_builder(channel);
            self.serializers[channel as usize].clear();
        }
    }

    fn send_to_target(&mut self, record: &T, channel: u32) -> Result<(), CausalError> {
        let idx = channel as usize;
        self.serializers[idx].add_record(record);

        // Drain what fits into the channel's open builder right away; the
        // rest spans into fresh buffers below.
        let mut result = match self.builders[idx].as_mut() {
            Some(builder) => self.serializers[idx].copy_to(builder),
            None => SerializationResult::PartialRecordBufferFull,
        };

        if self.phase == ReplayPhase::Idle {
            self.logger.log_record(record, channel);
            // A replay triggered here may discard this channel's serializer
            // state; the record was logged above and re-sent by the replay.
            self.check_replay()?;
        }

        while result.is_full_buffer() {
            if self.finish_builder(channel) && result.is_full_record() {
                break;
            }
            let mut builder = self.pool.request_builder_blocking();
            result = self.serializers[idx].copy_to(&mut builder);
            self.builders[idx] = Some(builder);
        }
        debug_assert!(
            !self.serializers[idx].has_serialized_data(),
            "record must be fully drained"
        );

        if self.flush_always {
            self.flush(channel);
        }
        Ok(())
    }

    /// Finishes the channel's open builder and ships it. Returns whether a
    /// builder was open.
    fn finish_builder(&mut self, channel: u32) -> bool {
        match self.builders[channel as usize].take() {
            None => false,
            Some(builder) => {
                let buffer = builder.finish();
                if buffer.is_empty() {
                    buffer.recycle();
                } else {
                    self.bytes_out += buffer.len() as u64;
                    self.sink.add_buffer(buffer, channel);
                }
                true
            }
        }
    }

    /// Finishes and releases the builder without shipping it.
    fn close_and_discard_builder(&mut self, channel: u32) {
        if let Some(builder) = self.builders[channel as usize].take() {
            builder.finish().recycle();
        }
    }

    fn check_replay(&mut self) -> Result<(), CausalError> {
        while let Some(prepare) = self.listener.poll_prepare() {
            debug!(
                "prepare signalled for subpartition {} after checkpoint {}",
                prepare.subpartition, prepare.checkpoint_id
            );
            self.phase = ReplayPhase::Preparing;
            let channel = prepare.subpartition;
            let idx = channel as usize;
            self.close_and_discard_builder(channel);
            self.serializers[idx].clear();
            self.serializers[idx].prune();

            self.phase = ReplayPhase::AwaitRequest;
            match self.await_request(&prepare) {
                Ok(()) => {
                    self.phase = ReplayPhase::Replaying;
                    self.replay(channel, prepare.checkpoint_id)?;
                    self.phase = ReplayPhase::Idle;
                }
                Err(abort) => {
                    warn!(
                        "abandoning replay for subpartition {}: {}",
                        channel, abort
                    );
                    self.phase = ReplayPhase::Idle;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn await_request(&mut self, prepare: &InFlightLogPrepareEvent) -> Result<(), ReplayAbort> {
        for _ in 0..self.settings.poll_attempts {
            if let Some(request) = self.listener.poll_request() {
                if request.matches(prepare) {
                    return Ok(());
                }
                return Err(ReplayAbort::Mismatch {
                    want_sub: prepare.subpartition,
                    want_checkpoint: prepare.checkpoint_id,
                    got_sub: request.subpartition,
                    got_checkpoint: request.checkpoint_id,
                });
            }
            thread::sleep(self.settings.poll_interval);
        }
        Err(ReplayAbort::Timeout)
    }

    fn replay(&mut self, channel: u32, last_seen: u64) -> Result<(), CausalError> {
        let epochs = self.logger.checkpoint_ids_to_replay(last_seen);
        debug!(
            "replaying {} epochs for subpartition {}",
            epochs.len(),
            channel
        );
        for epoch in epochs {
            let mut records = self.logger.replay_log(channel, epoch);
            let mut replayed = 0usize;
            while let Some(record) = records.next() {
                self.send_to_target(&record, channel)?;
                replayed += 1;
            }
            drop(records);
            debug!("replayed {} records for epoch {}", replayed, epoch);
            if let Some(barrier) = self.logger.checkpoint_barrier(channel, epoch) {
                self.emit_event(Event::CheckpointBarrier(barrier), channel);
            }
        }
        if !self.flush_always {
            self.flush(channel);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_channels() {
        let mut selector = RoundRobinChannelSelector::new();
        let picks: Vec<u32> = (0..5)
            .map(|_| {
                <RoundRobinChannelSelector as ChannelSelector<u8>>::select(&mut selector, &0u8, 3)
            })
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1]);
    }
}
