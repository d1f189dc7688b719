//! Coordination of a causal recovery.
//!
//! Each downstream channel of the restarting task reports the determinant
//! history it mirrored for the failed vertex. Every report is a prefix of the
//! same append sequence, so the longest one dominates; once all expected
//! reports are in, the coordinator unblocks the output-channel gate and
//! starts handing decoded determinants to the execution driver one at a time.

use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::Sender;
use log::{debug, info};

use crate::causal::determinant::{Determinant, DeterminantEncoding};
use crate::error::CausalError;
use crate::network::DeterminantResponseEvent;

pub struct RecoveryCoordinator {
    encoding: Arc<dyn DeterminantEncoding>,
    expected_responses: u32,
    received_responses: u32,
    best: Bytes,
    pos: usize,
    next: Option<Determinant>,
    recovering: bool,
    connections_ready: Option<Sender<()>>,
}

impl RecoveryCoordinator {
    pub fn new(
        num_downstream_channels: u32,
        encoding: Arc<dyn DeterminantEncoding>,
    ) -> RecoveryCoordinator {
        RecoveryCoordinator {
            encoding,
            expected_responses: num_downstream_channels,
            received_responses: 0,
            best: Bytes::new(),
            pos: 0,
            next: None,
            recovering: false,
            connections_ready: None,
        }
    }

    /// Registers the signal fired once all downstream responses arrived and
    /// output channels may reconnect.
    pub fn set_connections_gate(&mut self, gate: Sender<()>) {
        self.connections_ready = Some(gate);
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    pub fn is_ready_to_start(&self) -> bool {
        self.received_responses == self.expected_responses
    }

    /// Accounts one downstream report, keeping the longest payload seen.
    /// The final report flips the coordinator into the recovering state and
    /// prefetches the first determinant.
    pub fn process_response(
        &mut self,
        response: &DeterminantResponseEvent,
    ) -> Result<(), CausalError> {
        let received = response.delta.flattened();
        debug!(
            "determinant response {}/{} with {} bytes",
            self.received_responses + 1,
            self.expected_responses,
            received.len()
        );
        if received.len() > self.best.len() {
            self.best = received;
        }
        self.received_responses += 1;

        if self.is_ready_to_start() {
            info!(
                "all {} determinant responses in; replaying {} bytes",
                self.expected_responses,
                self.best.len()
            );
            if let Some(gate) = self.connections_ready.take() {
                let _ = gate.send(());
            }
            self.pos = 0;
            self.recovering = true;
            self.next = self.encoding.decode_next(&self.best, &mut self.pos)?;
            if self.next.is_none() {
                self.reset();
            }
        }
        Ok(())
    }

    /// Hands out the prefetched determinant and prefetches the one after it.
    /// Exhausting the stream resets the coordinator.
    pub fn pop_next(&mut self) -> Result<Option<Determinant>, CausalError> {
        let out = self.next.take();
        if out.is_some() {
            self.next = self.encoding.decode_next(&self.best, &mut self.pos)?;
            if self.next.is_none() {
                self.reset();
            }
        }
        Ok(out)
    }

    pub fn peek_next(&self) -> Option<&Determinant> {
        self.next.as_ref()
    }

    pub fn has_more(&self) -> bool {
        self.next.is_some()
    }

    fn reset(&mut self) {
        self.recovering = false;
        self.best = Bytes::new();
        self.pos = 0;
        self.received_responses = 0;
    }
}
