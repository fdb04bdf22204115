// SPDX-License-Identifier: Apache-2.0

use super::protocol;
use crate::errors::Result;
use crate::event::Event;
use bytes::Bytes;
use std::time::Instant;

/// How an incoming `1A` relates to the payload in flight.
#[derive(Debug)]
pub enum AckOutcome {
    /// The server is still working on the payload.
    Keepalive,
    /// A prefix of the outstanding events was processed. They are removed from
    /// the payload and returned.
    Partial(Vec<Event>),
    /// Every remaining event was processed.
    Complete(Vec<Event>),
    /// Sequence outside the outstanding range.
    Invalid,
}

/// A batch of events in flight, numbered consecutively from `first_sequence`.
///
/// Acknowledged events are dropped from the front. Retransmission after a
/// reconnect sends only what is left, under the same sequence numbers.
#[derive(Debug)]
pub struct Payload {
    events: Vec<Event>,
    first_sequence: u32,
    total: usize,
    encoded: Option<Bytes>,
    sent_at: Option<Instant>,
}

impl Payload {
    pub fn new(events: Vec<Event>, first_sequence: u32) -> Self {
        let total = events.len();
        Self {
            events,
            first_sequence,
            total,
            encoded: None,
            sent_at: None,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events acknowledged so far.
    pub fn acked(&self) -> usize {
        self.total - self.events.len()
    }

    pub fn first_sequence(&self) -> u32 {
        self.first_sequence
    }

    pub fn last_sequence(&self) -> u32 {
        self.first_sequence
            .wrapping_add(self.events.len() as u32)
            .wrapping_sub(1)
    }

    /// Sequence of the last acknowledged event before this payload.
    pub fn last_ack(&self) -> u32 {
        self.first_sequence.wrapping_sub(1)
    }

    pub fn sent_at(&self) -> Option<Instant> {
        self.sent_at
    }

    pub fn mark_sent(&mut self) {
        self.sent_at = Some(Instant::now());
    }

    /// The `1C` frame for the outstanding events, built on first use and after
    /// every partial acknowledgement.
    pub fn encoded(&mut self) -> Result<Bytes> {
        if let Some(encoded) = &self.encoded {
            return Ok(encoded.clone());
        }
        let encoded = protocol::encode_compressed(&self.events, self.first_sequence)?;
        self.encoded = Some(encoded.clone());
        Ok(encoded)
    }

    pub fn ack(&mut self, sequence: u32) -> AckOutcome {
        let count = sequence.wrapping_sub(self.last_ack()) as usize;
        if count == 0 {
            return AckOutcome::Keepalive;
        }
        if count > self.events.len() {
            return AckOutcome::Invalid;
        }

        let rest = self.events.split_off(count);
        let acked = std::mem::replace(&mut self.events, rest);
        self.first_sequence = sequence.wrapping_add(1);
        self.encoded = None;

        if self.events.is_empty() {
            AckOutcome::Complete(acked)
        } else {
            AckOutcome::Partial(acked)
        }
    }
}
