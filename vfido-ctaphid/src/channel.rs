//! CTAP HID Channel
//!
//! Per-channel framing state machine. A channel is either idle or assembling
//! one multi-packet message; continuation packets are appended until the
//! length declared by the initialization packet is reached.

use crate::ctaphid::{
    CONT_PACKET_DATA_SIZE, INIT_PACKET_DATA_SIZE, MAX_MESSAGE_SIZE, Message, MessageHeader,
    Packet, decode_continuation, decode_header,
};
use crate::error::{Error, Result};

use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

/// Partially assembled message
#[derive(Debug)]
struct Assembly {
    header: MessageHeader,

    /// Payload bytes received so far
    payload: Vec<u8>,

    /// Next expected sequence number
    next_seq: u8,

    /// Arrival time of the initialization packet
    started_at: Instant,
}

#[derive(Debug)]
enum State {
    Idle,
    Assembling(Assembly),
}

/// Result of feeding one packet to a channel
#[derive(Debug, PartialEq, Eq)]
pub struct Step {
    /// Stale message discarded because a new initialization packet arrived
    pub aborted: Option<MessageHeader>,

    /// Message completed by this packet, or the framing error it caused
    ///
    /// Errors leave the channel idle; the caller reports them to the peer.
    pub result: Result<Option<Message>>,
}

impl Default for Step {
    fn default() -> Self {
        Self {
            aborted: None,
            result: Ok(None),
        }
    }
}

/// A logical CTAP HID channel
#[derive(Debug)]
pub struct Channel {
    id: u32,
    state: State,
    timeout: Duration,
}

impl Channel {
    /// Create an idle channel
    ///
    /// `timeout` bounds how long a partially received message may wait for
    /// its continuation packets.
    pub fn new(id: u32, timeout: Duration) -> Self {
        Self {
            id,
            state: State::Idle,
            timeout,
        }
    }

    /// Whether a multi-packet message is in progress
    pub fn is_assembling(&self) -> bool {
        matches!(self.state, State::Assembling(_))
    }

    /// Feed one packet addressed to this channel
    ///
    /// A stale message interrupted by an initialization packet is reported in
    /// [`Step::aborted`] even when the new packet itself is rejected.
    pub fn handle_packet(&mut self, packet: &Packet, now: Instant) -> Step {
        if packet.is_init() {
            let aborted = self.abort();
            if let Some(stale) = &aborted {
                warn!(
                    cid = format_args!("{:#010x}", self.id),
                    stale = %stale,
                    "initialization packet interrupted message in progress"
                );
            }
            Step {
                aborted,
                result: self.start(packet, now),
            }
        } else {
            Step {
                aborted: None,
                result: self.continue_with(packet, now),
            }
        }
    }

    fn start(&mut self, packet: &Packet, now: Instant) -> Result<Option<Message>> {
        let header = decode_header(packet)?;
        let expected_len = header.payload_len as usize;

        if expected_len > MAX_MESSAGE_SIZE {
            return Err(Error::InvalidLength);
        }

        if expected_len <= INIT_PACKET_DATA_SIZE {
            let data = packet.payload()[..expected_len].to_vec();
            return Ok(Some(Message::new(self.id, header.cmd, data)));
        }

        trace!(
            cid = format_args!("{:#010x}", self.id),
            expected_len, "starting multi-packet message"
        );

        let mut payload = Vec::with_capacity(expected_len);
        payload.extend_from_slice(packet.payload());
        self.state = State::Assembling(Assembly {
            header,
            payload,
            next_seq: 0,
            started_at: now,
        });
        Ok(None)
    }

    fn continue_with(&mut self, packet: &Packet, now: Instant) -> Result<Option<Message>> {
        let State::Assembling(assembly) = &mut self.state else {
            debug!(
                cid = format_args!("{:#010x}", self.id),
                "ignoring spurious continuation packet"
            );
            return Ok(None);
        };

        if now.saturating_duration_since(assembly.started_at) > self.timeout {
            self.state = State::Idle;
            return Err(Error::Timeout);
        }

        let cont = decode_continuation(packet)?;
        if cont.seq != assembly.next_seq {
            warn!(
                cid = format_args!("{:#010x}", self.id),
                expected = assembly.next_seq,
                got = cont.seq,
                "continuation packet out of sequence"
            );
            self.state = State::Idle;
            return Err(Error::InvalidSequence);
        }

        let expected_len = assembly.header.payload_len as usize;
        let take = std::cmp::min(expected_len - assembly.payload.len(), CONT_PACKET_DATA_SIZE);
        assembly.payload.extend_from_slice(&cont.chunk[..take]);
        assembly.next_seq = assembly.next_seq.wrapping_add(1);

        if assembly.payload.len() < expected_len {
            return Ok(None);
        }

        let State::Assembling(assembly) = std::mem::replace(&mut self.state, State::Idle) else {
            return Ok(None);
        };
        let mut data = assembly.payload;
        data.truncate(expected_len);
        Ok(Some(Message::new(self.id, assembly.header.cmd, data)))
    }

    /// Discard a message in progress, returning its header
    pub fn abort(&mut self) -> Option<MessageHeader> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Assembling(assembly) => Some(assembly.header),
            State::Idle => None,
        }
    }

    /// Discard the message in progress if it has exceeded the assembly timeout
    pub fn expire(&mut self, now: Instant) -> Option<MessageHeader> {
        let expired = match &self.state {
            State::Assembling(assembly) => {
                now.saturating_duration_since(assembly.started_at) > self.timeout
            }
            State::Idle => false,
        };

        if expired { self.abort() } else { None }
    }
}
