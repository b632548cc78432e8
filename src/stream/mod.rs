
use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::chunk::chunk_payload_data::{ChunkPayloadData, PayloadProtocolIdentifier};
use crate::queue::reassembly_queue::ReassemblyQueue;

/// A user message as handed to [`Association::send`](crate::Association::send)
/// and delivered through
/// [`AssociationHandler::on_message_received`](crate::AssociationHandler::on_message_received).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub ppi: PayloadProtocolIdentifier,
    pub data: Bytes,
}

impl Message {
    pub fn new(ppi: PayloadProtocolIdentifier, data: impl Into<Bytes>) -> Self {
        Message {
            ppi,
            data: data.into(),
        }
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Message::new(PayloadProtocolIdentifier::Binary, data)
    }

    pub fn string(text: impl Into<String>) -> Self {
        Message::new(PayloadProtocolIdentifier::String, Bytes::from(text.into()))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// How hard the sender tries before giving up on a message (RFC 3758).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum Reliability {
    /// Retransmitted until acknowledged.
    #[default]
    Reliable,
    /// Abandoned once it would need more than this many retransmissions.
    Rexmit(u32),
    /// Abandoned once this long has passed since the message was queued,
    /// whether or not it was ever sent.
    Timed(Duration),
}

impl fmt::Display for Reliability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reliability::Reliable => write!(f, "Reliable"),
            Reliability::Rexmit(n) => write!(f, "Rexmit({n})"),
            Reliability::Timed(d) => write!(f, "Timed({d:?})"),
        }
    }
}

impl Reliability {
    /// End of the lifetime of a message queued at `queued_at`.
    pub(crate) fn expires_at(&self, queued_at: Instant) -> Option<Instant> {
        match *self {
            Reliability::Timed(lifetime) => Some(queued_at + lifetime),
            _ => None,
        }
    }

    /// Whether a chunk sent `nsent` times is past its budget. A timed message
    /// stays alive for its whole lifetime and expires right after it.
    pub(crate) fn is_exhausted(&self, nsent: u32, expires_at: Option<Instant>, now: Instant) -> bool {
        match *self {
            Reliability::Reliable => false,
            Reliability::Rexmit(max_retransmits) => nsent > max_retransmits,
            Reliability::Timed(_) => expires_at.map_or(false, |expires_at| now > expires_at),
        }
    }
}

/// Per stream state: outbound sequencing and inbound reassembly.
#[derive(Debug)]
pub(crate) struct Stream {
    pub(crate) stream_identifier: u16,
    pub(crate) unordered: bool,
    pub(crate) reliability: Reliability,
    /// Next SSN to hand out.
    pub(crate) sequence_number: u16,
    /// SSN of the ordered message currently leaving the pending queue.
    sending_sequence_number: u16,
    pub(crate) reassembly_queue: ReassemblyQueue,
}

impl Stream {
    pub(crate) fn new(stream_identifier: u16, ordered: bool, reliability: Reliability) -> Self {
        Stream {
            stream_identifier,
            unordered: !ordered,
            reliability,
            sequence_number: 0,
            sending_sequence_number: 0,
            reassembly_queue: ReassemblyQueue::new(stream_identifier),
        }
    }

    pub(crate) fn handle_data(&mut self, pd: ChunkPayloadData) -> bool {
        self.reassembly_queue.push(pd)
    }

    pub(crate) fn read(&mut self) -> Option<Message> {
        self.reassembly_queue.read()
    }

    /// Skips ordered messages up to and including `ssn`.
    pub(crate) fn handle_forward_tsn_for_ordered(&mut self, ssn: u16) {
        self.reassembly_queue.forward_tsn_for_ordered(ssn);
    }

    /// Drops unordered fragments at or below `new_cumulative_tsn`.
    pub(crate) fn handle_forward_tsn_for_unordered(&mut self, new_cumulative_tsn: u32) {
        self.reassembly_queue
            .forward_tsn_for_unordered(new_cumulative_tsn);
    }

    /// Splits `message` into DATA chunks of at most `max_payload_size` bytes.
    /// SSNs and TSNs are assigned later, when a chunk is first put in flight.
    pub(crate) fn packetize(
        &mut self,
        message: &Message,
        reliability: Reliability,
        max_payload_size: usize,
        message_id: u64,
    ) -> Vec<ChunkPayloadData> {
        // From draft-ietf-rtcweb-data-protocol-09, section 6:
        //   All Data Channel Establishment Protocol messages MUST be sent using
        //   ordered delivery and reliable transmission.
        let (unordered, reliability) = if message.ppi == PayloadProtocolIdentifier::Dcep {
            (false, Reliability::Reliable)
        } else {
            (self.unordered, reliability)
        };

        let raw = &message.data;
        let mut chunks = vec![];
        let mut i = 0;
        let mut remaining = raw.len();
        while remaining != 0 {
            let fragment_size = std::cmp::min(max_payload_size, remaining);

            chunks.push(ChunkPayloadData {
                stream_identifier: self.stream_identifier,
                // shares the message buffer
                user_data: raw.slice(i..i + fragment_size),
                unordered,
                beginning_fragment: i == 0,
                ending_fragment: remaining - fragment_size == 0,
                immediate_sack: false,
                payload_type: message.ppi,
                message_id,
                reliability,
                ..Default::default()
            });

            remaining -= fragment_size;
            i += fragment_size;
        }

        chunks
    }

    /// Stamps the SSN on a chunk leaving the pending queue. A message takes
    /// its SSN with its first fragment, so messages dropped while still
    /// queued leave no hole in the sequence.
    pub(crate) fn assign_sequence_number(&mut self, c: &mut ChunkPayloadData) {
        // RFC 4960 Sec 6.6
        // Note: When transmitting ordered and unordered data, an endpoint does
        // not increment its Stream Sequence Number when transmitting a DATA
        // chunk with U flag set to 1.
        if c.unordered {
            return;
        }
        if c.beginning_fragment {
            self.sending_sequence_number = self.sequence_number;
            self.sequence_number = self.sequence_number.wrapping_add(1);
        }
        c.stream_sequence_number = self.sending_sequence_number;
    }

    pub(crate) fn get_num_bytes_in_reassembly_queue(&self) -> usize {
        self.reassembly_queue.get_num_bytes()
    }
}
