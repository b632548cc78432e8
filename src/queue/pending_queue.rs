use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use crate::chunk::chunk_payload_data::ChunkPayloadData;

/// Priority of a stream nobody set one for.
pub(crate) const DEFAULT_STREAM_PRIORITY: u16 = 256;

/// Virtual time charged per byte at priority 1.
const VIRTUAL_TIME_PER_BYTE: u64 = 1 << 16;

/// Basic queue for the chunks of one stream.
pub(crate) type PendingBaseQueue = VecDeque<ChunkPayloadData>;

/// A buffered amount that fell to its low threshold.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum BufferedAmountLow {
    Stream(u16),
    Total,
}

/// Byte count with a low threshold.
#[derive(Default, Debug, Copy, Clone)]
pub(crate) struct ThresholdWatcher {
    value: usize,
    low_threshold: usize,
}

impl ThresholdWatcher {
    fn increase(&mut self, n: usize) {
        self.value += n;
    }

    /// Returns true when the value went from above the threshold to at or below it.
    fn decrease(&mut self, n: usize) -> bool {
        let old = self.value;
        self.value = self.value.saturating_sub(n);
        old > self.low_threshold && self.value <= self.low_threshold
    }

    /// Returns true when the new threshold puts the value at or below it.
    fn set_low_threshold(&mut self, low_threshold: usize) -> bool {
        let crossed = self.low_threshold < self.value && low_threshold >= self.value;
        self.low_threshold = low_threshold;
        crossed
    }

    fn clear(&mut self) {
        self.value = 0;
    }
}

#[derive(Debug)]
struct OutgoingStream {
    chunks: PendingBaseQueue,
    buffered: ThresholdWatcher,
    priority: u16,
    /// Virtual time at which the message at the front is done.
    finish_time: u64,
}

impl OutgoingStream {
    fn new(priority: u16) -> Self {
        OutgoingStream {
            chunks: PendingBaseQueue::new(),
            buffered: ThresholdWatcher::default(),
            priority,
            finish_time: 0,
        }
    }

    /// Schedules the message now at the front. Bigger messages and lower
    /// priorities finish later.
    fn reschedule(&mut self, virtual_time: u64) {
        let message_id = match self.chunks.front() {
            Some(c) => c.message_id,
            None => return,
        };
        let message_bytes: usize = self
            .chunks
            .iter()
            .take_while(|c| c.message_id == message_id)
            .map(|c| c.user_data.len())
            .sum();
        let cost = (message_bytes as u64).max(1) * VIRTUAL_TIME_PER_BYTE
            / u64::from(self.priority.max(1));
        self.finish_time = virtual_time.saturating_add(cost);
    }
}

/// Chunks waiting for their first transmission.
///
/// Every stream has its own FIFO. Streams are served by weighted fair
/// queueing, one message per turn: the stream whose front message has the
/// lowest virtual finish time goes next, ties going to the lower stream id.
/// The chosen stream keeps its turn until the ending fragment of its current
/// message has been taken, so fragments of different messages are never
/// interleaved on the wire.
#[derive(Debug)]
pub(crate) struct PendingQueue {
    streams: HashMap<u16, OutgoingStream>,
    /// Stream whose current message is partially taken.
    current: Option<u16>,
    virtual_time: u64,
    default_priority: u16,
    total: ThresholdWatcher,
    queue_len: usize,
    /// Queued chunks carrying an expiry.
    timed_len: usize,
    low_events: Vec<BufferedAmountLow>,
}

impl Default for PendingQueue {
    fn default() -> Self {
        PendingQueue::new(DEFAULT_STREAM_PRIORITY, 0)
    }
}

impl PendingQueue {
    pub(crate) fn new(default_priority: u16, total_low_threshold: usize) -> Self {
        PendingQueue {
            streams: HashMap::new(),
            current: None,
            virtual_time: 0,
            default_priority,
            total: ThresholdWatcher {
                value: 0,
                low_threshold: total_low_threshold,
            },
            queue_len: 0,
            timed_len: 0,
            low_events: vec![],
        }
    }

    fn stream_mut(&mut self, si: u16) -> &mut OutgoingStream {
        let default_priority = self.default_priority;
        self.streams
            .entry(si)
            .or_insert_with(|| OutgoingStream::new(default_priority))
    }

    /// Appends the fragments of one message in order.
    pub(crate) fn append(&mut self, chunks: Vec<ChunkPayloadData>) {
        let si = match chunks.first() {
            Some(c) => c.stream_identifier,
            None => return,
        };
        let n_bytes: usize = chunks.iter().map(|c| c.user_data.len()).sum();
        let n_timed = chunks.iter().filter(|c| c.expires_at.is_some()).count();
        let n_chunks = chunks.len();

        let virtual_time = self.virtual_time;
        let s = self.stream_mut(si);
        let was_idle = s.chunks.is_empty();
        s.chunks.extend(chunks);
        s.buffered.increase(n_bytes);
        if was_idle {
            s.reschedule(virtual_time);
        }

        self.total.increase(n_bytes);
        self.queue_len += n_chunks;
        self.timed_len += n_timed;
    }

    fn select(&self) -> Option<u16> {
        if let Some(si) = self.current {
            if self.streams.get(&si).map_or(false, |s| !s.chunks.is_empty()) {
                return Some(si);
            }
        }
        self.streams
            .iter()
            .filter(|(_, s)| !s.chunks.is_empty())
            .min_by_key(|(si, s)| (s.finish_time, **si))
            .map(|(si, _)| *si)
    }

    pub(crate) fn peek(&self) -> Option<&ChunkPayloadData> {
        let si = self.select()?;
        self.streams.get(&si).and_then(|s| s.chunks.front())
    }

    pub(crate) fn pop(&mut self) -> Option<ChunkPayloadData> {
        let si = self.select()?;
        let s = self.streams.get_mut(&si)?;
        let popped = s.chunks.pop_front()?;
        let n = popped.user_data.len();

        if popped.ending_fragment {
            // message done, every stream competes for the next turn
            self.current = None;
            self.virtual_time = self.virtual_time.max(s.finish_time);
            s.reschedule(self.virtual_time);
        } else {
            self.current = Some(si);
        }

        if s.buffered.decrease(n) {
            self.low_events.push(BufferedAmountLow::Stream(si));
        }
        if self.total.decrease(n) {
            self.low_events.push(BufferedAmountLow::Total);
        }
        self.queue_len -= 1;
        if popped.expires_at.is_some() {
            self.timed_len -= 1;
        }
        Some(popped)
    }

    /// Drops the not yet sent fragments of one message.
    pub(crate) fn remove_message(&mut self, si: u16, message_id: u64) -> Vec<ChunkPayloadData> {
        let s = match self.streams.get_mut(&si) {
            Some(s) => s,
            None => return vec![],
        };

        let head_removed = s.chunks.front().map_or(false, |c| c.message_id == message_id);
        let mut removed = vec![];
        let mut kept = PendingBaseQueue::with_capacity(s.chunks.len());
        for c in s.chunks.drain(..) {
            if c.message_id == message_id {
                removed.push(c);
            } else {
                kept.push_back(c);
            }
        }
        s.chunks = kept;
        if removed.is_empty() {
            return removed;
        }

        if head_removed {
            if self.current == Some(si) {
                self.current = None;
            }
            s.reschedule(self.virtual_time);
        }

        let n_bytes: usize = removed.iter().map(|c| c.user_data.len()).sum();
        if s.buffered.decrease(n_bytes) {
            self.low_events.push(BufferedAmountLow::Stream(si));
        }
        if self.total.decrease(n_bytes) {
            self.low_events.push(BufferedAmountLow::Total);
        }
        self.queue_len -= removed.len();
        self.timed_len -= removed.iter().filter(|c| c.expires_at.is_some()).count();
        removed
    }

    /// Removes the messages whose lifetime ended before any of their
    /// fragments was sent and returns their `(stream, message id)`.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<(u16, u64)> {
        if self.timed_len == 0 {
            return vec![];
        }

        let mut expired: Vec<(u16, u64)> = self
            .streams
            .iter()
            .flat_map(|(si, s)| {
                s.chunks
                    .iter()
                    .filter(move |c| {
                        c.beginning_fragment && c.reliability.is_exhausted(0, c.expires_at, now)
                    })
                    .map(move |c| (*si, c.message_id))
            })
            .collect();
        expired.sort_unstable_by_key(|&(_, message_id)| message_id);

        for &(si, message_id) in &expired {
            self.remove_message(si, message_id);
        }
        expired
    }

    /// Removes everything, streams in id order. Priorities and thresholds are kept.
    pub(crate) fn drain(&mut self) -> Vec<ChunkPayloadData> {
        let mut ids: Vec<u16> = self.streams.keys().copied().collect();
        ids.sort_unstable();

        let mut chunks = Vec::with_capacity(self.queue_len);
        for si in ids {
            if let Some(s) = self.streams.get_mut(&si) {
                chunks.extend(s.chunks.drain(..));
                s.buffered.clear();
            }
        }
        self.current = None;
        self.total.clear();
        self.queue_len = 0;
        self.timed_len = 0;
        chunks
    }

    pub(crate) fn set_priority(&mut self, si: u16, priority: u16) {
        // takes effect from the stream's next message
        self.stream_mut(si).priority = priority;
    }

    pub(crate) fn priority(&self, si: u16) -> u16 {
        self.streams
            .get(&si)
            .map_or(self.default_priority, |s| s.priority)
    }

    pub(crate) fn set_low_threshold(&mut self, si: u16, low_threshold: usize) {
        if self.stream_mut(si).buffered.set_low_threshold(low_threshold) {
            self.low_events.push(BufferedAmountLow::Stream(si));
        }
    }

    pub(crate) fn low_threshold(&self, si: u16) -> usize {
        self.streams
            .get(&si)
            .map_or(0, |s| s.buffered.low_threshold)
    }

    pub(crate) fn set_total_low_threshold(&mut self, low_threshold: usize) {
        if self.total.set_low_threshold(low_threshold) {
            self.low_events.push(BufferedAmountLow::Total);
        }
    }

    /// Queued bytes of one stream.
    pub(crate) fn buffered_amount(&self, si: u16) -> usize {
        self.streams.get(&si).map_or(0, |s| s.buffered.value)
    }

    /// Threshold crossings since the last call, oldest first.
    pub(crate) fn take_buffered_amount_low(&mut self) -> Vec<BufferedAmountLow> {
        std::mem::take(&mut self.low_events)
    }

    pub(crate) fn get_num_bytes(&self) -> usize {
        self.total.value
    }

    pub(crate) fn len(&self) -> usize {
        self.queue_len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
