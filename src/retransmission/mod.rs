
use std::collections::HashMap;
use std::time::Instant;

use crate::chunk::chunk_forward_tsn::{ChunkForwardTsn, ChunkForwardTsnStream};
use crate::chunk::chunk_payload_data::ChunkPayloadData;
use crate::chunk::chunk_selective_ack::ChunkSelectiveAck;
use crate::congestion::CongestionControl;
use crate::error::{Error, Result};
use crate::queue::payload_queue::PayloadQueue;
use crate::stream::Reliability;
use crate::timer::rto_manager::RtoManager;
use crate::util::*;

/// What a SACK changed on the sending side.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct SackOutcome {
    /// Message id of every fragment that left the in-flight queue acknowledged.
    pub(crate) acked: Vec<u64>,
    pub(crate) bytes_acked: usize,
    pub(crate) cum_tsn_ack_point_advanced: bool,
    /// Nothing is outstanding any more.
    pub(crate) all_acked: bool,
    /// Some chunk reached the miss threshold and waits for a fast retransmit.
    pub(crate) fast_retransmit: bool,
    /// The SACK was older than the current ack point and was ignored.
    pub(crate) stale: bool,
}

/// An outbound message given up on because of its partial reliability budget.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct AbandonedMessage {
    pub(crate) stream_identifier: u16,
    pub(crate) message_id: u64,
}

/// Sender side TSN bookkeeping: the in-flight queue, cumulative and
/// advanced ack points, RTT sampling and fast retransmit detection.
#[derive(Debug)]
pub(crate) struct RetransmissionTracker {
    name: String,
    pub(crate) inflight_queue: PayloadQueue,
    pub(crate) my_next_tsn: u32,
    pub(crate) cumulative_tsn_ack_point: u32,
    pub(crate) advanced_peer_tsn_ack_point: u32,
    min_tsn2measure_rtt: u32,
    pub(crate) rto_mgr: RtoManager,
    fast_retransmit_threshold: u32,
    pub(crate) use_forward_tsn: bool,
}

impl RetransmissionTracker {
    pub(crate) fn new(
        name: &str,
        initial_tsn: u32,
        rto_mgr: RtoManager,
        fast_retransmit_threshold: u32,
    ) -> Self {
        RetransmissionTracker {
            name: name.to_owned(),
            inflight_queue: PayloadQueue::new(),
            my_next_tsn: initial_tsn,
            cumulative_tsn_ack_point: initial_tsn.wrapping_sub(1),
            advanced_peer_tsn_ack_point: initial_tsn.wrapping_sub(1),
            min_tsn2measure_rtt: initial_tsn,
            rto_mgr,
            fast_retransmit_threshold: fast_retransmit_threshold.max(1),
            use_forward_tsn: false,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inflight_queue.is_empty()
    }

    /// Bytes of user data sent and neither acked nor dropped yet.
    pub(crate) fn outstanding_bytes(&self) -> usize {
        self.inflight_queue.get_num_bytes()
    }

    pub(crate) fn get_rto(&self) -> u64 {
        self.rto_mgr.get_rto()
    }

    /// Assigns the next TSN to a chunk leaving the pending queue and starts
    /// tracking it. Returns the copy to put on the wire.
    pub(crate) fn push_new(
        &mut self,
        mut c: ChunkPayloadData,
        now: Instant,
        cc: &mut CongestionControl,
    ) -> ChunkPayloadData {
        c.tsn = self.my_next_tsn;
        self.my_next_tsn = self.my_next_tsn.wrapping_add(1);
        c.since = Some(now);
        c.nsent = 1;

        log::trace!(
            "[{}] sending ppi={} tsn={} ssn={} len={} ({},{})",
            self.name,
            u32::from(c.payload_type),
            c.tsn,
            c.stream_sequence_number,
            c.user_data.len(),
            c.beginning_fragment,
            c.ending_fragment
        );

        cc.on_sent(c.user_data.len() as u32);
        self.inflight_queue.push_no_check(c.clone());
        c
    }

    /// Processes a SACK. `pending_bytes` is what still waits in the pending
    /// queue and decides whether the congestion window counts as fully used.
    pub(crate) fn handle_sack(
        &mut self,
        d: &ChunkSelectiveAck,
        now: Instant,
        cc: &mut CongestionControl,
        pending_bytes: usize,
    ) -> Result<SackOutcome> {
        log::trace!(
            "[{}] {}, SACK: cumTSN={} a_rwnd={}",
            self.name,
            self.cumulative_tsn_ack_point,
            d.cumulative_tsn_ack,
            d.advertised_receiver_window_credit
        );

        // RFC 4960 sec 6.2.1.  Processing a Received SACK
        // D)
        //   i) If Cumulative TSN Ack is less than the Cumulative TSN Ack
        //      Point, then drop the SACK.
        if sna32gt(self.cumulative_tsn_ack_point, d.cumulative_tsn_ack) {
            log::debug!(
                "[{}] SACK Cumulative ACK {} is older than ACK point {}",
                self.name,
                d.cumulative_tsn_ack,
                self.cumulative_tsn_ack_point
            );
            return Ok(SackOutcome {
                stale: true,
                all_acked: self.is_empty(),
                ..Default::default()
            });
        }

        if sna32gte(d.cumulative_tsn_ack, self.my_next_tsn) {
            return Err(Error::ErrSackTsnAheadOfLastSent {
                cumulative_tsn_ack: d.cumulative_tsn_ack,
            });
        }

        let fully_utilized = cc.inflight as usize + pending_bytes >= cc.cwnd as usize;
        let mut outcome = SackOutcome::default();

        // New ack point, so pop all ACKed packets from inflight_queue
        let mut i = self.cumulative_tsn_ack_point.wrapping_add(1);
        while sna32lte(i, d.cumulative_tsn_ack) {
            if let Some(c) = self.inflight_queue.pop(i) {
                if !c.acked {
                    let n = c.user_data.len();
                    outcome.bytes_acked += n;
                    cc.on_acked(n as u32);
                    self.measure_rtt(&c, now);
                }
                if !c.abandoned {
                    outcome.acked.push(c.message_id);
                }
            } else {
                log::warn!("[{}] tsn={} missing from inflight queue", self.name, i);
            }
            i = i.wrapping_add(1);
        }

        let mut htna = d.cumulative_tsn_ack;
        let mut highest_reported = d.cumulative_tsn_ack;

        // Mark selectively acknowledged chunks as "acked"
        for g in &d.gap_ack_blocks {
            if g.start == 0 || g.start > g.end {
                continue;
            }
            for offset in g.start..=g.end {
                let tsn = d.cumulative_tsn_ack.wrapping_add(offset as u32);
                if sna32gte(tsn, self.my_next_tsn) {
                    break;
                }
                if sna32lt(highest_reported, tsn) {
                    highest_reported = tsn;
                }

                let newly_acked = match self.inflight_queue.get(tsn) {
                    Some(c) => !c.acked,
                    None => false,
                };
                if !newly_acked {
                    continue;
                }

                let n = self.inflight_queue.mark_as_acked(tsn);
                outcome.bytes_acked += n;
                cc.on_acked(n as u32);
                if let Some(c) = self.inflight_queue.get(tsn) {
                    log::trace!("[{}] tsn={} has been sacked", self.name, c.tsn);
                    let c = c.clone();
                    self.measure_rtt(&c, now);
                }

                if sna32lt(htna, tsn) {
                    htna = tsn;
                }
            }
        }

        if sna32lt(self.cumulative_tsn_ack_point, d.cumulative_tsn_ack) {
            log::trace!(
                "[{}] SACK: cumTSN advanced: {} -> {}",
                self.name,
                self.cumulative_tsn_ack_point,
                d.cumulative_tsn_ack
            );
            self.cumulative_tsn_ack_point = d.cumulative_tsn_ack;
            outcome.cum_tsn_ack_point_advanced = true;
        }

        cc.on_sack(
            outcome.bytes_acked as u32,
            d.cumulative_tsn_ack,
            outcome.cum_tsn_ack_point_advanced,
            fully_utilized,
        );

        // RFC 4960 sec 6.2.1.  Processing a Received SACK
        // D)
        //   ii) Set rwnd equal to the newly received a_rwnd minus the number
        //       of bytes still outstanding after processing the Cumulative
        //       TSN Ack and the Gap Ack Blocks.
        cc.set_rwnd(d.advertised_receiver_window_credit);

        outcome.fast_retransmit = self.process_fast_retransmission(
            cc,
            htna,
            highest_reported,
            outcome.cum_tsn_ack_point_advanced,
        );

        // RFC 3758 Sec 3.5 C1
        if sna32lt(
            self.advanced_peer_tsn_ack_point,
            self.cumulative_tsn_ack_point,
        ) {
            self.advanced_peer_tsn_ack_point = self.cumulative_tsn_ack_point;
        }
        self.advance_peer_tsn_ack_point();

        outcome.all_acked = self.is_empty();
        Ok(outcome)
    }

    /// RFC 4960 sec 6.3.1 rules C4 and C5: at most one sample per round trip,
    /// never from a retransmitted chunk.
    fn measure_rtt(&mut self, c: &ChunkPayloadData, now: Instant) {
        if c.nsent != 1 || sna32lt(c.tsn, self.min_tsn2measure_rtt) {
            return;
        }
        let since = match c.since {
            Some(since) => since,
            None => return,
        };

        self.min_tsn2measure_rtt = self.my_next_tsn;
        let rtt = now.saturating_duration_since(since).as_millis() as u64;
        let srtt = self.rto_mgr.set_new_rtt(rtt);
        log::trace!(
            "[{}] SACK: measured-rtt={} srtt={} new-rto={}",
            self.name,
            rtt,
            srtt,
            self.rto_mgr.get_rto()
        );
    }

    /// HTNA algorithm, RFC 4960 sec 7.2.4. Returns whether a chunk newly
    /// reached the miss threshold.
    fn process_fast_retransmission(
        &mut self,
        cc: &mut CongestionControl,
        htna: u32,
        highest_reported: u32,
        cum_tsn_ack_point_advanced: bool,
    ) -> bool {
        // a)  Not in fast-recovery: only missing TSNs prior to the HTNA.
        // b)  In fast-recovery AND the Cumulative TSN Ack Point advanced:
        //     all TSNs reported missing in the SACK.
        if cc.in_fast_recovery && !cum_tsn_ack_point_advanced {
            return false;
        }
        let max_tsn = if cc.in_fast_recovery {
            highest_reported
        } else {
            htna
        };

        let mut triggered = false;
        let mut tsn = self.cumulative_tsn_ack_point.wrapping_add(1);
        while sna32lt(tsn, max_tsn) {
            if let Some(c) = self.inflight_queue.get_mut(tsn) {
                if !c.acked && !c.abandoned && c.miss_indicator < self.fast_retransmit_threshold {
                    c.miss_indicator += 1;
                    if c.miss_indicator == self.fast_retransmit_threshold {
                        c.fast_retransmit = true;
                        triggered = true;
                        log::trace!(
                            "[{}] fast-retransmit: tsn={} sent={} htna={}",
                            self.name,
                            c.tsn,
                            c.nsent,
                            htna
                        );
                    }
                }
            }
            tsn = tsn.wrapping_add(1);
        }

        if triggered && cc.on_fast_retransmit(htna) {
            log::debug!("[{}] enter fast-recovery: exit-point={}", self.name, htna);
        }

        triggered
    }

    /// T3-rtx expired: everything outstanding goes out again and the window
    /// collapses.
    pub(crate) fn on_retransmission_timeout(&mut self, cc: &mut CongestionControl) {
        cc.on_retransmission_timeout();
        self.inflight_queue.mark_all_to_retransmit();
        log::debug!(
            "[{}] T3-rtx timed out: cwnd={} ssthresh={} inflight={}",
            self.name,
            cc.cwnd,
            cc.ssthresh,
            self.inflight_queue.len()
        );
    }

    /// Takes the chunks that reached the miss threshold, lowest TSN first,
    /// while their user data fits in `budget` bytes. Chunks left over stay
    /// marked for the next fast retransmit or T3-rtx expiry.
    pub(crate) fn pop_fast_retransmissions(&mut self, budget: usize) -> Vec<ChunkPayloadData> {
        self.pop_marked(budget, |c| c.fast_retransmit)
    }

    /// Takes the chunks marked by a T3-rtx expiry, lowest TSN first, while
    /// their user data fits in `budget` bytes. The first one is always taken
    /// so a closed window still lets one chunk through.
    pub(crate) fn pop_retransmissions(&mut self, budget: usize) -> Vec<ChunkPayloadData> {
        self.pop_marked(budget, |c| c.retransmit)
    }

    fn pop_marked<F>(&mut self, budget: usize, marked: F) -> Vec<ChunkPayloadData>
    where
        F: Fn(&ChunkPayloadData) -> bool,
    {
        let mut chunks = vec![];
        let mut bytes_to_send = 0;

        let tsns: Vec<u32> = self.inflight_queue.tsns().collect();
        for tsn in tsns {
            let c = match self.inflight_queue.get_mut(tsn) {
                Some(c) => c,
                None => continue,
            };
            if !marked(c) || c.acked || c.abandoned {
                continue;
            }
            let len = c.user_data.len();
            if !chunks.is_empty() && bytes_to_send + len > budget {
                break;
            }

            // not retransmitted again before the next T3-rtx expiry
            c.retransmit = false;
            c.fast_retransmit = false;
            c.nsent += 1;
            bytes_to_send += len;

            log::trace!(
                "[{}] retransmitting tsn={} ssn={} sent={}",
                self.name,
                c.tsn,
                c.stream_sequence_number,
                c.nsent
            );
            chunks.push(c.clone());
        }

        chunks
    }

    /// Abandons every message whose partial reliability budget ran out and
    /// moves the advanced peer ack point over abandoned chunks. Does nothing
    /// unless the peer supports FORWARD-TSN.
    pub(crate) fn abandon_exhausted(&mut self, now: Instant) -> Vec<AbandonedMessage> {
        if !self.use_forward_tsn {
            return vec![];
        }

        let mut abandoned: Vec<AbandonedMessage> = vec![];
        for c in self.inflight_queue.iter() {
            if c.acked || c.abandoned {
                continue;
            }
            // a Rexmit budget only matters when the chunk would go out again
            let due = c.retransmit
                || c.fast_retransmit
                || matches!(c.reliability, Reliability::Timed(_));
            if due && c.reliability.is_exhausted(c.nsent, c.expires_at, now) {
                let m = AbandonedMessage {
                    stream_identifier: c.stream_identifier,
                    message_id: c.message_id,
                };
                if !abandoned.contains(&m) {
                    log::trace!(
                        "[{}] marked as abandoned: tsn={} ppi={} ({})",
                        self.name,
                        c.tsn,
                        c.payload_type,
                        c.reliability
                    );
                    abandoned.push(m);
                }
            }
        }

        if abandoned.is_empty() {
            return abandoned;
        }

        // fragments of the same message share its fate
        let tsns: Vec<u32> = self.inflight_queue.tsns().collect();
        for tsn in tsns {
            if let Some(c) = self.inflight_queue.get_mut(tsn) {
                if abandoned.iter().any(|m| m.message_id == c.message_id) {
                    c.abandoned = true;
                    c.retransmit = false;
                    c.fast_retransmit = false;
                }
            }
        }

        self.advance_peer_tsn_ack_point();
        abandoned
    }

    /// RFC 3758 Sec 3.5 C2
    fn advance_peer_tsn_ack_point(&mut self) {
        if !self.use_forward_tsn {
            return;
        }
        let mut i = self.advanced_peer_tsn_ack_point.wrapping_add(1);
        while let Some(c) = self.inflight_queue.get(i) {
            if !c.abandoned {
                break;
            }
            self.advanced_peer_tsn_ack_point = i;
            i = i.wrapping_add(1);
        }
    }

    /// RFC 3758 Sec 3.5 C3
    pub(crate) fn should_send_forward_tsn(&self) -> bool {
        self.use_forward_tsn
            && sna32gt(
                self.advanced_peer_tsn_ack_point,
                self.cumulative_tsn_ack_point,
            )
    }

    /// RFC 3758 Sec 3.5 C4: one entry per ordered stream, carrying the
    /// highest abandoned SSN.
    pub(crate) fn create_forward_tsn(&self) -> ChunkForwardTsn {
        let mut stream_map: HashMap<u16, u16> = HashMap::new();
        let mut i = self.cumulative_tsn_ack_point.wrapping_add(1);
        while sna32lte(i, self.advanced_peer_tsn_ack_point) {
            let c = match self.inflight_queue.get(i) {
                Some(c) => c,
                None => break,
            };
            if !c.unordered {
                let ssn = stream_map
                    .entry(c.stream_identifier)
                    .or_insert(c.stream_sequence_number);
                if sna16lt(*ssn, c.stream_sequence_number) {
                    *ssn = c.stream_sequence_number;
                }
            }
            i = i.wrapping_add(1);
        }

        let mut streams: Vec<ChunkForwardTsnStream> = stream_map
            .into_iter()
            .map(|(identifier, sequence)| ChunkForwardTsnStream {
                identifier,
                sequence,
            })
            .collect();
        streams.sort_by_key(|s| s.identifier);

        let fwd_tsn = ChunkForwardTsn {
            new_cumulative_tsn: self.advanced_peer_tsn_ack_point,
            streams,
        };
        log::trace!(
            "[{}] building fwd_tsn: newCumulativeTSN={} cumTSN={} - {}",
            self.name,
            fwd_tsn.new_cumulative_tsn,
            self.cumulative_tsn_ack_point,
            fwd_tsn
        );
        fwd_tsn
    }

    /// Drops all outstanding chunks, oldest first.
    pub(crate) fn drain(&mut self, cc: &mut CongestionControl) -> Vec<ChunkPayloadData> {
        let chunks = self.inflight_queue.drain();
        cc.inflight = 0;
        chunks
    }
}
