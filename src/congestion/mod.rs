#[cfg(test)]
mod congestion_test;

use crate::util::*;

/// Sender side congestion and flow control of one association.
///
/// Implements RFC 4960 sec 7.2 (slow start, congestion avoidance, fast
/// recovery) and the window checks of sec 6.1. Every amount is in bytes of
/// user data; chunk and packet headers are not counted.
#[derive(Debug, Clone, Default)]
pub(crate) struct CongestionControl {
    pub(crate) mtu: u32,
    pub(crate) cwnd: u32,
    pub(crate) ssthresh: u32,
    pub(crate) partial_bytes_acked: u32,
    /// Receiver window as last advertised by the peer.
    pub(crate) rwnd: u32,
    pub(crate) inflight: u32,
    pub(crate) in_fast_recovery: bool,
    pub(crate) fast_recover_exit_point: u32,
}

impl CongestionControl {
    pub(crate) fn new(mtu: u32, peer_rwnd: u32) -> Self {
        // RFC 4960 sec 7.2.1.  Slow-Start
        //   o  The initial cwnd before DATA transmission or after a sufficiently
        //      long idle period MUST be set to min(4*MTU, max (2*MTU, 4380
        //      bytes)).
        //   o  The initial value of ssthresh MAY be arbitrarily high (for
        //      example, implementations MAY use the size of the receiver
        //      advertised window).
        CongestionControl {
            mtu,
            cwnd: std::cmp::min(4 * mtu, std::cmp::max(2 * mtu, 4380)),
            ssthresh: peer_rwnd,
            rwnd: peer_rwnd,
            ..Default::default()
        }
    }

    /// Whether a new DATA chunk carrying `len` bytes may be put in flight.
    pub(crate) fn can_send(&self, len: u32) -> bool {
        // RFC 4960 sec 6.1.  Transmission of DATA Chunks
        //   A) ... regardless of the value of rwnd (including if it is 0), the
        //      data sender can always have one DATA chunk in flight to the
        //      receiver if allowed by cwnd (see rule B, below).
        if self.inflight == 0 {
            return true;
        }
        self.inflight.saturating_add(len) <= self.window()
    }

    /// min(cwnd, rwnd)
    pub(crate) fn window(&self) -> u32 {
        std::cmp::min(self.cwnd, self.rwnd)
    }

    pub(crate) fn on_sent(&mut self, len: u32) {
        self.inflight += len;
    }

    /// Records bytes leaving the network, either cumulatively acked, gap acked
    /// or dropped with the association.
    pub(crate) fn on_acked(&mut self, len: u32) {
        self.inflight = self.inflight.saturating_sub(len);
    }

    /// Applies the window growth rules for a SACK that newly acknowledged
    /// `bytes_acked` bytes. `fully_utilized` tells whether the sender had at
    /// least cwnd bytes to send before the SACK arrived.
    pub(crate) fn on_sack(
        &mut self,
        bytes_acked: u32,
        cum_tsn_ack: u32,
        cum_tsn_advanced: bool,
        fully_utilized: bool,
    ) {
        if self.in_fast_recovery && sna32gte(cum_tsn_ack, self.fast_recover_exit_point) {
            log::debug!(
                "exit fast-recovery: cumTSN={} exit-point={}",
                cum_tsn_ack,
                self.fast_recover_exit_point
            );
            self.in_fast_recovery = false;
        }

        if !cum_tsn_advanced {
            return;
        }

        if self.cwnd <= self.ssthresh {
            // RFC 4960 sec 7.2.1.  Slow-Start
            //   Only when these three conditions are met can the cwnd be
            //   increased; otherwise, the cwnd MUST not be increased.
            if !self.in_fast_recovery && fully_utilized {
                self.cwnd += std::cmp::min(bytes_acked, self.cwnd);
                log::trace!(
                    "updated cwnd={} ssthresh={} acked={} (SS)",
                    self.cwnd,
                    self.ssthresh,
                    bytes_acked
                );
            }
        } else {
            // RFC 4960 sec 7.2.2.  Congestion Avoidance
            self.partial_bytes_acked += bytes_acked;
            if self.partial_bytes_acked >= self.cwnd && fully_utilized {
                self.partial_bytes_acked -= self.cwnd;
                self.cwnd += self.mtu;
                log::trace!(
                    "updated cwnd={} ssthresh={} acked={} (CA)",
                    self.cwnd,
                    self.ssthresh,
                    bytes_acked
                );
            }
        }
    }

    /// Collapses the window after a T3-rtx expiry.
    pub(crate) fn on_retransmission_timeout(&mut self) {
        // RFC 4960 sec 7.2.3
        //   When the T3-rtx timer expires on an address, SCTP should perform slow
        //   start. The floor of ssthresh is two MTUs here.
        self.ssthresh = std::cmp::max(self.cwnd / 2, 2 * self.mtu);
        self.cwnd = self.mtu;
        self.partial_bytes_acked = 0;
        self.in_fast_recovery = false;
        log::trace!(
            "updated cwnd={} ssthresh={} inflight={} (RTO)",
            self.cwnd,
            self.ssthresh,
            self.inflight
        );
    }

    /// Enters fast recovery unless already in it. Returns false when the
    /// window was left alone.
    pub(crate) fn on_fast_retransmit(&mut self, htna: u32) -> bool {
        if self.in_fast_recovery {
            return false;
        }

        self.in_fast_recovery = true;
        self.fast_recover_exit_point = htna;
        self.ssthresh = std::cmp::max(self.cwnd / 2, 2 * self.mtu);
        self.cwnd = self.ssthresh;
        self.partial_bytes_acked = 0;
        log::trace!(
            "updated cwnd={} ssthresh={} inflight={} (FR)",
            self.cwnd,
            self.ssthresh,
            self.inflight
        );
        true
    }

    pub(crate) fn set_rwnd(&mut self, a_rwnd: u32) {
        self.rwnd = a_rwnd;
    }
}
