use std::time::Duration;

use bytes::{BufMut, BytesMut};

use super::*;
use crate::chunk::chunk_cookie_ack::ChunkCookieAck;
use crate::chunk::chunk_error::ChunkError;
use crate::chunk::chunk_forward_tsn::ChunkForwardTsn;
use crate::chunk::chunk_heartbeat::ChunkHeartbeat;
use crate::chunk::chunk_payload_data::ChunkPayloadData;
use crate::chunk::chunk_selective_ack::ChunkSelectiveAck;
use crate::chunk::chunk_shutdown::ChunkShutdown;
use crate::chunk::chunk_shutdown_ack::ChunkShutdownAck;
use crate::chunk::chunk_shutdown_complete::ChunkShutdownComplete;
use crate::chunk::chunk_unknown::ChunkUnknown;
use crate::error::ErrorKind;
use crate::packet::{bundle_chunks, Packet, PacketHeader};
use crate::queue::pending_queue::BufferedAmountLow;
use crate::retransmission::{AbandonedMessage, SackOutcome};
use crate::util::*;

impl Association {
    pub(super) fn handle_inbound(&mut self, raw: &Bytes) {
        let p = match Packet::unmarshal(raw) {
            Ok(p) => p,
            Err(err) => {
                self.drop_packet(&err);
                return;
            }
        };

        if let Err(err) = p.check_packet() {
            self.drop_packet(&err);
            return;
        }
        if let Some(err) = p.chunks.iter().find_map(|c| c.check().err()) {
            self.drop_packet(&err);
            return;
        }
        if !self.is_verification_tag_valid(&p) {
            self.drop_packet(&Error::ErrVerificationTagMismatch {
                expected: self.my_verification_tag,
                actual: p.verification_tag,
            });
            return;
        }

        self.last_activity = self.timers.now();
        self.on_peer_alive();

        let header = PacketHeader {
            source_port: p.source_port,
            destination_port: p.destination_port,
            verification_tag: p.verification_tag,
        };

        for c in p.chunks {
            match self.handle_chunk(&header, c) {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    self.handle_chunk_error(err);
                    break;
                }
            }
            if self.has_closed {
                break;
            }
        }

        if !self.has_closed {
            self.handle_chunk_end();
        }
    }

    fn drop_packet(&mut self, err: &Error) {
        self.stats.inc_dropped_packets();
        if err.kind() == ErrorKind::TransportLoss {
            log::trace!("[{}] packet dropped: {}", self.name, err);
        } else {
            log::debug!("[{}] packet dropped: {}", self.name, err);
        }
    }

    fn handle_chunk_error(&mut self, err: Error) {
        match err.kind() {
            ErrorKind::ProtocolViolation => {
                log::warn!("[{}] protocol violation: {}", self.name, err);
                let abort = ChunkAbort {
                    error_causes: vec![ErrorCause::new(
                        PROTOCOL_VIOLATION,
                        Bytes::from(err.to_string()),
                    )],
                };
                self.send_chunks(VecDeque::from([Chunk::Abort(abort)]));
                self.close(Some(err));
            }
            ErrorKind::MalformedChunk | ErrorKind::TransportLoss => self.drop_packet(&err),
            _ => {
                log::debug!("[{}] failed to handle chunk: {}", self.name, err);
                self.handler.on_error(err);
            }
        }
    }

    fn is_verification_tag_valid(&self, p: &Packet) -> bool {
        // INIT carries a zero tag, already enforced by check_packet
        if p.chunks.iter().any(|c| matches!(c, Chunk::Init(_))) {
            return true;
        }
        if p.verification_tag == self.my_verification_tag {
            return true;
        }

        // RFC 4960 sec 8.5.1 B) and C): ABORT and SHUTDOWN COMPLETE may carry
        // the tag of their sender instead (T bit).
        p.verification_tag == self.peer_verification_tag
            && p
                .chunks
                .iter()
                .any(|c| matches!(c, Chunk::Abort(_) | Chunk::ShutdownComplete(_)))
    }

    /// Returns false when the rest of the packet must be skipped.
    fn handle_chunk(&mut self, header: &PacketHeader, c: Chunk) -> Result<bool> {
        log::trace!("[{}] received {}", self.name, c);

        match c {
            Chunk::Init(i) => self.handle_init(header, i),
            Chunk::InitAck(i) => self.handle_init_ack(i)?,
            Chunk::CookieEcho(c) => self.handle_cookie_echo(c),
            Chunk::CookieAck(_) => self.handle_cookie_ack(),
            Chunk::PayloadData(d) => self.handle_data(d),
            Chunk::SelectiveAck(d) => self.handle_sack(d)?,
            Chunk::Heartbeat(hb) => self.handle_heartbeat(hb),
            Chunk::HeartbeatAck(hb) => self.handle_heartbeat_ack(hb),
            Chunk::Abort(a) => {
                let reason = a.reason();
                log::debug!("[{}] ABORT received: {}", self.name, reason);
                self.close(Some(Error::ErrAbortReceived(reason)));
                return Ok(false);
            }
            Chunk::Shutdown(s) => self.handle_shutdown(s)?,
            Chunk::ShutdownAck(_) => self.handle_shutdown_ack(),
            Chunk::ShutdownComplete(_) => self.handle_shutdown_complete(),
            Chunk::Error(e) => self.handle_error(e),
            Chunk::ForwardTsn(f) => self.handle_forward_tsn(f)?,
            Chunk::Unknown(u) => return Ok(self.handle_unknown(u)),
        }

        Ok(true)
    }

    fn handle_init(&mut self, header: &PacketHeader, i: ChunkInit) {
        match self.state {
            AssociationState::Closed
            | AssociationState::CookieWait
            | AssociationState::CookieEchoed => {}
            _ => {
                // restarting an association is not supported
                log::debug!("[{}] INIT ignored in state {}", self.name, self.state);
                return;
            }
        }

        log::debug!(
            "[{}] INIT received: initiate_tag={} initial_tsn={} streams={}/{}",
            self.name,
            i.initiate_tag,
            i.initial_tsn,
            i.num_outbound_streams,
            i.num_inbound_streams
        );

        self.source_port = header.destination_port;
        self.destination_port = header.source_port;
        self.peer_verification_tag = i.initiate_tag;
        self.apply_peer_init(&i);

        let cookie = self
            .my_cookie
            .get_or_insert_with(Param::new_state_cookie)
            .clone();

        let mut params = vec![cookie];
        if self.config.forward_tsn_supported() {
            params.push(Param::ForwardTsnSupported);
        }
        // RFC 4960 sec 3.2.1: parameter types with the second highest bit set
        // are reported back when not understood.
        for p in &i.params {
            if let Param::Unknown { typ, .. } = p {
                if typ & 0x4000 != 0 {
                    params.push(Param::Unrecognized(p.marshal()));
                }
            }
        }

        let init_ack = ChunkInit {
            is_ack: true,
            initiate_tag: self.my_verification_tag,
            advertised_receiver_window_credit: self.config.max_receive_buffer_size(),
            num_outbound_streams: self.config.max_num_outbound_streams(),
            num_inbound_streams: self.config.max_num_inbound_streams(),
            initial_tsn: self.tracker.my_next_tsn,
            params,
        };
        self.control_queue.push_back(Chunk::InitAck(init_ack));
    }

    fn handle_init_ack(&mut self, i: ChunkInit) -> Result<()> {
        if self.state != AssociationState::CookieWait {
            // RFC 4960 sec 5.2.3: discard INIT ACK outside COOKIE-WAIT
            log::debug!("[{}] INIT ACK ignored in state {}", self.name, self.state);
            return Ok(());
        }

        let cookie = i.state_cookie().cloned().ok_or(Error::ErrInitAckNoCookie)?;
        for p in &i.params {
            if let Param::Unrecognized(raw) = p {
                log::debug!("[{}] peer did not recognize a parameter: {:?}", self.name, raw);
            }
        }

        self.timer_table
            .stop(Timer::T1Init, self.timers.as_mut());
        self.stored_init = None;

        self.peer_verification_tag = i.initiate_tag;
        self.apply_peer_init(&i);

        let cookie_echo = ChunkCookieEcho { cookie };
        self.control_queue
            .push_back(Chunk::CookieEcho(cookie_echo.clone()));
        self.stored_cookie_echo = Some(cookie_echo);

        let rto = self.rto();
        self.timer_table
            .start(Timer::T1Cookie, self.timers.as_mut(), rto);
        self.set_state(AssociationState::CookieEchoed);
        Ok(())
    }

    /// Adopts the peer parameters carried by INIT or INIT ACK.
    fn apply_peer_init(&mut self, i: &ChunkInit) {
        self.peer_last_tsn = i.initial_tsn.wrapping_sub(1);
        self.my_max_num_outbound_streams = std::cmp::min(
            self.config.max_num_outbound_streams(),
            i.num_inbound_streams,
        );
        self.my_max_num_inbound_streams = std::cmp::min(
            self.config.max_num_inbound_streams(),
            i.num_outbound_streams,
        );
        self.cc = CongestionControl::new(
            self.config.mtu() as u32,
            i.advertised_receiver_window_credit,
        );
        self.tracker.use_forward_tsn =
            self.config.forward_tsn_supported() && i.forward_tsn_supported();

        log::debug!(
            "[{}] peer: a_rwnd={} outbound={} inbound={} forward_tsn={}",
            self.name,
            i.advertised_receiver_window_credit,
            self.my_max_num_outbound_streams,
            self.my_max_num_inbound_streams,
            self.tracker.use_forward_tsn
        );
    }

    fn handle_cookie_echo(&mut self, c: ChunkCookieEcho) {
        let matched = match &self.my_cookie {
            Some(Param::StateCookie(cookie)) => *cookie == c.cookie,
            _ => false,
        };
        if !matched {
            log::debug!("[{}] COOKIE ECHO with unknown cookie discarded", self.name);
            return;
        }

        match self.state {
            AssociationState::Closed
            | AssociationState::CookieWait
            | AssociationState::CookieEchoed => {
                self.timer_table
                    .stop(Timer::T1Init, self.timers.as_mut());
                self.timer_table
                    .stop(Timer::T1Cookie, self.timers.as_mut());
                self.stored_init = None;
                self.stored_cookie_echo = None;
                self.on_established();
            }
            // our COOKIE ACK got lost
            AssociationState::Established => {}
            _ => {
                self.control_queue.push_back(Chunk::Error(ChunkError {
                    error_causes: vec![ErrorCause::new(
                        COOKIE_RECEIVED_WHILE_SHUTTING_DOWN,
                        Bytes::new(),
                    )],
                }));
                return;
            }
        }

        self.control_queue.push_back(Chunk::CookieAck(ChunkCookieAck));
    }

    fn handle_cookie_ack(&mut self) {
        if self.state != AssociationState::CookieEchoed {
            log::debug!("[{}] COOKIE ACK ignored in state {}", self.name, self.state);
            return;
        }

        self.timer_table
            .stop(Timer::T1Cookie, self.timers.as_mut());
        self.stored_cookie_echo = None;
        self.on_established();
    }

    fn on_established(&mut self) {
        self.set_state(AssociationState::Established);
        if let Some(interval) = self.config.heartbeat_interval() {
            self.timer_table
                .start(Timer::Heartbeat, self.timers.as_mut(), interval);
        }
    }

    fn handle_data(&mut self, d: ChunkPayloadData) {
        match self.state {
            AssociationState::Established
            | AssociationState::ShutdownPending
            | AssociationState::ShutdownSent
            | AssociationState::ShutdownReceived => {}
            _ => {
                log::debug!("[{}] DATA ignored in state {}", self.name, self.state);
                return;
            }
        }

        self.stats.inc_datas_received();
        log::trace!(
            "[{}] DATA: tsn={} si={} ssn={} immediateSack={} len={}",
            self.name,
            d.tsn,
            d.stream_identifier,
            d.stream_sequence_number,
            d.immediate_sack,
            d.user_data.len()
        );

        let immediate_sack = d.immediate_sack;

        if d.stream_identifier >= self.my_max_num_inbound_streams {
            // RFC 4960 sec 6.5: acknowledge the TSN, drop the data and
            // report the bad stream.
            log::debug!(
                "[{}] DATA on invalid stream {} dropped",
                self.name,
                d.stream_identifier
            );
            let mut raw = BytesMut::with_capacity(4);
            raw.put_u16(d.stream_identifier);
            raw.put_u16(0);
            self.control_queue.push_back(Chunk::Error(ChunkError {
                error_causes: vec![ErrorCause::new(INVALID_STREAM_IDENTIFIER, raw.freeze())],
            }));

            let mut d = d;
            d.user_data = Bytes::new();
            self.payload_queue.push(d, self.peer_last_tsn);
            self.handle_peer_last_tsn_and_acknowledgement(immediate_sack);
            return;
        }

        if !self.payload_queue.can_push(&d, self.peer_last_tsn) {
            // records the duplicate for the next SACK
            self.payload_queue.push(d, self.peer_last_tsn);
        } else if self.get_my_receiver_window_credit() > 0 || self.fills_hole(d.tsn) {
            self.payload_queue.push(d.clone(), self.peer_last_tsn);
            self.deliver_data(d);
        } else {
            log::debug!(
                "[{}] receive buffer full, DATA with tsn={} dropped",
                self.name,
                d.tsn
            );
        }

        self.handle_peer_last_tsn_and_acknowledgement(immediate_sack);
    }

    /// Chunks below the highest TSN received are accepted even with a full
    /// buffer, since they let queued data drain.
    fn fills_hole(&self, tsn: u32) -> bool {
        self.payload_queue
            .get_last_tsn_received()
            .map_or(false, |last| sna32lt(tsn, *last))
    }

    fn deliver_data(&mut self, d: ChunkPayloadData) {
        let si = d.stream_identifier;
        if !self.streams.contains_key(&si) {
            log::debug!("[{}] peer opened stream {}", self.name, si);
            self.streams
                .insert(si, Stream::new(si, true, Reliability::Reliable));
            self.handler.on_stream_opened(si);
        }

        let readable = match self.streams.get_mut(&si) {
            Some(s) => s.handle_data(d),
            None => false,
        };
        if readable {
            self.deliver_readable(si);
        }
    }

    fn deliver_readable(&mut self, si: u16) {
        while let Some(m) = self.streams.get_mut(&si).and_then(|s| s.read()) {
            log::trace!("[{}] delivering {} bytes on stream {}", self.name, m.len(), si);
            self.handler.on_message_received(si, m);
        }
    }

    fn handle_peer_last_tsn_and_acknowledgement(&mut self, sack_immediately: bool) {
        // Try to advance peer_last_tsn

        // From RFC 3758 Sec 3.6:
        //   .. and then MUST further advance its cumulative TSN point locally
        //   if possible
        // Meaning, if peer_last_tsn+1 points to a chunk that is received,
        // advance peer_last_tsn until peer_last_tsn+1 points to unreceived chunk.
        while self
            .payload_queue
            .pop(self.peer_last_tsn.wrapping_add(1))
            .is_some()
        {
            self.peer_last_tsn = self.peer_last_tsn.wrapping_add(1);
        }

        let has_packet_loss = !self.payload_queue.is_empty();
        if has_packet_loss {
            log::trace!(
                "[{}] packetloss: {}",
                self.name,
                self.payload_queue
                    .get_gap_ack_blocks_string(self.peer_last_tsn)
            );
        }

        let delay_allowed = match self.config.ack_mode() {
            AckMode::Normal => {
                self.ack_state != AckState::Immediate
                    && !sack_immediately
                    && !has_packet_loss
                    && !self.payload_queue.has_duplicates()
            }
            AckMode::NoDelay => false,
            AckMode::AlwaysDelay => true,
        };

        if delay_allowed {
            // a second packet waiting for its ack is acked at once
            if self.ack_state == AckState::Idle {
                self.delayed_ack_triggered = true;
            } else {
                self.immediate_ack_triggered = true;
            }
        } else {
            self.immediate_ack_triggered = true;
        }
    }

    fn handle_chunk_end(&mut self) {
        if self.immediate_ack_triggered {
            self.ack_state = AckState::Immediate;
            self.timer_table.stop(Timer::Ack, self.timers.as_mut());
        } else if self.delayed_ack_triggered && self.ack_state != AckState::Immediate {
            self.ack_state = AckState::Delay;
            if !self.timer_table.is_running(Timer::Ack) {
                let timeout = self.config.delayed_ack_timeout();
                self.timer_table
                    .start(Timer::Ack, self.timers.as_mut(), timeout);
            }
        }

        self.immediate_ack_triggered = false;
        self.delayed_ack_triggered = false;
    }

    /// The receiver window we advertise: buffer space not taken by messages
    /// waiting in reassembly.
    pub(super) fn get_my_receiver_window_credit(&self) -> u32 {
        let bytes_queued: usize = self
            .streams
            .values()
            .map(|s| s.get_num_bytes_in_reassembly_queue())
            .sum();
        (self.config.max_receive_buffer_size() as usize).saturating_sub(bytes_queued) as u32
    }

    fn create_selective_ack_chunk(&mut self) -> ChunkSelectiveAck {
        ChunkSelectiveAck {
            cumulative_tsn_ack: self.peer_last_tsn,
            advertised_receiver_window_credit: self.get_my_receiver_window_credit(),
            gap_ack_blocks: self.payload_queue.get_gap_ack_blocks(self.peer_last_tsn),
            duplicate_tsn: self.payload_queue.pop_duplicates(),
        }
    }

    fn handle_sack(&mut self, d: ChunkSelectiveAck) -> Result<()> {
        match self.state {
            AssociationState::Established
            | AssociationState::ShutdownPending
            | AssociationState::ShutdownSent
            | AssociationState::ShutdownReceived => {}
            _ => {
                log::debug!("[{}] SACK ignored in state {}", self.name, self.state);
                return Ok(());
            }
        }

        self.stats.inc_sacks_received();
        let now = self.timers.now();
        let pending_bytes = self.pending_queue.get_num_bytes();
        let outcome = self
            .tracker
            .handle_sack(&d, now, &mut self.cc, pending_bytes)?;
        self.process_sack_outcome(outcome);
        Ok(())
    }

    fn process_sack_outcome(&mut self, outcome: SackOutcome) {
        if outcome.stale {
            return;
        }

        for message_id in &outcome.acked {
            let delivered = match self.messages.get_mut(message_id) {
                Some(m) => {
                    m.unacked_fragments = m.unacked_fragments.saturating_sub(1);
                    m.unacked_fragments == 0
                }
                None => false,
            };
            if delivered {
                self.messages.remove(message_id);
            }
        }

        if outcome.fast_retransmit {
            self.will_retransmit_fast = true;
        }

        // RFC 4960 sec 6.3.2 R2) and R3)
        if outcome.all_acked {
            self.timer_table
                .stop(Timer::T3Rtx, self.timers.as_mut());
        } else if outcome.cum_tsn_ack_point_advanced {
            let rto = self.rto();
            self.timer_table
                .stop(Timer::T3Rtx, self.timers.as_mut());
            self.timer_table
                .start(Timer::T3Rtx, self.timers.as_mut(), rto);
        }

        if self.tracker.should_send_forward_tsn() {
            self.will_send_forward_tsn = true;
        }
    }

    fn handle_heartbeat(&mut self, hb: ChunkHeartbeat) {
        log::trace!("[{}] HEARTBEAT received, replying", self.name);
        self.control_queue
            .push_back(Chunk::HeartbeatAck(ChunkHeartbeat {
                is_ack: true,
                info: hb.info,
            }));
    }

    fn handle_heartbeat_ack(&mut self, hb: ChunkHeartbeat) {
        if self.heartbeat_info.as_ref() == Some(&hb.info) {
            log::trace!("[{}] HEARTBEAT ACK received", self.name);
            self.heartbeat_info = None;
        } else {
            log::debug!("[{}] unexpected HEARTBEAT ACK ignored", self.name);
        }
    }

    fn handle_shutdown(&mut self, s: ChunkShutdown) -> Result<()> {
        match self.state {
            AssociationState::Established | AssociationState::ShutdownPending => {
                // the cumulative TSN ack of a SHUTDOWN acts as a SACK
                let sack = ChunkSelectiveAck {
                    cumulative_tsn_ack: s.cumulative_tsn_ack,
                    advertised_receiver_window_credit: self.cc.rwnd,
                    ..Default::default()
                };
                let now = self.timers.now();
                let pending_bytes = self.pending_queue.get_num_bytes();
                let outcome =
                    self.tracker
                        .handle_sack(&sack, now, &mut self.cc, pending_bytes)?;
                self.process_sack_outcome(outcome);

                // SHUTDOWN ACK goes out once our own data is acknowledged
                self.set_state(AssociationState::ShutdownReceived);
            }
            AssociationState::ShutdownSent => {
                // both ends started shutting down
                self.timer_table
                    .stop(Timer::T2Shutdown, self.timers.as_mut());
                self.set_state(AssociationState::ShutdownAckSent);
                self.will_send_shutdown_ack = true;
                let rto = self.rto();
                self.timer_table
                    .start(Timer::T2Shutdown, self.timers.as_mut(), rto);
            }
            _ => {
                log::debug!("[{}] SHUTDOWN ignored in state {}", self.name, self.state);
            }
        }
        Ok(())
    }

    fn handle_shutdown_ack(&mut self) {
        match self.state {
            AssociationState::ShutdownSent | AssociationState::ShutdownAckSent => {
                self.timer_table
                    .stop(Timer::T2Shutdown, self.timers.as_mut());
                self.send_chunks(VecDeque::from([Chunk::ShutdownComplete(
                    ChunkShutdownComplete,
                )]));
                self.close(None);
            }
            _ => {
                log::debug!(
                    "[{}] SHUTDOWN ACK ignored in state {}",
                    self.name,
                    self.state
                );
            }
        }
    }

    fn handle_shutdown_complete(&mut self) {
        if self.state == AssociationState::ShutdownAckSent {
            self.timer_table
                .stop(Timer::T2Shutdown, self.timers.as_mut());
            self.close(None);
        } else {
            log::debug!(
                "[{}] SHUTDOWN COMPLETE ignored in state {}",
                self.name,
                self.state
            );
        }
    }

    fn handle_error(&mut self, e: ChunkError) {
        for cause in e.error_causes {
            log::debug!("[{}] peer reported error: {}", self.name, cause);
            self.handler
                .on_error(Error::ErrPeerReported(cause.to_string()));
        }
    }

    fn handle_forward_tsn(&mut self, c: ChunkForwardTsn) -> Result<()> {
        log::trace!("[{}] FwdTSN: {}", self.name, c);

        if !self.tracker.use_forward_tsn {
            log::warn!("[{}] received FwdTSN but not enabled", self.name);
            // Return an error chunk
            let raw = Chunk::ForwardTsn(c).marshal()?;
            self.control_queue.push_back(Chunk::Error(ChunkError {
                error_causes: vec![ErrorCause::new(UNRECOGNIZED_CHUNK_TYPE, raw)],
            }));
            return Ok(());
        }

        // From RFC 3758 Sec 3.6:
        //   Note, if the "New Cumulative TSN" value carried in the arrived
        //   FORWARD TSN chunk is found to be behind or at the current
        //   cumulative TSN point, the data receiver MUST treat this FORWARD
        //   TSN as out-of-date and MUST NOT update its Cumulative TSN.  The
        //   receiver SHOULD send a SACK to its peer (the sender of the FORWARD
        //   TSN) since such a duplicate may indicate the previous SACK was lost
        //   in the network.
        if sna32lte(c.new_cumulative_tsn, self.peer_last_tsn) {
            log::trace!(
                "[{}] sending ack on Forward TSN",
                self.name
            );
            self.immediate_ack_triggered = true;
            return Ok(());
        }

        // From RFC 3758 Sec 3.6:
        //   the receiver MUST perform the same TSN handling, including duplicate
        //   detection, gap detection, SACK generation, cumulative TSN
        //   advancement, etc. as defined in RFC 2960 [2]---with the following
        //   exceptions and additions.
        //   When a FORWARD TSN chunk arrives, the data receiver MUST first update
        //   its cumulative TSN point to the value carried in the FORWARD TSN
        //   chunk,
        let skipped = self.payload_queue.pop_through(c.new_cumulative_tsn);
        log::trace!(
            "[{}] cumulative TSN {} -> {}, {} received chunks skipped",
            self.name,
            self.peer_last_tsn,
            c.new_cumulative_tsn,
            skipped
        );
        self.peer_last_tsn = c.new_cumulative_tsn;

        // Messages of ordered streams up to the listed SSN will never arrive
        for forwarded in &c.streams {
            if let Some(s) = self.streams.get_mut(&forwarded.identifier) {
                s.handle_forward_tsn_for_ordered(forwarded.sequence);
            }
        }

        // Unordered fragments below the new cumulative TSN are dropped on
        // every stream
        for s in self.streams.values_mut() {
            s.handle_forward_tsn_for_unordered(c.new_cumulative_tsn);
        }

        let mut stream_ids: Vec<u16> = self.streams.keys().copied().collect();
        stream_ids.sort_unstable();
        for si in stream_ids {
            self.deliver_readable(si);
        }

        self.handle_peer_last_tsn_and_acknowledgement(false);
        Ok(())
    }

    /// Applies the action encoded in the two upper bits of an unrecognized
    /// chunk type. Returns whether processing of the packet continues.
    fn handle_unknown(&mut self, c: ChunkUnknown) -> bool {
        let typ = c.hdr.typ;
        log::debug!("[{}] unrecognized chunk type {}", self.name, typ);

        if typ.report_if_unrecognized() {
            self.control_queue.push_back(Chunk::Error(ChunkError {
                error_causes: vec![ErrorCause::new(UNRECOGNIZED_CHUNK_TYPE, c.raw())],
            }));
        }

        typ.skip_if_unrecognized()
    }

    /// Any valid packet proves the peer alive: the heartbeat cycle restarts.
    fn on_peer_alive(&mut self) {
        let interval = match self.config.heartbeat_interval() {
            Some(interval) => interval,
            None => return,
        };
        if self.timer_table.is_running(Timer::Heartbeat) {
            self.timer_table.reset_retrans(Timer::Heartbeat);
            self.timer_table
                .start(Timer::Heartbeat, self.timers.as_mut(), interval);
        }
    }

    pub(super) fn on_timeout(&mut self, timer: Timer) {
        match timer {
            Timer::T1Init => self.on_t1_init_timeout(),
            Timer::T1Cookie => self.on_t1_cookie_timeout(),
            Timer::T2Shutdown => self.on_t2_shutdown_timeout(),
            Timer::T3Rtx => self.on_t3_rtx_timeout(),
            Timer::Ack => {
                log::trace!("[{}] delayed ack timer expired", self.name);
                self.stats.inc_ack_timeouts();
                self.ack_state = AckState::Immediate;
            }
            Timer::Heartbeat => self.on_heartbeat_timeout(),
        }
    }

    fn backoff(&self, n_rtos: u32) -> Duration {
        Duration::from_millis(self.tracker.rto_mgr.backoff(n_rtos))
    }

    fn on_t1_init_timeout(&mut self) {
        let n_rtos = self.timer_table.bump_retrans(Timer::T1Init);
        if n_rtos > self.config.max_init_retransmits() {
            log::debug!(
                "[{}] T1-init timer expired {} times, giving up",
                self.name,
                n_rtos
            );
            self.close(Some(Error::ErrHandshakeTimeout));
            return;
        }

        log::debug!("[{}] retransmitting INIT (n_rtos={})", self.name, n_rtos);
        self.send_init();
        let timeout = self.backoff(n_rtos);
        self.timer_table
            .start(Timer::T1Init, self.timers.as_mut(), timeout);
    }

    fn on_t1_cookie_timeout(&mut self) {
        let n_rtos = self.timer_table.bump_retrans(Timer::T1Cookie);
        if n_rtos > self.config.max_init_retransmits() {
            log::debug!(
                "[{}] T1-cookie timer expired {} times, giving up",
                self.name,
                n_rtos
            );
            self.close(Some(Error::ErrHandshakeTimeout));
            return;
        }

        log::debug!(
            "[{}] retransmitting COOKIE ECHO (n_rtos={})",
            self.name,
            n_rtos
        );
        if let Some(cookie_echo) = &self.stored_cookie_echo {
            self.control_queue
                .push_back(Chunk::CookieEcho(cookie_echo.clone()));
        }
        let timeout = self.backoff(n_rtos);
        self.timer_table
            .start(Timer::T1Cookie, self.timers.as_mut(), timeout);
    }

    fn on_t2_shutdown_timeout(&mut self) {
        let n_rtos = self.timer_table.bump_retrans(Timer::T2Shutdown);
        if n_rtos > self.config.max_data_retransmits() {
            self.close(Some(Error::ErrTooManyRetransmissions));
            return;
        }

        match self.state {
            AssociationState::ShutdownSent => self.will_send_shutdown = true,
            AssociationState::ShutdownAckSent => self.will_send_shutdown_ack = true,
            _ => return,
        }
        let timeout = self.backoff(n_rtos);
        self.timer_table
            .start(Timer::T2Shutdown, self.timers.as_mut(), timeout);
    }

    fn on_t3_rtx_timeout(&mut self) {
        let n_rtos = self.timer_table.bump_retrans(Timer::T3Rtx);
        if n_rtos > self.config.max_data_retransmits() {
            log::debug!(
                "[{}] T3-rtx timer expired {} times, giving up",
                self.name,
                n_rtos
            );
            self.close(Some(Error::ErrTooManyRetransmissions));
            return;
        }

        self.stats.inc_t3timeouts();
        self.tracker.on_retransmission_timeout(&mut self.cc);
        // RFC 3758 Sec 3.5 A5: a lost FORWARD TSN goes out again
        if self.tracker.should_send_forward_tsn() {
            self.will_send_forward_tsn = true;
        }

        let timeout = self.backoff(n_rtos);
        self.timer_table
            .start(Timer::T3Rtx, self.timers.as_mut(), timeout);
    }

    fn on_heartbeat_timeout(&mut self) {
        let interval = match self.config.heartbeat_interval() {
            Some(interval) => interval,
            None => return,
        };

        if self.heartbeat_info.is_some() {
            let n = self.timer_table.bump_retrans(Timer::Heartbeat);
            if n > self.config.max_data_retransmits() {
                log::debug!("[{}] {} heartbeats unanswered, giving up", self.name, n);
                self.close(Some(Error::ErrTooManyRetransmissions));
                return;
            }
        }

        let info = Bytes::copy_from_slice(&rand::random::<u64>().to_be_bytes());
        log::trace!("[{}] sending HEARTBEAT", self.name);
        self.heartbeat_info = Some(info.clone());
        self.control_queue
            .push_back(Chunk::Heartbeat(ChunkHeartbeat {
                is_ack: false,
                info,
            }));

        // RFC 4960 sec 8.3: the interval is the configured value plus RTO
        let timeout = interval + self.rto();
        self.timer_table
            .start(Timer::Heartbeat, self.timers.as_mut(), timeout);
    }

    fn on_messages_abandoned(&mut self, abandoned: Vec<AbandonedMessage>) {
        for a in abandoned {
            self.pending_queue
                .remove_message(a.stream_identifier, a.message_id);
            if let Some(m) = self.messages.remove(&a.message_id) {
                log::debug!(
                    "[{}] message {} on stream {} abandoned",
                    self.name,
                    a.message_id,
                    a.stream_identifier
                );
                self.handler
                    .on_message_failed(m.stream_identifier, m.message, Error::ErrMessageAbandoned);
            }
        }
        self.will_send_forward_tsn = true;
    }

    /// Gathers everything due for transmission and writes it out.
    pub(super) fn flush(&mut self) {
        if self.has_closed {
            return;
        }

        let now = self.timers.now();
        let abandoned = self.tracker.abandon_exhausted(now);
        if !abandoned.is_empty() {
            self.on_messages_abandoned(abandoned);
        }
        self.expire_pending_messages(now);

        let mut chunks: VecDeque<Chunk> = self.control_queue.drain(..).collect();

        if self.ack_state == AckState::Immediate {
            self.ack_state = AckState::Idle;
            self.timer_table.stop(Timer::Ack, self.timers.as_mut());
            let sack = self.create_selective_ack_chunk();
            log::trace!("[{}] sending SACK: {}", self.name, sack);
            self.stats.inc_sacks_sent();
            chunks.push_back(Chunk::SelectiveAck(sack));
        }

        if self.will_send_forward_tsn {
            self.will_send_forward_tsn = false;
            if self.tracker.should_send_forward_tsn() {
                chunks.push_back(Chunk::ForwardTsn(self.tracker.create_forward_tsn()));
            }
        }

        match self.state {
            AssociationState::Established
            | AssociationState::ShutdownPending
            | AssociationState::ShutdownReceived => self.gather_data_chunks(now, &mut chunks),
            _ => {}
        }

        self.gather_shutdown_chunks(&mut chunks);
        self.send_chunks(chunks);
        self.report_buffered_amount_low();
    }

    /// Drops timed messages whose lifetime ended while they were still
    /// waiting for their first transmission. Nothing of them reached the
    /// peer, so no FORWARD-TSN is needed.
    fn expire_pending_messages(&mut self, now: Instant) {
        for (stream_identifier, message_id) in self.pending_queue.expire(now) {
            if let Some(m) = self.messages.remove(&message_id) {
                log::debug!(
                    "[{}] message {} on stream {} expired before it was sent",
                    self.name,
                    message_id,
                    stream_identifier
                );
                self.handler
                    .on_message_failed(m.stream_identifier, m.message, Error::ErrMessageAbandoned);
            }
        }
    }

    pub(super) fn report_buffered_amount_low(&mut self) {
        for low in self.pending_queue.take_buffered_amount_low() {
            match low {
                BufferedAmountLow::Stream(si) => self.handler.on_buffered_amount_low(si),
                BufferedAmountLow::Total => self.handler.on_total_buffered_amount_low(),
            }
        }
    }

    fn gather_data_chunks(&mut self, now: Instant, chunks: &mut VecDeque<Chunk>) {
        let mut data_sent = false;

        if self.will_retransmit_fast {
            self.will_retransmit_fast = false;
            // RFC 4960 sec 7.2.4 3): as many as fit a single packet, no matter
            // what cwnd says
            for c in self
                .tracker
                .pop_fast_retransmissions(self.config.max_payload_size())
            {
                self.stats.inc_fast_retrans();
                chunks.push_back(Chunk::PayloadData(c));
                data_sent = true;
            }
        }

        // chunks marked by T3-rtx, within the window
        for c in self
            .tracker
            .pop_retransmissions(self.cc.window() as usize)
        {
            chunks.push_back(Chunk::PayloadData(c));
            data_sent = true;
        }

        while let Some(c) = self.pending_queue.peek() {
            if !self.cc.can_send(c.user_data.len() as u32) {
                break;
            }
            let mut c = match self.pending_queue.pop() {
                Some(c) => c,
                None => break,
            };
            if let Some(s) = self.streams.get_mut(&c.stream_identifier) {
                s.assign_sequence_number(&mut c);
            }
            let c = self.tracker.push_new(c, now, &mut self.cc);
            self.stats.inc_datas_sent();
            chunks.push_back(Chunk::PayloadData(c));
            data_sent = true;
        }

        if data_sent && !self.timer_table.is_running(Timer::T3Rtx) {
            let rto = self.rto();
            self.timer_table
                .start(Timer::T3Rtx, self.timers.as_mut(), rto);
        }
    }

    fn gather_shutdown_chunks(&mut self, chunks: &mut VecDeque<Chunk>) {
        let drained = self.tracker.is_empty() && self.pending_queue.is_empty();
        match self.state {
            AssociationState::ShutdownPending if drained => {
                self.set_state(AssociationState::ShutdownSent);
                self.will_send_shutdown = true;
                let rto = self.rto();
                self.timer_table
                    .start(Timer::T2Shutdown, self.timers.as_mut(), rto);
            }
            AssociationState::ShutdownReceived if drained => {
                self.set_state(AssociationState::ShutdownAckSent);
                self.will_send_shutdown_ack = true;
                let rto = self.rto();
                self.timer_table
                    .start(Timer::T2Shutdown, self.timers.as_mut(), rto);
            }
            _ => {}
        }

        if self.will_send_shutdown {
            self.will_send_shutdown = false;
            chunks.push_back(Chunk::Shutdown(ChunkShutdown {
                cumulative_tsn_ack: self.peer_last_tsn,
            }));
        }
        if self.will_send_shutdown_ack {
            self.will_send_shutdown_ack = false;
            chunks.push_back(Chunk::ShutdownAck(ChunkShutdownAck));
        }
    }

    /// Bundles `chunks` into as few packets as the MTU allows and writes them.
    pub(super) fn send_chunks(&mut self, mut chunks: VecDeque<Chunk>) {
        let header = PacketHeader {
            source_port: self.source_port,
            destination_port: self.destination_port,
            verification_tag: self.peer_verification_tag,
        };
        let mtu = self.config.mtu();
        while let Some(p) = bundle_chunks(header, &mut chunks, mtu) {
            self.send_packet(&p);
        }
    }

    pub(super) fn send_init(&mut self) {
        let init = match &self.stored_init {
            Some(init) => init.clone(),
            None => return,
        };
        // A packet containing an INIT chunk MUST have a zero Verification Tag.
        let header = PacketHeader {
            source_port: self.source_port,
            destination_port: self.destination_port,
            verification_tag: 0,
        };
        self.send_packet(&Packet::new(header, vec![Chunk::Init(init)]));
    }

    fn send_packet(&mut self, p: &Packet) {
        match p.marshal() {
            Ok(raw) => {
                log::trace!(
                    "[{}] sending packet: {} chunks, {} bytes",
                    self.name,
                    p.chunks.len(),
                    raw.len()
                );
                self.io.send_packet(raw);
            }
            Err(err) => log::warn!("[{}] failed to serialize packet: {}", self.name, err),
        }
    }
}
