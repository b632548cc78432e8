#[cfg(test)]
mod association_test;

mod association_internal;
pub(crate) mod association_stats;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Instant;

use association_stats::AssociationStats;
use bytes::Bytes;
use rand::Rng;

use crate::chunk::chunk_abort::ChunkAbort;
use crate::chunk::chunk_cookie_echo::ChunkCookieEcho;
use crate::chunk::chunk_init::ChunkInit;
use crate::chunk::Chunk;
use crate::config::Config;
use crate::congestion::CongestionControl;
use crate::error::{Error, Result};
use crate::error_cause::*;
use crate::param::Param;
use crate::queue::payload_queue::PayloadQueue;
use crate::queue::pending_queue::PendingQueue;
use crate::retransmission::RetransmissionTracker;
use crate::stream::{Message, Reliability, Stream};
use crate::timer::rto_manager::RtoManager;
use crate::timer::{Timer, TimerHandle, TimerService, TimerTable};

pub(crate) const DEFAULT_SCTP_PORT: u16 = 5000;

/// association state enums
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AssociationState {
    Closed,
    CookieWait,
    CookieEchoed,
    Established,
    ShutdownPending,
    ShutdownSent,
    ShutdownReceived,
    ShutdownAckSent,
}

impl fmt::Display for AssociationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            AssociationState::Closed => "Closed",
            AssociationState::CookieWait => "CookieWait",
            AssociationState::CookieEchoed => "CookieEchoed",
            AssociationState::Established => "Established",
            AssociationState::ShutdownPending => "ShutdownPending",
            AssociationState::ShutdownSent => "ShutdownSent",
            AssociationState::ShutdownReceived => "ShutdownReceived",
            AssociationState::ShutdownAckSent => "ShutdownAckSent",
        };
        write!(f, "{s}")
    }
}

/// ack mode (for testing)
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum AckMode {
    #[default]
    Normal,
    NoDelay,
    AlwaysDelay,
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            AckMode::Normal => "Normal",
            AckMode::NoDelay => "NoDelay",
            AckMode::AlwaysDelay => "AlwaysDelay",
        };
        write!(f, "{s}")
    }
}

/// ack transmission state
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub(crate) enum AckState {
    /// ack timer is off
    #[default]
    Idle,
    /// will send ack immediately
    Immediate,
    /// ack timer is on (ack is being delayed)
    Delay,
}

impl fmt::Display for AckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            AckState::Idle => "Idle",
            AckState::Immediate => "Immediate",
            AckState::Delay => "Delay",
        };
        write!(f, "{s}")
    }
}

/// Where an association writes its serialized packets.
pub trait PacketIo {
    fn send_packet(&mut self, packet: Bytes);
}

/// Upcalls from an association to its owner. Only `on_message_received` is
/// mandatory.
pub trait AssociationHandler {
    fn on_message_received(&mut self, stream_identifier: u16, message: Message);

    /// `reason` is set when the association went to `Closed` abnormally.
    fn on_state_changed(&mut self, _state: AssociationState, _reason: Option<Error>) {}

    /// A message left the association without being acknowledged: abandoned
    /// under partial reliability, or dropped on close.
    fn on_message_failed(&mut self, _stream_identifier: u16, _message: Message, _error: Error) {}

    /// Non-fatal problems, such as an ERROR chunk from the peer.
    fn on_error(&mut self, _error: Error) {}

    /// The peer started using a stream we had not opened.
    fn on_stream_opened(&mut self, _stream_identifier: u16) {}

    /// The bytes queued on a stream fell to its low threshold.
    fn on_buffered_amount_low(&mut self, _stream_identifier: u16) {}

    /// The bytes queued on all streams fell to the total low threshold.
    fn on_total_buffered_amount_low(&mut self) {}
}

#[derive(Debug)]
pub(crate) struct OutboundMessage {
    pub(crate) stream_identifier: u16,
    pub(crate) message: Message,
    pub(crate) unacked_fragments: usize,
}

/// One SCTP association, driven entirely by its owner.
///
/// The association does no I/O and keeps no clock of its own. Inbound
/// packets come in through [`Association::handle_packet`], expiries of the
/// timers it scheduled through [`Association::handle_timeout`], and every
/// outbound packet is written to the [`PacketIo`] before the call returns.
pub struct Association {
    name: String,
    config: Config,
    pub(crate) state: AssociationState,
    has_closed: bool,

    io: Box<dyn PacketIo + Send>,
    timers: Box<dyn TimerService + Send>,
    handler: Box<dyn AssociationHandler + Send>,
    pub(crate) timer_table: TimerTable,

    source_port: u16,
    destination_port: u16,
    pub(crate) my_verification_tag: u32,
    pub(crate) peer_verification_tag: u32,
    my_max_num_inbound_streams: u16,
    my_max_num_outbound_streams: u16,
    my_cookie: Option<Param>,
    stored_init: Option<ChunkInit>,
    stored_cookie_echo: Option<ChunkCookieEcho>,

    // receive side
    pub(crate) peer_last_tsn: u32,
    payload_queue: PayloadQueue,
    ack_state: AckState,
    delayed_ack_triggered: bool,
    immediate_ack_triggered: bool,

    // send side
    pending_queue: PendingQueue,
    control_queue: VecDeque<Chunk>,
    pub(crate) tracker: RetransmissionTracker,
    pub(crate) cc: CongestionControl,
    will_retransmit_fast: bool,
    will_send_forward_tsn: bool,
    will_send_shutdown: bool,
    will_send_shutdown_ack: bool,

    pub(crate) streams: HashMap<u16, Stream>,
    messages: HashMap<u64, OutboundMessage>,
    next_message_id: u64,

    heartbeat_info: Option<Bytes>,
    last_activity: Instant,
    stats: AssociationStats,
}

impl fmt::Debug for Association {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Association")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("my_verification_tag", &self.my_verification_tag)
            .field("peer_verification_tag", &self.peer_verification_tag)
            .field("peer_last_tsn", &self.peer_last_tsn)
            .field("cc", &self.cc)
            .field("stats", &self.stats)
            .finish()
    }
}

impl Association {
    /// Creates an association in the `Closed` state. Call
    /// [`Association::connect`] to start the handshake, or feed it an
    /// inbound INIT through [`Association::handle_packet`] to accept one.
    pub fn new(
        config: Config,
        io: Box<dyn PacketIo + Send>,
        timers: Box<dyn TimerService + Send>,
        handler: Box<dyn AssociationHandler + Send>,
    ) -> Self {
        let mut rng = rand::thread_rng();
        let my_verification_tag = rng.gen_range(1..=u32::MAX);
        let initial_tsn = rng.gen_range(1..=u32::MAX);

        let name = config.name().to_owned();
        let rto_mgr = RtoManager::new(
            config.rto_initial().as_millis() as u64,
            config.rto_min().as_millis() as u64,
            config.rto_max().as_millis() as u64,
        );
        let tracker = RetransmissionTracker::new(
            &name,
            initial_tsn,
            rto_mgr,
            config.fast_retransmit_threshold(),
        );
        let cc = CongestionControl::new(config.mtu() as u32, config.max_receive_buffer_size());
        let last_activity = timers.now();
        let pending_queue = PendingQueue::new(
            config.default_stream_priority(),
            config.total_buffered_amount_low_threshold(),
        );

        Association {
            my_max_num_inbound_streams: config.max_num_inbound_streams(),
            my_max_num_outbound_streams: config.max_num_outbound_streams(),
            name,
            config,
            state: AssociationState::Closed,
            has_closed: false,

            io,
            timers,
            handler,
            timer_table: TimerTable::new(),

            source_port: DEFAULT_SCTP_PORT,
            destination_port: DEFAULT_SCTP_PORT,
            my_verification_tag,
            peer_verification_tag: 0,
            my_cookie: None,
            stored_init: None,
            stored_cookie_echo: None,

            peer_last_tsn: 0,
            payload_queue: PayloadQueue::new(),
            ack_state: AckState::Idle,
            delayed_ack_triggered: false,
            immediate_ack_triggered: false,

            pending_queue,
            control_queue: VecDeque::new(),
            tracker,
            cc,
            will_retransmit_fast: false,
            will_send_forward_tsn: false,
            will_send_shutdown: false,
            will_send_shutdown_ack: false,

            streams: HashMap::new(),
            messages: HashMap::new(),
            next_message_id: 0,

            heartbeat_info: None,
            last_activity,
            stats: AssociationStats::default(),
        }
    }

    /// Starts the four-way handshake by sending INIT.
    pub fn connect(&mut self) -> Result<()> {
        if self.has_closed {
            return Err(Error::ErrAssociationClosed);
        }
        if self.state != AssociationState::Closed {
            return Err(Error::ErrConnectNonClosed);
        }

        let mut params = vec![];
        if self.config.forward_tsn_supported() {
            params.push(Param::ForwardTsnSupported);
        }
        self.stored_init = Some(ChunkInit {
            is_ack: false,
            initiate_tag: self.my_verification_tag,
            advertised_receiver_window_credit: self.config.max_receive_buffer_size(),
            num_outbound_streams: self.config.max_num_outbound_streams(),
            num_inbound_streams: self.config.max_num_inbound_streams(),
            initial_tsn: self.tracker.my_next_tsn,
            params,
        });

        self.send_init();
        let rto = self.rto();
        self.timer_table
            .start(Timer::T1Init, self.timers.as_mut(), rto);
        self.set_state(AssociationState::CookieWait);
        Ok(())
    }

    /// Opens an outbound stream with its default ordering and reliability.
    /// Streams the peer starts using are opened implicitly as ordered and
    /// reliable.
    pub fn open_stream(
        &mut self,
        stream_identifier: u16,
        ordered: bool,
        reliability: Reliability,
    ) -> Result<()> {
        if self.has_closed {
            return Err(Error::ErrAssociationClosed);
        }
        if stream_identifier >= self.my_max_num_outbound_streams {
            return Err(Error::ErrStreamIdOutOfRange(stream_identifier));
        }
        if self.streams.contains_key(&stream_identifier) {
            return Err(Error::ErrStreamAlreadyExist(stream_identifier));
        }

        log::debug!(
            "[{}] opening stream {} (ordered={} {})",
            self.name,
            stream_identifier,
            ordered,
            reliability
        );
        self.streams.insert(
            stream_identifier,
            Stream::new(stream_identifier, ordered, reliability),
        );
        Ok(())
    }

    /// Queues `message` on a stream using the stream's default reliability.
    /// Sending on a stream that was never opened opens it as ordered and
    /// reliable.
    pub fn send(&mut self, stream_identifier: u16, message: Message) -> Result<()> {
        let reliability = self
            .streams
            .get(&stream_identifier)
            .map(|s| s.reliability)
            .unwrap_or_default();
        self.send_with_reliability(stream_identifier, message, reliability)
    }

    /// Queues `message` with a reliability overriding the stream default.
    pub fn send_with_reliability(
        &mut self,
        stream_identifier: u16,
        message: Message,
        reliability: Reliability,
    ) -> Result<()> {
        match self.state {
            _ if self.has_closed => return Err(Error::ErrAssociationClosed),
            AssociationState::ShutdownPending
            | AssociationState::ShutdownSent
            | AssociationState::ShutdownReceived
            | AssociationState::ShutdownAckSent => {
                return Err(Error::ErrAssociationShuttingDown)
            }
            _ => {}
        }
        if message.is_empty() {
            return Err(Error::ErrEmptyMessage);
        }
        if message.len() > self.config.max_message_size() as usize {
            return Err(Error::ErrOutboundPacketTooLarge);
        }
        if stream_identifier >= self.my_max_num_outbound_streams {
            return Err(Error::ErrStreamIdOutOfRange(stream_identifier));
        }

        let message_id = self.next_message_id;
        self.next_message_id += 1;

        let max_payload_size = self.config.max_payload_size();
        let now = self.timers.now();
        let stream = self
            .streams
            .entry(stream_identifier)
            .or_insert_with(|| Stream::new(stream_identifier, true, Reliability::Reliable));
        let mut chunks = stream.packetize(&message, reliability, max_payload_size, message_id);

        // the lifetime of a timed message runs from now, sent or not
        let expires_at = chunks.first().and_then(|c| c.reliability.expires_at(now));
        for c in chunks.iter_mut() {
            c.expires_at = expires_at;
        }

        log::trace!(
            "[{}] queued message {} on stream {}: {} bytes in {} chunks",
            self.name,
            message_id,
            stream_identifier,
            message.len(),
            chunks.len()
        );
        self.messages.insert(
            message_id,
            OutboundMessage {
                stream_identifier,
                message,
                unacked_fragments: chunks.len(),
            },
        );
        self.pending_queue.append(chunks);

        self.flush();
        Ok(())
    }

    /// Starts a graceful shutdown. Queued data is still delivered before
    /// SHUTDOWN goes out.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.has_closed {
            return Err(Error::ErrAssociationClosed);
        }
        match self.state {
            AssociationState::Established => {}
            AssociationState::ShutdownPending
            | AssociationState::ShutdownSent
            | AssociationState::ShutdownReceived
            | AssociationState::ShutdownAckSent => return Ok(()),
            _ => return Err(Error::ErrShutdownNonEstablished),
        }

        log::debug!("[{}] shutdown requested", self.name);
        self.set_state(AssociationState::ShutdownPending);
        self.flush();
        Ok(())
    }

    /// Tears the association down at once. Every message not yet
    /// acknowledged is reported failed.
    pub fn abort(&mut self, reason: &str) -> Result<()> {
        if self.has_closed {
            return Err(Error::ErrAssociationClosed);
        }

        if self.state != AssociationState::Closed {
            let abort = ChunkAbort {
                error_causes: vec![ErrorCause::new(
                    USER_INITIATED_ABORT,
                    Bytes::from(reason.to_owned()),
                )],
            };
            self.send_chunks(VecDeque::from([Chunk::Abort(abort)]));
        }
        self.close(Some(Error::ErrAbortSent(reason.to_owned())));
        Ok(())
    }

    pub fn state(&self) -> AssociationState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.has_closed
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> AssociationStats {
        self.stats
    }

    /// Bytes of user data queued or in flight.
    pub fn buffered_amount(&self) -> usize {
        self.pending_queue.get_num_bytes() + self.tracker.outstanding_bytes()
    }

    /// Bytes queued on one stream and not sent yet. This is the amount the
    /// stream's low threshold watches.
    pub fn stream_buffered_amount(&self, stream_identifier: u16) -> usize {
        self.pending_queue.buffered_amount(stream_identifier)
    }

    /// Sets the weight a stream gets when sharing the link with other
    /// streams. Twice the priority means twice the bytes while both have
    /// data queued. Takes effect from the stream's next message.
    pub fn set_stream_priority(&mut self, stream_identifier: u16, priority: u16) -> Result<()> {
        if self.has_closed {
            return Err(Error::ErrAssociationClosed);
        }
        if stream_identifier >= self.my_max_num_outbound_streams {
            return Err(Error::ErrStreamIdOutOfRange(stream_identifier));
        }
        log::debug!(
            "[{}] stream {} priority set to {}",
            self.name,
            stream_identifier,
            priority
        );
        self.pending_queue.set_priority(stream_identifier, priority);
        Ok(())
    }

    pub fn stream_priority(&self, stream_identifier: u16) -> u16 {
        self.pending_queue.priority(stream_identifier)
    }

    /// Sets the queued byte count at or below which
    /// [`AssociationHandler::on_buffered_amount_low`] fires for a stream.
    pub fn set_buffered_amount_low_threshold(
        &mut self,
        stream_identifier: u16,
        threshold: usize,
    ) -> Result<()> {
        if self.has_closed {
            return Err(Error::ErrAssociationClosed);
        }
        if stream_identifier >= self.my_max_num_outbound_streams {
            return Err(Error::ErrStreamIdOutOfRange(stream_identifier));
        }
        self.pending_queue
            .set_low_threshold(stream_identifier, threshold);
        self.report_buffered_amount_low();
        Ok(())
    }

    pub fn buffered_amount_low_threshold(&self, stream_identifier: u16) -> usize {
        self.pending_queue.low_threshold(stream_identifier)
    }

    /// Sets the threshold for [`AssociationHandler::on_total_buffered_amount_low`].
    pub fn set_total_buffered_amount_low_threshold(&mut self, threshold: usize) -> Result<()> {
        if self.has_closed {
            return Err(Error::ErrAssociationClosed);
        }
        self.pending_queue.set_total_low_threshold(threshold);
        self.report_buffered_amount_low();
        Ok(())
    }

    /// Time of the last packet received from the peer.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Processes one inbound packet.
    pub fn handle_packet(&mut self, raw: &Bytes) {
        if self.has_closed {
            log::trace!("[{}] packet dropped: association closed", self.name);
            return;
        }
        self.handle_inbound(raw);
        self.flush();
    }

    /// Processes the expiry of a timer previously scheduled on the
    /// [`TimerService`]. Stale handles are ignored.
    pub fn handle_timeout(&mut self, handle: TimerHandle) {
        if self.has_closed {
            return;
        }
        let timer = match self.timer_table.expire(handle) {
            Some(timer) => timer,
            None => {
                log::trace!("[{}] stale timer {} ignored", self.name, handle.id());
                return;
            }
        };
        self.on_timeout(timer);
        self.flush();
    }

    fn set_state(&mut self, new_state: AssociationState) {
        if self.state != new_state {
            log::debug!(
                "[{}] state change: '{}' => '{}'",
                self.name,
                self.state,
                new_state
            );
            self.state = new_state;
            self.handler.on_state_changed(new_state, None);
        }
    }

    /// Moves to `Closed` for good and fails every message still owned by
    /// the association.
    fn close(&mut self, reason: Option<Error>) {
        if self.has_closed {
            return;
        }

        match &reason {
            Some(err) => log::debug!("[{}] closing association: {}", self.name, err),
            None => log::debug!("[{}] association closed", self.name),
        }

        self.timer_table.stop_all(self.timers.as_mut());
        self.pending_queue.drain();
        self.tracker.drain(&mut self.cc);
        self.control_queue.clear();
        self.streams.clear();

        let error = reason.clone().unwrap_or(Error::ErrAssociationClosed);
        let mut failed: Vec<(u64, OutboundMessage)> = self.messages.drain().collect();
        failed.sort_by_key(|(id, _)| *id);
        for (_, m) in failed {
            self.handler
                .on_message_failed(m.stream_identifier, m.message, error.clone());
        }

        self.has_closed = true;
        self.state = AssociationState::Closed;
        self.handler
            .on_state_changed(AssociationState::Closed, reason);
    }

    fn rto(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.tracker.get_rto())
    }
}
