use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::*;
use crate::chunk::chunk_forward_tsn::ChunkForwardTsn;
use crate::chunk::chunk_header::ChunkHeader;
use crate::chunk::chunk_heartbeat::ChunkHeartbeat;
use crate::chunk::chunk_payload_data::{ChunkPayloadData, PayloadProtocolIdentifier};
use crate::chunk::chunk_selective_ack::ChunkSelectiveAck;
use crate::chunk::chunk_type::ChunkType;
use crate::chunk::chunk_unknown::ChunkUnknown;
use crate::packet::{Packet, PacketHeader};

type Wire = Arc<Mutex<VecDeque<Bytes>>>;

struct WireIo(Wire);

impl PacketIo for WireIo {
    fn send_packet(&mut self, packet: Bytes) {
        self.0.lock().unwrap().push_back(packet);
    }
}

#[derive(Debug, Copy, Clone)]
struct Scheduled {
    handle: TimerHandle,
    deadline: Instant,
}

struct ClockState {
    now: Instant,
    next_id: u64,
    scheduled: Vec<Scheduled>,
    history: Vec<Duration>,
}

/// A clock that only moves when told to.
#[derive(Clone)]
struct ManualClock(Arc<Mutex<ClockState>>);

impl ManualClock {
    fn new() -> Self {
        ManualClock(Arc::new(Mutex::new(ClockState {
            now: Instant::now(),
            next_id: 0,
            scheduled: vec![],
            history: vec![],
        })))
    }

    /// Moves to the earliest pending expiry and hands out its handle.
    fn advance_to_next(&self) -> Option<TimerHandle> {
        let mut state = self.0.lock().unwrap();
        let (i, next) = state
            .scheduled
            .iter()
            .copied()
            .enumerate()
            .min_by_key(|(_, s)| s.deadline)?;
        state.scheduled.remove(i);
        if next.deadline > state.now {
            state.now = next.deadline;
        }
        Some(next.handle)
    }

    fn advance(&self, d: Duration) {
        self.0.lock().unwrap().now += d;
    }

    fn pending(&self) -> usize {
        self.0.lock().unwrap().scheduled.len()
    }

    fn history(&self) -> Vec<Duration> {
        self.0.lock().unwrap().history.clone()
    }
}

impl TimerService for ManualClock {
    fn now(&self) -> Instant {
        self.0.lock().unwrap().now
    }

    fn schedule_after(&mut self, delay: Duration) -> TimerHandle {
        let mut state = self.0.lock().unwrap();
        state.next_id += 1;
        let handle = TimerHandle::new(state.next_id);
        let deadline = state.now + delay;
        state.scheduled.push(Scheduled { handle, deadline });
        state.history.push(delay);
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.0
            .lock()
            .unwrap()
            .scheduled
            .retain(|s| s.handle != handle);
    }
}

#[derive(Default)]
struct Events {
    received: Vec<(u16, Message)>,
    states: Vec<(AssociationState, Option<Error>)>,
    failed: Vec<(u16, Message, Error)>,
    errors: Vec<Error>,
    opened: Vec<u16>,
    buffered_low: Vec<u16>,
    total_buffered_low: usize,
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Events>>);

impl AssociationHandler for Recorder {
    fn on_message_received(&mut self, stream_identifier: u16, message: Message) {
        self.0
            .lock()
            .unwrap()
            .received
            .push((stream_identifier, message));
    }

    fn on_state_changed(&mut self, state: AssociationState, reason: Option<Error>) {
        self.0.lock().unwrap().states.push((state, reason));
    }

    fn on_message_failed(&mut self, stream_identifier: u16, message: Message, error: Error) {
        self.0
            .lock()
            .unwrap()
            .failed
            .push((stream_identifier, message, error));
    }

    fn on_error(&mut self, error: Error) {
        self.0.lock().unwrap().errors.push(error);
    }

    fn on_stream_opened(&mut self, stream_identifier: u16) {
        self.0.lock().unwrap().opened.push(stream_identifier);
    }

    fn on_buffered_amount_low(&mut self, stream_identifier: u16) {
        self.0.lock().unwrap().buffered_low.push(stream_identifier);
    }

    fn on_total_buffered_amount_low(&mut self) {
        self.0.lock().unwrap().total_buffered_low += 1;
    }
}

struct Peer {
    assoc: Association,
    wire: Wire,
    clock: ManualClock,
    events: Recorder,
}

impl Peer {
    fn new(config: Config) -> Self {
        let wire = Wire::default();
        let clock = ManualClock::new();
        let events = Recorder::default();
        let assoc = Association::new(
            config,
            Box::new(WireIo(wire.clone())),
            Box::new(clock.clone()),
            Box::new(events.clone()),
        );
        Peer {
            assoc,
            wire,
            clock,
            events,
        }
    }

    fn take_packets(&self) -> Vec<Bytes> {
        self.wire.lock().unwrap().drain(..).collect()
    }

    fn take_chunks(&self) -> Vec<Chunk> {
        self.take_packets()
            .iter()
            .flat_map(|raw| Packet::unmarshal(raw).unwrap().chunks)
            .collect()
    }

    /// Chunks sent so far, left on the wire for delivery.
    fn peek_chunks(&self) -> Vec<Chunk> {
        self.wire
            .lock()
            .unwrap()
            .iter()
            .flat_map(|raw| Packet::unmarshal(raw).unwrap().chunks)
            .collect()
    }

    fn fire_next_timer(&mut self) -> bool {
        match self.clock.advance_to_next() {
            Some(handle) => {
                self.assoc.handle_timeout(handle);
                true
            }
            None => false,
        }
    }

    fn states(&self) -> Vec<AssociationState> {
        self.events
            .0
            .lock()
            .unwrap()
            .states
            .iter()
            .map(|(s, _)| *s)
            .collect()
    }

    fn close_reason(&self) -> Option<Error> {
        let events = self.events.0.lock().unwrap();
        match events.states.last() {
            Some((AssociationState::Closed, reason)) => reason.clone(),
            other => panic!("not closed: {other:?}"),
        }
    }

    fn received(&self) -> Vec<(u16, Message)> {
        self.events.0.lock().unwrap().received.clone()
    }

    fn failed(&self) -> Vec<(u16, Message, Error)> {
        self.events.0.lock().unwrap().failed.clone()
    }

    fn errors(&self) -> Vec<Error> {
        self.events.0.lock().unwrap().errors.clone()
    }

    /// Packet to this peer carrying its own verification tag.
    fn packet_to(&self, chunks: Vec<Chunk>) -> Bytes {
        Packet::new(
            PacketHeader {
                source_port: DEFAULT_SCTP_PORT,
                destination_port: DEFAULT_SCTP_PORT,
                verification_tag: self.assoc.my_verification_tag,
            },
            chunks,
        )
        .marshal()
        .unwrap()
    }
}

/// Delivers packets both ways until neither side has anything to send.
fn flush_buffers(a: &mut Peer, b: &mut Peer) {
    loop {
        let from_a = a.take_packets();
        let from_b = b.take_packets();
        if from_a.is_empty() && from_b.is_empty() {
            break;
        }
        for p in &from_a {
            b.assoc.handle_packet(p);
        }
        for p in &from_b {
            a.assoc.handle_packet(p);
        }
    }
}

fn test_config(name: &str) -> Config {
    Config::default()
        .with_name(name)
        .with_ack_mode(AckMode::NoDelay)
        .with_heartbeat_interval(None)
}

fn establish_session_pair(client_config: Config, server_config: Config) -> (Peer, Peer) {
    let mut client = Peer::new(client_config);
    let mut server = Peer::new(server_config);

    client.assoc.connect().unwrap();
    flush_buffers(&mut client, &mut server);

    assert_eq!(client.assoc.state(), AssociationState::Established);
    assert_eq!(server.assoc.state(), AssociationState::Established);
    (client, server)
}

fn numbered(i: u32, len: usize) -> Message {
    let mut data = vec![0u8; len];
    data[0..4].copy_from_slice(&i.to_be_bytes());
    Message::binary(data)
}

fn number_of(m: &Message) -> u32 {
    u32::from_be_bytes([m.data[0], m.data[1], m.data[2], m.data[3]])
}

#[test]
fn test_assoc_handshake() {
    let (client, server) = establish_session_pair(test_config("client"), test_config("server"));

    assert_eq!(
        client.states(),
        vec![
            AssociationState::CookieWait,
            AssociationState::CookieEchoed,
            AssociationState::Established
        ]
    );
    assert_eq!(server.states(), vec![AssociationState::Established]);
    assert_eq!(
        client.assoc.peer_verification_tag,
        server.assoc.my_verification_tag
    );
    assert_eq!(
        server.assoc.peer_verification_tag,
        client.assoc.my_verification_tag
    );
    assert!(client.assoc.tracker.use_forward_tsn);
    assert_eq!(client.clock.pending(), 0, "no timer left running");
    assert_eq!(server.clock.pending(), 0, "no timer left running");
}

#[test]
fn test_assoc_handshake_without_forward_tsn() {
    let (client, server) = establish_session_pair(
        test_config("client"),
        test_config("server").with_forward_tsn_supported(false),
    );
    assert!(!client.assoc.tracker.use_forward_tsn);
    assert!(!server.assoc.tracker.use_forward_tsn);
}

#[test]
fn test_assoc_reliable_simple() -> Result<()> {
    let (mut client, mut server) =
        establish_session_pair(test_config("client"), test_config("server"));

    client.assoc.send(0, Message::string("hello"))?;
    assert_eq!(client.assoc.buffered_amount(), 5);
    flush_buffers(&mut client, &mut server);

    assert_eq!(server.received(), vec![(0, Message::string("hello"))]);
    assert_eq!(server.events.0.lock().unwrap().opened, vec![0]);
    assert_eq!(client.assoc.buffered_amount(), 0, "everything acked");
    assert!(!client.assoc.timer_table.is_running(Timer::T3Rtx));
    assert_eq!(client.assoc.stats().get_num_datas_sent(), 1);
    assert_eq!(server.assoc.stats().get_num_datas_received(), 1);
    assert_eq!(client.assoc.stats().get_num_sacks_received(), 1);

    Ok(())
}

#[test]
fn test_assoc_reliable_ordered_reordered() -> Result<()> {
    let (mut client, mut server) =
        establish_session_pair(test_config("client"), test_config("server"));

    client.assoc.open_stream(2, true, Reliability::Reliable)?;
    let mut packets = vec![];
    for i in 0..3 {
        client.assoc.send(2, numbered(i, 1000))?;
        packets.extend(client.take_packets());
    }
    assert_eq!(packets.len(), 3, "one DATA per packet");

    server.assoc.handle_packet(&packets[2]);
    server.assoc.handle_packet(&packets[1]);
    assert!(server.received().is_empty(), "held back behind ssn 0");

    server.assoc.handle_packet(&packets[0]);
    let received: Vec<u32> = server.received().iter().map(|(_, m)| number_of(m)).collect();
    assert_eq!(received, vec![0, 1, 2]);

    flush_buffers(&mut client, &mut server);
    assert_eq!(client.assoc.buffered_amount(), 0);

    Ok(())
}

#[test]
fn test_assoc_reliable_unordered_reordered() -> Result<()> {
    let (mut client, mut server) =
        establish_session_pair(test_config("client"), test_config("server"));

    client.assoc.open_stream(1, false, Reliability::Reliable)?;
    let mut packets = vec![];
    for i in 0..2 {
        client.assoc.send(1, numbered(i, 1000))?;
        packets.extend(client.take_packets());
    }

    server.assoc.handle_packet(&packets[1]);
    server.assoc.handle_packet(&packets[0]);
    let received: Vec<u32> = server.received().iter().map(|(_, m)| number_of(m)).collect();
    assert_eq!(received, vec![1, 0], "delivered as they complete");

    flush_buffers(&mut client, &mut server);
    Ok(())
}

#[test]
fn test_assoc_reliable_fragmented_then_defragmented() -> Result<()> {
    let (mut client, mut server) =
        establish_session_pair(test_config("client"), test_config("server"));

    let data: Vec<u8> = (0..3000).map(|i| (i & 0xff) as u8).collect();
    client.assoc.send(0, Message::binary(data.clone()))?;
    flush_buffers(&mut client, &mut server);

    assert_eq!(client.assoc.stats().get_num_datas_sent(), 3);
    let received = server.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].1.data, Bytes::from(data));
    assert_eq!(received[0].1.ppi, PayloadProtocolIdentifier::Binary);

    Ok(())
}

#[test]
fn test_assoc_handshake_timeout() {
    let mut client = Peer::new(test_config("client"));
    client.assoc.connect().unwrap();

    let mut inits = client.take_packets().len();
    while client.fire_next_timer() {
        inits += client.take_packets().len();
    }

    assert_eq!(inits, 6, "first INIT plus five retransmissions");
    assert_eq!(
        client.clock.history(),
        [3000, 6000, 12000, 24000, 48000, 60000]
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect::<Vec<_>>()
    );
    assert_eq!(client.close_reason(), Some(Error::ErrHandshakeTimeout));
    assert_eq!(client.clock.pending(), 0);

    client.assoc.handle_timeout(TimerHandle::new(1));
    assert!(client.take_packets().is_empty(), "nothing sent after close");
    assert_eq!(
        client.assoc.send(0, Message::string("late")),
        Err(Error::ErrAssociationClosed)
    );
    assert_eq!(client.assoc.connect(), Err(Error::ErrAssociationClosed));
}

#[test]
fn test_assoc_cookie_echo_retransmitted() {
    let mut client = Peer::new(test_config("client"));
    let mut server = Peer::new(test_config("server"));

    client.assoc.connect().unwrap();
    for p in client.take_packets() {
        server.assoc.handle_packet(&p);
    }
    for p in server.take_packets() {
        client.assoc.handle_packet(&p);
    }
    assert_eq!(client.assoc.state(), AssociationState::CookieEchoed);

    // the first COOKIE ECHO is lost
    assert_eq!(client.take_packets().len(), 1);
    assert!(client.fire_next_timer());
    assert!(matches!(
        client.peek_chunks().as_slice(),
        [Chunk::CookieEcho(_)]
    ));

    flush_buffers(&mut client, &mut server);
    assert_eq!(client.assoc.state(), AssociationState::Established);
    assert_eq!(server.assoc.state(), AssociationState::Established);
}

#[test]
fn test_assoc_abort_during_handshake() -> Result<()> {
    let mut client = Peer::new(test_config("client"));
    client.assoc.connect()?;
    client.assoc.send(0, Message::string("one"))?;
    client.assoc.send(0, Message::string("two"))?;
    assert_eq!(client.take_packets().len(), 1, "only the INIT went out");

    let abort = client.packet_to(vec![Chunk::Abort(ChunkAbort {
        error_causes: vec![ErrorCause::new(
            USER_INITIATED_ABORT,
            Bytes::from_static(b"bye"),
        )],
    })]);
    client.assoc.handle_packet(&abort);

    let expected = Error::ErrAbortReceived("User Initiated Abort: bye".to_owned());
    assert_eq!(client.assoc.state(), AssociationState::Closed);
    assert_eq!(client.close_reason(), Some(expected.clone()));
    assert_eq!(
        client.failed(),
        vec![
            (0, Message::string("one"), expected.clone()),
            (0, Message::string("two"), expected),
        ]
    );
    assert_eq!(client.clock.pending(), 0);
    assert!(client.take_packets().is_empty());

    Ok(())
}

#[test]
fn test_assoc_abort() -> Result<()> {
    let (mut client, mut server) =
        establish_session_pair(test_config("client"), test_config("server"));

    client.assoc.send(0, Message::string("lost"))?;
    client.take_packets();
    client.assoc.abort("done")?;
    flush_buffers(&mut client, &mut server);

    assert_eq!(
        client.close_reason(),
        Some(Error::ErrAbortSent("done".to_owned()))
    );
    assert_eq!(
        client.failed(),
        vec![(
            0,
            Message::string("lost"),
            Error::ErrAbortSent("done".to_owned())
        )]
    );
    assert_eq!(
        server.close_reason(),
        Some(Error::ErrAbortReceived(
            "User Initiated Abort: done".to_owned()
        ))
    );

    assert_eq!(client.assoc.abort("again"), Err(Error::ErrAssociationClosed));
    assert_eq!(
        client.assoc.open_stream(3, true, Reliability::Reliable),
        Err(Error::ErrAssociationClosed)
    );
    assert_eq!(client.assoc.shutdown(), Err(Error::ErrAssociationClosed));

    Ok(())
}

#[test]
fn test_assoc_shutdown() -> Result<()> {
    let (mut client, mut server) =
        establish_session_pair(test_config("client"), test_config("server"));

    client.assoc.send(0, Message::string("bye"))?;
    flush_buffers(&mut client, &mut server);

    client.assoc.shutdown()?;
    assert_eq!(
        client.assoc.send(0, Message::string("too late")),
        Err(Error::ErrAssociationShuttingDown)
    );
    flush_buffers(&mut client, &mut server);

    assert_eq!(
        client.states()[3..],
        [
            AssociationState::ShutdownPending,
            AssociationState::ShutdownSent,
            AssociationState::Closed
        ]
    );
    assert_eq!(
        server.states()[1..],
        [
            AssociationState::ShutdownReceived,
            AssociationState::ShutdownAckSent,
            AssociationState::Closed
        ]
    );
    assert_eq!(client.close_reason(), None);
    assert_eq!(server.close_reason(), None);
    assert!(client.failed().is_empty());
    assert_eq!(client.clock.pending(), 0);
    assert_eq!(server.clock.pending(), 0);

    Ok(())
}

#[test]
fn test_assoc_shutdown_waits_for_outstanding_data() -> Result<()> {
    let (mut client, mut server) =
        establish_session_pair(test_config("client"), test_config("server"));

    client.assoc.send(0, Message::string("must arrive"))?;
    client.take_packets();

    client.assoc.shutdown()?;
    assert_eq!(client.assoc.state(), AssociationState::ShutdownPending);
    assert!(client.take_packets().is_empty(), "SHUTDOWN held back");

    assert!(client.fire_next_timer(), "T3-rtx");
    flush_buffers(&mut client, &mut server);

    assert_eq!(server.received(), vec![(0, Message::string("must arrive"))]);
    assert_eq!(client.close_reason(), None);
    assert_eq!(server.close_reason(), None);

    Ok(())
}

#[test]
fn test_assoc_shutdown_before_established() {
    let mut client = Peer::new(test_config("client"));
    client.assoc.connect().unwrap();
    assert_eq!(
        client.assoc.shutdown(),
        Err(Error::ErrShutdownNonEstablished)
    );
}

#[test]
fn test_assoc_reliable_retransmission() -> Result<()> {
    let (mut client, mut server) =
        establish_session_pair(test_config("client"), test_config("server"));

    client.assoc.send(0, Message::string("again"))?;
    client.take_packets();

    assert!(client.fire_next_timer());
    assert_eq!(client.assoc.cc.cwnd, client.assoc.cc.mtu, "window collapsed");
    flush_buffers(&mut client, &mut server);

    assert_eq!(server.received(), vec![(0, Message::string("again"))]);
    assert_eq!(client.assoc.stats().get_num_t3timeouts(), 1);
    assert_eq!(client.assoc.buffered_amount(), 0);

    Ok(())
}

#[test]
fn test_assoc_too_many_retransmissions() -> Result<()> {
    let (mut client, _server) = establish_session_pair(
        test_config("client").with_max_data_retransmits(2),
        test_config("server"),
    );

    client.assoc.send(0, Message::string("void"))?;
    client.take_packets();

    for _ in 0..2 {
        assert!(client.fire_next_timer());
        assert_eq!(client.take_packets().len(), 1, "retransmitted");
    }
    assert!(client.fire_next_timer());
    assert!(client.take_packets().is_empty());

    assert_eq!(
        client.close_reason(),
        Some(Error::ErrTooManyRetransmissions)
    );
    assert_eq!(
        client.failed(),
        vec![(
            0,
            Message::string("void"),
            Error::ErrTooManyRetransmissions
        )]
    );

    Ok(())
}

#[test]
fn test_assoc_delayed_ack() -> Result<()> {
    let config = |name| test_config(name).with_ack_mode(AckMode::Normal);
    let (mut client, mut server) = establish_session_pair(config("client"), config("server"));

    client.assoc.send(0, Message::string("ack me later"))?;
    for p in client.take_packets() {
        server.assoc.handle_packet(&p);
    }
    assert!(server.take_packets().is_empty(), "SACK delayed");
    assert_eq!(server.received().len(), 1);

    let before = server.clock.now();
    assert!(server.fire_next_timer());
    assert_eq!(
        server.clock.now() - before,
        Duration::from_millis(200),
        "delayed ack timeout"
    );
    flush_buffers(&mut client, &mut server);

    assert_eq!(client.assoc.buffered_amount(), 0);
    assert_eq!(server.assoc.stats().get_num_ack_timeouts(), 1);
    assert_eq!(server.assoc.stats().get_num_sacks_sent(), 1);

    Ok(())
}

#[test]
fn test_assoc_ack_every_second_packet() -> Result<()> {
    let config = |name| test_config(name).with_ack_mode(AckMode::Normal);
    let (mut client, mut server) = establish_session_pair(config("client"), config("server"));

    let mut packets = vec![];
    for i in 0..2 {
        client.assoc.send(0, numbered(i, 1000))?;
        packets.extend(client.take_packets());
    }

    server.assoc.handle_packet(&packets[0]);
    assert!(server.take_packets().is_empty());
    server.assoc.handle_packet(&packets[1]);

    let chunks = server.take_chunks();
    assert!(matches!(chunks.as_slice(), [Chunk::SelectiveAck(_)]));
    assert!(
        !server.assoc.timer_table.is_running(Timer::Ack),
        "ack timer cancelled"
    );

    Ok(())
}

#[test]
fn test_assoc_ack_immediately_on_gap() -> Result<()> {
    let config = |name| test_config(name).with_ack_mode(AckMode::Normal);
    let (mut client, mut server) = establish_session_pair(config("client"), config("server"));

    let mut packets = vec![];
    for i in 0..2 {
        client.assoc.send(0, numbered(i, 1000))?;
        packets.extend(client.take_packets());
    }

    server.assoc.handle_packet(&packets[1]);
    match server.take_chunks().as_slice() {
        [Chunk::SelectiveAck(sack)] => {
            assert_eq!(sack.gap_ack_blocks.len(), 1);
            assert_eq!(sack.gap_ack_blocks[0].start, 2);
            assert_eq!(sack.gap_ack_blocks[0].end, 2);
        }
        other => panic!("expected a SACK, got {other:?}"),
    }

    // a duplicate is acked at once as well
    server.assoc.handle_packet(&packets[1]);
    match server.take_chunks().as_slice() {
        [Chunk::SelectiveAck(sack)] => assert_eq!(sack.duplicate_tsn.len(), 1),
        other => panic!("expected a SACK, got {other:?}"),
    }

    Ok(())
}

#[test]
fn test_assoc_congestion_control_fast_retransmission() -> Result<()> {
    let (mut client, mut server) =
        establish_session_pair(test_config("client"), test_config("server"));

    let mut packets = vec![];
    for i in 0..4 {
        client.assoc.send(0, numbered(i, 1000))?;
        packets.extend(client.take_packets());
    }
    assert_eq!(packets.len(), 4);

    // the first packet is lost
    for p in &packets[1..] {
        server.assoc.handle_packet(p);
    }
    for p in server.take_packets() {
        client.assoc.handle_packet(&p);
    }

    assert_eq!(client.assoc.stats().get_num_fast_retrans(), 1);
    assert!(client.assoc.cc.in_fast_recovery);
    assert_eq!(client.assoc.stats().get_num_t3timeouts(), 0);

    flush_buffers(&mut client, &mut server);
    let received: Vec<u32> = server.received().iter().map(|(_, m)| number_of(m)).collect();
    assert_eq!(received, vec![0, 1, 2, 3]);
    assert_eq!(client.assoc.buffered_amount(), 0);

    Ok(())
}

#[test]
fn test_assoc_fast_retransmit_sends_one_packet() -> Result<()> {
    let (mut client, mut server) =
        establish_session_pair(test_config("client"), test_config("server"));

    let mut packets = vec![];
    for i in 0..6 {
        client.assoc.send(0, numbered(i, 700))?;
        packets.extend(client.take_packets());
    }
    assert_eq!(packets.len(), 6);

    // the first two are lost
    for p in &packets[2..] {
        server.assoc.handle_packet(p);
    }
    let sacks = server.take_packets();
    assert_eq!(sacks.len(), 4);
    for p in &sacks[..3] {
        client.assoc.handle_packet(p);
    }

    let resent: Vec<u32> = client
        .peek_chunks()
        .iter()
        .filter_map(|c| match c {
            Chunk::PayloadData(d) => Some(u32::from_be_bytes([
                d.user_data[0],
                d.user_data[1],
                d.user_data[2],
                d.user_data[3],
            ])),
            _ => None,
        })
        .collect();
    assert_eq!(resent, vec![0], "both are marked but only one fits the packet");

    client.assoc.handle_packet(&sacks[3]);
    flush_buffers(&mut client, &mut server);
    assert_eq!(server.received().len(), 1);

    // the leftover goes out on T3-rtx
    assert!(client.fire_next_timer());
    flush_buffers(&mut client, &mut server);
    let received: Vec<u32> = server.received().iter().map(|(_, m)| number_of(m)).collect();
    assert_eq!(received, (0..6).collect::<Vec<u32>>());
    assert_eq!(client.assoc.stats().get_num_fast_retrans(), 1);
    assert_eq!(client.assoc.stats().get_num_t3timeouts(), 1);

    Ok(())
}

#[test]
fn test_assoc_congestion_window_gates_sending() -> Result<()> {
    let (mut client, mut server) =
        establish_session_pair(test_config("client"), test_config("server"));

    for i in 0..8 {
        client.assoc.send(0, numbered(i, 1000))?;
    }
    let packets = client.take_packets();
    assert_eq!(
        packets.len(),
        4,
        "initial cwnd of 4380 bytes allows four chunks"
    );
    assert_eq!(client.assoc.buffered_amount(), 8000);
    assert_eq!(client.assoc.stream_buffered_amount(0), 4000);

    for p in &packets {
        server.assoc.handle_packet(p);
    }
    flush_buffers(&mut client, &mut server);
    let received: Vec<u32> = server.received().iter().map(|(_, m)| number_of(m)).collect();
    assert_eq!(received, (0..8).collect::<Vec<u32>>());
    assert_eq!(client.assoc.buffered_amount(), 0);

    Ok(())
}

#[test]
fn test_assoc_unreliable_rexmit_abandoned() -> Result<()> {
    let (mut client, mut server) =
        establish_session_pair(test_config("client"), test_config("server"));

    client.assoc.open_stream(1, false, Reliability::Rexmit(0))?;
    client.assoc.send(1, Message::string("lost"))?;
    client.take_packets();

    assert!(client.fire_next_timer());
    assert_eq!(
        client.failed(),
        vec![(1, Message::string("lost"), Error::ErrMessageAbandoned)]
    );
    let chunks = client.peek_chunks();
    assert!(chunks.iter().any(|c| matches!(c, Chunk::ForwardTsn(_))));
    assert!(
        !chunks.iter().any(|c| matches!(c, Chunk::PayloadData(_))),
        "abandoned data is not resent"
    );

    flush_buffers(&mut client, &mut server);
    assert!(server.received().is_empty());
    assert_eq!(client.assoc.buffered_amount(), 0);

    client.assoc.send(1, Message::string("next"))?;
    flush_buffers(&mut client, &mut server);
    assert_eq!(server.received(), vec![(1, Message::string("next"))]);

    Ok(())
}

#[test]
fn test_assoc_unreliable_rexmit_ordered_skips_lost_message() -> Result<()> {
    let (mut client, mut server) =
        establish_session_pair(test_config("client"), test_config("server"));

    client.assoc.open_stream(3, true, Reliability::Rexmit(0))?;
    client.assoc.send(3, Message::string("lost"))?;
    client.take_packets();
    client.assoc.send(3, Message::string("kept"))?;
    for p in client.take_packets() {
        server.assoc.handle_packet(&p);
    }
    assert!(server.received().is_empty(), "waits for ssn 0");

    // the gap report makes nothing fast retransmit yet; T3 does
    for p in server.take_packets() {
        client.assoc.handle_packet(&p);
    }
    assert!(client.fire_next_timer());
    flush_buffers(&mut client, &mut server);

    assert_eq!(server.received(), vec![(3, Message::string("kept"))]);
    assert_eq!(client.failed().len(), 1);
    assert_eq!(client.assoc.buffered_amount(), 0);

    Ok(())
}

#[test]
fn test_assoc_unreliable_timed_abandoned() -> Result<()> {
    let (mut client, mut server) =
        establish_session_pair(test_config("client"), test_config("server"));

    client.assoc.send_with_reliability(
        0,
        Message::string("stale"),
        Reliability::Timed(Duration::from_millis(100)),
    )?;
    client.take_packets();

    client.clock.advance(Duration::from_millis(150));
    client.assoc.send(1, Message::string("fresh"))?;
    assert_eq!(
        client.failed(),
        vec![(0, Message::string("stale"), Error::ErrMessageAbandoned)]
    );

    flush_buffers(&mut client, &mut server);
    assert_eq!(server.received(), vec![(1, Message::string("fresh"))]);
    assert_eq!(client.assoc.buffered_amount(), 0);

    Ok(())
}

#[test]
fn test_assoc_timed_message_expires_while_queued() -> Result<()> {
    let mut client = Peer::new(test_config("client"));
    let mut server = Peer::new(test_config("server"));

    client.assoc.connect()?;
    client.assoc.send_with_reliability(
        0,
        Message::string("late"),
        Reliability::Timed(Duration::from_millis(100)),
    )?;

    // the handshake takes longer than the message may live
    client.clock.advance(Duration::from_secs(2));
    server.clock.advance(Duration::from_secs(2));
    flush_buffers(&mut client, &mut server);
    assert_eq!(client.assoc.state(), AssociationState::Established);

    assert!(server.received().is_empty());
    assert_eq!(
        client.failed(),
        vec![(0, Message::string("late"), Error::ErrMessageAbandoned)]
    );
    assert_eq!(client.assoc.buffered_amount(), 0);

    // the expired message took no sequence number
    client.assoc.send(0, Message::string("fresh"))?;
    flush_buffers(&mut client, &mut server);
    assert_eq!(server.received(), vec![(0, Message::string("fresh"))]);

    Ok(())
}

#[test]
fn test_assoc_forward_tsn_far_ahead() {
    let (mut client, mut server) =
        establish_session_pair(test_config("client"), test_config("server"));

    let new_cumulative_tsn = server.assoc.peer_last_tsn.wrapping_add(0x7fff_fff0);
    let fwd = ChunkForwardTsn {
        new_cumulative_tsn,
        streams: vec![],
    };
    server
        .assoc
        .handle_packet(&server.packet_to(vec![Chunk::ForwardTsn(fwd)]));

    assert_eq!(server.assoc.peer_last_tsn, new_cumulative_tsn);
    assert_eq!(server.assoc.state(), AssociationState::Established);
    let acks: Vec<u32> = server
        .take_chunks()
        .iter()
        .filter_map(|c| match c {
            Chunk::SelectiveAck(sack) => Some(sack.cumulative_tsn_ack),
            _ => None,
        })
        .collect();
    assert_eq!(acks, vec![new_cumulative_tsn]);
    assert!(client.take_packets().is_empty());
}

#[test]
fn test_assoc_stream_priority_shares_bandwidth() -> Result<()> {
    let mut client = Peer::new(test_config("client"));
    let mut server = Peer::new(test_config("server"));

    client.assoc.connect()?;
    client.assoc.set_stream_priority(1, 512)?;
    assert_eq!(client.assoc.stream_priority(1), 512);
    assert_eq!(client.assoc.stream_priority(2), 256);

    // queued until the handshake is done
    for i in 0..4 {
        client.assoc.send(1, numbered(i, 1000))?;
        client.assoc.send(2, numbered(i, 1000))?;
    }
    flush_buffers(&mut client, &mut server);

    let order: Vec<(u16, u32)> = server
        .received()
        .iter()
        .map(|(si, m)| (*si, number_of(m)))
        .collect();
    assert_eq!(
        order,
        vec![
            (1, 0),
            (1, 1),
            (2, 0),
            (1, 2),
            (1, 3),
            (2, 1),
            (2, 2),
            (2, 3)
        ]
    );

    Ok(())
}

#[test]
fn test_assoc_buffered_amount_low() -> Result<()> {
    let (mut client, mut server) = establish_session_pair(
        test_config("client").with_total_buffered_amount_low_threshold(2000),
        test_config("server"),
    );

    client.assoc.set_buffered_amount_low_threshold(0, 2000)?;
    assert_eq!(client.assoc.buffered_amount_low_threshold(0), 2000);
    for i in 0..8 {
        client.assoc.send(0, numbered(i, 1000))?;
    }
    assert_eq!(client.assoc.stream_buffered_amount(0), 4000);
    {
        let events = client.events.0.lock().unwrap();
        assert!(events.buffered_low.is_empty());
        assert_eq!(events.total_buffered_low, 0);
    }

    flush_buffers(&mut client, &mut server);
    assert_eq!(server.received().len(), 8);
    assert_eq!(client.assoc.stream_buffered_amount(0), 0);
    {
        let events = client.events.0.lock().unwrap();
        assert_eq!(events.buffered_low, vec![0]);
        assert_eq!(events.total_buffered_low, 1);
    }

    assert_eq!(
        client.assoc.set_buffered_amount_low_threshold(u16::MAX, 0),
        Err(Error::ErrStreamIdOutOfRange(u16::MAX))
    );

    Ok(())
}

#[test]
fn test_assoc_dcep_stays_reliable() -> Result<()> {
    let (mut client, mut server) =
        establish_session_pair(test_config("client"), test_config("server"));

    client.assoc.open_stream(0, false, Reliability::Rexmit(0))?;
    client.assoc.send(
        0,
        Message::new(PayloadProtocolIdentifier::Dcep, vec![0x03, 0x00]),
    )?;
    client.take_packets();

    assert!(client.fire_next_timer());
    assert!(client.failed().is_empty());
    flush_buffers(&mut client, &mut server);
    assert_eq!(server.received().len(), 1);

    Ok(())
}

#[test]
fn test_assoc_heartbeat() {
    let (mut client, mut server) = establish_session_pair(
        test_config("client"),
        test_config("server").with_heartbeat_interval(Some(Duration::from_secs(1))),
    );

    assert!(server.fire_next_timer());
    let chunks = server.take_chunks();
    let hb = match chunks.as_slice() {
        [Chunk::Heartbeat(hb)] => hb.clone(),
        other => panic!("expected a HEARTBEAT, got {other:?}"),
    };
    assert_eq!(server.assoc.heartbeat_info, Some(hb.info.clone()));

    client.assoc.handle_packet(&client.packet_to(vec![Chunk::Heartbeat(hb.clone())]));
    match client.take_chunks().as_slice() {
        [Chunk::HeartbeatAck(ack)] => assert_eq!(ack.info, hb.info),
        other => panic!("expected a HEARTBEAT ACK, got {other:?}"),
    }

    server.assoc.handle_packet(&server.packet_to(vec![Chunk::HeartbeatAck(ChunkHeartbeat {
        is_ack: true,
        info: hb.info,
    })]));
    assert_eq!(server.assoc.heartbeat_info, None);
    assert!(server.assoc.timer_table.is_running(Timer::Heartbeat));
}

#[test]
fn test_assoc_heartbeat_unanswered_closes() {
    let (_client, mut server) = establish_session_pair(
        test_config("client"),
        test_config("server")
            .with_heartbeat_interval(Some(Duration::from_secs(1)))
            .with_max_data_retransmits(1),
    );

    assert!(server.fire_next_timer());
    assert!(server.fire_next_timer());
    assert_eq!(server.take_chunks().len(), 2, "two HEARTBEATs");
    assert_eq!(server.assoc.state(), AssociationState::Established);

    assert!(server.fire_next_timer());
    assert_eq!(
        server.close_reason(),
        Some(Error::ErrTooManyRetransmissions)
    );
}

fn unknown_chunk(typ: u8) -> Chunk {
    Chunk::Unknown(ChunkUnknown {
        hdr: ChunkHeader {
            typ: ChunkType(typ),
            flags: 0,
            value_length: 4,
        },
        value: Bytes::from_static(&[1, 2, 3, 4]),
    })
}

fn heartbeat() -> Chunk {
    Chunk::Heartbeat(ChunkHeartbeat {
        is_ack: false,
        info: Bytes::from_static(b"ping"),
    })
}

#[test]
fn test_assoc_unknown_chunk_handling() {
    let (_client, mut server) =
        establish_session_pair(test_config("client"), test_config("server"));

    // (type, error reported, rest of packet processed)
    let tests = [
        (0x3f, false, false),
        (0x7f, true, false),
        (0xbf, false, true),
        (0xff, true, true),
    ];

    for (typ, reported, processed) in tests {
        let raw = server.packet_to(vec![unknown_chunk(typ), heartbeat()]);
        server.assoc.handle_packet(&raw);
        let chunks = server.take_chunks();

        let error = chunks.iter().find_map(|c| match c {
            Chunk::Error(e) => Some(e.clone()),
            _ => None,
        });
        assert_eq!(error.is_some(), reported, "type {typ:#x}");
        if let Some(e) = error {
            assert_eq!(e.error_causes[0].code, UNRECOGNIZED_CHUNK_TYPE);
            assert_eq!(e.error_causes[0].raw[0], typ, "carries the chunk");
        }
        assert_eq!(
            chunks.iter().any(|c| matches!(c, Chunk::HeartbeatAck(_))),
            processed,
            "type {typ:#x}"
        );
    }
    assert_eq!(server.assoc.state(), AssociationState::Established);
}

#[test]
fn test_assoc_peer_error_reported() {
    let (mut client, mut server) =
        establish_session_pair(test_config("client"), test_config("server"));

    server
        .assoc
        .handle_packet(&server.packet_to(vec![unknown_chunk(0xff)]));
    flush_buffers(&mut client, &mut server);

    let errors = client.errors();
    assert_eq!(errors.len(), 1);
    assert!(matches!(&errors[0], Error::ErrPeerReported(s) if s.starts_with("Unrecognized Chunk Type")));
    assert_eq!(client.assoc.state(), AssociationState::Established);
}

#[test]
fn test_assoc_stream_limits() -> Result<()> {
    let (mut client, _server) = establish_session_pair(
        test_config("client").with_max_num_outbound_streams(4),
        test_config("server").with_max_num_inbound_streams(2),
    );

    assert_eq!(
        client.assoc.open_stream(2, true, Reliability::Reliable),
        Err(Error::ErrStreamIdOutOfRange(2)),
        "peer accepts two inbound streams"
    );
    client.assoc.open_stream(1, true, Reliability::Reliable)?;
    assert_eq!(
        client.assoc.open_stream(1, true, Reliability::Reliable),
        Err(Error::ErrStreamAlreadyExist(1))
    );
    assert_eq!(
        client.assoc.send(9, Message::string("x")),
        Err(Error::ErrStreamIdOutOfRange(9))
    );

    Ok(())
}

#[test]
fn test_assoc_invalid_stream_from_peer() {
    let (_client, mut server) = establish_session_pair(
        test_config("client"),
        test_config("server").with_max_num_inbound_streams(2),
    );

    let tsn = server.assoc.peer_last_tsn.wrapping_add(1);
    let raw = server.packet_to(vec![Chunk::PayloadData(ChunkPayloadData {
        beginning_fragment: true,
        ending_fragment: true,
        tsn,
        stream_identifier: 5,
        user_data: Bytes::from_static(b"nope"),
        ..Default::default()
    })]);
    server.assoc.handle_packet(&raw);

    assert!(server.received().is_empty());
    assert_eq!(server.assoc.peer_last_tsn, tsn, "TSN still acknowledged");
    let chunks = server.take_chunks();
    assert!(chunks.iter().any(|c| matches!(c,
        Chunk::Error(e) if e.error_causes[0].code == INVALID_STREAM_IDENTIFIER)));
    assert!(chunks.iter().any(|c| matches!(c,
        Chunk::SelectiveAck(s) if s.cumulative_tsn_ack == tsn)));
}

#[test]
fn test_assoc_send_errors() {
    let (mut client, _server) = establish_session_pair(
        test_config("client").with_max_message_size(1024),
        test_config("server"),
    );

    assert_eq!(
        client.assoc.send(0, Message::binary(Bytes::new())),
        Err(Error::ErrEmptyMessage)
    );
    assert_eq!(
        client.assoc.send(0, Message::binary(vec![0u8; 1025])),
        Err(Error::ErrOutboundPacketTooLarge)
    );
    assert!(client.assoc.send(0, Message::binary(vec![0u8; 1024])).is_ok());
}

#[test]
fn test_assoc_sack_ahead_of_sent_aborts() {
    let (mut client, mut server) =
        establish_session_pair(test_config("client"), test_config("server"));

    let sack = ChunkSelectiveAck {
        cumulative_tsn_ack: client.assoc.tracker.my_next_tsn.wrapping_add(5),
        advertised_receiver_window_credit: 65536,
        ..Default::default()
    };
    client
        .assoc
        .handle_packet(&client.packet_to(vec![Chunk::SelectiveAck(sack)]));

    assert!(matches!(
        client.close_reason(),
        Some(Error::ErrSackTsnAheadOfLastSent { .. })
    ));

    assert!(matches!(client.peek_chunks().as_slice(),
        [Chunk::Abort(a)] if a.error_causes[0].code == PROTOCOL_VIOLATION));

    flush_buffers(&mut client, &mut server);
    assert!(matches!(
        server.close_reason(),
        Some(Error::ErrAbortReceived(_))
    ));
}

#[test]
fn test_assoc_drops_bad_packets() {
    let (client, mut server) =
        establish_session_pair(test_config("client"), test_config("server"));

    let mut corrupted = server.packet_to(vec![heartbeat()]).to_vec();
    let last = corrupted.len() - 1;
    corrupted[last] ^= 0xff;
    server.assoc.handle_packet(&Bytes::from(corrupted));

    // wrong verification tag
    server.assoc.handle_packet(&client.packet_to(vec![heartbeat()]));

    assert!(server.take_packets().is_empty());
    assert_eq!(server.assoc.stats().get_num_dropped_packets(), 2);
    assert_eq!(server.assoc.state(), AssociationState::Established);
}

#[test]
fn test_assoc_stale_timer_ignored() {
    let (mut client, _server) =
        establish_session_pair(test_config("client"), test_config("server"));

    client.assoc.handle_timeout(TimerHandle::new(u64::MAX));
    assert!(client.take_packets().is_empty());
    assert_eq!(client.assoc.state(), AssociationState::Established);
}

#[test]
fn test_assoc_stats_reset() -> Result<()> {
    let (mut client, mut server) =
        establish_session_pair(test_config("client"), test_config("server"));

    client.assoc.send(0, Message::string("count me"))?;
    flush_buffers(&mut client, &mut server);

    let mut stats = client.assoc.stats();
    assert_eq!(stats.get_num_datas_sent(), 1);
    stats.reset();
    assert_eq!(stats, AssociationStats::default());

    Ok(())
}
