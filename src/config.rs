use std::time::Duration;

use crate::association::AckMode;
use crate::queue::pending_queue::DEFAULT_STREAM_PRIORITY;

/// initial MTU for outgoing packets
pub(crate) const INITIAL_MTU: usize = 1228;
/// MTU for inbound packets
pub(crate) const RECEIVE_MTU: usize = 8192;
pub(crate) const INITIAL_RECV_BUF_SIZE: u32 = 1024 * 1024;
pub(crate) const COMMON_HEADER_SIZE: usize = 12;
pub(crate) const DATA_CHUNK_HEADER_SIZE: usize = 16;
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE: u32 = 65536;

pub(crate) const RTO_INITIAL: Duration = Duration::from_millis(3000);
pub(crate) const RTO_MIN: Duration = Duration::from_millis(1000);
pub(crate) const RTO_MAX: Duration = Duration::from_millis(60000);

pub(crate) const DEFAULT_MAX_INIT_RETRANSMITS: u32 = 5;
pub(crate) const DEFAULT_MAX_DATA_RETRANSMITS: u32 = 10;
pub(crate) const DEFAULT_FAST_RETRANSMIT_THRESHOLD: u32 = 3;
pub(crate) const DEFAULT_DELAYED_ACK_TIMEOUT: Duration = Duration::from_millis(200);
pub(crate) const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Config collects the arguments to association construction into a single
/// structure.
///
/// Default values should be suitable for a WebRTC data channel over DTLS.
#[derive(Debug, Clone)]
pub struct Config {
    name: String,
    mtu: usize,
    max_receive_buffer_size: u32,
    max_message_size: u32,
    max_num_outbound_streams: u16,
    max_num_inbound_streams: u16,
    rto_initial: Duration,
    rto_min: Duration,
    rto_max: Duration,
    max_init_retransmits: u32,
    max_data_retransmits: u32,
    fast_retransmit_threshold: u32,
    delayed_ack_timeout: Duration,
    heartbeat_interval: Option<Duration>,
    ack_mode: AckMode,
    forward_tsn_supported: bool,
    default_stream_priority: u16,
    total_buffered_amount_low_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name: String::new(),
            mtu: INITIAL_MTU,
            max_receive_buffer_size: INITIAL_RECV_BUF_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_num_outbound_streams: u16::MAX,
            max_num_inbound_streams: u16::MAX,
            rto_initial: RTO_INITIAL,
            rto_min: RTO_MIN,
            rto_max: RTO_MAX,
            max_init_retransmits: DEFAULT_MAX_INIT_RETRANSMITS,
            max_data_retransmits: DEFAULT_MAX_DATA_RETRANSMITS,
            fast_retransmit_threshold: DEFAULT_FAST_RETRANSMIT_THRESHOLD,
            delayed_ack_timeout: DEFAULT_DELAYED_ACK_TIMEOUT,
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
            ack_mode: AckMode::Normal,
            forward_tsn_supported: true,
            default_stream_priority: DEFAULT_STREAM_PRIORITY,
            total_buffered_amount_low_threshold: 0,
        }
    }
}

impl Config {
    /// Name used as the prefix of every log line of the association.
    pub fn with_name(mut self, value: impl Into<String>) -> Self {
        self.name = value.into();
        self
    }

    /// Largest packet handed to the packet transport, common header included.
    pub fn with_mtu(mut self, value: usize) -> Self {
        self.mtu = value;
        self
    }

    pub fn with_max_receive_buffer_size(mut self, value: u32) -> Self {
        self.max_receive_buffer_size = value;
        self
    }

    pub fn with_max_message_size(mut self, value: u32) -> Self {
        self.max_message_size = value;
        self
    }

    pub fn with_max_num_outbound_streams(mut self, value: u16) -> Self {
        self.max_num_outbound_streams = value;
        self
    }

    pub fn with_max_num_inbound_streams(mut self, value: u16) -> Self {
        self.max_num_inbound_streams = value;
        self
    }

    pub fn with_rto_initial(mut self, value: Duration) -> Self {
        self.rto_initial = value;
        self
    }

    pub fn with_rto_min(mut self, value: Duration) -> Self {
        self.rto_min = value;
        self
    }

    pub fn with_rto_max(mut self, value: Duration) -> Self {
        self.rto_max = value;
        self
    }

    /// How many times INIT or COOKIE-ECHO is retransmitted before the
    /// handshake fails.
    pub fn with_max_init_retransmits(mut self, value: u32) -> Self {
        self.max_init_retransmits = value;
        self
    }

    /// Consecutive T3-rtx, T2-shutdown or heartbeat expiries tolerated before
    /// the association is closed.
    pub fn with_max_data_retransmits(mut self, value: u32) -> Self {
        self.max_data_retransmits = value;
        self
    }

    /// Miss indications needed before a chunk is fast retransmitted.
    pub fn with_fast_retransmit_threshold(mut self, value: u32) -> Self {
        self.fast_retransmit_threshold = value;
        self
    }

    pub fn with_delayed_ack_timeout(mut self, value: Duration) -> Self {
        self.delayed_ack_timeout = value;
        self
    }

    /// `None` disables heartbeats.
    pub fn with_heartbeat_interval(mut self, value: Option<Duration>) -> Self {
        self.heartbeat_interval = value;
        self
    }

    pub fn with_ack_mode(mut self, value: AckMode) -> Self {
        self.ack_mode = value;
        self
    }

    pub fn with_forward_tsn_supported(mut self, value: bool) -> Self {
        self.forward_tsn_supported = value;
        self
    }

    /// Scheduling weight of streams without a priority of their own.
    pub fn with_default_stream_priority(mut self, value: u16) -> Self {
        self.default_stream_priority = value;
        self
    }

    pub fn with_total_buffered_amount_low_threshold(mut self, value: usize) -> Self {
        self.total_buffered_amount_low_threshold = value;
        self
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn mtu(&self) -> usize {
        self.mtu
    }

    /// Largest user data carried by a single DATA chunk.
    pub(crate) fn max_payload_size(&self) -> usize {
        self.mtu
            .saturating_sub(COMMON_HEADER_SIZE + DATA_CHUNK_HEADER_SIZE)
            .max(1)
    }

    pub(crate) fn max_receive_buffer_size(&self) -> u32 {
        self.max_receive_buffer_size
    }

    pub(crate) fn max_message_size(&self) -> u32 {
        self.max_message_size
    }

    pub(crate) fn max_num_outbound_streams(&self) -> u16 {
        self.max_num_outbound_streams
    }

    pub(crate) fn max_num_inbound_streams(&self) -> u16 {
        self.max_num_inbound_streams
    }

    pub(crate) fn rto_initial(&self) -> Duration {
        self.rto_initial
    }

    pub(crate) fn rto_min(&self) -> Duration {
        self.rto_min
    }

    pub(crate) fn rto_max(&self) -> Duration {
        self.rto_max
    }

    pub(crate) fn max_init_retransmits(&self) -> u32 {
        self.max_init_retransmits
    }

    pub(crate) fn max_data_retransmits(&self) -> u32 {
        self.max_data_retransmits
    }

    pub(crate) fn fast_retransmit_threshold(&self) -> u32 {
        self.fast_retransmit_threshold
    }

    pub(crate) fn delayed_ack_timeout(&self) -> Duration {
        self.delayed_ack_timeout
    }

    pub(crate) fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    pub(crate) fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub(crate) fn forward_tsn_supported(&self) -> bool {
        self.forward_tsn_supported
    }

    pub(crate) fn default_stream_priority(&self) -> u16 {
        self.default_stream_priority
    }

    pub(crate) fn total_buffered_amount_low_threshold(&self) -> usize {
        self.total_buffered_amount_low_threshold
    }
}
