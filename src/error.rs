use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of every [`Error`], used by the association to pick
/// a recovery action.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A chunk or parameter failed field/length validation. The packet is dropped.
    MalformedChunk,
    /// A well-formed chunk arrived in a state that does not allow it. The
    /// association is aborted.
    ProtocolViolation,
    /// Handshake or retransmission budget exhausted.
    Timeout,
    /// A local limit was hit; only the offending request is rejected.
    ResourceExhausted,
    /// Checksum mismatch or truncated packet. Silently dropped.
    TransportLoss,
    /// Misuse of the API by the application.
    User,
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("raw is too small for a SCTP chunk")]
    ErrChunkHeaderTooSmall,
    #[error("not enough data left in SCTP packet to satisfy requested length")]
    ErrChunkHeaderNotEnoughSpace,
    #[error("chunk PADDING is non-zero at offset")]
    ErrChunkHeaderPaddingNonZero,
    #[error("chunk has invalid length")]
    ErrChunkHeaderInvalidLength,
    #[error("chunk type {expected} expected, got {actual}")]
    ErrChunkTypeMismatch { expected: u8, actual: u8 },
    #[error("chunk too short")]
    ErrChunkTooShort,
    #[error("chunk value has unexpected length")]
    ErrInvalidChunkSize,

    #[error("heartbeat is not long enough to contain Heartbeat Info")]
    ErrHeartbeatNotLongEnoughInfo,
    #[error("heartbeat should only have HEARTBEAT param")]
    ErrHeartbeatParam,
    #[error("cookie echo must carry a cookie")]
    ErrCookieEchoEmpty,

    #[error("raw is too small for error cause")]
    ErrErrorCauseTooSmall,

    #[error("unhandled ParamType `{typ}`")]
    ErrParamTypeUnhandled { typ: u16 },
    #[error("param header too short")]
    ErrParamHeaderTooShort,
    #[error("param self reported length is shorter than header length")]
    ErrParamHeaderSelfReportedLengthShorter,
    #[error("param self reported length is longer than header length")]
    ErrParamHeaderSelfReportedLengthLonger,

    #[error("chunk Value isn't long enough for mandatory parameters exp")]
    ErrChunkValueNotLongEnough,
    #[error("ChunkType of type INIT flags must be all 0")]
    ErrChunkTypeInitFlagZero,
    #[error("ChunkType of type INIT ACK InitiateTag must not be 0")]
    ErrChunkTypeInitInitiateTagZero,
    #[error("INIT ACK inbound stream request must be > 0")]
    ErrInitInboundStreamRequestZero,
    #[error("INIT ACK outbound stream request must be > 0")]
    ErrInitOutboundStreamRequestZero,
    #[error("INIT ACK Advertised Receiver Window Credit (a_rwnd) must be >= 1500")]
    ErrInitAdvertisedReceiver1500,

    #[error("packet is smaller than the header size")]
    ErrChunkPayloadSmall,
    #[error("DATA chunk carries no user data")]
    ErrChunkPayloadEmpty,
    #[error("SACK Chunk size is not large enough to contain header")]
    ErrSackSizeNotLargeEnoughInfo,
    #[error("FORWARD-TSN Chunk size is not a multiple of stream entries")]
    ErrForwardTsnInvalidLength,

    #[error("raw is smaller than the minimum length for a SCTP packet")]
    ErrPacketRawTooSmall,
    #[error("checksum mismatch theirs: {theirs}, ours: {ours}")]
    ErrChecksumMismatch { theirs: u32, ours: u32 },
    #[error("sctp packet must not have a source port of 0")]
    ErrSctpPacketSourcePortZero,
    #[error("sctp packet must not have a destination port of 0")]
    ErrSctpPacketDestinationPortZero,
    #[error("init chunk must not be bundled with any other chunk")]
    ErrInitChunkBundled,
    #[error("init chunk expects a verification tag of 0 on the packet when out-of-the-blue")]
    ErrInitChunkVerifyTagNotZero,
    #[error("packet verification tag {actual} does not match {expected}")]
    ErrVerificationTagMismatch { expected: u32, actual: u32 },

    #[error("{chunk} is not expected in state {state}")]
    ErrUnexpectedChunk { chunk: String, state: String },
    #[error("no cookie in InitAck")]
    ErrInitAckNoCookie,
    #[error("cookie echo does not match the cookie we sent")]
    ErrCookieMismatch,
    #[error("SACK cumulative TSN {cumulative_tsn_ack} is ahead of the last sent TSN")]
    ErrSackTsnAheadOfLastSent { cumulative_tsn_ack: u32 },
    #[error("unrecognized chunk type {typ} stops processing")]
    ErrUnrecognizedChunkType { typ: u8 },
    #[error("peer reported error: {0}")]
    ErrPeerReported(String),
    #[error("association aborted by peer: {0}")]
    ErrAbortReceived(String),
    #[error("association aborted locally: {0}")]
    ErrAbortSent(String),

    #[error("handshake failed after too many retransmissions")]
    ErrHandshakeTimeout,
    #[error("too many retransmissions")]
    ErrTooManyRetransmissions,

    #[error("stream identifier {0} exceeds the negotiated stream count")]
    ErrStreamIdOutOfRange(u16),
    #[error("there already exists a stream with identifier {0}")]
    ErrStreamAlreadyExist(u16),
    #[error("receive buffer is full")]
    ErrReceiveBufferFull,
    #[error("outbound packet larger than maximum message size")]
    ErrOutboundPacketTooLarge,
    #[error("message has no payload")]
    ErrEmptyMessage,

    #[error("association is closed")]
    ErrAssociationClosed,
    #[error("association not found")]
    ErrAssociationNotFound,
    #[error("connect called in non-Closed state")]
    ErrConnectNonClosed,
    #[error("shutdown called in non-Established state")]
    ErrShutdownNonEstablished,
    #[error("message abandoned before it was acknowledged")]
    ErrMessageAbandoned,
    #[error("association is shutting down")]
    ErrAssociationShuttingDown,

    #[error("net conn: {0}")]
    ErrNetConn(String),
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ErrPacketRawTooSmall | Error::ErrChecksumMismatch { .. } => {
                ErrorKind::TransportLoss
            }
            Error::ErrSctpPacketSourcePortZero
            | Error::ErrSctpPacketDestinationPortZero
            | Error::ErrInitChunkBundled
            | Error::ErrInitChunkVerifyTagNotZero
            | Error::ErrVerificationTagMismatch { .. }
            | Error::ErrUnexpectedChunk { .. }
            | Error::ErrInitAckNoCookie
            | Error::ErrCookieMismatch
            | Error::ErrSackTsnAheadOfLastSent { .. }
            | Error::ErrUnrecognizedChunkType { .. }
            | Error::ErrPeerReported(_)
            | Error::ErrAbortReceived(_)
            | Error::ErrAbortSent(_) => ErrorKind::ProtocolViolation,
            Error::ErrHandshakeTimeout | Error::ErrTooManyRetransmissions => ErrorKind::Timeout,
            Error::ErrStreamIdOutOfRange(_)
            | Error::ErrStreamAlreadyExist(_)
            | Error::ErrReceiveBufferFull
            | Error::ErrOutboundPacketTooLarge => ErrorKind::ResourceExhausted,
            Error::ErrEmptyMessage
            | Error::ErrAssociationClosed
            | Error::ErrAssociationNotFound
            | Error::ErrConnectNonClosed
            | Error::ErrShutdownNonEstablished
            | Error::ErrMessageAbandoned
            | Error::ErrAssociationShuttingDown
            | Error::ErrNetConn(_)
            | Error::Other(_) => ErrorKind::User,
            _ => ErrorKind::MalformedChunk,
        }
    }
}

impl From<util::Error> for Error {
    fn from(error: util::Error) -> Self {
        Error::ErrNetConn(error.to_string())
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        match error {
            e @ Error::ErrAssociationClosed
            | e @ Error::ErrAbortReceived(_)
            | e @ Error::ErrAbortSent(_) => {
                io::Error::new(io::ErrorKind::ConnectionAborted, e.to_string())
            }
            e @ Error::ErrHandshakeTimeout | e @ Error::ErrTooManyRetransmissions => {
                io::Error::new(io::ErrorKind::TimedOut, e.to_string())
            }
            e => io::Error::new(io::ErrorKind::Other, e.to_string()),
        }
    }
}
