
pub(crate) mod chunk_abort;
pub(crate) mod chunk_cookie_ack;
pub(crate) mod chunk_cookie_echo;
pub(crate) mod chunk_error;
pub(crate) mod chunk_forward_tsn;
pub(crate) mod chunk_header;
pub(crate) mod chunk_heartbeat;
pub(crate) mod chunk_init;
pub(crate) mod chunk_payload_data;
pub(crate) mod chunk_selective_ack;
pub(crate) mod chunk_shutdown;
pub(crate) mod chunk_shutdown_ack;
pub(crate) mod chunk_shutdown_complete;
pub(crate) mod chunk_type;
pub(crate) mod chunk_unknown;

use std::fmt;

use bytes::{Bytes, BytesMut};
use chunk_abort::ChunkAbort;
use chunk_cookie_ack::ChunkCookieAck;
use chunk_cookie_echo::ChunkCookieEcho;
use chunk_error::ChunkError;
use chunk_forward_tsn::ChunkForwardTsn;
use chunk_header::*;
use chunk_heartbeat::ChunkHeartbeat;
use chunk_init::ChunkInit;
use chunk_payload_data::ChunkPayloadData;
use chunk_selective_ack::ChunkSelectiveAck;
use chunk_shutdown::ChunkShutdown;
use chunk_shutdown_ack::ChunkShutdownAck;
use chunk_shutdown_complete::ChunkShutdownComplete;
use chunk_type::*;
use chunk_unknown::ChunkUnknown;

use crate::error::Result;

/// Wire codec shared by every chunk kind.
pub(crate) trait ChunkCodec: fmt::Display + fmt::Debug {
    fn header(&self) -> ChunkHeader;
    fn unmarshal(raw: &Bytes) -> Result<Self>
    where
        Self: Sized;
    fn marshal_to(&self, buf: &mut BytesMut) -> Result<usize>;
    fn check(&self) -> Result<()>;
    fn value_length(&self) -> usize;
}

/// A single SCTP chunk.
///
/// The set of chunk kinds is closed, so handling is done by matching on this
/// enum. Chunks we do not understand are kept as [`Chunk::Unknown`] so the
/// receiver can apply the "unrecognized chunk" rules encoded in the type byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Chunk {
    Init(ChunkInit),
    InitAck(ChunkInit),
    CookieEcho(ChunkCookieEcho),
    CookieAck(ChunkCookieAck),
    PayloadData(ChunkPayloadData),
    SelectiveAck(ChunkSelectiveAck),
    Heartbeat(ChunkHeartbeat),
    HeartbeatAck(ChunkHeartbeat),
    Abort(ChunkAbort),
    Shutdown(ChunkShutdown),
    ShutdownAck(ChunkShutdownAck),
    ShutdownComplete(ChunkShutdownComplete),
    Error(ChunkError),
    ForwardTsn(ChunkForwardTsn),
    Unknown(ChunkUnknown),
}

macro_rules! dispatch {
    ($self:ident, $c:ident => $e:expr) => {
        match $self {
            Chunk::Init($c) | Chunk::InitAck($c) => $e,
            Chunk::CookieEcho($c) => $e,
            Chunk::CookieAck($c) => $e,
            Chunk::PayloadData($c) => $e,
            Chunk::SelectiveAck($c) => $e,
            Chunk::Heartbeat($c) | Chunk::HeartbeatAck($c) => $e,
            Chunk::Abort($c) => $e,
            Chunk::Shutdown($c) => $e,
            Chunk::ShutdownAck($c) => $e,
            Chunk::ShutdownComplete($c) => $e,
            Chunk::Error($c) => $e,
            Chunk::ForwardTsn($c) => $e,
            Chunk::Unknown($c) => $e,
        }
    };
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        dispatch!(self, c => fmt::Display::fmt(c, f))
    }
}

impl Chunk {
    /// Parses the chunk at the start of `raw`. Bytes following the chunk and
    /// its padding are left alone, so a packet body can be walked by slicing.
    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        let chunk = match header.typ {
            CT_INIT => Chunk::Init(ChunkInit::unmarshal(raw)?),
            CT_INIT_ACK => Chunk::InitAck(ChunkInit::unmarshal(raw)?),
            CT_COOKIE_ECHO => Chunk::CookieEcho(ChunkCookieEcho::unmarshal(raw)?),
            CT_COOKIE_ACK => Chunk::CookieAck(ChunkCookieAck::unmarshal(raw)?),
            CT_PAYLOAD_DATA => Chunk::PayloadData(ChunkPayloadData::unmarshal(raw)?),
            CT_SACK => Chunk::SelectiveAck(ChunkSelectiveAck::unmarshal(raw)?),
            CT_HEARTBEAT => Chunk::Heartbeat(ChunkHeartbeat::unmarshal(raw)?),
            CT_HEARTBEAT_ACK => Chunk::HeartbeatAck(ChunkHeartbeat::unmarshal(raw)?),
            CT_ABORT => Chunk::Abort(ChunkAbort::unmarshal(raw)?),
            CT_SHUTDOWN => Chunk::Shutdown(ChunkShutdown::unmarshal(raw)?),
            CT_SHUTDOWN_ACK => Chunk::ShutdownAck(ChunkShutdownAck::unmarshal(raw)?),
            CT_SHUTDOWN_COMPLETE => {
                Chunk::ShutdownComplete(ChunkShutdownComplete::unmarshal(raw)?)
            }
            CT_ERROR => Chunk::Error(ChunkError::unmarshal(raw)?),
            CT_FORWARD_TSN => Chunk::ForwardTsn(ChunkForwardTsn::unmarshal(raw)?),
            _ => Chunk::Unknown(ChunkUnknown::unmarshal(raw)?),
        };
        Ok(chunk)
    }

    pub(crate) fn marshal(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.length());
        self.marshal_to(&mut buf)?;
        Ok(buf.freeze())
    }

    pub(crate) fn marshal_to(&self, buf: &mut BytesMut) -> Result<usize> {
        dispatch!(self, c => c.marshal_to(buf))
    }

    pub(crate) fn header(&self) -> ChunkHeader {
        dispatch!(self, c => c.header())
    }

    pub(crate) fn check(&self) -> Result<()> {
        dispatch!(self, c => c.check())
    }

    pub(crate) fn value_length(&self) -> usize {
        dispatch!(self, c => c.value_length())
    }

    /// Serialized length of header and value, padding excluded.
    pub(crate) fn length(&self) -> usize {
        CHUNK_HEADER_SIZE + self.value_length()
    }

    pub(crate) fn typ(&self) -> ChunkType {
        self.header().typ
    }

    /// Bundling priority: lower is sent first.
    pub(crate) fn priority(&self) -> u8 {
        match self {
            Chunk::Abort(_)
            | Chunk::Shutdown(_)
            | Chunk::ShutdownAck(_)
            | Chunk::ShutdownComplete(_) => 0,
            Chunk::PayloadData(_) => 2,
            _ => 1,
        }
    }
}
