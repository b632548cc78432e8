use std::fmt;

use bytes::{Bytes, BytesMut};

use super::chunk_header::*;
use super::chunk_type::*;
use super::*;
use crate::error::Error;
use crate::param::Param;

///ChunkHeartbeat represents an SCTP Chunk of type HEARTBEAT, or HEARTBEAT ACK
///when `is_ack` is set. The ACK echoes the Heartbeat Information parameter of
///the HEARTBEAT it answers.
///
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|   Type = 4    | Chunk  Flags  |      Heartbeat Length         |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///\                                                               \
////            Heartbeat Information TLV (Variable-Length)        /
///\                                                               \
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChunkHeartbeat {
    pub(crate) is_ack: bool,
    pub(crate) info: Bytes,
}

impl fmt::Display for ChunkHeartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} info={:?}", self.header(), self.info)
    }
}

impl ChunkCodec for ChunkHeartbeat {
    fn header(&self) -> ChunkHeader {
        ChunkHeader {
            typ: if self.is_ack {
                CT_HEARTBEAT_ACK
            } else {
                CT_HEARTBEAT
            },
            flags: 0,
            value_length: self.value_length() as u16,
        }
    }

    fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        if header.typ != CT_HEARTBEAT && header.typ != CT_HEARTBEAT_ACK {
            return Err(Error::ErrChunkTypeMismatch {
                expected: CT_HEARTBEAT.0,
                actual: header.typ.0,
            });
        }

        if header.value_length() < crate::param::param_header::PARAM_HEADER_LENGTH {
            return Err(Error::ErrHeartbeatNotLongEnoughInfo);
        }

        let value = raw.slice(CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + header.value_length());
        let info = match Param::unmarshal(&value)? {
            Param::HeartbeatInfo(info) => info,
            _ => return Err(Error::ErrHeartbeatParam),
        };

        Ok(ChunkHeartbeat {
            is_ack: header.typ == CT_HEARTBEAT_ACK,
            info,
        })
    }

    fn marshal_to(&self, buf: &mut BytesMut) -> Result<usize> {
        self.header().marshal_to(buf);
        Param::HeartbeatInfo(self.info.clone()).marshal_to(buf);
        Ok(buf.len())
    }

    fn check(&self) -> Result<()> {
        Ok(())
    }

    fn value_length(&self) -> usize {
        crate::param::param_header::PARAM_HEADER_LENGTH + self.info.len()
    }
}
