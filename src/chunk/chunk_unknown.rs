use std::fmt;

use bytes::{Bytes, BytesMut};

use super::chunk_header::*;
use super::*;

/// A chunk whose type we do not implement. The raw value is kept so it can be
/// echoed back inside an "Unrecognized Chunk Type" error cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChunkUnknown {
    pub(crate) hdr: ChunkHeader,
    pub(crate) value: Bytes,
}

impl fmt::Display for ChunkUnknown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.header(), self.value.len())
    }
}

impl ChunkCodec for ChunkUnknown {
    fn header(&self) -> ChunkHeader {
        self.hdr.clone()
    }

    fn unmarshal(raw: &Bytes) -> Result<Self> {
        let hdr = ChunkHeader::unmarshal(raw)?;
        let value = raw.slice(CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + hdr.value_length());
        Ok(ChunkUnknown { hdr, value })
    }

    fn marshal_to(&self, buf: &mut BytesMut) -> Result<usize> {
        self.header().marshal_to(buf);
        buf.extend_from_slice(&self.value);
        Ok(buf.len())
    }

    fn check(&self) -> Result<()> {
        Ok(())
    }

    fn value_length(&self) -> usize {
        self.value.len()
    }
}

impl ChunkUnknown {
    /// The chunk as it appeared on the wire, header included.
    pub(crate) fn raw(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CHUNK_HEADER_SIZE + self.value.len());
        self.header().marshal_to(&mut buf);
        buf.extend_from_slice(&self.value);
        buf.freeze()
    }
}
