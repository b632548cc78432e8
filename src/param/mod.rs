
pub(crate) mod param_header;
pub(crate) mod param_type;

use std::fmt;

use bytes::{Bytes, BytesMut};
use param_header::*;
use param_type::*;
use rand::Rng;

use crate::error::{Error, Result};

pub(crate) const STATE_COOKIE_LENGTH: usize = 32;

/// A TLV parameter as found in INIT, INIT ACK, HEARTBEAT and HEARTBEAT ACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Param {
    /// Opaque sender-specific info echoed back by the peer in HEARTBEAT ACK.
    HeartbeatInfo(Bytes),
    /// Cookie handed out in INIT ACK and echoed back in COOKIE ECHO.
    StateCookie(Bytes),
    /// RFC 3758 partial reliability support.
    ForwardTsnSupported,
    /// Parameters the peer did not understand, reported back to us.
    Unrecognized(Bytes),
    /// A parameter type we do not implement whose upper bit says "skip".
    Unknown { typ: u16, value: Bytes },
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} bytes", self.header(), self.value_length())
    }
}

impl Param {
    pub(crate) fn new_state_cookie() -> Self {
        let mut cookie = BytesMut::new();
        cookie.resize(STATE_COOKIE_LENGTH, 0);
        rand::thread_rng().fill(cookie.as_mut());
        Param::StateCookie(cookie.freeze())
    }

    pub(crate) fn header(&self) -> ParamHeader {
        let typ = match self {
            Param::HeartbeatInfo(_) => ParamType::HeartbeatInfo,
            Param::StateCookie(_) => ParamType::StateCookie,
            Param::ForwardTsnSupported => ParamType::ForwardTsnSupp,
            Param::Unrecognized(_) => ParamType::UnrecognizedParam,
            Param::Unknown { typ, .. } => ParamType::Unknown { param_type: *typ },
        };
        ParamHeader {
            typ,
            value_length: self.value_length() as u16,
        }
    }

    pub(crate) fn value_length(&self) -> usize {
        match self {
            Param::HeartbeatInfo(v)
            | Param::StateCookie(v)
            | Param::Unrecognized(v)
            | Param::Unknown { value: v, .. } => v.len(),
            Param::ForwardTsnSupported => 0,
        }
    }

    /// Parses the parameter at the start of `raw`. Trailing bytes beyond the
    /// declared length are ignored.
    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ParamHeader::unmarshal(raw)?;
        let value = raw.slice(PARAM_HEADER_LENGTH..PARAM_HEADER_LENGTH + header.value_length as usize);

        match header.typ {
            ParamType::HeartbeatInfo => Ok(Param::HeartbeatInfo(value)),
            ParamType::StateCookie => Ok(Param::StateCookie(value)),
            ParamType::ForwardTsnSupp => Ok(Param::ForwardTsnSupported),
            ParamType::UnrecognizedParam => Ok(Param::Unrecognized(value)),
            ParamType::Unknown { param_type } => {
                // https://datatracker.ietf.org/doc/html/rfc4960#section-3.2.1
                let stop_processing = ((param_type >> 15) & 0x01) == 0;
                if stop_processing {
                    Err(Error::ErrParamTypeUnhandled { typ: param_type })
                } else {
                    Ok(Param::Unknown {
                        typ: param_type,
                        value,
                    })
                }
            }
        }
    }

    pub(crate) fn marshal_to(&self, buf: &mut BytesMut) -> usize {
        self.header().marshal_to(buf);
        match self {
            Param::HeartbeatInfo(v)
            | Param::StateCookie(v)
            | Param::Unrecognized(v)
            | Param::Unknown { value: v, .. } => buf.extend_from_slice(v),
            Param::ForwardTsnSupported => {}
        }
        buf.len()
    }

    pub(crate) fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PARAM_HEADER_LENGTH + self.value_length());
        self.marshal_to(&mut buf);
        buf.freeze()
    }
}
