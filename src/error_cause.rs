use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::util::get_padding_size;

/// errorCauseCode is a cause code that appears in either a ERROR or ABORT chunk
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub(crate) struct ErrorCauseCode(pub(crate) u16);

pub(crate) const INVALID_STREAM_IDENTIFIER: ErrorCauseCode = ErrorCauseCode(1);
pub(crate) const MISSING_MANDATORY_PARAMETER: ErrorCauseCode = ErrorCauseCode(2);
pub(crate) const STALE_COOKIE_ERROR: ErrorCauseCode = ErrorCauseCode(3);
pub(crate) const OUT_OF_RESOURCE: ErrorCauseCode = ErrorCauseCode(4);
pub(crate) const UNRECOGNIZED_CHUNK_TYPE: ErrorCauseCode = ErrorCauseCode(6);
pub(crate) const INVALID_MANDATORY_PARAMETER: ErrorCauseCode = ErrorCauseCode(7);
pub(crate) const UNRECOGNIZED_PARAMETERS: ErrorCauseCode = ErrorCauseCode(8);
pub(crate) const NO_USER_DATA: ErrorCauseCode = ErrorCauseCode(9);
pub(crate) const COOKIE_RECEIVED_WHILE_SHUTTING_DOWN: ErrorCauseCode = ErrorCauseCode(10);
pub(crate) const USER_INITIATED_ABORT: ErrorCauseCode = ErrorCauseCode(12);
pub(crate) const PROTOCOL_VIOLATION: ErrorCauseCode = ErrorCauseCode(13);

impl fmt::Display for ErrorCauseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let others = format!("Unknown CauseCode: {}", self.0);
        let s = match *self {
            INVALID_STREAM_IDENTIFIER => "Invalid Stream Identifier",
            MISSING_MANDATORY_PARAMETER => "Missing Mandatory Parameter",
            STALE_COOKIE_ERROR => "Stale Cookie Error",
            OUT_OF_RESOURCE => "Out Of Resource",
            UNRECOGNIZED_CHUNK_TYPE => "Unrecognized Chunk Type",
            INVALID_MANDATORY_PARAMETER => "Invalid Mandatory Parameter",
            UNRECOGNIZED_PARAMETERS => "Unrecognized Parameters",
            NO_USER_DATA => "No User Data",
            COOKIE_RECEIVED_WHILE_SHUTTING_DOWN => "Cookie Received While Shutting Down",
            USER_INITIATED_ABORT => "User Initiated Abort",
            PROTOCOL_VIOLATION => "Protocol Violation",
            _ => others.as_str(),
        };
        write!(f, "{s}")
    }
}

/// ErrorCause is a TLV carried by ERROR and ABORT chunks. `raw` holds the
/// cause-specific information (e.g. the offending chunk, or a reason string).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ErrorCause {
    pub(crate) code: ErrorCauseCode,
    pub(crate) raw: Bytes,
}

pub(crate) const ERROR_CAUSE_HEADER_LENGTH: usize = 4;

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.raw.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(
                f,
                "{}: {}",
                self.code,
                String::from_utf8_lossy(&self.raw)
            )
        }
    }
}

impl ErrorCause {
    pub(crate) fn new(code: ErrorCauseCode, raw: impl Into<Bytes>) -> Self {
        ErrorCause {
            code,
            raw: raw.into(),
        }
    }

    pub(crate) fn unmarshal(buf: &Bytes) -> Result<Self> {
        if buf.len() < ERROR_CAUSE_HEADER_LENGTH {
            return Err(Error::ErrErrorCauseTooSmall);
        }

        let reader = &mut buf.clone();

        let code = ErrorCauseCode(reader.get_u16());
        let len = reader.get_u16() as usize;

        if len < ERROR_CAUSE_HEADER_LENGTH || buf.len() < len {
            return Err(Error::ErrErrorCauseTooSmall);
        }

        let raw = buf.slice(ERROR_CAUSE_HEADER_LENGTH..len);

        Ok(ErrorCause { code, raw })
    }

    pub(crate) fn marshal_to(&self, writer: &mut BytesMut) -> usize {
        writer.put_u16(self.code.0);
        writer.put_u16(self.length() as u16);
        writer.extend_from_slice(&self.raw);
        writer.len()
    }

    pub(crate) fn length(&self) -> usize {
        self.raw.len() + ERROR_CAUSE_HEADER_LENGTH
    }
}

/// Parses a list of causes, each padded to 4 bytes except the last one.
pub(crate) fn unmarshal_error_causes(value: &Bytes) -> Result<Vec<ErrorCause>> {
    let mut error_causes = vec![];
    let mut offset = 0;
    while offset + ERROR_CAUSE_HEADER_LENGTH <= value.len() {
        let e = ErrorCause::unmarshal(&value.slice(offset..))?;
        offset += e.length() + get_padding_size(e.length());
        error_causes.push(e);
    }
    Ok(error_causes)
}

pub(crate) fn marshal_error_causes(error_causes: &[ErrorCause], writer: &mut BytesMut) {
    for (idx, ec) in error_causes.iter().enumerate() {
        ec.marshal_to(writer);
        if idx != error_causes.len() - 1 {
            writer.put_bytes(0, get_padding_size(ec.length()));
        }
    }
}

pub(crate) fn error_causes_length(error_causes: &[ErrorCause]) -> usize {
    let mut l = 0;
    for (idx, ec) in error_causes.iter().enumerate() {
        l += ec.length();
        if idx != error_causes.len() - 1 {
            l += get_padding_size(ec.length());
        }
    }
    l
}
