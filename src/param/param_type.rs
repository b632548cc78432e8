use std::fmt;

/// Parameter types carried inside INIT, INIT ACK and HEARTBEAT chunks.
/// https://tools.ietf.org/html/rfc4960#section-3.2.1
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ParamType {
    HeartbeatInfo,
    StateCookie,
    UnrecognizedParam,
    ForwardTsnSupp,
    Unknown { param_type: u16 },
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ParamType::HeartbeatInfo => write!(f, "Heartbeat Info"),
            ParamType::StateCookie => write!(f, "State Cookie"),
            ParamType::UnrecognizedParam => write!(f, "Unrecognized Parameters"),
            ParamType::ForwardTsnSupp => write!(f, "Forward TSN supported"),
            ParamType::Unknown { param_type } => write!(f, "Unknown ParamType: {param_type}"),
        }
    }
}

impl From<u16> for ParamType {
    fn from(v: u16) -> ParamType {
        match v {
            1 => ParamType::HeartbeatInfo,
            7 => ParamType::StateCookie,
            8 => ParamType::UnrecognizedParam,
            49152 => ParamType::ForwardTsnSupp,
            unknown => ParamType::Unknown {
                param_type: unknown,
            },
        }
    }
}

impl From<ParamType> for u16 {
    fn from(v: ParamType) -> u16 {
        match v {
            ParamType::HeartbeatInfo => 1,
            ParamType::StateCookie => 7,
            ParamType::UnrecognizedParam => 8,
            ParamType::ForwardTsnSupp => 49152,
            ParamType::Unknown { param_type } => param_type,
        }
    }
}
