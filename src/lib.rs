//! SCTP data channel transport
//!
//! A user space implementation of the SCTP subset (RFC 4960, RFC 3758) that
//! WebRTC data channels run over. Messages are sent on numbered streams, each
//! ordered or unordered, reliable or partially reliable.
//!
//! [`Association`] is a synchronous state machine: it is fed inbound packets
//! and timer expiries, and it talks to the outside world only through the
//! [`PacketIo`], [`TimerService`] and [`AssociationHandler`] it was built
//! with. [`Endpoint`] drives associations on tokio tasks over any
//! `webrtc-util` `Conn`.

#![warn(rust_2018_idioms)]

pub mod association;
pub(crate) mod chunk;
pub mod config;
pub(crate) mod congestion;
pub mod endpoint;
pub mod error;
pub(crate) mod error_cause;
pub(crate) mod packet;
pub(crate) mod param;
pub(crate) mod queue;
pub(crate) mod retransmission;
pub mod stream;
pub mod timer;
pub(crate) mod util;

pub use crate::association::association_stats::AssociationStats;
pub use crate::association::{
    AckMode, Association, AssociationHandler, AssociationState, PacketIo,
};
pub use crate::chunk::chunk_payload_data::PayloadProtocolIdentifier;
pub use crate::config::Config;
pub use crate::endpoint::{AssociationEvent, AssociationId, Endpoint, EventForwarder};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::stream::{Message, Reliability};
pub use crate::timer::{TimerHandle, TimerService};
