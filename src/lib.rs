#![forbid(unsafe_code)]
#![warn(clippy::all)]
// #![deny(missing_docs)]

//! DTLS workflow execution engine.
//!
//! A workflow is a declarative sequence of protocol messages, each tagged
//! with the endpoint that issues it. The executor walks the sequence over a
//! datagram transport: local entries are prepared, fragmented and framed
//! into DTLS records, peer entries block until matching traffic arrives.
//! Lost flights are retransmitted, reordered fragments are reassembled, and
//! a peer that goes off script gets recorded in the trace instead of
//! crashing the run.

pub mod message;

mod config;
pub use config::{Config, ConfigBuilder};

mod digest;
pub use digest::TranscriptDigest;

mod engine;
pub use engine::{RunContext, WorkflowExecutor, WorkflowState};

mod error;
pub use error::Error;

mod flight;

mod fragment;
pub use fragment::fragment;

mod handler;
pub use handler::{
    AlertHandler, ChangeCipherSpecHandler, HandlerRegistry, MessageHandler, RawHandshakeHandler,
};

mod trace;
pub use trace::WorkflowTrace;

mod transport;
pub use transport::{Transport, UdpTransport};

pub(crate) mod util;

pub use message::{
    AlertLevel, ConnectionEnd, ContentType, MessageType, ProtocolMessage, ProtocolVersion, Record,
    RecordOverride,
};
