//! Streaming transport module
//!
//! One persistent connection per client instance, exposed as an async
//! request/response façade. Reconnect and heartbeat run as internal tasks.

pub mod client;
pub mod frame;

pub use client::{parse_ack, StreamTransport};
pub use frame::{InboundFrame, RemoteError, StreamReply, MAX_BATCH_SIZE};
