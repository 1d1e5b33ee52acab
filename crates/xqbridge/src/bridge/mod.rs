//! Engine line protocol.
//!
//! - **protocol**: outbound [`Command`](protocol::Command)s and inbound
//!   [`ResponseEvent`](protocol::ResponseEvent)s
//! - **codec**: newline framing over the engine's byte streams

pub mod codec;
pub mod protocol;
