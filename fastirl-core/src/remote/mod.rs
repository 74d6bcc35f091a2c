//! Remote-control client for a third-party broadcast tool
//!
//! Speaks an op-code envelope (`{"op": n, "d": {...}}`) over the same socket
//! transport as signaling, with a hashed challenge/salt handshake before any
//! request is honored.

mod client;
pub mod protocol;

pub use client::{RemoteControlClient, RemoteStatus};
pub use protocol::{Event as RemoteEvent, RequestResponse, RequestStatus};
