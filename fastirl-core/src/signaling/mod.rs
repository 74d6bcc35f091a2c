//! Signaling for the realtime session
//!
//! JSON offer/answer/candidate exchange over a persistent socket, with a
//! reconnect state machine that survives transient drops.

mod channel;
pub mod message;
pub mod transport;

pub use channel::{ChannelStatus, SignalingChannel};
pub use message::{IceCandidate, SdpType, SessionDescription, SignalMessage};
pub use transport::{Connection, Connector, WsConnector};
