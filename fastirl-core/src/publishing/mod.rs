//! Publishing sessions
//!
//! A [`PublishingCoordinator`] owns one slot per [`SessionKind`]. Each
//! running session forwards composited frames to its [`Publisher`] and
//! adapts its bitrate with its own controller, so a failure or a bitrate
//! change in one session never touches the other.

mod buffered;
mod coordinator;
mod realtime;
mod session;

pub use buffered::{parse_destination, BufferedConnector, BufferedLink, BufferedParams, BufferedPublisher, LinkOptions};
pub use coordinator::{Backends, PublishingCoordinator, RealtimeBackend};
pub use realtime::{PeerConnection, PeerConnector, RealtimePublisher};
pub use session::{EncoderParams, FatalSink, Publisher, SessionInfo, SessionKind, SessionStatus};
