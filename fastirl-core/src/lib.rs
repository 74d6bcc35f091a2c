//! `FastIRL` media delivery core
//!
//! Takes camera frames, composites overlay content into them, and publishes
//! the result to one or more destinations while adapting quality to the
//! observed network and device conditions.
//!
//! ## Architecture
//!
//! - **`OverlayCompositor`**: aspect-fill and overlay composition, with a
//!   rate-limited overlay cache rendered under a time box
//! - **`CompositorWorker`** / **`MediaPipeline`**: drop-old frame slot in front
//!   of the compositor, and serialized output reconfiguration
//! - **`BitrateController`**: hysteresis ABR with a thermal override, fed by
//!   `NetworkQualityEstimator` samples through an `AbrMonitor`
//! - **`PublishingCoordinator`**: realtime and buffered sessions, isolated from
//!   each other, each with its own controller
//! - **`SignalingChannel`**: offer/answer/candidate exchange with a bounded
//!   reconnect countdown
//! - **`RemoteControlClient`**: request/response client whose scene switches
//!   reset the reconnect countdown through the `EventBus`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fastirl_core::{Backends, Config, CompositorWorker, EventBus, PublishingCoordinator, SessionKind};
//!
//! let config = Config::load(None)?;
//! let worker = CompositorWorker::spawn(compositor);
//! let coordinator = PublishingCoordinator::new(&config, backends, worker.output(), EventBus::new());
//! coordinator.start(SessionKind::Buffered).await?;
//! worker.push(frame);
//! ```

pub mod bootstrap;
pub mod compositor;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod publishing;
pub mod quality;
pub mod remote;
pub mod signaling;
pub mod task;

pub use compositor::{
    CompositedFrame, CompositorWorker, Frame, MediaPipeline, OverlayCompositor, OverlayLayer, OverlayStore,
};
pub use config::Config;
pub use error::{Error, Result};
pub use events::{EventBus, Subscription, SystemEvent, ThermalState};
pub use publishing::{Backends, PublishingCoordinator, SessionKind, SessionStatus};
pub use quality::{AbrMonitor, BitrateController, NetworkQualityEstimator, QualityState};
pub use remote::RemoteControlClient;
pub use signaling::{ChannelStatus, SignalingChannel};
pub use task::RepeatingTask;
