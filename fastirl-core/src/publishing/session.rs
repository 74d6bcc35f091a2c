use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::compositor::CompositedFrame;
use crate::error::Result;
use crate::quality::{QualityState, StatsProvider, TransportStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Low-latency peer connection negotiated over signaling
    Realtime,
    /// Buffered transport to a `scheme://host:port` destination
    Buffered,
}

impl SessionKind {
    pub const ALL: [Self; 2] = [Self::Realtime, Self::Buffered];
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Realtime => f.write_str("realtime"),
            Self::Buffered => f.write_str("buffered"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum SessionStatus {
    Stopped,
    Starting,
    Active,
    Error(String),
}

impl SessionStatus {
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Starting | Self::Active)
    }
}

/// Encoder configuration handed to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    /// In frames; never below 2
    pub max_keyframe_interval: u32,
}

impl EncoderParams {
    #[must_use]
    pub fn new(width: u32, height: u32, fps: u32, bitrate_kbps: u32) -> Self {
        Self {
            width,
            height,
            fps,
            bitrate_kbps,
            max_keyframe_interval: fps.max(2),
        }
    }

    #[must_use]
    pub fn from_quality(quality: &QualityState) -> Self {
        Self::new(
            quality.output_width,
            quality.output_height,
            quality.output_fps,
            quality.target_bitrate_kbps,
        )
    }

    #[must_use]
    pub const fn bitrate_bps(&self) -> u64 {
        self.bitrate_kbps as u64 * 1000
    }
}

/// Point-in-time view of one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub destination: String,
    pub encoder: Option<EncoderParams>,
}

#[derive(Debug, Clone)]
pub(crate) struct SessionFailure {
    pub kind: SessionKind,
    pub generation: u64,
    pub reason: String,
}

/// Lets a running session report a fatal error after `start` returned.
///
/// Reports from a session that has since been stopped or restarted are
/// discarded by the coordinator.
#[derive(Debug, Clone)]
pub struct FatalSink {
    kind: SessionKind,
    generation: u64,
    tx: mpsc::UnboundedSender<SessionFailure>,
}

impl FatalSink {
    pub(crate) const fn new(
        kind: SessionKind,
        generation: u64,
        tx: mpsc::UnboundedSender<SessionFailure>,
    ) -> Self {
        Self {
            kind,
            generation,
            tx,
        }
    }

    pub fn report(&self, reason: impl Into<String>) {
        let failure = SessionFailure {
            kind: self.kind,
            generation: self.generation,
            reason: reason.into(),
        };
        if self.tx.send(failure).is_err() {
            debug!(session = %self.kind, "Coordinator gone, dropping failure report");
        }
    }
}

/// One publishing destination
#[async_trait]
pub trait Publisher: Send + Sync {
    fn kind(&self) -> SessionKind;

    fn destination(&self) -> &str;

    /// Negotiate with the destination. Returns once media can flow.
    async fn start(&self, params: &EncoderParams, fatal: FatalSink) -> Result<()>;

    /// Must not block; implementations drop frames they cannot take.
    fn push_frame(&self, frame: &CompositedFrame);

    async fn update_bitrate(&self, kbps: u32) -> Result<()>;

    async fn update_format(&self, params: &EncoderParams) -> Result<()>;

    async fn outbound_video_stats(&self) -> Result<Option<TransportStats>>;

    /// Release transport resources. Safe to call more than once.
    async fn stop(&self);
}

/// Exposes a publisher's counters to the ABR sampler.
pub(crate) struct PublisherStats(pub Arc<dyn Publisher>);

#[async_trait]
impl StatsProvider for PublisherStats {
    async fn outbound_video_stats(&self) -> Result<Option<TransportStats>> {
        self.0.outbound_video_stats().await
    }
}
