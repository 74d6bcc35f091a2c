//! Buffered session: a latency-buffered link to a `scheme://host:port` destination.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use super::session::{EncoderParams, FatalSink, Publisher, SessionKind};
use crate::compositor::CompositedFrame;
use crate::config::PublishingConfig;
use crate::error::{Error, Result};
use crate::quality::TransportStats;

/// Transport options applied when the link opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkOptions {
    pub latency_ms: u32,
    pub buffer_bytes: u32,
}

/// Encoder settings for the buffered transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_bps: u64,
    pub max_keyframe_interval: u32,
    pub low_latency: bool,
}

impl From<&EncoderParams> for BufferedParams {
    fn from(params: &EncoderParams) -> Self {
        Self {
            width: params.width,
            height: params.height,
            fps: params.fps,
            bitrate_bps: params.bitrate_bps(),
            max_keyframe_interval: params.max_keyframe_interval,
            low_latency: true,
        }
    }
}

#[async_trait]
pub trait BufferedLink: Send + Sync {
    async fn configure(&self, params: &BufferedParams) -> Result<()>;

    /// Begin sending after `configure`.
    async fn publish(&self) -> Result<()>;

    fn append(&self, frame: &CompositedFrame);

    async fn set_bitrate(&self, bps: u64) -> Result<()>;

    async fn outbound_video_stats(&self) -> Result<Option<TransportStats>>;

    async fn close(&self);
}

#[async_trait]
pub trait BufferedConnector: Send + Sync {
    async fn open(&self, destination: &Url, options: &LinkOptions) -> Result<Arc<dyn BufferedLink>>;
}

/// Accept only `scheme://host:port`.
pub fn parse_destination(address: &str) -> Result<Url> {
    let invalid = || {
        Error::InvalidAddress(format!(
            "invalid buffered destination {address:?}, expected scheme://host:port"
        ))
    };
    let url = Url::parse(address).map_err(|_| invalid())?;
    match (url.host_str(), url.port()) {
        (Some(host), Some(_)) if !host.is_empty() => Ok(url),
        _ => Err(invalid()),
    }
}

pub struct BufferedPublisher {
    destination: String,
    options: LinkOptions,
    connector: Arc<dyn BufferedConnector>,
    link: Mutex<Option<Arc<dyn BufferedLink>>>,
}

impl BufferedPublisher {
    #[must_use]
    pub fn new(config: &PublishingConfig, connector: Arc<dyn BufferedConnector>) -> Self {
        Self {
            destination: config.buffered_url.clone(),
            options: LinkOptions {
                latency_ms: config.buffered_latency_ms,
                buffer_bytes: config.buffered_buffer_bytes,
            },
            connector,
            link: Mutex::new(None),
        }
    }

    fn link(&self) -> Result<Arc<dyn BufferedLink>> {
        self.link.lock().clone().ok_or(Error::NotConnected)
    }
}

#[async_trait]
impl Publisher for BufferedPublisher {
    fn kind(&self) -> SessionKind {
        SessionKind::Buffered
    }

    fn destination(&self) -> &str {
        &self.destination
    }

    async fn start(&self, params: &EncoderParams, _fatal: FatalSink) -> Result<()> {
        let url = parse_destination(&self.destination)?;
        let link = self
            .connector
            .open(&url, &self.options)
            .await
            .map_err(|e| Error::Transport(format!("buffered connect failed: {e}")))?;
        *self.link.lock() = Some(Arc::clone(&link));

        link.configure(&BufferedParams::from(params)).await?;
        link.publish().await?;
        info!(
            destination = %url,
            latency_ms = self.options.latency_ms,
            bitrate_kbps = params.bitrate_kbps,
            "Buffered session publishing"
        );
        Ok(())
    }

    fn push_frame(&self, frame: &CompositedFrame) {
        if let Some(link) = self.link.lock().as_ref() {
            link.append(frame);
        }
    }

    async fn update_bitrate(&self, kbps: u32) -> Result<()> {
        let bps = u64::from(kbps) * 1000;
        debug!(bps, "Updating buffered bitrate");
        self.link()?.set_bitrate(bps).await
    }

    async fn update_format(&self, params: &EncoderParams) -> Result<()> {
        self.link()?.configure(&BufferedParams::from(params)).await
    }

    async fn outbound_video_stats(&self) -> Result<Option<TransportStats>> {
        let link = self.link.lock().clone();
        match link {
            Some(link) => link.outbound_video_stats().await,
            None => Ok(None),
        }
    }

    async fn stop(&self) {
        let link = self.link.lock().take();
        if let Some(link) = link {
            link.close().await;
        }
    }
}
