//! Frame path between the capture device and the publishing sessions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CompositedFrame, Frame, OverlayCompositor, OverlayStore};
use crate::error::{Error, Result};
use crate::events::Subscription;
use crate::quality::QualityState;

const OUTPUT_CAPACITY: usize = 4;

/// Single pending frame. A newer frame replaces an unprocessed one.
#[derive(Default)]
struct FrameSlot {
    pending: Mutex<Option<Frame>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl FrameSlot {
    fn put(&self, frame: Frame) {
        if self.pending.lock().replace(frame).is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
    }

    fn take(&self) -> Option<Frame> {
        self.pending.lock().take()
    }
}

/// Serial composition task fed by a depth-1 drop-old slot.
///
/// `push` never blocks the capture side. Composited frames go to every
/// subscriber; a subscriber that falls behind loses frames, not the worker.
pub struct CompositorWorker {
    slot: Arc<FrameSlot>,
    output: broadcast::Sender<CompositedFrame>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl CompositorWorker {
    #[must_use]
    pub fn spawn(compositor: Arc<OverlayCompositor>) -> Self {
        let slot = Arc::new(FrameSlot::default());
        let (output, _) = broadcast::channel(OUTPUT_CAPACITY);
        let token = CancellationToken::new();

        let handle = tokio::spawn(Self::run(
            compositor,
            slot.clone(),
            output.clone(),
            token.child_token(),
        ));

        Self {
            slot,
            output,
            token,
            handle,
        }
    }

    async fn run(
        compositor: Arc<OverlayCompositor>,
        slot: Arc<FrameSlot>,
        output: broadcast::Sender<CompositedFrame>,
        token: CancellationToken,
    ) {
        info!("Compositor worker started");
        'outer: loop {
            tokio::select! {
                () = token.cancelled() => break,
                () = slot.notify.notified() => {}
            }

            while let Some(frame) = slot.take() {
                let sequence = frame.sequence;
                let worker = compositor.clone();
                match tokio::task::spawn_blocking(move || worker.submit(frame)).await {
                    Ok(Ok(composited)) => {
                        // No receivers just means no session is active yet.
                        let _ = output.send(composited);
                    }
                    Ok(Err(Error::InvalidState(reason))) => {
                        debug!(sequence, %reason, "Frame dropped");
                    }
                    Ok(Err(e)) if e.is_transient() => {
                        debug!(sequence, error = %e, "Frame skipped");
                    }
                    Ok(Err(e)) => warn!(sequence, error = %e, "Frame composition failed"),
                    Err(e) => warn!(sequence, error = %e, "Composition task panicked"),
                }

                if token.is_cancelled() {
                    break 'outer;
                }
            }
        }
        info!(
            frames = compositor.frames_composited(),
            dropped = slot.dropped.load(Ordering::Relaxed),
            "Compositor worker stopped"
        );
    }

    /// Hand a frame to the worker without waiting.
    pub fn push(&self, frame: Frame) {
        self.slot.put(frame);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CompositedFrame> {
        self.output.subscribe()
    }

    #[must_use]
    pub fn output(&self) -> broadcast::Sender<CompositedFrame> {
        self.output.clone()
    }

    /// Frames replaced before the worker got to them
    #[must_use]
    pub fn dropped_frames(&self) -> u64 {
        self.slot.dropped.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for CompositorWorker {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Capture-side control the pipeline drives on resolution changes
#[async_trait]
pub trait CaptureControl: Send + Sync {
    async fn set_format(&self, width: u32, height: u32, fps: u32) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Reconfiguring,
}

#[derive(Debug, Clone)]
pub enum Reconfiguration {
    Output { width: u32, height: u32, fps: u32 },
    Overlays(bool),
    OverlaySource(OverlayStore),
}

/// Pipeline state plus at most one parked reconfiguration
struct Control {
    state: PipelineState,
    parked: Option<Reconfiguration>,
}

/// Restores the pre-reconfiguration state if the reconfiguring future is
/// dropped part way, unless `stop` ran meanwhile.
struct ReconfigureGuard<'a> {
    control: &'a Mutex<Control>,
    previous: PipelineState,
    armed: bool,
}

impl ReconfigureGuard<'_> {
    /// Leave `Reconfiguring` while the caller already holds the lock.
    fn finish(&mut self, control: &mut Control) {
        if control.state == PipelineState::Reconfiguring {
            control.state = self.previous;
        }
        self.armed = false;
    }
}

impl Drop for ReconfigureGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut control = self.control.lock();
        if control.state == PipelineState::Reconfiguring {
            control.state = self.previous;
            control.parked = None;
        }
    }
}

/// Owns the compositor lifecycle and serializes reconfiguration.
///
/// [`reconfigure`](Self::reconfigure) rejects a change while another is in
/// progress with [`Error::Busy`]. [`request`](Self::request) instead parks
/// it; the running reconfiguration applies the newest parked change before
/// it returns, older parked changes are dropped.
pub struct MediaPipeline {
    control: Mutex<Control>,
    compositor: Arc<OverlayCompositor>,
    capture: Option<Arc<dyn CaptureControl>>,
}

impl MediaPipeline {
    #[must_use]
    pub fn new(compositor: Arc<OverlayCompositor>, capture: Option<Arc<dyn CaptureControl>>) -> Self {
        Self {
            control: Mutex::new(Control {
                state: PipelineState::Idle,
                parked: None,
            }),
            compositor,
            capture,
        }
    }

    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.control.lock().state
    }

    pub fn start(&self) {
        let mut control = self.control.lock();
        if control.state == PipelineState::Idle {
            self.compositor.start();
            control.state = PipelineState::Running;
        }
    }

    pub fn stop(&self) {
        let mut control = self.control.lock();
        self.compositor.stop();
        control.state = PipelineState::Idle;
        control.parked = None;
    }

    pub async fn reconfigure(&self, change: Reconfiguration) -> Result<()> {
        self.run(change, false).await
    }

    /// Like [`reconfigure`](Self::reconfigure), but a change that arrives
    /// during another reconfiguration is parked instead of rejected.
    pub async fn request(&self, change: Reconfiguration) -> Result<()> {
        self.run(change, true).await
    }

    async fn run(&self, change: Reconfiguration, park: bool) -> Result<()> {
        let mut guard = {
            let mut control = self.control.lock();
            if control.state == PipelineState::Reconfiguring {
                if !park {
                    debug!(?change, "Reconfiguration rejected, another is in progress");
                    return Err(Error::Busy);
                }
                if let Some(replaced) = control.parked.replace(change) {
                    debug!(?replaced, "Parked reconfiguration superseded");
                }
                return Ok(());
            }
            let previous = std::mem::replace(&mut control.state, PipelineState::Reconfiguring);
            ReconfigureGuard {
                control: &self.control,
                previous,
                armed: true,
            }
        };

        let result = self.apply_logged(&change).await;

        loop {
            let next = {
                let mut control = self.control.lock();
                let next = if control.state == PipelineState::Reconfiguring {
                    control.parked.take()
                } else {
                    None
                };
                if next.is_none() {
                    guard.finish(&mut control);
                }
                next
            };
            let Some(next) = next else {
                return result;
            };
            // The caller's own result is what it gets back.
            let _ = self.apply_logged(&next).await;
        }
    }

    async fn apply_logged(&self, change: &Reconfiguration) -> Result<()> {
        let result = self.apply(change).await;
        match &result {
            Ok(()) => info!(?change, "Pipeline reconfigured"),
            Err(e) => warn!(?change, error = %e, "Pipeline reconfiguration failed"),
        }
        result
    }

    async fn apply(&self, change: &Reconfiguration) -> Result<()> {
        match change {
            Reconfiguration::Output { width, height, fps } => {
                if let Some(capture) = &self.capture {
                    capture.set_format(*width, *height, *fps).await?;
                }
                self.compositor.update_output_size(*width, *height)
            }
            Reconfiguration::Overlays(enabled) => {
                self.compositor.set_overlays_enabled(*enabled);
                Ok(())
            }
            Reconfiguration::OverlaySource(store) => {
                self.compositor.set_overlay_source(store.clone());
                Ok(())
            }
        }
    }

    /// Follow resolution changes from the bitrate controller.
    ///
    /// A change that lands during another reconfiguration is parked, so the
    /// pipeline always ends up at the most recent quality.
    pub fn follow_quality(
        self: &Arc<Self>,
        mut updates: broadcast::Receiver<QualityState>,
    ) -> Subscription {
        let pipeline = Arc::clone(self);
        Subscription::from_task(tokio::spawn(async move {
            loop {
                let quality = match updates.recv().await {
                    Ok(q) => q,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let change = Reconfiguration::Output {
                    width: quality.output_width,
                    height: quality.output_height,
                    fps: quality.output_fps,
                };
                if let Err(e) = pipeline.request(change).await {
                    debug!(error = %e, "Quality-driven reconfiguration failed");
                }
            }
        }))
    }
}
