//! Lifecycle of the publishing sessions
//!
//! Each session kind has a slot holding its status and, while running, its
//! publisher, bitrate controller and background tasks. Every `start`, `stop`
//! and fatal error bumps the slot's generation; work that completes under an
//! older generation is discarded and its resources released.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::buffered::{BufferedConnector, BufferedPublisher};
use super::realtime::{PeerConnector, RealtimePublisher};
use super::session::{
    EncoderParams, FatalSink, Publisher, PublisherStats, SessionFailure, SessionInfo, SessionKind,
    SessionStatus,
};
use crate::compositor::CompositedFrame;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{EventBus, Subscription};
use crate::quality::{follow_thermal, AbrMonitor, BitrateController, QualityState};
use crate::signaling::{ChannelStatus, Connector, SignalingChannel};

const QUALITY_CAPACITY: usize = 16;

/// Transport backends for the realtime session
pub struct RealtimeBackend {
    pub signaling: Arc<dyn Connector>,
    pub peers: Arc<dyn PeerConnector>,
}

/// Transports available to the coordinator. A kind without a backend fails to start.
#[derive(Default)]
pub struct Backends {
    pub realtime: Option<RealtimeBackend>,
    pub buffered: Option<Arc<dyn BufferedConnector>>,
}

struct Running {
    publisher: Arc<dyn Publisher>,
    controller: Arc<BitrateController>,
    encoder: Arc<Mutex<EncoderParams>>,
    signaling: Option<SignalingChannel>,
    token: CancellationToken,
    monitor: Option<AbrMonitor>,
    _subscriptions: Vec<Subscription>,
}

impl Running {
    async fn shutdown(self) {
        self.token.cancel();
        if let Some(monitor) = &self.monitor {
            monitor.stop();
        }
        self.publisher.stop().await;
    }
}

struct Slot {
    generation: u64,
    status: watch::Sender<SessionStatus>,
    running: Option<Running>,
}

impl Slot {
    fn set_status(&self, status: SessionStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

/// A publisher built for one start attempt, with what must live alongside it.
struct Prepared {
    publisher: Arc<dyn Publisher>,
    signaling: Option<SignalingChannel>,
    subscriptions: Vec<Subscription>,
}

struct Inner {
    config: Config,
    backends: Backends,
    frames: broadcast::Sender<CompositedFrame>,
    bus: EventBus,
    slots: Mutex<HashMap<SessionKind, Slot>>,
    last_error: watch::Sender<Option<String>>,
    quality: broadcast::Sender<QualityState>,
    failures: mpsc::UnboundedSender<SessionFailure>,
}

impl Inner {
    fn with_slot<T>(&self, kind: SessionKind, f: impl FnOnce(&mut Slot) -> T) -> T {
        let mut slots = self.slots.lock();
        let slot = slots.entry(kind).or_insert_with(|| Slot {
            generation: 0,
            status: watch::channel(SessionStatus::Stopped).0,
            running: None,
        });
        f(slot)
    }

    fn prepare(&self, kind: SessionKind) -> Result<Prepared> {
        match kind {
            SessionKind::Realtime => {
                let backend = self.backends.realtime.as_ref().ok_or_else(|| {
                    Error::Configuration("no realtime transport configured".to_string())
                })?;
                let signaling =
                    SignalingChannel::new(&self.config.signaling, Arc::clone(&backend.signaling));
                let topology = signaling.follow_topology(&self.bus);
                let publisher = RealtimePublisher::new(
                    self.config.publishing.realtime_url.clone(),
                    signaling.clone(),
                    Arc::clone(&backend.peers),
                    self.config.signaling.negotiation_timeout(),
                );
                Ok(Prepared {
                    publisher: Arc::new(publisher),
                    signaling: Some(signaling),
                    subscriptions: vec![topology],
                })
            }
            SessionKind::Buffered => {
                let connector = self.backends.buffered.as_ref().ok_or_else(|| {
                    Error::Configuration("no buffered transport configured".to_string())
                })?;
                let publisher = BufferedPublisher::new(&self.config.publishing, Arc::clone(connector));
                Ok(Prepared {
                    publisher: Arc::new(publisher),
                    signaling: None,
                    subscriptions: Vec::new(),
                })
            }
        }
    }

    fn launch(&self, kind: SessionKind, prepared: Prepared, controller: Arc<BitrateController>) -> Running {
        let Prepared {
            publisher,
            signaling,
            mut subscriptions,
        } = prepared;
        let token = CancellationToken::new();
        let encoder = Arc::new(Mutex::new(EncoderParams::from_quality(&controller.snapshot())));

        tokio::spawn(forward_frames(
            kind,
            self.frames.subscribe(),
            Arc::clone(&publisher),
            token.child_token(),
        ));
        tokio::spawn(apply_quality(
            kind,
            controller.subscribe_bitrate(),
            controller.subscribe_quality(),
            Arc::clone(&publisher),
            Arc::clone(&encoder),
            self.quality.clone(),
            token.child_token(),
        ));

        let monitor = self.config.abr.enabled.then(|| {
            AbrMonitor::spawn(
                Arc::new(PublisherStats(Arc::clone(&publisher))),
                Arc::clone(&controller),
            )
        });
        subscriptions.push(follow_thermal(Arc::clone(&controller), &self.bus));

        Running {
            publisher,
            controller,
            encoder,
            signaling,
            token,
            monitor,
            _subscriptions: subscriptions,
        }
    }

    /// Move a running or starting session to `Error`, if `generation` is still current.
    fn fail(&self, kind: SessionKind, generation: u64, reason: &str) -> Option<Option<Running>> {
        self.with_slot(kind, |slot| {
            if slot.generation != generation || !slot.status.borrow().is_running() {
                debug!(session = %kind, generation, "Discarding failure from a superseded session");
                return None;
            }
            slot.generation += 1;
            slot.set_status(SessionStatus::Error(reason.to_string()));
            self.last_error.send_replace(Some(format!("{kind}: {reason}")));
            error!(session = %kind, %reason, "Session failed");
            Some(slot.running.take())
        })
    }
}

async fn forward_frames(
    kind: SessionKind,
    mut frames: broadcast::Receiver<CompositedFrame>,
    publisher: Arc<dyn Publisher>,
    token: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = token.cancelled() => return,
            frame = frames.recv() => frame,
        };
        match frame {
            Ok(frame) => publisher.push_frame(&frame),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!(session = %kind, skipped = n, "Session fell behind the compositor");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Apply controller decisions to this session only.
async fn apply_quality(
    kind: SessionKind,
    mut bitrate: broadcast::Receiver<u32>,
    mut quality: broadcast::Receiver<QualityState>,
    publisher: Arc<dyn Publisher>,
    encoder: Arc<Mutex<EncoderParams>>,
    resize: broadcast::Sender<QualityState>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = token.cancelled() => return,
            kbps = bitrate.recv() => match kbps {
                Ok(kbps) => {
                    encoder.lock().bitrate_kbps = kbps;
                    if let Err(e) = publisher.update_bitrate(kbps).await {
                        warn!(session = %kind, kbps, error = %e, "Bitrate update failed");
                    } else {
                        info!(session = %kind, kbps, "Bitrate updated");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            },
            state = quality.recv() => match state {
                Ok(state) => {
                    let next = EncoderParams::from_quality(&state);
                    let reformat = {
                        let mut current = encoder.lock();
                        let changed = (current.width, current.height, current.fps)
                            != (next.width, next.height, next.fps);
                        *current = next;
                        changed
                    };
                    if reformat {
                        if let Err(e) = publisher.update_format(&next).await {
                            warn!(session = %kind, error = %e, "Encoder format update failed");
                        }
                        let _ = resize.send(state);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

async fn watch_failures(inner: Weak<Inner>, mut failures: mpsc::UnboundedReceiver<SessionFailure>) {
    while let Some(failure) = failures.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if let Some(Some(running)) = inner.fail(failure.kind, failure.generation, &failure.reason) {
            running.shutdown().await;
        }
    }
}

/// Owns the publishing sessions and keeps them isolated from each other.
pub struct PublishingCoordinator {
    inner: Arc<Inner>,
    failure_task: JoinHandle<()>,
}

impl std::fmt::Debug for PublishingCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishingCoordinator")
            .field("last_error", &*self.inner.last_error.borrow())
            .finish_non_exhaustive()
    }
}

impl PublishingCoordinator {
    /// `frames` is the compositor output every running session forwards.
    #[must_use]
    pub fn new(
        config: &Config,
        backends: Backends,
        frames: broadcast::Sender<CompositedFrame>,
        bus: EventBus,
    ) -> Self {
        let (failures, failure_rx) = mpsc::unbounded_channel();
        let slots = SessionKind::ALL
            .into_iter()
            .map(|kind| {
                let slot = Slot {
                    generation: 0,
                    status: watch::channel(SessionStatus::Stopped).0,
                    running: None,
                };
                (kind, slot)
            })
            .collect();
        let inner = Arc::new(Inner {
            config: config.clone(),
            backends,
            frames,
            bus,
            slots: Mutex::new(slots),
            last_error: watch::channel(None).0,
            quality: broadcast::channel(QUALITY_CAPACITY).0,
            failures,
        });
        let failure_task = tokio::spawn(watch_failures(Arc::downgrade(&inner), failure_rx));
        Self { inner, failure_task }
    }

    /// Start a session. Does nothing if it is already starting or active.
    ///
    /// Returns `Err(Cancelled)` if the session was stopped while negotiating.
    pub async fn start(&self, kind: SessionKind) -> Result<()> {
        let inner = &self.inner;
        let generation = inner.with_slot(kind, |slot| {
            if slot.status.borrow().is_running() {
                return None;
            }
            slot.generation += 1;
            slot.set_status(SessionStatus::Starting);
            Some(slot.generation)
        });
        let Some(generation) = generation else {
            debug!(session = %kind, "Start ignored, session already running");
            return Ok(());
        };
        inner.last_error.send_replace(None);
        info!(session = %kind, generation, "Starting session");

        let prepared = match inner.prepare(kind) {
            Ok(prepared) => prepared,
            Err(e) => {
                inner.fail(kind, generation, &e.to_string());
                return Err(e);
            }
        };
        let controller = Arc::new(BitrateController::new(inner.config.abr.clone()));
        let params = EncoderParams::from_quality(&controller.snapshot());
        let publisher = Arc::clone(&prepared.publisher);
        let fatal = FatalSink::new(kind, generation, inner.failures.clone());

        let result = publisher.start(&params, fatal).await;

        let outcome = inner.with_slot(kind, |slot| {
            if slot.generation != generation {
                return Err(Error::Cancelled(format!("{kind} session start superseded")));
            }
            match result {
                Ok(()) => {
                    slot.running = Some(inner.launch(kind, prepared, controller));
                    slot.set_status(SessionStatus::Active);
                    Ok(())
                }
                Err(e) => {
                    let reason = e.to_string();
                    slot.set_status(SessionStatus::Error(reason.clone()));
                    inner.last_error.send_replace(Some(format!("{kind}: {reason}")));
                    Err(e)
                }
            }
        });

        match &outcome {
            Ok(()) => info!(session = %kind, destination = publisher.destination(), "Session active"),
            Err(Error::Cancelled(_)) => {
                debug!(session = %kind, generation, "Discarding superseded session start");
                publisher.stop().await;
            }
            Err(e) => {
                error!(session = %kind, error = %e, "Session failed to start");
                publisher.stop().await;
            }
        }
        outcome
    }

    /// Stop a session. Idempotent.
    pub async fn stop(&self, kind: SessionKind) {
        let running = self.inner.with_slot(kind, |slot| {
            slot.generation += 1;
            slot.set_status(SessionStatus::Stopped);
            slot.running.take()
        });
        if let Some(running) = running {
            running.shutdown().await;
            info!(session = %kind, "Session stopped");
        }
    }

    pub async fn stop_all(&self) {
        for kind in SessionKind::ALL {
            self.stop(kind).await;
        }
    }

    /// Move a running session to `Error` and release it.
    pub async fn report_fatal(&self, kind: SessionKind, reason: &str) {
        let generation = self.inner.with_slot(kind, |slot| slot.generation);
        if let Some(Some(running)) = self.inner.fail(kind, generation, reason) {
            running.shutdown().await;
        }
    }

    #[must_use]
    pub fn status(&self, kind: SessionKind) -> SessionStatus {
        self.inner.with_slot(kind, |slot| slot.status.borrow().clone())
    }

    #[must_use]
    pub fn subscribe_status(&self, kind: SessionKind) -> watch::Receiver<SessionStatus> {
        self.inner.with_slot(kind, |slot| slot.status.subscribe())
    }

    #[must_use]
    pub fn session_info(&self, kind: SessionKind) -> SessionInfo {
        self.inner.with_slot(kind, |slot| {
            let destination = match kind {
                SessionKind::Realtime => &self.inner.config.publishing.realtime_url,
                SessionKind::Buffered => &self.inner.config.publishing.buffered_url,
            };
            SessionInfo {
                kind,
                status: slot.status.borrow().clone(),
                destination: destination.clone(),
                encoder: slot.running.as_ref().map(|running| *running.encoder.lock()),
            }
        })
    }

    /// Most recent session error, cleared by the next `start`
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.borrow().clone()
    }

    #[must_use]
    pub fn subscribe_last_error(&self) -> watch::Receiver<Option<String>> {
        self.inner.last_error.subscribe()
    }

    /// Output format changes from any session, for resizing the compositor
    #[must_use]
    pub fn subscribe_quality(&self) -> broadcast::Receiver<QualityState> {
        self.inner.quality.subscribe()
    }

    #[must_use]
    pub fn controller(&self, kind: SessionKind) -> Option<Arc<BitrateController>> {
        self.inner
            .with_slot(kind, |slot| slot.running.as_ref().map(|r| Arc::clone(&r.controller)))
    }

    /// Signaling state of the active realtime session
    #[must_use]
    pub fn signaling_status(&self) -> Option<ChannelStatus> {
        self.inner.with_slot(SessionKind::Realtime, |slot| {
            slot.running
                .as_ref()
                .and_then(|r| r.signaling.as_ref())
                .map(SignalingChannel::status)
        })
    }

    /// Live stats of a running session's ABR sampler
    #[must_use]
    pub fn live_stats(&self, kind: SessionKind) -> Option<watch::Receiver<Option<crate::quality::NetworkSample>>> {
        self.inner.with_slot(kind, |slot| {
            slot.running
                .as_ref()
                .and_then(|r| r.monitor.as_ref())
                .map(AbrMonitor::live_stats)
        })
    }
}

impl Drop for PublishingCoordinator {
    fn drop(&mut self) {
        self.failure_task.abort();
        let handle = tokio::runtime::Handle::try_current().ok();
        let mut slots = self.inner.slots.lock();
        for slot in slots.values_mut() {
            if let Some(running) = slot.running.take() {
                running.token.cancel();
                if let Some(handle) = &handle {
                    handle.spawn(running.shutdown());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::CompositedFrame;
    use crate::publishing::buffered::{BufferedLink, BufferedParams, LinkOptions};
    use crate::quality::TransportStats;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use url::Url;

    #[derive(Default)]
    struct Link {
        frames: AtomicUsize,
        bitrate: Mutex<Vec<u64>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl BufferedLink for Link {
        async fn configure(&self, _params: &BufferedParams) -> Result<()> {
            Ok(())
        }

        async fn publish(&self) -> Result<()> {
            Ok(())
        }

        fn append(&self, _frame: &CompositedFrame) {
            self.frames.fetch_add(1, Ordering::SeqCst);
        }

        async fn set_bitrate(&self, bps: u64) -> Result<()> {
            self.bitrate.lock().push(bps);
            Ok(())
        }

        async fn outbound_video_stats(&self) -> Result<Option<TransportStats>> {
            Ok(None)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Opens `link`, optionally waiting for `gate` first.
    struct Gated {
        link: Arc<Link>,
        gate: Option<Arc<Notify>>,
        opens: AtomicUsize,
    }

    #[async_trait]
    impl BufferedConnector for Gated {
        async fn open(&self, _destination: &Url, _options: &LinkOptions) -> Result<Arc<dyn BufferedLink>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(self.link.clone())
        }
    }

    fn coordinator(connector: Arc<Gated>) -> (PublishingCoordinator, broadcast::Sender<CompositedFrame>) {
        let (frames, _) = broadcast::channel(4);
        let backends = Backends {
            realtime: None,
            buffered: Some(connector),
        };
        let coordinator = PublishingCoordinator::new(&Config::default(), backends, frames.clone(), EventBus::new());
        (coordinator, frames)
    }

    fn gated(gate: Option<Arc<Notify>>) -> (Arc<Gated>, Arc<Link>) {
        let link = Arc::new(Link::default());
        let connector = Arc::new(Gated {
            link: link.clone(),
            gate,
            opens: AtomicUsize::new(0),
        });
        (connector, link)
    }

    #[tokio::test]
    async fn test_start_is_noop_when_active() {
        let (connector, _link) = gated(None);
        let (coordinator, _frames) = coordinator(connector.clone());

        coordinator.start(SessionKind::Buffered).await.unwrap();
        coordinator.start(SessionKind::Buffered).await.unwrap();
        assert_eq!(coordinator.status(SessionKind::Buffered), SessionStatus::Active);
        assert_eq!(connector.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (connector, link) = gated(None);
        let (coordinator, _frames) = coordinator(connector);

        coordinator.stop(SessionKind::Buffered).await;
        coordinator.start(SessionKind::Buffered).await.unwrap();
        coordinator.stop(SessionKind::Buffered).await;
        coordinator.stop(SessionKind::Buffered).await;
        assert_eq!(coordinator.status(SessionKind::Buffered), SessionStatus::Stopped);
        assert!(link.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stop_during_start_discards_completion() {
        let gate = Arc::new(Notify::new());
        let (connector, link) = gated(Some(gate.clone()));
        let (coordinator, _frames) = coordinator(connector);
        let coordinator = Arc::new(coordinator);

        let starting = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.start(SessionKind::Buffered).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(coordinator.status(SessionKind::Buffered), SessionStatus::Starting);

        coordinator.stop(SessionKind::Buffered).await;
        gate.notify_one();

        assert!(matches!(starting.await.unwrap(), Err(Error::Cancelled(_))));
        assert_eq!(coordinator.status(SessionKind::Buffered), SessionStatus::Stopped);
        assert!(link.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_frames_and_bitrate_reach_the_session() {
        let (connector, link) = gated(None);
        let (coordinator, frames) = coordinator(connector);
        coordinator.start(SessionKind::Buffered).await.unwrap();

        let image = image::RgbaImage::new(4, 4);
        let source = crate::compositor::Frame::from_rgba(image.clone(), crate::compositor::Rotation::Deg0).unwrap();
        frames.send(CompositedFrame::from_image(image, &source)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(link.frames.load(Ordering::SeqCst), 1);

        let controller = coordinator.controller(SessionKind::Buffered).unwrap();
        controller.set_target_kbps(2500);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(link.bitrate.lock().as_slice(), &[2_500_000]);
        assert_eq!(
            coordinator.session_info(SessionKind::Buffered).encoder.unwrap().bitrate_kbps,
            2500
        );
    }

    #[tokio::test]
    async fn test_fatal_error_moves_to_error_then_stopped() {
        let (connector, link) = gated(None);
        let (coordinator, _frames) = coordinator(connector);
        coordinator.start(SessionKind::Buffered).await.unwrap();

        coordinator.report_fatal(SessionKind::Buffered, "link lost").await;
        assert_eq!(
            coordinator.status(SessionKind::Buffered),
            SessionStatus::Error("link lost".into())
        );
        assert_eq!(coordinator.last_error().as_deref(), Some("buffered: link lost"));
        assert!(link.closed.load(Ordering::SeqCst));
        assert!(coordinator.controller(SessionKind::Buffered).is_none());

        coordinator.stop(SessionKind::Buffered).await;
        assert_eq!(coordinator.status(SessionKind::Buffered), SessionStatus::Stopped);

        coordinator.start(SessionKind::Buffered).await.unwrap();
        assert_eq!(coordinator.last_error(), None);
    }

    #[tokio::test]
    async fn test_missing_backend_is_an_error() {
        let (connector, _link) = gated(None);
        let (coordinator, _frames) = coordinator(connector);

        let result = coordinator.start(SessionKind::Realtime).await;
        assert!(matches!(result, Err(Error::Configuration(_))));
        assert!(matches!(
            coordinator.status(SessionKind::Realtime),
            SessionStatus::Error(_)
        ));
        assert_eq!(coordinator.status(SessionKind::Buffered), SessionStatus::Stopped);
    }
}
