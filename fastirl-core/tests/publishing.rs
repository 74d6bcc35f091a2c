//! Session isolation in the publishing coordinator

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::RgbaImage;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use url::Url;

use fastirl_core::compositor::{shared_renderer, LayerRenderer, MediaPipeline, Rotation};
use fastirl_core::config::CompositorConfig;
use fastirl_core::publishing::{
    BufferedConnector, BufferedLink, BufferedParams, EncoderParams, LinkOptions, PeerConnection,
    PeerConnector, RealtimeBackend,
};
use fastirl_core::quality::TransportStats;
use fastirl_core::signaling::{Connection, Connector, IceCandidate, SessionDescription};
use fastirl_core::{
    Backends, CompositedFrame, Config, Error, EventBus, Frame, OverlayCompositor, OverlayLayer,
    OverlayStore, PublishingCoordinator, Result, SessionKind, SessionStatus, ThermalState,
};

#[derive(Default)]
struct Link {
    frames: AtomicUsize,
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

    async fn set_bitrate(&self, _bps: u64) -> Result<()> {
        Ok(())
    }

    async fn outbound_video_stats(&self) -> Result<Option<TransportStats>> {
        Ok(None)
    }

    async fn close(&self) {}
}

struct LinkConnector(Arc<Link>);

#[async_trait]
impl BufferedConnector for LinkConnector {
    async fn open(&self, _destination: &Url, _options: &LinkOptions) -> Result<Arc<dyn BufferedLink>> {
        Ok(self.0.clone())
    }
}

struct Peer;

#[async_trait]
impl PeerConnection for Peer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer("v=0 offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer("v=0 answer"))
    }

    async fn set_remote_description(&self, _description: SessionDescription) -> Result<()> {
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
        Ok(())
    }

    async fn configure_encoder(&self, _params: &EncoderParams) -> Result<()> {
        Ok(())
    }

    async fn set_max_bitrate(&self, _kbps: u32) -> Result<()> {
        Ok(())
    }

    fn push_frame(&self, _frame: &CompositedFrame) {}

    async fn outbound_video_stats(&self) -> Result<Option<TransportStats>> {
        Ok(None)
    }

    async fn close(&self) {}
}

/// Fails peer creation when `broken` is set.
struct Peers {
    broken: bool,
}

#[async_trait]
impl PeerConnector for Peers {
    async fn create(
        &self,
        _local_candidates: mpsc::UnboundedSender<IceCandidate>,
    ) -> Result<Arc<dyn PeerConnection>> {
        if self.broken {
            return Err(Error::Negotiation("no video encoder available".into()));
        }
        Ok(Arc::new(Peer))
    }
}

#[derive(Default)]
struct Sockets {
    ready: Mutex<VecDeque<Connection>>,
}

#[async_trait]
impl Connector for Sockets {
    async fn connect(&self, _url: &Url) -> Result<Connection> {
        self.ready
            .lock()
            .pop_front()
            .ok_or_else(|| Error::Transport("connection refused".into()))
    }
}

struct Blank;

impl LayerRenderer for Blank {
    fn render(&mut self, layer: &OverlayLayer) -> Result<RgbaImage> {
        Ok(RgbaImage::new(layer.placement.width, layer.placement.height))
    }
}

fn composited() -> CompositedFrame {
    let compositor = OverlayCompositor::new(
        &CompositorConfig {
            output_width: 4,
            output_height: 4,
            ..CompositorConfig::default()
        },
        OverlayStore::new(),
        shared_renderer(Blank),
    );
    compositor.start();
    compositor
        .submit(Frame::from_rgba(RgbaImage::new(4, 4), Rotation::Deg0).unwrap())
        .unwrap()
}

struct Fixture {
    coordinator: PublishingCoordinator,
    frames: broadcast::Sender<CompositedFrame>,
    link: Arc<Link>,
}

fn fixture(sockets: Arc<Sockets>, peers: Peers) -> Fixture {
    let link = Arc::new(Link::default());
    let (frames, _) = broadcast::channel(8);
    let backends = Backends {
        realtime: Some(RealtimeBackend {
            signaling: sockets,
            peers: Arc::new(peers),
        }),
        buffered: Some(Arc::new(LinkConnector(link.clone()))),
    };
    let coordinator = PublishingCoordinator::new(&Config::default(), backends, frames.clone(), EventBus::new());
    Fixture {
        coordinator,
        frames,
        link,
    }
}

/// Answer the first offer, then hang up when told to.
fn answering_server(sockets: &Sockets) -> oneshot::Sender<()> {
    let (ours, mut server) = Connection::pair();
    sockets.ready.lock().push_back(ours);
    let (hangup_tx, hangup_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        while let Some(text) = server.incoming.recv().await {
            if text.contains(r#""type":"offer""#) {
                let answer = r#"{"type":"answer","answer":{"type":"answer","sdp":"v=0 answer"}}"#;
                let _ = server.outgoing.send(answer.to_string());
                break;
            }
        }
        let _ = hangup_rx.await;
        drop(server);
    });
    hangup_tx
}

#[tokio::test]
async fn test_failed_start_leaves_other_session_running() {
    let sockets = Arc::new(Sockets::default());
    let (ours, _server) = Connection::pair();
    sockets.ready.lock().push_back(ours);
    let f = fixture(sockets, Peers { broken: true });

    f.coordinator.start(SessionKind::Buffered).await.unwrap();
    let result = f.coordinator.start(SessionKind::Realtime).await;

    assert!(matches!(result, Err(Error::Negotiation(_))));
    assert!(matches!(
        f.coordinator.status(SessionKind::Realtime),
        SessionStatus::Error(_)
    ));
    assert_eq!(f.coordinator.status(SessionKind::Buffered), SessionStatus::Active);
    assert!(f
        .coordinator
        .last_error()
        .is_some_and(|e| e.starts_with("realtime") && e.contains("no video encoder")));

    f.frames.send(composited()).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(f.link.frames.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_signaling_exhaustion_fails_only_realtime() {
    let sockets = Arc::new(Sockets::default());
    let hangup = answering_server(&sockets);
    let f = fixture(sockets, Peers { broken: false });

    f.coordinator.start(SessionKind::Buffered).await.unwrap();
    f.coordinator.start(SessionKind::Realtime).await.unwrap();
    assert_eq!(f.coordinator.status(SessionKind::Realtime), SessionStatus::Active);

    let mut realtime = f.coordinator.subscribe_status(SessionKind::Realtime);
    hangup.send(()).unwrap();
    realtime
        .wait_for(|s| matches!(s, SessionStatus::Error(_)))
        .await
        .unwrap();

    assert_eq!(f.coordinator.status(SessionKind::Buffered), SessionStatus::Active);
    assert!(f.coordinator.controller(SessionKind::Realtime).is_none());
    assert!(f.coordinator.controller(SessionKind::Buffered).is_some());

    f.coordinator.stop(SessionKind::Realtime).await;
    assert_eq!(f.coordinator.status(SessionKind::Realtime), SessionStatus::Stopped);
}

#[tokio::test]
async fn test_bitrate_changes_stay_within_a_session() {
    let sockets = Arc::new(Sockets::default());
    let _hangup = answering_server(&sockets);
    let f = fixture(sockets, Peers { broken: false });
    f.coordinator.start(SessionKind::Buffered).await.unwrap();
    f.coordinator.start(SessionKind::Realtime).await.unwrap();

    let realtime = f.coordinator.controller(SessionKind::Realtime).unwrap();
    let buffered = f.coordinator.controller(SessionKind::Buffered).unwrap();
    realtime.set_target_kbps(1500);

    assert_eq!(realtime.target_kbps(), 1500);
    assert_eq!(buffered.target_kbps(), 4000);
}

#[tokio::test]
async fn test_resolution_step_down_reaches_compositor() {
    let f = fixture(Arc::new(Sockets::default()), Peers { broken: false });
    f.coordinator.start(SessionKind::Buffered).await.unwrap();

    let compositor = Arc::new(OverlayCompositor::new(
        &CompositorConfig {
            output_width: 1280,
            output_height: 720,
            ..CompositorConfig::default()
        },
        OverlayStore::new(),
        shared_renderer(Blank),
    ));
    let pipeline = Arc::new(MediaPipeline::new(compositor.clone(), None));
    pipeline.start();
    let _follow = pipeline.follow_quality(f.coordinator.subscribe_quality());

    let controller = f.coordinator.controller(SessionKind::Buffered).unwrap();
    controller.on_thermal(ThermalState::Critical);
    let wanted = controller.snapshot();
    assert_eq!((wanted.output_width, wanted.output_height), (960, 540));

    tokio::time::timeout(Duration::from_secs(2), async {
        while compositor.output_size() != (960, 540) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let encoder = f.coordinator.session_info(SessionKind::Buffered).encoder.unwrap();
    assert_eq!((encoder.width, encoder.height), (960, 540));
}
