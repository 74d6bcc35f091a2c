//! Reconnect state machine of the signaling channel

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use url::Url;

use fastirl_core::config::SignalingConfig;
use fastirl_core::signaling::{Connection, Connector};
use fastirl_core::{ChannelStatus, Error, EventBus, Result, SignalingChannel, SystemEvent};

/// Serves queued connections, then refuses.
#[derive(Default)]
struct Flaky {
    ready: Mutex<VecDeque<Connection>>,
    calls: AtomicUsize,
}

impl Flaky {
    fn with_peer() -> (Arc<Self>, Connection) {
        let flaky = Arc::new(Self::default());
        let (ours, theirs) = Connection::pair();
        flaky.ready.lock().push_back(ours);
        (flaky, theirs)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for Flaky {
    async fn connect(&self, _url: &Url) -> Result<Connection> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.ready
            .lock()
            .pop_front()
            .ok_or_else(|| Error::Transport("connection refused".into()))
    }
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_attempts() {
    let (connector, server) = Flaky::with_peer();
    let channel = SignalingChannel::new(&SignalingConfig::default(), connector.clone());
    let mut status = channel.subscribe_status();

    channel.connect("ws://127.0.0.1:8080").await.unwrap();
    drop(server);

    status
        .wait_for(|s| *s == ChannelStatus::ReconnectFailed)
        .await
        .unwrap();
    assert_eq!(connector.calls(), 11);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.calls(), 11);
    assert_eq!(channel.status(), ChannelStatus::ReconnectFailed);
}

#[tokio::test(start_paused = true)]
async fn test_manual_disconnect_cancels_countdown() {
    let (connector, server) = Flaky::with_peer();
    let channel = SignalingChannel::new(&SignalingConfig::default(), connector.clone());

    channel.connect("ws://127.0.0.1:8080").await.unwrap();
    drop(server);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(matches!(channel.status(), ChannelStatus::Reconnecting { attempt: 1, .. }));

    channel.disconnect();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(channel.status(), ChannelStatus::Disconnected);
    assert_eq!(connector.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_scene_change_resets_attempts_through_bus() {
    let (connector, server) = Flaky::with_peer();
    let channel = SignalingChannel::new(&SignalingConfig::default(), connector.clone());
    let bus = EventBus::new();
    let _topology = channel.follow_topology(&bus);

    channel.connect("ws://127.0.0.1:8080").await.unwrap();
    drop(server);

    // Attempts 1-4 fail; attempt 5 is counting down.
    tokio::time::sleep(Duration::from_millis(13_500)).await;
    assert!(matches!(channel.status(), ChannelStatus::Reconnecting { attempt: 5, .. }));

    bus.publish(SystemEvent::TopologyChanged {
        scene: Some("BRB".into()),
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(channel.status(), ChannelStatus::Reconnecting { attempt: 1, .. }));

    // Ten more attempts are allowed after the reset.
    let mut status = channel.subscribe_status();
    status
        .wait_for(|s| *s == ChannelStatus::ReconnectFailed)
        .await
        .unwrap();
    assert_eq!(connector.calls(), 1 + 4 + 10);
}

#[tokio::test(start_paused = true)]
async fn test_topology_change_on_countdown_tick_restarts_countdown() {
    let (connector, server) = Flaky::with_peer();
    let channel = SignalingChannel::new(&SignalingConfig::default(), connector.clone());

    channel.connect("ws://127.0.0.1:8080").await.unwrap();
    drop(server);

    // Lands on the same instant as the first countdown step.
    tokio::time::sleep(Duration::from_secs(1)).await;
    channel.topology_changed();

    // Without the restart, attempt 1 would fire at 3s.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(connector.calls(), 1);
    assert_eq!(
        channel.status(),
        ChannelStatus::Reconnecting {
            attempt: 1,
            remaining_secs: 1
        }
    );

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(connector.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_topology_change_while_connected_does_not_restart_later_countdown() {
    let (connector, server) = Flaky::with_peer();
    let channel = SignalingChannel::new(&SignalingConfig::default(), connector.clone());

    channel.connect("ws://127.0.0.1:8080").await.unwrap();
    channel.topology_changed();
    assert_eq!(channel.reconnect_attempts(), 0);

    drop(server);
    tokio::time::sleep(Duration::from_millis(3100)).await;
    assert_eq!(connector.calls(), 2);
}
