//! Signaling channel with automatic reconnect
//!
//! ## States
//! - `Disconnected`: idle, or after a user-initiated disconnect
//! - `Connecting`: first connection attempt after `connect()`
//! - `Connected`: socket open, messages flow
//! - `Reconnecting`: counting down to the next attempt after an unexpected drop
//! - `ReconnectFailed`: attempts exhausted; disconnected until `connect()` is called again
//!
//! Every `connect()`/`disconnect()` starts a new epoch. Background work
//! belonging to an older epoch re-checks the epoch and the manual flag
//! under the control lock before each side effect, so a timer that fires
//! concurrently with `disconnect()` never reconnects.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::message::SignalMessage;
use super::transport::{Connection, Connector};
use crate::config::SignalingConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, Subscription, SystemEvent};

const MESSAGE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32, remaining_secs: u64 },
    ReconnectFailed,
}

impl ChannelStatus {
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// `Disconnected` and `ReconnectFailed` both mean no socket and no pending attempt.
    #[must_use]
    pub const fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected | Self::ReconnectFailed)
    }
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Reconnecting {
                attempt,
                remaining_secs,
            } => write!(f, "reconnecting (attempt {attempt}, {remaining_secs}s)"),
            Self::ReconnectFailed => f.write_str("reconnect failed"),
        }
    }
}

struct Control {
    epoch: u64,
    manual: bool,
    url: Option<Url>,
    outgoing: Option<mpsc::UnboundedSender<String>>,
    attempt: u32,
    /// Set by a topology change during a countdown, consumed by the countdown.
    topology_reset: bool,
    token: CancellationToken,
}

struct Shared {
    connector: Arc<dyn Connector>,
    max_attempts: u32,
    countdown_secs: u64,
    connect_timeout: Duration,
    control: Mutex<Control>,
    status_tx: watch::Sender<ChannelStatus>,
    messages: broadcast::Sender<SignalMessage>,
    topology: Notify,
}

impl Shared {
    fn is_current(&self, control: &Control, epoch: u64) -> bool {
        control.epoch == epoch && !control.manual
    }

    fn set_status(&self, status: ChannelStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    async fn open(&self, url: &Url) -> Result<Connection> {
        tokio::time::timeout(self.connect_timeout, self.connector.connect(url))
            .await
            .map_err(|_| Error::Timeout(format!("connecting to {url}")))?
    }

    /// Adopt a fresh connection if `epoch` is still current.
    fn install(&self, epoch: u64, connection: Connection) -> Option<mpsc::UnboundedReceiver<String>> {
        let mut control = self.control.lock();
        if !self.is_current(&control, epoch) {
            return None;
        }
        control.outgoing = Some(connection.outgoing);
        control.attempt = 0;
        control.topology_reset = false;
        self.set_status(ChannelStatus::Connected);
        drop(control);

        let _ = self.messages.send(SignalMessage::Welcome);
        Some(connection.incoming)
    }

    /// Read until the socket closes. Returns `false` when cancelled.
    async fn read(&self, token: &CancellationToken, incoming: &mut mpsc::UnboundedReceiver<String>) -> bool {
        loop {
            let text = tokio::select! {
                () = token.cancelled() => return false,
                text = incoming.recv() => text,
            };
            let Some(text) = text else {
                return true;
            };
            match SignalMessage::decode(&text) {
                // The channel emits its own welcome when the socket opens.
                Ok(Some(SignalMessage::Welcome)) => debug!("Server welcome received"),
                Ok(Some(message)) => {
                    debug!(message_type = message.kind(), "Signaling message received");
                    let _ = self.messages.send(message);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Dropping malformed signaling message"),
            }
        }
    }

    /// Count down and retry until connected, exhausted, or superseded.
    async fn reconnect(&self, epoch: u64, token: &CancellationToken) -> Option<mpsc::UnboundedReceiver<String>> {
        loop {
            let (attempt, url) = {
                let mut control = self.control.lock();
                if !self.is_current(&control, epoch) {
                    return None;
                }
                control.attempt += 1;
                if control.attempt > self.max_attempts {
                    control.outgoing = None;
                    self.set_status(ChannelStatus::ReconnectFailed);
                    error!(attempts = self.max_attempts, "Signaling reconnect attempts exhausted");
                    return None;
                }
                (control.attempt, control.url.clone()?)
            };

            let mut attempt = attempt;
            let mut remaining = self.countdown_secs;
            while remaining > 0 {
                // Registered before the flag check so no wakeup falls in between.
                let topology = self.topology.notified();
                tokio::pin!(topology);
                topology.as_mut().enable();

                {
                    let mut control = self.control.lock();
                    if std::mem::take(&mut control.topology_reset) {
                        attempt = control.attempt;
                        remaining = self.countdown_secs;
                        debug!(attempt, "Topology changed, reconnect countdown restarted");
                    }
                }
                self.set_status(ChannelStatus::Reconnecting {
                    attempt,
                    remaining_secs: remaining,
                });
                tokio::select! {
                    () = token.cancelled() => return None,
                    // Picked up from the flag at the top of the loop.
                    () = &mut topology => {}
                    () = tokio::time::sleep(Duration::from_secs(1)) => remaining -= 1,
                }
            }

            // Checked when the timer fires, not when it was scheduled.
            {
                let mut control = self.control.lock();
                if !self.is_current(&control, epoch) || token.is_cancelled() {
                    return None;
                }
                control.topology_reset = false;
                attempt = control.attempt;
            }
            self.set_status(ChannelStatus::Reconnecting {
                attempt,
                remaining_secs: 0,
            });

            info!(attempt, max_attempts = self.max_attempts, %url, "Reconnecting signaling channel");
            match self.open(&url).await {
                Ok(connection) => {
                    let incoming = self.install(epoch, connection);
                    if incoming.is_some() {
                        info!(attempt, "Signaling channel reconnected");
                    }
                    return incoming;
                }
                Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed"),
            }
        }
    }

    async fn drive(self: Arc<Self>, epoch: u64, token: CancellationToken, mut incoming: mpsc::UnboundedReceiver<String>) {
        loop {
            if !self.read(&token, &mut incoming).await {
                return;
            }

            {
                let mut control = self.control.lock();
                if !self.is_current(&control, epoch) {
                    return;
                }
                control.outgoing = None;
            }
            warn!("Signaling connection dropped unexpectedly");

            match self.reconnect(epoch, &token).await {
                Some(next) => incoming = next,
                None => return,
            }
        }
    }
}

/// Duplex signaling channel for the realtime session.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct SignalingChannel {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("status", &*self.shared.status_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl SignalingChannel {
    #[must_use]
    pub fn new(config: &SignalingConfig, connector: Arc<dyn Connector>) -> Self {
        let (status_tx, _) = watch::channel(ChannelStatus::Disconnected);
        let (messages, _) = broadcast::channel(MESSAGE_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                connector,
                max_attempts: config.max_reconnect_attempts,
                countdown_secs: config.reconnect_countdown_secs,
                connect_timeout: config.connect_timeout(),
                control: Mutex::new(Control {
                    epoch: 0,
                    manual: false,
                    url: None,
                    outgoing: None,
                    attempt: 0,
                    topology_reset: false,
                    token: CancellationToken::new(),
                }),
                status_tx,
                messages,
                topology: Notify::new(),
            }),
        }
    }

    /// Validate a signaling address. Only `ws` and `wss` are accepted.
    pub fn parse_address(address: &str) -> Result<Url> {
        let url = Url::parse(address)?;
        match url.scheme() {
            "ws" | "wss" if url.host_str().is_some() => Ok(url),
            _ => Err(Error::InvalidAddress(format!(
                "expected ws://host[:port] or wss://host[:port], got {address}"
            ))),
        }
    }

    /// Open the channel. An initial failure is reported, never retried.
    pub async fn connect(&self, address: &str) -> Result<()> {
        let url = Self::parse_address(address)?;
        let shared = &self.shared;

        let (epoch, token) = {
            let mut control = shared.control.lock();
            control.token.cancel();
            control.epoch += 1;
            control.manual = false;
            control.url = Some(url.clone());
            control.outgoing = None;
            control.attempt = 0;
            control.topology_reset = false;
            control.token = CancellationToken::new();
            shared.set_status(ChannelStatus::Connecting);
            (control.epoch, control.token.clone())
        };
        info!(%url, "Connecting signaling channel");

        let connection = match shared.open(&url).await {
            Ok(connection) => connection,
            Err(e) => {
                let control = shared.control.lock();
                if shared.is_current(&control, epoch) {
                    shared.set_status(ChannelStatus::Disconnected);
                }
                warn!(%url, error = %e, "Signaling connect failed");
                return Err(e);
            }
        };

        let Some(incoming) = shared.install(epoch, connection) else {
            return Err(Error::Cancelled("signaling connect superseded".to_string()));
        };
        info!(%url, "Signaling channel connected");

        tokio::spawn(Arc::clone(shared).drive(epoch, token, incoming));
        Ok(())
    }

    /// User-initiated disconnect. Cancels any pending reconnect.
    pub fn disconnect(&self) {
        let shared = &self.shared;
        let mut control = shared.control.lock();
        control.manual = true;
        control.epoch += 1;
        control.token.cancel();
        control.outgoing = None;
        control.attempt = 0;
        control.topology_reset = false;
        shared.set_status(ChannelStatus::Disconnected);
        info!("Signaling channel disconnected by user");
    }

    /// Reset the reconnect attempt count and restart a running countdown.
    pub fn topology_changed(&self) {
        let shared = &self.shared;
        {
            let mut control = shared.control.lock();
            if matches!(*shared.status_tx.borrow(), ChannelStatus::Reconnecting { .. }) {
                control.attempt = 1;
                control.topology_reset = true;
            } else {
                control.attempt = 0;
            }
        }
        shared.topology.notify_waiters();
    }

    /// Forward `TopologyChanged` events from the bus.
    pub fn follow_topology(&self, bus: &EventBus) -> Subscription {
        let channel = self.clone();
        bus.on(move |event| {
            if let SystemEvent::TopologyChanged { scene } = event {
                debug!(?scene, "Topology change observed");
                channel.topology_changed();
            }
        })
    }

    pub fn send(&self, message: &SignalMessage) -> Result<()> {
        let text = message.encode()?;
        let control = self.shared.control.lock();
        let outgoing = control
            .outgoing
            .as_ref()
            .filter(|_| self.shared.status_tx.borrow().is_connected())
            .ok_or(Error::NotConnected)?;
        outgoing.send(text).map_err(|_| Error::NotConnected)?;
        debug!(message_type = message.kind(), "Signaling message sent");
        Ok(())
    }

    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        self.shared.status_tx.borrow().clone()
    }

    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<ChannelStatus> {
        self.shared.status_tx.subscribe()
    }

    #[must_use]
    pub fn subscribe_messages(&self) -> broadcast::Receiver<SignalMessage> {
        self.shared.messages.subscribe()
    }

    /// Attempts made since the last successful connection
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.control.lock().attempt
    }
}
