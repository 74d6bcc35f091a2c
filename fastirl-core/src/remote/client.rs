use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{
    self, auth_response, Event, Hello, Identify, OpCode, Request, RequestResponse, RPC_VERSION,
};
use crate::config::RemoteControlConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, SystemEvent};
use crate::signaling::{Connection, Connector};

const EVENT_CAPACITY: usize = 64;
const SCENE_CHANGED: &str = "CurrentProgramSceneChanged";
const SET_SCENE: &str = "SetCurrentProgramScene";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    Disconnected,
    Connecting,
    /// Socket open, handshake in progress
    Identifying,
    Identified,
}

type Pending = DashMap<String, oneshot::Sender<Result<RequestResponse>>>;

struct Shared {
    password: String,
    request_timeout: Duration,
    bus: EventBus,
    pending: Pending,
    status_tx: watch::Sender<RemoteStatus>,
    events: broadcast::Sender<Event>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    token: Mutex<CancellationToken>,
}

impl Shared {
    fn send(&self, text: String) -> Result<()> {
        let outgoing = self.outgoing.lock();
        let tx = outgoing.as_ref().ok_or(Error::NotConnected)?;
        tx.send(text).map_err(|_| Error::NotConnected)
    }

    /// Drop the socket and fail every outstanding request.
    fn teardown(&self, reason: &str) {
        self.outgoing.lock().take();
        self.status_tx.send_replace(RemoteStatus::Disconnected);
        let ids: Vec<String> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(Error::Cancelled(reason.to_string())));
            }
        }
    }

    fn handle(&self, text: &str) -> Result<()> {
        let (op, d) = match protocol::unpack(text)? {
            Ok(frame) => frame,
            Err(op) => {
                debug!(op, "Ignoring unknown op code");
                return Ok(());
            }
        };
        match op {
            OpCode::Hello => {
                let hello: Hello = protocol::payload(op, d)?;
                let authentication = hello
                    .authentication
                    .as_ref()
                    .map(|challenge| auth_response(&self.password, challenge));
                debug!(
                    server_rpc = hello.rpc_version,
                    authenticated = authentication.is_some(),
                    "Hello received, identifying"
                );
                let identify = Identify {
                    rpc_version: RPC_VERSION,
                    authentication,
                };
                self.send(protocol::pack(OpCode::Identify, &identify)?)?;
            }
            OpCode::Identified => {
                self.status_tx.send_replace(RemoteStatus::Identified);
                info!("Remote control identified");
            }
            OpCode::Event => {
                let event: Event = protocol::payload(op, d)?;
                if event.event_type == SCENE_CHANGED {
                    let scene = scene_name(event.event_data.as_ref());
                    info!(?scene, "Program scene changed");
                    self.bus.publish(SystemEvent::TopologyChanged { scene });
                }
                let _ = self.events.send(event);
            }
            OpCode::RequestResponse => {
                let response: RequestResponse = protocol::payload(op, d)?;
                match self.pending.remove(&response.request_id) {
                    Some((_, tx)) => {
                        let _ = tx.send(Ok(response));
                    }
                    None => debug!(request_id = %response.request_id, "Dropping orphaned response"),
                }
            }
            OpCode::Identify | OpCode::Request => debug!(?op, "Ignoring client-side op code"),
        }
        Ok(())
    }

    async fn run(self: Arc<Self>, mut incoming: mpsc::UnboundedReceiver<String>, token: CancellationToken) {
        loop {
            let text = tokio::select! {
                () = token.cancelled() => return,
                text = incoming.recv() => text,
            };
            let Some(text) = text else {
                break;
            };
            if let Err(e) = self.handle(&text) {
                warn!(error = %e, "Dropping remote-control frame");
            }
        }
        if !token.is_cancelled() {
            warn!("Remote control connection closed");
            self.teardown("remote control connection closed");
        }
    }
}

fn scene_name(data: Option<&Value>) -> Option<String> {
    data.and_then(|d| d.get("sceneName"))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// Request/response client for a remote broadcast tool.
///
/// Requests are refused until the handshake completes. Scene switches are
/// published on the event bus as `TopologyChanged`.
#[derive(Clone)]
pub struct RemoteControlClient {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
}

impl std::fmt::Debug for RemoteControlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteControlClient")
            .field("status", &*self.shared.status_tx.borrow())
            .field("pending", &self.shared.pending.len())
            .finish_non_exhaustive()
    }
}

impl RemoteControlClient {
    #[must_use]
    pub fn new(config: &RemoteControlConfig, connector: Arc<dyn Connector>, bus: EventBus) -> Self {
        Self {
            shared: Arc::new(Shared {
                password: config.password.clone(),
                request_timeout: config.request_timeout(),
                bus,
                pending: DashMap::new(),
                status_tx: watch::channel(RemoteStatus::Disconnected).0,
                events: broadcast::channel(EVENT_CAPACITY).0,
                outgoing: Mutex::new(None),
                token: Mutex::new(CancellationToken::new()),
            }),
            connector,
        }
    }

    /// Connect and wait for the handshake to finish.
    pub async fn connect(&self, address: &str) -> Result<()> {
        let url = url::Url::parse(address)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::InvalidAddress(format!(
                "expected ws://host:port or wss://host:port, got {address}"
            )));
        }
        let shared = &self.shared;
        let token = {
            let mut token = shared.token.lock();
            token.cancel();
            *token = CancellationToken::new();
            token.clone()
        };
        shared.teardown("remote control reconnecting");
        shared.status_tx.send_replace(RemoteStatus::Connecting);

        let Connection { outgoing, incoming } = match self.connector.connect(&url).await {
            Ok(connection) => connection,
            Err(e) => {
                shared.status_tx.send_replace(RemoteStatus::Disconnected);
                return Err(e);
            }
        };
        *shared.outgoing.lock() = Some(outgoing);
        shared.status_tx.send_replace(RemoteStatus::Identifying);
        tokio::spawn(Arc::clone(shared).run(incoming, token.clone()));

        let mut status = shared.status_tx.subscribe();
        let identified = tokio::time::timeout(
            shared.request_timeout,
            status.wait_for(|s| matches!(s, RemoteStatus::Identified | RemoteStatus::Disconnected)),
        )
        .await;
        match identified {
            Ok(Ok(s)) if *s == RemoteStatus::Identified => {
                info!(%url, "Remote control connected");
                Ok(())
            }
            Ok(_) => Err(Error::Authentication(
                "connection closed before identification".to_string(),
            )),
            Err(_) => {
                self.disconnect();
                Err(Error::Timeout("waiting for identification".to_string()))
            }
        }
    }

    pub fn disconnect(&self) {
        self.shared.token.lock().cancel();
        self.shared.teardown("remote control disconnected");
    }

    /// Send one request and wait for its response.
    pub async fn request(&self, request_type: &str, data: Option<Value>) -> Result<RequestResponse> {
        let shared = &self.shared;
        if *shared.status_tx.borrow() != RemoteStatus::Identified {
            return Err(Error::NotConnected);
        }

        let request_id = Uuid::new_v4().to_string();
        let text = protocol::pack(
            OpCode::Request,
            &Request {
                request_type,
                request_id: &request_id,
                request_data: data.as_ref(),
            },
        )?;
        let (tx, rx) = oneshot::channel();
        shared.pending.insert(request_id.clone(), tx);
        if let Err(e) = shared.send(text) {
            shared.pending.remove(&request_id);
            return Err(e);
        }
        debug!(%request_type, %request_id, "Request sent");

        let response = match tokio::time::timeout(shared.request_timeout, rx).await {
            Ok(Ok(response)) => response?,
            Ok(Err(_)) => return Err(Error::Cancelled(format!("{request_type} abandoned"))),
            Err(_) => {
                shared.pending.remove(&request_id);
                return Err(Error::Timeout(format!("waiting for {request_type} response")));
            }
        };

        if response.request_type == SET_SCENE && response.request_status.result {
            let scene = scene_name(data.as_ref());
            shared.bus.publish(SystemEvent::TopologyChanged { scene });
        }
        Ok(response)
    }

    #[must_use]
    pub fn status(&self) -> RemoteStatus {
        *self.shared.status_tx.borrow()
    }

    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<RemoteStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Every event the server sends
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }
}
