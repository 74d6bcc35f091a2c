//! Process-level event bus
//!
//! Device signals (thermal pressure) and remote-control notifications (scene
//! switches) are published here. Components receive the bus at construction
//! time; there is no global instance.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

const EVENT_BUS_CAPACITY: usize = 64;

/// Device thermal pressure, mildest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThermalState {
    Nominal,
    Fair,
    Serious,
    Critical,
}

impl std::fmt::Display for ThermalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Nominal => "nominal",
            Self::Fair => "fair",
            Self::Serious => "serious",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemEvent {
    Thermal(ThermalState),
    /// The broadcast layout changed (e.g. the operator switched scenes)
    TopologyChanged { scene: Option<String> },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event, returning how many receivers saw it.
    pub fn publish(&self, event: SystemEvent) -> usize {
        debug!(?event, "Publishing system event");
        self.tx.send(event).unwrap_or(0)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }

    /// Run `handler` for every event until the returned handle is dropped.
    ///
    /// Lagged receivers skip the missed events and keep going.
    pub fn on<F>(&self, mut handler: F) -> Subscription
    where
        F: FnMut(SystemEvent) + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => handler(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { task: Some(task) }
    }
}

/// Revocable handle for a forwarding task. Revoked on drop.
#[derive(Debug)]
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn from_task(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    pub fn revoke(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.revoke();
    }
}
