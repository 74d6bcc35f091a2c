//! Socket transport behind the signaling and remote-control channels.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};

/// An open duplex text channel.
///
/// `incoming` yields `None` once the peer closed or the socket failed;
/// dropping `outgoing` closes the socket.
#[derive(Debug)]
pub struct Connection {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

impl Connection {
    /// Two connected ends, for in-process peers and tests.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                outgoing: a_tx,
                incoming: b_rx,
            },
            Self {
                outgoing: b_tx,
                incoming: a_rx,
            },
        )
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Connection>;
}

/// WebSocket connector
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Connection> {
        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| Error::Timeout(format!("connecting to {url}")))??;
        debug!(%url, "WebSocket open");

        let (mut sink, mut stream) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                    warn!(error = %e, "WebSocket send failed");
                    return;
                }
            }
            let _ = sink.close().await;
        });

        let peer = url.to_string();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!(peer = %peer, "Ignoring non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(WsMessage::Close(frame)) => {
                        debug!(peer = %peer, ?frame, "WebSocket closed by peer");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "WebSocket read failed");
                        break;
                    }
                };
                if in_tx.send(text).is_err() {
                    break;
                }
            }
        });

        Ok(Connection {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
