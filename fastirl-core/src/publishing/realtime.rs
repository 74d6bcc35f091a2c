//! Realtime session: a peer connection negotiated over the signaling channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::session::{EncoderParams, FatalSink, Publisher, SessionKind};
use crate::compositor::CompositedFrame;
use crate::error::{Error, Result};
use crate::quality::TransportStats;
use crate::signaling::{ChannelStatus, IceCandidate, SessionDescription, SignalMessage, SignalingChannel};

/// Media engine side of one peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Answer the remote description set last.
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn configure_encoder(&self, params: &EncoderParams) -> Result<()>;

    async fn set_max_bitrate(&self, kbps: u32) -> Result<()>;

    fn push_frame(&self, frame: &CompositedFrame);

    async fn outbound_video_stats(&self) -> Result<Option<TransportStats>>;

    async fn close(&self);
}

/// Creates peer connections. Locally gathered candidates go to `local_candidates`.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create(
        &self,
        local_candidates: mpsc::UnboundedSender<IceCandidate>,
    ) -> Result<Arc<dyn PeerConnection>>;
}

pub struct RealtimePublisher {
    address: String,
    signaling: SignalingChannel,
    connector: Arc<dyn PeerConnector>,
    negotiation_timeout: Duration,
    peer: Mutex<Option<Arc<dyn PeerConnection>>>,
    token: CancellationToken,
}

impl RealtimePublisher {
    #[must_use]
    pub fn new(
        address: impl Into<String>,
        signaling: SignalingChannel,
        connector: Arc<dyn PeerConnector>,
        negotiation_timeout: Duration,
    ) -> Self {
        Self {
            address: address.into(),
            signaling,
            connector,
            negotiation_timeout,
            peer: Mutex::new(None),
            token: CancellationToken::new(),
        }
    }

    fn peer(&self) -> Result<Arc<dyn PeerConnection>> {
        self.peer.lock().clone().ok_or(Error::NotConnected)
    }

    async fn negotiate(
        &self,
        peer: &Arc<dyn PeerConnection>,
        messages: &mut broadcast::Receiver<SignalMessage>,
    ) -> Result<()> {
        let offer = peer.create_offer().await?;
        self.signaling.send(&SignalMessage::Offer { offer })?;
        debug!("Offer sent, awaiting answer");

        let (answer, pending) = tokio::time::timeout(self.negotiation_timeout, await_answer(messages))
            .await
            .map_err(|_| Error::Negotiation("timed out waiting for answer".to_string()))??;

        peer.set_remote_description(answer)
            .await
            .map_err(|e| Error::Negotiation(e.to_string()))?;
        for candidate in pending {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                warn!(error = %e, "Failed to apply early ICE candidate");
            }
        }
        Ok(())
    }
}

/// Wait for the answer, keeping candidates that arrive before it.
async fn await_answer(
    messages: &mut broadcast::Receiver<SignalMessage>,
) -> Result<(SessionDescription, Vec<IceCandidate>)> {
    let mut pending = Vec::new();
    loop {
        match messages.recv().await {
            Ok(SignalMessage::Answer { answer }) => return Ok((answer, pending)),
            Ok(SignalMessage::IceCandidate { candidate }) => pending.push(candidate),
            Ok(other) => debug!(message_type = other.kind(), "Ignored during negotiation"),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Signaling receiver lagged during negotiation");
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(Error::Negotiation("signaling channel closed".to_string()));
            }
        }
    }
}

async fn handle_message(
    peer: &Arc<dyn PeerConnection>,
    signaling: &SignalingChannel,
    message: SignalMessage,
) -> Result<()> {
    match message {
        SignalMessage::Offer { offer } => {
            peer.set_remote_description(offer).await?;
            let answer = peer.create_answer().await?;
            signaling.send(&SignalMessage::Answer { answer })?;
            info!("Answered remote offer");
        }
        SignalMessage::Answer { answer } => peer.set_remote_description(answer).await?,
        SignalMessage::IceCandidate { candidate } => peer.add_ice_candidate(candidate).await?,
        SignalMessage::Welcome => {}
    }
    Ok(())
}

/// Trickle candidates out, handle renegotiation, and watch for a dead channel.
async fn run_signaling(
    peer: Arc<dyn PeerConnection>,
    signaling: SignalingChannel,
    mut messages: broadcast::Receiver<SignalMessage>,
    mut candidates: mpsc::UnboundedReceiver<IceCandidate>,
    mut status: watch::Receiver<ChannelStatus>,
    token: CancellationToken,
    fatal: FatalSink,
) {
    loop {
        tokio::select! {
            () = token.cancelled() => return,
            Some(candidate) = candidates.recv() => {
                if let Err(e) = signaling.send(&SignalMessage::IceCandidate { candidate }) {
                    debug!(error = %e, "Local candidate not sent");
                }
            }
            received = messages.recv() => match received {
                Ok(message) => {
                    if let Err(e) = handle_message(&peer, &signaling, message).await {
                        warn!(error = %e, "Failed to handle signaling message");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "Signaling receiver lagged"),
                Err(broadcast::error::RecvError::Closed) => return,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    return;
                }
                if *status.borrow_and_update() == ChannelStatus::ReconnectFailed {
                    fatal.report("signaling reconnect attempts exhausted");
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl Publisher for RealtimePublisher {
    fn kind(&self) -> SessionKind {
        SessionKind::Realtime
    }

    fn destination(&self) -> &str {
        &self.address
    }

    async fn start(&self, params: &EncoderParams, fatal: FatalSink) -> Result<()> {
        SignalingChannel::parse_address(&self.address)?;
        if !self.signaling.status().is_connected() {
            self.signaling.connect(&self.address).await?;
        }
        let mut messages = self.signaling.subscribe_messages();

        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        let peer = self.connector.create(candidate_tx).await?;
        *self.peer.lock() = Some(Arc::clone(&peer));

        peer.configure_encoder(params).await?;
        self.negotiate(&peer, &mut messages).await?;
        info!(address = %self.address, "Realtime session negotiated");

        tokio::spawn(run_signaling(
            peer,
            self.signaling.clone(),
            messages,
            candidate_rx,
            self.signaling.subscribe_status(),
            self.token.child_token(),
            fatal,
        ));
        Ok(())
    }

    fn push_frame(&self, frame: &CompositedFrame) {
        if let Some(peer) = self.peer.lock().as_ref() {
            peer.push_frame(frame);
        }
    }

    async fn update_bitrate(&self, kbps: u32) -> Result<()> {
        self.peer()?.set_max_bitrate(kbps).await
    }

    async fn update_format(&self, params: &EncoderParams) -> Result<()> {
        self.peer()?.configure_encoder(params).await
    }

    async fn outbound_video_stats(&self) -> Result<Option<TransportStats>> {
        let peer = self.peer.lock().clone();
        match peer {
            Some(peer) => peer.outbound_video_stats().await,
            None => Ok(None),
        }
    }

    async fn stop(&self) {
        self.token.cancel();
        let peer = self.peer.lock().take();
        if let Some(peer) = peer {
            peer.close().await;
        }
        self.signaling.disconnect();
    }
}
