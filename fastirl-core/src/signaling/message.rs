//! JSON messages exchanged over the signaling socket

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::Result;

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description (SDP)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: u32,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// Sent by the server once the socket is open
    Welcome,
    Offer { offer: SessionDescription },
    Answer { answer: SessionDescription },
    IceCandidate { candidate: IceCandidate },
}

const KNOWN_TYPES: [&str; 4] = ["welcome", "offer", "answer", "ice-candidate"];

impl SignalMessage {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse one text frame.
    ///
    /// Unknown or missing `type` values are logged and yield `Ok(None)`;
    /// a known type with a malformed body is an error.
    pub fn decode(text: &str) -> Result<Option<Self>> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value.get("type").and_then(Value::as_str);
        match kind {
            Some(kind) if KNOWN_TYPES.contains(&kind) => Ok(Some(serde_json::from_value(value)?)),
            Some(kind) => {
                warn!(message_type = %kind, "Ignoring unknown signaling message");
                Ok(None)
            }
            None => {
                warn!("Ignoring signaling message without a type");
                Ok(None)
            }
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Welcome => "welcome",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
        }
    }
}
