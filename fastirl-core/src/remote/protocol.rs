//! Op-code envelope of the remote-control socket

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub const RPC_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Hello = 0,
    Identify = 1,
    Identified = 2,
    Event = 5,
    Request = 6,
    RequestResponse = 7,
}

impl TryFrom<u64> for OpCode {
    type Error = u64;

    fn try_from(value: u64) -> std::result::Result<Self, u64> {
        match value {
            0 => Ok(Self::Hello),
            1 => Ok(Self::Identify),
            2 => Ok(Self::Identified),
            5 => Ok(Self::Event),
            6 => Ok(Self::Request),
            7 => Ok(Self::RequestResponse),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    op: u64,
    d: Value,
}

/// Frame `payload` under `op`.
pub fn pack<T: Serialize>(op: OpCode, payload: &T) -> Result<String> {
    let envelope = Envelope {
        op: op as u64,
        d: serde_json::to_value(payload)?,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Split a frame into its op code and payload. Unknown op codes are returned as `Err`.
pub fn unpack(text: &str) -> Result<std::result::Result<(OpCode, Value), u64>> {
    let envelope: Envelope = serde_json::from_str(text)?;
    Ok(OpCode::try_from(envelope.op).map(|op| (op, envelope.d)))
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthChallenge {
    pub challenge: String,
    pub salt: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    #[serde(default)]
    pub rpc_version: u32,
    pub authentication: Option<AuthChallenge>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identify {
    pub rpc_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request<'a> {
    pub request_type: &'a str,
    pub request_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_data: Option<&'a Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestStatus {
    pub result: bool,
    pub code: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestResponse {
    pub request_type: String,
    pub request_id: String,
    pub request_status: RequestStatus,
    #[serde(default)]
    pub response_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_type: String,
    #[serde(default)]
    pub event_data: Option<Value>,
}

/// `base64(sha256(base64(sha256(password + salt)) + challenge))`
#[must_use]
pub fn auth_response(password: &str, challenge: &AuthChallenge) -> String {
    let secret = STANDARD.encode(Sha256::digest(format!("{password}{}", challenge.salt)));
    STANDARD.encode(Sha256::digest(format!("{secret}{}", challenge.challenge)))
}

pub(crate) fn payload<T: serde::de::DeserializeOwned>(op: OpCode, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| Error::Transport(format!("malformed {op:?} payload: {e}")))
}
