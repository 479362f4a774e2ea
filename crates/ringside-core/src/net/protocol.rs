use serde::{Deserialize, Serialize};

use super::messages::{WsReq, WsResp};

/// Maximum wire message size in bytes. A full forced-resync frame with a
/// long input batch stays well under this.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024; // 64 KiB

#[derive(Debug)]
pub enum ProtocolError {
    EmptyMessage,
    PayloadTooLarge(usize),
    SerializeError(String),
    DeserializeError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "empty message"),
            Self::PayloadTooLarge(size) => {
                write!(f, "payload too large: {size} bytes (max {MAX_MESSAGE_SIZE})")
            },
            Self::SerializeError(e) => write!(f, "serialize error: {e}"),
            Self::DeserializeError(e) => write!(f, "deserialize error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

fn encode<T: Serialize>(payload: &T) -> Result<Vec<u8>, ProtocolError> {
    let bytes =
        rmp_serde::to_vec(payload).map_err(|e| ProtocolError::SerializeError(e.to_string()))?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::PayloadTooLarge(bytes.len()));
    }
    Ok(bytes)
}

fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::PayloadTooLarge(data.len()));
    }
    rmp_serde::from_slice(data).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
}

pub fn encode_ws_req(msg: &WsReq) -> Result<Vec<u8>, ProtocolError> {
    encode(msg)
}

pub fn decode_ws_req(data: &[u8]) -> Result<WsReq, ProtocolError> {
    decode(data)
}

pub fn encode_ws_resp(msg: &WsResp) -> Result<Vec<u8>, ProtocolError> {
    encode(msg)
}

pub fn decode_ws_resp(data: &[u8]) -> Result<WsResp, ProtocolError> {
    decode(data)
}
