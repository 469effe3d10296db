//! The wire protocol: length-prefixed JSON-RPC 1.0, one request per
//! connection.
//!
//! Frames are a u32 big-endian payload length followed by the JSON body.
//! Requests carry a method name, a single position parameter, and an opaque
//! id the response echoes back.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::record::SymbolLocReq;

/// Upper bound on a single message, shared by both sides of the socket.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Method names served by the daemon.
pub mod methods {
    pub const GET_SYMBOL_DECLS: &str = "GetSymbolDecls";
    pub const GET_SYMBOL_USES: &str = "GetSymbolUses";
    pub const GET_SYMBOL_DEF: &str = "GetSymbolDef";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Vec<SymbolLocReq>,
    #[serde(default)]
    pub id: serde_json::Value,
}

impl RpcRequest {
    pub fn new(method: &str, loc: SymbolLocReq, id: u64) -> Self {
        RpcRequest {
            method: method.to_string(),
            params: vec![loc],
            id: serde_json::Value::from(id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub result: Option<Vec<SymbolLocReq>>,
    pub error: Option<String>,
    #[serde(default)]
    pub id: serde_json::Value,
}

impl RpcResponse {
    pub fn success(id: serde_json::Value, locs: Vec<SymbolLocReq>) -> Self {
        RpcResponse {
            result: Some(locs),
            error: None,
            id,
        }
    }

    pub fn failure(id: serde_json::Value, message: impl Into<String>) -> Self {
        RpcResponse {
            result: None,
            error: Some(message.into()),
            id,
        }
    }
}

pub struct MessageCodec;

impl MessageCodec {
    pub fn encode_request(request: &RpcRequest) -> Result<Vec<u8>> {
        encode_json(request)
    }

    pub fn encode_response(response: &RpcResponse) -> Result<Vec<u8>> {
        encode_json(response)
    }

    pub fn decode_request(frame: &[u8]) -> Result<RpcRequest> {
        decode_json(frame)
    }

    pub fn decode_response(frame: &[u8]) -> Result<RpcResponse> {
        decode_json(frame)
    }
}

fn encode_json<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(msg)?;
    if json.len() > MAX_MESSAGE_SIZE {
        return Err(anyhow!(
            "message size {} exceeds maximum allowed size of {} bytes",
            json.len(),
            MAX_MESSAGE_SIZE
        ));
    }

    let mut encoded = Vec::with_capacity(4 + json.len());
    encoded.extend_from_slice(&(json.len() as u32).to_be_bytes());
    encoded.extend_from_slice(&json);
    Ok(encoded)
}

fn decode_json<T: for<'de> Deserialize<'de>>(frame: &[u8]) -> Result<T> {
    if frame.len() < 4 {
        return Err(anyhow!("message too short"));
    }

    let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(anyhow!(
            "message size {len} exceeds maximum allowed size of {MAX_MESSAGE_SIZE} bytes"
        ));
    }
    if frame.len() < 4 + len {
        return Err(anyhow!("incomplete message"));
    }

    Ok(serde_json::from_slice(&frame[4..4 + len])?)
}

/// Reads one complete frame (prefix included) from the stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix).await?;

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(anyhow!(
            "message size {len} exceeds maximum allowed size of {MAX_MESSAGE_SIZE} bytes"
        ));
    }

    let mut frame = vec![0u8; 4 + len];
    frame[..4].copy_from_slice(&prefix);
    reader.read_exact(&mut frame[4..]).await?;
    Ok(frame)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}
