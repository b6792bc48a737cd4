//! Wire format for the daemon RPC: 4-byte big-endian length prefix followed
//! by a JSON payload (SPEC_FULL.md §4.12). No teacher counterpart — the
//! teacher spoke HTTP/JSON over axum; this is the from-scratch framed
//! protocol the spec's local-socket transport requires.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{CidxError, CidxResult, ErrorKind};

/// Maximum accepted frame size, guarding against a corrupt or malicious
/// length prefix forcing an unbounded allocation.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorPayload>,
}

impl RpcResponse {
    pub fn ok(id: String, result: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: String, error: &CidxError) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcErrorPayload {
                kind: error.kind(),
                message: error.user_message(),
            }),
        }
    }
}

pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> CidxResult<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(CidxError::Io(e)),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(CidxError::BadInput(format!("frame of {len} bytes exceeds the {MAX_FRAME_BYTES}-byte limit")));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> CidxResult<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| CidxError::Internal(anyhow::anyhow!("response frame too large to encode")))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_request<R: AsyncReadExt + Unpin>(reader: &mut R) -> CidxResult<Option<RpcRequest>> {
    match read_frame(reader).await? {
        Some(bytes) => {
            let request: RpcRequest = serde_json::from_slice(&bytes)
                .map_err(|e| CidxError::BadInput(format!("malformed rpc request: {e}")))?;
            Ok(Some(request))
        }
        None => Ok(None),
    }
}

pub async fn write_response<W: AsyncWriteExt + Unpin>(writer: &mut W, response: &RpcResponse) -> CidxResult<()> {
    let bytes = serde_json::to_vec(response)?;
    write_frame(writer, &bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trips_through_a_buffer() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let frame = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(frame, b"hello");
    }

    #[tokio::test]
    async fn read_frame_on_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_BYTES + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }
}
