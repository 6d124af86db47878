//! Length-prefixed bincode frames: a 4-byte big-endian length followed by the body.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::NetworkError;
use crate::raft::RaftResponse;

pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// What a server writes back for each request frame.
pub type WireReply = Result<RaftResponse, String>;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, NetworkError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| NetworkError::Serialization(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, NetworkError> {
    let (value, _): (T, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| NetworkError::Serialization(e.to_string()))?;
    Ok(value)
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = encode(value)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(NetworkError::FrameTooLarge(body.len()));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the peer closed the stream between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, NetworkError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(NetworkError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode(&body).map(Some)
}
