//! Length-prefixed framing: `[u32 LE length][payload]`.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::rpc::{decode_message, encode_message, RpcMessage};
use crate::config::MAX_FRAME_LEN;
use crate::error::AppResult;

/// Prefixes `payload` with its length, ready for a single `write_all`.
pub fn encode_frame(payload: &[u8]) -> io::Result<Bytes> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds {MAX_FRAME_LEN}", payload.len()),
        ));
    }
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

pub fn message_frame(msg: &RpcMessage) -> io::Result<Bytes> {
    encode_frame(&encode_message(msg))
}

/// Reads one frame. `Ok(None)` when the peer closed the stream between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("peer announced a {len}-byte frame"),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    writer.write_all(&encode_frame(payload)?).await?;
    writer.flush().await
}

/// Reads and decodes one message.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> AppResult<Option<RpcMessage>> {
    match read_frame(reader).await? {
        Some(payload) => Ok(Some(decode_message(&payload)?)),
        None => Ok(None),
    }
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &RpcMessage) -> io::Result<()> {
    write_frame(writer, &encode_message(msg)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::rpc::{Origin, RpcValue};

    #[tokio::test]
    async fn test_messages_cross_a_stream_in_order() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let sent = vec![
            RpcMessage::request(Origin::Client(3), 10, 1, vec![]),
            RpcMessage::broadcast(16, vec![RpcValue::Int(4), RpcValue::from("/bin/sh")]),
        ];
        let to_send = sent.clone();
        let writer = tokio::spawn(async move {
            for msg in &to_send {
                write_message(&mut a, msg).await.unwrap();
            }
        });
        for expected in &sent {
            assert_eq!(read_message(&mut b).await.unwrap().as_ref(), Some(expected));
        }
        writer.await.unwrap();
        assert_eq!(read_message(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_length_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_LEN as u32 + 1).to_le_bytes()).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_garbage_payload_is_malformed() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, &[9, 9, 9]).await.unwrap();
        let err = read_message(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), "MalformedRecord");
    }

    #[test]
    fn test_frame_prefix_is_little_endian_length() {
        let frame = encode_frame(b"abc").unwrap();
        assert_eq!(&frame[..], &[3, 0, 0, 0, b'a', b'b', b'c']);
    }
}
