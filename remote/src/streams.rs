//! Length-delimited JSON framing over TCP or TLS streams.
//!
//! Frames are a 4-byte big-endian length followed by that many bytes of
//! UTF-8 JSON (or, on transfer channels, raw file data interleaved between
//! frames). Generic over the underlying stream so the same code serves
//! plain TCP and TLS.

use bytes::Buf;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Manifests of very large trees still have to fit in one frame.
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

fn codec() -> tokio_util::codec::LengthDelimitedCodec {
    tokio_util::codec::LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Framed send stream for length-delimited JSON messages.
#[derive(Debug)]
pub struct SendStream<W = OwnedWriteHalf> {
    framed: tokio_util::codec::FramedWrite<W, tokio_util::codec::LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin> SendStream<W> {
    pub fn new(stream: W) -> Self {
        let framed = tokio_util::codec::FramedWrite::new(stream, codec());
        Self { framed }
    }

    pub async fn send_message<T: serde::Serialize>(&mut self, obj: &T) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(obj)?;
        self.framed.send(bytes::Bytes::from(bytes)).await?;
        Ok(())
    }

    /// Sends a pre-built frame (used by the rexec channel for its tagged
    /// byte frames).
    pub async fn send_frame(&mut self, bytes: bytes::Bytes) -> anyhow::Result<()> {
        self.framed.send(bytes).await?;
        Ok(())
    }

    /// Sends a JSON header followed by exactly `len` raw bytes read from
    /// `reader`.
    pub async fn send_message_with_data<T: serde::Serialize, R: AsyncRead + Unpin>(
        &mut self,
        obj: &T,
        reader: &mut R,
        len: u64,
    ) -> anyhow::Result<u64> {
        self.send_message(obj).await?;
        let data_stream = self.framed.get_mut();
        let mut limited = reader.take(len);
        let copied = tokio::io::copy(&mut limited, data_stream).await?;
        if copied != len {
            anyhow::bail!("short read: expected {} bytes, got {}", len, copied);
        }
        data_stream.flush().await?;
        Ok(copied)
    }

    pub async fn close(&mut self) -> anyhow::Result<()> {
        self.framed.close().await?;
        Ok(())
    }
}

/// Type alias for boxed write stream (supports both TLS and plain TCP)
pub type BoxedWrite = Box<dyn AsyncWrite + Unpin + Send>;
/// Type alias for boxed read stream (supports both TLS and plain TCP)
pub type BoxedRead = Box<dyn AsyncRead + Unpin + Send>;
/// Send stream over boxed writer
pub type BoxedSendStream = SendStream<BoxedWrite>;
/// Recv stream over boxed reader
pub type BoxedRecvStream = RecvStream<BoxedRead>;

/// Framed receive stream for length-delimited JSON messages.
#[derive(Debug)]
pub struct RecvStream<R = OwnedReadHalf> {
    framed: tokio_util::codec::FramedRead<R, tokio_util::codec::LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> RecvStream<R> {
    pub fn new(stream: R) -> Self {
        let framed = tokio_util::codec::FramedRead::new(stream, codec());
        Self { framed }
    }

    /// Receives one JSON frame; `None` on clean EOF.
    pub async fn recv_message<T: serde::de::DeserializeOwned>(
        &mut self,
    ) -> anyhow::Result<Option<T>> {
        if let Some(frame) = futures::StreamExt::next(&mut self.framed).await {
            let bytes = frame?;
            let obj = serde_json::from_slice(&bytes)?;
            Ok(Some(obj))
        } else {
            Ok(None)
        }
    }

    /// Receives one raw frame; `None` on clean EOF.
    pub async fn recv_frame(&mut self) -> anyhow::Result<Option<bytes::BytesMut>> {
        match futures::StreamExt::next(&mut self.framed).await {
            Some(frame) => Ok(Some(frame?)),
            None => Ok(None),
        }
    }

    /// Copies exactly `size` raw bytes to a writer, leaving the stream
    /// positioned at the next frame.
    ///
    /// Drains the codec's read-ahead buffer first; a stream that ends
    /// before `size` bytes is an error (`Truncated` at the caller).
    pub async fn copy_exact_to<W: tokio::io::AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        size: u64,
        buffer_size: usize,
    ) -> anyhow::Result<u64> {
        if size == 0 {
            return Ok(0);
        }
        let read_buffer = self.framed.read_buffer_mut();
        let buffered = (read_buffer.len() as u64).min(size);
        if buffered > 0 {
            writer.write_all(&read_buffer[..buffered as usize]).await?;
            read_buffer.advance(buffered as usize);
        }
        let remaining = size - buffered;
        if remaining == 0 {
            return Ok(size);
        }
        let data_stream = self.framed.get_mut();
        let mut limited = data_stream.take(remaining);
        let mut buf = vec![0u8; buffer_size.min(remaining as usize)];
        let mut total_copied = buffered;
        loop {
            let bytes_to_read = buf.len().min((size - total_copied) as usize);
            if bytes_to_read == 0 {
                break;
            }
            let n = limited.read(&mut buf[..bytes_to_read]).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
            total_copied += n as u64;
        }
        if total_copied != size {
            anyhow::bail!(
                "unexpected EOF: expected {} bytes, got {}",
                size,
                total_copied
            );
        }
        Ok(size)
    }

    /// Discards exactly `size` raw bytes (skipped files still occupy the
    /// stream).
    pub async fn drain_exact(&mut self, size: u64, buffer_size: usize) -> anyhow::Result<u64> {
        let mut sink = tokio::io::sink();
        self.copy_exact_to(&mut sink, size, buffer_size).await
    }
}

/// Bidirectional framed connection over boxed halves; serves the control
/// channel and both transfer directions, TLS or not.
pub struct Channel {
    pub send: BoxedSendStream,
    pub recv: BoxedRecvStream,
}

impl Channel {
    pub fn from_tcp(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Channel {
            send: SendStream::new(Box::new(write_half) as BoxedWrite),
            recv: RecvStream::new(Box::new(read_half) as BoxedRead),
        }
    }

    pub fn from_parts<R, W>(read: R, write: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Channel {
            send: SendStream::new(Box::new(write) as BoxedWrite),
            recv: RecvStream::new(Box::new(read) as BoxedRead),
        }
    }

    /// Strict request/response exchange (control channel only).
    pub async fn request(
        &mut self,
        request: &crate::protocol::Request,
    ) -> anyhow::Result<crate::protocol::Response> {
        self.send.send_message(request).await?;
        self.recv
            .recv_message::<crate::protocol::Response>()
            .await?
            .ok_or_else(|| anyhow::anyhow!("connection closed mid-request"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Deserialize, Eq, PartialEq, Serialize)]
    struct Probe {
        id: u32,
        tag: String,
    }

    #[tokio::test]
    async fn test_json_frame_roundtrip() {
        let (writer, reader) = tokio::io::duplex(4096);
        let mut send = SendStream::new(writer);
        let mut recv = RecvStream::new(reader);
        let sent = Probe {
            id: 7,
            tag: "hello".to_string(),
        };
        send.send_message(&sent).await.unwrap();
        let received: Probe = recv.recv_message().await.unwrap().unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_frame_layout_is_length_prefixed_json() {
        let (writer, mut raw_read) = tokio::io::duplex(4096);
        let mut send = SendStream::new(writer);
        send.send_message(&serde_json::json!({"a": 1})).await.unwrap();
        let mut prefix = [0u8; 4];
        raw_read.read_exact(&mut prefix).await.unwrap();
        let len = u32::from_be_bytes(prefix) as usize;
        let mut payload = vec![0u8; len];
        raw_read.read_exact(&mut payload).await.unwrap();
        assert_eq!(payload, br#"{"a":1}"#);
    }

    #[tokio::test]
    async fn test_message_with_data_and_copy_exact() {
        let (writer, reader) = tokio::io::duplex(4096);
        let mut send = SendStream::new(writer);
        let mut recv = RecvStream::new(reader);
        let payload = b"raw file bytes".to_vec();
        let mut reader = std::io::Cursor::new(payload.clone());
        send.send_message_with_data(
            &Probe {
                id: 1,
                tag: "hdr".to_string(),
            },
            &mut reader,
            payload.len() as u64,
        )
        .await
        .unwrap();
        send.send_message(&Probe {
            id: 2,
            tag: "trailer".to_string(),
        })
        .await
        .unwrap();
        let header: Probe = recv.recv_message().await.unwrap().unwrap();
        assert_eq!(header.id, 1);
        let mut copied = vec![];
        let n = recv
            .copy_exact_to(&mut copied, payload.len() as u64, 8)
            .await
            .unwrap();
        assert_eq!(n, payload.len() as u64);
        assert_eq!(copied, payload);
        let trailer: Probe = recv.recv_message().await.unwrap().unwrap();
        assert_eq!(trailer.id, 2);
    }

    #[tokio::test]
    async fn test_truncated_copy_exact_fails() {
        let (writer, reader) = tokio::io::duplex(4096);
        let mut send = SendStream::new(writer);
        let mut recv = RecvStream::new(reader);
        let mut reader = std::io::Cursor::new(b"abc".to_vec());
        send.send_message_with_data(&Probe { id: 1, tag: String::new() }, &mut reader, 3)
            .await
            .unwrap();
        drop(send);
        recv.recv_message::<Probe>().await.unwrap().unwrap();
        let mut out = vec![];
        assert!(recv.copy_exact_to(&mut out, 10, 8).await.is_err());
    }
}
