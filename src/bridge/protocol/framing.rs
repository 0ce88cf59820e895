//! Message framing for the resolver socket.
//!
//! Two frame kinds flow over a connection:
//!
//! - the handshake frame: exactly [`AUTH_FRAME_LEN`] bytes, big-endian `u64`,
//!   sent once by the subprocess right after connecting
//! - message frames: `Content-Length: N\r\n\r\n{json}`
//!
//! Reader and writer halves are independent so requests and responses can
//! flow concurrently over the same connection.

use std::io;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::AuthEpoch;

/// Length of the handshake frame in bytes.
pub const AUTH_FRAME_LEN: usize = 8;

/// Capacity the writer's serialization buffer is shrunk back to on reset.
const BASE_BUFFER_CAPACITY: usize = 4 * 1024;

/// Upper bound on a single frame body; anything larger is a corrupt header.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Write the handshake frame.
pub async fn write_auth_frame<W>(writer: &mut W, auth: AuthEpoch) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&auth.as_u64().to_be_bytes()).await?;
    writer.flush().await
}

/// Read the handshake frame.
pub async fn read_auth_frame<R>(reader: &mut R) -> io::Result<AuthEpoch>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; AUTH_FRAME_LEN];
    reader.read_exact(&mut raw).await?;
    Ok(AuthEpoch::from_raw(u64::from_be_bytes(raw)))
}

/// Reads Content-Length framed messages.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    header: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            header: String::new(),
        }
    }

    /// Read one frame body.
    ///
    /// EOF before a header is reported as `UnexpectedEof`; a connection
    /// closing is a transport error like any other.
    pub async fn read_frame(&mut self) -> io::Result<Vec<u8>> {
        let mut content_length: Option<usize> = None;
        loop {
            self.header.clear();
            let read = self.inner.read_line(&mut self.header).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                ));
            }

            let line = self.header.trim();
            if line.is_empty() {
                if content_length.is_some() {
                    break;
                }
                // Stray blank line between frames
                continue;
            }
            if let Some(len) = line.strip_prefix("Content-Length:") {
                let len = len.trim().parse::<usize>().map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("invalid Content-Length {:?}: {}", len, e),
                    )
                })?;
                if len > MAX_FRAME_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("frame of {} bytes exceeds limit", len),
                    ));
                }
                content_length = Some(len);
            }
        }

        let mut body = vec![0u8; content_length.unwrap_or(0)];
        self.inner.read_exact(&mut body).await?;
        Ok(body)
    }

    /// Read and decode one JSON message.
    pub async fn read_message<T: DeserializeOwned>(&mut self) -> io::Result<T> {
        let body = self.read_frame().await?;
        serde_json::from_slice(&body).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("undecodable frame: {}", e),
            )
        })
    }

    /// Access the underlying reader (used by the handshake before framing starts).
    pub fn get_mut(&mut self) -> &mut BufReader<R> {
        &mut self.inner
    }
}

/// Writes Content-Length framed messages.
///
/// Reuses one serialization buffer across frames and shrinks it back every
/// `reset_interval` frames so a single oversized message does not pin
/// memory for the rest of a long streaming session.
pub struct FrameWriter<W> {
    inner: W,
    buffer: Vec<u8>,
    frames_since_reset: u32,
    reset_interval: u32,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W, reset_interval: u32) -> Self {
        Self {
            inner: writer,
            buffer: Vec::with_capacity(BASE_BUFFER_CAPACITY),
            frames_since_reset: 0,
            reset_interval: reset_interval.max(1),
        }
    }

    /// Serialize and write one JSON message.
    pub async fn write_message<T: Serialize>(&mut self, message: &T) -> io::Result<()> {
        self.buffer.clear();
        serde_json::to_writer(&mut self.buffer, message)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let header = format!("Content-Length: {}\r\n\r\n", self.buffer.len());
        self.inner.write_all(header.as_bytes()).await?;
        self.inner.write_all(&self.buffer).await?;
        self.inner.flush().await?;

        self.frames_since_reset += 1;
        if self.frames_since_reset >= self.reset_interval {
            self.reset_stream();
        }
        Ok(())
    }

    fn reset_stream(&mut self) {
        self.frames_since_reset = 0;
        if self.buffer.capacity() > BASE_BUFFER_CAPACITY {
            self.buffer = Vec::with_capacity(BASE_BUFFER_CAPACITY);
        }
    }

    /// Frames written since the last stream reset.
    pub fn frames_since_reset(&self) -> u32 {
        self.frames_since_reset
    }

    /// Flush and close the write direction.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[tokio::test]
    async fn write_message_formats_with_content_length_header() {
        let mut writer = FrameWriter::new(Vec::new(), 100);
        writer.write_message(&json!({"id": 1})).await.unwrap();

        let output = String::from_utf8(writer.get_mut().clone()).unwrap();
        let (header, body) = output.split_once("\r\n\r\n").expect("separator");
        let length: usize = header
            .strip_prefix("Content-Length: ")
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(body.len(), length);
        assert_eq!(serde_json::from_str::<Value>(body).unwrap()["id"], 1);
    }

    #[tokio::test]
    async fn frames_survive_a_duplex_pipe_in_order() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client, 100);
        let mut reader = FrameReader::new(server);

        let send = tokio::spawn(async move {
            for i in 0..3 {
                writer.write_message(&json!({"id": i})).await.unwrap();
            }
        });

        for i in 0..3 {
            let msg: Value = reader.read_message().await.unwrap();
            assert_eq!(msg["id"], i);
        }
        send.await.unwrap();
    }

    #[tokio::test]
    async fn read_frame_reports_eof_as_unexpected_eof() {
        let mut reader = FrameReader::new(&b""[..]);
        let err = reader.read_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn read_frame_rejects_malformed_length() {
        let mut reader = FrameReader::new(&b"Content-Length: abc\r\n\r\n{}"[..]);
        let err = reader.read_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn undecodable_body_is_invalid_data() {
        let mut reader = FrameReader::new(&b"Content-Length: 3\r\n\r\nabc"[..]);
        let err = reader.read_message::<Value>().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn stream_reset_counter_wraps_at_interval() {
        let mut writer = FrameWriter::new(Vec::new(), 2);
        writer.write_message(&json!(1)).await.unwrap();
        assert_eq!(writer.frames_since_reset(), 1);
        writer.write_message(&json!(2)).await.unwrap();
        assert_eq!(writer.frames_since_reset(), 0);
    }

    #[tokio::test]
    async fn auth_frame_is_eight_big_endian_bytes() {
        let mut out = Vec::new();
        write_auth_frame(&mut out, AuthEpoch::from_raw(0x0102)).await.unwrap();
        assert_eq!(out, vec![0, 0, 0, 0, 0, 0, 1, 2]);

        let epoch = read_auth_frame(&mut &out[..]).await.unwrap();
        assert_eq!(epoch, AuthEpoch::from_raw(0x0102));
    }
}
