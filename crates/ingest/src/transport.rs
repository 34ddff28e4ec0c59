// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Connection seams and the TCP implementation of them.
//!
//! Frames sent to a collector are
//!
//! ```text
//! [u64 send id][u32 body len][entry body]
//! ```
//!
//! and the collector answers each frame it has durably accepted with the bare
//! big-endian `u64` send id.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use crate::confirm::SendId;
use crate::constants::{DEFAULT_CONNECT_TIMEOUT, MAX_RECORD_SIZE};
use crate::entry::Entry;
use crate::errors::{DecodeError, TransportError};

pub const FRAME_HEADER_SIZE: usize = 8 + 4;

/// Byte sink of one connection.
#[async_trait]
pub trait Transport: Send {
    /// Writes some prefix of `buf`, returning how much was taken.
    async fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;

    fn set_write_deadline(&mut self, deadline: Option<Instant>);

    fn set_read_deadline(&mut self, deadline: Option<Instant>);
}

/// Stream of acknowledged send ids for one connection.
#[async_trait]
pub trait AckSource: Send {
    /// Next acknowledged id, or `None` once the peer has closed cleanly.
    async fn next(&mut self) -> Result<Option<SendId>, TransportError>;
}

/// A freshly dialed connection, split into its write and acknowledgment halves.
pub struct Connection {
    pub transport: Box<dyn Transport>,
    pub acks: Box<dyn AckSource>,
}

/// Opens connections to one destination.
#[async_trait]
pub trait Dialer: Send + Sync {
    fn name(&self) -> &str;

    async fn dial(&self) -> Result<Connection, TransportError>;
}

pub struct TcpDialer {
    addr: String,
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    fn name(&self) -> &str {
        &self.addr
    }

    async fn dial(&self) -> Result<Connection, TransportError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TransportError::Timeout { written: 0 })??;
        stream.set_nodelay(true)?;
        debug!("INGEST | Connected to {}", self.addr);

        let (read_half, write_half) = stream.into_split();
        let read_deadline = Arc::new(Mutex::new(None));
        Ok(Connection {
            transport: Box::new(TcpTransport {
                writer: write_half,
                write_deadline: None,
                read_deadline: Arc::clone(&read_deadline),
            }),
            acks: Box::new(TcpAckReader {
                reader: BufReader::new(read_half),
                read_deadline,
            }),
        })
    }
}

pub struct TcpTransport {
    writer: OwnedWriteHalf,
    write_deadline: Option<Instant>,
    read_deadline: Arc<Mutex<Option<Instant>>>,
}

#[async_trait]
impl Transport for TcpTransport {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        let write = self.writer.write(buf);
        match self.write_deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, write)
                .await
                .map_err(|_| TransportError::Timeout { written: 0 })?
                .map_err(TransportError::from),
            None => write.await.map_err(TransportError::from),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.writer.shutdown().await?;
        Ok(())
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline;
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        *self
            .read_deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = deadline;
    }
}

pub struct TcpAckReader {
    reader: BufReader<OwnedReadHalf>,
    read_deadline: Arc<Mutex<Option<Instant>>>,
}

#[async_trait]
impl AckSource for TcpAckReader {
    async fn next(&mut self) -> Result<Option<SendId>, TransportError> {
        let deadline = *self
            .read_deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let read = self.reader.read_u64();
        let result = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, read)
                .await
                .map_err(|_| TransportError::Timeout { written: 0 })?,
            None => read.await,
        };
        match result {
            Ok(id) => Ok(Some(id)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Appends the wire frame for `entry` sent under `id`.
pub fn encode_frame(id: SendId, entry: &Entry, out: &mut Vec<u8>) {
    out.reserve(FRAME_HEADER_SIZE + entry.encoded_len());
    out.extend_from_slice(&id.to_be_bytes());
    let len = u32::try_from(entry.encoded_len()).unwrap_or(u32::MAX);
    out.extend_from_slice(&len.to_be_bytes());
    entry.encode(out);
}

/// Reads one frame written by [`encode_frame`]. Returns `None` on a clean end of
/// stream at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<(SendId, Entry)>, TransportError> {
    let id = match reader.read_u64().await {
        Ok(id) => id,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let len = reader.read_u32().await? as usize;
    if len > MAX_RECORD_SIZE {
        return Err(invalid(DecodeError::Length(len)));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let entry = Entry::decode(&body).map_err(invalid)?;
    Ok(Some((id, entry)))
}

fn invalid(e: DecodeError) -> TransportError {
    TransportError::Io(io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryTag;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_frame_read_back() {
        let entry = Entry::new(EntryTag(3), b"payload".to_vec());
        let mut buf = Vec::new();
        encode_frame(11, &entry, &mut buf);
        encode_frame(12, &entry, &mut buf);

        let mut reader = buf.as_slice();
        let (id, decoded) = read_frame(&mut reader).await.expect("frame").expect("some");
        assert_eq!(id, 11);
        assert_eq!(decoded, entry);
        let (id, _) = read_frame(&mut reader).await.expect("frame").expect("some");
        assert_eq!(id, 12);
        assert!(read_frame(&mut reader).await.expect("eof").is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u64.to_be_bytes());
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        let err = read_frame(&mut buf.as_slice()).await.unwrap_err();
        assert!(matches!(err, TransportError::Io(e) if e.kind() == io::ErrorKind::InvalidData));
    }

    #[tokio::test]
    async fn test_tcp_dial_write_and_ack() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let (id, entry) = read_frame(&mut stream).await.expect("read").expect("frame");
            stream.write_u64(id).await.expect("ack");
            entry
        });

        let dialer = TcpDialer::new(addr.clone());
        assert_eq!(dialer.name(), addr);
        let mut conn = dialer.dial().await.expect("dial");

        let entry = Entry::new(EntryTag(1), b"over tcp".to_vec());
        let mut frame = Vec::new();
        encode_frame(42, &entry, &mut frame);
        let mut offset = 0;
        while offset < frame.len() {
            offset += conn.transport.write(&frame[offset..]).await.expect("write");
        }

        assert_eq!(conn.acks.next().await.expect("ack"), Some(42));
        assert_eq!(server.await.expect("server"), entry);
        assert_eq!(conn.acks.next().await.expect("eof"), None);
    }

    #[tokio::test]
    async fn test_read_deadline_times_out_ack_wait() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let server = tokio::spawn(async move { listener.accept().await.expect("accept") });

        let mut conn = TcpDialer::new(addr).dial().await.expect("dial");
        let _peer = server.await.expect("server");
        conn.transport
            .set_read_deadline(Some(Instant::now() + Duration::from_millis(20)));
        assert!(matches!(
            conn.acks.next().await,
            Err(TransportError::Timeout { .. })
        ));
    }
}
