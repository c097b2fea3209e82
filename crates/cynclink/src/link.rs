//! The injected connection capability.
//!
//! The transport core never opens sockets itself: it drives a [`Link`], an
//! object-safe async capability with connect/send/recv/close. TLS wrapping,
//! certificate pinning and DNS are the caller's responsibility; [`TcpLink`]
//! covers the plain-TCP case and test doubles implement the trait directly.

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("link I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("read timed out")]
    Timeout,
    #[error("link closed by peer")]
    Closed,
    #[error("link is not open")]
    NotOpen,
}

/// A bidirectional byte pipe to the Cync endpoint.
///
/// Reads are bounded by a caller-supplied timeout so the single reader can
/// observe cancellation promptly. Implementations must serialize concurrent
/// writers internally; the transport relies on `send` being atomic per frame.
#[async_trait]
pub trait Link: Send + Sync {
    /// Opens (or reopens) the pipe to the address baked in at construction.
    async fn connect(&self) -> Result<(), LinkError>;

    /// Writes one whole frame.
    async fn send(&self, frame: &[u8]) -> Result<(), LinkError>;

    /// Reads up to `max_len` bytes, waiting at most `wait`.
    /// `Err(Timeout)` means nothing arrived; `Err(Closed)` means EOF.
    async fn recv(&self, max_len: usize, wait: Duration) -> Result<Bytes, LinkError>;

    /// Tears the pipe down; a later `connect` may reopen it.
    async fn close(&self);
}

/// Plain-TCP [`Link`] over a tokio stream, split so the router can hold the
/// read half while senders share the write half behind its own lock.
pub struct TcpLink {
    host: String,
    port: u16,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl TcpLink {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Link for TcpLink {
    async fn connect(&self) -> Result<(), LinkError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(read_half);
        *self.writer.lock().await = Some(write_half);
        debug!("tcp link established to {}:{}", self.host, self.port);
        Ok(())
    }

    async fn send(&self, frame: &[u8]) -> Result<(), LinkError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(LinkError::NotOpen)?;
        writer.write_all(frame).await?;
        writer.flush().await?;
        trace!("tcp link wrote {} bytes", frame.len());
        Ok(())
    }

    async fn recv(&self, max_len: usize, wait: Duration) -> Result<Bytes, LinkError> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(LinkError::NotOpen)?;
        let mut buf = vec![0u8; max_len];
        match tokio::time::timeout(wait, reader.read(&mut buf)).await {
            Err(_) => Err(LinkError::Timeout),
            Ok(Ok(0)) => Err(LinkError::Closed),
            Ok(Ok(n)) => Ok(Bytes::copy_from_slice(&buf[..n])),
            Ok(Err(e)) => Err(LinkError::Io(e)),
        }
    }

    async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.reader.lock().await.take();
        debug!("tcp link to {}:{} closed", self.host, self.port);
    }
}
