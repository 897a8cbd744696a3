//! One byte-stream interface over TCP, local sockets and shared memory rings.
//!
//! Every higher layer (framing, client, server) talks to a [`Transport`] and
//! never learns which kind of link sits underneath. Blocking operations are
//! bounded by the transport's [`Timeout`], which behaves the same for all
//! three links.

use super::ring::RingStream;
use crate::config::{IpcConfig, Timeout};
use crate::{Result, SyncError};
use futures::FutureExt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

/// The concrete byte stream under a transport.
#[derive(Debug)]
pub enum Link {
    Tcp(TcpStream),
    #[cfg(unix)]
    Local(UnixStream),
    Ring(RingStream),
}

/// Kind of a link, for log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Tcp,
    Local,
    Ring,
}

impl std::fmt::Display for LinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkKind::Tcp => write!(f, "tcp"),
            LinkKind::Local => write!(f, "local"),
            LinkKind::Ring => write!(f, "shmem"),
        }
    }
}

impl Link {
    pub fn kind(&self) -> LinkKind {
        match self {
            Link::Tcp(_) => LinkKind::Tcp,
            #[cfg(unix)]
            Link::Local(_) => LinkKind::Local,
            Link::Ring(_) => LinkKind::Ring,
        }
    }
}

impl AsyncRead for Link {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Link::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Link::Local(s) => Pin::new(s).poll_read(cx, buf),
            Link::Ring(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Link {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Link::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Link::Local(s) => Pin::new(s).poll_write(cx, buf),
            Link::Ring(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Link::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Link::Local(s) => Pin::new(s).poll_flush(cx),
            Link::Ring(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Link::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Link::Local(s) => Pin::new(s).poll_shutdown(cx),
            Link::Ring(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A buffered, timeout-bounded byte stream to one peer.
///
/// Writes are buffered until [`Transport::flush`]; callers flush once per
/// protocol message so that a message is never left half-sent.
#[derive(Debug)]
pub struct Transport {
    stream: BufStream<Link>,
    kind: LinkKind,
    endpoint: String,
    timeout: Timeout,
}

impl Transport {
    pub fn new(link: Link, endpoint: impl Into<String>, timeout: Timeout) -> Self {
        let kind = link.kind();
        let stream = match kind {
            // The ring already is a buffer; keep the userspace layer small.
            LinkKind::Ring => BufStream::with_capacity(4096, 4096, link),
            _ => BufStream::with_capacity(
                IpcConfig::SOCKET_BUFFER_SIZE,
                IpcConfig::SOCKET_BUFFER_SIZE,
                link,
            ),
        };
        Self {
            stream,
            kind,
            endpoint: endpoint.into(),
            timeout,
        }
    }

    pub fn tcp(stream: TcpStream, endpoint: impl Into<String>, timeout: Timeout) -> Self {
        // Commands are small and latency bound.
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!("Cannot disable Nagle on TCP transport: {}", e);
        }
        Self::new(Link::Tcp(stream), endpoint, timeout)
    }

    #[cfg(unix)]
    pub fn local(stream: UnixStream, endpoint: impl Into<String>, timeout: Timeout) -> Self {
        Self::new(Link::Local(stream), endpoint, timeout)
    }

    pub fn ring(stream: RingStream, endpoint: impl Into<String>, timeout: Timeout) -> Self {
        Self::new(Link::Ring(stream), endpoint, timeout)
    }

    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    /// Peer description used in errors and logs.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn set_endpoint(&mut self, endpoint: impl Into<String>) {
        self.endpoint = endpoint.into();
    }

    pub fn timeout(&self) -> Timeout {
        self.timeout
    }

    /// The underlying ring stream, if this transport runs over shared memory.
    pub fn ring_stream(&self) -> Option<&RingStream> {
        match self.stream.get_ref() {
            Link::Ring(s) => Some(s),
            _ => None,
        }
    }

    /// Fill `buf` completely, waiting for data as needed.
    pub async fn read_into(&mut self, buf: &mut [u8]) -> Result<()> {
        let Self {
            stream,
            endpoint,
            timeout,
            ..
        } = self;
        timeout
            .run("reading", async {
                stream
                    .read_exact(buf)
                    .await
                    .map(|_| ())
                    .map_err(|e| SyncError::from_stream(e, endpoint))
            })
            .await
    }

    /// Read exactly `n` bytes.
    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.read_into(&mut buf).await?;
        Ok(buf)
    }

    /// Queue all of `data` for sending; waits while the buffer is full.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let Self {
            stream,
            endpoint,
            timeout,
            ..
        } = self;
        timeout
            .run("writing", async {
                stream
                    .write_all(data)
                    .await
                    .map_err(|e| SyncError::from_stream(e, endpoint))
            })
            .await
    }

    /// Push buffered bytes to the peer.
    pub async fn flush(&mut self) -> Result<()> {
        let Self {
            stream,
            endpoint,
            timeout,
            ..
        } = self;
        timeout
            .run("flushing", async {
                stream
                    .flush()
                    .await
                    .map_err(|e| SyncError::from_stream(e, endpoint))
            })
            .await
    }

    /// Whether a read would make progress right now, without waiting.
    ///
    /// End of stream and stream errors count as pending input so that the
    /// following read reports them.
    pub fn has_pending_input(&mut self) -> bool {
        if let Some(ring) = self.ring_stream() {
            if ring.bytes_available() > 0 {
                return true;
            }
        }
        match self.stream.fill_buf().now_or_never() {
            Some(Ok(buf)) => {
                if buf.is_empty() {
                    self.kind != LinkKind::Ring
                } else {
                    true
                }
            }
            Some(Err(_)) => true,
            None => false,
        }
    }

    /// Flush and shut down the write half.
    pub async fn close(&mut self) -> Result<()> {
        self.flush().await?;
        self.stream
            .shutdown()
            .await
            .map_err(|e| SyncError::from_stream(e, &self.endpoint))
    }
}
