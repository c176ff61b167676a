//! Stream transports.
//!
//! A [`Transport`] turns a byte pipe into [`StreamEvent`]s via the
//! embedder's [`ElementParser`] and writes serialized elements back,
//! buffered and flushed at stanza boundaries. The read path is paced by
//! a per-stream token bucket.
//!
//! [`SocketTransport`] wraps a TCP (optionally TLS) connection;
//! [`MemoryTransport`] is an in-process pair used by tests.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::config::ReadRateConfig;
use crate::error::{Error, Result};
use crate::xmpp::{Element, ElementParser, StreamEvent};

use super::rate_limiter::TokenBucket;

#[cfg(feature = "tls")]
use super::tls::TlsConfig;

const READ_CHUNK_SIZE: usize = 4096;

/// One stream's byte pipe, parsed.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Next parsed event; `None` means the peer closed the pipe.
    async fn next_event(&mut self) -> Result<Option<StreamEvent>>;

    /// Buffer one element for writing.
    async fn write_element(&mut self, element: &Element) -> Result<()>;

    /// Buffer raw bytes (stream headers).
    async fn write_raw(&mut self, data: &str) -> Result<()>;

    /// Flush buffered writes to the peer.
    async fn flush(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    /// Whether the transport can expose `tls-unique` channel binding
    /// (TLS < 1.3).
    fn supports_channel_binding(&self) -> bool {
        false
    }

    /// Upgrade a plain connection to TLS (STARTTLS).
    #[cfg(feature = "tls")]
    async fn starttls(&mut self, config: &TlsConfig) -> Result<()> {
        let _ = config;
        Err(Error::Config("transport does not support starttls".into()))
    }
}

enum SocketIo {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    /// Transitional state during a STARTTLS handshake.
    Detached,
}

impl SocketIo {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            SocketIo::Plain(io) => io.read(buf).await,
            #[cfg(feature = "tls")]
            SocketIo::Tls(io) => io.read(buf).await,
            SocketIo::Detached => Ok(0),
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            SocketIo::Plain(io) => io.write_all(buf).await,
            #[cfg(feature = "tls")]
            SocketIo::Tls(io) => io.write_all(buf).await,
            SocketIo::Detached => Err(std::io::ErrorKind::NotConnected.into()),
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            SocketIo::Plain(io) => io.flush().await,
            #[cfg(feature = "tls")]
            SocketIo::Tls(io) => io.flush().await,
            SocketIo::Detached => Ok(()),
        }
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            SocketIo::Plain(io) => io.shutdown().await,
            #[cfg(feature = "tls")]
            SocketIo::Tls(io) => io.shutdown().await,
            SocketIo::Detached => Ok(()),
        }
    }
}

/// TCP-backed transport with rate-limited reads and buffered writes.
pub struct SocketTransport {
    io: SocketIo,
    parser: Box<dyn ElementParser>,
    limiter: TokenBucket,
    pending: VecDeque<StreamEvent>,
    write_buf: Vec<u8>,
}

impl SocketTransport {
    pub fn new(conn: TcpStream, parser: Box<dyn ElementParser>, rate: &ReadRateConfig) -> Self {
        Self {
            io: SocketIo::Plain(conn),
            parser,
            limiter: TokenBucket::new(rate),
            pending: VecDeque::new(),
            write_buf: Vec::new(),
        }
    }

    /// A transport whose connection already completed a direct-TLS
    /// handshake.
    #[cfg(feature = "tls")]
    pub fn new_tls(
        conn: tokio_rustls::server::TlsStream<TcpStream>,
        parser: Box<dyn ElementParser>,
        rate: &ReadRateConfig,
    ) -> Self {
        Self {
            io: SocketIo::Tls(Box::new(conn)),
            parser,
            limiter: TokenBucket::new(rate),
            pending: VecDeque::new(),
            write_buf: Vec::new(),
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn next_event(&mut self) -> Result<Option<StreamEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let n = self.io.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.limiter.consume(n).await;
            self.pending.extend(self.parser.feed(&chunk[..n])?);
        }
    }

    async fn write_element(&mut self, element: &Element) -> Result<()> {
        self.write_buf.extend_from_slice(element.to_string().as_bytes());
        Ok(())
    }

    async fn write_raw(&mut self, data: &str) -> Result<()> {
        self.write_buf.extend_from_slice(data.as_bytes());
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let buf = std::mem::take(&mut self.write_buf);
        self.io.write_all(&buf).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.flush().await;
        self.io.shutdown().await?;
        Ok(())
    }

    #[cfg(feature = "tls")]
    fn supports_channel_binding(&self) -> bool {
        match &self.io {
            SocketIo::Tls(io) => {
                let (_, session) = io.get_ref();
                session
                    .protocol_version()
                    .is_some_and(|v| u16::from(v) < u16::from(rustls::ProtocolVersion::TLSv1_3))
            }
            _ => false,
        }
    }

    #[cfg(feature = "tls")]
    async fn starttls(&mut self, config: &TlsConfig) -> Result<()> {
        let io = std::mem::replace(&mut self.io, SocketIo::Detached);
        let SocketIo::Plain(conn) = io else {
            self.io = io;
            return Err(Error::Config("stream is already secured".into()));
        };
        match config.acceptor().accept(conn).await {
            Ok(tls) => {
                self.io = SocketIo::Tls(Box::new(tls));
                Ok(())
            }
            Err(e) => Err(Error::Io(e.kind())),
        }
    }
}

/// Handle driving a [`MemoryTransport`] from a test.
pub struct MemoryTransportHandle {
    event_tx: Option<mpsc::UnboundedSender<StreamEvent>>,
    written_rx: mpsc::UnboundedReceiver<Element>,
}

impl MemoryTransportHandle {
    /// Feed a parsed event to the session under test.
    pub fn push(&self, event: StreamEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    pub fn push_element(&self, element: Element) {
        self.push(StreamEvent::Element(element));
    }

    /// Next element the session wrote, if any arrived.
    pub async fn written(&mut self) -> Option<Element> {
        self.written_rx.recv().await
    }

    pub fn try_written(&mut self) -> Option<Element> {
        self.written_rx.try_recv().ok()
    }

    /// Simulate a transport drop: the session observes EOF on its read
    /// path while this handle stays usable for draining written
    /// elements.
    pub fn drop_connection(&mut self) {
        self.event_tx = None;
    }
}

/// In-process transport fed by a [`MemoryTransportHandle`].
pub struct MemoryTransport {
    event_rx: mpsc::UnboundedReceiver<StreamEvent>,
    written_tx: mpsc::UnboundedSender<Element>,
}

impl MemoryTransport {
    pub fn pair() -> (Self, MemoryTransportHandle) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        (
            Self {
                event_rx,
                written_tx,
            },
            MemoryTransportHandle {
                event_tx: Some(event_tx),
                written_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn next_event(&mut self) -> Result<Option<StreamEvent>> {
        Ok(self.event_rx.recv().await)
    }

    async fn write_element(&mut self, element: &Element) -> Result<()> {
        self.written_tx
            .send(element.clone())
            .map_err(|_| Error::Closed)
    }

    async fn write_raw(&mut self, _data: &str) -> Result<()> {
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.event_rx.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_transport_round_trip() {
        let (mut transport, mut handle) = MemoryTransport::pair();
        handle.push_element(Element::builder("presence").build());

        let ev = transport.next_event().await.unwrap().unwrap();
        assert!(matches!(ev, StreamEvent::Element(el) if el.name() == "presence"));

        transport
            .write_element(&Element::builder("message").build())
            .await
            .unwrap();
        assert_eq!(handle.written().await.unwrap().name(), "message");
    }

    #[tokio::test]
    async fn test_memory_transport_eof_on_handle_drop() {
        let (mut transport, handle) = MemoryTransport::pair();
        drop(handle);
        assert!(transport.next_event().await.unwrap().is_none());
    }
}
