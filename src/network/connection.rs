//! Persistent Line Connection
//!
//! Wraps a duplex byte stream. A spawned receive loop frames
//! newline-terminated messages and hands them to a [`ConnectionHandler`].
//! Outgoing lines go through a bounded per-connection queue drained by a
//! writer task, so [`Connection::send`] never waits on the peer.
//!
//! The receive loop runs at most once. When it ends (EOF, read error,
//! oversized line, or [`Connection::close`]) the connection is closed and
//! [`ConnectionHandler::on_disconnect`] fires exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Longest accepted line in bytes, terminator excluded.
pub const MAX_LINE_BYTES: usize = 8 * 1024;

/// Lines that may wait for the writer before the peer counts as stalled.
pub const OUTBOUND_QUEUE: usize = 256;

/// A single queued line that takes longer than this closes the connection.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// `start` was called a second time.
    #[error("Connection already started")]
    AlreadyStarted,
}

/// Callbacks driven by the receive loop.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// Runs once before the first read.
    async fn on_start(&self, _connection: &Arc<Connection>) {}

    /// One received line, without the terminator.
    async fn on_message(&self, connection: &Arc<Connection>, line: String);

    /// Runs exactly once after the loop ends.
    async fn on_disconnect(&self, connection: &Arc<Connection>);
}

/// A persistent line-oriented connection.
pub struct Connection {
    /// Peer label for logs.
    peer: String,
    /// Read half, taken by the receive loop.
    reader: StdMutex<Option<BufReader<BoxReader>>>,
    /// Queue into the writer task, `None` once closed.
    outbound: StdMutex<Option<mpsc::Sender<String>>>,
    started: AtomicBool,
    closed: AtomicBool,
    /// Wakes the receive loop on close.
    shutdown: Notify,
}

enum Frame {
    Line(String),
    TooLong,
    Eof,
}

impl Connection {
    /// Wrap any duplex stream. Must be called inside a tokio runtime.
    pub fn new<S>(stream: S, peer: impl Into<String>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let peer = peer.into();

        Arc::new_cyclic(|weak: &Weak<Connection>| {
            tokio::spawn(write_loop(
                Box::new(write_half),
                outbound_rx,
                weak.clone(),
                peer.clone(),
            ));
            Self {
                peer,
                reader: StdMutex::new(Some(BufReader::new(Box::new(read_half) as BoxReader))),
                outbound: StdMutex::new(Some(outbound_tx)),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                shutdown: Notify::new(),
            }
        })
    }

    /// Wrap an accepted or connected TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Arc<Self> {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", peer, e);
        }
        Self::new(stream, peer)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Spawn the receive loop. Fails if already started.
    pub fn start<H>(self: &Arc<Self>, handler: Arc<H>) -> Result<JoinHandle<()>, ConnectionError>
    where
        H: ConnectionHandler + ?Sized + 'static,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ConnectionError::AlreadyStarted);
        }
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(ConnectionError::AlreadyStarted)?;

        let connection = Arc::clone(self);
        Ok(tokio::spawn(async move {
            connection.receive_loop(reader, handler).await;
        }))
    }

    async fn receive_loop<H>(self: Arc<Self>, mut reader: BufReader<BoxReader>, handler: Arc<H>)
    where
        H: ConnectionHandler + ?Sized,
    {
        handler.on_start(&self).await;

        let mut buf = Vec::new();
        while !self.is_closed() {
            tokio::select! {
                frame = read_frame(&mut reader, &mut buf) => match frame {
                    Ok(Frame::Line(line)) => handler.on_message(&self, line).await,
                    Ok(Frame::TooLong) => {
                        warn!("{} sent a line over {} bytes", self.peer, MAX_LINE_BYTES);
                        break;
                    }
                    Ok(Frame::Eof) => {
                        debug!("{} closed the stream", self.peer);
                        break;
                    }
                    Err(e) => {
                        debug!("Read error from {}: {}", self.peer, e);
                        break;
                    }
                },
                _ = self.shutdown.notified() => break,
            }
        }

        self.close();
        handler.on_disconnect(&self).await;
    }

    /// Queue one line for the peer.
    ///
    /// Never waits on the socket. Returns false if the line contains a line
    /// break or the connection is closed. A full queue means the peer has
    /// stopped reading; the connection is closed and false returned.
    pub async fn send(&self, line: &str) -> bool {
        if line.contains(['\n', '\r']) {
            warn!("Refusing to send multi-line message to {}", self.peer);
            return false;
        }
        if self.is_closed() {
            return false;
        }

        let result = {
            let guard = self.outbound.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match guard.as_ref() {
                Some(outbound) => outbound.try_send(line.to_string()),
                None => return false,
            }
        };

        match result {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Outbound queue to {} is full, closing", self.peer);
                self.close();
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.close();
                false
            }
        }
    }

    /// Stop the receive loop. Lines already queued are still written.
    /// Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Closing connection to {}", self.peer);
            self.outbound
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            self.shutdown.notify_one();
        }
    }
}

/// Read one newline-terminated frame of at most [`MAX_LINE_BYTES`].
async fn read_frame(reader: &mut BufReader<BoxReader>, buf: &mut Vec<u8>) -> std::io::Result<Frame> {
    buf.clear();
    let limit = (MAX_LINE_BYTES + 2) as u64;
    let read = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if read == 0 {
        return Ok(Frame::Eof);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() as u64 == limit {
        return Ok(Frame::TooLong);
    }
    if buf.len() > MAX_LINE_BYTES {
        return Ok(Frame::TooLong);
    }

    Ok(Frame::Line(String::from_utf8_lossy(buf).into_owned()))
}

/// Drain the outbound queue until it closes, a write fails, or a write
/// stalls past [`WRITE_TIMEOUT`].
async fn write_loop(
    mut writer: BoxWriter,
    mut outbound: mpsc::Receiver<String>,
    connection: Weak<Connection>,
    peer: String,
) {
    while let Some(line) = outbound.recv().await {
        let failure = match tokio::time::timeout(WRITE_TIMEOUT, write_line(&mut writer, &line)).await {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "write timed out".to_string(),
        };
        debug!("Send to {} failed: {}", peer, failure);
        if let Some(connection) = connection.upgrade() {
            connection.close();
        }
        return;
    }
    let _ = writer.shutdown().await;
}

async fn write_line(writer: &mut BoxWriter, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
