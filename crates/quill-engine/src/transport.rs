use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use quill_core::errors::TransportError;
use quill_core::transport::{ResponseMetadata, Transport};

/// Whether the connection has been closed, and how.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseState {
    Open,
    Closed { answered: bool },
}

/// Enforces the connection lifecycle around a raw [`Transport`]: metadata
/// once before any body bytes, no writes after a disconnect, and exactly one
/// inner `close` no matter how often `close` is called.
pub struct TransportAdapter<T> {
    inner: T,
    opened: bool,
    disconnected: bool,
    state: CloseState,
    frames_written: usize,
    bytes_written: usize,
    inner_closes: usize,
}

impl<T: Transport> TransportAdapter<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            opened: false,
            disconnected: false,
            state: CloseState::Open,
            frames_written: 0,
            bytes_written: 0,
            inner_closes: 0,
        }
    }

    pub async fn open(&mut self, metadata: ResponseMetadata) -> Result<(), TransportError> {
        if self.opened {
            return Err(TransportError::AlreadyOpen);
        }
        if self.state != CloseState::Open || self.disconnected {
            return Err(TransportError::ConnectionClosed);
        }
        debug!(status = metadata.status, "opening response");
        self.opened = true;
        self.inner.open(metadata).await.inspect_err(|e| {
            if e.is_connection_closed() {
                self.disconnected = true;
            }
        })
    }

    pub async fn write(&mut self, frame: Bytes) -> Result<(), TransportError> {
        if !self.opened {
            return Err(TransportError::NotOpen);
        }
        if self.disconnected || self.state != CloseState::Open {
            return Err(TransportError::ConnectionClosed);
        }
        let len = frame.len();
        match self.inner.write(frame).await {
            Ok(()) => {
                self.frames_written += 1;
                self.bytes_written += len;
                Ok(())
            }
            Err(e) => {
                if e.is_connection_closed() {
                    self.disconnected = true;
                }
                Err(e)
            }
        }
    }

    /// Close the connection. Only the first call reaches the inner transport.
    pub async fn close(&mut self, answered: bool) -> Result<(), TransportError> {
        if self.state != CloseState::Open {
            return Ok(());
        }
        self.state = CloseState::Closed { answered };
        self.inner_closes += 1;
        debug!(answered, frames = self.frames_written, "closing response");
        self.inner.close().await
    }

    /// Fail fast when the peer has gone away without a write noticing.
    pub fn check_connected(&mut self) -> Result<(), TransportError> {
        if !self.disconnected && self.inner.is_closed() {
            debug!("peer disconnected");
            self.disconnected = true;
        }
        if self.disconnected {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn close_state(&self) -> CloseState {
        self.state
    }

    pub fn frames_written(&self) -> usize {
        self.frames_written
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    /// Number of times the inner transport was closed. Never above one.
    pub fn inner_closes(&self) -> usize {
        self.inner_closes
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    metadata: Vec<ResponseMetadata>,
    frames: Vec<Bytes>,
    closes: usize,
    disconnect_after: Option<usize>,
    peer_gone: bool,
}

/// In-memory transport. Clones share the same recording.
#[derive(Clone, Debug, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the peer going away after `frames` successful writes.
    pub fn disconnect_after(frames: usize) -> Self {
        let transport = Self::default();
        transport.state.lock().disconnect_after = Some(frames);
        transport
    }

    /// Simulate the peer going away without any write failing.
    pub fn hang_up(&self) {
        self.state.lock().peer_gone = true;
    }

    pub fn metadata(&self) -> Vec<ResponseMetadata> {
        self.state.lock().metadata.clone()
    }

    pub fn frames(&self) -> Vec<Bytes> {
        self.state.lock().frames.clone()
    }

    /// All frames concatenated as text.
    pub fn body(&self) -> String {
        let state = self.state.lock();
        state
            .frames
            .iter()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect()
    }

    pub fn closes(&self) -> usize {
        self.state.lock().closes
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&mut self, metadata: ResponseMetadata) -> Result<(), TransportError> {
        self.state.lock().metadata.push(metadata);
        Ok(())
    }

    async fn write(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.peer_gone || state.disconnect_after.is_some_and(|n| state.frames.len() >= n) {
            return Err(TransportError::ConnectionClosed);
        }
        state.frames.push(frame);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.state.lock().closes += 1;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.lock().peer_gone
    }
}

/// Writes frames to stdout as they arrive. Used by `quill ask`.
pub struct StdoutTransport {
    out: tokio::io::Stdout,
}

impl StdoutTransport {
    pub fn new() -> Self {
        Self {
            out: tokio::io::stdout(),
        }
    }
}

impl Default for StdoutTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn io_error(e: std::io::Error) -> TransportError {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe => TransportError::ConnectionClosed,
        _ => TransportError::Io(e.to_string()),
    }
}

#[async_trait]
impl Transport for StdoutTransport {
    async fn open(&mut self, metadata: ResponseMetadata) -> Result<(), TransportError> {
        debug!(status = metadata.status, "stdout response");
        Ok(())
    }

    async fn write(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.out.write_all(&frame).await.map_err(io_error)?;
        self.out.flush().await.map_err(io_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.out.write_all(b"\n").await.map_err(io_error)?;
        self.out.flush().await.map_err(io_error)
    }
}
