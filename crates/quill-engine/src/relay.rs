use quill_core::errors::TransportError;
use quill_core::transport::{FrameFormat, ResponseMetadata, Transport};

use crate::transport::TransportAdapter;

/// Forwards generated text to the open connection, one frame per token.
///
/// Writes await the transport, so a slow reader slows the loop down rather
/// than growing a buffer. The first write opens the response with streaming
/// metadata. After the peer disconnects the relay stays poisoned and never
/// touches the transport again.
pub struct TokenRelay<'a, T> {
    transport: &'a mut TransportAdapter<T>,
    format: FrameFormat,
    poisoned: bool,
}

impl<'a, T: Transport> TokenRelay<'a, T> {
    pub fn new(transport: &'a mut TransportAdapter<T>, format: FrameFormat) -> Self {
        Self {
            transport,
            format,
            poisoned: false,
        }
    }

    /// Fails once the peer is gone, whether or not anything was written.
    pub fn check_connected(&mut self) -> Result<(), TransportError> {
        if self.poisoned {
            return Err(TransportError::ConnectionClosed);
        }
        let result = self.transport.check_connected();
        self.note(result)
    }

    /// Send streaming metadata if nothing was sent yet.
    pub async fn ensure_open(&mut self) -> Result<(), TransportError> {
        if self.poisoned {
            return Err(TransportError::ConnectionClosed);
        }
        if self.transport.is_open() {
            return Ok(());
        }
        let result = self.transport.open(ResponseMetadata::streaming(self.format)).await;
        self.note(result)
    }

    /// Relay a piece of answer text. Empty text writes nothing.
    pub async fn relay_text(&mut self, text: &str) -> Result<(), TransportError> {
        if self.poisoned {
            return Err(TransportError::ConnectionClosed);
        }
        if text.is_empty() {
            return Ok(());
        }
        self.ensure_open().await?;
        let result = self.transport.write(self.format.encode(text)).await;
        self.note(result)
    }

    fn note(&mut self, result: Result<(), TransportError>) -> Result<(), TransportError> {
        if let Err(TransportError::ConnectionClosed) = &result {
            self.poisoned = true;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use quill_core::transport::CONTENT_TYPE_EVENT_STREAM;

    use crate::transport::MemoryTransport;

    #[tokio::test]
    async fn relays_in_order_and_opens_lazily() {
        let memory = MemoryTransport::new();
        let mut adapter = TransportAdapter::new(memory.clone());
        let mut relay = TokenRelay::new(&mut adapter, FrameFormat::Raw);

        relay.relay_text("").await.unwrap();
        assert!(memory.metadata().is_empty());

        for t in ["The", " answer", " is", " 256."] {
            relay.relay_text(t).await.unwrap();
        }

        assert_eq!(memory.frames().len(), 4);
        assert_eq!(memory.metadata().len(), 1);
        assert_eq!(memory.body(), "The answer is 256.");
    }

    #[tokio::test]
    async fn token_line_framing() {
        let memory = MemoryTransport::new();
        let mut adapter = TransportAdapter::new(memory.clone());
        let mut relay = TokenRelay::new(&mut adapter, FrameFormat::TokenLine);
        relay.relay_text("Hi").await.unwrap();

        assert_eq!(memory.frames(), vec![Bytes::from_static(b"token: Hi\n")]);
        assert_eq!(memory.metadata()[0].header("content-type"), Some(CONTENT_TYPE_EVENT_STREAM));
    }

    #[tokio::test]
    async fn poisoned_after_disconnect() {
        let memory = MemoryTransport::disconnect_after(1);
        let mut adapter = TransportAdapter::new(memory.clone());
        {
            let mut relay = TokenRelay::new(&mut adapter, FrameFormat::Raw);
            relay.relay_text("a").await.unwrap();
            assert_eq!(relay.relay_text("b").await, Err(TransportError::ConnectionClosed));
            assert_eq!(relay.relay_text("c").await, Err(TransportError::ConnectionClosed));
            assert_eq!(relay.check_connected(), Err(TransportError::ConnectionClosed));
        }
        assert_eq!(adapter.frames_written(), 1);
    }

    #[tokio::test]
    async fn hang_up_poisons_before_any_write() {
        let memory = MemoryTransport::new();
        let mut adapter = TransportAdapter::new(memory.clone());
        let mut relay = TokenRelay::new(&mut adapter, FrameFormat::Raw);
        assert_eq!(relay.check_connected(), Ok(()));

        memory.hang_up();
        assert_eq!(relay.check_connected(), Err(TransportError::ConnectionClosed));
        assert_eq!(relay.relay_text("late").await, Err(TransportError::ConnectionClosed));
        assert!(memory.metadata().is_empty());
        assert!(memory.frames().is_empty());
    }
}
