use std::convert::Infallible;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use quill_core::errors::TransportError;
use quill_core::transport::{ResponseMetadata, Transport};

/// Engine side of a streamed HTTP response.
///
/// Metadata travels over a oneshot, frames over a bounded channel drained by
/// the response body. When the client goes away hyper drops the pending
/// handler or the body, the receivers go with it, and the transport reports
/// itself closed before anything else is written.
pub struct HttpStreamTransport {
    metadata: Option<oneshot::Sender<ResponseMetadata>>,
    body: Option<mpsc::Sender<Bytes>>,
}

/// Handler side: resolves into the response once metadata arrives.
pub struct PendingResponse {
    metadata: oneshot::Receiver<ResponseMetadata>,
    body: mpsc::Receiver<Bytes>,
}

/// Create a connected transport/response pair. `window` bounds the frames
/// queued for a slow reader.
pub fn channel(window: usize) -> (HttpStreamTransport, PendingResponse) {
    let (meta_tx, meta_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(window.max(1));
    (
        HttpStreamTransport {
            metadata: Some(meta_tx),
            body: Some(body_tx),
        },
        PendingResponse {
            metadata: meta_rx,
            body: body_rx,
        },
    )
}

#[async_trait]
impl Transport for HttpStreamTransport {
    async fn open(&mut self, metadata: ResponseMetadata) -> Result<(), TransportError> {
        let tx = self.metadata.take().ok_or(TransportError::AlreadyOpen)?;
        tx.send(metadata).map_err(|_| TransportError::ConnectionClosed)
    }

    async fn write(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let tx = self.body.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame).await.map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.metadata = None;
        self.body = None;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        match (&self.metadata, &self.body) {
            (Some(tx), _) => tx.is_closed(),
            (None, Some(tx)) => tx.is_closed(),
            (None, None) => true,
        }
    }
}

impl PendingResponse {
    /// Wait for the engine to open the response and build it.
    ///
    /// A transport dropped without metadata yields a bare 500.
    pub async fn into_response(self) -> Response {
        let Ok(metadata) = self.metadata.await else {
            warn!("response closed before metadata was sent");
            return empty(StatusCode::INTERNAL_SERVER_ERROR);
        };

        let body = Body::from_stream(ReceiverStream::new(self.body).map(Ok::<_, Infallible>));
        let mut response = Response::new(body);
        *response.status_mut() =
            StatusCode::from_u16(metadata.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        for (name, value) in &metadata.headers {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                (Ok(name), Ok(value)) => {
                    response.headers_mut().insert(name, value);
                }
                _ => warn!(header = %name, "dropping invalid response header"),
            }
        }
        response
    }
}

fn empty(status: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}
