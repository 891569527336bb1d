use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::Stream;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, instrument};

use quill_core::errors::ModelError;
use quill_core::model::{ModelClient, ModelOptions};
use quill_core::stream::{TokenEvent, TokenStream};

use crate::events::{self, ApiFlavor, EventDecoder};
use crate::timeout::with_idle_timeout;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Anthropic messages API over HTTPS with an API key.
pub struct AnthropicClient {
    client: Client,
    api_key: SecretString,
    url: String,
}

impl AnthropicClient {
    pub fn new(api_key: SecretString) -> Result<Self, ModelError> {
        Self::with_url(api_key, API_URL)
    }

    pub fn with_url(api_key: SecretString, url: impl Into<String>) -> Result<Self, ModelError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ModelError::Unavailable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            api_key,
            url: url.into(),
        })
    }

    async fn send(
        &self,
        prompt: &str,
        options: &ModelOptions,
        stream: bool,
    ) -> Result<reqwest::Response, ModelError> {
        let body = events::build_request_body(prompt, options, ApiFlavor::Direct { stream });
        let request = self
            .client
            .post(&self.url)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .header("accept", "application/json")
            .header("content-type", "application/json")
            .json(&body)
            .send();

        let resp = tokio::time::timeout(options.timeout, request)
            .await
            .map_err(|_| ModelError::Timeout(options.timeout))?
            .map_err(|e| map_reqwest_error(e, options.timeout))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ModelError::from_status(status, body, options.timeout));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    #[instrument(skip(self, prompt, options), fields(model = %options.model))]
    async fn complete(&self, prompt: &str, options: &ModelOptions) -> Result<String, ModelError> {
        let started = Instant::now();
        let body = tokio::time::timeout(options.timeout, async {
            let resp = self.send(prompt, options, false).await?;
            resp.bytes()
                .await
                .map_err(|e| map_reqwest_error(e, options.timeout))
        })
        .await
        .map_err(|_| ModelError::Timeout(options.timeout))??;

        let text = events::completion_text(&body)?;
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "completion received");
        Ok(text)
    }

    #[instrument(skip(self, prompt, options), fields(model = %options.model))]
    async fn stream(&self, prompt: &str, options: &ModelOptions) -> Result<TokenStream, ModelError> {
        let resp = self.send(prompt, options, true).await?;
        let sse = SseStream::new(resp.bytes_stream());
        Ok(with_idle_timeout(sse, options.timeout))
    }
}

fn map_reqwest_error(err: reqwest::Error, timeout: Duration) -> ModelError {
    if err.is_timeout() {
        ModelError::Timeout(timeout)
    } else {
        ModelError::Unavailable(err.to_string())
    }
}

/// Turns a reqwest byte stream into token events.
///
/// Bytes are buffered raw and only complete events are decoded, so a
/// character split across network chunks arrives intact.
struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    decoder: EventDecoder,
    buffer: Vec<u8>,
    pending: VecDeque<Result<TokenEvent, ModelError>>,
}

impl SseStream {
    fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            decoder: EventDecoder::new(),
            buffer: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    /// Decode every complete event in the buffer.
    fn drain_complete(&mut self) {
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let chunk: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            self.drain_events(&chunk);
        }
    }

    fn drain_events(&mut self, chunk: &[u8]) {
        let chunk = match std::str::from_utf8(chunk) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.pending.push_back(Err(ModelError::Unavailable(format!(
                    "invalid utf-8 in event stream: {e}"
                ))));
                return;
            }
        };
        for (event_type, data) in events::parse_sse_lines(chunk) {
            if let Some(item) = self.decoder.parse_event(&event_type, &data) {
                self.pending.push_back(item);
            }
        }
    }
}

impl Stream for SseStream {
    type Item = Result<TokenEvent, ModelError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(item) = self.pending.pop_front() {
            return Poll::Ready(Some(item));
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    self.buffer.extend_from_slice(&bytes);
                    self.drain_complete();

                    if let Some(item) = self.pending.pop_front() {
                        return Poll::Ready(Some(item));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(ModelError::Unavailable(format!(
                        "stream interrupted: {e}"
                    )))));
                }
                Poll::Ready(None) => {
                    if !self.buffer.is_empty() {
                        let remaining = std::mem::take(&mut self.buffer);
                        self.drain_events(&remaining);
                    }
                    return Poll::Ready(self.pending.pop_front());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
