use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;

use quill_core::errors::ModelError;
use quill_core::model::{ModelClient, ModelOptions};
use quill_core::stream::{TokenEvent, TokenStream};

/// Pre-programmed generations for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield these tokens, then an empty final event.
    Tokens(Vec<String>),
    /// Yield these tokens, then fail mid-stream.
    FailAfter(Vec<String>, ModelError),
    /// Fail the call itself.
    Error(ModelError),
    /// Wait, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
    /// Yield the same token forever.
    Endless(String),
}

impl MockResponse {
    /// Split `text` into word-sized tokens, keeping the spaces.
    pub fn text(text: &str) -> Self {
        Self::Tokens(text.split_inclusive(' ').map(str::to_string).collect())
    }

    pub fn tokens(tokens: &[&str]) -> Self {
        Self::Tokens(tokens.iter().map(|t| t.to_string()).collect())
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

#[derive(Default)]
struct StreamCounters {
    pulled: AtomicUsize,
    dropped: AtomicUsize,
}

/// Model client that replays scripted responses in order.
pub struct MockModelClient {
    responses: Mutex<VecDeque<MockResponse>>,
    /// Served once the script runs out.
    fallback: Option<MockResponse>,
    prompts: Mutex<Vec<String>>,
    stream_calls: AtomicUsize,
    complete_calls: AtomicUsize,
    counters: Arc<StreamCounters>,
}

impl MockModelClient {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            fallback: None,
            prompts: Mutex::new(Vec::new()),
            stream_calls: AtomicUsize::new(0),
            complete_calls: AtomicUsize::new(0),
            counters: Arc::new(StreamCounters::default()),
        }
    }

    /// Client that answers every call with `response`.
    pub fn repeating(response: MockResponse) -> Self {
        Self {
            fallback: Some(response),
            ..Self::new(Vec::new())
        }
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::Relaxed)
    }

    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::Relaxed)
    }

    /// Every prompt received, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    /// Items handed out across all streams.
    pub fn tokens_pulled(&self) -> usize {
        self.counters.pulled.load(Ordering::SeqCst)
    }

    /// Streams dropped by the consumer, finished or not.
    pub fn streams_dropped(&self) -> usize {
        self.counters.dropped.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().len()
    }

    fn next_response(&self, prompt: &str, call: usize) -> Result<MockResponse, ModelError> {
        self.prompts.lock().push(prompt.to_string());
        self.responses
            .lock()
            .pop_front()
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| ModelError::Unavailable(format!("mock: no response configured for call {call}")))
    }
}

/// Resolve delays iteratively, leaving a terminal response.
async fn settle(mut response: MockResponse) -> MockResponse {
    while let MockResponse::Delay(delay, inner) = response {
        tokio::time::sleep(delay).await;
        response = *inner;
    }
    response
}

#[async_trait]
impl ModelClient for MockModelClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, prompt: &str, _options: &ModelOptions) -> Result<String, ModelError> {
        let call = self.complete_calls.fetch_add(1, Ordering::Relaxed);
        match settle(self.next_response(prompt, call)?).await {
            MockResponse::Tokens(tokens) => Ok(tokens.concat()),
            MockResponse::FailAfter(_, e) | MockResponse::Error(e) => Err(e),
            MockResponse::Endless(_) => Err(ModelError::Unavailable("mock: endless completion".into())),
            MockResponse::Delay(..) => Err(ModelError::Unavailable("mock: unresolved delay".into())),
        }
    }

    async fn stream(&self, prompt: &str, _options: &ModelOptions) -> Result<TokenStream, ModelError> {
        let call = self.stream_calls.fetch_add(1, Ordering::Relaxed);
        let script = match settle(self.next_response(prompt, call)?).await {
            MockResponse::Tokens(tokens) => {
                let mut items: VecDeque<_> = tokens.into_iter().map(|t| Ok(TokenEvent::token(t))).collect();
                items.push_back(Ok(TokenEvent::last("")));
                Script::Finite(items)
            }
            MockResponse::FailAfter(tokens, e) => {
                let mut items: VecDeque<_> = tokens.into_iter().map(|t| Ok(TokenEvent::token(t))).collect();
                items.push_back(Err(e));
                Script::Finite(items)
            }
            MockResponse::Error(e) => return Err(e),
            MockResponse::Endless(token) => Script::Endless(token),
            MockResponse::Delay(..) => return Err(ModelError::Unavailable("mock: unresolved delay".into())),
        };
        Ok(Box::pin(MockStream {
            script,
            counters: Arc::clone(&self.counters),
        }))
    }
}

enum Script {
    Finite(VecDeque<Result<TokenEvent, ModelError>>),
    Endless(String),
}

struct MockStream {
    script: Script,
    counters: Arc<StreamCounters>,
}

impl Stream for MockStream {
    type Item = Result<TokenEvent, ModelError>;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let item = match &mut self.script {
            Script::Finite(items) => items.pop_front(),
            Script::Endless(token) => Some(Ok(TokenEvent::token(token.clone()))),
        };
        if item.is_some() {
            self.counters.pulled.fetch_add(1, Ordering::SeqCst);
        }
        Poll::Ready(item)
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        self.counters.dropped.fetch_add(1, Ordering::SeqCst);
    }
}
