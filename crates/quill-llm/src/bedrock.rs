use std::time::{Duration, Instant};

use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_bedrockruntime::config::Region;
use aws_sdk_bedrockruntime::error::{DisplayErrorContext, SdkError};
use aws_sdk_bedrockruntime::primitives::event_stream::EventReceiver;
use aws_sdk_bedrockruntime::primitives::Blob;
use aws_sdk_bedrockruntime::types::error::ResponseStreamError;
use aws_sdk_bedrockruntime::types::ResponseStream;
use aws_sdk_bedrockruntime::Client;
use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

use quill_core::errors::ModelError;
use quill_core::model::{ModelClient, ModelOptions};
use quill_core::stream::{TokenEvent, TokenStream};

use crate::events::{self, ApiFlavor, EventDecoder};
use crate::timeout::with_idle_timeout;

const CONTENT_TYPE_JSON: &str = "application/json";

/// Anthropic models served through AWS Bedrock.
///
/// Credentials come from the default AWS provider chain. One SDK client is
/// kept per region; `ModelOptions::region` picks it.
pub struct BedrockClient {
    sdk_config: SdkConfig,
    clients: DashMap<String, Client>,
}

impl BedrockClient {
    pub async fn new(region: &str) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        info!(region, "bedrock client initialised");
        Self::from_sdk_config(sdk_config)
    }

    pub fn from_sdk_config(sdk_config: SdkConfig) -> Self {
        Self {
            sdk_config,
            clients: DashMap::new(),
        }
    }

    fn client_for(&self, region: &str) -> Client {
        self.clients
            .entry(region.to_string())
            .or_insert_with(|| {
                let conf = aws_sdk_bedrockruntime::config::Builder::from(&self.sdk_config)
                    .region(Region::new(region.to_string()))
                    .build();
                Client::from_conf(conf)
            })
            .clone()
    }

    fn request_body(prompt: &str, options: &ModelOptions) -> Result<Blob, ModelError> {
        let body = events::build_request_body(prompt, options, ApiFlavor::Bedrock);
        serde_json::to_vec(&body)
            .map(Blob::new)
            .map_err(|e| ModelError::Unavailable(format!("request encoding: {e}")))
    }
}

#[async_trait]
impl ModelClient for BedrockClient {
    fn name(&self) -> &str {
        "bedrock"
    }

    #[instrument(skip(self, prompt, options), fields(model = %options.model, region = %options.region))]
    async fn complete(&self, prompt: &str, options: &ModelOptions) -> Result<String, ModelError> {
        let started = Instant::now();
        let request = self
            .client_for(&options.region)
            .invoke_model()
            .model_id(&options.model)
            .content_type(CONTENT_TYPE_JSON)
            .accept(CONTENT_TYPE_JSON)
            .body(Self::request_body(prompt, options)?)
            .send();

        let output = tokio::time::timeout(options.timeout, request)
            .await
            .map_err(|_| ModelError::Timeout(options.timeout))?
            .map_err(|e| map_sdk_error(e, options.timeout))?;

        let text = events::completion_text(output.body().as_ref())?;
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, chars = text.len(), "completion received");
        Ok(text)
    }

    #[instrument(skip(self, prompt, options), fields(model = %options.model, region = %options.region))]
    async fn stream(&self, prompt: &str, options: &ModelOptions) -> Result<TokenStream, ModelError> {
        let request = self
            .client_for(&options.region)
            .invoke_model_with_response_stream()
            .model_id(&options.model)
            .content_type(CONTENT_TYPE_JSON)
            .accept(CONTENT_TYPE_JSON)
            .body(Self::request_body(prompt, options)?)
            .send();

        let output = tokio::time::timeout(options.timeout, request)
            .await
            .map_err(|_| ModelError::Timeout(options.timeout))?
            .map_err(|e| map_sdk_error(e, options.timeout))?;

        let chunks = chunk_stream(output.body, options.timeout);
        Ok(with_idle_timeout(chunks, options.timeout))
    }
}

/// Drive the Bedrock event receiver, decoding each `chunk` payload.
fn chunk_stream(
    receiver: EventReceiver<ResponseStream, ResponseStreamError>,
    timeout: Duration,
) -> impl futures::Stream<Item = Result<TokenEvent, ModelError>> + Send {
    let state = (receiver, EventDecoder::new());
    futures::stream::unfold(Some(state), move |state| async move {
        let (mut receiver, mut decoder) = state?;
        loop {
            match receiver.recv().await {
                Ok(Some(ResponseStream::Chunk(part))) => {
                    let Some(bytes) = part.bytes() else { continue };
                    match decoder.decode_chunk(bytes.as_ref()) {
                        Some(Ok(event)) if event.is_final => {
                            let (input, output) = decoder.usage();
                            debug!(input_tokens = input, output_tokens = output, "bedrock stream finished");
                            return Some((Ok(event), None));
                        }
                        Some(Ok(event)) => return Some((Ok(event), Some((receiver, decoder)))),
                        Some(Err(e)) => return Some((Err(e), None)),
                        None => continue,
                    }
                }
                Ok(Some(other)) => {
                    debug!(event = ?other, "ignoring bedrock stream event");
                }
                Ok(None) => return None,
                Err(e) => {
                    warn!(error = %DisplayErrorContext(&e), "bedrock stream failed");
                    return Some((Err(map_sdk_error(e, timeout)), None));
                }
            }
        }
    })
}

/// Fold an SDK failure into the model error taxonomy.
pub fn map_sdk_error<E, R>(err: SdkError<E, R>, timeout: Duration) -> ModelError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match err {
        SdkError::TimeoutError(_) => ModelError::Timeout(timeout),
        other => ModelError::Unavailable(DisplayErrorContext(&other).to_string()),
    }
}
