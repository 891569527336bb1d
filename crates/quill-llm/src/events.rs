use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use quill_core::errors::ModelError;
use quill_core::model::{ModelOptions, DEFAULT_MAX_TOKENS};
use quill_core::stream::TokenEvent;

pub const BEDROCK_ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

/// Which wire flavour of the Anthropic messages API a request targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiFlavor {
    /// Bedrock `InvokeModel*`: model id travels outside the body.
    Bedrock,
    /// api.anthropic.com: model and stream flag inside the body.
    Direct { stream: bool },
}

/// Build a single-user-message request body for `prompt`.
pub fn build_request_body(prompt: &str, options: &ModelOptions, flavor: ApiFlavor) -> Value {
    let mut body = json!({
        "max_tokens": options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": [{
            "role": "user",
            "content": [{"type": "text", "text": prompt}],
        }],
    });

    match flavor {
        ApiFlavor::Bedrock => {
            body["anthropic_version"] = json!(BEDROCK_ANTHROPIC_VERSION);
        }
        ApiFlavor::Direct { stream } => {
            body["model"] = json!(options.model);
            if stream {
                body["stream"] = json!(true);
            }
        }
    }
    if let Some(t) = options.temperature {
        body["temperature"] = json!(t);
    }
    if !options.stop_sequences.is_empty() {
        body["stop_sequences"] = json!(options.stop_sequences);
    }
    body
}

/// Concatenate the text blocks of a non-streamed messages response.
pub fn completion_text(body: &[u8]) -> Result<String, ModelError> {
    let response: CompletionResponse = serde_json::from_slice(body)
        .map_err(|e| ModelError::Unavailable(format!("malformed completion: {e}")))?;
    Ok(response
        .content
        .iter()
        .filter(|b| b.block_type == "text")
        .filter_map(|b| b.text.as_deref())
        .collect())
}

/// State machine turning Anthropic stream events into token events.
#[derive(Debug, Default)]
pub struct EventDecoder {
    input_tokens: u32,
    output_tokens: u32,
    finished: bool,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn usage(&self) -> (u32, u32) {
        (self.input_tokens, self.output_tokens)
    }

    /// Decode a Bedrock chunk payload, whose JSON carries its own `type`.
    pub fn decode_chunk(&mut self, payload: &[u8]) -> Option<Result<TokenEvent, ModelError>> {
        let value: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                return Some(Err(ModelError::Unavailable(format!("malformed chunk: {e}"))));
            }
        };
        let event_type = value.get("type").and_then(|t| t.as_str()).unwrap_or_default();
        self.decode_value(event_type, &value)
    }

    /// Decode one SSE event (`event:` name plus `data:` JSON).
    pub fn parse_event(&mut self, event_type: &str, data: &str) -> Option<Result<TokenEvent, ModelError>> {
        match serde_json::from_str::<Value>(data) {
            Ok(value) => self.decode_value(event_type, &value),
            Err(_) if event_type == "ping" => None,
            Err(e) => Some(Err(ModelError::Unavailable(format!(
                "malformed {event_type} event: {e}"
            )))),
        }
    }

    fn decode_value(&mut self, event_type: &str, value: &Value) -> Option<Result<TokenEvent, ModelError>> {
        if self.finished {
            return None;
        }
        match event_type {
            "message_start" => {
                if let Ok(msg) = serde_json::from_value::<MessageStartEvent>(value.clone()) {
                    if let Some(usage) = msg.message.usage {
                        self.input_tokens = usage.input_tokens.unwrap_or(0);
                    }
                }
                None
            }
            "content_block_delta" => {
                let delta = value.get("delta")?;
                match delta.get("type").and_then(|t| t.as_str()) {
                    Some("text_delta") => {
                        let text = delta.get("text").and_then(|t| t.as_str()).unwrap_or("");
                        Some(Ok(TokenEvent::token(text)))
                    }
                    _ => None,
                }
            }
            "message_delta" => {
                if let Ok(delta) = serde_json::from_value::<MessageDeltaEvent>(value.clone()) {
                    if let Some(usage) = delta.usage {
                        self.output_tokens = usage.output_tokens.unwrap_or(0);
                    }
                    if let Some(reason) = delta.delta.and_then(|d| d.stop_reason) {
                        debug!(stop_reason = %reason, output_tokens = self.output_tokens, "generation stopped");
                    }
                }
                None
            }
            "message_stop" => {
                self.finished = true;
                Some(Ok(TokenEvent::last("")))
            }
            "error" => {
                self.finished = true;
                let message = serde_json::from_value::<ErrorEvent>(value.clone())
                    .map(|e| format!("{}: {}", e.error.error_type, e.error.message))
                    .unwrap_or_else(|_| value.to_string());
                Some(Err(ModelError::Unavailable(message)))
            }
            // ping, content_block_start, content_block_stop
            _ => None,
        }
    }
}

/// Parse raw SSE text into (event_type, data) pairs.
pub fn parse_sse_lines(raw: &str) -> Vec<(String, String)> {
    let mut events = Vec::new();
    let mut current_event = String::new();
    let mut current_data = String::new();

    for line in raw.lines() {
        if let Some(event) = line.strip_prefix("event: ") {
            current_event = event.to_string();
        } else if let Some(data) = line.strip_prefix("data: ") {
            current_data = data.to_string();
        } else if line.is_empty() && !current_event.is_empty() {
            events.push((current_event.clone(), current_data.clone()));
            current_event.clear();
            current_data.clear();
        }
    }

    if !current_event.is_empty() {
        events.push((current_event, current_data));
    }

    events
}

// --- Deserialization types for Anthropic events ---

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    content: Vec<CompletionBlock>,
}

#[derive(Deserialize)]
struct CompletionBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct MessageStartEvent {
    message: MessageStartPayload,
}

#[derive(Deserialize)]
struct MessageStartPayload {
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct UsagePayload {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct MessageDeltaEvent {
    delta: Option<MessageDeltaPayload>,
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct MessageDeltaPayload {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEvent {
    error: ErrorPayload,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(decoder: &mut EventDecoder, events: &[(&str, &str)]) -> Vec<Result<TokenEvent, ModelError>> {
        events
            .iter()
            .filter_map(|(t, d)| decoder.parse_event(t, d))
            .collect()
    }

    #[test]
    fn decodes_text_stream() {
        let mut decoder = EventDecoder::new();
        let out = collect(
            &mut decoder,
            &[
                ("message_start", r#"{"type":"message_start","message":{"usage":{"input_tokens":42,"output_tokens":1}}}"#),
                ("content_block_start", r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#),
                ("ping", r#"{"type": "ping"}"#),
                ("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Final"}}"#),
                ("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":" Answer: 256"}}"#),
                ("content_block_stop", r#"{"type":"content_block_stop","index":0}"#),
                ("message_delta", r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":7}}"#),
                ("message_stop", r#"{"type":"message_stop"}"#),
            ],
        );

        let events: Vec<TokenEvent> = out.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            events,
            vec![
                TokenEvent::token("Final"),
                TokenEvent::token(" Answer: 256"),
                TokenEvent::last(""),
            ]
        );
        assert_eq!(decoder.usage(), (42, 7));
        assert!(decoder.parse_event("content_block_delta", r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"late"}}"#).is_none());
    }

    #[test]
    fn error_event_terminates() {
        let mut decoder = EventDecoder::new();
        let out = collect(
            &mut decoder,
            &[
                ("content_block_delta", r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"a"}}"#),
                ("error", r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#),
                ("content_block_delta", r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"b"}}"#),
            ],
        );
        assert_eq!(out.len(), 2);
        assert!(out[0].is_ok());
        assert!(matches!(
            &out[1],
            Err(ModelError::Unavailable(msg)) if msg.contains("overloaded_error") && msg.contains("Overloaded")
        ));
    }

    #[test]
    fn decodes_bedrock_chunks() {
        let mut decoder = EventDecoder::new();
        let token = decoder
            .decode_chunk(br#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(token, TokenEvent::token("Hi"));
        let last = decoder.decode_chunk(br#"{"type":"message_stop"}"#).unwrap().unwrap();
        assert!(last.is_final);
        assert!(decoder.decode_chunk(br#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"late"}}"#).is_none());
    }

    #[test]
    fn malformed_chunk_is_unavailable() {
        let mut decoder = EventDecoder::new();
        assert!(matches!(
            decoder.decode_chunk(b"{not json"),
            Some(Err(ModelError::Unavailable(_)))
        ));
    }

    #[test]
    fn bedrock_body_shape() {
        let options = ModelOptions {
            temperature: Some(0.0),
            stop_sequences: vec!["\nObservation:".into()],
            ..Default::default()
        };
        let body = build_request_body("What is 2^8?", &options, ApiFlavor::Bedrock);
        assert_eq!(body["anthropic_version"], BEDROCK_ANTHROPIC_VERSION);
        assert_eq!(body["max_tokens"], 1024);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"][0]["text"], "What is 2^8?");
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["stop_sequences"][0], "\nObservation:");
        assert!(body.get("model").is_none());
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn direct_body_carries_model_and_stream() {
        let options = ModelOptions {
            model: "claude-3-5-haiku-latest".into(),
            ..Default::default()
        };
        let body = build_request_body("hi", &options, ApiFlavor::Direct { stream: true });
        assert_eq!(body["model"], "claude-3-5-haiku-latest");
        assert_eq!(body["stream"], true);
        assert!(body.get("anthropic_version").is_none());
        assert!(body.get("temperature").is_none());
        assert!(body.get("stop_sequences").is_none());

        let body = build_request_body("hi", &options, ApiFlavor::Direct { stream: false });
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn completion_text_joins_text_blocks() {
        let body = br#"{"content":[{"type":"text","text":"Final Answer: "},{"type":"text","text":"256"}],"stop_reason":"end_turn"}"#;
        assert_eq!(completion_text(body).unwrap(), "Final Answer: 256");
        assert!(completion_text(b"oops").is_err());
    }

    #[test]
    fn sse_lines() {
        let raw = "event: message_start\ndata: {}\n\nevent: message_stop\ndata: {\"type\":\"message_stop\"}";
        let events = parse_sse_lines(raw);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "message_start");
        assert_eq!(events[1].1, r#"{"type":"message_stop"}"#);
    }
}
