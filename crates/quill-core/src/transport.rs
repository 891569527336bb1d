use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::TransportError;

pub const CONTENT_TYPE_EVENT_STREAM: &str = "text/event-stream; charset=utf-8";
pub const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";

/// How relayed tokens are framed on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameFormat {
    /// Token text as-is, one chunk per token.
    #[default]
    Raw,
    /// `token: <text>\n` per token.
    TokenLine,
}

impl FrameFormat {
    pub fn encode(&self, text: &str) -> Bytes {
        match self {
            Self::Raw => Bytes::copy_from_slice(text.as_bytes()),
            Self::TokenLine => Bytes::from(format!("token: {text}\n")),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Raw => CONTENT_TYPE_TEXT,
            Self::TokenLine => CONTENT_TYPE_EVENT_STREAM,
        }
    }
}

/// Status line and headers written once, before any body bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl ResponseMetadata {
    pub fn streaming(format: FrameFormat) -> Self {
        Self {
            status: 200,
            headers: vec![("content-type".into(), format.content_type().into())],
        }
    }

    pub fn error(status: u16) -> Self {
        Self {
            status,
            headers: vec![("content-type".into(), CONTENT_TYPE_TEXT.into())],
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Raw outbound connection of one request.
///
/// Implementations only move bytes; ordering rules (open once, close once)
/// are enforced by the engine's adapter around them.
#[async_trait]
pub trait Transport: Send {
    async fn open(&mut self, metadata: ResponseMetadata) -> Result<(), TransportError>;

    /// Write one frame. Waits while the connection cannot accept more bytes.
    async fn write(&mut self, frame: Bytes) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;

    /// True once the peer is known to be gone, even if nothing was written.
    fn is_closed(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_frames_are_passthrough() {
        assert_eq!(FrameFormat::Raw.encode(" 256"), Bytes::from_static(b" 256"));
    }

    #[test]
    fn token_line_frames() {
        assert_eq!(
            FrameFormat::TokenLine.encode("The"),
            Bytes::from_static(b"token: The\n")
        );
    }

    #[test]
    fn streaming_metadata_content_types() {
        let meta = ResponseMetadata::streaming(FrameFormat::TokenLine);
        assert_eq!(meta.status, 200);
        assert_eq!(meta.header("Content-Type"), Some(CONTENT_TYPE_EVENT_STREAM));

        let meta = ResponseMetadata::streaming(FrameFormat::Raw);
        assert_eq!(meta.header("content-type"), Some(CONTENT_TYPE_TEXT));
    }

    #[test]
    fn error_metadata() {
        let meta = ResponseMetadata::error(502);
        assert_eq!(meta.status, 502);
        assert!(meta.header("x-missing").is_none());
    }

    #[test]
    fn frame_format_serde() {
        let json = serde_json::to_string(&FrameFormat::TokenLine).unwrap();
        assert_eq!(json, r#""token_line""#);
        let parsed: FrameFormat = serde_json::from_str(r#""raw""#).unwrap();
        assert_eq!(parsed, FrameFormat::Raw);
    }
}
