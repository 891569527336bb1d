use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::errors::ModelError;

/// One incremental unit of generated text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEvent {
    pub text: String,
    pub is_final: bool,
}

impl TokenEvent {
    pub fn token(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    /// Terminal event. May carry trailing text or be empty.
    pub fn last(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Finite, single-pass sequence of token events for one generation.
///
/// The last `Ok` item has `is_final = true`. An upstream failure is yielded as
/// an `Err` item and nothing follows it. Dropping the stream cancels generation.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<TokenEvent, ModelError>> + Send>>;
