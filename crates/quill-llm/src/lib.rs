pub mod anthropic;
pub mod bedrock;
pub mod events;
pub mod timeout;

pub mod mock;

pub use anthropic::AnthropicClient;
pub use bedrock::BedrockClient;
pub use mock::{MockModelClient, MockResponse};
