pub mod config;
pub mod prompt;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod runner;
pub mod tools;
pub mod transport;
pub mod truncate;

pub use config::EngineConfig;
pub use registry::{RegistryError, ToolRegistry};
pub use runner::{AbortReason, AgentRunner, Outcome, RunReport};
pub use transport::{CloseState, MemoryTransport, StdoutTransport, TransportAdapter};
