//! # Deep Research MCP
//!
//! MCP server exposing the deep-research task orchestrator over JSON-RPC
//! 2.0. The six tools (`start`, `status`, `get`, `cancel`, `estimate`,
//! `save`) are thin request handlers over [`deepresearch_core`]'s engine;
//! all lifecycle logic lives in the core crate.

pub mod error;
pub mod handlers;
pub mod protocol;
pub mod server;
pub mod tools;
pub mod transport;

pub use error::McpError;
pub use handlers::RequestHandler;
pub use server::serve;
pub use tools::ToolSurface;
pub use transport::{ChannelTransport, StdioTransport, Transport};
