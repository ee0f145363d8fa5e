//! MCP client support for magg
//!
//! # Modules
//!
//! - `types`: JSON-RPC frames and MCP entities (tools, resources, prompts)
//! - `command`: launch-spec to argv mapping for spawned servers
//! - `transport`: stdio, streamable-http, and SSE client transports
//! - `client`: the MCP client session used for each mounted backend
//! - `transform`: proxy-result embedding and extraction
//! - `proxy`: proxy-aware client with transparent mode

pub mod client;
pub mod command;
pub mod proxy;
pub mod test_utils;
pub mod transform;
pub mod transport;
pub mod types;

pub use client::{ClientConfig, McpClient, McpService, NotificationHandler};
pub use proxy::{ProxyClient, ProxyQueryResult, PROXY_TOOL_NAME};
pub use transport::{select_transport, Transport, TransportStreams};
pub use types::*;
