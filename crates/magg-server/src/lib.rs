//! magg - MCP aggregator server
//!
//! A single MCP server that mounts many backend MCP servers and exposes
//! their tools, resources, and prompts under per-server prefixes, plus a
//! generic `proxy` tool for namespace-free introspection and calls.
//!
//! # Modules
//!
//! - `messaging`: notification router and backend-to-client forwarding
//! - `manager`: backend lifecycle - mount, unmount, probe
//! - `proxy`: the proxy tool dispatch and in-process loopback client
//! - `server`: the front-end MCP surface and management tools
//! - `transport`: stdio and HTTP/SSE front transports
//! - `runner`: process lifecycle and signal handling

pub mod manager;
pub mod messaging;
pub mod proxy;
pub mod runner;
pub mod server;
pub mod transport;

pub use manager::{HealthState, MountedServer, ServerManager};
pub use messaging::{MessageHandler, MessageRouter, ServerMessageCoordinator, ServerNotification};
pub use proxy::LoopbackClient;
pub use runner::MaggRunner;
pub use server::MaggServer;
pub use transport::McpHandler;
