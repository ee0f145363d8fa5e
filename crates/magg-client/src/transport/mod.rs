//! Client transport layer
//!
//! A transport yields a bidirectional MCP message stream when opened and
//! releases its OS resources when closed. Selection from a launch spec:
//!
//! - `command` present: stdio child process (with runner-specific argv)
//! - `uri` ending in `/sse` or `/sse/`: server-sent events
//! - other http(s) `uri`: streamable HTTP

mod http;
mod sse;
mod stdio;

pub use http::HttpTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;

use crate::types::McpMessage;
use async_trait::async_trait;
use magg_core::error::{Error, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// How to reach one backend, extracted from its server configuration.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub uri: Option<String>,
    pub transport: Option<Map<String, Value>>,
}

/// Message streams produced by an open transport.
#[derive(Debug)]
pub struct TransportStreams {
    /// Messages arriving from the server.
    pub incoming: mpsc::UnboundedReceiver<McpMessage>,
    /// Sender for messages going to the server.
    pub outgoing: mpsc::UnboundedSender<McpMessage>,
}

/// Client transport - implement for new transport types.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection and return the message streams.
    async fn open(&mut self) -> Result<TransportStreams>;

    /// Close the connection and release resources. Idempotent.
    async fn close(&mut self) -> Result<()>;

    /// Short human-readable endpoint description for logs.
    fn describe(&self) -> String;
}

/// Select a concrete transport for a launch spec.
pub fn select_transport(spec: LaunchSpec) -> Result<Box<dyn Transport>> {
    if spec.command.as_deref().map_or(false, |c| !c.is_empty()) {
        return Ok(Box::new(StdioTransport::new(spec)));
    }

    let uri = spec
        .uri
        .as_deref()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| Error::validation("launch spec has neither command nor uri"))?;

    if !uri.starts_with("http://") && !uri.starts_with("https://") {
        return Err(Error::validation(format!(
            "unsupported uri scheme: {:?}",
            uri
        )));
    }

    if uri.trim_end_matches('/').ends_with("/sse") {
        Ok(Box::new(SseTransport::new(spec)))
    } else {
        Ok(Box::new(HttpTransport::new(spec)))
    }
}

/// Read the `headers` transport option into header pairs.
pub(crate) fn header_options(transport: Option<&Map<String, Value>>) -> Vec<(String, String)> {
    transport
        .and_then(|t| t.get("headers"))
        .and_then(Value::as_object)
        .map(|headers| {
            headers
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Read the `auth` transport option as a bearer token, when it is one.
pub(crate) fn bearer_option(transport: Option<&Map<String, Value>>) -> Option<String> {
    let auth = transport?.get("auth")?.as_str()?;
    if auth == "oauth" {
        // OAuth flows belong to higher-level tooling.
        None
    } else {
        Some(auth.to_string())
    }
}

/// Read the `sse_read_timeout` transport option in seconds.
pub(crate) fn sse_read_timeout(transport: Option<&Map<String, Value>>) -> Option<f64> {
    transport?.get("sse_read_timeout")?.as_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec_with_uri(uri: &str) -> LaunchSpec {
        LaunchSpec {
            uri: Some(uri.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_select_stdio_for_command() {
        let spec = LaunchSpec {
            command: Some("python".into()),
            args: vec!["server.py".into()],
            ..Default::default()
        };
        let transport = select_transport(spec).unwrap();
        assert!(transport.describe().contains("python"));
    }

    #[test]
    fn test_select_sse_for_sse_uri() {
        for uri in ["http://localhost:8000/sse", "https://host/sse/"] {
            let transport = select_transport(spec_with_uri(uri)).unwrap();
            assert!(transport.describe().starts_with("sse"), "{}", uri);
        }
    }

    #[test]
    fn test_select_http_for_plain_uri() {
        let transport = select_transport(spec_with_uri("http://localhost:8000/mcp/")).unwrap();
        assert!(transport.describe().starts_with("http"));
    }

    #[test]
    fn test_select_rejects_empty_spec() {
        assert!(select_transport(LaunchSpec::default()).is_err());
        assert!(select_transport(spec_with_uri("ftp://example.com")).is_err());
    }

    #[test]
    fn test_transport_option_readers() {
        let t = json!({
            "headers": {"X-Key": "v", "skipped": 4},
            "auth": "token123",
            "sse_read_timeout": 30.0,
        });
        let t = t.as_object().unwrap();
        assert_eq!(header_options(Some(t)), vec![("X-Key".to_string(), "v".to_string())]);
        assert_eq!(bearer_option(Some(t)).as_deref(), Some("token123"));
        assert_eq!(sse_read_timeout(Some(t)), Some(30.0));

        let oauth = json!({"auth": "oauth"});
        assert_eq!(bearer_option(Some(oauth.as_object().unwrap())), None);
    }
}
