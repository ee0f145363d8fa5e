//! Server-sent events transport
//!
//! Opens a long-lived GET stream for server-to-client messages and POSTs
//! client-to-server messages to the endpoint the server announces (falling
//! back to `/message` next to the SSE path). Responses may arrive on either
//! channel; both feed the same incoming stream.

use super::http::{build_http_client, failure_response, post_message};
use super::{LaunchSpec, Transport, TransportStreams};
use crate::types::McpMessage;
use async_trait::async_trait;
use futures::StreamExt;
use magg_core::error::{Error, Result};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct SseTransport {
    spec: LaunchSpec,
    close_tx: Option<mpsc::UnboundedSender<()>>,
}

impl SseTransport {
    pub fn new(spec: LaunchSpec) -> Self {
        Self {
            spec,
            close_tx: None,
        }
    }

    /// Default POST endpoint derived from the SSE URL.
    fn default_post_url(sse_url: &str) -> String {
        let base = sse_url.trim_end_matches('/');
        match base.strip_suffix("/sse") {
            Some(root) => format!("{}/message", root),
            None => format!("{}/message", base),
        }
    }

    /// Resolve an endpoint announcement against the SSE URL.
    fn resolve_endpoint(sse_url: &str, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }
        // Scheme + authority from the SSE URL, path from the announcement.
        if let Some(scheme_end) = sse_url.find("://") {
            let after_scheme = &sse_url[scheme_end + 3..];
            let authority_end = after_scheme.find('/').unwrap_or(after_scheme.len());
            let origin = &sse_url[..scheme_end + 3 + authority_end];
            return format!("{}/{}", origin, endpoint.trim_start_matches('/'));
        }
        endpoint.to_string()
    }
}

/// One parsed SSE event.
#[derive(Debug, Default, Clone, PartialEq)]
struct SseEvent {
    event: String,
    data: String,
}

/// Incremental SSE parser over arriving byte chunks.
#[derive(Default)]
struct SseParser {
    buffer: String,
}

impl SseParser {
    fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos + 2).collect();
            let mut event = SseEvent::default();
            for line in block.lines() {
                if let Some(value) = line.strip_prefix("event:") {
                    event.event = value.trim().to_string();
                } else if let Some(value) = line.strip_prefix("data:") {
                    if !event.data.is_empty() {
                        event.data.push('\n');
                    }
                    event.data.push_str(value.trim_start());
                }
            }
            if !event.event.is_empty() || !event.data.is_empty() {
                events.push(event);
            }
        }

        events
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn open(&mut self) -> Result<TransportStreams> {
        let sse_url = self
            .spec
            .uri
            .clone()
            .ok_or_else(|| Error::validation("sse transport requires a uri"))?;
        let client = build_http_client(&self.spec)?;

        let response = client
            .get(&sse_url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| Error::connect(format!("failed to connect to {}: {}", sse_url, e)))?;

        if !response.status().is_success() {
            return Err(Error::connect(format!(
                "SSE endpoint {} returned {}",
                sse_url,
                response.status()
            )));
        }

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<McpMessage>();
        let (close_tx, mut close_rx) = mpsc::unbounded_channel();
        let (endpoint_tx, mut endpoint_rx) = mpsc::unbounded_channel::<String>();
        self.close_tx = Some(close_tx);

        // Reader: SSE byte stream -> events -> incoming messages
        let reader_incoming = incoming_tx.clone();
        let reader_url = sse_url.clone();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut parser = SseParser::default();

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(url = %reader_url, error = %e, "SSE stream error");
                        break;
                    }
                };
                let text = String::from_utf8_lossy(&chunk);
                for event in parser.push(&text) {
                    match event.event.as_str() {
                        "endpoint" => {
                            debug!(endpoint = %event.data, "SSE endpoint announced");
                            let _ = endpoint_tx.send(event.data);
                        }
                        "" | "message" => {
                            match serde_json::from_str::<McpMessage>(&event.data) {
                                Ok(message) => {
                                    if reader_incoming.send(message).is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    warn!(error = %e, "Discarding unparseable SSE event");
                                }
                            }
                        }
                        other => {
                            debug!(event = %other, "Ignoring SSE event");
                        }
                    }
                }
            }
            debug!(url = %reader_url, "SSE stream ended");
        });

        // Writer: outgoing messages -> POST to the announced endpoint
        let writer_url = sse_url.clone();
        tokio::spawn(async move {
            let mut post_url = Self::default_post_url(&writer_url);
            loop {
                tokio::select! {
                    _ = close_rx.recv() => break,
                    endpoint = endpoint_rx.recv() => {
                        if let Some(endpoint) = endpoint {
                            post_url = Self::resolve_endpoint(&writer_url, &endpoint);
                        }
                    }
                    message = outgoing_rx.recv() => {
                        let Some(message) = message else { break };
                        match post_message(&client, &post_url, &message).await {
                            Ok(Some(response)) => {
                                if incoming_tx.send(response).is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!(url = %post_url, error = %e, "SSE POST failed");
                                if let Some(response) = failure_response(&message, &e) {
                                    if incoming_tx.send(response).is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });

        Ok(TransportStreams {
            incoming: incoming_rx,
            outgoing: outgoing_tx,
        })
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(());
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("sse {}", self.spec.uri.as_deref().unwrap_or("<none>"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_post_url() {
        assert_eq!(
            SseTransport::default_post_url("http://host:8000/sse"),
            "http://host:8000/message"
        );
        assert_eq!(
            SseTransport::default_post_url("http://host:8000/sse/"),
            "http://host:8000/message"
        );
    }

    #[test]
    fn test_resolve_endpoint() {
        assert_eq!(
            SseTransport::resolve_endpoint("http://host:8000/sse", "/mcp"),
            "http://host:8000/mcp"
        );
        assert_eq!(
            SseTransport::resolve_endpoint("http://host:8000/sse", "http://other/x"),
            "http://other/x"
        );
    }

    #[test]
    fn test_sse_parser_accumulates_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.push("event: message\ndata: {\"a\"").is_empty());
        let events = parser.push(":1}\n\nevent: ping\ndata: {}\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[1].event, "ping");
    }

    #[test]
    fn test_sse_parser_multiline_data() {
        let mut parser = SseParser::default();
        let events = parser.push("data: line1\ndata: line2\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "line1\nline2");
    }
}
