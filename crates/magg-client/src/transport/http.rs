//! Streamable HTTP transport
//!
//! Each outgoing request is POSTed to the server's MCP endpoint and the JSON
//! response is fed back into the incoming stream. Notifications are POSTed
//! fire-and-forget. Connection failures surface as synthesized error
//! responses so the pending request resolves instead of hanging.

use super::{bearer_option, header_options, sse_read_timeout, LaunchSpec, Transport, TransportStreams};
use crate::types::{JsonRpcError, McpMessage, McpResponse};
use async_trait::async_trait;
use magg_core::error::{Error, Result};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpTransport {
    spec: LaunchSpec,
    close_tx: Option<mpsc::UnboundedSender<()>>,
}

impl HttpTransport {
    pub fn new(spec: LaunchSpec) -> Self {
        Self {
            spec,
            close_tx: None,
        }
    }
}

/// Build a reqwest client carrying the configured headers and bearer auth.
pub(crate) fn build_http_client(spec: &LaunchSpec) -> Result<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();

    for (name, value) in header_options(spec.transport.as_ref()) {
        let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| Error::validation(format!("invalid header name {:?}", name)))?;
        let value = value
            .parse()
            .map_err(|_| Error::validation("invalid header value"))?;
        headers.insert(name, value);
    }

    if let Some(token) = bearer_option(spec.transport.as_ref()) {
        headers.insert(
            reqwest::header::AUTHORIZATION,
            format!("Bearer {}", token)
                .parse()
                .map_err(|_| Error::validation("invalid bearer token"))?,
        );
    }

    let timeout = sse_read_timeout(spec.transport.as_ref())
        .map(Duration::from_secs_f64)
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .map_err(|e| Error::connect(format!("failed to build HTTP client: {}", e)))
}

/// POST one message and return the parsed response body, when there is one.
pub(crate) async fn post_message(
    client: &reqwest::Client,
    url: &str,
    message: &McpMessage,
) -> Result<Option<McpMessage>> {
    let response = client
        .post(url)
        .json(message)
        .send()
        .await
        .map_err(|e| Error::connect(format!("failed to send request to {}: {}", url, e)))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::connect(format!("HTTP error {}: {}", status, body)));
    }

    let body = response
        .text()
        .await
        .map_err(|e| Error::transport(format!("failed to read response body: {}", e)))?;

    if body.trim().is_empty() {
        return Ok(None);
    }

    serde_json::from_str::<McpMessage>(&body)
        .map(Some)
        .map_err(|e| Error::transport(format!("failed to parse MCP response: {}", e)))
}

/// Synthesize an error response for a failed request so the caller's pending
/// entry resolves.
pub(crate) fn failure_response(message: &McpMessage, error: &Error) -> Option<McpMessage> {
    match message {
        McpMessage::Request(request) if !request.is_notification() => {
            Some(McpMessage::Response(McpResponse::error(
                request.id.clone(),
                JsonRpcError::internal_error(error.to_string()),
            )))
        }
        _ => None,
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&mut self) -> Result<TransportStreams> {
        let url = self
            .spec
            .uri
            .clone()
            .ok_or_else(|| Error::validation("http transport requires a uri"))?;
        let client = build_http_client(&self.spec)?;

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<McpMessage>();
        let (close_tx, mut close_rx) = mpsc::unbounded_channel();
        self.close_tx = Some(close_tx);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = close_rx.recv() => break,
                    message = outgoing_rx.recv() => {
                        let Some(message) = message else { break };
                        debug!(url = %url, "Posting MCP message");
                        match post_message(&client, &url, &message).await {
                            Ok(Some(response)) => {
                                if incoming_tx.send(response).is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!(url = %url, error = %e, "MCP request failed");
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
        format!("http {}", self.spec.uri.as_deref().unwrap_or("<none>"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::McpRequest;
    use serde_json::json;

    #[tokio::test]
    async fn test_refused_connection_resolves_pending() {
        // Nothing listens on this port; the request must resolve with an
        // error response rather than hang.
        let mut transport = HttpTransport::new(LaunchSpec {
            uri: Some("http://127.0.0.1:9/mcp".into()),
            ..Default::default()
        });
        let mut streams = transport.open().await.unwrap();

        let request = McpRequest::new("tools/list").with_id(json!(1));
        streams.outgoing.send(McpMessage::Request(request)).unwrap();

        let response = tokio::time::timeout(Duration::from_secs(10), streams.incoming.recv())
            .await
            .expect("response should arrive")
            .expect("channel open");
        match response {
            McpMessage::Response(r) => {
                assert_eq!(r.id, Some(json!(1)));
                assert!(r.error.is_some());
            }
            other => panic!("unexpected message: {:?}", other),
        }

        transport.close().await.unwrap();
    }

    #[test]
    fn test_failure_response_only_for_requests() {
        let err = Error::connect("refused");
        let notification = McpMessage::Request(McpRequest::new("notifications/initialized"));
        assert!(failure_response(&notification, &err).is_none());

        let request = McpMessage::Request(McpRequest::new("ping").with_id(json!(3)));
        let response = failure_response(&request, &err).unwrap();
        assert!(matches!(response, McpMessage::Response(r) if r.id == Some(json!(3))));
    }
}
