//! Front-end transports
//!
//! magg serves clients over stdio (newline-delimited JSON-RPC on
//! stdin/stdout, logs on stderr) or HTTP (POST `/mcp/` plus an SSE stream
//! at `/sse` for server-initiated notifications). Both register a router
//! subscriber so backend notifications reach connected clients.

use crate::messaging::{MessageHandler, MessageRouter, ServerNotification};
use async_trait::async_trait;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use magg_client::types::{JsonRpcError, McpRequest, McpResponse};
use magg_core::error::{Error, Result};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

/// Front-end request handler. Returns `None` for notifications.
#[async_trait]
pub trait McpHandler: Send + Sync {
    async fn handle_request(&self, request: McpRequest) -> Option<McpResponse>;
}

/// Validates bearer tokens on the HTTP front. Token issuance and JWT
/// verification live outside the core.
pub type BearerValidator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Router subscriber that serializes notifications onto a wire channel.
struct WireForwarder {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl MessageHandler for WireForwarder {
    async fn handle(&self, notification: &ServerNotification) -> Result<()> {
        let frame = serde_json::to_string(&notification.to_wire())?;
        self.tx
            .send(frame)
            .map_err(|_| Error::transport("stdio client gone"))
    }
}

/// Router subscriber that fans notifications into an SSE broadcast.
struct BroadcastForwarder {
    tx: broadcast::Sender<String>,
}

#[async_trait]
impl MessageHandler for BroadcastForwarder {
    async fn handle(&self, notification: &ServerNotification) -> Result<()> {
        let frame = serde_json::to_string(&notification.to_wire())?;
        // Send fails only when no SSE client is connected; that is fine.
        let _ = self.tx.send(frame);
        Ok(())
    }
}

/// Serve MCP over stdio until stdin closes.
pub async fn serve_stdio<H: McpHandler + 'static>(
    handler: Arc<H>,
    router: Arc<MessageRouter>,
) -> Result<()> {
    info!("Starting MCP stdio transport");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let forwarder: Arc<dyn MessageHandler> = Arc::new(WireForwarder { tx: out_tx.clone() });
    router.register(forwarder.clone(), None);

    // Single writer task serializes all stdout access.
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(frame) = out_rx.recv().await {
            if stdout.write_all(frame.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        debug!(request = %line, "Received request");

        let response = match serde_json::from_str::<McpRequest>(line) {
            Ok(request) => handler.handle_request(request).await,
            Err(e) => {
                warn!(error = %e, "Parse error");
                Some(McpResponse::error(
                    None,
                    JsonRpcError::parse_error(e.to_string()),
                ))
            }
        };

        if let Some(response) = response {
            let frame = serde_json::to_string(&response)?;
            if out_tx.send(frame).is_err() {
                break;
            }
        }
    }

    router.unregister(&forwarder, None);
    drop(out_tx);
    let _ = writer.await;

    info!("Stdio transport shutting down");
    Ok(())
}

struct HttpState<H> {
    handler: Arc<H>,
    event_tx: broadcast::Sender<String>,
    validator: Option<BearerValidator>,
}

fn authorized<H>(state: &HttpState<H>, headers: &HeaderMap) -> bool {
    let Some(validator) = &state.validator else {
        return true;
    };
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map_or(false, |token| validator(token))
}

async fn mcp_handler<H: McpHandler>(
    State(state): State<Arc<HttpState<H>>>,
    headers: HeaderMap,
    Json(request): Json<McpRequest>,
) -> axum::response::Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    debug!(method = %request.method, "HTTP MCP request");
    match state.handler.handle_request(request).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "magg",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn sse_handler<H: McpHandler + 'static>(
    State(state): State<Arc<HttpState<H>>>,
    headers: HeaderMap,
) -> axum::response::Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    info!("SSE client connected");

    let initial = stream::iter(vec![Ok::<Event, Infallible>(
        Event::default().event("endpoint").data("/mcp/"),
    )]);

    let rx = state.event_tx.subscribe();
    let notifications = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(|result| async {
        match result {
            Ok(frame) => Some(Ok(Event::default().event("message").data(frame))),
            Err(_) => None,
        }
    });

    sse_response(initial.chain(notifications)).into_response()
}

fn sse_response<S>(stream: S) -> Sse<S>
where
    S: Stream<Item = std::result::Result<Event, Infallible>> + Send + 'static,
{
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keepalive"),
    )
}

/// Serve MCP over streamable HTTP at `/mcp/` with SSE notifications at
/// `/sse`.
pub async fn serve_http<H: McpHandler + 'static>(
    handler: Arc<H>,
    router: Arc<MessageRouter>,
    host: &str,
    port: u16,
    validator: Option<BearerValidator>,
) -> Result<()> {
    let bind_addr = format!("{}:{}", host, port);
    info!(addr = %bind_addr, "Starting HTTP transport");

    let (event_tx, _) = broadcast::channel(100);
    let forwarder: Arc<dyn MessageHandler> = Arc::new(BroadcastForwarder {
        tx: event_tx.clone(),
    });
    router.register(forwarder.clone(), None);

    let state = Arc::new(HttpState {
        handler,
        event_tx,
        validator,
    });

    let app = Router::new()
        .route("/mcp", post(mcp_handler::<H>))
        .route("/mcp/", post(mcp_handler::<H>))
        .route("/message", post(mcp_handler::<H>))
        .route("/sse", get(sse_handler::<H>))
        .route("/health", get(health_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| Error::fatal(format!("cannot bind {}: {}", bind_addr, e)))?;
    info!(addr = %bind_addr, "HTTP transport listening");

    let result = axum::serve(listener, app)
        .await
        .map_err(|e| Error::fatal(format!("HTTP server error: {}", e)));

    router.unregister(&forwarder, None);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl McpHandler for EchoHandler {
        async fn handle_request(&self, request: McpRequest) -> Option<McpResponse> {
            if request.is_notification() {
                return None;
            }
            Some(McpResponse::success(
                request.id,
                json!({"method": request.method}),
            ))
        }
    }

    #[tokio::test]
    async fn test_wire_forwarder_serializes_notifications() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let forwarder = WireForwarder { tx };

        let notification = ServerNotification {
            server: Some("calc".into()),
            method: "notifications/tools/list_changed".into(),
            params: None,
        };
        forwarder.handle(&notification).await.unwrap();

        let frame = rx.recv().await.unwrap();
        assert!(frame.contains("notifications/tools/list_changed"));
        assert!(frame.contains("\"jsonrpc\":\"2.0\""));
    }

    #[tokio::test]
    async fn test_http_round_trip() {
        let router = Arc::new(MessageRouter::new());
        let handler = Arc::new(EchoHandler);

        // Bind an ephemeral port by probing with a listener first.
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let server_router = router.clone();
        let server = tokio::spawn(async move {
            let _ = serve_http(handler, server_router, "127.0.0.1", port, None).await;
        });

        // Give the server a moment to bind.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://127.0.0.1:{}/mcp/", port))
            .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["result"]["method"], "ping");

        let health = client
            .get(format!("http://127.0.0.1:{}/health", port))
            .send()
            .await
            .unwrap();
        assert!(health.status().is_success());

        server.abort();
    }

    #[tokio::test]
    async fn test_http_bearer_rejection() {
        let router = Arc::new(MessageRouter::new());
        let handler = Arc::new(EchoHandler);
        let validator: BearerValidator = Arc::new(|token| token == "sekrit");

        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let server_router = router.clone();
        let server = tokio::spawn(async move {
            let _ = serve_http(handler, server_router, "127.0.0.1", port, Some(validator)).await;
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{}/mcp/", port);
        let body = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});

        let denied = client.post(&url).json(&body).send().await.unwrap();
        assert_eq!(denied.status().as_u16(), StatusCode::UNAUTHORIZED.as_u16());

        let allowed = client
            .post(&url)
            .bearer_auth("sekrit")
            .json(&body)
            .send()
            .await
            .unwrap();
        assert!(allowed.status().is_success());

        server.abort();
    }
}
