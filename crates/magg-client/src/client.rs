//! MCP client session
//!
//! One `McpClient` is held per mounted backend. It owns the transport,
//! correlates requests with responses through a pending map, and hands
//! notifications to an installable handler.

use crate::transport::{Transport, TransportStreams};
use crate::types::*;
use async_trait::async_trait;
use magg_core::error::{Error, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Configuration for MCP client behavior.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub client_name: String,
    pub client_version: String,
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: "magg".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Receiver of server-initiated notifications.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn on_notification(&self, method: &str, params: Option<&Value>);
}

/// The standard MCP client operations.
///
/// Implemented by the network client below and by magg's in-process
/// loopback, so the proxy dispatch path is identical for both.
#[async_trait]
pub trait McpService: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<Tool>>;
    async fn list_resources(&self) -> Result<Vec<Resource>>;
    async fn list_resource_templates(&self) -> Result<Vec<ResourceTemplate>>;
    async fn list_prompts(&self) -> Result<Vec<Prompt>>;
    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult>;
    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult>;
    async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<GetPromptResult>;
}

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<McpResponse>>>>;

/// MCP client bound to one transport.
pub struct McpClient {
    config: ClientConfig,
    transport: tokio::sync::Mutex<Box<dyn Transport>>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<McpMessage>>>,
    pending: PendingMap,
    next_id: AtomicI64,
    connected: AtomicBool,
    handler: Arc<Mutex<Option<Arc<dyn NotificationHandler>>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    init_result: Mutex<Option<InitializeResult>>,
}

impl McpClient {
    pub fn new(config: ClientConfig, transport: Box<dyn Transport>) -> Self {
        Self {
            config,
            transport: tokio::sync::Mutex::new(transport),
            outgoing: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicI64::new(1),
            connected: AtomicBool::new(false),
            handler: Arc::new(Mutex::new(None)),
            reader_task: Mutex::new(None),
            init_result: Mutex::new(None),
        }
    }

    /// Install the notification handler. May be called before or after
    /// connect; replaces any previous handler.
    pub fn set_notification_handler(&self, handler: Arc<dyn NotificationHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Server info captured during the handshake.
    pub fn init_result(&self) -> Option<InitializeResult> {
        self.init_result.lock().unwrap().clone()
    }

    /// Open the transport and perform the MCP initialize handshake.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let streams = self.transport.lock().await.open().await?;
        self.start_reader(streams);
        self.connected.store(true, Ordering::Relaxed);

        match self.initialize().await {
            Ok(init) => {
                debug!(server = ?init.server_name(), "MCP session initialized");
                *self.init_result.lock().unwrap() = Some(init);
                Ok(())
            }
            Err(e) => {
                self.close().await.ok();
                Err(Error::handshake(format!("initialize failed: {}", e)))
            }
        }
    }

    fn start_reader(&self, streams: TransportStreams) {
        let TransportStreams {
            mut incoming,
            outgoing,
        } = streams;

        *self.outgoing.lock().unwrap() = Some(outgoing.clone());

        let pending = self.pending.clone();
        let handler = self.handler.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = incoming.recv().await {
                match message {
                    McpMessage::Response(response) => {
                        let id = response.id.as_ref().and_then(Value::as_i64);
                        let sender = id.and_then(|id| pending.lock().unwrap().remove(&id));
                        match sender {
                            Some(sender) => {
                                let _ = sender.send(response);
                            }
                            None => {
                                warn!(id = ?response.id, "Response with no pending request");
                            }
                        }
                    }
                    McpMessage::Request(request) if request.is_notification() => {
                        let handler = handler.lock().unwrap().clone();
                        if let Some(handler) = handler {
                            handler
                                .on_notification(&request.method, request.params.as_ref())
                                .await;
                        }
                    }
                    McpMessage::Request(request) => {
                        // Server-to-client request; answer ping, refuse the rest.
                        let response = if request.method == "ping" {
                            McpResponse::success(request.id, json!({}))
                        } else {
                            McpResponse::error(
                                request.id,
                                JsonRpcError::method_not_found(&request.method),
                            )
                        };
                        if outgoing.send(McpMessage::Response(response)).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Client message stream ended");
        });

        *self.reader_task.lock().unwrap() = Some(handle);
    }

    async fn initialize(&self) -> Result<InitializeResult> {
        let params = initialize_params(&self.config.client_name, &self.config.client_version);
        let result = self.request("initialize", Some(params)).await?;
        let init: InitializeResult = serde_json::from_value(result)?;
        self.notify(NOTIFICATION_INITIALIZED, None)?;
        Ok(init)
    }

    /// Send a request and await its response, bounded by the configured
    /// request timeout.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let mut request = McpRequest::new(method).with_id(json!(id));
        if let Some(params) = params {
            request = request.with_params(params);
        }

        if let Err(e) = self.send(McpMessage::Request(request)) {
            self.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(Error::timeout(format!(
                    "no response to {} within {:?}",
                    method, self.config.request_timeout
                )))
            }
            Ok(Err(_)) => Err(Error::transport("connection closed")),
            Ok(Ok(response)) => {
                if let Some(error) = response.error {
                    Err(Error::Protocol {
                        code: error.code,
                        message: error.message,
                    })
                } else {
                    Ok(response.result.unwrap_or(Value::Null))
                }
            }
        }
    }

    /// Send a notification (no response expected).
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let mut request = McpRequest::new(method);
        if let Some(params) = params {
            request = request.with_params(params);
        }
        self.send(McpMessage::Request(request))
    }

    fn send(&self, message: McpMessage) -> Result<()> {
        let outgoing = self.outgoing.lock().unwrap();
        let sender = outgoing
            .as_ref()
            .ok_or_else(|| Error::transport("client is not connected"))?;
        sender
            .send(message)
            .map_err(|_| Error::transport("connection closed"))
    }

    /// Close the session and release transport resources. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        *self.outgoing.lock().unwrap() = None;

        let task = self.reader_task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
        }

        // Outstanding requests resolve with a closed-connection error.
        self.pending.lock().unwrap().clear();

        self.transport.lock().await.close().await
    }

    pub async fn ping(&self) -> Result<()> {
        self.request("ping", None).await.map(|_| ())
    }
}

#[async_trait]
impl McpService for McpClient {
    async fn list_tools(&self) -> Result<Vec<Tool>> {
        let result = self.request("tools/list", None).await?;
        let parsed: ListToolsResult = serde_json::from_value(result)?;
        Ok(parsed.tools)
    }

    async fn list_resources(&self) -> Result<Vec<Resource>> {
        let result = self.request("resources/list", None).await?;
        let parsed: ListResourcesResult = serde_json::from_value(result)?;
        Ok(parsed.resources)
    }

    async fn list_resource_templates(&self) -> Result<Vec<ResourceTemplate>> {
        let result = self.request("resources/templates/list", None).await?;
        let parsed: ListResourceTemplatesResult = serde_json::from_value(result)?;
        Ok(parsed.resource_templates)
    }

    async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        let result = self.request("prompts/list", None).await?;
        let parsed: ListPromptsResult = serde_json::from_value(result)?;
        Ok(parsed.prompts)
    }

    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult> {
        let params = json!({
            "name": name,
            "arguments": arguments.unwrap_or_else(|| json!({})),
        });
        let result = self.request("tools/call", Some(params)).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        let result = self
            .request("resources/read", Some(json!({"uri": uri})))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<GetPromptResult> {
        let params = json!({
            "name": name,
            "arguments": arguments.unwrap_or_else(|| json!({})),
        });
        let result = self.request("prompts/get", Some(params)).await?;
        Ok(serde_json::from_value(result)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ScriptedServer, ScriptedTransport};

    fn scripted_client() -> McpClient {
        McpClient::new(
            ClientConfig::default(),
            Box::new(ScriptedTransport::new(ScriptedServer::calculator("scripted"))),
        )
    }

    #[tokio::test]
    async fn test_connect_and_list_tools() {
        let client = scripted_client();
        client.connect().await.unwrap();
        assert!(client.is_connected());
        assert_eq!(
            client.init_result().unwrap().server_name(),
            Some("scripted")
        );

        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "add");
        assert_eq!(tools[1].name, "multiply");

        client.close().await.unwrap();
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_call_tool() {
        let client = scripted_client();
        client.connect().await.unwrap();

        let result = client
            .call_tool("add", Some(json!({"a": 5, "b": 3})))
            .await
            .unwrap();
        assert_eq!(result.text(), "8");

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_protocol_error_surfaces() {
        let client = scripted_client();
        client.connect().await.unwrap();

        let err = client.call_tool("missing", None).await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let client = scripted_client();
        client.connect().await.unwrap();
        client.connect().await.unwrap();
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_without_connect_fails() {
        let client = scripted_client();
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
