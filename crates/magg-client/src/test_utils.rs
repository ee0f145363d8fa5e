//! In-memory scripted MCP backend for tests
//!
//! `ScriptedTransport` connects a client session to a spawned task that
//! speaks enough MCP to exercise mounting, listing, calls, and
//! notifications, without a child process or socket.

use crate::transport::{Transport, TransportStreams};
use crate::types::*;
use async_trait::async_trait;
use magg_core::error::Result;
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Capabilities the scripted backend advertises.
#[derive(Debug, Clone)]
pub struct ScriptedServer {
    pub name: String,
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub resource_templates: Vec<ResourceTemplate>,
    pub prompts: Vec<Prompt>,
    resource_texts: Vec<(String, String)>,
    /// Answer the handshake but nothing after it - simulates a mounted
    /// backend that has become unresponsive.
    pub hang: bool,
}

impl ScriptedServer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: Vec::new(),
            resources: Vec::new(),
            resource_templates: Vec::new(),
            prompts: Vec::new(),
            resource_texts: Vec::new(),
            hang: false,
        }
    }

    /// A calculator backend with `add` and `multiply` tools.
    pub fn calculator(name: impl Into<String>) -> Self {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
            "required": ["a", "b"],
        });
        let mut server = Self::new(name);
        server.tools = vec![
            Tool {
                name: "add".into(),
                description: Some("Add two numbers".into()),
                input_schema: schema.clone(),
                annotations: None,
            },
            Tool {
                name: "multiply".into(),
                description: Some("Multiply two numbers".into()),
                input_schema: schema,
                annotations: None,
            },
        ];
        server
    }

    pub fn with_resource(mut self, uri: &str, text: &str) -> Self {
        self.resources.push(Resource {
            uri: uri.into(),
            name: Some(uri.rsplit('/').next().unwrap_or(uri).to_string()),
            description: None,
            mime_type: Some("text/plain".into()),
        });
        self.resource_texts.push((uri.to_string(), text.to_string()));
        self
    }

    pub fn with_prompt(mut self, name: &str) -> Self {
        self.prompts.push(Prompt {
            name: name.into(),
            description: Some(format!("Prompt {}", name)),
            arguments: None,
        });
        self
    }

    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    fn resource_text(&self, uri: &str) -> Option<&str> {
        self.resource_texts
            .iter()
            .find(|(u, _)| u == uri)
            .map(|(_, t)| t.as_str())
    }
}

/// Handle for injecting server-initiated notifications after connect.
#[derive(Clone)]
pub struct NotificationInjector {
    tx: mpsc::UnboundedSender<McpMessage>,
}

impl NotificationInjector {
    pub fn notify(&self, method: &str, params: Option<Value>) {
        let mut request = McpRequest::new(method);
        if let Some(params) = params {
            request = request.with_params(params);
        }
        let _ = self.tx.send(McpMessage::Request(request));
    }
}

/// Transport backed by a scripted in-process server task.
pub struct ScriptedTransport {
    server: ScriptedServer,
    inject_tx: mpsc::UnboundedSender<McpMessage>,
    inject_rx: Option<mpsc::UnboundedReceiver<McpMessage>>,
}

impl ScriptedTransport {
    pub fn new(server: ScriptedServer) -> Self {
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        Self {
            server,
            inject_tx,
            inject_rx: Some(inject_rx),
        }
    }

    pub fn injector(&self) -> NotificationInjector {
        NotificationInjector {
            tx: self.inject_tx.clone(),
        }
    }
}

fn answer(server: &ScriptedServer, request: &McpRequest) -> McpResponse {
    let id = request.id.clone();
    let params = request.params.clone().unwrap_or_default();

    let result = match request.method.as_str() {
        "initialize" => json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": {"listChanged": true},
                "resources": {"listChanged": true},
                "prompts": {"listChanged": true},
            },
            "serverInfo": {"name": server.name, "version": "0.0.1"},
        }),
        "ping" => json!({}),
        "tools/list" => json!({"tools": server.tools}),
        "resources/list" => json!({"resources": server.resources}),
        "resources/templates/list" => {
            json!({"resourceTemplates": server.resource_templates})
        }
        "prompts/list" => json!({"prompts": server.prompts}),
        "tools/call" => {
            let name = params["name"].as_str().unwrap_or_default();
            let a = params["arguments"]["a"].as_i64().unwrap_or(0);
            let b = params["arguments"]["b"].as_i64().unwrap_or(0);
            match name {
                "add" => json!({"content": [{"type": "text", "text": (a + b).to_string()}]}),
                "multiply" => {
                    json!({"content": [{"type": "text", "text": (a * b).to_string()}]})
                }
                other => {
                    return McpResponse::error(
                        id,
                        JsonRpcError::invalid_params(format!("unknown tool {other}")),
                    );
                }
            }
        }
        "resources/read" => {
            let uri = params["uri"].as_str().unwrap_or_default();
            match server.resource_text(uri) {
                Some(text) => json!({
                    "contents": [{"uri": uri, "mimeType": "text/plain", "text": text}]
                }),
                None => {
                    return McpResponse::error(
                        id,
                        JsonRpcError::invalid_params(format!("unknown resource {uri}")),
                    );
                }
            }
        }
        "prompts/get" => {
            let name = params["name"].as_str().unwrap_or_default();
            if server.prompts.iter().any(|p| p.name == name) {
                json!({
                    "description": format!("Prompt {name}"),
                    "messages": [
                        {"role": "user", "content": {"type": "text", "text": format!("use {name}")}}
                    ],
                })
            } else {
                return McpResponse::error(
                    id,
                    JsonRpcError::invalid_params(format!("unknown prompt {name}")),
                );
            }
        }
        other => {
            return McpResponse::error(id, JsonRpcError::method_not_found(other));
        }
    };

    McpResponse::success(id, result)
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&mut self) -> Result<TransportStreams> {
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let (from_client_tx, mut from_client_rx) = mpsc::unbounded_channel::<McpMessage>();
        let mut inject_rx = self
            .inject_rx
            .take()
            .unwrap_or_else(|| mpsc::unbounded_channel().1);

        let server = self.server.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    injected = inject_rx.recv() => {
                        let Some(message) = injected else { break };
                        if to_client_tx.send(message).is_err() {
                            break;
                        }
                    }
                    incoming = from_client_rx.recv() => {
                        match incoming {
                            None => break,
                            Some(McpMessage::Request(request)) => {
                                if request.is_notification()
                                    || (server.hang && request.method != "initialize")
                                {
                                    continue;
                                }
                                let response = answer(&server, &request);
                                if to_client_tx.send(McpMessage::Response(response)).is_err() {
                                    break;
                                }
                            }
                            Some(_) => continue,
                        }
                    }
                }
            }
        });

        Ok(TransportStreams {
            incoming: to_client_rx,
            outgoing: from_client_tx,
        })
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        format!("scripted {}", self.server.name)
    }
}
