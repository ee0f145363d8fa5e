//! Proxy tool dispatch
//!
//! The `proxy` tool gives clients namespace-free access to every mounted
//! capability. Its list/info/call actions go through a loopback client that
//! calls straight back into the front-end dispatcher, so the same mount
//! table and prefixing that serve real clients also serve the proxy.

use crate::transport::McpHandler;
use async_trait::async_trait;
use magg_client::client::McpService;
use magg_client::proxy::validate_proxy_params;
use magg_client::transform::{
    annotate_content, embed_object, embed_object_list, prompt_result_as_tool_result,
    resource_result_as_tool_result, ProxyAnnotations,
};
use magg_client::types::*;
use magg_core::error::{Error, Result};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// In-process MCP client that dispatches into the front-end handler.
///
/// Requests take the same wire shape real clients send, so a test against
/// the loopback is a true end-to-end test of the dispatch path.
pub struct LoopbackClient {
    handler: Arc<dyn McpHandler>,
    next_id: AtomicI64,
}

impl LoopbackClient {
    pub fn new(handler: Arc<dyn McpHandler>) -> Self {
        Self {
            handler,
            next_id: AtomicI64::new(1),
        }
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut request = McpRequest::new(method).with_id(json!(id));
        if let Some(params) = params {
            request = request.with_params(params);
        }

        let response = self
            .handler
            .handle_request(request)
            .await
            .ok_or_else(|| Error::transport("loopback request produced no response"))?;

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

#[async_trait]
impl McpService for LoopbackClient {
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

/// The proxy tool's definition for tools/list.
pub fn proxy_tool_definition(name: &str) -> Tool {
    Tool {
        name: name.to_string(),
        description: Some(
            "Dynamic access to every mounted MCP server. Use action 'list' to enumerate \
             tools, resources, or prompts; 'info' for details on one capability; 'call' to \
             invoke a tool, read a resource, or get a prompt by its prefixed name or URI."
                .to_string(),
        ),
        input_schema: json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["list", "info", "call"],
                    "description": "Action to perform."
                },
                "type": {
                    "type": "string",
                    "enum": ["tool", "resource", "prompt"],
                    "description": "Capability type to interact with."
                },
                "path": {
                    "type": "string",
                    "description": "Prefixed name or URI of the capability. Required for 'info' and 'call', not allowed for 'list'."
                },
                "args": {
                    "type": "object",
                    "description": "Arguments for a 'call' action."
                }
            },
            "required": ["action", "type"]
        }),
        annotations: None,
    }
}

fn query_uri(tool_name: &str, action: &str, a_type: &str, path: Option<&str>) -> String {
    match path {
        Some(path) => format!("{}:{}/{}/{}", tool_name, action, a_type, path),
        None => format!("{}:{}/{}", tool_name, action, a_type),
    }
}

/// Execute a proxy operation against the given (loopback) service.
pub async fn dispatch(
    service: &dyn McpService,
    tool_name: &str,
    action: &str,
    a_type: &str,
    path: Option<&str>,
    args: Option<Value>,
) -> Result<CallToolResult> {
    validate_proxy_params(action, a_type, path, args.as_ref())?;

    match action {
        "list" => {
            let (value, type_name, count) = list_payload(service, a_type).await?;
            if count == 0 {
                return Ok(CallToolResult::default());
            }
            let content = embed_object_list(
                &value,
                type_name,
                query_uri(tool_name, action, a_type, None),
                ProxyAnnotations {
                    action,
                    a_type,
                    path: None,
                },
            );
            Ok(CallToolResult {
                content: vec![content],
                is_error: false,
            })
        }
        "info" => {
            let path = path.unwrap_or_default();
            let (value, type_name) = info_payload(service, a_type, path).await?;
            let content = embed_object(
                &value,
                type_name,
                query_uri(tool_name, action, a_type, Some(path)),
                ProxyAnnotations {
                    action,
                    a_type,
                    path: Some(path),
                },
            );
            Ok(CallToolResult {
                content: vec![content],
                is_error: false,
            })
        }
        "call" => {
            let path = path.unwrap_or_default();
            call_payload(service, a_type, path, args).await
        }
        _ => unreachable!(),
    }
}

async fn list_payload(
    service: &dyn McpService,
    a_type: &str,
) -> Result<(Value, &'static str, usize)> {
    match a_type {
        "tool" => {
            let tools = service.list_tools().await?;
            let count = tools.len();
            Ok((serde_json::to_value(tools)?, "Tool", count))
        }
        "resource" => {
            // Resources and templates are listed together.
            let mut items: Vec<ResourceOrTemplate> = service
                .list_resources()
                .await?
                .into_iter()
                .map(ResourceOrTemplate::Resource)
                .collect();
            items.extend(
                service
                    .list_resource_templates()
                    .await?
                    .into_iter()
                    .map(ResourceOrTemplate::Template),
            );
            let count = items.len();
            Ok((serde_json::to_value(items)?, "Resource", count))
        }
        "prompt" => {
            let prompts = service.list_prompts().await?;
            let count = prompts.len();
            Ok((serde_json::to_value(prompts)?, "Prompt", count))
        }
        _ => unreachable!(),
    }
}

async fn info_payload(
    service: &dyn McpService,
    a_type: &str,
    path: &str,
) -> Result<(Value, &'static str)> {
    match a_type {
        "tool" => {
            let tool = service
                .list_tools()
                .await?
                .into_iter()
                .find(|t| t.name == path)
                .ok_or_else(|| Error::not_found(format!("Tool {:?} not found", path)))?;
            Ok((serde_json::to_value(tool)?, "Tool"))
        }
        "resource" => {
            let resources = service.list_resources().await?;
            if let Some(resource) = resources
                .into_iter()
                .find(|r| r.uri == path || r.name.as_deref() == Some(path))
            {
                return Ok((serde_json::to_value(resource)?, "Resource"));
            }
            let template = service
                .list_resource_templates()
                .await?
                .into_iter()
                .find(|t| t.uri_template == path || t.name.as_deref() == Some(path))
                .ok_or_else(|| Error::not_found(format!("Resource {:?} not found", path)))?;
            Ok((serde_json::to_value(template)?, "ResourceTemplate"))
        }
        "prompt" => {
            let prompt = service
                .list_prompts()
                .await?
                .into_iter()
                .find(|p| p.name == path)
                .ok_or_else(|| Error::not_found(format!("Prompt {:?} not found", path)))?;
            Ok((serde_json::to_value(prompt)?, "Prompt"))
        }
        _ => unreachable!(),
    }
}

async fn call_payload(
    service: &dyn McpService,
    a_type: &str,
    path: &str,
    args: Option<Value>,
) -> Result<CallToolResult> {
    match a_type {
        "tool" => {
            let result = service.call_tool(path, args).await?;
            let content = result
                .content
                .into_iter()
                .map(|item| {
                    annotate_content(
                        item,
                        ProxyAnnotations {
                            action: "call",
                            a_type,
                            path: Some(path),
                        },
                    )
                })
                .collect();
            Ok(CallToolResult {
                content,
                is_error: result.is_error,
            })
        }
        "resource" => {
            let result = service.read_resource(path).await?;
            let content = result
                .contents
                .into_iter()
                .map(|item| {
                    resource_result_as_tool_result(
                        item,
                        ProxyAnnotations {
                            action: "call",
                            a_type,
                            path: Some(path),
                        },
                    )
                })
                .collect();
            Ok(CallToolResult {
                content,
                is_error: false,
            })
        }
        "prompt" => {
            let result = service.get_prompt(path, args).await?;
            let content = prompt_result_as_tool_result(&result, path);
            Ok(CallToolResult {
                content: vec![content],
                is_error: false,
            })
        }
        _ => unreachable!(),
    }
}
