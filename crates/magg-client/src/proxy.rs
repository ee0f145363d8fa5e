//! Proxy-aware client
//!
//! `ProxyClient` wraps any `McpService` and adds a natural `proxy()` call
//! plus transparent mode: the standard list/call/read/get operations are
//! rerouted through magg's proxy tool and their typed results reconstructed
//! from the annotated embedded resources.

use crate::client::McpService;
use crate::transform::get_embedded_object;
use crate::transform::tool_result_as_prompt_result;
use crate::transform::tool_result_as_resource_result;
use crate::types::*;
use async_trait::async_trait;
use magg_core::error::{Error, Result};
use serde_json::{json, Value};

/// Default name of magg's proxy tool.
pub const PROXY_TOOL_NAME: &str = "proxy";

pub const PROXY_ACTIONS: [&str; 3] = ["list", "info", "call"];
pub const PROXY_TYPES: [&str; 3] = ["tool", "resource", "prompt"];

/// Validate a proxy operation's parameter combination.
pub fn validate_proxy_params(
    action: &str,
    a_type: &str,
    path: Option<&str>,
    args: Option<&Value>,
) -> Result<()> {
    if !PROXY_ACTIONS.contains(&action) {
        return Err(Error::validation(format!("invalid proxy action {:?}", action)));
    }
    if !PROXY_TYPES.contains(&a_type) {
        return Err(Error::validation(format!("invalid proxy type {:?}", a_type)));
    }

    match action {
        "list" => {
            if path.is_some() {
                return Err(Error::validation(
                    "parameter 'path' should not be provided for action 'list'",
                ));
            }
            if args.is_some() {
                return Err(Error::validation(
                    "parameter 'args' should not be provided for action 'list'",
                ));
            }
        }
        "info" => {
            if path.is_none() {
                return Err(Error::validation("parameter 'path' is required for action 'info'"));
            }
            if args.is_some() {
                return Err(Error::validation(
                    "parameter 'args' should not be provided for action 'info'",
                ));
            }
        }
        "call" => {
            if path.is_none() {
                return Err(Error::validation("parameter 'path' is required for action 'call'"));
            }
        }
        _ => unreachable!(),
    }

    Ok(())
}

/// A decoded proxy query (`list` or `info`) result.
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyQueryResult {
    Tools(Vec<Tool>),
    Tool(Tool),
    Resources(Vec<ResourceOrTemplate>),
    Resource(ResourceOrTemplate),
    Prompts(Vec<Prompt>),
    Prompt(Prompt),
}

/// Decode a proxy query result from its annotated embedded resource.
///
/// The target type comes from the closed `proxyType` map; `many` selects
/// list versus scalar. The `pythonType` label is debug-only and never
/// consulted. Returns `Ok(None)` for content that is not a proxy query
/// result at all; `DecodeError` when it claims to be one but does not parse.
pub fn decode_query_result(content: &Content) -> Result<Option<ProxyQueryResult>> {
    let Some((annotations, raw, many)) = get_embedded_object(content) else {
        return Ok(None);
    };

    let action = annotations.proxy_action.as_deref().unwrap_or_default();
    if action != "list" && action != "info" {
        return Ok(None);
    }

    let a_type = annotations.proxy_type.as_deref().unwrap_or_default();
    let decoded = match (a_type, many) {
        ("tool", true) => serde_json::from_str(raw).map(ProxyQueryResult::Tools),
        ("tool", false) => serde_json::from_str(raw).map(ProxyQueryResult::Tool),
        ("resource", true) => serde_json::from_str(raw).map(ProxyQueryResult::Resources),
        ("resource", false) => serde_json::from_str(raw).map(ProxyQueryResult::Resource),
        ("prompt", true) => serde_json::from_str(raw).map(ProxyQueryResult::Prompts),
        ("prompt", false) => serde_json::from_str(raw).map(ProxyQueryResult::Prompt),
        (other, _) => {
            return Err(Error::decode(format!("unknown proxyType {:?}", other)));
        }
    };

    decoded.map(Some).map_err(|e| {
        Error::decode(format!(
            "proxy {} result does not decode as {}: {}",
            action, a_type, e
        ))
    })
}

/// Client wrapper with proxy-aware convenience methods.
pub struct ProxyClient<S> {
    inner: S,
    transparent: bool,
    proxy_tool_name: String,
}

impl<S: McpService> ProxyClient<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            transparent: false,
            proxy_tool_name: PROXY_TOOL_NAME.to_string(),
        }
    }

    /// A client that rewrites the standard MCP operations into proxy calls.
    pub fn transparent(inner: S) -> Self {
        Self {
            inner,
            transparent: true,
            proxy_tool_name: PROXY_TOOL_NAME.to_string(),
        }
    }

    pub fn with_proxy_tool_name(mut self, name: impl Into<String>) -> Self {
        self.proxy_tool_name = name.into();
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn is_transparent(&self) -> bool {
        self.transparent
    }

    /// Call the proxy tool with the natural parameter structure.
    pub async fn proxy(
        &self,
        action: &str,
        a_type: &str,
        path: Option<&str>,
        arguments: Option<Value>,
    ) -> Result<CallToolResult> {
        validate_proxy_params(action, a_type, path, arguments.as_ref())?;

        let mut proxy_args = json!({
            "action": action,
            "type": a_type,
        });
        if let Some(path) = path {
            proxy_args["path"] = json!(path);
        }
        if let Some(arguments) = arguments {
            proxy_args["args"] = arguments;
        }

        self.inner
            .call_tool(&self.proxy_tool_name, Some(proxy_args))
            .await
    }

    /// List and decode one capability type through the proxy.
    async fn proxy_list(&self, a_type: &str) -> Result<ProxyQueryResult> {
        let result = self.proxy("list", a_type, None, None).await?;

        if result.is_error {
            return Err(Error::decode(format!(
                "proxy list failed: {}",
                result.text()
            )));
        }

        // Empty results arrive as an empty content list.
        if result.content.is_empty() {
            return Ok(match a_type {
                "tool" => ProxyQueryResult::Tools(Vec::new()),
                "resource" => ProxyQueryResult::Resources(Vec::new()),
                _ => ProxyQueryResult::Prompts(Vec::new()),
            });
        }

        if result.content.len() != 1 {
            return Err(Error::decode(format!(
                "expected single proxy result, got {} items",
                result.content.len()
            )));
        }

        decode_query_result(&result.content[0])?
            .ok_or_else(|| Error::decode("proxy result carries no typed payload"))
    }

    /// Get detailed info about one capability through the proxy.
    pub async fn proxy_info(&self, a_type: &str, path: &str) -> Result<ProxyQueryResult> {
        let result = self.proxy("info", a_type, Some(path), None).await?;

        if result.is_error {
            return Err(Error::not_found(result.text()));
        }

        if result.content.len() != 1 {
            return Err(Error::decode(format!(
                "expected single proxy result, got {} items",
                result.content.len()
            )));
        }

        decode_query_result(&result.content[0])?
            .ok_or_else(|| Error::decode("proxy result carries no typed payload"))
    }

    /// List resources and templates together, as the proxy returns them.
    pub async fn list_resources_and_templates(&self) -> Result<Vec<ResourceOrTemplate>> {
        match self.proxy_list("resource").await? {
            ProxyQueryResult::Resources(items) => Ok(items),
            other => Err(Error::decode(format!(
                "expected resource list, decoded {:?}",
                other
            ))),
        }
    }
}

#[async_trait]
impl<S: McpService> McpService for ProxyClient<S> {
    async fn list_tools(&self) -> Result<Vec<Tool>> {
        if !self.transparent {
            return self.inner.list_tools().await;
        }
        match self.proxy_list("tool").await? {
            ProxyQueryResult::Tools(tools) => Ok(tools),
            other => Err(Error::decode(format!("expected tool list, decoded {:?}", other))),
        }
    }

    async fn list_resources(&self) -> Result<Vec<Resource>> {
        if !self.transparent {
            return self.inner.list_resources().await;
        }
        Ok(self
            .list_resources_and_templates()
            .await?
            .into_iter()
            .filter_map(|item| match item {
                ResourceOrTemplate::Resource(resource) => Some(resource),
                ResourceOrTemplate::Template(_) => None,
            })
            .collect())
    }

    async fn list_resource_templates(&self) -> Result<Vec<ResourceTemplate>> {
        if !self.transparent {
            return self.inner.list_resource_templates().await;
        }
        Ok(self
            .list_resources_and_templates()
            .await?
            .into_iter()
            .filter_map(|item| match item {
                ResourceOrTemplate::Template(template) => Some(template),
                ResourceOrTemplate::Resource(_) => None,
            })
            .collect())
    }

    async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        if !self.transparent {
            return self.inner.list_prompts().await;
        }
        match self.proxy_list("prompt").await? {
            ProxyQueryResult::Prompts(prompts) => Ok(prompts),
            other => Err(Error::decode(format!(
                "expected prompt list, decoded {:?}",
                other
            ))),
        }
    }

    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult> {
        if !self.transparent {
            return self.inner.call_tool(name, arguments).await;
        }
        self.proxy("call", "tool", Some(name), arguments).await
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        if !self.transparent {
            return self.inner.read_resource(uri).await;
        }

        let result = self.proxy("call", "resource", Some(uri), None).await?;
        if result.is_error {
            return Err(Error::not_found(result.text()));
        }

        let mut contents = Vec::new();
        for item in &result.content {
            let resource = tool_result_as_resource_result(item).ok_or_else(|| {
                Error::decode("proxied resource result item carries no resource")
            })?;
            contents.push(resource);
        }
        Ok(ReadResourceResult { contents })
    }

    async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<GetPromptResult> {
        if !self.transparent {
            return self.inner.get_prompt(name, arguments).await;
        }

        let result = self.proxy("call", "prompt", Some(name), arguments).await?;
        if result.is_error {
            return Err(Error::not_found(result.text()));
        }
        if result.content.len() != 1 {
            return Err(Error::decode(format!(
                "expected single proxied prompt result, got {} items",
                result.content.len()
            )));
        }

        tool_result_as_prompt_result(&result.content[0])
            .ok_or_else(|| Error::decode("proxied prompt result does not decode"))
    }
}
