//! The magg server - front-end MCP surface and management tools
//!
//! `MaggServer` answers the MCP wire: its own management tools under the
//! self prefix, the unprefixed `proxy` tool, and the union of every mounted
//! backend's capabilities under per-server prefixes.

use crate::manager::{HealthState, ServerManager, TransportFactory};
use crate::messaging::{MessageRouter, ServerMessageCoordinator};
use crate::proxy::{self, proxy_tool_definition, LoopbackClient};
use crate::transport::McpHandler;
use async_trait::async_trait;
use magg_client::client::McpService;
use magg_client::command::split_command_line;
use magg_client::types::*;
use magg_config::change::diff_configs;
use magg_config::kit::KitManager;
use magg_config::manager::ConfigManager;
use magg_config::reload::{ReloadHandler, ReloadManager};
use magg_config::settings::{MaggConfig, ServerConfig};
use magg_core::error::{Error, Result};
use magg_core::prefix::{prefixed_name, prefixed_resource_uri, strip_resource_prefix};
use magg_core::response::MaggResponse;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const INSTRUCTIONS: &str = "magg aggregates multiple MCP servers behind a single endpoint. \
Backend tools are exposed as <prefix>_<tool>. Use the management tools under the self \
prefix to add, remove, enable, and check servers, and the unprefixed `proxy` tool to \
introspect or call any capability without knowing the prefix scheme.";

const DEFAULT_CHECK_TIMEOUT_SECS: f64 = 2.5;

/// External discovery/LLM collaborators. Out of the core's scope; the
/// default implementation reports unavailability.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Value>;
    async fn configure(&self, source: &str, name: Option<&str>) -> Result<Value>;
}

struct NullDiscovery;

#[async_trait]
impl Discovery for NullDiscovery {
    async fn search(&self, _query: &str, _limit: usize) -> Result<Value> {
        Err(Error::not_found("no discovery backend configured"))
    }

    async fn configure(&self, _source: &str, _name: Option<&str>) -> Result<Value> {
        Err(Error::not_found("no discovery backend configured"))
    }
}

/// Applies detected config changes through the server manager.
struct ManagerReloadHandler {
    manager: Arc<ServerManager>,
}

#[async_trait]
impl ReloadHandler for ManagerReloadHandler {
    async fn apply(&self, change: magg_config::change::ConfigChange) -> Result<()> {
        self.manager.handle_config_change(&change).await
    }
}

/// Main magg server.
pub struct MaggServer {
    weak_self: Weak<MaggServer>,
    config_manager: Arc<ConfigManager>,
    server_manager: Arc<ServerManager>,
    router: Arc<MessageRouter>,
    coordinator: Arc<ServerMessageCoordinator>,
    reload_manager: ReloadManager,
    kits: Mutex<KitManager>,
    discovery: Arc<dyn Discovery>,
    // Fixed for the process lifetime.
    self_prefix: String,
    prefix_sep: String,
}

impl MaggServer {
    pub fn new(config_path: Option<PathBuf>) -> Arc<Self> {
        Self::with_transport_factory(config_path, None)
    }

    pub fn with_transport_factory(
        config_path: Option<PathBuf>,
        factory: Option<TransportFactory>,
    ) -> Arc<Self> {
        let config_manager = Arc::new(ConfigManager::new(config_path));
        let config = config_manager.load_config();

        let router = Arc::new(MessageRouter::new());
        let coordinator = Arc::new(ServerMessageCoordinator::new(router.clone()));

        let mut manager = ServerManager::new(coordinator.clone());
        if let Some(factory) = factory {
            manager = manager.with_transport_factory(factory);
        }
        let server_manager = Arc::new(manager);

        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            reload_manager: ReloadManager::new(config_manager.clone()),
            kits: Mutex::new(KitManager::new(config.kitd_paths())),
            discovery: Arc::new(NullDiscovery),
            self_prefix: config.self_prefix.clone(),
            prefix_sep: config.prefix_sep.clone(),
            config_manager,
            server_manager,
            router,
            coordinator,
        })
    }

    pub fn server_manager(&self) -> &Arc<ServerManager> {
        &self.server_manager
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn coordinator(&self) -> &Arc<ServerMessageCoordinator> {
        &self.coordinator
    }

    pub fn self_prefix(&self) -> &str {
        &self.self_prefix
    }

    /// Self prefix with trailing separator.
    pub fn self_prefix_(&self) -> String {
        format!("{}{}", self.self_prefix, self.prefix_sep)
    }

    /// Current configuration, loaded from disk.
    pub fn config(&self) -> MaggConfig {
        self.config_manager.load_config()
    }

    /// Persist the configuration, flagging the reloader so the write does
    /// not bounce back as a reload.
    pub fn save_config(&self, config: &MaggConfig) -> Result<()> {
        self.reload_manager.ignore_next_change();
        self.config_manager.save_config(config)?;
        self.reload_manager.update_cached_config(config.clone());
        Ok(())
    }

    fn loopback(&self) -> Result<LoopbackClient> {
        let this = self
            .weak_self
            .upgrade()
            .ok_or_else(|| Error::fatal("server is shutting down"))?;
        Ok(LoopbackClient::new(this))
    }

    /// Bring the server up: reconcile kits, mount enabled servers, start
    /// the reload watcher.
    pub async fn setup(&self) -> Result<()> {
        let mut config = self.config();

        self.kits.lock().unwrap().load_kits_from_config(&mut config);

        self.server_manager
            .mount_all_enabled(config.enabled_servers())
            .await;

        self.reload_manager
            .setup(Arc::new(ManagerReloadHandler {
                manager: self.server_manager.clone(),
            }))
            .await;

        info!(
            "magg ready: {} servers configured, {} mounted",
            config.servers.len(),
            self.server_manager.mounted_names().await.len()
        );
        Ok(())
    }

    /// Manually trigger a config reload (also wired to SIGHUP).
    pub async fn reload(&self) -> Result<Option<magg_config::change::ConfigChange>> {
        self.reload_manager.reload().await
    }

    /// Tear everything down: stop watching, cancel outstanding backend
    /// operations, close sessions.
    pub async fn shutdown(&self) {
        self.reload_manager.stop().await;
        self.server_manager.shutdown().await;
        info!("magg shut down");
    }

    // ------------------------------------------------------------------
    // Aggregation
    // ------------------------------------------------------------------

    async fn aggregate_tools(&self) -> Vec<Tool> {
        let mut tools = management_tools(&self.self_prefix_());
        tools.push(proxy_tool_definition(magg_client::proxy::PROXY_TOOL_NAME));

        for mounted in self.server_manager.mounted().await {
            match mounted.client.list_tools().await {
                Ok(backend_tools) => {
                    tools.extend(backend_tools.into_iter().map(|mut tool| {
                        tool.name = prefixed_name(&mounted.prefix, &tool.name, &self.prefix_sep);
                        tool
                    }));
                }
                Err(e) => {
                    warn!("Failed to list tools from {}: {}", mounted.name, e);
                }
            }
        }

        tools
    }

    async fn aggregate_resources(&self) -> Vec<Resource> {
        let mut resources = self_resources(&self.self_prefix);

        for mounted in self.server_manager.mounted().await {
            match mounted.client.list_resources().await {
                Ok(backend_resources) => {
                    resources.extend(backend_resources.into_iter().map(|mut resource| {
                        resource.uri = prefixed_resource_uri(&mounted.prefix, &resource.uri);
                        resource
                    }));
                }
                Err(e) => {
                    warn!("Failed to list resources from {}: {}", mounted.name, e);
                }
            }
        }

        resources
    }

    async fn aggregate_resource_templates(&self) -> Vec<ResourceTemplate> {
        let mut templates = self_resource_templates(&self.self_prefix);

        for mounted in self.server_manager.mounted().await {
            match mounted.client.list_resource_templates().await {
                Ok(backend_templates) => {
                    templates.extend(backend_templates.into_iter().map(|mut template| {
                        template.uri_template =
                            prefixed_resource_uri(&mounted.prefix, &template.uri_template);
                        template
                    }));
                }
                Err(e) => {
                    warn!("Failed to list resource templates from {}: {}", mounted.name, e);
                }
            }
        }

        templates
    }

    async fn aggregate_prompts(&self) -> Vec<Prompt> {
        let mut prompts = Vec::new();

        for mounted in self.server_manager.mounted().await {
            match mounted.client.list_prompts().await {
                Ok(backend_prompts) => {
                    prompts.extend(backend_prompts.into_iter().map(|mut prompt| {
                        prompt.name = prefixed_name(&mounted.prefix, &prompt.name, &self.prefix_sep);
                        prompt
                    }));
                }
                Err(e) => {
                    warn!("Failed to list prompts from {}: {}", mounted.name, e);
                }
            }
        }

        prompts
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    async fn route_tool_call(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult> {
        if name == magg_client::proxy::PROXY_TOOL_NAME {
            let args = arguments.unwrap_or_default();
            let action = args
                .get("action")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::validation("proxy requires an 'action' parameter"))?;
            let a_type = args
                .get("type")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::validation("proxy requires a 'type' parameter"))?;
            let path = args.get("path").and_then(Value::as_str);
            let call_args = args.get("args").cloned().filter(|v| !v.is_null());

            let loopback = self.loopback()?;
            return proxy::dispatch(
                &loopback,
                magg_client::proxy::PROXY_TOOL_NAME,
                action,
                a_type,
                path,
                call_args,
            )
            .await;
        }

        let self_prefix_ = self.self_prefix_();
        if let Some(tool) = name.strip_prefix(&self_prefix_) {
            let response = self.call_management_tool(tool, arguments).await;
            return Ok(CallToolResult {
                content: vec![Content::text(response.to_json_text())],
                is_error: response.is_error(),
            });
        }

        let Some((prefix, tool_name)) = magg_core::prefix::split_prefixed_name(name, &self.prefix_sep)
        else {
            return Err(Error::not_found(format!("Unknown tool: {}", name)));
        };

        let Some(mounted) = self.server_manager.get_by_prefix(prefix).await else {
            return Err(Error::not_found(format!("Unknown tool: {}", name)));
        };

        mounted.client.call_tool(tool_name, arguments).await
    }

    async fn route_read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        let self_scheme = format!("{}://", self.self_prefix);
        if let Some(rest) = uri.strip_prefix(&self_scheme) {
            return self.read_self_resource(rest);
        }

        for mounted in self.server_manager.mounted().await {
            if let Some(backend_uri) = strip_resource_prefix(&mounted.prefix, uri) {
                return mounted.client.read_resource(&backend_uri).await;
            }
        }

        Err(Error::not_found(format!("Unknown resource: {}", uri)))
    }

    async fn route_get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<GetPromptResult> {
        let Some((prefix, prompt_name)) =
            magg_core::prefix::split_prefixed_name(name, &self.prefix_sep)
        else {
            return Err(Error::not_found(format!("Unknown prompt: {}", name)));
        };

        let Some(mounted) = self.server_manager.get_by_prefix(prefix).await else {
            return Err(Error::not_found(format!("Unknown prompt: {}", name)));
        };

        mounted.client.get_prompt(prompt_name, arguments).await
    }

    fn read_self_resource(&self, rest: &str) -> Result<ReadResourceResult> {
        let config = self.config();
        let uri = format!("{}://{}", self.self_prefix, rest);

        let payload = match rest {
            "servers/all" => serde_json::to_value(&config.servers)?,
            "kits/all" => serde_json::to_value(&config.kits)?,
            _ => {
                if let Some(name) = rest.strip_prefix("server/") {
                    let server = config
                        .servers
                        .get(name)
                        .ok_or_else(|| Error::not_found(format!("Server {:?} not found", name)))?;
                    serde_json::to_value(server)?
                } else if let Some(name) = rest.strip_prefix("kit/") {
                    let details = self.kits.lock().unwrap().details(name);
                    let (loaded, kit) = details
                        .ok_or_else(|| Error::not_found(format!("Kit {:?} not found", name)))?;
                    let mut value = serde_json::to_value(&kit)?;
                    value["loaded"] = json!(loaded);
                    value
                } else {
                    return Err(Error::not_found(format!("Unknown resource: {}", uri)));
                }
            }
        };

        Ok(ReadResourceResult {
            contents: vec![ResourceContents::text(
                uri,
                "application/json",
                serde_json::to_string(&payload)?,
            )],
        })
    }

    // ------------------------------------------------------------------
    // Management tools
    // ------------------------------------------------------------------

    async fn call_management_tool(&self, tool: &str, arguments: Option<Value>) -> MaggResponse {
        let args = arguments.unwrap_or_else(|| json!({}));
        match tool {
            "add_server" => self.tool_add_server(&args).await,
            "remove_server" => self.tool_remove_server(&args).await,
            "list_servers" => self.tool_list_servers().await,
            "enable_server" => self.tool_enable_server(&args).await,
            "disable_server" => self.tool_disable_server(&args).await,
            "status" => self.tool_status().await,
            "check" => self.tool_check(&args).await,
            "reload_config" => self.tool_reload_config().await,
            "load_kit" => self.tool_load_kit(&args).await,
            "unload_kit" => self.tool_unload_kit(&args).await,
            "list_kits" => self.tool_list_kits().await,
            "kit_info" => self.tool_kit_info(&args).await,
            "search_servers" => self.tool_search_servers(&args).await,
            "smart_configure" => self.tool_smart_configure(&args).await,
            "analyze_servers" => self.tool_analyze_servers().await,
            other => MaggResponse::error(format!("Unknown tool: {}{}", self.self_prefix_(), other)),
        }
    }

    async fn tool_add_server(&self, args: &Value) -> MaggResponse {
        let Some(name) = arg_str(args, "name") else {
            return MaggResponse::error("'name' is required");
        };
        let Some(source) = arg_str(args, "source") else {
            return MaggResponse::error("'source' is required");
        };

        let mut config = self.config();
        if config.servers.contains_key(&name) {
            return MaggResponse::error(format!("Server '{}' already exists", name));
        }

        let mut server = ServerConfig::new(&name, source);
        server.prefix = arg_str(args, "prefix").unwrap_or_default();
        server.notes = arg_str(args, "notes");
        server.uri = arg_str(args, "uri");
        server.enabled = args.get("enable").and_then(Value::as_bool).unwrap_or(true);

        if let Some(command_line) = arg_str(args, "command") {
            let mut parts = split_command_line(&command_line);
            if !parts.is_empty() {
                server.command = Some(parts.remove(0));
                if !parts.is_empty() {
                    server.args = Some(parts);
                }
            }
        }

        if let Some(cwd) = arg_str(args, "cwd") {
            let path = PathBuf::from(&cwd);
            if !path.is_absolute() {
                return MaggResponse::error(format!(
                    "Working directory must be an absolute path: {}",
                    cwd
                ));
            }
            if !path.is_dir() {
                warn!("Working directory {} does not exist", cwd);
            }
            server.cwd = Some(path);
        }

        match json_object_arg(args, "env") {
            Ok(env) => {
                server.env = env.map(|map| {
                    map.into_iter()
                        .filter_map(|(k, v)| v.as_str().map(|v| (k, v.to_string())))
                        .collect()
                })
            }
            Err(e) => return MaggResponse::error(format!("Invalid 'env': {}", e)),
        }
        match json_object_arg(args, "transport") {
            Ok(transport) => server.transport = transport,
            Err(e) => return MaggResponse::error(format!("Invalid 'transport': {}", e)),
        }

        if let Err(e) = server.validate(&self.prefix_sep) {
            return MaggResponse::error(e.to_string());
        }

        let mut mounted = Value::Null;
        if server.enabled {
            match self.server_manager.mount(&server).await {
                Ok(ok) => mounted = json!(ok),
                Err(e) => {
                    return MaggResponse::error(format!("Failed to mount server '{}': {}", name, e));
                }
            }
        }

        config.add_server(server.clone());
        if let Err(e) = self.save_config(&config) {
            return MaggResponse::error(format!(
                "Failed to save configuration for added server '{}': {}",
                name, e
            ));
        }

        MaggResponse::success(json!({
            "action": "server_added",
            "server": {
                "name": server.name,
                "source": server.source,
                "prefix": server.effective_prefix(),
                "command": server.command_line(),
                "uri": server.uri,
                "cwd": server.cwd,
                "notes": server.notes,
                "enabled": server.enabled,
                "mounted": mounted,
            }
        }))
    }

    async fn tool_remove_server(&self, args: &Value) -> MaggResponse {
        let Some(name) = arg_str(args, "name") else {
            return MaggResponse::error("'name' is required");
        };

        let mut config = self.config();
        if !config.remove_server(&name) {
            return MaggResponse::error(format!("Server '{}' not found", name));
        }

        if let Err(e) = self.save_config(&config) {
            return MaggResponse::error(format!(
                "Failed to save configuration after removing server '{}': {}",
                name, e
            ));
        }

        self.server_manager.unmount(&name).await;

        MaggResponse::success(json!({
            "action": "server_removed",
            "server": {"name": name},
        }))
    }

    async fn tool_list_servers(&self) -> MaggResponse {
        let config = self.config();
        let mut servers = Vec::new();

        for (name, server) in &config.servers {
            let mut entry = json!({
                "name": name,
                "source": server.source,
                "prefix": server.effective_prefix(),
                "enabled": server.enabled,
                "mounted": self.server_manager.is_mounted(name).await,
            });
            if let Some(command) = server.command_line() {
                entry["command"] = json!(command);
            }
            if let Some(uri) = &server.uri {
                entry["uri"] = json!(uri);
            }
            if let Some(cwd) = &server.cwd {
                entry["cwd"] = json!(cwd);
            }
            if let Some(notes) = &server.notes {
                entry["notes"] = json!(notes);
            }
            if !server.kits.is_empty() {
                entry["kits"] = json!(server.kits);
            }
            servers.push(entry);
        }

        MaggResponse::success(json!(servers))
    }

    async fn tool_enable_server(&self, args: &Value) -> MaggResponse {
        let Some(name) = arg_str(args, "name") else {
            return MaggResponse::error("'name' is required");
        };

        let mut config = self.config();
        let Some(server) = config.servers.get_mut(&name) else {
            return MaggResponse::error(format!("Server '{}' not found", name));
        };
        if server.enabled {
            return MaggResponse::error(format!("Server '{}' is already enabled", name));
        }

        server.enabled = true;
        let server = server.clone();

        if let Err(e) = self.save_config(&config) {
            return MaggResponse::error(format!("Failed to save configuration for server '{}': {}", name, e));
        }

        let mounted = match self.server_manager.mount(&server).await {
            Ok(ok) => ok,
            Err(e) => {
                error!("Failed to mount {} after enable: {}", name, e);
                false
            }
        };

        MaggResponse::success(json!({
            "action": "server_enabled",
            "server": {"name": name},
            "mounted": mounted,
        }))
    }

    async fn tool_disable_server(&self, args: &Value) -> MaggResponse {
        let Some(name) = arg_str(args, "name") else {
            return MaggResponse::error("'name' is required");
        };

        let mut config = self.config();
        let Some(server) = config.servers.get_mut(&name) else {
            return MaggResponse::error(format!("Server '{}' not found", name));
        };
        if !server.enabled {
            return MaggResponse::error(format!("Server '{}' is already disabled", name));
        }

        server.enabled = false;

        if let Err(e) = self.save_config(&config) {
            return MaggResponse::error(format!("Failed to save configuration for server '{}': {}", name, e));
        }

        self.server_manager.unmount(&name).await;

        MaggResponse::success(json!({
            "action": "server_disabled",
            "server": {"name": name},
        }))
    }

    async fn tool_status(&self) -> MaggResponse {
        let config = self.config();
        let total_tools = self.aggregate_tools().await.len();

        let mut prefixes = Map::new();
        for mounted in self.server_manager.mounted().await {
            prefixes.insert(mounted.name.clone(), json!(mounted.prefix));
        }

        let enabled = config.enabled_servers().count();
        MaggResponse::success(json!({
            "servers": {
                "total": config.servers.len(),
                "enabled": enabled,
                "mounted": self.server_manager.mounted_names().await.len(),
                "disabled": config.servers.len() - enabled,
            },
            "tools": {"total": total_tools},
            "prefixes": prefixes,
        }))
    }

    async fn tool_check(&self, args: &Value) -> MaggResponse {
        let action = arg_str(args, "action").unwrap_or_else(|| "report".to_string());
        if !["report", "remount", "unmount", "disable"].contains(&action.as_str()) {
            return MaggResponse::error(format!("Invalid check action '{}'", action));
        }
        let timeout = args
            .get("timeout")
            .and_then(Value::as_f64)
            .unwrap_or(DEFAULT_CHECK_TIMEOUT_SECS);
        let timeout = Duration::from_secs_f64(timeout.max(0.0));

        let mounted = self.server_manager.mounted().await;

        // Probes run in parallel, each bounded by its own timeout.
        let probes = futures::future::join_all(mounted.iter().map(|m| {
            let name = m.name.clone();
            async move {
                let result = self.server_manager.probe(&name, timeout).await;
                (name, result)
            }
        }))
        .await;

        let mut results = Map::new();
        let mut unresponsive = Vec::new();
        for (name, probe) in &probes {
            if probe.status != HealthState::Healthy {
                unresponsive.push(name.clone());
            }
            results.insert(name.clone(), json!(probe));
        }

        let mut actions_taken: Vec<String> = Vec::new();
        if !unresponsive.is_empty() && action != "report" {
            match action.as_str() {
                "disable" => {
                    let mut config = self.config();
                    let mut any_changes = false;
                    for name in &unresponsive {
                        match config.servers.get_mut(name) {
                            Some(server) if server.enabled => {
                                server.enabled = false;
                                any_changes = true;
                                self.server_manager.unmount(name).await;
                                actions_taken.push(format!("Disabled {}", name));
                                results[name.as_str()]["action"] = json!("disabled");
                            }
                            Some(_) => {
                                actions_taken.push(format!("{} already disabled", name));
                                results[name.as_str()]["action"] = json!("already_disabled");
                            }
                            None => {
                                actions_taken.push(format!("Failed to disable {}", name));
                                results[name.as_str()]["action"] = json!("disable_failed");
                            }
                        }
                    }
                    if any_changes {
                        if let Err(e) = self.save_config(&config) {
                            error!("Failed to save config after disabling servers: {}", e);
                        }
                    }
                }
                "remount" => {
                    let config = self.config();
                    for name in &unresponsive {
                        self.server_manager.unmount(name).await;
                        match config.servers.get(name) {
                            Some(server) if server.enabled => {
                                match self.server_manager.mount(server).await {
                                    Ok(true) => {
                                        actions_taken.push(format!("Remounted {}", name));
                                        results[name.as_str()]["action"] = json!("remounted");
                                    }
                                    _ => {
                                        actions_taken.push(format!("Failed to remount {}", name));
                                        results[name.as_str()]["action"] = json!("remount_failed");
                                    }
                                }
                            }
                            _ => {
                                actions_taken.push(format!("Failed to remount {}", name));
                                results[name.as_str()]["action"] = json!("remount_failed");
                            }
                        }
                    }
                }
                "unmount" => {
                    for name in &unresponsive {
                        self.server_manager.unmount(name).await;
                        actions_taken.push(format!("Unmounted {}", name));
                        results[name.as_str()]["action"] = json!("unmounted");
                    }
                }
                _ => {}
            }
        }

        let healthy = probes
            .iter()
            .filter(|(_, p)| p.status == HealthState::Healthy)
            .count();

        MaggResponse::success(json!({
            "servers_checked": probes.len(),
            "healthy": healthy,
            "unresponsive": unresponsive.len(),
            "results": results,
            "actions_taken": if actions_taken.is_empty() { Value::Null } else { json!(actions_taken) },
        }))
    }

    async fn tool_reload_config(&self) -> MaggResponse {
        let config = self.config();
        if !config.auto_reload {
            return MaggResponse::error(
                "Configuration reload is disabled. Set MAGG_AUTO_RELOAD=true to enable.",
            );
        }
        if config.read_only {
            return MaggResponse::error("Configuration reload is not allowed in read-only mode.");
        }

        match self.reload_manager.reload().await {
            Ok(change) => MaggResponse::success(json!({
                "message": "Configuration reloaded successfully",
                "config_path": self.config_manager.config_path(),
                "changes": change.map(|c| c.summarize()),
            })),
            Err(e) => {
                error!("Error during config reload: {}", e);
                MaggResponse::error(format!("Config reload error: {}", e))
            }
        }
    }

    async fn tool_load_kit(&self, args: &Value) -> MaggResponse {
        let Some(name) = arg_str(args, "name") else {
            return MaggResponse::error("'name' is required");
        };
        if self.config_manager.read_only() {
            return MaggResponse::error("Cannot load kits in read-only mode.");
        }

        let mut config = self.config();
        let (ok, message) = self.kits.lock().unwrap().load(&name, &mut config);
        if !ok {
            return MaggResponse::error(message);
        }

        if let Err(e) = self.save_config(&config) {
            return MaggResponse::error(format!("Failed to save configuration after loading kit: {}", e));
        }

        // Mount any newly added enabled servers owned by this kit.
        for server in config.servers.values() {
            if server.enabled
                && server.kits.iter().any(|k| k == &name)
                && !self.server_manager.is_mounted(&server.name).await
            {
                if let Err(e) = self.server_manager.mount(server).await {
                    warn!("Failed to mount kit server {}: {}", server.name, e);
                }
            }
        }

        MaggResponse::success(json!({"action": "kit_loaded", "message": message}))
    }

    async fn tool_unload_kit(&self, args: &Value) -> MaggResponse {
        let Some(name) = arg_str(args, "name") else {
            return MaggResponse::error("'name' is required");
        };
        if self.config_manager.read_only() {
            return MaggResponse::error("Cannot unload kits in read-only mode.");
        }

        let old_config = self.config();
        let mut config = old_config.clone();
        let (ok, message) = self.kits.lock().unwrap().unload(&name, &mut config);
        if !ok {
            return MaggResponse::error(message);
        }

        if let Err(e) = self.save_config(&config) {
            return MaggResponse::error(format!("Failed to save configuration after unloading kit: {}", e));
        }

        // Unmount servers the unload removed.
        let change = diff_configs(&old_config, &config);
        if let Err(e) = self.server_manager.handle_config_change(&change).await {
            warn!("Error applying kit unload changes: {}", e);
        }

        MaggResponse::success(json!({"action": "kit_unloaded", "message": message}))
    }

    async fn tool_list_kits(&self) -> MaggResponse {
        let summaries = self.kits.lock().unwrap().list_all();
        MaggResponse::success(json!(summaries))
    }

    async fn tool_kit_info(&self, args: &Value) -> MaggResponse {
        let Some(name) = arg_str(args, "name") else {
            return MaggResponse::error("'name' is required");
        };

        let details = self.kits.lock().unwrap().details(&name);
        match details {
            Some((loaded, kit)) => {
                let mut value = serde_json::to_value(&kit).unwrap_or(Value::Null);
                value["loaded"] = json!(loaded);
                MaggResponse::success(value)
            }
            None => MaggResponse::error(format!("Kit '{}' not found", name)),
        }
    }

    async fn tool_search_servers(&self, args: &Value) -> MaggResponse {
        let Some(query) = arg_str(args, "query") else {
            return MaggResponse::error("'query' is required");
        };
        let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(5) as usize;

        match self.discovery.search(&query, limit).await {
            Ok(results) => MaggResponse::success(json!({"query": query, "results": results})),
            Err(e) => MaggResponse::error(format!("Failed to search servers: {}", e)),
        }
    }

    async fn tool_smart_configure(&self, args: &Value) -> MaggResponse {
        let Some(source) = arg_str(args, "source") else {
            return MaggResponse::error("'source' is required");
        };
        let name = arg_str(args, "server_name");

        match self.discovery.configure(&source, name.as_deref()).await {
            Ok(config) => MaggResponse::success(json!({
                "action": "smart_configure_prompt",
                "source": source,
                "response": config,
            })),
            Err(e) => MaggResponse::error(format!("Smart configuration failed: {}", e)),
        }
    }

    async fn tool_analyze_servers(&self) -> MaggResponse {
        let config = self.config();
        if config.servers.is_empty() {
            return MaggResponse::success(json!({
                "analysis": format!(
                    "No servers configured yet. Use {}add_server to add servers.",
                    self.self_prefix_()
                )
            }));
        }

        let mut servers = Map::new();
        for (name, server) in &config.servers {
            servers.insert(
                name.clone(),
                json!({
                    "source": server.source,
                    "enabled": server.enabled,
                    "mounted": self.server_manager.is_mounted(name).await,
                    "command": server.command_line(),
                    "uri": server.uri,
                    "prefix": server.effective_prefix(),
                    "notes": server.notes,
                }),
            );
        }

        let enabled = config.enabled_servers().count();
        MaggResponse::success(json!({
            "total_servers": config.servers.len(),
            "enabled_servers": enabled,
            "mounted_servers": self.server_manager.mounted_names().await.len(),
            "servers": servers,
        }))
    }
}

#[async_trait]
impl McpHandler for MaggServer {
    async fn handle_request(&self, request: McpRequest) -> Option<McpResponse> {
        if request.is_notification() {
            debug!(method = %request.method, "Ignoring client notification");
            return None;
        }

        let id = request.id.clone();
        let params = request.params.unwrap_or_default();

        let outcome: Result<Value> = match request.method.as_str() {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {"listChanged": true},
                    "resources": {"listChanged": true},
                    "prompts": {"listChanged": true},
                },
                "serverInfo": {
                    "name": self.self_prefix,
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "instructions": INSTRUCTIONS,
            })),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({"tools": self.aggregate_tools().await})),
            "tools/call" => {
                let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
                if name.is_empty() {
                    Err(Error::validation("missing tool name"))
                } else {
                    let arguments = params.get("arguments").cloned();
                    match self.route_tool_call(name, arguments).await {
                        Ok(result) => serde_json::to_value(result).map_err(Error::from),
                        // Tool execution failures become error results; only
                        // bad requests surface as protocol errors.
                        Err(e @ (Error::Validation(_) | Error::NotFound(_))) => Err(e),
                        Err(e) => serde_json::to_value(CallToolResult {
                            content: vec![Content::text(e.to_string())],
                            is_error: true,
                        })
                        .map_err(Error::from),
                    }
                }
            }
            "resources/list" => Ok(json!({"resources": self.aggregate_resources().await})),
            "resources/templates/list" => Ok(json!({
                "resourceTemplates": self.aggregate_resource_templates().await
            })),
            "resources/read" => {
                let uri = params.get("uri").and_then(Value::as_str).unwrap_or_default();
                match self.route_read_resource(uri).await {
                    Ok(result) => serde_json::to_value(result).map_err(Error::from),
                    Err(e) => Err(e),
                }
            }
            "prompts/list" => Ok(json!({"prompts": self.aggregate_prompts().await})),
            "prompts/get" => {
                let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
                let arguments = params.get("arguments").cloned();
                match self.route_get_prompt(name, arguments).await {
                    Ok(result) => serde_json::to_value(result).map_err(Error::from),
                    Err(e) => Err(e),
                }
            }
            other => {
                return Some(McpResponse::error(id, JsonRpcError::method_not_found(other)));
            }
        };

        Some(match outcome {
            Ok(result) => McpResponse::success(id, result),
            Err(Error::Validation(message)) => {
                McpResponse::error(id, JsonRpcError::invalid_params(message))
            }
            Err(Error::NotFound(message)) => {
                McpResponse::error(id, JsonRpcError::invalid_params(message))
            }
            Err(e) => McpResponse::error(id, JsonRpcError::internal_error(e.to_string())),
        })
    }
}

// ----------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------

fn arg_str(args: &Value, key: &str) -> Option<String> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Accept an object argument either inline or as a JSON-encoded string.
fn json_object_arg(args: &Value, key: &str) -> Result<Option<Map<String, Value>>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map.clone()).filter(|m| !m.is_empty())),
        Some(Value::String(raw)) => {
            let value: Value = serde_json::from_str(raw)
                .map_err(|e| Error::validation(format!("not valid JSON: {}", e)))?;
            match value {
                Value::Object(map) => Ok(Some(map).filter(|m| !m.is_empty())),
                _ => Err(Error::validation("expected a JSON object")),
            }
        }
        Some(_) => Err(Error::validation("expected an object or JSON string")),
    }
}

fn string_schema(description: &str) -> Value {
    json!({"type": "string", "description": description})
}

/// Definitions of magg's own management tools.
fn management_tools(self_prefix_: &str) -> Vec<Tool> {
    let named = |tool: &str, description: &str, properties: Value, required: Value| Tool {
        name: format!("{}{}", self_prefix_, tool),
        description: Some(description.to_string()),
        input_schema: json!({
            "type": "object",
            "properties": properties,
            "required": required,
        }),
        annotations: None,
    };

    vec![
        named(
            "add_server",
            "Add a new MCP server.",
            json!({
                "name": string_schema("Unique server name"),
                "source": string_schema("URL of the server package/repository"),
                "prefix": string_schema("Tool prefix (defaults to conformed server name)"),
                "command": string_schema("Full command to run (e.g. 'python server.py', 'npx @playwright/mcp@latest')"),
                "uri": string_schema("URI for HTTP servers"),
                "env": {"type": "object", "description": "Environment variables (object or JSON string)"},
                "cwd": string_schema("Working directory (for commands)"),
                "notes": string_schema("Setup notes"),
                "enable": {"type": "boolean", "description": "Whether to enable the server immediately", "default": true},
                "transport": {"type": "object", "description": "Transport-specific configuration (object or JSON string)"},
            }),
            json!(["name", "source"]),
        ),
        named(
            "remove_server",
            "Remove a server.",
            json!({"name": string_schema("Server name to remove")}),
            json!(["name"]),
        ),
        named(
            "list_servers",
            "List all configured servers with their runtime mount state.",
            json!({}),
            json!([]),
        ),
        named(
            "enable_server",
            "Enable a server and mount it.",
            json!({"name": string_schema("Server name to enable")}),
            json!(["name"]),
        ),
        named(
            "disable_server",
            "Disable a server and unmount it.",
            json!({"name": string_schema("Server name to disable")}),
            json!(["name"]),
        ),
        named(
            "status",
            "Get magg server status and statistics.",
            json!({}),
            json!([]),
        ),
        named(
            "check",
            "Check health of mounted servers and handle unresponsive ones.",
            json!({
                "action": {
                    "type": "string",
                    "enum": ["report", "remount", "unmount", "disable"],
                    "description": "Action for unresponsive servers",
                    "default": "report",
                },
                "timeout": {"type": "number", "description": "Per-server timeout in seconds", "default": DEFAULT_CHECK_TIMEOUT_SECS},
            }),
            json!([]),
        ),
        named(
            "reload_config",
            "Reload configuration from disk and apply changes.",
            json!({}),
            json!([]),
        ),
        named(
            "load_kit",
            "Load a kit and its servers into the configuration.",
            json!({"name": string_schema("Kit name to load")}),
            json!(["name"]),
        ),
        named(
            "unload_kit",
            "Unload a kit, removing servers it solely owns.",
            json!({"name": string_schema("Kit name to unload")}),
            json!(["name"]),
        ),
        named(
            "list_kits",
            "List all kits with their status.",
            json!({}),
            json!([]),
        ),
        named(
            "kit_info",
            "Get detailed information about a kit.",
            json!({"name": string_schema("Kit name")}),
            json!(["name"]),
        ),
        named(
            "search_servers",
            "Search for MCP servers online.",
            json!({
                "query": string_schema("Search query"),
                "limit": {"type": "integer", "description": "Maximum results per source", "default": 5},
            }),
            json!(["query"]),
        ),
        named(
            "smart_configure",
            "Configure a server from a source URL using external tooling.",
            json!({
                "source": string_schema("URL of the server package/repository"),
                "server_name": string_schema("Optional server name"),
            }),
            json!(["source"]),
        ),
        named(
            "analyze_servers",
            "Analyze configured servers and provide insights.",
            json!({}),
            json!([]),
        ),
    ]
}

fn self_resources(self_prefix: &str) -> Vec<Resource> {
    vec![
        Resource {
            uri: format!("{}://servers/all", self_prefix),
            name: Some("servers".into()),
            description: Some("All configured servers".into()),
            mime_type: Some("application/json".into()),
        },
        Resource {
            uri: format!("{}://kits/all", self_prefix),
            name: Some("kits".into()),
            description: Some("All loaded kits".into()),
            mime_type: Some("application/json".into()),
        },
    ]
}

fn self_resource_templates(self_prefix: &str) -> Vec<ResourceTemplate> {
    vec![
        ResourceTemplate {
            uri_template: format!("{}://server/{{name}}", self_prefix),
            name: Some("server".into()),
            description: Some("Configuration of one server".into()),
            mime_type: Some("application/json".into()),
        },
        ResourceTemplate {
            uri_template: format!("{}://kit/{{name}}", self_prefix),
            name: Some("kit".into()),
            description: Some("Metadata of one kit".into()),
            mime_type: Some("application/json".into()),
        },
    ]
}
