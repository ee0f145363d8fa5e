//! Backend lifecycle - mounting, unmounting, probing
//!
//! The manager exclusively owns the mount map and the live client sessions.
//! The map is keyed by server name; the prefix is derived state, so two
//! servers may temporarily share a prefix during rollouts (the most recently
//! mounted one wins the namespace).

use crate::messaging::{BackendMessageHandler, ServerMessageCoordinator};
use chrono::{DateTime, Utc};
use magg_client::client::{ClientConfig, McpClient};
use magg_client::transport::{select_transport, LaunchSpec, Transport};
use magg_config::change::{ChangeAction, ConfigChange};
use magg_config::settings::ServerConfig;
use magg_core::error::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Liveness classification of a mounted backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unresponsive,
    Error,
}

/// Runtime record for one mounted backend.
pub struct MountedServer {
    pub name: String,
    pub prefix: String,
    /// Snapshot of the config the mount was created from.
    pub config: ServerConfig,
    pub client: Arc<McpClient>,
    mount_seq: u64,
    health: Mutex<HealthState>,
    last_probe_at: Mutex<Option<DateTime<Utc>>>,
}

impl MountedServer {
    pub fn health(&self) -> HealthState {
        *self.health.lock().unwrap()
    }

    pub fn last_probe_at(&self) -> Option<DateTime<Utc>> {
        *self.last_probe_at.lock().unwrap()
    }

    fn record_probe(&self, health: HealthState) {
        *self.health.lock().unwrap() = health;
        *self.last_probe_at.lock().unwrap() = Some(Utc::now());
    }
}

/// Outcome of one health probe.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub status: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Factory used to build a transport for a launch spec. Tests substitute
/// scripted transports here.
pub type TransportFactory =
    Arc<dyn Fn(&ServerConfig, LaunchSpec) -> Result<Box<dyn Transport>> + Send + Sync>;

/// Manages MCP backends - mounting, unmounting, and tracking.
pub struct ServerManager {
    mounts: tokio::sync::Mutex<BTreeMap<String, Arc<MountedServer>>>,
    coordinator: Arc<ServerMessageCoordinator>,
    client_config: ClientConfig,
    transport_factory: TransportFactory,
    mount_counter: AtomicU64,
}

impl ServerManager {
    pub fn new(coordinator: Arc<ServerMessageCoordinator>) -> Self {
        Self {
            mounts: tokio::sync::Mutex::new(BTreeMap::new()),
            coordinator,
            client_config: ClientConfig::default(),
            transport_factory: Arc::new(|_config, spec| select_transport(spec)),
            mount_counter: AtomicU64::new(0),
        }
    }

    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transport_factory = factory;
        self
    }

    pub fn coordinator(&self) -> &Arc<ServerMessageCoordinator> {
        &self.coordinator
    }

    fn launch_spec(server: &ServerConfig) -> LaunchSpec {
        LaunchSpec {
            command: server.command.clone(),
            args: server.args.clone().unwrap_or_default(),
            env: server.env.clone().unwrap_or_default(),
            cwd: server.cwd.clone(),
            uri: server.uri.clone(),
            transport: server.transport.clone(),
        }
    }

    /// Mount a server: open its transport, perform the MCP handshake, and
    /// register the session under the configured prefix.
    ///
    /// Disabled servers and already-mounted names return `Ok(false)`
    /// without action. Transport and handshake failures are non-fatal to
    /// magg; they surface as errors scoped to this one backend.
    pub async fn mount(&self, server: &ServerConfig) -> Result<bool> {
        if !server.enabled {
            info!("Server {} is disabled, skipping mount", server.name);
            return Ok(false);
        }

        {
            let mounts = self.mounts.lock().await;
            if mounts.contains_key(&server.name) {
                warn!("Server {} is already mounted, skipping", server.name);
                return Ok(false);
            }
        }

        let prefix = server.effective_prefix();
        let transport = (self.transport_factory)(server, Self::launch_spec(server))?;
        let client = Arc::new(McpClient::new(self.client_config.clone(), transport));

        client.set_notification_handler(Arc::new(BackendMessageHandler::new(
            server.name.clone(),
            self.coordinator.clone(),
        )));

        client.connect().await?;

        let mounted = Arc::new(MountedServer {
            name: server.name.clone(),
            prefix: prefix.clone(),
            config: server.clone(),
            client,
            mount_seq: self.mount_counter.fetch_add(1, Ordering::SeqCst),
            health: Mutex::new(HealthState::Healthy),
            last_probe_at: Mutex::new(None),
        });

        let mut mounts = self.mounts.lock().await;
        if mounts.values().any(|m| m.prefix == prefix) {
            warn!(
                "Prefix {:?} is already in use; {} now wins the namespace",
                prefix, server.name
            );
        }
        mounts.insert(server.name.clone(), mounted);

        debug!("Mounted server {} with prefix {}", server.name, prefix);
        Ok(true)
    }

    /// Unmount a server: close the session and drop the mount-map entry.
    ///
    /// The prefix is taken from the in-memory mount entry, never re-read
    /// from disk. Tolerant of names that are not mounted.
    pub async fn unmount(&self, name: &str) -> bool {
        let removed = self.mounts.lock().await.remove(name);
        match removed {
            Some(mounted) => {
                if let Err(e) = mounted.client.close().await {
                    warn!("Error closing session for {}: {}", name, e);
                }
                info!("Unmounted server {} (prefix {})", name, mounted.prefix);
                true
            }
            None => {
                warn!("Server {} is not mounted, cannot unmount", name);
                false
            }
        }
    }

    /// Mount every enabled server. A single failure never aborts the
    /// batch; the per-name report records what mounted and what didn't.
    pub async fn mount_all_enabled<'a, I>(&self, servers: I) -> Vec<(String, Result<bool>)>
    where
        I: IntoIterator<Item = &'a ServerConfig>,
    {
        let mut results = Vec::new();
        for server in servers {
            let outcome = self.mount(server).await;
            if let Err(e) = &outcome {
                error!("Failed to mount server {}: {}", server.name, e);
            }
            results.push((server.name.clone(), outcome));
        }

        let mounted: Vec<&str> = results
            .iter()
            .filter(|(_, r)| matches!(r, Ok(true)))
            .map(|(n, _)| n.as_str())
            .collect();
        let failed: Vec<&str> = results
            .iter()
            .filter(|(_, r)| r.is_err())
            .map(|(n, _)| n.as_str())
            .collect();
        if !mounted.is_empty() {
            info!("Successfully mounted: {}", mounted.join(", "));
        }
        if !failed.is_empty() {
            warn!("Failed to mount: {}", failed.join(", "));
        }

        results
    }

    /// Probe one backend by asking it to list its tools, bounded by
    /// `timeout`. Classifies healthy on response, unresponsive on timeout,
    /// error on anything else.
    pub async fn probe(&self, name: &str, timeout: Duration) -> ProbeResult {
        let mounted = self.mounts.lock().await.get(name).cloned();
        let Some(mounted) = mounted else {
            return ProbeResult {
                status: HealthState::Error,
                tools_count: None,
                reason: Some(format!("server {:?} is not mounted", name)),
            };
        };

        use magg_client::client::McpService;
        let result = match tokio::time::timeout(timeout, mounted.client.list_tools()).await {
            Ok(Ok(tools)) => ProbeResult {
                status: HealthState::Healthy,
                tools_count: Some(tools.len()),
                reason: None,
            },
            Ok(Err(e)) => ProbeResult {
                status: HealthState::Error,
                tools_count: None,
                reason: Some(e.to_string()),
            },
            Err(_) => ProbeResult {
                status: HealthState::Unresponsive,
                tools_count: None,
                reason: Some(format!("no response within {:?}", timeout)),
            },
        };

        mounted.record_probe(result.status);
        result
    }

    /// Apply a config change: unmount removed/disabled/updated servers,
    /// then mount added/enabled/updated ones. Updates are modelled as
    /// unmount-then-mount, with teardown strictly before setup.
    pub async fn handle_config_change(&self, change: &ConfigChange) -> Result<()> {
        for server_change in &change.server_changes {
            if server_change.action.unmounts() {
                self.unmount(&server_change.name).await;
            }
        }

        for server_change in &change.server_changes {
            if !server_change.action.mounts() {
                continue;
            }
            let Some(new_config) = &server_change.new_config else {
                continue;
            };
            if !new_config.enabled {
                continue;
            }
            if let Err(e) = self.mount(new_config).await {
                error!(
                    "Failed to mount {} after {:?} change: {}",
                    server_change.name, server_change.action, e
                );
            }
        }

        Ok(())
    }

    /// Snapshot of all mounted servers, in name order.
    pub async fn mounted(&self) -> Vec<Arc<MountedServer>> {
        self.mounts.lock().await.values().cloned().collect()
    }

    pub async fn mounted_names(&self) -> Vec<String> {
        self.mounts.lock().await.keys().cloned().collect()
    }

    pub async fn is_mounted(&self, name: &str) -> bool {
        self.mounts.lock().await.contains_key(name)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<MountedServer>> {
        self.mounts.lock().await.get(name).cloned()
    }

    /// Resolve a prefix to the mounted server that owns it. With duplicate
    /// prefixes the most recently mounted server wins.
    pub async fn get_by_prefix(&self, prefix: &str) -> Option<Arc<MountedServer>> {
        self.mounts
            .lock()
            .await
            .values()
            .filter(|m| m.prefix == prefix)
            .max_by_key(|m| m.mount_seq)
            .cloned()
    }

    /// Close every session. Used at shutdown and safe to call twice.
    pub async fn shutdown(&self) {
        let names = self.mounted_names().await;
        for name in names {
            self.unmount(&name).await;
        }
    }
}
