//! Config file persistence
//!
//! The loader is tolerant: a server entry that fails validation is skipped
//! with an error log instead of poisoning the whole file. The saver writes
//! only the dynamic part (servers and kits) - scalar settings come from the
//! environment.

use crate::settings::{KitInfo, KitSource, MaggConfig, ServerConfig};
use magg_core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// Bearer auth validation parameters, loaded from `auth.json` next to the
/// config file. Token issuance and verification live outside the core; the
/// front-end only consumes this triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BearerAuthConfig {
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default = "default_audience")]
    pub audience: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
}

fn default_issuer() -> String {
    "https://magg.local".to_string()
}

fn default_audience() -> String {
    "magg".to_string()
}

impl Default for BearerAuthConfig {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            audience: default_audience(),
            key_path: None,
        }
    }
}

/// Top-level auth configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub bearer: BearerAuthConfig,
}

/// Manages magg configuration persistence.
pub struct ConfigManager {
    config_path: PathBuf,
    read_only: bool,
}

impl ConfigManager {
    /// Create a manager for the given path, or the environment-derived
    /// default when `None`.
    pub fn new(config_path: Option<PathBuf>) -> Self {
        let base = MaggConfig::from_env();
        Self {
            config_path: config_path.unwrap_or(base.config_path),
            read_only: base.read_only,
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn auth_config_path(&self) -> PathBuf {
        self.config_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("auth.json")
    }

    /// Load configuration from disk. Missing files yield the env defaults;
    /// malformed server entries are skipped.
    pub fn load_config(&self) -> MaggConfig {
        let mut config = MaggConfig::from_env();
        config.config_path = self.config_path.clone();
        config.read_only = config.read_only || self.read_only;

        let data = match std::fs::read_to_string(&self.config_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return config,
            Err(e) => {
                error!("Error reading config {}: {}", self.config_path.display(), e);
                return config;
            }
        };

        let root: Value = match serde_json::from_str(&data) {
            Ok(value) => value,
            Err(e) => {
                error!("Error parsing config {}: {}", self.config_path.display(), e);
                return config;
            }
        };

        apply_config_value(&mut config, root);
        config
    }

    /// Save configuration to disk.
    ///
    /// Only servers and kits are persisted; fields at their defaults are
    /// omitted. Fails with `ReadOnly` when the config is read-only and
    /// `Fatal` when the file cannot be written.
    pub fn save_config(&self, config: &MaggConfig) -> Result<()> {
        if self.read_only || config.read_only {
            return Err(Error::read_only("not saving configuration".to_string()));
        }

        let servers: BTreeMap<&String, Value> = config
            .servers
            .iter()
            .map(|(name, server)| (name, serde_json::to_value(server).unwrap_or(Value::Null)))
            .collect();

        let mut root = serde_json::Map::new();
        root.insert("servers".into(), serde_json::to_value(&servers)?);
        if !config.kits.is_empty() {
            root.insert("kits".into(), serde_json::to_value(&config.kits)?);
        }

        if let Some(parent) = self.config_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                warn!("Creating new directory: {}", parent.display());
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::fatal(format!("cannot create {}: {}", parent.display(), e)))?;
            }
        }

        let data = serde_json::to_string_pretty(&Value::Object(root))?;
        std::fs::write(&self.config_path, data)
            .map_err(|e| Error::fatal(format!("cannot write {}: {}", self.config_path.display(), e)))?;

        debug!("Saved config to {}", self.config_path.display());
        Ok(())
    }

    /// Load auth configuration, falling back to defaults when absent or bad.
    pub fn load_auth_config(&self) -> AuthConfig {
        let path = self.auth_config_path();
        match std::fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(auth) => auth,
                Err(e) => {
                    error!("Error parsing auth config {}: {}", path.display(), e);
                    AuthConfig::default()
                }
            },
            Err(_) => {
                debug!("No auth.json found, using default auth config");
                AuthConfig::default()
            }
        }
    }
}

/// Merge a parsed config file into an env-derived base config.
fn apply_config_value(config: &mut MaggConfig, root: Value) {
    let Value::Object(mut root) = root else {
        error!("Config root is not an object, ignoring file");
        return;
    };

    if let Some(Value::Object(servers)) = root.remove("servers") {
        for (name, server_data) in servers {
            match serde_json::from_value::<ServerConfig>(server_data) {
                Ok(mut server) => {
                    server.name = name.clone();
                    config.servers.insert(name, server);
                }
                Err(e) => {
                    error!("Error loading server '{}': {}", name, e);
                }
            }
        }
    }

    if let Some(kits) = root.remove("kits") {
        config.kits = parse_kits(kits);
    }

    for (key, value) in root {
        match key.as_str() {
            "self_prefix" => {
                if let Value::String(s) = value {
                    config.self_prefix = s;
                }
            }
            "prefix_sep" => {
                if let Value::String(s) = value {
                    config.prefix_sep = s;
                }
            }
            "read_only" => {
                if let Value::Bool(b) = value {
                    config.read_only = config.read_only || b;
                }
            }
            "auto_reload" => {
                if let Value::Bool(b) = value {
                    config.auto_reload = b;
                }
            }
            "reload_poll_interval" => {
                if let Some(secs) = value.as_f64() {
                    config.reload_poll_interval = secs;
                }
            }
            "log_level" => {
                if let Value::String(s) = value {
                    config.log_level = Some(s);
                }
            }
            "quiet" => {
                if let Value::Bool(b) = value {
                    config.quiet = b;
                }
            }
            other => {
                warn!("Unknown config key '{}' in config file", other);
            }
        }
    }
}

/// Parse the `kits` entry, upgrading the legacy list-of-names form.
fn parse_kits(value: Value) -> BTreeMap<String, KitInfo> {
    match value {
        Value::Object(map) => map
            .into_iter()
            .filter_map(|(name, data)| match serde_json::from_value::<KitInfo>(data) {
                Ok(mut info) => {
                    info.name = name.clone();
                    Some((name, info))
                }
                Err(e) => {
                    error!("Error loading kit entry '{}': {}", name, e);
                    None
                }
            })
            .collect(),
        Value::Array(names) => names
            .into_iter()
            .filter_map(|item| match item {
                Value::String(name) => Some((
                    name.clone(),
                    KitInfo {
                        name,
                        description: None,
                        path: None,
                        source: KitSource::Legacy,
                    },
                )),
                other => {
                    error!("Ignoring non-string legacy kit entry: {}", other);
                    None
                }
            })
            .collect(),
        other => {
            error!("Config 'kits' is neither object nor list: {}", other);
            BTreeMap::new()
        }
    }
}
