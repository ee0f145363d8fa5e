//! Kit management - bundling related MCP servers
//!
//! A kit is a named bundle of server definitions loaded from a JSON file in
//! a `kit.d` search path, or created inline. Servers may be owned by several
//! kits at once; a server is removed only when its last owning kit is
//! unloaded.

use crate::settings::{KitInfo, KitSource, MaggConfig, ServerConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Configuration for a kit - a bundle of related MCP servers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KitConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub links: BTreeMap<String, String>,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

impl KitConfig {
    /// Parse a kit file. Server entries drop any pre-declared `kits` field
    /// (ownership is computed, never declared) and inherit their map key as
    /// `name`; entries that fail to parse are skipped.
    pub fn from_json(name_hint: &str, data: &str) -> Option<Self> {
        let mut root: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(e) => {
                error!("Error parsing kit '{}': {}", name_hint, e);
                return None;
            }
        };

        let servers_value = root
            .as_object_mut()
            .and_then(|obj| obj.remove("servers"))
            .unwrap_or(Value::Object(Default::default()));

        let mut kit: KitConfig = match serde_json::from_value(root) {
            Ok(kit) => kit,
            Err(e) => {
                error!("Error parsing kit '{}': {}", name_hint, e);
                return None;
            }
        };

        if kit.name.is_empty() {
            kit.name = name_hint.to_string();
        }

        if let Value::Object(servers) = servers_value {
            for (server_name, mut server_data) in servers {
                if let Some(obj) = server_data.as_object_mut() {
                    obj.remove("kits");
                }
                match serde_json::from_value::<ServerConfig>(server_data) {
                    Ok(mut server) => {
                        server.name = server_name.clone();
                        server.kits.clear();
                        kit.servers.insert(server_name, server);
                    }
                    Err(e) => {
                        error!("Error loading server '{}' in kit '{}': {}", server_name, kit.name, e);
                    }
                }
            }
        }

        Some(kit)
    }
}

/// Summary of a kit for listing - loaded or merely discovered on disk.
#[derive(Debug, Clone, Serialize)]
pub struct KitSummary {
    pub loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub keywords: Vec<String>,
    pub servers: Vec<String>,
}

/// Manages kit discovery, loading, and integration with the configuration.
pub struct KitManager {
    kitd_paths: Vec<PathBuf>,
    kits: BTreeMap<String, KitConfig>,
}

impl KitManager {
    pub fn new(kitd_paths: Vec<PathBuf>) -> Self {
        Self {
            kitd_paths,
            kits: BTreeMap::new(),
        }
    }

    /// Kits currently loaded in memory.
    pub fn kits(&self) -> &BTreeMap<String, KitConfig> {
        &self.kits
    }

    /// Scan the kit.d search paths for kit files.
    ///
    /// First match wins on name collision across paths.
    pub fn discover(&self) -> BTreeMap<String, PathBuf> {
        let mut found = BTreeMap::new();

        for kitd_path in &self.kitd_paths {
            let entries = match std::fs::read_dir(kitd_path) {
                Ok(entries) => entries,
                Err(_) => continue,
            };

            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().map_or(true, |ext| ext != "json") || !path.is_file() {
                    continue;
                }
                let Some(kit_name) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };

                if let Some(existing) = found.get(kit_name) {
                    warn!(
                        "Duplicate kit '{}' found at {}, keeping {:?}",
                        kit_name,
                        path.display(),
                        existing
                    );
                } else {
                    found.insert(kit_name.to_string(), path);
                }
            }
        }

        found
    }

    /// Parse a kit file from disk.
    pub fn load_kit_file(&self, path: &Path) -> Option<KitConfig> {
        let name_hint = path.file_stem().and_then(|s| s.to_str()).unwrap_or("kit");
        match std::fs::read_to_string(path) {
            Ok(data) => KitConfig::from_json(name_hint, &data),
            Err(e) => {
                error!("Error reading kit from {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Load a kit and merge its servers into the configuration.
    ///
    /// Pre-existing servers gain this kit as an owner; new servers are
    /// inserted owned solely by it. Returns `(success, message)`.
    pub fn load(&mut self, kit_name: &str, config: &mut MaggConfig) -> (bool, String) {
        if config.kits.contains_key(kit_name) {
            return (false, format!("Kit '{}' is already loaded", kit_name));
        }

        let available = self.discover();
        let Some(kit_path) = available.get(kit_name).cloned() else {
            return (
                false,
                format!("Kit '{}' not found in any kit.d directory", kit_name),
            );
        };

        let Some(kit) = self.load_kit_file(&kit_path) else {
            return (
                false,
                format!("Failed to load kit '{}' from {}", kit_name, kit_path.display()),
            );
        };

        let mut servers_added = Vec::new();
        let mut servers_updated = Vec::new();

        for (server_name, server) in &kit.servers {
            match config.servers.get_mut(server_name) {
                Some(existing) => {
                    if !existing.kits.iter().any(|k| k == kit_name) {
                        existing.kits.push(kit_name.to_string());
                        servers_updated.push(server_name.clone());
                    }
                }
                None => {
                    let mut server = server.clone();
                    server.kits = vec![kit_name.to_string()];
                    config.servers.insert(server_name.clone(), server);
                    servers_added.push(server_name.clone());
                }
            }
        }

        config.kits.insert(
            kit_name.to_string(),
            KitInfo {
                name: kit_name.to_string(),
                description: (!kit.description.is_empty()).then(|| kit.description.clone()),
                path: Some(kit_path),
                source: KitSource::File,
            },
        );
        self.kits.insert(kit_name.to_string(), kit);

        let mut msg = vec![format!("Kit '{}' loaded successfully", kit_name)];
        if !servers_added.is_empty() {
            msg.push(format!("Added servers: {}", servers_added.join(", ")));
        }
        if !servers_updated.is_empty() {
            msg.push(format!("Updated servers: {}", servers_updated.join(", ")));
        }
        (true, msg.join(". "))
    }

    /// Unload a kit. Servers solely owned by it are removed; servers shared
    /// with other kits just lose this owner. Returns `(success, message)`.
    pub fn unload(&mut self, kit_name: &str, config: &mut MaggConfig) -> (bool, String) {
        if !config.kits.contains_key(kit_name) {
            return (false, format!("Kit '{}' is not loaded", kit_name));
        }

        let mut servers_removed = Vec::new();
        let mut servers_updated = Vec::new();

        for (server_name, server) in &config.servers {
            if server.kits.iter().any(|k| k == kit_name) {
                if server.kits.len() == 1 {
                    servers_removed.push(server_name.clone());
                } else {
                    servers_updated.push(server_name.clone());
                }
            }
        }

        for name in &servers_updated {
            if let Some(server) = config.servers.get_mut(name) {
                server.kits.retain(|k| k != kit_name);
            }
        }
        for name in &servers_removed {
            config.servers.remove(name);
        }

        config.kits.remove(kit_name);
        self.kits.remove(kit_name);

        let mut msg = vec![format!("Kit '{}' unloaded successfully", kit_name)];
        if !servers_removed.is_empty() {
            msg.push(format!("Removed servers: {}", servers_removed.join(", ")));
        }
        if !servers_updated.is_empty() {
            msg.push(format!("Updated servers: {}", servers_updated.join(", ")));
        }
        (true, msg.join(". "))
    }

    /// Reconcile persisted kit entries with kits discovered on disk.
    ///
    /// Entries persisted in the config but absent from every kit.d directory
    /// become inline placeholders - they are never silently dropped.
    pub fn load_kits_from_config(&mut self, config: &mut MaggConfig) {
        let available = self.discover();
        let names: Vec<String> = config.kits.keys().cloned().collect();

        for kit_name in names {
            if let Some(kit_path) = available.get(&kit_name) {
                if let Some(kit) = self.load_kit_file(kit_path) {
                    info!("Loaded kit '{}' from {}", kit_name, kit_path.display());
                    if let Some(entry) = config.kits.get_mut(&kit_name) {
                        entry.path = Some(kit_path.clone());
                        entry.source = KitSource::File;
                        if entry.description.is_none() && !kit.description.is_empty() {
                            entry.description = Some(kit.description.clone());
                        }
                    }
                    self.kits.insert(kit_name, kit);
                } else {
                    error!("Failed to load kit '{}' from {}", kit_name, kit_path.display());
                }
            } else {
                info!("Kit '{}' not found in any kit.d directory - creating inline", kit_name);
                if let Some(entry) = config.kits.get_mut(&kit_name) {
                    entry.source = KitSource::Inline;
                    entry.path = None;
                }
                self.kits.insert(
                    kit_name.clone(),
                    KitConfig {
                        name: kit_name,
                        ..Default::default()
                    },
                );
            }
        }
    }

    /// List every kit - loaded or discoverable - with its status.
    pub fn list_all(&self) -> BTreeMap<String, KitSummary> {
        let available = self.discover();
        let mut result = BTreeMap::new();

        for (name, kit) in &self.kits {
            result.insert(
                name.clone(),
                KitSummary {
                    loaded: true,
                    path: available.get(name).cloned(),
                    description: kit.description.clone(),
                    author: kit.author.clone(),
                    version: kit.version.clone(),
                    keywords: kit.keywords.clone(),
                    servers: kit.servers.keys().cloned().collect(),
                },
            );
        }

        for (name, path) in available {
            if result.contains_key(&name) {
                continue;
            }
            let summary = match self.load_kit_file(&path) {
                Some(kit) => KitSummary {
                    loaded: false,
                    path: Some(path),
                    description: kit.description,
                    author: kit.author,
                    version: kit.version,
                    keywords: kit.keywords,
                    servers: kit.servers.keys().cloned().collect(),
                },
                None => KitSummary {
                    loaded: false,
                    path: Some(path),
                    description: "Failed to load kit metadata".to_string(),
                    author: None,
                    version: None,
                    keywords: Vec::new(),
                    servers: Vec::new(),
                },
            };
            result.insert(name, summary);
        }

        result
    }

    /// Detailed information about one kit, loaded or on disk.
    pub fn details(&self, kit_name: &str) -> Option<(bool, KitConfig)> {
        if let Some(kit) = self.kits.get(kit_name) {
            return Some((true, kit.clone()));
        }

        let available = self.discover();
        let path = available.get(kit_name)?;
        self.load_kit_file(path).map(|kit| (false, kit))
    }
}
