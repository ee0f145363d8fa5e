//! Diffing two configurations into an applicable change set

use crate::settings::{MaggConfig, ServerConfig};
use magg_core::error::{Error, Result};
use tracing::error;

/// What happened to a single server between two configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Add,
    Remove,
    Update,
    Enable,
    Disable,
}

impl ChangeAction {
    /// Whether applying this change tears down an existing mount first.
    pub fn unmounts(&self) -> bool {
        matches!(self, Self::Remove | Self::Disable | Self::Update)
    }

    /// Whether applying this change brings a mount up.
    pub fn mounts(&self) -> bool {
        matches!(self, Self::Add | Self::Enable | Self::Update)
    }
}

/// A change to one server configuration.
#[derive(Debug, Clone)]
pub struct ServerChange {
    pub name: String,
    pub action: ChangeAction,
    pub old_config: Option<ServerConfig>,
    pub new_config: Option<ServerConfig>,
}

/// Changes between two configurations.
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub old_config: MaggConfig,
    pub new_config: MaggConfig,
    pub server_changes: Vec<ServerChange>,
}

impl ConfigChange {
    pub fn has_changes(&self) -> bool {
        !self.server_changes.is_empty()
    }

    /// One-line summary for logs.
    pub fn summarize(&self) -> String {
        if !self.has_changes() {
            return "No changes detected".to_string();
        }

        let parts: Vec<String> = self
            .server_changes
            .iter()
            .map(|change| {
                let sigil = match change.action {
                    ChangeAction::Add => '+',
                    ChangeAction::Remove => '-',
                    ChangeAction::Update => '~',
                    ChangeAction::Enable => '>',
                    ChangeAction::Disable => '<',
                };
                format!("{}{}", sigil, change.name)
            })
            .collect();

        format!("Config changes: {}", parts.join(", "))
    }

    /// Apply this change set to a base config's server map.
    ///
    /// Replays removes before adds, matching the order the server manager
    /// uses. `apply(old, diff(old, new))` yields `new`'s servers.
    pub fn apply(&self, base: &MaggConfig) -> MaggConfig {
        let mut result = base.clone();

        for change in &self.server_changes {
            if change.action.unmounts() && !change.action.mounts() {
                if change.action == ChangeAction::Remove {
                    result.servers.remove(&change.name);
                } else if let Some(new) = &change.new_config {
                    result.servers.insert(change.name.clone(), new.clone());
                }
            }
        }

        for change in &self.server_changes {
            if change.action.mounts() || change.action == ChangeAction::Disable {
                if let Some(new) = &change.new_config {
                    result.servers.insert(change.name.clone(), new.clone());
                }
            }
        }

        result
    }
}

/// Fields whose change makes a server `update` (enabled handled separately).
fn launch_spec_changed(old: &ServerConfig, new: &ServerConfig) -> bool {
    old.source != new.source
        || old.prefix != new.prefix
        || old.command != new.command
        || old.args != new.args
        || old.uri != new.uri
        || old.env != new.env
        || old.cwd != new.cwd
        || old.transport != new.transport
}

/// Detect server changes between two configurations.
pub fn diff_configs(old_config: &MaggConfig, new_config: &MaggConfig) -> ConfigChange {
    let mut server_changes = Vec::new();

    for (name, old) in &old_config.servers {
        if !new_config.servers.contains_key(name) {
            server_changes.push(ServerChange {
                name: name.clone(),
                action: ChangeAction::Remove,
                old_config: Some(old.clone()),
                new_config: None,
            });
        }
    }

    for (name, new) in &new_config.servers {
        match old_config.servers.get(name) {
            None => {
                server_changes.push(ServerChange {
                    name: name.clone(),
                    action: ChangeAction::Add,
                    old_config: None,
                    new_config: Some(new.clone()),
                });
            }
            Some(old) => {
                if old.enabled != new.enabled {
                    let action = if new.enabled {
                        ChangeAction::Enable
                    } else {
                        ChangeAction::Disable
                    };
                    server_changes.push(ServerChange {
                        name: name.clone(),
                        action,
                        old_config: Some(old.clone()),
                        new_config: Some(new.clone()),
                    });
                } else if launch_spec_changed(old, new) {
                    server_changes.push(ServerChange {
                        name: name.clone(),
                        action: ChangeAction::Update,
                        old_config: Some(old.clone()),
                        new_config: Some(new.clone()),
                    });
                }
            }
        }
    }

    ConfigChange {
        old_config: old_config.clone(),
        new_config: new_config.clone(),
        server_changes,
    }
}

/// Validate a candidate configuration before applying a reload.
pub fn validate_config(config: &MaggConfig) -> Result<()> {
    for (name, server) in &config.servers {
        if server.enabled
            && server.command.as_deref().map_or(true, str::is_empty)
            && server.uri.as_deref().map_or(true, str::is_empty)
        {
            error!("Server '{}' has neither command nor uri", name);
            return Err(Error::reload(format!(
                "server {:?} has neither command nor uri",
                name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(name: &str, command: &str, enabled: bool) -> ServerConfig {
        let mut server = ServerConfig::new(name, format!("file:///tmp/{name}"));
        server.command = Some(command.into());
        server.enabled = enabled;
        server
    }

    fn config_with(servers: Vec<ServerConfig>) -> MaggConfig {
        let mut config = MaggConfig::default();
        for s in servers {
            config.add_server(s);
        }
        config
    }

    #[test]
    fn test_diff_empty_configs() {
        let change = diff_configs(&MaggConfig::default(), &MaggConfig::default());
        assert!(!change.has_changes());
        assert_eq!(change.summarize(), "No changes detected");
    }

    #[test]
    fn test_diff_add_remove() {
        let old = config_with(vec![server("a", "python", true)]);
        let new = config_with(vec![server("b", "python", true)]);

        let change = diff_configs(&old, &new);
        assert_eq!(change.server_changes.len(), 2);

        let actions: Vec<(&str, ChangeAction)> = change
            .server_changes
            .iter()
            .map(|c| (c.name.as_str(), c.action))
            .collect();
        assert!(actions.contains(&("a", ChangeAction::Remove)));
        assert!(actions.contains(&("b", ChangeAction::Add)));
    }

    #[test]
    fn test_diff_enable_disable() {
        let old = config_with(vec![server("a", "python", true)]);
        let new = config_with(vec![server("a", "python", false)]);

        let change = diff_configs(&old, &new);
        assert_eq!(change.server_changes.len(), 1);
        assert_eq!(change.server_changes[0].action, ChangeAction::Disable);

        let back = diff_configs(&new, &old);
        assert_eq!(back.server_changes[0].action, ChangeAction::Enable);
    }

    #[test]
    fn test_diff_update_on_launch_spec() {
        let old = config_with(vec![server("a", "python", true)]);
        let new = config_with(vec![server("a", "node", true)]);

        let change = diff_configs(&old, &new);
        assert_eq!(change.server_changes.len(), 1);
        assert_eq!(change.server_changes[0].action, ChangeAction::Update);
    }

    #[test]
    fn test_enable_change_shadows_update() {
        // When enabled flips, other field changes still classify as
        // enable/disable - the mount state transition dominates.
        let old = config_with(vec![server("a", "python", true)]);
        let new = config_with(vec![server("a", "node", false)]);

        let change = diff_configs(&old, &new);
        assert_eq!(change.server_changes.len(), 1);
        assert_eq!(change.server_changes[0].action, ChangeAction::Disable);
    }

    #[test]
    fn test_apply_reconstructs_new_config() {
        let old = config_with(vec![
            server("keep", "python", true),
            server("gone", "python", true),
            server("flip", "python", true),
        ]);
        let new = config_with(vec![
            server("keep", "python", true),
            server("flip", "python", false),
            server("fresh", "node", true),
        ]);

        let change = diff_configs(&old, &new);
        let applied = change.apply(&old);
        assert_eq!(applied.servers, new.servers);
    }

    #[test]
    fn test_validate_rejects_missing_launch_spec() {
        let mut bad = ServerConfig::new("broken", "file:///tmp/broken");
        bad.enabled = true;
        let config = config_with(vec![bad]);
        assert!(validate_config(&config).is_err());

        let ok = config_with(vec![server("fine", "python", true)]);
        assert!(validate_config(&ok).is_ok());
    }
}
