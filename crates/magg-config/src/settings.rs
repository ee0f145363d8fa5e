//! Configuration model for magg
//!
//! `MaggConfig` is the top-level runtime configuration. Scalar settings can
//! be overridden by `MAGG_*` environment variables; the dynamic part
//! (servers and kits) lives in the config file.

use magg_core::error::{Error, Result};
use magg_core::prefix;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_true() -> bool {
    true
}

fn is_true(v: &bool) -> bool {
    *v
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn default_self_prefix() -> String {
    "magg".to_string()
}

fn default_prefix_sep() -> String {
    prefix::PREFIX_SEP.to_string()
}

fn default_poll_interval() -> f64 {
    1.0
}

/// Configuration for one backend MCP server.
///
/// `name` is the map key in the config file and is injected on load; it is
/// never written back out. Unset-equals-default fields are omitted on save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub name: String,

    /// URL/URI/path of the server package, repository, or listing.
    /// Opaque to the core; only higher-level tooling dereferences it.
    pub source: String,

    /// Tool prefix for this server. Derived from `name` when empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,

    /// Setup notes for humans and LLMs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    /// Main command for spawned servers (e.g. "python", "npx", "uvx").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,

    /// URI for remote HTTP/SSE servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Transport-specific options. Unknown keys are tolerated; they belong
    /// to future transports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<Map<String, Value>>,

    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub enabled: bool,

    /// Names of the kits that own this entry; empty for user-added servers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kits: Vec<String>,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            prefix: String::new(),
            notes: None,
            command: None,
            args: None,
            uri: None,
            env: None,
            cwd: None,
            transport: None,
            enabled: true,
            kits: Vec::new(),
        }
    }

    /// The prefix this server's capabilities are mounted under.
    pub fn effective_prefix(&self) -> String {
        if self.prefix.is_empty() {
            prefix::prefix_from_name(&self.name)
        } else {
            self.prefix.clone()
        }
    }

    /// Validate the launch spec and prefix.
    pub fn validate(&self, sep: &str) -> Result<()> {
        if !self.prefix.is_empty() {
            prefix::validate_prefix(&self.prefix, sep)?;
        }

        let has_command = self.command.as_deref().map_or(false, |c| !c.is_empty());
        let has_uri = self.uri.as_deref().map_or(false, |u| !u.is_empty());

        if self.enabled {
            if !has_command && !has_uri {
                return Err(Error::validation(format!(
                    "server {:?} has neither command nor uri",
                    self.name
                )));
            }
            if has_command && has_uri {
                return Err(Error::validation(format!(
                    "server {:?} must specify exactly one of command or uri",
                    self.name
                )));
            }
        }

        if has_uri {
            let uri = self.uri.as_deref().unwrap_or_default();
            if !uri.contains("://") {
                return Err(Error::validation(format!(
                    "server {:?} uri {:?} is not a valid URL",
                    self.name, uri
                )));
            }
        }

        Ok(())
    }

    /// Full command line for display purposes.
    pub fn command_line(&self) -> Option<String> {
        self.command.as_ref().map(|cmd| {
            let mut line = cmd.clone();
            if let Some(args) = &self.args {
                if !args.is_empty() {
                    line.push(' ');
                    line.push_str(&args.join(" "));
                }
            }
            line
        })
    }
}

/// Where a loaded kit entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KitSource {
    File,
    Inline,
    Legacy,
}

/// Persisted record of a loaded kit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KitInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub source: KitSource,
}

/// Main magg configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaggConfig {
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,

    #[serde(default)]
    pub kits: BTreeMap<String, KitInfo>,

    /// Prefix for magg's own tools.
    #[serde(default = "default_self_prefix")]
    pub self_prefix: String,

    /// Separator between a prefix and a capability name.
    #[serde(default = "default_prefix_sep")]
    pub prefix_sep: String,

    #[serde(default, skip_serializing_if = "is_false")]
    pub read_only: bool,

    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub auto_reload: bool,

    /// Poll interval in seconds when file notifications are unavailable.
    #[serde(default = "default_poll_interval")]
    pub reload_poll_interval: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub quiet: bool,
}

impl Default for MaggConfig {
    fn default() -> Self {
        Self {
            config_path: default_config_path(),
            servers: BTreeMap::new(),
            kits: BTreeMap::new(),
            self_prefix: default_self_prefix(),
            prefix_sep: default_prefix_sep(),
            read_only: false,
            auto_reload: true,
            reload_poll_interval: default_poll_interval(),
            log_level: None,
            quiet: false,
        }
    }
}

impl MaggConfig {
    /// Build a config from defaults plus `MAGG_*` environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("MAGG_CONFIG_PATH") {
            if !path.is_empty() {
                config.config_path = PathBuf::from(path);
            }
        }
        if let Ok(prefix) = std::env::var("MAGG_SELF_PREFIX") {
            if !prefix.is_empty() {
                config.self_prefix = prefix;
            }
        }
        if let Ok(value) = std::env::var("MAGG_READ_ONLY") {
            config.read_only = env_flag(&value);
        }
        if let Ok(value) = std::env::var("MAGG_AUTO_RELOAD") {
            config.auto_reload = env_flag(&value);
        }
        if let Ok(level) = std::env::var("MAGG_LOG_LEVEL") {
            if !level.is_empty() {
                config.log_level = Some(level);
            }
        }
        if let Ok(value) = std::env::var("MAGG_QUIET") {
            config.quiet = env_flag(&value);
        }

        if config.quiet && config.log_level.is_none() {
            config.log_level = Some("error".to_string());
        }

        config
    }

    pub fn add_server(&mut self, server: ServerConfig) {
        self.servers.insert(server.name.clone(), server);
    }

    pub fn remove_server(&mut self, name: &str) -> bool {
        self.servers.remove(name).is_some()
    }

    pub fn enabled_servers(&self) -> impl Iterator<Item = &ServerConfig> {
        self.servers.values().filter(|s| s.enabled)
    }

    pub fn reload_poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.reload_poll_interval.max(0.1))
    }

    /// Directories searched for kit files: `<config dir>/kit.d` plus a
    /// `kit.d` under every entry of the colon-separated `MAGG_PATH`.
    pub fn kitd_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Some(parent) = self.config_path.parent() {
            paths.push(parent.join("kit.d"));
        }

        if let Ok(magg_path) = std::env::var("MAGG_PATH") {
            for entry in magg_path.split(':').filter(|p| !p.is_empty()) {
                paths.push(Path::new(entry).join("kit.d"));
            }
        }

        paths
    }
}

fn env_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn default_config_path() -> PathBuf {
    PathBuf::from(".magg").join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio_server(name: &str) -> ServerConfig {
        let mut server = ServerConfig::new(name, format!("file:///tmp/{name}"));
        server.command = Some("python".into());
        server.args = Some(vec!["server.py".into()]);
        server
    }

    #[test]
    fn test_effective_prefix_derivation() {
        let server = stdio_server("My-Calc.v2");
        assert_eq!(server.effective_prefix(), "mycalcv2");

        let mut server = stdio_server("calc");
        server.prefix = "math".into();
        assert_eq!(server.effective_prefix(), "math");
    }

    #[test]
    fn test_validate_requires_launch_spec() {
        let server = ServerConfig::new("empty", "file:///tmp/empty");
        assert!(server.validate("_").is_err());

        let mut disabled = ServerConfig::new("empty", "file:///tmp/empty");
        disabled.enabled = false;
        assert!(disabled.validate("_").is_ok());
    }

    #[test]
    fn test_validate_rejects_command_and_uri() {
        let mut server = stdio_server("both");
        server.uri = Some("http://localhost:9000/mcp".into());
        assert!(server.validate("_").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_prefix() {
        let mut server = stdio_server("calc");
        server.prefix = "has_sep".into();
        assert!(server.validate("_").is_err());
    }

    #[test]
    fn test_serialization_omits_defaults() {
        let server = stdio_server("calc");
        let json = serde_json::to_value(&server).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("name"));
        assert!(!obj.contains_key("enabled"));
        assert!(!obj.contains_key("prefix"));
        assert!(!obj.contains_key("kits"));
        assert!(obj.contains_key("command"));
    }

    #[test]
    fn test_command_line_display() {
        let server = stdio_server("calc");
        assert_eq!(server.command_line().as_deref(), Some("python server.py"));
    }

    #[test]
    fn test_env_flag_parsing() {
        assert!(env_flag("true"));
        assert!(env_flag("1"));
        assert!(env_flag("Yes"));
        assert!(!env_flag("false"));
        assert!(!env_flag("0"));
        assert!(!env_flag(""));
    }
}
