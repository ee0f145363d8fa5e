//! Round-trip properties of persistence, diffing, and kit lifecycle.

use magg_config::change::diff_configs;
use magg_config::kit::KitManager;
use magg_config::manager::ConfigManager;
use magg_config::settings::{MaggConfig, ServerConfig};
use std::path::Path;
use tempfile::TempDir;

fn stdio_server(name: &str, enabled: bool) -> ServerConfig {
    let mut server = ServerConfig::new(name, format!("file:///tmp/{name}"));
    server.command = Some("python".into());
    server.args = Some(vec!["server.py".into(), "--verbose".into()]);
    server.prefix = magg_core::prefix::prefix_from_name(name);
    server.enabled = enabled;
    server
}

fn write_kit(kitd: &Path, name: &str, servers: &[&str]) {
    std::fs::create_dir_all(kitd).unwrap();
    let entries: Vec<String> = servers
        .iter()
        .map(|s| format!(r#""{s}": {{"source": "file:///tmp/{s}", "command": "python"}}"#))
        .collect();
    let kit = format!(
        r#"{{"name": "{name}", "description": "bundle", "servers": {{{}}}}}"#,
        entries.join(",")
    );
    std::fs::write(kitd.join(format!("{name}.json")), kit).unwrap();
}

#[test]
fn save_then_load_preserves_explicit_fields() {
    let dir = TempDir::new().unwrap();
    let manager = ConfigManager::new(Some(dir.path().join("config.json")));

    let mut config = manager.load_config();
    config.add_server(stdio_server("calc", true));
    let mut remote = ServerConfig::new("web", "https://example.com/mcp");
    remote.uri = Some("https://example.com/mcp".into());
    remote.notes = Some("remote endpoint".into());
    config.add_server(remote);
    config.add_server(stdio_server("dormant", false));

    manager.save_config(&config).unwrap();
    let loaded = manager.load_config();

    assert_eq!(loaded.servers, config.servers);
}

#[test]
fn diff_apply_reconstructs_target() {
    let mut old = MaggConfig::default();
    old.add_server(stdio_server("keep", true));
    old.add_server(stdio_server("drop", true));
    old.add_server(stdio_server("flip", true));

    let mut new = MaggConfig::default();
    new.add_server(stdio_server("keep", true));
    new.add_server(stdio_server("flip", false));
    let mut changed = stdio_server("fresh", true);
    changed.args = Some(vec!["other.py".into()]);
    new.add_server(changed);

    let change = diff_configs(&old, &new);
    assert!(change.has_changes());
    assert_eq!(change.apply(&old).servers, new.servers);

    // And the empty diff is truly empty.
    assert!(!diff_configs(&new, &new).has_changes());
}

#[test]
fn kit_load_unload_returns_to_pre_load_state() {
    let dir = TempDir::new().unwrap();
    let kitd = dir.path().join("kit.d");
    write_kit(&kitd, "web", &["webscraper", "fetcher"]);

    let manager = ConfigManager::new(Some(dir.path().join("config.json")));
    let mut config = manager.load_config();
    config.add_server(stdio_server("mine", true));
    let before = config.clone();

    let mut kits = KitManager::new(vec![kitd]);
    let (ok, _) = kits.load("web", &mut config);
    assert!(ok);
    assert_eq!(config.servers.len(), 3);
    assert!(config.kits.contains_key("web"));

    let (ok, _) = kits.unload("web", &mut config);
    assert!(ok);
    assert_eq!(config.servers, before.servers);
    assert_eq!(config.kits, before.kits);
}

#[test]
fn kit_servers_persist_with_ownership() {
    let dir = TempDir::new().unwrap();
    let kitd = dir.path().join("kit.d");
    write_kit(&kitd, "web", &["webscraper"]);

    let manager = ConfigManager::new(Some(dir.path().join("config.json")));
    let mut config = manager.load_config();

    let mut kits = KitManager::new(vec![kitd.clone()]);
    assert!(kits.load("web", &mut config).0);
    manager.save_config(&config).unwrap();

    // A fresh process sees the kit-owned server and reconciles the kit.
    let mut reloaded = manager.load_config();
    assert_eq!(reloaded.servers["webscraper"].kits, vec!["web"]);

    let mut fresh_kits = KitManager::new(vec![kitd]);
    fresh_kits.load_kits_from_config(&mut reloaded);
    assert!(fresh_kits.kits().contains_key("web"));
}
