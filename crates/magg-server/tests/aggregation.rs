//! End-to-end tests against the full server through the loopback client.
//!
//! Backends are scripted in-memory MCP servers injected via the transport
//! factory, so the whole dispatch path - mount table, prefixing, proxy tool,
//! router - is exercised exactly as a live deployment would.

use magg_client::client::McpService;
use magg_client::proxy::ProxyClient;
use magg_client::test_utils::{NotificationInjector, ScriptedServer, ScriptedTransport};
use magg_client::types::NOTIFICATION_TOOLS_CHANGED;
use magg_server::manager::TransportFactory;
use magg_server::messaging::{MessageHandler, ServerNotification};
use magg_server::proxy::LoopbackClient;
use magg_server::MaggServer;
use magg_core::error::Result;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Transport factory that hands every server a scripted calculator
/// backend. Servers whose notes say "hang" get one that stops answering
/// after the handshake. Injectors are captured for notification tests.
fn scripted_factory(
    injectors: Arc<Mutex<HashMap<String, NotificationInjector>>>,
) -> TransportFactory {
    Arc::new(move |config, _spec| {
        let scripted = if config.notes.as_deref() == Some("hang") {
            ScriptedServer::calculator(&config.name).hanging()
        } else {
            ScriptedServer::calculator(&config.name)
                .with_resource("data://facts/pi", "3.14159")
                .with_prompt("greeting")
        };
        let transport = ScriptedTransport::new(scripted);
        injectors
            .lock()
            .unwrap()
            .insert(config.name.clone(), transport.injector());
        Ok(Box::new(transport))
    })
}

struct Harness {
    _dir: TempDir,
    config_path: PathBuf,
    server: Arc<MaggServer>,
    injectors: Arc<Mutex<HashMap<String, NotificationInjector>>>,
}

impl Harness {
    fn new(initial_config: Option<&str>) -> Self {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.json");
        if let Some(contents) = initial_config {
            std::fs::write(&config_path, contents).unwrap();
        }

        let injectors = Arc::new(Mutex::new(HashMap::new()));
        let server = MaggServer::with_transport_factory(
            Some(config_path.clone()),
            Some(scripted_factory(injectors.clone())),
        );

        Self {
            _dir: dir,
            config_path,
            server,
            injectors,
        }
    }

    fn loopback(&self) -> LoopbackClient {
        LoopbackClient::new(self.server.clone())
    }

    fn kitd_dir(&self) -> PathBuf {
        let dir = self.config_path.parent().unwrap().join("kit.d");
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}

/// Unpack a management tool's JSON response from its text content.
async fn call_management(loopback: &LoopbackClient, tool: &str, args: Value) -> Value {
    let result = loopback
        .call_tool(&format!("magg_{}", tool), Some(args))
        .await
        .unwrap();
    serde_json::from_str(&result.text()).unwrap()
}

fn calc_config() -> String {
    json!({
        "servers": {
            "calc": {
                "source": "file:///tmp/calc",
                "prefix": "calc",
                "command": "python",
                "args": ["server.py"],
            }
        }
    })
    .to_string()
}

#[tokio::test]
async fn test_add_server_then_list() {
    let harness = Harness::new(None);
    let loopback = harness.loopback();

    let response = call_management(
        &loopback,
        "add_server",
        json!({
            "name": "calc",
            "source": "file:///tmp/calc",
            "prefix": "calc",
            "command": "python server.py",
            "enable": false,
        }),
    )
    .await;

    assert!(response["errors"].is_null(), "unexpected: {}", response);
    assert_eq!(response["output"]["server"]["name"], "calc");
    assert!(response["output"]["server"]["mounted"].is_null());

    let listed = call_management(&loopback, "list_servers", json!({})).await;
    let servers = listed["output"].as_array().unwrap();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0]["enabled"], false);
    assert_eq!(servers[0]["mounted"], false);

    // The add persisted to disk.
    let saved: Value =
        serde_json::from_str(&std::fs::read_to_string(&harness.config_path).unwrap()).unwrap();
    assert!(saved["servers"]["calc"]["enabled"] == false);
}

#[tokio::test]
async fn test_duplicate_add_rejected() {
    let harness = Harness::new(None);
    let loopback = harness.loopback();

    let args = json!({
        "name": "calc",
        "source": "file:///tmp/calc",
        "command": "python server.py",
        "enable": false,
    });
    let first = call_management(&loopback, "add_server", args.clone()).await;
    assert!(first["errors"].is_null());

    let second = call_management(&loopback, "add_server", args).await;
    assert!(second["errors"][0]
        .as_str()
        .unwrap()
        .contains("already exists"));
}

#[tokio::test]
async fn test_mount_and_proxy_list() {
    let harness = Harness::new(Some(&calc_config()));
    harness.server.setup().await.unwrap();
    let loopback = harness.loopback();

    // The raw proxy call returns one embedded resource.
    let raw = loopback
        .call_tool("proxy", Some(json!({"action": "list", "type": "tool"})))
        .await
        .unwrap();
    assert_eq!(raw.content.len(), 1);

    // The transparent client decodes it into typed tools.
    let client = ProxyClient::transparent(harness.loopback());
    let tools = client.list_tools().await.unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert!(names.contains(&"calc_add"), "{:?}", names);
    assert!(names.contains(&"calc_multiply"), "{:?}", names);
    assert!(names.contains(&"proxy"), "{:?}", names);

    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_transparent_call() {
    let harness = Harness::new(Some(&calc_config()));
    harness.server.setup().await.unwrap();

    let client = ProxyClient::transparent(harness.loopback());
    let result = client
        .call_tool("calc_add", Some(json!({"a": 5, "b": 3})))
        .await
        .unwrap();
    assert_eq!(result.text(), "8");

    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_prefixed_resources_and_prompts() {
    let harness = Harness::new(Some(&calc_config()));
    harness.server.setup().await.unwrap();
    let loopback = harness.loopback();

    let resources = loopback.list_resources().await.unwrap();
    let uris: Vec<&str> = resources.iter().map(|r| r.uri.as_str()).collect();
    assert!(uris.contains(&"data://calc/facts/pi"), "{:?}", uris);
    assert!(uris.contains(&"magg://servers/all"), "{:?}", uris);

    let read = loopback.read_resource("data://calc/facts/pi").await.unwrap();
    assert_eq!(read.contents[0].text.as_deref(), Some("3.14159"));

    let prompts = loopback.list_prompts().await.unwrap();
    assert!(prompts.iter().any(|p| p.name == "calc_greeting"));
    let prompt = loopback.get_prompt("calc_greeting", None).await.unwrap();
    assert_eq!(prompt.messages.len(), 1);

    // The same resource through the transparent client's proxy path.
    let client = ProxyClient::transparent(harness.loopback());
    let via_proxy = client.read_resource("data://calc/facts/pi").await.unwrap();
    assert_eq!(via_proxy.contents[0].text.as_deref(), Some("3.14159"));

    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_self_resource_read() {
    let harness = Harness::new(Some(&calc_config()));
    harness.server.setup().await.unwrap();
    let loopback = harness.loopback();

    let all = loopback.read_resource("magg://servers/all").await.unwrap();
    let payload: Value = serde_json::from_str(all.contents[0].text.as_deref().unwrap()).unwrap();
    assert!(payload.get("calc").is_some());

    let one = loopback.read_resource("magg://server/calc").await.unwrap();
    let payload: Value = serde_json::from_str(one.contents[0].text.as_deref().unwrap()).unwrap();
    assert_eq!(payload["prefix"], "calc");

    harness.server.shutdown().await;
}

fn write_kit(kitd: &Path, name: &str, server_name: &str) {
    let kit = json!({
        "name": name,
        "description": "test kit",
        "servers": {
            server_name: {
                "source": format!("file:///tmp/{server_name}"),
                "command": "python",
                "args": ["server.py"],
            }
        }
    });
    std::fs::write(kitd.join(format!("{}.json", name)), kit.to_string()).unwrap();
}

#[tokio::test]
async fn test_kit_load_unload() {
    let harness = Harness::new(Some(r#"{"servers": {}}"#));
    write_kit(&harness.kitd_dir(), "web", "webscraper");
    harness.server.setup().await.unwrap();
    let loopback = harness.loopback();

    let loaded = call_management(&loopback, "load_kit", json!({"name": "web"})).await;
    assert_eq!(loaded["output"]["action"], "kit_loaded", "{}", loaded);

    let listed = call_management(&loopback, "list_servers", json!({})).await;
    let servers = listed["output"].as_array().unwrap();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0]["name"], "webscraper");
    assert_eq!(servers[0]["kits"], json!(["web"]));
    assert_eq!(servers[0]["mounted"], true);

    let unloaded = call_management(&loopback, "unload_kit", json!({"name": "web"})).await;
    assert_eq!(unloaded["output"]["action"], "kit_unloaded");

    let listed = call_management(&loopback, "list_servers", json!({})).await;
    assert!(listed["output"].as_array().unwrap().is_empty());

    let saved: Value =
        serde_json::from_str(&std::fs::read_to_string(&harness.config_path).unwrap()).unwrap();
    assert!(saved.get("kits").map_or(true, |k| k.as_object().unwrap().is_empty()));

    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_kit_info_and_list() {
    let harness = Harness::new(Some(r#"{"servers": {}}"#));
    write_kit(&harness.kitd_dir(), "web", "webscraper");
    harness.server.setup().await.unwrap();
    let loopback = harness.loopback();

    let kits = call_management(&loopback, "list_kits", json!({})).await;
    assert_eq!(kits["output"]["web"]["loaded"], false);
    assert_eq!(kits["output"]["web"]["servers"], json!(["webscraper"]));

    let info = call_management(&loopback, "kit_info", json!({"name": "web"})).await;
    assert_eq!(info["output"]["name"], "web");
    assert!(info["output"]["servers"]["webscraper"].is_object());

    let missing = call_management(&loopback, "kit_info", json!({"name": "ghost"})).await;
    assert!(missing["errors"][0].as_str().unwrap().contains("not found"));

    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_hot_reload_mounts_added_server() {
    let initial = json!({
        "servers": {},
        "reload_poll_interval": 0.1,
    });
    let harness = Harness::new(Some(&initial.to_string()));
    harness.server.setup().await.unwrap();

    // Subscribe to the router before the new backend appears.
    struct Capture {
        seen: Mutex<Vec<ServerNotification>>,
    }

    #[async_trait::async_trait]
    impl MessageHandler for Capture {
        async fn handle(&self, notification: &ServerNotification) -> Result<()> {
            self.seen.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    let capture = Arc::new(Capture {
        seen: Mutex::new(Vec::new()),
    });
    harness.server.router().register(capture.clone(), None);

    // External edit: a new enabled server appears in the file.
    let updated = json!({
        "servers": {
            "extra": {
                "source": "file:///tmp/extra",
                "command": "python",
                "args": ["server.py"],
            }
        },
        "reload_poll_interval": 0.1,
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    std::fs::write(&harness.config_path, updated.to_string()).unwrap();

    let mut mounted = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if harness.server.server_manager().is_mounted("extra").await {
            mounted = true;
            break;
        }
    }
    assert!(mounted, "reload never mounted the added server");

    // The new backend's notifications now reach subscribers.
    let injector = harness
        .injectors
        .lock()
        .unwrap()
        .get("extra")
        .cloned()
        .unwrap();
    injector.notify(NOTIFICATION_TOOLS_CHANGED, None);

    let mut forwarded = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = capture.seen.lock().unwrap();
        if seen
            .iter()
            .any(|n| n.server.as_deref() == Some("extra") && n.method == NOTIFICATION_TOOLS_CHANGED)
        {
            forwarded = true;
            break;
        }
    }
    assert!(forwarded, "notification from the new backend was not routed");

    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_health_check_disable_remediation() {
    let config = json!({
        "servers": {
            "good": {
                "source": "file:///tmp/good",
                "command": "python",
                "args": ["server.py"],
            },
            "stuck": {
                "source": "file:///tmp/stuck",
                "command": "python",
                "args": ["server.py"],
                "notes": "hang",
            }
        }
    });
    let harness = Harness::new(Some(&config.to_string()));
    harness.server.setup().await.unwrap();
    let loopback = harness.loopback();

    let response = call_management(
        &loopback,
        "check",
        json!({"action": "disable", "timeout": 0.5}),
    )
    .await;

    let output = &response["output"];
    assert_eq!(output["servers_checked"], 2);
    assert_eq!(output["healthy"], 1);
    assert_eq!(output["unresponsive"], 1);
    assert_eq!(output["results"]["good"]["status"], "healthy");
    assert_eq!(output["results"]["stuck"]["status"], "unresponsive");
    assert_eq!(output["results"]["stuck"]["action"], "disabled");

    // The remediation persisted and unmounted the stuck backend.
    assert!(!harness.server.server_manager().is_mounted("stuck").await);
    assert!(harness.server.server_manager().is_mounted("good").await);
    let saved: Value =
        serde_json::from_str(&std::fs::read_to_string(&harness.config_path).unwrap()).unwrap();
    assert_eq!(saved["servers"]["stuck"]["enabled"], false);
    assert!(saved["servers"]["good"]
        .get("enabled")
        .map_or(true, |e| e.as_bool().unwrap()));

    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_zero_timeout_marks_everything_unresponsive() {
    let harness = Harness::new(Some(&calc_config()));
    harness.server.setup().await.unwrap();
    let loopback = harness.loopback();

    let response = call_management(&loopback, "check", json!({"action": "report", "timeout": 0})).await;
    assert_eq!(response["output"]["unresponsive"], 1);
    assert_eq!(response["output"]["results"]["calc"]["status"], "unresponsive");

    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_enable_disable_cycle() {
    let harness = Harness::new(Some(&calc_config()));
    harness.server.setup().await.unwrap();
    let loopback = harness.loopback();

    let disabled = call_management(&loopback, "disable_server", json!({"name": "calc"})).await;
    assert_eq!(disabled["output"]["action"], "server_disabled");
    assert!(!harness.server.server_manager().is_mounted("calc").await);

    let again = call_management(&loopback, "disable_server", json!({"name": "calc"})).await;
    assert!(again["errors"][0].as_str().unwrap().contains("already disabled"));

    let enabled = call_management(&loopback, "enable_server", json!({"name": "calc"})).await;
    assert_eq!(enabled["output"]["mounted"], true);
    assert!(harness.server.server_manager().is_mounted("calc").await);

    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_status_reports_counts_and_prefixes() {
    let harness = Harness::new(Some(&calc_config()));
    harness.server.setup().await.unwrap();
    let loopback = harness.loopback();

    let status = call_management(&loopback, "status", json!({})).await;
    let output = &status["output"];
    assert_eq!(output["servers"]["total"], 1);
    assert_eq!(output["servers"]["mounted"], 1);
    assert_eq!(output["prefixes"]["calc"], "calc");
    // Management tools + proxy + two backend tools.
    assert!(output["tools"]["total"].as_u64().unwrap() > 15);

    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_remove_server_unmounts_and_persists() {
    let harness = Harness::new(Some(&calc_config()));
    harness.server.setup().await.unwrap();
    let loopback = harness.loopback();

    let removed = call_management(&loopback, "remove_server", json!({"name": "calc"})).await;
    assert_eq!(removed["output"]["action"], "server_removed");
    assert!(!harness.server.server_manager().is_mounted("calc").await);

    let saved: Value =
        serde_json::from_str(&std::fs::read_to_string(&harness.config_path).unwrap()).unwrap();
    assert!(saved["servers"].as_object().unwrap().is_empty());

    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_proxy_info_and_validation() {
    let harness = Harness::new(Some(&calc_config()));
    harness.server.setup().await.unwrap();
    let client = ProxyClient::new(harness.loopback());

    let info = client.proxy_info("tool", "calc_add").await.unwrap();
    match info {
        magg_client::proxy::ProxyQueryResult::Tool(tool) => assert_eq!(tool.name, "calc_add"),
        other => panic!("unexpected info result: {:?}", other),
    }

    // Parameter combinations the proxy must refuse.
    assert!(client.proxy("list", "tool", Some("x"), None).await.is_err());
    assert!(client.proxy("info", "tool", None, None).await.is_err());
    assert!(client
        .proxy("call", "gadget", Some("x"), None)
        .await
        .is_err());

    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_discovery_tools_report_unavailable() {
    let harness = Harness::new(None);
    let loopback = harness.loopback();

    let search = call_management(&loopback, "search_servers", json!({"query": "web"})).await;
    assert!(search["errors"][0]
        .as_str()
        .unwrap()
        .contains("no discovery backend"));
}
