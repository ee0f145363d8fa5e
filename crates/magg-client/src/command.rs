//! Launch-spec to argv mapping
//!
//! Known commands get runner-specific handling; everything else spawns as
//! given. No path existence validation happens here - a bad script surfaces
//! when the child exits, which keeps module invocations (`python -m pkg`)
//! working without a filesystem path.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A resolved command line ready to spawn.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment entries implied by transport options.
    pub env: BTreeMap<String, String>,
}

fn opt_str(transport: Option<&Map<String, Value>>, key: &str) -> Option<String> {
    transport?.get(key)?.as_str().map(String::from)
}

fn opt_bool(transport: Option<&Map<String, Value>>, key: &str) -> Option<bool> {
    transport?.get(key)?.as_bool()
}

fn opt_str_list(transport: Option<&Map<String, Value>>, key: &str) -> Vec<String> {
    transport
        .and_then(|t| t.get(key))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Whether the child process should stay alive between requests.
pub fn keep_alive(transport: Option<&Map<String, Value>>) -> bool {
    opt_bool(transport, "keep_alive").unwrap_or(true)
}

/// Build the argv for a configured command, applying transport options.
pub fn build_command(
    command: &str,
    args: &[String],
    transport: Option<&Map<String, Value>>,
) -> CommandSpec {
    let mut env = BTreeMap::new();

    match command {
        "python" => CommandSpec {
            program: opt_str(transport, "python_cmd").unwrap_or_else(|| "python".to_string()),
            args: args.to_vec(),
            env,
        },
        "node" => CommandSpec {
            program: opt_str(transport, "node_cmd").unwrap_or_else(|| "node".to_string()),
            args: args.to_vec(),
            env,
        },
        "npx" => {
            let mut full_args = vec!["--yes".to_string()];
            full_args.extend(args.iter().cloned());
            if opt_bool(transport, "use_package_lock") == Some(false) {
                env.insert("npm_config_package_lock".to_string(), "false".to_string());
            }
            CommandSpec {
                program: "npx".to_string(),
                args: full_args,
                env,
            }
        }
        "uvx" => {
            let mut full_args = Vec::new();
            if let Some(version) = opt_str(transport, "python_version") {
                full_args.push("--python".to_string());
                full_args.push(version);
            }
            for package in opt_str_list(transport, "with_packages") {
                full_args.push("--with".to_string());
                full_args.push(package);
            }
            if let Some(package) = opt_str(transport, "from_package") {
                full_args.push("--from".to_string());
                full_args.push(package);
            }
            full_args.extend(args.iter().cloned());
            CommandSpec {
                program: "uvx".to_string(),
                args: full_args,
                env,
            }
        }
        other => CommandSpec {
            program: other.to_string(),
            args: args.to_vec(),
            env,
        },
    }
}

/// Split a full command line into command + args, shell-style.
///
/// Handles single and double quotes and backslash escapes, enough for the
/// command lines `add_server` accepts.
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;
    let mut has_token = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                has_token = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                has_token = true;
            }
            '\\' if !in_single => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    has_token = true;
                }
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if has_token {
                    parts.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }

    if has_token {
        parts.push(current);
    }

    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transport(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_python_default() {
        let spec = build_command("python", &["server.py".into()], None);
        assert_eq!(spec.program, "python");
        assert_eq!(spec.args, vec!["server.py"]);
    }

    #[test]
    fn test_python_cmd_override() {
        let t = transport(json!({"python_cmd": "/usr/bin/python3"}));
        let spec = build_command("python", &["-m".into(), "pkg".into()], Some(&t));
        assert_eq!(spec.program, "/usr/bin/python3");
        assert_eq!(spec.args, vec!["-m", "pkg"]);
    }

    #[test]
    fn test_node_cmd_override() {
        let t = transport(json!({"node_cmd": "/opt/node/bin/node"}));
        let spec = build_command("node", &["index.js".into()], Some(&t));
        assert_eq!(spec.program, "/opt/node/bin/node");
    }

    #[test]
    fn test_npx_package_runner() {
        let spec = build_command("npx", &["@playwright/mcp@latest".into()], None);
        assert_eq!(spec.program, "npx");
        assert_eq!(spec.args, vec!["--yes", "@playwright/mcp@latest"]);
        assert!(spec.env.is_empty());
    }

    #[test]
    fn test_npx_without_package_lock() {
        let t = transport(json!({"use_package_lock": false}));
        let spec = build_command("npx", &["pkg".into()], Some(&t));
        assert_eq!(spec.env["npm_config_package_lock"], "false");
    }

    #[test]
    fn test_uvx_tool_runner() {
        let t = transport(json!({
            "python_version": "3.12",
            "with_packages": ["requests", "pandas"],
            "from_package": "mcp-extras",
        }));
        let spec = build_command("uvx", &["mytool".into(), "--flag".into()], Some(&t));
        assert_eq!(spec.program, "uvx");
        assert_eq!(
            spec.args,
            vec![
                "--python", "3.12", "--with", "requests", "--with", "pandas", "--from",
                "mcp-extras", "mytool", "--flag"
            ]
        );
    }

    #[test]
    fn test_generic_command_passthrough() {
        let spec = build_command("./my-server", &["--port".into(), "0".into()], None);
        assert_eq!(spec.program, "./my-server");
        assert_eq!(spec.args, vec!["--port", "0"]);
    }

    #[test]
    fn test_unknown_transport_options_tolerated() {
        let t = transport(json!({"future_option": {"nested": true}}));
        let spec = build_command("python", &["server.py".into()], Some(&t));
        assert_eq!(spec.program, "python");
    }

    #[test]
    fn test_keep_alive_default() {
        assert!(keep_alive(None));
        let t = transport(json!({"keep_alive": false}));
        assert!(!keep_alive(Some(&t)));
    }

    #[test]
    fn test_split_command_line() {
        assert_eq!(split_command_line("python server.py"), vec!["python", "server.py"]);
        assert_eq!(
            split_command_line(r#"npx "@scope/pkg name" --flag"#),
            vec!["npx", "@scope/pkg name", "--flag"]
        );
        assert_eq!(
            split_command_line(r#"python -c 'print("hi")'"#),
            vec!["python", "-c", r#"print("hi")"#]
        );
        assert_eq!(split_command_line("  single  "), vec!["single"]);
        assert!(split_command_line("").is_empty());
    }
}
