//! Stdio child-process transport
//!
//! Spawns the configured command and exchanges newline-delimited JSON-RPC
//! over its stdin/stdout. The child's stderr is drained into logs. No path
//! validation happens before spawn; a missing script surfaces as the child
//! exiting.

use super::{LaunchSpec, Transport, TransportStreams};
use crate::command::{build_command, keep_alive};
use crate::types::McpMessage;
use async_trait::async_trait;
use magg_core::error::{Error, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

pub struct StdioTransport {
    spec: LaunchSpec,
    child: Option<Child>,
    close_tx: Option<mpsc::UnboundedSender<()>>,
}

impl StdioTransport {
    pub fn new(spec: LaunchSpec) -> Self {
        Self {
            spec,
            child: None,
            close_tx: None,
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn open(&mut self) -> Result<TransportStreams> {
        let command = self
            .spec
            .command
            .as_deref()
            .ok_or_else(|| Error::validation("stdio transport requires a command"))?;

        let resolved = build_command(command, &self.spec.args, self.spec.transport.as_ref());

        let mut cmd = Command::new(&resolved.program);
        cmd.args(&resolved.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &self.spec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.spec.env {
            cmd.env(key, value);
        }
        for (key, value) in &resolved.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::spawn(format!("failed to spawn '{}': {}", resolved.program, e))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::spawn("failed to get stdin handle"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::spawn("failed to get stdout handle"))?;
        let stderr = child.stderr.take();

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<McpMessage>();
        let (close_tx, mut close_rx) = mpsc::unbounded_channel();

        self.child = Some(child);
        self.close_tx = Some(close_tx);

        // Reader: stdout lines -> parsed messages
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    line = reader.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                let line = line.trim();
                                if line.is_empty() {
                                    continue;
                                }
                                match serde_json::from_str::<McpMessage>(line) {
                                    Ok(message) => {
                                        if incoming_tx.send(message).is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        warn!(error = %e, "Discarding unparseable line from backend");
                                    }
                                }
                            }
                            Ok(None) => {
                                debug!("Backend stdout closed");
                                break;
                            }
                            Err(e) => {
                                error!(error = %e, "Error reading backend stdout");
                                break;
                            }
                        }
                    }
                    _ = close_rx.recv() => break,
                }
            }
        });

        // Writer: outgoing messages -> stdin lines
        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        error!(error = %e, "Failed to serialize outgoing message");
                        continue;
                    }
                };
                if stdin.write_all(json.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                    || stdin.flush().await.is_err()
                {
                    break;
                }
            }
        });

        // Drain stderr into logs so the pipe never fills.
        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    debug!(target: "magg::backend", "{}", line);
                }
            });
        }

        Ok(TransportStreams {
            incoming: incoming_rx,
            outgoing: outgoing_tx,
        })
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(());
        }

        if let Some(mut child) = self.child.take() {
            let grace = if keep_alive(self.spec.transport.as_ref()) {
                Duration::from_secs(2)
            } else {
                Duration::from_millis(200)
            };

            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(status = %status, "Backend process exited");
                }
                _ => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    debug!("Backend process killed");
                }
            }
        }

        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "{} {}",
            self.spec.command.as_deref().unwrap_or("<none>"),
            self.spec.args.join(" ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{McpRequest, McpResponse};
    use serde_json::json;

    fn cat_spec() -> LaunchSpec {
        // `cat` echoes lines back, which round-trips JSON-RPC frames.
        LaunchSpec {
            command: Some("cat".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_is_spawn_error() {
        let mut transport = StdioTransport::new(LaunchSpec {
            command: Some("definitely-not-a-real-binary-42".into()),
            ..Default::default()
        });
        let err = transport.open().await.unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
    }

    #[tokio::test]
    async fn test_round_trip_through_child() {
        let mut transport = StdioTransport::new(cat_spec());
        let mut streams = transport.open().await.unwrap();

        let request = McpRequest::new("ping").with_id(json!(1));
        streams
            .outgoing
            .send(McpMessage::Request(request))
            .unwrap();

        let echoed = tokio::time::timeout(Duration::from_secs(5), streams.incoming.recv())
            .await
            .unwrap()
            .unwrap();
        match echoed {
            McpMessage::Request(r) => assert_eq!(r.method, "ping"),
            other => panic!("unexpected message: {:?}", other),
        }

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unparseable_lines_are_skipped() {
        let mut transport = StdioTransport::new(LaunchSpec {
            command: Some("sh".into()),
            args: vec![
                "-c".into(),
                r#"echo not-json; echo '{"jsonrpc":"2.0","id":1,"result":{}}'"#.into(),
            ],
            ..Default::default()
        });
        let mut streams = transport.open().await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(5), streams.incoming.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(message, McpMessage::Response(McpResponse { .. })));

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut transport = StdioTransport::new(cat_spec());
        let _streams = transport.open().await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
    }
}
