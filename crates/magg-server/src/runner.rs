//! Server lifecycle with signal handling
//!
//! SIGINT/SIGTERM shut magg down gracefully (cancel outstanding backend
//! operations, unmount all, close). SIGHUP triggers a config reload where
//! the platform supports it.

use crate::server::MaggServer;
use crate::transport::{self, BearerValidator};
use magg_core::error::Result;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info};

/// How a serve run ended. Maps onto process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Transport finished on its own (e.g. stdin closed). Exit 0.
    Completed,
    /// SIGINT. Exit 130.
    Interrupted,
    /// SIGTERM. Exit 0.
    Terminated,
}

impl ExitReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitReason::Interrupted => 130,
            _ => 0,
        }
    }
}

/// Manages magg server lifecycle and signals.
pub struct MaggRunner {
    server: Arc<MaggServer>,
}

impl MaggRunner {
    pub fn new(server: Arc<MaggServer>) -> Self {
        Self { server }
    }

    pub fn server(&self) -> &Arc<MaggServer> {
        &self.server
    }

    /// Run the server over stdio until EOF or a shutdown signal.
    pub async fn run_stdio(&self) -> Result<ExitReason> {
        let server = self.server.clone();
        let router = server.router().clone();
        self.serve(transport::serve_stdio(server, router)).await
    }

    /// Run the server over HTTP until a shutdown signal.
    pub async fn run_http(
        &self,
        host: &str,
        port: u16,
        validator: Option<BearerValidator>,
    ) -> Result<ExitReason> {
        let server = self.server.clone();
        let router = server.router().clone();
        self.serve(transport::serve_http(server, router, host, port, validator))
            .await
    }

    async fn serve(&self, serve_future: impl Future<Output = Result<()>>) -> Result<ExitReason> {
        self.server.setup().await?;
        self.spawn_sighup_task();

        let reason = tokio::select! {
            result = serve_future => {
                result?;
                ExitReason::Completed
            }
            _ = sigint() => {
                info!("Received SIGINT, shutting down gracefully...");
                ExitReason::Interrupted
            }
            _ = sigterm() => {
                info!("Received SIGTERM, shutting down gracefully...");
                ExitReason::Terminated
            }
        };

        self.server.shutdown().await;
        Ok(reason)
    }

    /// SIGHUP is equivalent to the `reload_config` tool.
    fn spawn_sighup_task(&self) {
        #[cfg(unix)]
        {
            let server = self.server.clone();
            tokio::spawn(async move {
                let mut hups = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::hangup(),
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!("Cannot install SIGHUP handler: {}", e);
                        return;
                    }
                };
                while hups.recv().await.is_some() {
                    info!("Received SIGHUP, reloading configuration");
                    if let Err(e) = server.reload().await {
                        error!("SIGHUP reload failed: {}", e);
                    }
                }
            });
        }
    }
}

async fn sigint() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler available; park forever so the serve future wins.
        std::future::pending::<()>().await;
    }
}

async fn sigterm() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitReason::Completed.exit_code(), 0);
        assert_eq!(ExitReason::Terminated.exit_code(), 0);
        assert_eq!(ExitReason::Interrupted.exit_code(), 130);
    }
}
