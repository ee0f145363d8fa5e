//! Message routing between backends and clients
//!
//! Backends emit notifications (list changes, progress, log lines); zero or
//! more connected clients subscribe to magg's notifications. The router
//! decouples the two: subscribers register globally or per backend, and
//! delivery snapshots the subscriber set under the guard, releases it, then
//! fans out in parallel with per-handler error isolation.

use async_trait::async_trait;
use magg_client::client::NotificationHandler;
use magg_client::types::{
    McpRequest, NOTIFICATION_MESSAGE, NOTIFICATION_PROGRESS, NOTIFICATION_PROMPTS_CHANGED,
    NOTIFICATION_RESOURCES_CHANGED, NOTIFICATION_TOOLS_CHANGED,
};
use magg_core::error::Result;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

/// A backend notification wrapped with its origin.
#[derive(Debug, Clone, Serialize)]
pub struct ServerNotification {
    /// Name of the backend that emitted the notification, when known.
    pub server: Option<String>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl ServerNotification {
    /// The JSON-RPC notification frame to forward to clients.
    pub fn to_wire(&self) -> McpRequest {
        let mut request = McpRequest::new(&self.method);
        if let Some(params) = &self.params {
            request = request.with_params(params.clone());
        }
        request
    }
}

/// Subscriber to routed notifications.
///
/// Errors are logged by the router, never propagated - one handler's
/// failure does not affect the others.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, notification: &ServerNotification) -> Result<()>;
}

#[derive(Default)]
struct Subscribers {
    per_server: HashMap<String, Vec<Arc<dyn MessageHandler>>>,
    global: Vec<Arc<dyn MessageHandler>>,
}

/// Routes messages between backend servers and subscribed clients.
#[derive(Default)]
pub struct MessageRouter {
    subscribers: Mutex<Subscribers>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one server's notifications, or globally when
    /// `server_id` is `None`.
    pub fn register(&self, handler: Arc<dyn MessageHandler>, server_id: Option<&str>) {
        let mut subscribers = self.subscribers.lock().unwrap();
        match server_id {
            None => subscribers.global.push(handler),
            Some(server_id) => subscribers
                .per_server
                .entry(server_id.to_string())
                .or_default()
                .push(handler),
        }
    }

    /// Unregister a handler. Missing registrations are ignored.
    pub fn unregister(&self, handler: &Arc<dyn MessageHandler>, server_id: Option<&str>) {
        let mut subscribers = self.subscribers.lock().unwrap();
        match server_id {
            None => {
                subscribers.global.retain(|h| !Arc::ptr_eq(h, handler));
            }
            Some(server_id) => {
                if let Some(handlers) = subscribers.per_server.get_mut(server_id) {
                    handlers.retain(|h| !Arc::ptr_eq(h, handler));
                    if handlers.is_empty() {
                        subscribers.per_server.remove(server_id);
                    }
                }
            }
        }
    }

    /// Deliver a notification to the global subscribers plus the ones
    /// registered for the originating server.
    pub async fn route(&self, notification: &ServerNotification, server_id: Option<&str>) {
        let targets: Vec<Arc<dyn MessageHandler>> = {
            let subscribers = self.subscribers.lock().unwrap();
            let mut targets = subscribers.global.clone();
            if let Some(server_id) = server_id {
                if let Some(handlers) = subscribers.per_server.get(server_id) {
                    targets.extend(handlers.iter().cloned());
                }
            }
            targets
        };

        if targets.is_empty() {
            return;
        }

        let deliveries = targets.iter().map(|handler| {
            let handler = handler.clone();
            async move {
                if let Err(e) = handler.handle(notification).await {
                    error!(method = %notification.method, error = %e, "Notification handler failed");
                }
            }
        });

        futures::future::join_all(deliveries).await;
    }
}

/// Classifies backend notifications and wraps them for routing.
///
/// Keeps a best-effort record of which servers have reported changes, for
/// debugging only - never a correctness dependency.
pub struct ServerMessageCoordinator {
    router: Arc<MessageRouter>,
    changes_seen: Mutex<BTreeMap<String, BTreeSet<String>>>,
}

impl ServerMessageCoordinator {
    pub fn new(router: Arc<MessageRouter>) -> Self {
        Self {
            router,
            changes_seen: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Handle one backend notification: record list changes, wrap, route.
    pub async fn dispatch(&self, method: &str, params: Option<Value>, server_id: &str) {
        match method {
            NOTIFICATION_TOOLS_CHANGED => self.record_change("tool_changes", server_id),
            NOTIFICATION_RESOURCES_CHANGED => self.record_change("resource_changes", server_id),
            NOTIFICATION_PROMPTS_CHANGED => self.record_change("prompt_changes", server_id),
            NOTIFICATION_PROGRESS | NOTIFICATION_MESSAGE => {}
            other => {
                debug!(method = %other, server = %server_id, "Forwarding unclassified notification");
            }
        }

        let notification = ServerNotification {
            server: Some(server_id.to_string()),
            method: method.to_string(),
            params,
        };
        self.router.route(&notification, Some(server_id)).await;
    }

    fn record_change(&self, kind: &str, server_id: &str) {
        self.changes_seen
            .lock()
            .unwrap()
            .entry(kind.to_string())
            .or_default()
            .insert(server_id.to_string());
    }

    /// Current change-tracking state, for debugging.
    pub fn notification_state(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.changes_seen.lock().unwrap().clone()
    }
}

/// Per-backend notification handler installed on each mounted client
/// session. Forwards into the coordinator tagged with the backend name.
pub struct BackendMessageHandler {
    server_id: String,
    coordinator: Arc<ServerMessageCoordinator>,
}

impl BackendMessageHandler {
    pub fn new(server_id: impl Into<String>, coordinator: Arc<ServerMessageCoordinator>) -> Self {
        Self {
            server_id: server_id.into(),
            coordinator,
        }
    }
}

#[async_trait]
impl NotificationHandler for BackendMessageHandler {
    async fn on_notification(&self, method: &str, params: Option<&Value>) {
        self.coordinator
            .dispatch(method, params.cloned(), &self.server_id)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use magg_core::error::Error;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        count: AtomicUsize,
        fail: bool,
    }

    impl CountingHandler {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                count: AtomicUsize::new(0),
                fail,
            })
        }

        fn count(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, _notification: &ServerNotification) -> Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::fatal("handler exploded"))
            } else {
                Ok(())
            }
        }
    }

    fn notification(method: &str) -> ServerNotification {
        ServerNotification {
            server: Some("calc".into()),
            method: method.into(),
            params: None,
        }
    }

    #[tokio::test]
    async fn test_global_and_per_server_delivery() {
        let router = MessageRouter::new();
        let global = CountingHandler::new(false);
        let for_calc = CountingHandler::new(false);
        let for_other = CountingHandler::new(false);

        router.register(global.clone(), None);
        router.register(for_calc.clone(), Some("calc"));
        router.register(for_other.clone(), Some("other"));

        router
            .route(&notification(NOTIFICATION_TOOLS_CHANGED), Some("calc"))
            .await;

        assert_eq!(global.count(), 1);
        assert_eq!(for_calc.count(), 1);
        assert_eq!(for_other.count(), 0);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let router = MessageRouter::new();
        let failing = CountingHandler::new(true);
        let healthy = CountingHandler::new(false);

        router.register(failing.clone(), None);
        router.register(healthy.clone(), None);

        router.route(&notification(NOTIFICATION_PROGRESS), None).await;

        assert_eq!(failing.count(), 1);
        assert_eq!(healthy.count(), 1);
    }

    #[tokio::test]
    async fn test_unregister_stops_delivery() {
        let router = MessageRouter::new();
        let handler = CountingHandler::new(false);
        let as_dyn: Arc<dyn MessageHandler> = handler.clone();

        router.register(handler.clone(), Some("calc"));
        router.unregister(&as_dyn, Some("calc"));

        router
            .route(&notification(NOTIFICATION_PROGRESS), Some("calc"))
            .await;
        assert_eq!(handler.count(), 0);
    }

    #[tokio::test]
    async fn test_coordinator_records_list_changes() {
        let router = Arc::new(MessageRouter::new());
        let coordinator = ServerMessageCoordinator::new(router);

        coordinator
            .dispatch(NOTIFICATION_TOOLS_CHANGED, None, "calc")
            .await;
        coordinator
            .dispatch(NOTIFICATION_PROGRESS, Some(json!({"progress": 1})), "calc")
            .await;

        let state = coordinator.notification_state();
        assert!(state["tool_changes"].contains("calc"));
        assert!(!state.contains_key("progress"));
    }

    #[tokio::test]
    async fn test_backend_handler_forwards_with_origin() {
        struct Capture {
            seen: Mutex<Vec<ServerNotification>>,
        }

        #[async_trait]
        impl MessageHandler for Capture {
            async fn handle(&self, notification: &ServerNotification) -> Result<()> {
                self.seen.lock().unwrap().push(notification.clone());
                Ok(())
            }
        }

        let router = Arc::new(MessageRouter::new());
        let capture = Arc::new(Capture {
            seen: Mutex::new(Vec::new()),
        });
        router.register(capture.clone(), None);

        let coordinator = Arc::new(ServerMessageCoordinator::new(router));
        let backend = BackendMessageHandler::new("calc", coordinator);
        backend
            .on_notification(NOTIFICATION_TOOLS_CHANGED, None)
            .await;

        let seen = capture.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].server.as_deref(), Some("calc"));
        assert_eq!(seen[0].method, NOTIFICATION_TOOLS_CHANGED);
    }
}
