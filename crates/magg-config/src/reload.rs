//! Configuration hot reload
//!
//! Three triggers combine: file-system notifications via `notify`, a polling
//! fallback driven by `reload_poll_interval`, and explicit manual reloads
//! (the `reload_config` tool or SIGHUP). Programmatic saves set a one-shot
//! ignore flag so magg's own writes never loop back into a reload.

use crate::change::{diff_configs, validate_config, ConfigChange};
use crate::manager::ConfigManager;
use crate::settings::MaggConfig;
use async_trait::async_trait;
use magg_core::error::{Error, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Debounce window after a change signal before the file is read, so bursts
/// of writes coalesce into one reload.
const DEBOUNCE: Duration = Duration::from_millis(100);

/// Receiver of detected configuration changes.
#[async_trait]
pub trait ReloadHandler: Send + Sync {
    async fn apply(&self, change: ConfigChange) -> Result<()>;
}

/// Watcher lifecycle states. Transitions are serialized by the reloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Stopped,
    Starting,
    Watching,
    Reloading,
    Stopping,
}

/// Watches the configuration file and applies detected changes.
pub struct ConfigReloader {
    config_path: PathBuf,
    handler: Arc<dyn ReloadHandler>,
    state: Mutex<WatcherState>,
    last_mtime: Mutex<Option<SystemTime>>,
    last_config: Mutex<Option<MaggConfig>>,
    ignore_next_change: AtomicBool,
    reloading: AtomicBool,
    reload_queued: AtomicBool,
    shutdown_tx: Mutex<Option<mpsc::UnboundedSender<()>>>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl ConfigReloader {
    pub fn new(config_path: PathBuf, handler: Arc<dyn ReloadHandler>) -> Self {
        Self {
            config_path,
            handler,
            state: Mutex::new(WatcherState::Stopped),
            last_mtime: Mutex::new(None),
            last_config: Mutex::new(None),
            ignore_next_change: AtomicBool::new(false),
            reloading: AtomicBool::new(false),
            reload_queued: AtomicBool::new(false),
            shutdown_tx: Mutex::new(None),
            watch_task: Mutex::new(None),
            watcher: Mutex::new(None),
        }
    }

    pub fn state(&self) -> WatcherState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: WatcherState) {
        *self.state.lock().unwrap() = state;
    }

    /// Ignore the next file change - used when magg saves the config itself.
    pub fn ignore_next_change(&self) {
        self.ignore_next_change.store(true, Ordering::SeqCst);
        debug!("Will ignore next config file change");
    }

    /// Keep the cached config in sync after a programmatic save.
    pub fn update_cached_config(&self, config: MaggConfig) {
        *self.last_config.lock().unwrap() = Some(config);
    }

    pub fn cached_config(&self) -> Option<MaggConfig> {
        self.last_config.lock().unwrap().clone()
    }

    fn current_mtime(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.config_path)
            .and_then(|m| m.modified())
            .ok()
    }

    /// Start watching the config file for changes.
    ///
    /// File-system notifications are preferred; when the watcher cannot be
    /// started, the loop falls back to polling at `poll_interval`.
    pub async fn start_watching(self: &Arc<Self>, poll_interval: Duration) {
        {
            let task = self.watch_task.lock().unwrap();
            if task.as_ref().map_or(false, |t| !t.is_finished()) {
                warn!("Config watcher already running");
                return;
            }
        }

        self.set_state(WatcherState::Starting);

        if self.config_path.exists() {
            *self.last_mtime.lock().unwrap() = self.current_mtime();
            *self.last_config.lock().unwrap() = Some(self.load_from_disk());
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        *self.shutdown_tx.lock().unwrap() = Some(shutdown_tx);

        let notifications = self.try_start_watcher(event_tx);
        if notifications {
            debug!("Started config file watcher using file system notifications");
        } else {
            debug!("Using polling mode (interval: {:?})", poll_interval);
        }

        let reloader = Arc::clone(self);
        let handle = tokio::spawn(async move {
            reloader
                .watch_loop(notifications, event_rx, shutdown_rx, poll_interval)
                .await;
        });
        *self.watch_task.lock().unwrap() = Some(handle);

        self.set_state(WatcherState::Watching);
    }

    /// Scope the notify watcher to the config file's directory, filtered to
    /// events touching the file itself.
    fn try_start_watcher(&self, event_tx: mpsc::UnboundedSender<()>) -> bool {
        let config_path = self.config_path.clone();
        let watch_dir = match self.config_path.parent() {
            Some(parent) if parent.as_os_str().is_empty() => PathBuf::from("."),
            Some(parent) => parent.to_path_buf(),
            None => return false,
        };

        let watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            if let Ok(event) = result {
                if event.paths.iter().any(|p| p.ends_with(
                    config_path.file_name().unwrap_or_default(),
                )) {
                    let _ = event_tx.send(());
                }
            }
        });

        match watcher {
            Ok(mut watcher) => match watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    *self.watcher.lock().unwrap() = Some(watcher);
                    true
                }
                Err(e) => {
                    warn!("Failed to watch {}: {}. Falling back to polling.", watch_dir.display(), e);
                    false
                }
            },
            Err(e) => {
                warn!("Failed to start file watcher: {}. Falling back to polling.", e);
                false
            }
        }
    }

    async fn watch_loop(
        self: Arc<Self>,
        notifications: bool,
        mut event_rx: mpsc::UnboundedReceiver<()>,
        mut shutdown_rx: mpsc::UnboundedReceiver<()>,
        poll_interval: Duration,
    ) {
        loop {
            if notifications {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    event = event_rx.recv() => {
                        if event.is_none() {
                            break;
                        }
                        tokio::time::sleep(DEBOUNCE).await;
                        while event_rx.try_recv().is_ok() {}
                        self.check_for_changes().await;
                    }
                }
            } else {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(poll_interval) => {
                        self.check_for_changes().await;
                    }
                }
            }
        }
        debug!("Config watch loop ended");
    }

    /// Stop watching the config file.
    pub async fn stop_watching(&self) {
        self.set_state(WatcherState::Stopping);

        if let Some(tx) = self.shutdown_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
        *self.watcher.lock().unwrap() = None;

        let task = self.watch_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }

        self.set_state(WatcherState::Stopped);
        debug!("Stopped config file watcher");
    }

    async fn check_for_changes(&self) {
        let Some(current_mtime) = self.current_mtime() else {
            let mut last = self.last_mtime.lock().unwrap();
            if last.is_some() {
                warn!("Config file disappeared: {}", self.config_path.display());
                *last = None;
            }
            return;
        };

        let last_mtime = *self.last_mtime.lock().unwrap();
        match last_mtime {
            None => {
                debug!("Config file appeared: {}", self.config_path.display());
                *self.last_mtime.lock().unwrap() = Some(current_mtime);
                *self.last_config.lock().unwrap() = Some(self.load_from_disk());
            }
            Some(last) if current_mtime != last => {
                if self.ignore_next_change.swap(false, Ordering::SeqCst) {
                    debug!("Ignoring config file change (internal modification)");
                    *self.last_mtime.lock().unwrap() = Some(current_mtime);
                    return;
                }

                debug!("Config file changed, reloading...");
                if let Err(e) = self.reload().await {
                    error!("Error reloading config: {}", e);
                }
                *self.last_mtime.lock().unwrap() = Some(current_mtime);
            }
            Some(_) => {}
        }
    }

    /// Reload the configuration and apply detected changes.
    ///
    /// Reentrant calls while a reload is in flight queue at most one extra
    /// reload and return immediately.
    pub async fn reload(&self) -> Result<Option<ConfigChange>> {
        if self.reloading.swap(true, Ordering::SeqCst) {
            self.reload_queued.store(true, Ordering::SeqCst);
            debug!("Reload already in progress, queuing one more");
            return Ok(None);
        }

        let previous_state = self.state();
        self.set_state(WatcherState::Reloading);

        let result = loop {
            let mut result = self.reload_once().await;
            while self.reload_queued.swap(false, Ordering::SeqCst) {
                result = self.reload_once().await;
            }

            self.reloading.store(false, Ordering::SeqCst);

            // A request that raced the release gets picked up here instead
            // of being dropped.
            if self.reload_queued.load(Ordering::SeqCst)
                && !self.reloading.swap(true, Ordering::SeqCst)
            {
                self.reload_queued.store(false, Ordering::SeqCst);
                continue;
            }
            break result;
        };

        self.set_state(if previous_state == WatcherState::Watching {
            WatcherState::Watching
        } else {
            WatcherState::Stopped
        });

        result
    }

    async fn reload_once(&self) -> Result<Option<ConfigChange>> {
        if !self.config_path.exists() {
            return Err(Error::reload(format!(
                "config file does not exist: {}",
                self.config_path.display()
            )));
        }

        let new_config = self.load_from_disk();
        let old_config = self
            .last_config
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_default();

        let change = diff_configs(&old_config, &new_config);

        if change.has_changes() {
            info!("{}", change.summarize());

            if let Err(e) = validate_config(&new_config) {
                error!("New config validation failed, not applying changes: {}", e);
                return Err(e);
            }

            self.handler.apply(change.clone()).await?;
            *self.last_config.lock().unwrap() = Some(new_config);
        } else {
            debug!("Config reloaded, no changes detected");
            *self.last_config.lock().unwrap() = Some(new_config);
        }

        Ok(Some(change))
    }

    fn load_from_disk(&self) -> MaggConfig {
        ConfigManager::new(Some(self.config_path.clone())).load_config()
    }
}

/// Facade tying a `ConfigManager` to an optional running `ConfigReloader`.
pub struct ReloadManager {
    config_manager: Arc<ConfigManager>,
    reloader: Mutex<Option<Arc<ConfigReloader>>>,
    handler: Mutex<Option<Arc<dyn ReloadHandler>>>,
}

impl ReloadManager {
    pub fn new(config_manager: Arc<ConfigManager>) -> Self {
        Self {
            config_manager,
            reloader: Mutex::new(None),
            handler: Mutex::new(None),
        }
    }

    pub fn cached_config(&self) -> Option<MaggConfig> {
        self.reloader
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|r| r.cached_config())
    }

    /// Start watching when auto-reload is enabled and the file exists.
    pub async fn setup(&self, handler: Arc<dyn ReloadHandler>) {
        *self.handler.lock().unwrap() = Some(handler.clone());

        let config = self.config_manager.load_config();
        let already_watching = self.reloader.lock().unwrap().is_some();

        if config.auto_reload && !already_watching && self.config_manager.config_path().exists() {
            let reloader = Arc::new(ConfigReloader::new(
                self.config_manager.config_path().to_path_buf(),
                handler,
            ));
            reloader.start_watching(config.reload_poll_interval()).await;
            *self.reloader.lock().unwrap() = Some(reloader);
        }
    }

    pub async fn stop(&self) {
        let reloader = self.reloader.lock().unwrap().take();
        if let Some(reloader) = reloader {
            reloader.stop_watching().await;
        }
    }

    /// Manually trigger a reload, with or without a running watcher.
    pub async fn reload(&self) -> Result<Option<ConfigChange>> {
        let existing = self.reloader.lock().unwrap().clone();
        if let Some(reloader) = existing {
            return reloader.reload().await;
        }

        let handler = self
            .handler
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::reload("no reload handler configured"))?;

        if !self.config_manager.config_path().exists() {
            return Err(Error::reload(format!(
                "config file does not exist: {}",
                self.config_manager.config_path().display()
            )));
        }

        let reloader = ConfigReloader::new(
            self.config_manager.config_path().to_path_buf(),
            handler,
        );
        reloader.reload().await
    }

    pub fn ignore_next_change(&self) {
        if let Some(reloader) = self.reloader.lock().unwrap().as_ref() {
            reloader.ignore_next_change();
        }
    }

    pub fn update_cached_config(&self, config: MaggConfig) {
        if let Some(reloader) = self.reloader.lock().unwrap().as_ref() {
            reloader.update_cached_config(config);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ServerConfig;
    use tempfile::TempDir;

    struct RecordingHandler {
        changes: Mutex<Vec<ConfigChange>>,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                changes: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.changes.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ReloadHandler for RecordingHandler {
        async fn apply(&self, change: ConfigChange) -> Result<()> {
            self.changes.lock().unwrap().push(change);
            Ok(())
        }
    }

    fn write_config(path: &std::path::Path, servers: &[(&str, bool)]) {
        let manager = ConfigManager::new(Some(path.to_path_buf()));
        let mut config = MaggConfig::default();
        for (name, enabled) in servers {
            let mut server = ServerConfig::new(*name, format!("file:///tmp/{name}"));
            server.command = Some("python".into());
            server.enabled = *enabled;
            config.add_server(server);
        }
        manager.save_config(&config).unwrap();
    }

    #[tokio::test]
    async fn test_manual_reload_detects_added_server() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        write_config(&path, &[]);

        let handler = RecordingHandler::new();
        let reloader = ConfigReloader::new(path.clone(), handler.clone());

        // First reload establishes the baseline from an empty cache.
        reloader.reload().await.unwrap();
        let baseline = handler.count();

        write_config(&path, &[("extra", true)]);
        let change = reloader.reload().await.unwrap().unwrap();
        assert!(change.has_changes());
        assert_eq!(handler.count(), baseline + 1);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        write_config(&path, &[("good", true)]);

        let handler = RecordingHandler::new();
        let reloader = ConfigReloader::new(path.clone(), handler.clone());
        reloader.reload().await.unwrap();
        let before = handler.count();

        // Enabled server with no command and no uri must be rejected.
        std::fs::write(
            &path,
            r#"{"servers": {"broken": {"source": "file:///tmp/broken"}}}"#,
        )
        .unwrap();

        assert!(reloader.reload().await.is_err());
        assert_eq!(handler.count(), before);

        // Cached config still reflects the last good state.
        let cached = reloader.cached_config().unwrap();
        assert!(cached.servers.contains_key("good"));
    }

    #[tokio::test]
    async fn test_missing_file_reload_errors() {
        let dir = TempDir::new().unwrap();
        let handler = RecordingHandler::new();
        let reloader = ConfigReloader::new(dir.path().join("nope.json"), handler);
        assert!(reloader.reload().await.is_err());
    }

    #[tokio::test]
    async fn test_poll_watcher_picks_up_change() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        write_config(&path, &[]);

        let handler = RecordingHandler::new();
        let reloader = Arc::new(ConfigReloader::new(path.clone(), handler.clone()));
        reloader.start_watching(Duration::from_millis(50)).await;
        assert_ne!(reloader.state(), WatcherState::Stopped);

        tokio::time::sleep(Duration::from_millis(150)).await;
        write_config(&path, &[("extra", true)]);

        // Wait for the watcher (notifications or polling) to catch up.
        let mut seen = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if handler.count() > 0 {
                seen = true;
                break;
            }
        }
        reloader.stop_watching().await;
        assert!(seen, "watcher never observed the config change");
        assert_eq!(reloader.state(), WatcherState::Stopped);
    }

    #[tokio::test]
    async fn test_self_write_suppression() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        write_config(&path, &[]);

        let handler = RecordingHandler::new();
        let reloader = Arc::new(ConfigReloader::new(path.clone(), handler.clone()));
        reloader.start_watching(Duration::from_millis(50)).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        // A programmatic save flags the reloader before touching the file.
        reloader.ignore_next_change();
        write_config(&path, &[("internal", true)]);
        let manager = ConfigManager::new(Some(path.clone()));
        reloader.update_cached_config(manager.load_config());

        tokio::time::sleep(Duration::from_millis(400)).await;
        reloader.stop_watching().await;
        assert_eq!(handler.count(), 0, "self-write must not trigger a reload");
    }
}
