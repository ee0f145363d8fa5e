//! Configuration management for magg
//!
//! # Modules
//!
//! - `settings`: `ServerConfig`, `MaggConfig`, and `KitInfo` models
//! - `manager`: config file persistence (`.magg/config.json`)
//! - `kit`: kit bundles - discovery, load/unload, ownership tracking
//! - `change`: diffing two configurations into a `ConfigChange`
//! - `reload`: file watching and hot reload

pub mod change;
pub mod kit;
pub mod manager;
pub mod reload;
pub mod settings;

pub use change::{ChangeAction, ConfigChange, ServerChange};
pub use kit::{KitConfig, KitManager};
pub use manager::ConfigManager;
pub use reload::{ConfigReloader, ReloadHandler, ReloadManager};
pub use settings::{KitInfo, KitSource, MaggConfig, ServerConfig};
