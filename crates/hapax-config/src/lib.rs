//! # hapax-config
//!
//! Hot-reloadable configuration substrate for Hapax: TOML parsing over a
//! defaults baseline, `${VAR}` / `${VAR:-default}` environment expansion,
//! validation, and a file watcher that atomically swaps in new snapshots
//! and fans them out to subscribers (§4.7).

pub mod expand;
pub mod loader;
pub mod schema;
pub mod watcher;

pub use loader::{load_and_validate, load_or_default, resolve_path};
pub use schema::HapaxConfig;
pub use watcher::ConfigWatcher;
