//! Configuration types and loading
//!
//! See [`types::Config`] for the document layout, [`loader`] for
//! loading and default seeding, and [`watcher`] for hot-reload change
//! notification.

mod loader;
mod types;
mod watcher;

pub use loader::{load_config, load_config_str, seed_default_config, DEFAULT_CONFIG};
pub use types::{
    Config, DefaultsSection, EditionSection, GatewayEntry, ListenerBinding, ListenerEntry,
    ResolvedEdition, ServerEntry, IMPLICIT_GATE_ID,
};
pub use watcher::ConfigWatcher;
