pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod models;
pub mod routes;

use std::sync::Arc;

use config::Config;
use db::groups::GroupStore;
use gateway::registry::GroupRegistry;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn GroupStore>,
    pub groups: GroupRegistry,
}

impl AppState {
    /// Wire the registry to `store`, which doubles as the group state
    /// service every dispatcher reports to.
    pub fn new<S: GroupStore + 'static>(config: Config, store: Arc<S>) -> Self {
        let groups = GroupRegistry::new(store.clone(), config.worker_mailbox_capacity);
        Self {
            config: Arc::new(config),
            store,
            groups,
        }
    }
}
