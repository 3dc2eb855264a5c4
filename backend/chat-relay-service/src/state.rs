use crate::{config::Config, services::Relay, store::ChatStore};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    /// Same store the relay writes through; read-only routes query it directly.
    pub store: Arc<dyn ChatStore>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(relay: Relay, config: Arc<Config>) -> Self {
        Self {
            store: relay.store().clone(),
            relay,
            config,
        }
    }
}
