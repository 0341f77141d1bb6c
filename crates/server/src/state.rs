use std::sync::Arc;

use cartpilot_core::{BatchController, Config, EventBroadcaster, RunStore, SanitizedConfig};

/// Shared application state
pub struct AppState {
    config: Config,
    controller: Arc<BatchController>,
    broadcaster: EventBroadcaster,
    run_store: Arc<dyn RunStore>,
}

impl AppState {
    pub fn new(
        config: Config,
        controller: Arc<BatchController>,
        broadcaster: EventBroadcaster,
        run_store: Arc<dyn RunStore>,
    ) -> Self {
        Self {
            config,
            controller,
            broadcaster,
            run_store,
        }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    pub fn controller(&self) -> &BatchController {
        self.controller.as_ref()
    }

    pub fn broadcaster(&self) -> &EventBroadcaster {
        &self.broadcaster
    }

    /// Run history, for batches and events no longer held in memory.
    pub fn run_store(&self) -> &dyn RunStore {
        self.run_store.as_ref()
    }
}
