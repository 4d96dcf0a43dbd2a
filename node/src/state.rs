use crate::config::AppConfig;
use crate::sync::SyncEngine;
use std::sync::Arc;

pub struct AppState {
    config: AppConfig,
    engine: SyncEngine,
}

impl AppState {
    pub fn new(config: AppConfig, engine: SyncEngine) -> Arc<Self> {
        Arc::new(Self { config, engine })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn build_id(&self) -> &str {
        &self.config.build_id
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }
}
