//! Shared application state.

use crate::config::Config;
use crate::container::ContainerEngine;
use crate::sandbox::Sandbox;
use crate::scheduler::Scheduler;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,
}

impl AppState {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    /// Wire a sandbox on `engine` behind a scheduler configured from `config`.
    pub fn with_engine<E: ContainerEngine>(engine: Arc<E>, config: &Config) -> Self {
        let sandbox = Sandbox::from_config(engine, config);
        Self::new(Scheduler::new(config.scheduler, Arc::new(sandbox)))
    }
}
