//! state.rs — Shared handler state

use std::sync::Arc;

use crate::audit::AuditLogger;
use crate::config::BackendConfig;
use crate::dispatch::DispatchService;
use crate::persistence::Datastore;
use crate::push::Notifier;

#[derive(Clone)]
pub struct AppState {
    pub dispatch: Arc<DispatchService>,
}

impl AppState {
    pub fn new(store: Datastore, notifier: Arc<dyn Notifier>, audit: AuditLogger, config: &BackendConfig) -> Self {
        Self { dispatch: Arc::new(DispatchService::new(store, notifier, audit, config)) }
    }
}
