use std::sync::Arc;

use pkg_tracker_core::config::AdminConfig;
use pkg_tracker_core::{ClientFactory, RefreshGate, Store, TrackingUpdater};

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub factory: Arc<ClientFactory>,
    pub gate: Arc<RefreshGate>,
    pub updater: Arc<TrackingUpdater>,
    pub admin: AdminConfig,
}

impl AppState {
    pub fn new(
        store: Store,
        factory: Arc<ClientFactory>,
        gate: Arc<RefreshGate>,
        updater: Arc<TrackingUpdater>,
        admin: AdminConfig,
    ) -> Self {
        Self {
            store,
            factory,
            gate,
            updater,
            admin,
        }
    }
}
