pub mod carriers;
pub mod config;
pub mod db;
pub mod email;
pub mod error;
pub mod extractor;
pub mod models;
pub mod refresh;
pub mod repository;
pub mod updater;

// Re-export commonly used types
pub use carriers::{CarrierClient, CarrierError, ClientFactory};
pub use config::Config;
pub use db::migrate::{auto_migrate, Migrator};
pub use db::{create_memory_pool, create_pool};
pub use error::{Error, Result};
pub use models::{CarrierCode, Shipment, TrackingEvent, TrackingStatus};
pub use refresh::{CacheStatus, RefreshGate, RefreshOutcome};
pub use repository::Store;
pub use updater::{TrackingUpdater, UpdaterStatus};

/// Current version of pkg-tracker
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_error_creation() {
        let err = Error::validation("bad input");
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.category(), "validation");
    }
}
