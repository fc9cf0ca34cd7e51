//! Repository layer over the embedded SQLite store.

pub mod cache_repository;
pub mod carrier_repository;
pub mod email_repository;
pub mod event_repository;
pub mod shipment_repository;

pub use cache_repository::RefreshCacheRepository;
pub use carrier_repository::CarrierRepository;
pub use email_repository::{EmailRepository, NewProcessedEmail};
pub use event_repository::EventRepository;
pub use shipment_repository::{AutoRefreshOutcome, ShipmentRepository};

use sqlx::SqlitePool;

/// All repositories over one pool; the process-wide store handle.
#[derive(Clone)]
pub struct Store {
    pub shipments: ShipmentRepository,
    pub events: EventRepository,
    pub carriers: CarrierRepository,
    pub cache: RefreshCacheRepository,
    pub emails: EmailRepository,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            shipments: ShipmentRepository::new(pool.clone()),
            events: EventRepository::new(pool.clone()),
            carriers: CarrierRepository::new(pool.clone()),
            cache: RefreshCacheRepository::new(pool.clone()),
            emails: EmailRepository::new(pool),
        }
    }
}
