//! Lazy cache eviction: a once-per-minute sweep deleting entries past their
//! expiry. Shipment deletes already cascade eagerly; this catches the rest.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::repository::RefreshCacheRepository;

const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// Spawn the evictor loop; it stops when `shutdown` flips to true.
pub fn spawn(
    cache: RefreshCacheRepository,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(EVICTION_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match cache.evict_expired(Utc::now()).await {
                        Ok(0) => {}
                        Ok(evicted) => debug!(evicted, "expired refresh-cache entries removed"),
                        Err(e) => error!("cache eviction failed: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("cache evictor stopping");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_memory_pool, migrate::auto_migrate};
    use crate::models::CreateShipmentRequest;
    use crate::repository::Store;

    #[tokio::test]
    async fn test_evictor_stops_on_shutdown() {
        let pool = create_memory_pool().await.unwrap();
        auto_migrate(&pool).await.unwrap();
        let store = Store::new(pool);

        let (tx, rx) = watch::channel(false);
        let handle = spawn(store.cache.clone(), rx);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("evictor did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_expired_entries_are_swept() {
        let pool = create_memory_pool().await.unwrap();
        auto_migrate(&pool).await.unwrap();
        let store = Store::new(pool);

        let shipment = store
            .shipments
            .create(&CreateShipmentRequest {
                tracking_number: "1Z999AA10123456784".into(),
                carrier: "ups".into(),
                description: String::new(),
                amazon_order_number: None,
                delegated_carrier: None,
                delegated_tracking_number: None,
                is_amazon_logistics: false,
            })
            .await
            .unwrap();

        let past = Utc::now() - chrono::Duration::minutes(10);
        store
            .cache
            .put(shipment.id, "{}", past, past + chrono::Duration::minutes(5))
            .await
            .unwrap();

        assert_eq!(store.cache.evict_expired(Utc::now()).await.unwrap(), 1);
        assert!(store.cache.get(shipment.id).await.unwrap().is_none());
    }
}
