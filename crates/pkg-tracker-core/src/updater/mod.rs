//! The tracking updater: a long-lived worker that periodically refreshes
//! eligible shipments, carrier by carrier.
//!
//! One sweep walks USPS (batched) first, then UPS, FedEx, DHL, and finally
//! delegated Amazon shipments. Sweeps never overlap; a tick that lands while
//! one is still running is dropped. The only user-visible state is the pause
//! flag and the status snapshot served by the admin API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::carriers::{usps, CarrierError, ClientFactory, RateLimitSnapshot};
use crate::config::UpdateConfig;
use crate::models::{CarrierCode, Shipment};
use crate::refresh::{Preflight, RefreshGate};
use crate::repository::{AutoRefreshOutcome, Store};
use crate::Error;

/// Warn once the used share of the DHL daily quota reaches this fraction
const DHL_QUOTA_WARN_RATIO: f64 = 0.8;

/// Status snapshot for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct UpdaterStatus {
    pub paused: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub in_flight: bool,
}

#[derive(Debug, Default)]
struct DhlQuotaState {
    /// Reset time of the period the warning already fired for
    warned_until: Option<DateTime<Utc>>,
}

pub struct TrackingUpdater {
    store: Store,
    gate: Arc<RefreshGate>,
    factory: Arc<ClientFactory>,
    config: UpdateConfig,
    paused: AtomicBool,
    sweep_in_progress: AtomicBool,
    last_run_at: RwLock<Option<DateTime<Utc>>>,
    dhl_quota: RwLock<DhlQuotaState>,
}

impl TrackingUpdater {
    pub fn new(
        store: Store,
        gate: Arc<RefreshGate>,
        factory: Arc<ClientFactory>,
        config: UpdateConfig,
    ) -> Self {
        Self {
            store,
            gate,
            factory,
            config,
            paused: AtomicBool::new(false),
            sweep_in_progress: AtomicBool::new(false),
            last_run_at: RwLock::new(None),
            dhl_quota: RwLock::new(DhlQuotaState::default()),
        }
    }

    pub fn pause(&self) {
        info!("tracking updater paused");
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        info!("tracking updater resumed");
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn status(&self) -> UpdaterStatus {
        UpdaterStatus {
            paused: self.paused.load(Ordering::SeqCst),
            last_run_at: *self.last_run_at.read().expect("last_run_at lock"),
            in_flight: self.sweep_in_progress.load(Ordering::SeqCst),
        }
    }

    /// Spawn the timer loop; stops when `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Consume the immediate first tick; the first sweep waits a full
            // interval after startup
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if self.paused.load(Ordering::SeqCst) {
                            debug!("updater tick skipped: paused");
                            continue;
                        }
                        // Sweeps run in their own task so a panic is caught
                        // here and the worker keeps ticking
                        let this = self.clone();
                        let mut sweep_shutdown = shutdown.clone();
                        let sweep = tokio::spawn(async move {
                            this.run_sweep(&mut sweep_shutdown).await;
                        });
                        if let Err(e) = sweep.await {
                            error!("tracking sweep panicked: {}", e);
                            self.sweep_in_progress.store(false, Ordering::SeqCst);
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("tracking updater stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// One full sweep across all enabled carriers. Public so the admin API
    /// and tests can drive a sweep without waiting for the timer.
    pub async fn run_sweep(&self, shutdown: &mut watch::Receiver<bool>) {
        if self
            .sweep_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("updater tick dropped: previous sweep still running");
            return;
        }

        info!("tracking sweep starting");
        let started = Utc::now();

        for carrier in CarrierCode::sweep_order() {
            if *shutdown.borrow() {
                info!("sweep interrupted by shutdown");
                break;
            }
            if !self.config.enabled_for(carrier) {
                debug!(carrier = %carrier, "carrier sweep disabled by configuration");
                continue;
            }

            if let Err(e) = self.sweep_carrier(carrier, shutdown).await {
                error!(carrier = %carrier, "carrier sweep failed: {}", e);
            }
        }

        *self.last_run_at.write().expect("last_run_at lock") = Some(started);
        self.sweep_in_progress.store(false, Ordering::SeqCst);
        info!(elapsed_secs = (Utc::now() - started).num_seconds(), "tracking sweep finished");
    }

    async fn sweep_carrier(
        &self,
        carrier: CarrierCode,
        shutdown: &mut watch::Receiver<bool>,
    ) -> crate::Result<()> {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.cutoff_days_for(carrier));
        let eligible = self
            .store
            .shipments
            .get_active_for_auto_update(carrier, cutoff, self.config.failure_threshold)
            .await?;

        if eligible.is_empty() {
            return Ok(());
        }
        info!(carrier = %carrier, count = eligible.len(), "carrier sweep starting");

        if carrier == CarrierCode::Usps {
            self.sweep_usps_batched(eligible, shutdown).await;
        } else {
            for shipment in eligible {
                if *shutdown.borrow() {
                    break;
                }
                self.dispatch_one(&shipment).await;
            }
        }

        Ok(())
    }

    /// Refresh one shipment through the gate and account for the outcome.
    async fn dispatch_one(&self, shipment: &Shipment) {
        match self.gate.refresh(shipment.id, false, false).await {
            Ok(outcome) => {
                if let Some(snapshot) = outcome.result.rate_limit {
                    if shipment.carrier == CarrierCode::Dhl {
                        self.observe_dhl_quota(snapshot);
                    }
                }
                debug!(
                    shipment_id = shipment.id,
                    source = outcome.source.as_str(),
                    events_added = outcome.events_added,
                    "auto refresh succeeded"
                );
                self.account(shipment.id, AutoRefreshOutcome::Success).await;
            }
            Err(Error::Cooldown { .. }) => {
                // Another path refreshed recently; benign skip, no accounting
                debug!(shipment_id = shipment.id, "auto refresh skipped: cooldown");
            }
            Err(e) => {
                if let Error::Carrier(ref carrier_error) = e {
                    if let Some(at) = carrier_error.retry_after {
                        if shipment.carrier == CarrierCode::Dhl {
                            self.observe_dhl_quota(RateLimitSnapshot {
                                limit: 1,
                                remaining: 0,
                                reset_at: Some(at),
                            });
                        }
                    }
                }
                warn!(shipment_id = shipment.id, "auto refresh failed: {}", e);
                self.account(shipment.id, AutoRefreshOutcome::Error(e.to_string())).await;
            }
        }
    }

    /// USPS accepts 10 numbers per call; chunk the eligible set and fall back
    /// to individual calls when a whole batch fails retryably, so one bad
    /// number cannot poison the other nine.
    async fn sweep_usps_batched(
        &self,
        eligible: Vec<Shipment>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let batch_size = self.config.batch_size.clamp(1, usps::MAX_BATCH);

        // Settle cache hits and cooldowns first; only the rest go on the wire
        let mut live: Vec<Shipment> = Vec::new();
        for shipment in eligible {
            match self.gate.preflight(&shipment).await {
                Ok(Preflight::CacheHit(result)) => {
                    debug!(shipment_id = shipment.id, "usps refresh adopted from cache");
                    if let Err(e) = self.gate.record_result(shipment.id, &result).await {
                        warn!(shipment_id = shipment.id, "cache adoption failed: {}", e);
                        continue;
                    }
                    self.account(shipment.id, AutoRefreshOutcome::Success).await;
                }
                Ok(Preflight::Cooldown(_)) => {
                    debug!(shipment_id = shipment.id, "usps refresh skipped: cooldown");
                }
                Ok(Preflight::Live) => live.push(shipment),
                Err(e) => warn!(shipment_id = shipment.id, "usps preflight failed: {}", e),
            }
        }

        for chunk in live.chunks(batch_size) {
            if *shutdown.borrow() {
                break;
            }

            let numbers: Vec<String> =
                chunk.iter().map(|s| s.tracking_number.clone()).collect();
            let batch_timeout = Duration::from_secs(self.config.batch_timeout_secs);

            let response = tokio::time::timeout(
                batch_timeout,
                self.factory.track_batch(CarrierCode::Usps, numbers),
            )
            .await
            .unwrap_or_else(|_| Err(CarrierError::network("USPS batch call timed out")));

            match response {
                Ok(response) => {
                    for outcome in response.results {
                        let Some(shipment) =
                            chunk.iter().find(|s| s.tracking_number == outcome.tracking_number)
                        else {
                            continue;
                        };
                        match outcome.result {
                            Ok(result) => {
                                match self.gate.record_result(shipment.id, &result).await {
                                    Ok(_) => {
                                        self.account(shipment.id, AutoRefreshOutcome::Success)
                                            .await
                                    }
                                    Err(e) => {
                                        self.account(
                                            shipment.id,
                                            AutoRefreshOutcome::Error(e.to_string()),
                                        )
                                        .await
                                    }
                                }
                            }
                            Err(e) => {
                                self.account(
                                    shipment.id,
                                    AutoRefreshOutcome::Error(e.to_string()),
                                )
                                .await
                            }
                        }
                    }
                }
                Err(batch_error) if batch_error.retryable => {
                    warn!(
                        batch = chunk.len(),
                        "USPS batch failed retryably ({}); retrying numbers individually",
                        batch_error
                    );
                    let individual_timeout =
                        Duration::from_secs(self.config.individual_timeout_secs);
                    for shipment in chunk {
                        if *shutdown.borrow() {
                            break;
                        }
                        if tokio::time::timeout(individual_timeout, self.dispatch_one(shipment))
                            .await
                            .is_err()
                        {
                            self.account(
                                shipment.id,
                                AutoRefreshOutcome::Error(
                                    "individual retry timed out".to_string(),
                                ),
                            )
                            .await;
                        }
                    }
                }
                Err(batch_error) => {
                    warn!("USPS batch failed terminally: {}", batch_error);
                    for shipment in chunk {
                        self.account(
                            shipment.id,
                            AutoRefreshOutcome::Error(batch_error.to_string()),
                        )
                        .await;
                    }
                }
            }
        }
    }

    async fn account(&self, shipment_id: i64, outcome: AutoRefreshOutcome) {
        if let Err(e) = self
            .store
            .shipments
            .update_auto_refresh(shipment_id, &outcome)
            .await
        {
            error!(shipment_id, "auto-refresh bookkeeping write failed: {}", e);
        }
    }

    /// Emit the DHL quota warning at most once per reset period.
    fn observe_dhl_quota(&self, snapshot: RateLimitSnapshot) {
        if snapshot.limit == 0 {
            return;
        }
        let used = (snapshot.limit - snapshot.remaining.min(snapshot.limit)) as f64
            / snapshot.limit as f64;
        if used < DHL_QUOTA_WARN_RATIO {
            return;
        }

        let now = Utc::now();
        let mut state = self.dhl_quota.write().expect("dhl quota lock");
        if let Some(warned_until) = state.warned_until {
            if now < warned_until {
                return;
            }
        }

        let reset_at = snapshot
            .reset_at
            .unwrap_or_else(|| now + chrono::Duration::hours(24));
        warn!(
            remaining = snapshot.remaining,
            limit = snapshot.limit,
            reset_at = %reset_at.to_rfc3339(),
            minutes_to_reset = (reset_at - now).num_minutes(),
            "DHL daily quota nearly exhausted"
        );
        state.warned_until = Some(reset_at);
    }
}
