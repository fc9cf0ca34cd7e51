//! The time-windowed mailbox scanner.
//!
//! Every tick asks the mailbox for messages newer than the persisted
//! high-water mark minus a fixed overlap, runs each through the pipeline,
//! and advances the mark only when the scan reached the end of the listing.
//! Mailbox-level failures back off exponentially without moving the mark, so
//! no window is ever skipped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EmailConfig;
use crate::models::EmailStatus;
use crate::repository::EmailRepository;
use crate::Result;

use super::gmail::MailboxClient;
use super::pipeline::EmailPipeline;

/// Re-fetch this far behind the mark to absorb clock skew and late arrivals
const SCAN_OVERLAP_SECS: i64 = 600;

/// Backoff base for mailbox-level failures
const BACKOFF_BASE_SECS: u64 = 5;
const BACKOFF_MAX_SECS: u64 = 600;

/// Counters for one completed scan.
#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    pub listed: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub deduplicated: usize,
    pub shipments_created: usize,
}

pub struct EmailScanner {
    mailbox: Arc<dyn MailboxClient>,
    pipeline: EmailPipeline,
    emails: EmailRepository,
    config: EmailConfig,
}

impl EmailScanner {
    pub fn new(
        mailbox: Arc<dyn MailboxClient>,
        pipeline: EmailPipeline,
        emails: EmailRepository,
        config: EmailConfig,
    ) -> Self {
        Self {
            mailbox,
            pipeline,
            emails,
            config,
        }
    }

    /// Spawn the scan loop; stops when `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.check_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut consecutive_failures: u32 = 0;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Scans run in their own task so a panic is caught
                        // here and the daemon keeps ticking
                        let this = self.clone();
                        let scan = tokio::spawn(async move { this.scan_once().await });
                        let outcome = match scan.await {
                            Ok(outcome) => outcome,
                            Err(e) => {
                                error!("mailbox scan panicked: {}", e);
                                continue;
                            }
                        };
                        match outcome {
                            Ok(summary) => {
                                consecutive_failures = 0;
                                if summary.listed > 0 {
                                    info!(
                                        listed = summary.listed,
                                        processed = summary.processed,
                                        skipped = summary.skipped,
                                        failed = summary.failed,
                                        shipments_created = summary.shipments_created,
                                        "mailbox scan complete"
                                    );
                                }
                            }
                            Err(e) => {
                                consecutive_failures += 1;
                                let backoff = backoff_secs(consecutive_failures);
                                error!(
                                    consecutive_failures,
                                    backoff_secs = backoff,
                                    "mailbox scan failed: {}",
                                    e
                                );
                                tokio::select! {
                                    _ = tokio::time::sleep(Duration::from_secs(backoff)) => {}
                                    _ = shutdown.changed() => {}
                                }
                            }
                        }

                        if let Err(e) = self.prune_retention().await {
                            warn!("body retention pruning failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("email scanner stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// One scan pass. Returns Err only for mailbox-level failures; those do
    /// not advance the high-water mark.
    pub async fn scan_once(&self) -> Result<ScanSummary> {
        let mark = match self.emails.high_water_mark().await? {
            Some(mark) => mark,
            None => Utc::now() - chrono::Duration::days(self.config.scan_days),
        };
        let window_start = mark - chrono::Duration::seconds(SCAN_OVERLAP_SECS);
        debug!(window_start = %window_start.to_rfc3339(), "mailbox scan starting");

        let ids = self
            .mailbox
            .list_message_ids(window_start, self.config.max_per_scan)
            .await?;

        let mut summary = ScanSummary {
            listed: ids.len(),
            ..Default::default()
        };
        let mut new_mark: DateTime<Utc> = mark;

        for id in &ids {
            // Settled messages only need their timestamp folded into the mark
            if let Some(existing) = self.emails.find_by_provider_message_id(id).await? {
                if existing.status != EmailStatus::Failed.as_str() {
                    summary.deduplicated += 1;
                    new_mark = new_mark.max(existing.internal_timestamp);
                    continue;
                }
            }

            let message = self.mailbox.fetch_message(id).await?;
            new_mark = new_mark.max(message.internal_timestamp);

            let report = self.pipeline.process_message(&message).await?;
            match report.status {
                Some(EmailStatus::Processed) => summary.processed += 1,
                Some(EmailStatus::Skipped) => summary.skipped += 1,
                Some(EmailStatus::Failed) => summary.failed += 1,
                None => summary.deduplicated += 1,
            }
            summary.shipments_created += report.shipments_created;
        }

        if new_mark > mark || self.emails.high_water_mark().await?.is_none() {
            self.emails.set_high_water_mark(new_mark).await?;
        }

        Ok(summary)
    }

    async fn prune_retention(&self) -> Result<()> {
        let horizon = Utc::now() - chrono::Duration::days(self.config.retention_days);
        let pruned = self.emails.prune_bodies(horizon).await?;
        if pruned > 0 {
            info!(pruned, "email bodies pruned past retention horizon");
        }
        Ok(())
    }
}

fn backoff_secs(consecutive_failures: u32) -> u64 {
    (BACKOFF_BASE_SECS << consecutive_failures.saturating_sub(1).min(10)).min(BACKOFF_MAX_SECS)
}
