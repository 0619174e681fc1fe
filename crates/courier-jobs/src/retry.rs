//! Retry scheduler and stale attempt reaper.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};

use courier_core::{
    CallContext, Clock, DeliveryAttempt, DeliveryLogRepository, DeliveryStatus,
    NotificationRepository, Result,
};
use courier_db::Repositories;

use crate::config::WorkerConfig;
use crate::delivery::{ChannelOutcome, DeliveryWorker};

/// Totals of one retry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPass {
    pub eligible: usize,
    pub retried: usize,
    pub sent: usize,
    pub failed: usize,
    /// Claimed by another scheduler, the notification is gone or expired,
    /// or the channel has no address any more.
    pub skipped: usize,
    /// Store or directory errors; the claim was handed back for a later sweep.
    pub errors: usize,
}

/// Re-sends failed attempts whose backoff has elapsed.
///
/// A failed attempt is claimed by clearing its `retry_after`; only the
/// scheduler that wins the claim appends attempt `k + 1`. A claim whose
/// retry errors out is released again, restoring the original `retry_after`.
#[derive(Clone)]
pub struct RetryScheduler {
    worker: DeliveryWorker,
    notifications: Arc<dyn NotificationRepository>,
    delivery_logs: Arc<dyn DeliveryLogRepository>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
}

impl RetryScheduler {
    pub fn new(
        worker: DeliveryWorker,
        repos: &Repositories,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            worker,
            notifications: repos.notifications.clone(),
            delivery_logs: repos.delivery_logs.clone(),
            clock,
            config,
        }
    }

    #[instrument(skip(self, ctx), fields(subsystem = "retry", op = "retry_failed"))]
    pub async fn retry_failed(&self, ctx: &CallContext, limit: i64) -> Result<RetryPass> {
        let start = Instant::now();
        let eligible = self
            .delivery_logs
            .list_retry_eligible(self.clock.now(), limit)
            .await?;
        let mut pass = RetryPass {
            eligible: eligible.len(),
            ..RetryPass::default()
        };

        for failed in eligible {
            if ctx.is_cancelled() {
                break;
            }
            let Some(retry_after) = failed.retry_after else {
                pass.skipped += 1;
                continue;
            };
            match self.delivery_logs.claim_retry(failed.id).await {
                Ok(true) => {}
                Ok(false) => {
                    pass.skipped += 1;
                    continue;
                }
                Err(e) => {
                    pass.errors += 1;
                    warn!(attempt_id = %failed.id, error = %e, "Could not claim retry");
                    continue;
                }
            }

            match self.retry_claimed(ctx, &failed).await {
                Ok(Some(ChannelOutcome::Sent)) => {
                    pass.retried += 1;
                    pass.sent += 1;
                }
                Ok(Some(ChannelOutcome::Failed)) => {
                    pass.retried += 1;
                    pass.failed += 1;
                }
                Ok(_) => pass.skipped += 1,
                Err(e) => {
                    pass.errors += 1;
                    warn!(attempt_id = %failed.id, error = %e, "Retry skipped, releasing claim");
                    if let Err(e) = self
                        .delivery_logs
                        .release_retry(failed.id, retry_after)
                        .await
                    {
                        error!(attempt_id = %failed.id, error = %e, "Could not release retry claim");
                    }
                }
            }
        }

        if pass.eligible > 0 {
            info!(
                eligible = pass.eligible,
                sent = pass.sent,
                failed = pass.failed,
                skipped = pass.skipped,
                errors = pass.errors,
                duration_ms = start.elapsed().as_millis() as u64,
                "Retry sweep finished"
            );
        }
        Ok(pass)
    }

    /// Send attempt `k + 1` for a claimed failure to the user's current
    /// address. `None` when there is nothing left to retry.
    async fn retry_claimed(
        &self,
        ctx: &CallContext,
        failed: &DeliveryAttempt,
    ) -> Result<Option<ChannelOutcome>> {
        let notification = match self.notifications.get_by_id(failed.notification_id).await? {
            Some(n) if !n.is_expired(self.clock.now()) => n,
            _ => {
                debug!(attempt_id = %failed.id, "Notification gone or expired, not retrying");
                return Ok(None);
            }
        };

        let contact = self
            .worker
            .contact(ctx, &notification, &[failed.channel])
            .await?;
        let Some(recipient) = contact.address_for(failed.channel, notification.id) else {
            debug!(
                attempt_id = %failed.id,
                channel = %failed.channel,
                "No recipient any more, not retrying"
            );
            return Ok(None);
        };

        let outcome = self
            .worker
            .send_attempt(
                ctx,
                &notification,
                failed.channel,
                &recipient,
                failed.attempt_number + 1,
            )
            .await?;
        if outcome == ChannelOutcome::Sent {
            if let Err(e) = self.worker.complete(&notification).await {
                warn!(
                    notification_id = %notification.id,
                    error = %e,
                    "Could not mark notification sent"
                );
            }
        }
        Ok(Some(outcome))
    }

    /// Fail attempts left `queued` or `processing` past the staleness age,
    /// scheduling them for retry like any transient failure.
    #[instrument(skip(self), fields(subsystem = "retry", op = "reap_stale"))]
    pub async fn reap_stale(&self, limit: i64) -> Result<usize> {
        let now = self.clock.now();
        let stale = self
            .delivery_logs
            .list_stale(now - self.config.stale_after, limit)
            .await?;

        let mut reaped = 0;
        for attempt in stale {
            let message = format!("attempt abandoned while {}", attempt.status);
            match self
                .delivery_logs
                .mark_failed_with_backoff(attempt.id, "stale_processing", &message, now)
                .await
            {
                Ok(_) => {
                    reaped += 1;
                    if let Err(e) = self
                        .notifications
                        .update_channel_delivery_status(
                            attempt.notification_id,
                            attempt.channel,
                            DeliveryStatus::Failed,
                            now,
                        )
                        .await
                    {
                        warn!(attempt_id = %attempt.id, error = %e, "Could not update channel status");
                    }
                }
                Err(e) => warn!(attempt_id = %attempt.id, error = %e, "Could not reap attempt"),
            }
        }
        if reaped > 0 {
            info!(reaped, "Stale attempts failed");
        }
        Ok(reaped)
    }
}
