//! Delivery worker: hands persisted notifications to channel drivers.
//!
//! A channel is claimed by appending attempt #1 for it; the store refuses a
//! second attempt with the same number, so concurrent workers skip channels
//! someone else already owns. Every attempt row is written before the
//! driver call, so a crash mid-call leaves a `processing` row for the stale
//! reaper.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use courier_channels::DriverRegistry;
use courier_core::{
    AttemptUpdate, CallContext, CampaignRepository, Channel, Clock, DeliveryAttempt,
    DeliveryLogRepository, DeliveryStatus, DriverError, Error, NewDeliveryAttempt, Notification,
    NotificationRepository, Result, UserContact, UserDirectory,
};
use courier_db::Repositories;

use crate::config::WorkerConfig;

/// Result of one channel send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOutcome {
    /// The driver accepted the message.
    Sent,
    /// The attempt failed; it may be retried later.
    Failed,
    /// No address for this channel; recorded without an attempt row.
    NoRecipient,
    /// Another worker claimed the attempt first.
    Claimed,
    /// The pass was cancelled mid-call; the attempt stays `processing`.
    Abandoned,
}

/// Per-notification summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub channels: Vec<(Channel, ChannelOutcome)>,
    /// True when this call flipped the notification to sent.
    pub marked_sent: bool,
}

impl DeliveryReport {
    pub fn any_sent(&self) -> bool {
        self.channels
            .iter()
            .any(|(_, o)| *o == ChannelOutcome::Sent)
    }
}

/// Totals of one unsent sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryPass {
    pub notifications: usize,
    pub sent: usize,
    pub failed: usize,
    pub marked_sent: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct DeliveryWorker {
    notifications: Arc<dyn NotificationRepository>,
    delivery_logs: Arc<dyn DeliveryLogRepository>,
    campaigns: Arc<dyn CampaignRepository>,
    drivers: DriverRegistry,
    directory: Arc<dyn UserDirectory>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
}

impl DeliveryWorker {
    pub fn new(
        repos: &Repositories,
        drivers: DriverRegistry,
        directory: Arc<dyn UserDirectory>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            notifications: repos.notifications.clone(),
            delivery_logs: repos.delivery_logs.clone(),
            campaigns: repos.campaigns.clone(),
            drivers,
            directory,
            clock,
            config,
        }
    }

    /// Deliver one batch of unsent notifications, highest priority first.
    #[instrument(skip(self, ctx), fields(subsystem = "delivery", op = "unsent_sweep"))]
    pub async fn run_pass(&self, ctx: &CallContext) -> Result<DeliveryPass> {
        let start = Instant::now();
        let batch = self
            .notifications
            .list_unsent(self.clock.now(), self.config.delivery_batch_size)
            .await?;
        let mut pass = DeliveryPass {
            notifications: batch.len(),
            ..DeliveryPass::default()
        };
        if batch.is_empty() {
            return Ok(pass);
        }

        for chunk in batch.chunks(self.config.delivery_concurrency.max(1)) {
            if ctx.is_cancelled() {
                break;
            }
            let mut tasks = JoinSet::new();
            for notification in chunk.iter().cloned() {
                let worker = self.clone();
                let ctx = ctx.clone();
                tasks.spawn(async move {
                    let id = notification.id;
                    (id, worker.deliver(&ctx, &notification).await)
                });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((_, Ok(report))) => {
                        for (_, outcome) in &report.channels {
                            match outcome {
                                ChannelOutcome::Sent => pass.sent += 1,
                                ChannelOutcome::Failed | ChannelOutcome::NoRecipient => {
                                    pass.failed += 1
                                }
                                _ => {}
                            }
                        }
                        if report.marked_sent {
                            pass.marked_sent += 1;
                        }
                    }
                    Ok((id, Err(e))) => {
                        pass.errors += 1;
                        warn!(notification_id = %id, error = %e, "Delivery skipped this pass");
                    }
                    Err(e) => {
                        pass.errors += 1;
                        error!(error = ?e, "Delivery task panicked");
                    }
                }
            }
        }

        info!(
            notifications = pass.notifications,
            sent = pass.sent,
            failed = pass.failed,
            marked_sent = pass.marked_sent,
            duration_ms = start.elapsed().as_millis() as u64,
            "Unsent sweep finished"
        );
        Ok(pass)
    }

    /// Deliver every channel of `notification` that has not been attempted.
    pub async fn deliver(
        &self,
        ctx: &CallContext,
        notification: &Notification,
    ) -> Result<DeliveryReport> {
        ctx.check()?;
        let mut report = DeliveryReport::default();
        let pending = notification.pending_channels();
        if pending.is_empty() || notification.is_expired(self.clock.now()) {
            return Ok(report);
        }

        let contact = self.contact(ctx, notification, &pending).await?;
        for channel in pending {
            let outcome = match contact.address_for(channel, notification.id) {
                Some(recipient) => {
                    self.send_attempt(ctx, notification, channel, &recipient, 1)
                        .await?
                }
                None => {
                    self.notifications
                        .update_channel_delivery_status(
                            notification.id,
                            channel,
                            DeliveryStatus::Failed,
                            self.clock.now(),
                        )
                        .await?;
                    debug!(
                        subsystem = "delivery",
                        notification_id = %notification.id,
                        channel = %channel,
                        "No recipient for channel"
                    );
                    ChannelOutcome::NoRecipient
                }
            };
            report.channels.push((channel, outcome));
            if outcome == ChannelOutcome::Abandoned {
                break;
            }
        }

        if report.any_sent() {
            report.marked_sent = self.complete(notification).await?;
        }
        Ok(report)
    }

    pub(crate) async fn contact(
        &self,
        ctx: &CallContext,
        notification: &Notification,
        pending: &[Channel],
    ) -> Result<UserContact> {
        let empty = UserContact {
            user_id: notification.user_id,
            ..UserContact::default()
        };
        if pending.iter().all(|c| *c == Channel::InApp) {
            return Ok(empty);
        }
        Ok(self
            .directory
            .lookup(ctx, notification.user_id)
            .await?
            .unwrap_or(empty))
    }

    /// Claim `attempt_number` for one channel and run the driver.
    ///
    /// Shared by the unsent sweep (attempt 1) and the retry scheduler.
    #[instrument(
        skip(self, ctx, notification, recipient),
        fields(subsystem = "delivery", notification_id = %notification.id, channel = %channel, attempt = attempt_number)
    )]
    pub async fn send_attempt(
        &self,
        ctx: &CallContext,
        notification: &Notification,
        channel: Channel,
        recipient: &str,
        attempt_number: i32,
    ) -> Result<ChannelOutcome> {
        let start = Instant::now();
        let driver = self.drivers.get(channel);
        let new = NewDeliveryAttempt {
            notification_id: notification.id,
            channel,
            attempt_number,
            recipient: recipient.to_string(),
            provider: driver.as_ref().map(|d| d.provider().to_string()),
            max_retries: self.config.max_retries,
        };
        let attempt = match self.delivery_logs.append(new, self.clock.now()).await {
            Ok(attempt) => attempt,
            Err(Error::Duplicate(_)) => {
                debug!("Attempt already claimed");
                return Ok(ChannelOutcome::Claimed);
            }
            Err(e) => return Err(e),
        };
        self.delivery_logs
            .update(attempt.id, AttemptUpdate::Processing, self.clock.now())
            .await?;
        self.set_status(notification, channel, DeliveryStatus::Processing)
            .await?;

        let Some(driver) = driver else {
            let err = DriverError::transient(
                "provider_unavailable",
                format!("no driver registered for {channel}"),
            );
            return self.record_failure(notification, &attempt, &err).await;
        };

        let send_ctx = ctx.child(self.config.send_timeout);
        let content = notification.content_for(channel);
        match driver
            .send(&send_ctx, recipient, &content, &notification.payload)
            .await
        {
            Ok(receipt) => {
                self.delivery_logs
                    .update(
                        attempt.id,
                        AttemptUpdate::Sent {
                            provider_message_id: Some(receipt.provider_message_id),
                            response: receipt.response,
                        },
                        self.clock.now(),
                    )
                    .await?;
                self.set_status(notification, channel, DeliveryStatus::Sent)
                    .await?;
                info!(
                    provider = driver.provider(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Channel sent"
                );
                Ok(ChannelOutcome::Sent)
            }
            Err(_) if ctx.is_cancelled() => {
                warn!(attempt_id = %attempt.id, "Send cancelled, attempt left processing");
                Ok(ChannelOutcome::Abandoned)
            }
            Err(err) => self.record_failure(notification, &attempt, &err).await,
        }
    }

    async fn record_failure(
        &self,
        notification: &Notification,
        attempt: &DeliveryAttempt,
        err: &DriverError,
    ) -> Result<ChannelOutcome> {
        let now = self.clock.now();
        let failed = if err.is_transient() {
            self.delivery_logs
                .mark_failed_with_backoff(attempt.id, err.code(), err.message(), now)
                .await?
        } else {
            self.delivery_logs
                .update(
                    attempt.id,
                    AttemptUpdate::Failed {
                        error_code: err.code().to_string(),
                        error_message: err.message().to_string(),
                        retry_after: None,
                    },
                    now,
                )
                .await?
        };
        self.set_status(notification, attempt.channel, DeliveryStatus::Failed)
            .await?;
        warn!(
            error_code = err.code(),
            transient = err.is_transient(),
            retry_after = ?failed.retry_after,
            "Channel send failed"
        );
        Ok(ChannelOutcome::Failed)
    }

    async fn set_status(
        &self,
        notification: &Notification,
        channel: Channel,
        status: DeliveryStatus,
    ) -> Result<()> {
        self.notifications
            .update_channel_delivery_status(notification.id, channel, status, self.clock.now())
            .await
    }

    /// Mark the notification sent after a channel succeeded; campaign
    /// notifications also bump the campaign's delivered counter.
    pub(crate) async fn complete(&self, notification: &Notification) -> Result<bool> {
        let flipped = self
            .notifications
            .mark_sent(notification.id, self.clock.now())
            .await?;
        if flipped {
            if let Some(campaign_id) = notification.campaign_id() {
                if let Err(e) = self
                    .campaigns
                    .increment_delivered(campaign_id, self.clock.now())
                    .await
                {
                    warn!(
                        subsystem = "delivery",
                        campaign_id = %campaign_id,
                        error = %e,
                        "Failed to count campaign delivery"
                    );
                }
            }
        }
        Ok(flipped)
    }
}
