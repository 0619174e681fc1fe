//! Core traits for repository abstraction and outbound ports.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::context::CallContext;
use crate::error::{DriverError, Error, Result};
use crate::models::*;
use crate::schedule;

// =============================================================================
// NOTIFICATIONS
// =============================================================================

/// Repository for notification rows.
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    /// Insert a notification with `is_sent = false` and an empty status map.
    ///
    /// Returns `Error::Duplicate` when a live notification already holds
    /// the idempotency key. A key held only by an expired row is released.
    async fn create(&self, new: NewNotification, now: DateTime<Utc>) -> Result<Notification>;

    /// Fetch a notification by id, expired or not.
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Notification>>;

    /// Fetch the live notification holding `key`.
    async fn get_by_idempotency_key(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Notification>>;

    /// Page through a user's unexpired notifications.
    async fn list(
        &self,
        user_id: Uuid,
        filter: &NotificationFilter,
        now: DateTime<Utc>,
    ) -> Result<Page<Notification>>;

    /// Unsent, unexpired notifications with at least one channel not yet
    /// attempted, ordered by priority desc then created_at asc.
    async fn list_unsent(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Notification>>;

    /// Mark the given notifications read when they belong to `user_id`.
    async fn mark_read(&self, user_id: Uuid, ids: &[Uuid], now: DateTime<Utc>) -> Result<u64>;

    async fn mark_all_read(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<u64>;

    /// Set `is_sent`/`sent_at`; returns false when already sent.
    async fn mark_sent(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    async fn update_channel_delivery_status(
        &self,
        id: Uuid,
        channel: Channel,
        status: DeliveryStatus,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Delete notifications whose expiry is before `before`.
    async fn delete_expired(&self, before: DateTime<Utc>) -> Result<u64>;

    /// Delete read notifications read before `before`.
    async fn delete_old_read(&self, before: DateTime<Utc>) -> Result<u64>;

    async fn unread_count(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<i64>;
}

// =============================================================================
// DELIVERY ATTEMPTS
// =============================================================================

/// Repository for the append-only delivery log.
#[async_trait]
pub trait DeliveryLogRepository: Send + Sync {
    /// Append a `queued` attempt.
    ///
    /// Fails with `Error::Duplicate` unless `attempt_number` is exactly one
    /// past the latest attempt for the (notification, channel) pair; this
    /// is how concurrent workers claim a channel.
    async fn append(&self, new: NewDeliveryAttempt, now: DateTime<Utc>)
        -> Result<DeliveryAttempt>;

    async fn get(&self, id: Uuid) -> Result<Option<DeliveryAttempt>>;

    /// Apply a status change; terminal rows only accept engagement events.
    async fn update(
        &self,
        id: Uuid,
        update: AttemptUpdate,
        now: DateTime<Utc>,
    ) -> Result<DeliveryAttempt>;

    /// Mark failed and schedule the next try from the attempt's own number
    /// and cap.
    async fn mark_failed_with_backoff(
        &self,
        id: Uuid,
        error_code: &str,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<DeliveryAttempt> {
        let attempt = self
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("delivery attempt {id}")))?;
        let retry_after = schedule::retry_after(attempt.attempt_number, attempt.max_retries, now);
        self.update(
            id,
            AttemptUpdate::Failed {
                error_code: error_code.to_string(),
                error_message: error_message.to_string(),
                retry_after,
            },
            now,
        )
        .await
    }

    async fn mark_delivered(&self, id: Uuid, now: DateTime<Utc>) -> Result<DeliveryAttempt> {
        self.update(id, AttemptUpdate::Delivered, now).await
    }

    /// Failed attempts under the cap whose `retry_after` has passed.
    async fn list_retry_eligible(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DeliveryAttempt>>;

    /// Take ownership of a retry by clearing `retry_after`; false if another
    /// scheduler got there first.
    async fn claim_retry(&self, id: Uuid) -> Result<bool>;

    /// Give a claimed retry back by restoring `retry_after`; false if the
    /// attempt is no longer a claimed failure.
    async fn release_retry(&self, id: Uuid, retry_after: DateTime<Utc>) -> Result<bool>;

    /// Attempts for a notification ordered by channel then attempt number.
    async fn list_by_notification(&self, notification_id: Uuid) -> Result<Vec<DeliveryAttempt>>;

    /// Queued or processing attempts untouched since `before`.
    async fn list_stale(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<DeliveryAttempt>>;

    async fn find_by_provider_message_id(
        &self,
        provider: &str,
        provider_message_id: &str,
    ) -> Result<Option<DeliveryAttempt>>;

    /// Outcome totals for attempts queued in `[from, to)`.
    async fn delivery_rate(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        channel: Option<Channel>,
    ) -> Result<DeliveryRate>;
}

// =============================================================================
// TEMPLATES
// =============================================================================

#[async_trait]
pub trait TemplateRepository: Send + Sync {
    /// Insert at version 1; `Error::Duplicate` when the code is taken.
    async fn create(
        &self,
        req: &CreateTemplateRequest,
        now: DateTime<Utc>,
    ) -> Result<NotificationTemplate>;

    async fn get(&self, id: Uuid) -> Result<Option<NotificationTemplate>>;

    async fn get_by_code(&self, code: &str) -> Result<Option<NotificationTemplate>>;

    async fn list(&self, active_only: bool) -> Result<Vec<NotificationTemplate>>;

    async fn list_active(&self) -> Result<Vec<NotificationTemplate>> {
        self.list(true).await
    }

    /// Apply a partial update without touching the version.
    async fn update(
        &self,
        id: Uuid,
        req: &UpdateTemplateRequest,
        now: DateTime<Utc>,
    ) -> Result<NotificationTemplate>;

    /// Bump the version and return the new value.
    async fn increment_version(&self, id: Uuid, now: DateTime<Utc>) -> Result<i32>;

    async fn delete(&self, id: Uuid) -> Result<bool>;
}

// =============================================================================
// PREFERENCES
// =============================================================================

#[async_trait]
pub trait PreferenceRepository: Send + Sync {
    async fn get(&self, user_id: Uuid) -> Result<Option<NotificationPreferences>>;

    async fn upsert(
        &self,
        prefs: &NotificationPreferences,
        now: DateTime<Utc>,
    ) -> Result<NotificationPreferences>;

    /// Missing rows allow every channel.
    async fn channel_enabled(
        &self,
        user_id: Uuid,
        notification_type: &str,
        channel: Channel,
    ) -> Result<bool> {
        Ok(self
            .get(user_id)
            .await?
            .map_or(true, |p| p.channel_enabled(notification_type, channel)))
    }

    /// Missing rows are never in quiet hours.
    async fn in_quiet_hours(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .get(user_id)
            .await?
            .is_some_and(|p| p.in_quiet_hours(now)))
    }

    /// Missing rows are never in do-not-disturb.
    async fn do_not_disturb(&self, user_id: Uuid) -> Result<bool> {
        Ok(self.get(user_id).await?.is_some_and(|p| p.do_not_disturb))
    }
}

// =============================================================================
// RATE WINDOWS
// =============================================================================

#[async_trait]
pub trait RateLimitRepository: Send + Sync {
    /// Atomically reset an expired window, then count one send if the window
    /// is under `max`. Returns whether the send is allowed.
    async fn check_and_increment(
        &self,
        scope: RateScope,
        scope_id: &str,
        max: i32,
        window_minutes: i32,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn get_window(
        &self,
        scope: RateScope,
        scope_id: &str,
        window_minutes: i32,
    ) -> Result<Option<RateWindow>>;

    /// Delete windows that ended before `before`.
    async fn delete_expired_windows(&self, before: DateTime<Utc>) -> Result<u64>;
}

// =============================================================================
// CAMPAIGNS
// =============================================================================

#[async_trait]
pub trait CampaignRepository: Send + Sync {
    async fn create(
        &self,
        req: &CreateCampaignRequest,
        status: CampaignStatus,
        now: DateTime<Utc>,
    ) -> Result<Campaign>;

    async fn get(&self, id: Uuid) -> Result<Option<Campaign>>;

    async fn list(
        &self,
        status: Option<CampaignStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Campaign>>;

    /// Edit a draft or scheduled campaign; `Error::Conflict` otherwise.
    async fn update(
        &self,
        id: Uuid,
        req: &UpdateCampaignRequest,
        now: DateTime<Utc>,
    ) -> Result<Campaign>;

    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Scheduled campaigns whose time has come.
    async fn list_scheduled_due(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>>;

    async fn list_running(&self) -> Result<Vec<Campaign>>;

    /// Move from one of `from` to `to`, stamping the matching timestamp.
    /// `Error::Conflict` when the current status is not in `from`.
    async fn transition(
        &self,
        id: Uuid,
        from: &[CampaignStatus],
        to: CampaignStatus,
        now: DateTime<Utc>,
    ) -> Result<Campaign>;

    /// Add batch totals and advance the cursor, only if the campaign is
    /// running and still at `expected_cursor`.
    async fn increment_progress(
        &self,
        id: Uuid,
        expected_cursor: i64,
        advance: i64,
        delta: &CampaignProgress,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Count one more delivered notification.
    async fn increment_delivered(&self, id: Uuid, now: DateTime<Utc>) -> Result<()>;
}

// =============================================================================
// OUTBOUND PORTS
// =============================================================================

/// Adapter from a channel to an external gateway.
#[async_trait]
pub trait ChannelDriver: Send + Sync {
    fn channel(&self) -> Channel;

    /// Provider name recorded on attempts.
    fn provider(&self) -> &str;

    /// Send one message, honouring the context's deadline.
    async fn send(
        &self,
        ctx: &CallContext,
        recipient: &str,
        content: &RenderedContent,
        payload: &JsonMap,
    ) -> std::result::Result<SendReceipt, DriverError>;
}

/// Read-only view of users, owned elsewhere.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn lookup(&self, ctx: &CallContext, user_id: Uuid) -> Result<Option<UserContact>>;

    /// Page of user ids matching a directory-backed target, ordered by id.
    async fn list_audience(
        &self,
        ctx: &CallContext,
        target: &CampaignTarget,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Uuid>>;
}
