//! User-facing reads and edits of persisted notifications.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};
use uuid::Uuid;

use courier_core::{
    Channel, Clock, DeliveryAttempt, DeliveryLogRepository, DeliveryRate, Error, Notification,
    NotificationFilter, NotificationRepository, Page, Result,
};

/// A user's inbox plus delivery-log views for operators.
///
/// Notifications owned by someone else look exactly like missing ones.
#[derive(Clone)]
pub struct Inbox {
    notifications: Arc<dyn NotificationRepository>,
    delivery_logs: Arc<dyn DeliveryLogRepository>,
    clock: Arc<dyn Clock>,
}

impl Inbox {
    pub fn new(
        notifications: Arc<dyn NotificationRepository>,
        delivery_logs: Arc<dyn DeliveryLogRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            notifications,
            delivery_logs,
            clock,
        }
    }

    #[instrument(skip(self, filter), fields(subsystem = "dispatch", component = "inbox", user_id = %user_id))]
    pub async fn list(
        &self,
        user_id: Uuid,
        filter: &NotificationFilter,
    ) -> Result<Page<Notification>> {
        self.notifications
            .list(user_id, &filter.normalized(), self.clock.now())
            .await
    }

    /// One notification; `Expired` once past its expiry.
    pub async fn get(&self, user_id: Uuid, id: Uuid) -> Result<Notification> {
        let n = self.owned(user_id, id).await?;
        if n.is_expired(self.clock.now()) {
            return Err(Error::Expired(id));
        }
        Ok(n)
    }

    /// Mark the listed notifications read; ids not owned are skipped.
    pub async fn mark_read(&self, user_id: Uuid, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let updated = self
            .notifications
            .mark_read(user_id, ids, self.clock.now())
            .await?;
        debug!(
            subsystem = "dispatch",
            user_id = %user_id,
            requested = ids.len(),
            updated,
            "Marked notifications read"
        );
        Ok(updated)
    }

    pub async fn mark_all_read(&self, user_id: Uuid) -> Result<u64> {
        self.notifications
            .mark_all_read(user_id, self.clock.now())
            .await
    }

    pub async fn delete(&self, user_id: Uuid, id: Uuid) -> Result<()> {
        self.owned(user_id, id).await?;
        if !self.notifications.delete(id).await? {
            return Err(Error::NotFound(format!("notification {id}")));
        }
        Ok(())
    }

    pub async fn unread_count(&self, user_id: Uuid) -> Result<i64> {
        self.notifications
            .unread_count(user_id, self.clock.now())
            .await
    }

    /// Delivery attempts of an owned notification.
    pub async fn attempts(&self, user_id: Uuid, id: Uuid) -> Result<Vec<DeliveryAttempt>> {
        self.owned(user_id, id).await?;
        self.delivery_logs.list_by_notification(id).await
    }

    /// Outcome totals across all users for attempts queued in `[from, to)`.
    pub async fn delivery_rate(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        channel: Option<Channel>,
    ) -> Result<DeliveryRate> {
        if to <= from {
            return Err(Error::InvalidInput(
                "delivery rate window must end after it starts".into(),
            ));
        }
        self.delivery_logs.delivery_rate(from, to, channel).await
    }

    async fn owned(&self, user_id: Uuid, id: Uuid) -> Result<Notification> {
        match self.notifications.get_by_id(id).await? {
            Some(n) if n.user_id == user_id => Ok(n),
            _ => Err(Error::NotFound(format!("notification {id}"))),
        }
    }
}
