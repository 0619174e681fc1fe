//! Gateway callbacks about messages already handed off.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, instrument, warn};

use courier_core::{
    AttemptUpdate, Clock, DeliveryAttempt, DeliveryLogRepository, Error, NotificationRepository,
    Result,
};

/// What the gateway reported.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReceiptEvent {
    Delivered,
    Bounced {
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    Opened,
    Clicked,
}

impl ReceiptEvent {
    fn into_update(self) -> AttemptUpdate {
        match self {
            ReceiptEvent::Delivered => AttemptUpdate::Delivered,
            ReceiptEvent::Bounced { code, message } => AttemptUpdate::Bounced {
                error_code: code.unwrap_or_else(|| "bounced".to_string()),
                error_message: message.unwrap_or_default(),
            },
            ReceiptEvent::Opened => AttemptUpdate::Opened,
            ReceiptEvent::Clicked => AttemptUpdate::Clicked,
        }
    }
}

/// Applies receipts to the attempt carrying the provider's message id and
/// mirrors the result onto the notification's channel status.
#[derive(Clone)]
pub struct DeliveryReceipts {
    delivery_logs: Arc<dyn DeliveryLogRepository>,
    notifications: Arc<dyn NotificationRepository>,
    clock: Arc<dyn Clock>,
}

impl DeliveryReceipts {
    pub fn new(
        delivery_logs: Arc<dyn DeliveryLogRepository>,
        notifications: Arc<dyn NotificationRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            delivery_logs,
            notifications,
            clock,
        }
    }

    /// Record one receipt.
    ///
    /// Delivered and bounced are final; a repeat of the final status is
    /// accepted as a no-op. Opened and clicked only apply to rows the
    /// gateway accepted.
    #[instrument(skip(self, event), fields(subsystem = "dispatch", component = "receipts"))]
    pub async fn record(
        &self,
        provider: &str,
        provider_message_id: &str,
        event: ReceiptEvent,
    ) -> Result<DeliveryAttempt> {
        let attempt = self
            .delivery_logs
            .find_by_provider_message_id(provider, provider_message_id)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("delivery {provider}/{provider_message_id}"))
            })?;

        let update = event.into_update();
        if attempt.status.is_terminal() && attempt.status == update.status() {
            return Ok(attempt);
        }
        if update.is_engagement() && !attempt.status.is_success() {
            warn!(
                attempt_id = %attempt.id,
                status = %attempt.status,
                "Engagement receipt for an undelivered attempt"
            );
            return Err(Error::Conflict(format!(
                "attempt {} is {} and cannot record engagement",
                attempt.id, attempt.status
            )));
        }

        let now = self.clock.now();
        let updated = self.delivery_logs.update(attempt.id, update, now).await?;
        self.notifications
            .update_channel_delivery_status(
                updated.notification_id,
                updated.channel,
                updated.status,
                now,
            )
            .await?;

        info!(
            attempt_id = %updated.id,
            notification_id = %updated.notification_id,
            channel = %updated.channel,
            status = %updated.status,
            "Receipt recorded"
        );
        Ok(updated)
    }
}
