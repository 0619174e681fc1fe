//! In-app driver. The persisted notification is the delivery, so sending
//! only acknowledges it.

use async_trait::async_trait;

use courier_core::{
    CallContext, Channel, ChannelDriver, DriverError, JsonMap, RenderedContent, SendReceipt,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct InAppDriver;

#[async_trait]
impl ChannelDriver for InAppDriver {
    fn channel(&self) -> Channel {
        Channel::InApp
    }

    fn provider(&self) -> &str {
        "in_app"
    }

    /// `recipient` is the notification id, echoed back as the message id.
    async fn send(
        &self,
        ctx: &CallContext,
        recipient: &str,
        _content: &RenderedContent,
        _payload: &JsonMap,
    ) -> Result<SendReceipt, DriverError> {
        ctx.check()?;
        Ok(SendReceipt::new(recipient))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echoes_notification_id() {
        let receipt = InAppDriver
            .send(
                &CallContext::background(),
                "n-1",
                &RenderedContent::default(),
                &JsonMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(receipt.provider_message_id, "n-1");
    }

    #[tokio::test]
    async fn test_cancelled_context_is_transient() {
        let ctx = CallContext::background();
        ctx.cancel();
        let err = InAppDriver
            .send(&ctx, "n-1", &RenderedContent::default(), &JsonMap::new())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.code(), "cancelled");
    }
}
