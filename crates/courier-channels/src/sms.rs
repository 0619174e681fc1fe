//! SMS driver posting to an HTTP gateway.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use courier_core::{
    CallContext, Channel, ChannelDriver, DriverError, JsonMap, RenderedContent, SendReceipt,
};

use crate::gateway::{GatewayAuth, GatewayClient, DEFAULT_GATEWAY_TIMEOUT_SECS};

/// Longest body the gateway will accept (ten concatenated segments).
pub const MAX_SMS_CHARS: usize = 1530;

#[derive(Debug, Clone)]
pub struct SmsConfig {
    pub gateway_url: String,
    pub token: Option<String>,
    pub sender_id: Option<String>,
    pub timeout: Duration,
}

impl SmsConfig {
    pub fn new(gateway_url: impl Into<String>) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            token: None,
            sender_id: None,
            timeout: Duration::from_secs(DEFAULT_GATEWAY_TIMEOUT_SECS),
        }
    }

    /// Load from `SMS_GATEWAY_URL`, `SMS_GATEWAY_TOKEN` and `SMS_SENDER_ID`.
    /// Returns `None` when no gateway URL is set.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("SMS_GATEWAY_URL")
            .ok()
            .filter(|u| !u.trim().is_empty())?;
        Some(Self {
            token: std::env::var("SMS_GATEWAY_TOKEN").ok(),
            sender_id: std::env::var("SMS_SENDER_ID").ok(),
            ..Self::new(url)
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_sender_id(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Serialize)]
struct SmsRequest<'a> {
    to: &'a str,
    body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<&'a str>,
}

pub struct SmsDriver {
    gateway: GatewayClient,
    sender_id: Option<String>,
}

impl SmsDriver {
    pub fn new(config: SmsConfig) -> Self {
        let auth = config.token.map(GatewayAuth::Bearer).unwrap_or_default();
        Self {
            gateway: GatewayClient::new(config.gateway_url, auth, config.timeout),
            sender_id: config.sender_id,
        }
    }
}

/// E.164-ish: optional leading `+`, then 6 to 15 digits.
fn valid_phone(phone: &str) -> bool {
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    (6..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
}

#[async_trait]
impl ChannelDriver for SmsDriver {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn provider(&self) -> &str {
        "sms_gateway"
    }

    async fn send(
        &self,
        ctx: &CallContext,
        recipient: &str,
        content: &RenderedContent,
        _payload: &JsonMap,
    ) -> Result<SendReceipt, DriverError> {
        if !valid_phone(recipient) {
            return Err(DriverError::permanent(
                "invalid_recipient",
                format!("not a phone number: {recipient}"),
            ));
        }
        if content.body.trim().is_empty() {
            return Err(DriverError::permanent("empty_body", "sms body is empty"));
        }
        if content.body.chars().count() > MAX_SMS_CHARS {
            return Err(DriverError::permanent(
                "body_too_long",
                format!("sms body exceeds {MAX_SMS_CHARS} characters"),
            ));
        }

        let request = SmsRequest {
            to: recipient,
            body: &content.body,
            from: self.sender_id.as_deref(),
        };
        let body = serde_json::to_value(&request)
            .map_err(|e| DriverError::permanent("encode_failed", e.to_string()))?;
        self.gateway.post(ctx, &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_phone() {
        assert!(valid_phone("+4915112345678"));
        assert!(valid_phone("5551234"));
        assert!(!valid_phone("+49 151 1234"));
        assert!(!valid_phone("12345"));
        assert!(!valid_phone(""));
    }

    #[tokio::test]
    async fn test_rejects_before_calling_gateway() {
        // Port 9 is never contacted: validation fails first.
        let driver = SmsDriver::new(SmsConfig::new("http://127.0.0.1:9/sms"));
        let ctx = CallContext::background();
        let err = driver
            .send(&ctx, "abc", &RenderedContent::new("", "hi"), &JsonMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_recipient");

        let err = driver
            .send(&ctx, "+15551234567", &RenderedContent::new("", " "), &JsonMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "empty_body");
    }
}
