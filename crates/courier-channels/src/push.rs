//! Push driver posting to an HTTP push gateway.
//!
//! The request body is signed with `PUSH_GATEWAY_KEY` (HMAC-SHA256, hex,
//! `X-Courier-Signature: sha256=...`) so the gateway can authenticate the
//! sender without a shared bearer token travelling on every request.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use courier_core::{
    CallContext, Channel, ChannelDriver, DriverError, JsonMap, RenderedContent, SendReceipt,
};

use crate::gateway::{GatewayAuth, GatewayClient, DEFAULT_GATEWAY_TIMEOUT_SECS};

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub gateway_url: String,
    pub signing_key: Option<String>,
    pub timeout: Duration,
}

impl PushConfig {
    pub fn new(gateway_url: impl Into<String>) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            signing_key: None,
            timeout: Duration::from_secs(DEFAULT_GATEWAY_TIMEOUT_SECS),
        }
    }

    /// Load from `PUSH_GATEWAY_URL` and `PUSH_GATEWAY_KEY`.
    /// Returns `None` when no gateway URL is set.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("PUSH_GATEWAY_URL")
            .ok()
            .filter(|u| !u.trim().is_empty())?;
        Some(Self {
            signing_key: std::env::var("PUSH_GATEWAY_KEY").ok(),
            ..Self::new(url)
        })
    }

    pub fn with_signing_key(mut self, key: impl Into<String>) -> Self {
        self.signing_key = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Serialize)]
struct PushRequest<'a> {
    token: &'a str,
    title: &'a str,
    body: &'a str,
    data: &'a JsonMap,
}

pub struct PushDriver {
    gateway: GatewayClient,
}

impl PushDriver {
    pub fn new(config: PushConfig) -> Self {
        let auth = config
            .signing_key
            .map(GatewayAuth::Signed)
            .unwrap_or_default();
        Self {
            gateway: GatewayClient::new(config.gateway_url, auth, config.timeout),
        }
    }
}

#[async_trait]
impl ChannelDriver for PushDriver {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    fn provider(&self) -> &str {
        "push_gateway"
    }

    async fn send(
        &self,
        ctx: &CallContext,
        recipient: &str,
        content: &RenderedContent,
        payload: &JsonMap,
    ) -> Result<SendReceipt, DriverError> {
        if recipient.trim().is_empty() {
            return Err(DriverError::permanent(
                "invalid_recipient",
                "device token is empty",
            ));
        }
        let request = PushRequest {
            token: recipient,
            title: &content.title,
            body: &content.body,
            data: payload,
        };
        let body = serde_json::to_value(&request)
            .map_err(|e| DriverError::permanent("encode_failed", e.to_string()))?;
        self.gateway.post(ctx, &body).await
    }
}
