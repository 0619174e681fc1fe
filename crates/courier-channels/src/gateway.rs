//! JSON-over-HTTP gateway client shared by the SMS and push drivers.

use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde_json::Value as JsonValue;
use sha2::Sha256;
use tracing::debug;

use courier_core::{CallContext, DriverError, SendReceipt};

type HmacSha256 = Hmac<Sha256>;

/// Upper bound for one gateway request when the caller sets no deadline.
pub const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 10;

/// Header carrying the body signature when a signing key is configured.
pub const SIGNATURE_HEADER: &str = "X-Courier-Signature";

/// How requests are authenticated against the gateway.
#[derive(Debug, Clone, Default)]
pub enum GatewayAuth {
    #[default]
    None,
    /// `Authorization: Bearer <token>`
    Bearer(String),
    /// HMAC-SHA256 of the body in [`SIGNATURE_HEADER`] as `sha256=<hex>`.
    Signed(String),
}

/// A POST endpoint that accepts one message per request.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    client: Client,
    url: String,
    auth: GatewayAuth,
}

impl GatewayClient {
    pub fn new(url: impl Into<String>, auth: GatewayAuth, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
            auth,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Post `body` and return the gateway's message id.
    pub async fn post(
        &self,
        ctx: &CallContext,
        body: &JsonValue,
    ) -> Result<SendReceipt, DriverError> {
        let start = Instant::now();
        let payload = serde_json::to_string(body)
            .map_err(|e| DriverError::permanent("encode_failed", e.to_string()))?;

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json");
        match &self.auth {
            GatewayAuth::None => {}
            GatewayAuth::Bearer(token) => request = request.bearer_auth(token),
            GatewayAuth::Signed(secret) => {
                request = request.header(SIGNATURE_HEADER, sign(secret, &payload)?);
            }
        }
        if let Some(remaining) = ctx.remaining() {
            request = request.timeout(remaining);
        }

        let response = ctx
            .run::<_, _, DriverError>(async {
                request.body(payload).send().await.map_err(classify_transport)
            })
            .await?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        debug!(
            subsystem = "channels",
            component = "gateway",
            status = status.as_u16(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Gateway responded"
        );

        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        let parsed: Option<JsonValue> = serde_json::from_str(&text).ok();
        let message_id = parsed
            .as_ref()
            .and_then(extract_message_id)
            .ok_or_else(|| {
                DriverError::transient(
                    "missing_message_id",
                    "gateway accepted the request without a message id",
                )
            })?;

        Ok(SendReceipt {
            provider_message_id: message_id,
            response: parsed,
        })
    }
}

fn sign(secret: &str, payload: &str) -> Result<String, DriverError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| DriverError::permanent("signing_key_invalid", e.to_string()))?;
    mac.update(payload.as_bytes());
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

fn extract_message_id(body: &JsonValue) -> Option<String> {
    ["message_id", "id", "messageId"]
        .iter()
        .find_map(|k| body.get(*k))
        .and_then(|v| match v {
            JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// Network faults are always worth retrying.
pub(crate) fn classify_transport(e: reqwest::Error) -> DriverError {
    if e.is_timeout() {
        DriverError::transient("timeout", e.to_string())
    } else if e.is_connect() {
        DriverError::transient("connect_failed", e.to_string())
    } else {
        DriverError::transient("network", e.to_string())
    }
}

/// 5xx and 429 are transient; the remaining 4xx mean the message itself
/// or our credentials were rejected.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> DriverError {
    let code = format!("http_{}", status.as_u16());
    let message = if body.is_empty() {
        status.canonical_reason().unwrap_or("error").to_string()
    } else {
        body.chars().take(512).collect()
    };
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        DriverError::transient(code, message)
    } else {
        DriverError::permanent(code, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down").is_transient());
        let bad = classify_status(StatusCode::UNPROCESSABLE_ENTITY, "invalid number");
        assert!(!bad.is_transient());
        assert_eq!(bad.code(), "http_422");
        assert_eq!(bad.message(), "invalid number");
    }

    #[test]
    fn test_extract_message_id_variants() {
        assert_eq!(
            extract_message_id(&json!({"message_id": "m-1"})).as_deref(),
            Some("m-1")
        );
        assert_eq!(extract_message_id(&json!({"id": 42})).as_deref(), Some("42"));
        assert_eq!(extract_message_id(&json!({"id": ""})), None);
        assert_eq!(extract_message_id(&json!({"ok": true})), None);
    }

    #[test]
    fn test_signature_is_stable_hex() {
        let a = sign("secret", "{\"to\":\"x\"}").unwrap();
        let b = sign("secret", "{\"to\":\"x\"}").unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("sha256="));
        assert_eq!(a.len(), "sha256=".len() + 64);
    }
}
