//! Email driver over SMTP.
//!
//! [`EmailDriver`] wraps the `lettre` async SMTP transport. The transport is
//! built once and shared by every send. If `SMTP_HOST` is not set,
//! [`EmailConfig::from_env`] returns `None` and the driver is not registered.

use std::time::Instant;

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::{debug, info};
use uuid::Uuid;

use courier_core::{
    CallContext, Channel, ChannelDriver, DriverError, Error, JsonMap, RenderedContent, Result,
    SendReceipt,
};

/// Default SMTP port (STARTTLS).
const DEFAULT_SMTP_PORT: u16 = 587;

/// Default sender address when `SMTP_FROM` is not set.
const DEFAULT_FROM_ADDRESS: &str = "noreply@localhost";

/// Configuration for the SMTP email driver.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// SMTP server hostname.
    pub smtp_host: String,
    /// SMTP server port (defaults to 587).
    pub smtp_port: u16,
    /// RFC 5322 "From" address.
    pub from_address: String,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<String>,
}

impl EmailConfig {
    pub fn new(smtp_host: impl Into<String>) -> Self {
        Self {
            smtp_host: smtp_host.into(),
            smtp_port: DEFAULT_SMTP_PORT,
            from_address: DEFAULT_FROM_ADDRESS.to_string(),
            smtp_user: None,
            smtp_password: None,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Returns `None` if `SMTP_HOST` is not set.
    ///
    /// | Variable        | Required | Default             |
    /// |-----------------|----------|---------------------|
    /// | `SMTP_HOST`     | yes      |                     |
    /// | `SMTP_PORT`     | no       | `587`               |
    /// | `SMTP_FROM`     | no       | `noreply@localhost` |
    /// | `SMTP_USER`     | no       |                     |
    /// | `SMTP_PASSWORD` | no       |                     |
    pub fn from_env() -> Option<Self> {
        let smtp_host = std::env::var("SMTP_HOST")
            .ok()
            .filter(|h| !h.trim().is_empty())?;
        Some(Self {
            smtp_host,
            smtp_port: std::env::var("SMTP_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_SMTP_PORT),
            from_address: std::env::var("SMTP_FROM")
                .unwrap_or_else(|_| DEFAULT_FROM_ADDRESS.to_string()),
            smtp_user: std::env::var("SMTP_USER").ok(),
            smtp_password: std::env::var("SMTP_PASSWORD").ok(),
        })
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.smtp_port = port;
        self
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from_address = from.into();
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.smtp_user = Some(user.into());
        self.smtp_password = Some(password.into());
        self
    }
}

/// Sends rendered email content through one SMTP relay.
pub struct EmailDriver {
    from: Mailbox,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl EmailDriver {
    /// Build the transport. Fails on an unparseable sender or relay host.
    pub fn new(config: EmailConfig) -> Result<Self> {
        let from: Mailbox = config
            .from_address
            .parse()
            .map_err(|e| Error::Config(format!("SMTP_FROM {}: {e}", config.from_address)))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| Error::Config(format!("SMTP_HOST {}: {e}", config.smtp_host)))?
            .port(config.smtp_port);

        if let (Some(user), Some(pass)) = (&config.smtp_user, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        info!(
            subsystem = "channels",
            component = "email",
            host = %config.smtp_host,
            port = config.smtp_port,
            "SMTP transport configured"
        );

        Ok(Self {
            from,
            mailer: builder.build(),
        })
    }

    fn build_message(
        &self,
        recipient: &str,
        content: &RenderedContent,
        message_id: &str,
    ) -> std::result::Result<Message, DriverError> {
        let to: Mailbox = recipient
            .parse()
            .map_err(|e| DriverError::permanent("invalid_recipient", format!("{recipient}: {e}")))?;

        let builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(content.title.clone())
            .message_id(Some(message_id.to_string()));

        let built = match content.text_body.as_deref() {
            Some(text) if text != content.body => builder.multipart(
                MultiPart::alternative_plain_html(text.to_string(), content.body.clone()),
            ),
            Some(text) => builder
                .header(ContentType::TEXT_PLAIN)
                .body(text.to_string()),
            None => builder
                .header(ContentType::TEXT_HTML)
                .body(content.body.clone()),
        };
        built.map_err(|e| DriverError::permanent("message_build_failed", e.to_string()))
    }
}

#[async_trait]
impl ChannelDriver for EmailDriver {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn provider(&self) -> &str {
        "smtp"
    }

    async fn send(
        &self,
        ctx: &CallContext,
        recipient: &str,
        content: &RenderedContent,
        _payload: &JsonMap,
    ) -> std::result::Result<SendReceipt, DriverError> {
        let start = Instant::now();
        let message_id = format!("<{}@courier>", Uuid::new_v4());
        let email = self.build_message(recipient, content, &message_id)?;

        let response = ctx
            .run::<_, _, DriverError>(async {
                self.mailer.send(email).await.map_err(classify_smtp)
            })
            .await?;

        debug!(
            subsystem = "channels",
            component = "email",
            code = %response.code(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Email accepted by relay"
        );

        Ok(SendReceipt {
            provider_message_id: message_id,
            response: Some(serde_json::json!({
                "code": response.code().to_string(),
                "message": response.message().collect::<Vec<_>>(),
            })),
        })
    }
}

/// 5xx replies are permanent; connection, TLS and 4xx faults are retried.
fn classify_smtp(e: lettre::transport::smtp::Error) -> DriverError {
    if e.is_permanent() {
        DriverError::permanent("smtp_rejected", e.to_string())
    } else if e.is_timeout() {
        DriverError::transient("timeout", e.to_string())
    } else {
        DriverError::transient("smtp_unavailable", e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> EmailDriver {
        EmailDriver::new(EmailConfig::new("smtp.example.test").with_from("shop@example.test"))
            .unwrap()
    }

    #[test]
    fn test_config_builders() {
        let cfg = EmailConfig::new("smtp.example.test")
            .with_port(2525)
            .with_credentials("u", "p");
        assert_eq!(cfg.smtp_port, 2525);
        assert_eq!(cfg.from_address, DEFAULT_FROM_ADDRESS);
        assert_eq!(cfg.smtp_user.as_deref(), Some("u"));
    }

    #[test]
    fn test_bad_sender_is_config_error() {
        let err = EmailDriver::new(EmailConfig::new("smtp.example.test").with_from("not an address"))
            .err()
            .unwrap();
        assert_eq!(err.code(), "STORE_ERROR");
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_invalid_recipient_is_permanent() {
        let d = driver();
        let content = RenderedContent::new("Hello", "<p>Hi</p>");
        let err = d
            .send(&CallContext::background(), "nobody", &content, &JsonMap::new())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(err.code(), "invalid_recipient");
    }

    #[test]
    fn test_message_with_text_alternative() {
        let d = driver();
        let mut content = RenderedContent::new("Shipped", "<p>Order A-100</p>");
        content.text_body = Some("Order A-100".into());
        let msg = d
            .build_message("ada@example.test", &content, "<m1@courier>")
            .unwrap();
        let raw = String::from_utf8(msg.formatted()).unwrap();
        assert!(raw.contains("multipart/alternative"));
        assert!(raw.contains("Subject: Shipped"));
        assert!(raw.contains("Message-ID: <m1@courier>"));
    }

    #[test]
    fn test_plain_text_only_message() {
        let d = driver();
        let mut content = RenderedContent::new("Receipt", "Thanks");
        content.text_body = Some("Thanks".into());
        let msg = d
            .build_message("ada@example.test", &content, "<m2@courier>")
            .unwrap();
        let raw = String::from_utf8(msg.formatted()).unwrap();
        assert!(raw.contains("text/plain"));
        assert!(!raw.contains("multipart"));
    }
}
