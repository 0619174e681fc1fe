//! Error types for courier.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using courier's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for courier operations.
///
/// Every variant maps onto one of the stable surface codes returned by
/// [`Error::code`]; adapters translate those codes into their own status
/// representation.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found (also used for ownership mismatches)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Notification has passed its expiry time
    #[error("Notification expired: {0}")]
    Expired(Uuid),

    /// Notification type code is malformed
    #[error("Invalid notification type: {0}")]
    InvalidType(String),

    /// Channel name is not one of in_app, email, push, sms
    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    /// A rate window denied the request
    #[error("Rate limited: {scope} {scope_id}")]
    RateLimited { scope: String, scope_id: String },

    /// No template with the given code
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    /// Template exists but is not active
    #[error("Template inactive: {0}")]
    TemplateInactive(String),

    /// Required template variables absent from the data map
    #[error("Missing variables: {}", .0.join(", "))]
    MissingVariables(Vec<String>),

    /// No campaign with the given id
    #[error("Campaign not found: {0}")]
    CampaignNotFound(Uuid),

    /// Campaign target selector is unknown or malformed
    #[error("Invalid target type: {0}")]
    InvalidTargetType(String),

    /// A channel driver rejected the message
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    /// A gateway or driver is not reachable or not configured
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Every requested channel was filtered out or failed to render
    #[error("No channels available")]
    NoChannels,

    /// Campaign state does not permit the requested transition
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Uniqueness violation (template code, idempotency key)
    #[error("Duplicate: {0}")]
    Duplicate(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The caller's deadline elapsed before the operation finished
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// The caller's context was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable surface code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NOT_FOUND",
            Error::Expired(_) => "EXPIRED",
            Error::InvalidType(_) => "INVALID_TYPE",
            Error::InvalidChannel(_) => "INVALID_CHANNEL",
            Error::RateLimited { .. } => "RATE_LIMITED",
            Error::TemplateNotFound(_) => "TEMPLATE_NOT_FOUND",
            Error::TemplateInactive(_) => "TEMPLATE_INACTIVE",
            Error::MissingVariables(_) => "MISSING_VARIABLES",
            Error::CampaignNotFound(_) => "CAMPAIGN_NOT_FOUND",
            Error::InvalidTargetType(_) => "INVALID_TARGET_TYPE",
            Error::DeliveryFailed(_) => "DELIVERY_FAILED",
            Error::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            Error::NoChannels => "NO_CHANNELS",
            Error::Conflict(_) => "CONFLICT",
            Error::Duplicate(_) => "DUPLICATE",
            Error::InvalidInput(_) => "INVALID_INPUT",
            Error::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Error::Cancelled => "CANCELLED",
            Error::Database(_)
            | Error::Serialization(_)
            | Error::Config(_)
            | Error::Internal(_) => "STORE_ERROR",
        }
    }

    /// Whether this error indicates an infrastructure fault rather than a
    /// decision about the request.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Error::Database(_)
                | Error::Serialization(_)
                | Error::Internal(_)
                | Error::DeadlineExceeded
                | Error::ProviderUnavailable(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::ProviderUnavailable(e.to_string())
    }
}

/// Structured failure returned by a channel driver.
///
/// The split decides retry eligibility: transient failures are retried
/// with backoff, permanent ones never are.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Network fault, 5xx, throttling, timeout
    #[error("transient {code}: {message}")]
    Transient { code: String, message: String },

    /// Bad recipient, rejected signature, banned sender
    #[error("permanent {code}: {message}")]
    Permanent { code: String, message: String },
}

impl DriverError {
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        DriverError::Transient {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        DriverError::Permanent {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::Transient { .. })
    }

    pub fn code(&self) -> &str {
        match self {
            DriverError::Transient { code, .. } | DriverError::Permanent { code, .. } => code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            DriverError::Transient { message, .. } | DriverError::Permanent { message, .. } => {
                message
            }
        }
    }
}

impl From<DriverError> for Error {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::Transient { code, message } => {
                Error::ProviderUnavailable(format!("{code}: {message}"))
            }
            DriverError::Permanent { code, message } => {
                Error::DeliveryFailed(format!("{code}: {message}"))
            }
        }
    }
}

/// Context failures inside a driver call are transient: the attempt is
/// retried once its backoff elapses.
impl From<Error> for DriverError {
    fn from(e: Error) -> Self {
        match e {
            Error::DeadlineExceeded => {
                DriverError::transient("deadline_exceeded", "send deadline elapsed")
            }
            Error::Cancelled => DriverError::transient("cancelled", "send was cancelled"),
            other => DriverError::transient("internal", other.to_string()),
        }
    }
}
