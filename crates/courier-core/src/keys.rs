//! Idempotency keys and type-code validation.

use std::sync::OnceLock;

use regex::Regex;
use uuid::Uuid;

use crate::defaults;
use crate::error::{Error, Result};
use crate::models::NotificationReference;

/// Deduplication key for a send, or `None` when the caller gave nothing to
/// deduplicate on.
///
/// `scope` is the template code for templated sends and the notification
/// type for raw sends. A reference wins over a nonce.
pub fn idempotency_key(
    scope: &str,
    reference: Option<&NotificationReference>,
    nonce: Option<&str>,
    user_id: Uuid,
) -> Option<String> {
    if let Some(r) = reference {
        return Some(format!(
            "{scope}:{}:{}:{user_id}",
            r.reference_type, r.reference_id
        ));
    }
    nonce
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(|n| format!("{scope}:nonce:{n}:{user_id}"))
}

fn type_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("valid type code regex"))
}

/// Type codes are lowercase snake case starting with a letter.
pub fn validate_type_code(code: &str) -> Result<()> {
    if code.len() <= defaults::TYPE_CODE_MAX_LEN && type_code_re().is_match(code) {
        Ok(())
    } else {
        Err(Error::InvalidType(code.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_with_reference() {
        let user = Uuid::nil();
        let r = NotificationReference::new("order", "O1");
        assert_eq!(
            idempotency_key("order_shipped", Some(&r), Some("ignored"), user).unwrap(),
            format!("order_shipped:order:O1:{user}")
        );
    }

    #[test]
    fn test_key_with_nonce() {
        let user = Uuid::nil();
        assert_eq!(
            idempotency_key("welcome", None, Some("req-42"), user).unwrap(),
            format!("welcome:nonce:req-42:{user}")
        );
    }

    #[test]
    fn test_no_key_without_reference_or_nonce() {
        assert!(idempotency_key("welcome", None, None, Uuid::nil()).is_none());
        assert!(idempotency_key("welcome", None, Some("  "), Uuid::nil()).is_none());
    }

    #[test]
    fn test_different_users_get_different_keys() {
        let r = NotificationReference::new("order", "O1");
        let a = idempotency_key("t", Some(&r), None, Uuid::new_v4());
        let b = idempotency_key("t", Some(&r), None, Uuid::new_v4());
        assert_ne!(a, b);
    }

    #[test]
    fn test_validate_type_code() {
        assert!(validate_type_code("order_status").is_ok());
        assert!(validate_type_code("a1").is_ok());
        assert!(validate_type_code("").is_err());
        assert!(validate_type_code("Order").is_err());
        assert!(validate_type_code("1order").is_err());
        assert!(validate_type_code("order-status").is_err());
        assert!(validate_type_code("order\n").is_err());
        assert!(validate_type_code(&"a".repeat(65)).is_err());
    }
}
