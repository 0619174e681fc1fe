//! Fixed-window admission control.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use courier_core::{Clock, Error, RateLimitRepository, RateScope, RateWindow, Result};

use crate::config::{DispatchConfig, RateLimit};

/// Counts sends per user, and optionally per type and globally.
///
/// Each check atomically resets an expired window and counts the send when
/// the window has room. Store faults are logged and the send is allowed:
/// the limiter protects gateways and users, it does not gate correctness.
#[derive(Clone)]
pub struct RateLimiter {
    repo: Arc<dyn RateLimitRepository>,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
}

pub(crate) const GLOBAL_SCOPE_ID: &str = "all";

impl RateLimiter {
    pub fn new(
        repo: Arc<dyn RateLimitRepository>,
        clock: Arc<dyn Clock>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            repo,
            clock,
            config,
        }
    }

    /// Count one send for `user_id` of `notification_type`.
    ///
    /// Returns `Error::RateLimited` naming the first scope that refused.
    pub async fn check_and_increment(&self, user_id: Uuid, notification_type: &str) -> Result<()> {
        let user_key = user_id.to_string();
        let mut scopes: Vec<(RateScope, &str, RateLimit)> =
            vec![(RateScope::User, user_key.as_str(), self.config.user_limit)];
        if let Some(limit) = self.config.type_limits.get(notification_type) {
            scopes.push((RateScope::NotificationType, notification_type, *limit));
        }
        if let Some(limit) = self.config.global_limit {
            scopes.push((RateScope::Global, GLOBAL_SCOPE_ID, limit));
        }

        for (scope, scope_id, limit) in scopes {
            if !self.admit(scope, scope_id, limit).await {
                debug!(
                    subsystem = "dispatch",
                    component = "rate_limiter",
                    scope = scope.as_str(),
                    scope_id,
                    max = limit.max,
                    "Rate window full"
                );
                return Err(Error::RateLimited {
                    scope: scope.as_str().to_string(),
                    scope_id: scope_id.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn admit(&self, scope: RateScope, scope_id: &str, limit: RateLimit) -> bool {
        match self
            .repo
            .check_and_increment(
                scope,
                scope_id,
                limit.max,
                limit.window_minutes,
                self.clock.now(),
            )
            .await
        {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(
                    subsystem = "dispatch",
                    component = "rate_limiter",
                    scope = scope.as_str(),
                    scope_id,
                    error = %e,
                    "Rate limit check failed, allowing send"
                );
                true
            }
        }
    }

    /// Current per-user window, if one exists.
    pub async fn user_window(&self, user_id: Uuid) -> Result<Option<RateWindow>> {
        self.repo
            .get_window(
                RateScope::User,
                &user_id.to_string(),
                self.config.user_limit.window_minutes,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use courier_core::ManualClock;
    use courier_db::test_fixtures::base_time;
    use courier_db::MemoryStore;

    #[tokio::test]
    async fn test_user_window_denies_then_resets() {
        let clock = ManualClock::new(base_time());
        let limiter = RateLimiter::new(
            Arc::new(MemoryStore::new()),
            Arc::new(clock.clone()),
            DispatchConfig::default().with_user_limit(2, 60),
        );
        let user = Uuid::new_v4();

        limiter.check_and_increment(user, "payment").await.unwrap();
        limiter.check_and_increment(user, "payment").await.unwrap();
        let err = limiter.check_and_increment(user, "payment").await.unwrap_err();
        assert_eq!(err.code(), "RATE_LIMITED");

        clock.advance(Duration::minutes(60));
        limiter.check_and_increment(user, "payment").await.unwrap();
        assert_eq!(limiter.user_window(user).await.unwrap().unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_type_limit_applies_across_users() {
        let limiter = RateLimiter::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(base_time())),
            DispatchConfig::default().with_type_limit("new_promotion", 1, 60),
        );
        limiter
            .check_and_increment(Uuid::new_v4(), "new_promotion")
            .await
            .unwrap();
        let err = limiter
            .check_and_increment(Uuid::new_v4(), "new_promotion")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited { ref scope, .. } if scope == "notification_type"));
        limiter
            .check_and_increment(Uuid::new_v4(), "payment")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fails_open_when_store_is_down() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let limiter = RateLimiter::new(
            Arc::new(store),
            Arc::new(ManualClock::new(base_time())),
            DispatchConfig::default(),
        );
        limiter
            .check_and_increment(Uuid::new_v4(), "payment")
            .await
            .unwrap();
    }
}
