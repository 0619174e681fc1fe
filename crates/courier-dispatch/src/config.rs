//! Dispatch configuration.

use std::collections::HashMap;
use std::time::Duration;

use courier_core::defaults;

/// A fixed-window budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max: i32,
    pub window_minutes: i32,
}

impl RateLimit {
    pub fn new(max: i32, window_minutes: i32) -> Self {
        Self {
            max,
            window_minutes: window_minutes.max(1),
        }
    }
}

/// Configuration shared by the dispatcher, the rate limiter and the
/// campaign service.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Sends allowed per user inside one window.
    pub user_limit: RateLimit,
    /// Optional budgets per notification type.
    pub type_limits: HashMap<String, RateLimit>,
    /// Optional budget across every user and type.
    pub global_limit: Option<RateLimit>,
    /// Deadline for one dispatcher call made from a background task.
    pub dispatch_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            user_limit: RateLimit::new(
                defaults::RATE_LIMIT_USER_MAX,
                defaults::RATE_LIMIT_USER_WINDOW_MINUTES,
            ),
            type_limits: HashMap::new(),
            global_limit: None,
            dispatch_timeout: Duration::from_millis(defaults::DISPATCH_TIMEOUT_MS),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl DispatchConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `RATE_LIMIT_USER_MAX` | `10` | Sends per user per window |
    /// | `RATE_LIMIT_USER_WINDOW_MINUTES` | `60` | Per-user window length |
    /// | `RATE_LIMIT_GLOBAL_MAX` | unset | Sends across all users per window |
    /// | `RATE_LIMIT_GLOBAL_WINDOW_MINUTES` | `1` | Global window length |
    /// | `DISPATCH_TIMEOUT_MS` | `10000` | Deadline for background dispatch calls |
    pub fn from_env() -> Self {
        let user_limit = RateLimit::new(
            env_parse("RATE_LIMIT_USER_MAX").unwrap_or(defaults::RATE_LIMIT_USER_MAX),
            env_parse("RATE_LIMIT_USER_WINDOW_MINUTES")
                .unwrap_or(defaults::RATE_LIMIT_USER_WINDOW_MINUTES),
        );
        let global_limit = env_parse::<i32>("RATE_LIMIT_GLOBAL_MAX").map(|max| {
            RateLimit::new(
                max,
                env_parse("RATE_LIMIT_GLOBAL_WINDOW_MINUTES").unwrap_or(1),
            )
        });
        let dispatch_timeout = Duration::from_millis(
            env_parse("DISPATCH_TIMEOUT_MS").unwrap_or(defaults::DISPATCH_TIMEOUT_MS),
        );

        Self {
            user_limit,
            type_limits: HashMap::new(),
            global_limit,
            dispatch_timeout,
        }
    }

    pub fn with_user_limit(mut self, max: i32, window_minutes: i32) -> Self {
        self.user_limit = RateLimit::new(max, window_minutes);
        self
    }

    pub fn with_type_limit(
        mut self,
        notification_type: impl Into<String>,
        max: i32,
        window_minutes: i32,
    ) -> Self {
        self.type_limits
            .insert(notification_type.into(), RateLimit::new(max, window_minutes));
        self
    }

    pub fn with_global_limit(mut self, max: i32, window_minutes: i32) -> Self {
        self.global_limit = Some(RateLimit::new(max, window_minutes));
        self
    }

    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }
}
