//! Centralized default constants for the courier notification subsystem.
//!
//! **This module is the single source of truth** for shared default values.
//! Config types read environment overrides and fall back to these constants.
//!
//! Organized by component. When adding new constants, place them in the
//! appropriate section.

// =============================================================================
// RATE LIMITING
// =============================================================================

/// Maximum notifications per user inside one window.
pub const RATE_LIMIT_USER_MAX: i32 = 10;

/// Length of the per-user rate window in minutes.
pub const RATE_LIMIT_USER_WINDOW_MINUTES: i32 = 60;

// =============================================================================
// DISPATCH
// =============================================================================

/// Priority applied when neither the request nor the template sets one.
pub const PRIORITY: i16 = 2;

/// Deadline for one dispatcher call made from a background task.
pub const DISPATCH_TIMEOUT_MS: u64 = 10_000;

/// Maximum length of a notification type code.
pub const TYPE_CODE_MAX_LEN: usize = 64;

// =============================================================================
// DELIVERY
// =============================================================================

/// Attempt cap per (notification, channel).
pub const MAX_RETRIES: i32 = 3;

/// Base delay of the exponential backoff in minutes.
pub const RETRY_BASE_DELAY_MINUTES: i64 = 5;

/// Notifications claimed per delivery pass.
pub const DELIVERY_BATCH_SIZE: i64 = 100;

/// Seconds between delivery passes.
pub const DELIVERY_INTERVAL_SECS: u64 = 10;

/// Deadline for one driver call.
pub const DELIVERY_SEND_TIMEOUT_SECS: u64 = 30;

/// Attempts re-sent per retry pass.
pub const RETRY_BATCH_SIZE: i64 = 100;

/// Seconds between retry passes.
pub const RETRY_INTERVAL_SECS: u64 = 60;

/// Minutes after which a queued/processing attempt is considered abandoned.
pub const STALE_PROCESSING_MINUTES: i64 = 10;

/// Number of notifications delivered concurrently inside one pass.
pub const DELIVERY_CONCURRENCY: usize = 8;

// =============================================================================
// CLEANUP
// =============================================================================

/// Seconds between cleanup passes.
pub const CLEANUP_INTERVAL_SECS: u64 = 3600;

/// Days a read notification is kept before the cleanup sweep deletes it.
pub const READ_RETENTION_DAYS: i64 = 90;

// =============================================================================
// CAMPAIGNS
// =============================================================================

/// Users per campaign batch.
pub const CAMPAIGN_BATCH_SIZE: i32 = 1000;

/// Seconds slept between campaign batches.
pub const CAMPAIGN_BATCH_DELAY_SECONDS: i32 = 5;

/// Seconds between scheduled-campaign sweeps.
pub const CAMPAIGN_INTERVAL_SECS: u64 = 30;

// =============================================================================
// PREFERENCES
// =============================================================================

/// Default quiet hours start (HH:MM, UTC).
pub const QUIET_HOURS_START: &str = "22:00";

/// Default quiet hours end (HH:MM, UTC).
pub const QUIET_HOURS_END: &str = "07:00";

/// Notification types seeded with in-app and email enabled.
pub const TRANSACTIONAL_TYPES: &[&str] = &["order_status", "payment", "system_alert"];

/// Notification types seeded with in-app only.
pub const IN_APP_ONLY_TYPES: &[&str] = &["new_promotion", "promotion_removed", "review_response"];

// =============================================================================
// PAGINATION
// =============================================================================

/// Default page size for inbox listings.
pub const PAGE_SIZE: i64 = 20;

/// Largest page size accepted by inbox listings.
pub const PAGE_SIZE_MAX: i64 = 100;

// =============================================================================
// EVENTS
// =============================================================================

/// Capacity of the worker event broadcast channel.
pub const EVENT_BUS_CAPACITY: usize = 256;
