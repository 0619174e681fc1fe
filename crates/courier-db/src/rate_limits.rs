//! Fixed-window rate counters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Row};

use courier_core::{Error, RateLimitRepository, RateScope, RateWindow, Result};

/// PostgreSQL implementation of RateLimitRepository.
#[derive(Clone)]
pub struct PgRateLimitRepository {
    pool: Pool<Postgres>,
}

impl PgRateLimitRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateLimitRepository for PgRateLimitRepository {
    async fn check_and_increment(
        &self,
        scope: RateScope,
        scope_id: &str,
        max: i32,
        window_minutes: i32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if max <= 0 {
            return Ok(false);
        }

        // Expired windows restart at `now`. A full open window is left
        // untouched and returns no row.
        let row = sqlx::query(
            "INSERT INTO notification_rate_limits AS r
                (scope, scope_id, window_minutes, count, window_start)
             VALUES ($1, $2, $3, 1, $4)
             ON CONFLICT (scope, scope_id, window_minutes) DO UPDATE SET
                count = CASE
                    WHEN r.window_start + make_interval(mins => r.window_minutes) <= $4 THEN 1
                    ELSE r.count + 1
                END,
                window_start = CASE
                    WHEN r.window_start + make_interval(mins => r.window_minutes) <= $4 THEN $4
                    ELSE r.window_start
                END
             WHERE r.window_start + make_interval(mins => r.window_minutes) <= $4
                OR r.count < $5
             RETURNING r.count",
        )
        .bind(scope.as_str())
        .bind(scope_id)
        .bind(window_minutes)
        .bind(now)
        .bind(max)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.is_some())
    }

    async fn get_window(
        &self,
        scope: RateScope,
        scope_id: &str,
        window_minutes: i32,
    ) -> Result<Option<RateWindow>> {
        let row = sqlx::query(
            "SELECT scope, scope_id, window_minutes, count, window_start
             FROM notification_rate_limits
             WHERE scope = $1 AND scope_id = $2 AND window_minutes = $3",
        )
        .bind(scope.as_str())
        .bind(scope_id)
        .bind(window_minutes)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(|row| {
            Ok(RateWindow {
                scope: row.get::<String, _>("scope").parse()?,
                scope_id: row.get("scope_id"),
                window_minutes: row.get("window_minutes"),
                count: row.get("count"),
                window_start: row.get("window_start"),
            })
        })
        .transpose()
    }

    async fn delete_expired_windows(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM notification_rate_limits
             WHERE window_start + make_interval(mins => window_minutes) < $1",
        )
        .bind(before)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }
}
