//! Delivery log repository implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Pool, Postgres, Row};
use uuid::Uuid;

use courier_core::{
    AttemptUpdate, Channel, DeliveryAttempt, DeliveryLogRepository, DeliveryRate, DeliveryStatus,
    Error, NewDeliveryAttempt, Result,
};

const COLUMNS: &str = "id, notification_id, channel, attempt_number, status, recipient, provider,
    provider_message_id, provider_response, error_code, error_message, queued_at, processing_at,
    sent_at, delivered_at, opened_at, clicked_at, failed_at, retry_after, max_retries,
    created_at, updated_at";

/// PostgreSQL implementation of DeliveryLogRepository.
#[derive(Clone)]
pub struct PgDeliveryLogRepository {
    pool: Pool<Postgres>,
}

impl PgDeliveryLogRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_row(row: &PgRow) -> Result<DeliveryAttempt> {
        Ok(DeliveryAttempt {
            id: row.get("id"),
            notification_id: row.get("notification_id"),
            channel: row
                .get::<String, _>("channel")
                .parse::<Channel>()
                .map_err(|e| Error::Serialization(e.to_string()))?,
            attempt_number: row.get("attempt_number"),
            status: row.get::<String, _>("status").parse()?,
            recipient: row.get("recipient"),
            provider: row.get("provider"),
            provider_message_id: row.get("provider_message_id"),
            provider_response: row.get("provider_response"),
            error_code: row.get("error_code"),
            error_message: row.get("error_message"),
            queued_at: row.get("queued_at"),
            processing_at: row.get("processing_at"),
            sent_at: row.get("sent_at"),
            delivered_at: row.get("delivered_at"),
            opened_at: row.get("opened_at"),
            clicked_at: row.get("clicked_at"),
            failed_at: row.get("failed_at"),
            retry_after: row.get("retry_after"),
            max_retries: row.get("max_retries"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn parse_rows(rows: &[PgRow]) -> Result<Vec<DeliveryAttempt>> {
        rows.iter().map(Self::parse_row).collect()
    }
}

#[async_trait]
impl DeliveryLogRepository for PgDeliveryLogRepository {
    async fn append(
        &self,
        new: NewDeliveryAttempt,
        now: DateTime<Utc>,
    ) -> Result<DeliveryAttempt> {
        // The WHERE keeps numbering gap-free; the unique constraint settles
        // two writers racing for the same number.
        let query = format!(
            "INSERT INTO delivery_logs (id, notification_id, channel, attempt_number, status,
                recipient, provider, max_retries, queued_at, created_at, updated_at)
             SELECT $1, $2, $3, $4, 'queued', $5, $6, $7, $8, $8, $8
             WHERE $4 = COALESCE((
                 SELECT MAX(attempt_number) FROM delivery_logs
                 WHERE notification_id = $2 AND channel = $3
             ), 0) + 1
             ON CONFLICT (notification_id, channel, attempt_number) DO NOTHING
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(Uuid::now_v7())
            .bind(new.notification_id)
            .bind(new.channel.as_str())
            .bind(new.attempt_number)
            .bind(&new.recipient)
            .bind(&new.provider)
            .bind(new.max_retries)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        match row {
            Some(row) => Self::parse_row(&row),
            None => Err(Error::Duplicate(format!(
                "attempt {} for notification {} on {}",
                new.attempt_number, new.notification_id, new.channel
            ))),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeliveryAttempt>> {
        let query = format!("SELECT {COLUMNS} FROM delivery_logs WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn update(
        &self,
        id: Uuid,
        update: AttemptUpdate,
        now: DateTime<Utc>,
    ) -> Result<DeliveryAttempt> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let query = format!("SELECT {COLUMNS} FROM delivery_logs WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::Database)?
            .ok_or_else(|| Error::NotFound(format!("delivery attempt {id}")))?;

        let mut attempt = Self::parse_row(&row)?;
        attempt.apply(&update, now)?;

        sqlx::query(
            "UPDATE delivery_logs
             SET status = $2, provider_message_id = $3, provider_response = $4,
                 error_code = $5, error_message = $6, processing_at = $7, sent_at = $8,
                 delivered_at = $9, opened_at = $10, clicked_at = $11, failed_at = $12,
                 retry_after = $13, updated_at = $14
             WHERE id = $1",
        )
        .bind(id)
        .bind(attempt.status.as_str())
        .bind(&attempt.provider_message_id)
        .bind(&attempt.provider_response)
        .bind(&attempt.error_code)
        .bind(&attempt.error_message)
        .bind(attempt.processing_at)
        .bind(attempt.sent_at)
        .bind(attempt.delivered_at)
        .bind(attempt.opened_at)
        .bind(attempt.clicked_at)
        .bind(attempt.failed_at)
        .bind(attempt.retry_after)
        .bind(attempt.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(attempt)
    }

    async fn list_retry_eligible(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DeliveryAttempt>> {
        let query = format!(
            "SELECT {COLUMNS} FROM delivery_logs
             WHERE status = 'failed'
               AND retry_after IS NOT NULL AND retry_after <= $1
               AND attempt_number < max_retries
             ORDER BY retry_after ASC
             LIMIT $2"
        );
        let rows = sqlx::query(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Self::parse_rows(&rows)
    }

    async fn claim_retry(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE delivery_logs SET retry_after = NULL, updated_at = NOW()
             WHERE id = $1 AND status = 'failed' AND retry_after IS NOT NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_retry(&self, id: Uuid, retry_after: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE delivery_logs SET retry_after = $2, updated_at = NOW()
             WHERE id = $1 AND status = 'failed' AND retry_after IS NULL",
        )
        .bind(id)
        .bind(retry_after)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_by_notification(&self, notification_id: Uuid) -> Result<Vec<DeliveryAttempt>> {
        let query = format!(
            "SELECT {COLUMNS} FROM delivery_logs WHERE notification_id = $1
             ORDER BY channel ASC, attempt_number ASC"
        );
        let rows = sqlx::query(&query)
            .bind(notification_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Self::parse_rows(&rows)
    }

    async fn list_stale(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<DeliveryAttempt>> {
        let query = format!(
            "SELECT {COLUMNS} FROM delivery_logs
             WHERE status IN ('queued', 'processing')
               AND COALESCE(processing_at, queued_at) < $1
             ORDER BY queued_at ASC
             LIMIT $2"
        );
        let rows = sqlx::query(&query)
            .bind(before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Self::parse_rows(&rows)
    }

    async fn find_by_provider_message_id(
        &self,
        provider: &str,
        provider_message_id: &str,
    ) -> Result<Option<DeliveryAttempt>> {
        let query = format!(
            "SELECT {COLUMNS} FROM delivery_logs
             WHERE provider = $1 AND provider_message_id = $2
             ORDER BY created_at DESC
             LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(provider)
            .bind(provider_message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn delivery_rate(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        channel: Option<Channel>,
    ) -> Result<DeliveryRate> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM delivery_logs
             WHERE queued_at >= $1 AND queued_at < $2
               AND ($3::text IS NULL OR channel = $3)
             GROUP BY status",
        )
        .bind(from)
        .bind(to)
        .bind(channel.map(|c| c.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut rate = DeliveryRate::default();
        for row in &rows {
            let status: DeliveryStatus = row.get::<String, _>("status").parse()?;
            rate.record(status, row.get::<i64, _>("n"));
        }
        Ok(rate.finish())
    }
}
