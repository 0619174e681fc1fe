//! Campaign repository implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{postgres::PgRow, Pool, Postgres, Row};
use uuid::Uuid;

use courier_core::{
    defaults, Campaign, CampaignProgress, CampaignRepository, CampaignStatus, CampaignTarget,
    CreateCampaignRequest, Error, JsonMap, Result, UpdateCampaignRequest,
};

use crate::{channels_to_strings, parse_channels};

const COLUMNS: &str = "id, name, description, template_code, target_type, target_value, channels,
    template_data, scheduled_at, status, batch_size, batch_delay_seconds, batch_cursor,
    processed_count, sent_count, delivered_count, failed_count, started_at, completed_at,
    cancelled_at, created_by, created_at, updated_at";

/// PostgreSQL implementation of CampaignRepository.
#[derive(Clone)]
pub struct PgCampaignRepository {
    pool: Pool<Postgres>,
}

impl PgCampaignRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_row(row: &PgRow) -> Result<Campaign> {
        let target_type: String = row.get("target_type");
        let target_value: Option<JsonValue> = row.get("target_value");
        let channels: Option<Vec<String>> = row.get("channels");
        let template_data: JsonValue = row.get("template_data");

        Ok(Campaign {
            id: row.get("id"),
            name: row.get("name"),
            description: row.get("description"),
            template_code: row.get("template_code"),
            target: CampaignTarget::from_parts(
                &target_type,
                target_value.unwrap_or(JsonValue::Null),
            )
            .map_err(|e| Error::Serialization(e.to_string()))?,
            channels: channels.map(parse_channels).transpose()?,
            template_data: serde_json::from_value::<JsonMap>(template_data)?,
            scheduled_at: row.get("scheduled_at"),
            status: row.get::<String, _>("status").parse()?,
            batch_size: row.get("batch_size"),
            batch_delay_seconds: row.get("batch_delay_seconds"),
            cursor: row.get("batch_cursor"),
            progress: CampaignProgress {
                processed: row.get("processed_count"),
                sent: row.get("sent_count"),
                delivered: row.get("delivered_count"),
                failed: row.get("failed_count"),
            },
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            cancelled_at: row.get("cancelled_at"),
            created_by: row.get("created_by"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn parse_rows(rows: &[PgRow]) -> Result<Vec<Campaign>> {
        rows.iter().map(Self::parse_row).collect()
    }

    async fn current_status(&self, id: Uuid) -> Result<CampaignStatus> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM notification_campaigns WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;
        status
            .ok_or(Error::CampaignNotFound(id))?
            .parse()
    }
}

fn target_value_column(target: &CampaignTarget) -> Option<JsonValue> {
    match target.target_value() {
        JsonValue::Null => None,
        v => Some(v),
    }
}

#[async_trait]
impl CampaignRepository for PgCampaignRepository {
    async fn create(
        &self,
        req: &CreateCampaignRequest,
        status: CampaignStatus,
        now: DateTime<Utc>,
    ) -> Result<Campaign> {
        let query = format!(
            "INSERT INTO notification_campaigns (id, name, description, template_code,
                target_type, target_value, channels, template_data, scheduled_at, status,
                batch_size, batch_delay_seconds, created_by, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(Uuid::now_v7())
            .bind(&req.name)
            .bind(&req.description)
            .bind(&req.template_code)
            .bind(req.target.target_type())
            .bind(target_value_column(&req.target))
            .bind(req.channels.as_deref().map(channels_to_strings))
            .bind(JsonValue::Object(req.template_data.clone()))
            .bind(req.scheduled_at)
            .bind(status.as_str())
            .bind(req.batch_size.unwrap_or(defaults::CAMPAIGN_BATCH_SIZE))
            .bind(
                req.batch_delay_seconds
                    .unwrap_or(defaults::CAMPAIGN_BATCH_DELAY_SECONDS),
            )
            .bind(&req.created_by)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        Self::parse_row(&row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Campaign>> {
        let query = format!("SELECT {COLUMNS} FROM notification_campaigns WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn list(
        &self,
        status: Option<CampaignStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Campaign>> {
        let query = format!(
            "SELECT {COLUMNS} FROM notification_campaigns
             WHERE ($1::text IS NULL OR status = $1)
             ORDER BY created_at DESC, id DESC
             LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&query)
            .bind(status.map(|s| s.as_str()))
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Self::parse_rows(&rows)
    }

    async fn update(
        &self,
        id: Uuid,
        req: &UpdateCampaignRequest,
        now: DateTime<Utc>,
    ) -> Result<Campaign> {
        let query = format!(
            "UPDATE notification_campaigns SET
                name = COALESCE($2, name),
                description = COALESCE($3, description),
                target_type = COALESCE($4, target_type),
                target_value = CASE WHEN $4::text IS NULL THEN target_value ELSE $5 END,
                channels = COALESCE($6, channels),
                template_data = COALESCE($7, template_data),
                scheduled_at = COALESCE($8, scheduled_at),
                batch_size = COALESCE($9, batch_size),
                batch_delay_seconds = COALESCE($10, batch_delay_seconds),
                updated_at = $11
             WHERE id = $1 AND status IN ('draft', 'scheduled')
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(&req.name)
            .bind(&req.description)
            .bind(req.target.as_ref().map(|t| t.target_type()))
            .bind(req.target.as_ref().and_then(target_value_column))
            .bind(req.channels.as_deref().map(channels_to_strings))
            .bind(req.template_data.clone().map(JsonValue::Object))
            .bind(req.scheduled_at)
            .bind(req.batch_size)
            .bind(req.batch_delay_seconds)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        match row {
            Some(row) => Self::parse_row(&row),
            None => {
                let status = self.current_status(id).await?;
                Err(Error::Conflict(format!(
                    "campaign {id} is {status} and can no longer be edited"
                )))
            }
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM notification_campaigns WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_scheduled_due(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        let query = format!(
            "SELECT {COLUMNS} FROM notification_campaigns
             WHERE status = 'scheduled' AND scheduled_at IS NOT NULL AND scheduled_at <= $1
             ORDER BY scheduled_at ASC"
        );
        let rows = sqlx::query(&query)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Self::parse_rows(&rows)
    }

    async fn list_running(&self) -> Result<Vec<Campaign>> {
        let query = format!(
            "SELECT {COLUMNS} FROM notification_campaigns
             WHERE status = 'running'
             ORDER BY started_at ASC NULLS LAST"
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Self::parse_rows(&rows)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[CampaignStatus],
        to: CampaignStatus,
        now: DateTime<Utc>,
    ) -> Result<Campaign> {
        let from: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
        let query = format!(
            "UPDATE notification_campaigns SET
                status = $2,
                started_at = CASE WHEN $2 = 'running' THEN COALESCE(started_at, $3)
                                  ELSE started_at END,
                completed_at = CASE WHEN $2 = 'completed' THEN $3 ELSE completed_at END,
                cancelled_at = CASE WHEN $2 = 'cancelled' THEN $3 ELSE cancelled_at END,
                updated_at = $3
             WHERE id = $1 AND status = ANY($4)
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(to.as_str())
            .bind(now)
            .bind(from)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        match row {
            Some(row) => Self::parse_row(&row),
            None => {
                let status = self.current_status(id).await?;
                Err(Error::Conflict(format!(
                    "campaign {id} cannot move from {status} to {to}"
                )))
            }
        }
    }

    async fn increment_progress(
        &self,
        id: Uuid,
        expected_cursor: i64,
        advance: i64,
        delta: &CampaignProgress,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE notification_campaigns SET
                batch_cursor = batch_cursor + $3,
                processed_count = processed_count + $4,
                sent_count = sent_count + $5,
                delivered_count = delivered_count + $6,
                failed_count = failed_count + $7,
                updated_at = $8
             WHERE id = $1 AND batch_cursor = $2 AND status = 'running'",
        )
        .bind(id)
        .bind(expected_cursor)
        .bind(advance)
        .bind(delta.processed)
        .bind(delta.sent)
        .bind(delta.delivered)
        .bind(delta.failed)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected() == 1)
    }

    async fn increment_delivered(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE notification_campaigns
             SET delivered_count = delivered_count + 1, updated_at = $2
             WHERE id = $1",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }
}
