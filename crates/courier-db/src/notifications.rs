//! Notification repository implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{postgres::PgRow, Pool, Postgres, Row, Transaction};
use tracing::warn;
use uuid::Uuid;

use courier_core::{
    Channel, DeliveryStatus, DeliveryStatusMap, Error, JsonMap, NewNotification, Notification,
    NotificationFilter, NotificationReference, NotificationRepository, Page, Priority,
    RenderedContent, Result, SortField, SortOrder,
};

use crate::{channels_to_strings, parse_channels, unique_violation};

const COLUMNS: &str = "id, user_id, notification_type, title, message, payload, channels,
    delivery_status, rendered, reference_type, reference_id, idempotency_key, priority,
    expires_at, template_code, template_version, template_data, is_read, read_at, is_sent,
    sent_at, created_at, updated_at";

/// PostgreSQL implementation of NotificationRepository.
#[derive(Clone)]
pub struct PgNotificationRepository {
    pool: Pool<Postgres>,
}

impl PgNotificationRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Decode a row; corrupted JSON columns surface as `Error::Serialization`.
    fn parse_row(row: &PgRow) -> Result<Notification> {
        let payload: JsonValue = row.get("payload");
        let delivery_status: JsonValue = row.get("delivery_status");
        let rendered: JsonValue = row.get("rendered");
        let template_data: Option<JsonValue> = row.get("template_data");
        let reference_type: Option<String> = row.get("reference_type");
        let reference_id: Option<String> = row.get("reference_id");

        Ok(Notification {
            id: row.get("id"),
            user_id: row.get("user_id"),
            notification_type: row.get("notification_type"),
            title: row.get("title"),
            message: row.get("message"),
            payload: serde_json::from_value::<JsonMap>(payload)?,
            channels: parse_channels(row.get("channels"))?,
            delivery_status: serde_json::from_value::<DeliveryStatusMap>(delivery_status)?,
            rendered: serde_json::from_value::<BTreeMap<Channel, RenderedContent>>(rendered)?,
            reference: match (reference_type, reference_id) {
                (Some(t), Some(id)) => Some(NotificationReference::new(t, id)),
                _ => None,
            },
            idempotency_key: row.get("idempotency_key"),
            priority: Priority::try_from(row.get::<i16, _>("priority"))
                .map_err(|e| Error::Serialization(e.to_string()))?,
            expires_at: row.get("expires_at"),
            template_code: row.get("template_code"),
            template_version: row.get("template_version"),
            template_data: template_data
                .map(serde_json::from_value::<JsonMap>)
                .transpose()?,
            is_read: row.get("is_read"),
            read_at: row.get("read_at"),
            is_sent: row.get("is_sent"),
            sent_at: row.get("sent_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    /// Decode rows for a background sweep, skipping and logging corrupt ones.
    fn parse_rows_lenient(rows: Vec<PgRow>) -> Vec<Notification> {
        rows.iter()
            .filter_map(|row| match Self::parse_row(row) {
                Ok(n) => Some(n),
                Err(e) => {
                    let id: Option<Uuid> = row.try_get("id").ok();
                    warn!(
                        subsystem = "database",
                        component = "notifications",
                        notification_id = ?id,
                        error = %e,
                        "Skipping notification with corrupt stored state"
                    );
                    None
                }
            })
            .collect()
    }

    /// Insert a notification within an existing transaction.
    ///
    /// Releases an idempotency key still held by an expired notification
    /// before inserting, so the unique index only guards live rows.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        new: NewNotification,
        now: DateTime<Utc>,
    ) -> Result<Notification> {
        if new.channels.is_empty() {
            return Err(Error::NoChannels);
        }

        if let Some(key) = &new.idempotency_key {
            sqlx::query(
                "UPDATE notifications SET idempotency_key = NULL, updated_at = $2
                 WHERE idempotency_key = $1 AND expires_at IS NOT NULL AND expires_at <= $2",
            )
            .bind(key)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        }

        let id = Uuid::now_v7();
        let (reference_type, reference_id) = match &new.reference {
            Some(r) => (Some(r.reference_type.clone()), Some(r.reference_id.clone())),
            None => (None, None),
        };
        let query = format!(
            "INSERT INTO notifications (id, user_id, notification_type, title, message, payload,
                channels, delivery_status, rendered, reference_type, reference_id,
                idempotency_key, priority, expires_at, template_code, template_version,
                template_data, is_read, is_sent, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, '{{}}'::jsonb, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, FALSE, FALSE, $17, $17)
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(new.user_id)
            .bind(&new.notification_type)
            .bind(&new.title)
            .bind(&new.message)
            .bind(JsonValue::Object(new.payload.clone()))
            .bind(channels_to_strings(&new.channels))
            .bind(serde_json::to_value(&new.rendered)?)
            .bind(reference_type)
            .bind(reference_id)
            .bind(&new.idempotency_key)
            .bind(i16::from(new.priority))
            .bind(new.expires_at)
            .bind(&new.template_code)
            .bind(new.template_version)
            .bind(new.template_data.clone().map(JsonValue::Object))
            .bind(now)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| {
                unique_violation(e, || {
                    format!(
                        "idempotency key {}",
                        new.idempotency_key.as_deref().unwrap_or_default()
                    )
                })
            })?;

        Self::parse_row(&row)
    }
}

#[async_trait]
impl NotificationRepository for PgNotificationRepository {
    async fn create(&self, new: NewNotification, now: DateTime<Utc>) -> Result<Notification> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let notification = self.create_in_tx(&mut tx, new, now).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(notification)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Notification>> {
        let query = format!("SELECT {COLUMNS} FROM notifications WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn get_by_idempotency_key(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Notification>> {
        let query = format!(
            "SELECT {COLUMNS} FROM notifications
             WHERE idempotency_key = $1 AND (expires_at IS NULL OR expires_at > $2)"
        );
        let row = sqlx::query(&query)
            .bind(key)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn list(
        &self,
        user_id: Uuid,
        filter: &NotificationFilter,
        now: DateTime<Utc>,
    ) -> Result<Page<Notification>> {
        let filter = filter.normalized();

        // $1 = user_id, $2 = now
        let mut conditions = vec![
            "user_id = $1".to_string(),
            "(expires_at IS NULL OR expires_at > $2)".to_string(),
        ];
        let mut param_count = 3;
        if filter.notification_type.is_some() {
            conditions.push(format!("notification_type = ${}", param_count));
            param_count += 1;
        }
        if filter.is_read.is_some() {
            conditions.push(format!("is_read = ${}", param_count));
            param_count += 1;
        }
        if filter.channel.is_some() {
            conditions.push(format!("${} = ANY(channels)", param_count));
            param_count += 1;
        }
        let where_clause = conditions.join(" AND ");

        let order_column = match filter.sort_by {
            SortField::CreatedAt => "created_at",
            SortField::Priority => "priority",
        };
        let direction = match filter.sort_order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };

        let count_query = format!("SELECT COUNT(*) FROM notifications WHERE {where_clause}");
        let list_query = format!(
            "SELECT {COLUMNS} FROM notifications WHERE {where_clause}
             ORDER BY {order_column} {direction}, id {direction}
             LIMIT ${} OFFSET ${}",
            param_count,
            param_count + 1
        );

        let mut count_q = sqlx::query_scalar::<_, i64>(&count_query)
            .bind(user_id)
            .bind(now);
        let mut list_q = sqlx::query(&list_query).bind(user_id).bind(now);
        if let Some(t) = &filter.notification_type {
            count_q = count_q.bind(t);
            list_q = list_q.bind(t);
        }
        if let Some(read) = filter.is_read {
            count_q = count_q.bind(read);
            list_q = list_q.bind(read);
        }
        if let Some(channel) = filter.channel {
            count_q = count_q.bind(channel.as_str());
            list_q = list_q.bind(channel.as_str());
        }

        let total = count_q
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        let rows = list_q
            .bind(filter.size)
            .bind(filter.offset())
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        let items = rows
            .iter()
            .map(Self::parse_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(Page {
            items,
            total,
            page: filter.page,
            size: filter.size,
        })
    }

    async fn list_unsent(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Notification>> {
        let query = format!(
            "SELECT {COLUMNS} FROM notifications n
             WHERE n.is_sent = FALSE
               AND (n.expires_at IS NULL OR n.expires_at > $1)
               AND EXISTS (
                   SELECT 1 FROM unnest(n.channels) AS c(name)
                   WHERE NOT (n.delivery_status ? c.name)
               )
             ORDER BY n.priority DESC, n.created_at ASC
             LIMIT $2"
        );
        let rows = sqlx::query(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(Self::parse_rows_lenient(rows))
    }

    async fn mark_read(&self, user_id: Uuid, ids: &[Uuid], now: DateTime<Utc>) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE notifications SET is_read = TRUE, read_at = $3, updated_at = $3
             WHERE user_id = $1 AND id = ANY($2) AND is_read = FALSE",
        )
        .bind(user_id)
        .bind(ids)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    async fn mark_all_read(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE notifications SET is_read = TRUE, read_at = $2, updated_at = $2
             WHERE user_id = $1 AND is_read = FALSE",
        )
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    async fn mark_sent(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE notifications SET is_sent = TRUE, sent_at = $2, updated_at = $2
             WHERE id = $1 AND is_sent = FALSE",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_channel_delivery_status(
        &self,
        id: Uuid,
        channel: Channel,
        status: DeliveryStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE notifications
             SET delivery_status = delivery_status || jsonb_build_object($2::text, $3::text),
                 updated_at = $4
             WHERE id = $1",
        )
        .bind(id)
        .bind(channel.as_str())
        .bind(status.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("notification {id}")));
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM notifications WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_expired(&self, before: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM notifications WHERE expires_at IS NOT NULL AND expires_at < $1")
                .bind(before)
                .execute(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    async fn delete_old_read(&self, before: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM notifications WHERE is_read = TRUE AND read_at < $1")
                .bind(before)
                .execute(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    async fn unread_count(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM notifications
             WHERE user_id = $1 AND is_read = FALSE AND (expires_at IS NULL OR expires_at > $2)",
        )
        .bind(user_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)
    }
}
