//! User directory backed by the `user_contacts` read model.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use courier_core::{CallContext, CampaignTarget, Error, Result, UserContact, UserDirectory};

/// Directory over `user_contacts` and `user_devices`.
#[derive(Clone)]
pub struct PgUserDirectory {
    pool: Pool<Postgres>,
}

impl PgUserDirectory {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn lookup(&self, ctx: &CallContext, user_id: Uuid) -> Result<Option<UserContact>> {
        let query = sqlx::query(
            "SELECT c.user_id, c.email, c.phone,
                    (SELECT d.device_token FROM user_devices d
                     WHERE d.user_id = c.user_id AND d.is_active = TRUE
                     ORDER BY d.last_seen_at DESC
                     LIMIT 1) AS device_token
             FROM user_contacts c
             WHERE c.user_id = $1 AND c.is_active = TRUE",
        )
        .bind(user_id)
        .fetch_optional(&self.pool);

        let row = ctx
            .run::<_, _, Error>(async { query.await.map_err(Error::Database) })
            .await?;

        Ok(row.map(|row| UserContact {
            user_id: row.get("user_id"),
            email: row.get("email"),
            phone: row.get("phone"),
            device_token: row.get("device_token"),
        }))
    }

    async fn list_audience(
        &self,
        ctx: &CallContext,
        target: &CampaignTarget,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Uuid>> {
        let fetch = match target {
            CampaignTarget::AllUsers => sqlx::query(
                "SELECT user_id FROM user_contacts WHERE is_active = TRUE
                 ORDER BY user_id ASC OFFSET $1 LIMIT $2",
            )
            .bind(offset)
            .bind(limit),
            CampaignTarget::Segment { segment } => sqlx::query(
                "SELECT user_id FROM user_contacts
                 WHERE is_active = TRUE AND $3 = ANY(segments)
                 ORDER BY user_id ASC OFFSET $1 LIMIT $2",
            )
            .bind(offset)
            .bind(limit)
            .bind(segment.clone()),
            CampaignTarget::SpecificUsers { user_ids } => sqlx::query(
                "SELECT DISTINCT u AS user_id FROM unnest($3::uuid[]) AS t(u)
                 ORDER BY user_id ASC OFFSET $1 LIMIT $2",
            )
            .bind(offset)
            .bind(limit)
            .bind(user_ids.clone()),
            CampaignTarget::Filter { filter } => sqlx::query(
                "SELECT user_id FROM user_contacts
                 WHERE is_active = TRUE AND attributes @> $3
                 ORDER BY user_id ASC OFFSET $1 LIMIT $2",
            )
            .bind(offset)
            .bind(limit)
            .bind(JsonValue::Object(filter.clone())),
        };

        let rows = ctx
            .run::<_, _, Error>(async {
                fetch.fetch_all(&self.pool).await.map_err(Error::Database)
            })
            .await?;
        Ok(rows.iter().map(|row| row.get("user_id")).collect())
    }
}
