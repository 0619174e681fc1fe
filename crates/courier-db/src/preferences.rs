//! Per-user notification preference repository.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{postgres::PgRow, Pool, Postgres, Row};
use uuid::Uuid;

use courier_core::{ChannelToggles, Error, NotificationPreferences, PreferenceRepository, Result};

const COLUMNS: &str = "user_id, preferences, do_not_disturb, quiet_hours_start, quiet_hours_end,
    created_at, updated_at";

/// PostgreSQL implementation of PreferenceRepository.
#[derive(Clone)]
pub struct PgPreferenceRepository {
    pool: Pool<Postgres>,
}

impl PgPreferenceRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_row(row: &PgRow) -> Result<NotificationPreferences> {
        let preferences: JsonValue = row.get("preferences");
        Ok(NotificationPreferences {
            user_id: row.get("user_id"),
            preferences: serde_json::from_value::<BTreeMap<String, ChannelToggles>>(preferences)?,
            do_not_disturb: row.get("do_not_disturb"),
            quiet_hours_start: row.get("quiet_hours_start"),
            quiet_hours_end: row.get("quiet_hours_end"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl PreferenceRepository for PgPreferenceRepository {
    async fn get(&self, user_id: Uuid) -> Result<Option<NotificationPreferences>> {
        let query = format!("SELECT {COLUMNS} FROM notification_preferences WHERE user_id = $1");
        let row = sqlx::query(&query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn upsert(
        &self,
        prefs: &NotificationPreferences,
        now: DateTime<Utc>,
    ) -> Result<NotificationPreferences> {
        let query = format!(
            "INSERT INTO notification_preferences (user_id, preferences, do_not_disturb,
                quiet_hours_start, quiet_hours_end, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $6)
             ON CONFLICT (user_id) DO UPDATE SET
                preferences = EXCLUDED.preferences,
                do_not_disturb = EXCLUDED.do_not_disturb,
                quiet_hours_start = EXCLUDED.quiet_hours_start,
                quiet_hours_end = EXCLUDED.quiet_hours_end,
                updated_at = EXCLUDED.updated_at
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(prefs.user_id)
            .bind(serde_json::to_value(&prefs.preferences)?)
            .bind(prefs.do_not_disturb)
            .bind(prefs.quiet_hours_start)
            .bind(prefs.quiet_hours_end)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        Self::parse_row(&row)
    }
}
