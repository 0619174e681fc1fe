//! Notification template repository implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Pool, Postgres, Row};
use uuid::Uuid;

use courier_core::{
    CreateTemplateRequest, Error, NotificationTemplate, Priority, Result, TemplateContent,
    TemplateRepository, UpdateTemplateRequest,
};

use crate::{channels_to_strings, parse_channels, unique_violation};

const COLUMNS: &str = "id, code, name, description, category, notification_type, email_subject,
    email_html, email_text, sms_body, push_title, push_body, in_app_title, in_app_body,
    in_app_action_url, required_variables, language, default_channels, default_priority,
    expires_after_hours, version, is_active, created_by, updated_by, created_at, updated_at";

/// PostgreSQL implementation of TemplateRepository.
#[derive(Clone)]
pub struct PgTemplateRepository {
    pool: Pool<Postgres>,
}

impl PgTemplateRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_row(row: &PgRow) -> Result<NotificationTemplate> {
        let default_priority: Option<i16> = row.get("default_priority");
        Ok(NotificationTemplate {
            id: row.get("id"),
            code: row.get("code"),
            name: row.get("name"),
            description: row.get("description"),
            category: row
                .get::<String, _>("category")
                .parse()
                .map_err(|e: Error| Error::Serialization(e.to_string()))?,
            notification_type: row.get("notification_type"),
            content: TemplateContent {
                email_subject: row.get("email_subject"),
                email_html: row.get("email_html"),
                email_text: row.get("email_text"),
                sms_body: row.get("sms_body"),
                push_title: row.get("push_title"),
                push_body: row.get("push_body"),
                in_app_title: row.get("in_app_title"),
                in_app_body: row.get("in_app_body"),
                in_app_action_url: row.get("in_app_action_url"),
            },
            required_variables: row.get("required_variables"),
            language: row.get("language"),
            default_channels: parse_channels(row.get("default_channels"))?,
            default_priority: default_priority
                .map(Priority::try_from)
                .transpose()
                .map_err(|e| Error::Serialization(e.to_string()))?,
            expires_after_hours: row.get("expires_after_hours"),
            version: row.get("version"),
            is_active: row.get("is_active"),
            created_by: row.get("created_by"),
            updated_by: row.get("updated_by"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

}

#[async_trait]
impl TemplateRepository for PgTemplateRepository {
    async fn create(
        &self,
        req: &CreateTemplateRequest,
        now: DateTime<Utc>,
    ) -> Result<NotificationTemplate> {
        let query = format!(
            "INSERT INTO notification_templates (id, code, name, description, category,
                notification_type, email_subject, email_html, email_text, sms_body, push_title,
                push_body, in_app_title, in_app_body, in_app_action_url, required_variables,
                language, default_channels, default_priority, expires_after_hours, version,
                is_active, created_by, updated_by, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                $17, $18, $19, $20, 1, $21, $22, $22, $23, $23)
             RETURNING {COLUMNS}"
        );
        let c = &req.content;
        let row = sqlx::query(&query)
            .bind(Uuid::now_v7())
            .bind(&req.code)
            .bind(&req.name)
            .bind(&req.description)
            .bind(req.category.as_str())
            .bind(req.notification_type.as_deref().unwrap_or(&req.code))
            .bind(&c.email_subject)
            .bind(&c.email_html)
            .bind(&c.email_text)
            .bind(&c.sms_body)
            .bind(&c.push_title)
            .bind(&c.push_body)
            .bind(&c.in_app_title)
            .bind(&c.in_app_body)
            .bind(&c.in_app_action_url)
            .bind(&req.required_variables)
            .bind(req.language.as_deref().unwrap_or("en"))
            .bind(channels_to_strings(&req.default_channels))
            .bind(req.default_priority.map(i16::from))
            .bind(req.expires_after_hours)
            .bind(req.is_active)
            .bind(&req.created_by)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| unique_violation(e, || format!("template code {}", req.code)))?;
        Self::parse_row(&row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<NotificationTemplate>> {
        let query = format!("SELECT {COLUMNS} FROM notification_templates WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn get_by_code(&self, code: &str) -> Result<Option<NotificationTemplate>> {
        let query = format!("SELECT {COLUMNS} FROM notification_templates WHERE code = $1");
        let row = sqlx::query(&query)
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn list(&self, active_only: bool) -> Result<Vec<NotificationTemplate>> {
        let query = format!(
            "SELECT {COLUMNS} FROM notification_templates
             WHERE ($1 = FALSE OR is_active = TRUE)
             ORDER BY code ASC"
        );
        let rows = sqlx::query(&query)
            .bind(active_only)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        rows.iter().map(Self::parse_row).collect()
    }

    async fn update(
        &self,
        id: Uuid,
        req: &UpdateTemplateRequest,
        now: DateTime<Utc>,
    ) -> Result<NotificationTemplate> {
        // Build dynamic update query
        let mut updates = vec!["updated_at = $1".to_string()];
        let mut param_count = 2;

        let mut push = |column: &str, present: bool, updates: &mut Vec<String>| {
            if present {
                updates.push(format!("{column} = ${param_count}"));
                param_count += 1;
            }
        };
        push("name", req.name.is_some(), &mut updates);
        push("description", req.description.is_some(), &mut updates);
        push("category", req.category.is_some(), &mut updates);
        push("notification_type", req.notification_type.is_some(), &mut updates);
        if req.content.is_some() {
            for column in [
                "email_subject",
                "email_html",
                "email_text",
                "sms_body",
                "push_title",
                "push_body",
                "in_app_title",
                "in_app_body",
                "in_app_action_url",
            ] {
                push(column, true, &mut updates);
            }
        }
        push("required_variables", req.required_variables.is_some(), &mut updates);
        push("language", req.language.is_some(), &mut updates);
        push("default_channels", req.default_channels.is_some(), &mut updates);
        push("default_priority", req.default_priority.is_some(), &mut updates);
        push("expires_after_hours", req.expires_after_hours.is_some(), &mut updates);
        push("is_active", req.is_active.is_some(), &mut updates);
        push("updated_by", req.updated_by.is_some(), &mut updates);

        let query = format!(
            "UPDATE notification_templates SET {} WHERE id = ${} RETURNING {COLUMNS}",
            updates.join(", "),
            param_count
        );

        let mut q = sqlx::query(&query).bind(now);
        if let Some(name) = &req.name {
            q = q.bind(name);
        }
        if let Some(description) = &req.description {
            q = q.bind(description);
        }
        if let Some(category) = req.category {
            q = q.bind(category.as_str());
        }
        if let Some(notification_type) = &req.notification_type {
            q = q.bind(notification_type);
        }
        if let Some(c) = &req.content {
            q = q
                .bind(&c.email_subject)
                .bind(&c.email_html)
                .bind(&c.email_text)
                .bind(&c.sms_body)
                .bind(&c.push_title)
                .bind(&c.push_body)
                .bind(&c.in_app_title)
                .bind(&c.in_app_body)
                .bind(&c.in_app_action_url);
        }
        if let Some(required) = &req.required_variables {
            q = q.bind(required);
        }
        if let Some(language) = &req.language {
            q = q.bind(language);
        }
        if let Some(channels) = &req.default_channels {
            q = q.bind(channels_to_strings(channels));
        }
        if let Some(priority) = req.default_priority {
            q = q.bind(i16::from(priority));
        }
        if let Some(hours) = req.expires_after_hours {
            q = q.bind(hours);
        }
        if let Some(active) = req.is_active {
            q = q.bind(active);
        }
        if let Some(updated_by) = &req.updated_by {
            q = q.bind(updated_by);
        }

        let row = q
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?
            .ok_or_else(|| Error::NotFound(format!("template {id}")))?;
        Self::parse_row(&row)
    }

    async fn increment_version(&self, id: Uuid, now: DateTime<Utc>) -> Result<i32> {
        sqlx::query_scalar(
            "UPDATE notification_templates SET version = version + 1, updated_at = $2
             WHERE id = $1 RETURNING version",
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?
        .ok_or_else(|| Error::NotFound(format!("template {id}")))
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM notification_templates WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }
}
