//! Template engine and template administration.
//!
//! Templates are addressed by `code`. Any change to content slots or to
//! the required variables bumps the version; notifications snapshot
//! `(code, version)` plus the rendered content, so later edits never change
//! what was already sent.

use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use courier_core::keys::validate_type_code;
use courier_core::render::{missing_variables, placeholders, render};
use courier_core::{
    dedup_channels, Channel, Clock, CreateTemplateRequest, Error, JsonMap, NotificationTemplate,
    RenderedContent, Result, TemplateContent, TemplateRepository, UpdateTemplateRequest,
};

/// Render `template` for `channel`.
///
/// Email renders subject plus HTML with the text part as alternative (text
/// alone when there is no HTML); SMS renders only the body; push and in-app
/// render title and body.
pub fn render_channel(
    template: &NotificationTemplate,
    channel: Channel,
    data: &JsonMap,
) -> Result<RenderedContent> {
    let missing = template.content.missing_slots(channel);
    if !missing.is_empty() {
        return Err(Error::InvalidInput(format!(
            "template {} has no {} content ({})",
            template.code,
            channel,
            missing.join(", ")
        )));
    }
    let slot = |s: &Option<String>| s.as_deref().map(|t| render(t, data));
    let c = &template.content;
    let out = match channel {
        Channel::Email => {
            let html = slot(&c.email_html).filter(|h| !h.trim().is_empty());
            let text = slot(&c.email_text).filter(|t| !t.trim().is_empty());
            let body = html.clone().or_else(|| text.clone()).unwrap_or_default();
            RenderedContent {
                title: slot(&c.email_subject).unwrap_or_default(),
                body,
                text_body: text,
                action_url: None,
            }
        }
        Channel::Sms => RenderedContent::new("", slot(&c.sms_body).unwrap_or_default()),
        Channel::Push => RenderedContent::new(
            slot(&c.push_title).unwrap_or_default(),
            slot(&c.push_body).unwrap_or_default(),
        ),
        Channel::InApp => RenderedContent {
            title: slot(&c.in_app_title).unwrap_or_default(),
            body: slot(&c.in_app_body).unwrap_or_default(),
            text_body: None,
            action_url: slot(&c.in_app_action_url).filter(|u| !u.trim().is_empty()),
        },
    };
    Ok(out)
}

/// Reject a template whose default channels lack content or whose required
/// variables are malformed.
fn validate_definition(
    code: &str,
    notification_type: &str,
    content: &TemplateContent,
    default_channels: &[Channel],
    required_variables: &[String],
) -> Result<()> {
    validate_type_code(code)?;
    validate_type_code(notification_type)?;
    if default_channels.is_empty() {
        return Err(Error::InvalidInput(format!(
            "template {code} needs at least one default channel"
        )));
    }
    for channel in default_channels {
        let missing = content.missing_slots(*channel);
        if !missing.is_empty() {
            return Err(Error::InvalidInput(format!(
                "template {code} lists {channel} but is missing {}",
                missing.join(", ")
            )));
        }
    }
    for var in required_variables {
        if placeholders(&format!("{{{{{var}}}}}")).first() != Some(var) {
            return Err(Error::InvalidInput(format!(
                "template {code} has an invalid variable name {var:?}"
            )));
        }
    }
    Ok(())
}

/// Template lookups, rendering and admin CRUD.
#[derive(Clone)]
pub struct TemplateService {
    repo: Arc<dyn TemplateRepository>,
    clock: Arc<dyn Clock>,
}

impl TemplateService {
    pub fn new(repo: Arc<dyn TemplateRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    /// Fetch by code, active or not.
    pub async fn get(&self, code: &str) -> Result<NotificationTemplate> {
        self.repo
            .get_by_code(code)
            .await?
            .ok_or_else(|| Error::TemplateNotFound(code.to_string()))
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<NotificationTemplate> {
        self.repo
            .get(id)
            .await?
            .ok_or_else(|| Error::TemplateNotFound(id.to_string()))
    }

    /// Fetch by code and reject inactive templates.
    pub async fn get_active(&self, code: &str) -> Result<NotificationTemplate> {
        let template = self.get(code).await?;
        if !template.is_active {
            return Err(Error::TemplateInactive(code.to_string()));
        }
        Ok(template)
    }

    pub async fn list(&self, active_only: bool) -> Result<Vec<NotificationTemplate>> {
        self.repo.list(active_only).await
    }

    /// Check `data` against the active template's required variables.
    pub async fn validate_variables(&self, code: &str, data: &JsonMap) -> Result<()> {
        let template = self.get_active(code).await?;
        check_variables(&template, data)
    }

    /// Render the active template `code` for one channel.
    pub async fn render(
        &self,
        code: &str,
        channel: Channel,
        data: &JsonMap,
    ) -> Result<RenderedContent> {
        let template = self.get_active(code).await?;
        check_variables(&template, data)?;
        render_channel(&template, channel, data)
    }

    #[instrument(skip(self, req), fields(subsystem = "dispatch", component = "templates", code = %req.code))]
    pub async fn create(&self, req: CreateTemplateRequest) -> Result<NotificationTemplate> {
        let mut req = req;
        req.default_channels = dedup_channels(&req.default_channels);
        let notification_type = req
            .notification_type
            .clone()
            .unwrap_or_else(|| req.code.clone());
        validate_definition(
            &req.code,
            &notification_type,
            &req.content,
            &req.default_channels,
            &req.required_variables,
        )?;
        if req.name.trim().is_empty() {
            return Err(Error::InvalidInput("template name is required".into()));
        }

        let template = self.repo.create(&req, self.clock.now()).await?;
        info!(
            template_id = %template.id,
            version = template.version,
            "Template created"
        );
        Ok(template)
    }

    /// Apply a partial update; a content change bumps the version.
    #[instrument(skip(self, req), fields(subsystem = "dispatch", component = "templates", template_id = %id))]
    pub async fn update(
        &self,
        id: Uuid,
        req: UpdateTemplateRequest,
    ) -> Result<NotificationTemplate> {
        let current = self.get_by_id(id).await?;

        let mut req = req;
        if let Some(channels) = &req.default_channels {
            req.default_channels = Some(dedup_channels(channels));
        }
        validate_definition(
            &current.code,
            req.notification_type
                .as_deref()
                .unwrap_or(&current.notification_type),
            req.content.as_ref().unwrap_or(&current.content),
            req.default_channels
                .as_deref()
                .unwrap_or(&current.default_channels),
            req.required_variables
                .as_deref()
                .unwrap_or(&current.required_variables),
        )?;

        let bump = req.changes_content(&current);
        let now = self.clock.now();
        let mut updated = self.repo.update(id, &req, now).await?;
        if bump {
            updated.version = self.repo.increment_version(id, now).await?;
            info!(version = updated.version, "Template content changed");
        }
        Ok(updated)
    }

    pub async fn set_active(&self, id: Uuid, active: bool) -> Result<NotificationTemplate> {
        self.update(
            id,
            UpdateTemplateRequest {
                is_active: Some(active),
                ..UpdateTemplateRequest::default()
            },
        )
        .await
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        if !self.repo.delete(id).await? {
            warn!(subsystem = "dispatch", template_id = %id, "Delete of unknown template");
            return Err(Error::TemplateNotFound(id.to_string()));
        }
        Ok(())
    }
}

pub(crate) fn check_variables(template: &NotificationTemplate, data: &JsonMap) -> Result<()> {
    let missing = missing_variables(&template.required_variables, data);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::MissingVariables(missing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{ManualClock, TemplateCategory};
    use courier_db::test_fixtures::{base_time, order_shipped_template};
    use courier_db::MemoryStore;
    use serde_json::json;

    fn service() -> TemplateService {
        TemplateService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(base_time())),
        )
    }

    fn data(v: serde_json::Value) -> JsonMap {
        v.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_render_per_channel() {
        let svc = service();
        svc.create(order_shipped_template()).await.unwrap();
        let d = data(json!({"order_number": "A-100"}));

        let email = svc.render("order_shipped", Channel::Email, &d).await.unwrap();
        assert_eq!(email.title, "Your order A-100 has shipped");
        assert_eq!(email.body, "<p>Order A-100 is on its way.</p>");
        assert_eq!(email.text_body.as_deref(), Some("Order A-100 is on its way."));

        let in_app = svc.render("order_shipped", Channel::InApp, &d).await.unwrap();
        assert_eq!(in_app.title, "Order A-100 shipped");

        let err = svc.render("order_shipped", Channel::Sms, &d).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_missing_and_inactive() {
        let svc = service();
        let t = svc.create(order_shipped_template()).await.unwrap();

        let err = svc
            .validate_variables("order_shipped", &JsonMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MISSING_VARIABLES");

        svc.set_active(t.id, false).await.unwrap();
        let err = svc
            .render("order_shipped", Channel::Email, &JsonMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TEMPLATE_INACTIVE");

        let err = svc.get("nope").await.unwrap_err();
        assert_eq!(err.code(), "TEMPLATE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_create_requires_slots_for_default_channels() {
        let svc = service();
        let mut req = order_shipped_template();
        req.default_channels.push(Channel::Sms);
        let err = svc.create(req).await.unwrap_err();
        assert!(err.to_string().contains("sms_body"));

        let mut req = order_shipped_template();
        req.code = "Order Shipped".into();
        assert_eq!(svc.create(req).await.unwrap_err().code(), "INVALID_TYPE");
    }

    #[tokio::test]
    async fn test_content_change_bumps_version_metadata_does_not() {
        let svc = service();
        let t = svc.create(order_shipped_template()).await.unwrap();
        assert_eq!(t.version, 1);

        let renamed = svc
            .update(
                t.id,
                UpdateTemplateRequest {
                    name: Some("Shipped".into()),
                    category: Some(TemplateCategory::System),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.version, 1);

        let mut content = t.content.clone();
        content.push_body = Some("{{order_number}} left the warehouse".into());
        let edited = svc
            .update(
                t.id,
                UpdateTemplateRequest {
                    content: Some(content),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(edited.version, 2);
        assert_eq!(svc.get("order_shipped").await.unwrap().version, 2);
    }

    #[test]
    fn test_sms_render_has_no_title() {
        let mut template_req = order_shipped_template();
        template_req.content.sms_body = Some("Order {{ order_number }} shipped".into());
        let template = NotificationTemplate {
            id: Uuid::nil(),
            code: template_req.code,
            name: template_req.name,
            description: None,
            category: template_req.category,
            notification_type: "order_status".into(),
            content: template_req.content,
            required_variables: template_req.required_variables,
            language: "en".into(),
            default_channels: template_req.default_channels,
            default_priority: None,
            expires_after_hours: None,
            version: 1,
            is_active: true,
            created_by: None,
            updated_by: None,
            created_at: base_time(),
            updated_at: base_time(),
        };
        let out = render_channel(&template, Channel::Sms, &data(json!({"order_number": 7})))
            .unwrap();
        assert_eq!(out.title, "");
        assert_eq!(out.body, "Order 7 shipped");
    }
}
