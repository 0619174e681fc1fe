//! Send entry points.
//!
//! The dispatcher decides and persists; it never talks to gateways. A
//! persisted notification has `is_sent = false` and an empty delivery
//! status map until the delivery worker claims it.
//!
//! ## Order of checks (templated sends)
//!
//! 1. Load the active template and validate required variables
//! 2. Return the live notification holding the idempotency key, if any
//! 3. Filter channels through the preferences gate
//! 4. Render every surviving channel, dropping channels that fail
//! 5. Count the send against the rate windows (fails open)
//! 6. Persist with the `(code, version)` and rendered content snapshot
//!
//! Duplicate requests therefore consume no rate quota, and refused requests
//! never count as sends.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use courier_core::keys::{idempotency_key, validate_type_code};
use courier_core::{
    dedup_channels, CallContext, Channel, Clock, CreateNotificationRequest, Error, NewNotification,
    Notification, NotificationRepository, RenderedContent, Result, SendWithTemplateRequest,
};

use crate::preferences::PreferencesGate;
use crate::rate_limit::RateLimiter;
use crate::templates::{check_variables, render_channel, TemplateService};

#[derive(Clone)]
pub struct Dispatcher {
    notifications: Arc<dyn NotificationRepository>,
    templates: TemplateService,
    gate: PreferencesGate,
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    pub fn new(
        notifications: Arc<dyn NotificationRepository>,
        templates: TemplateService,
        gate: PreferencesGate,
        limiter: RateLimiter,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            notifications,
            templates,
            gate,
            limiter,
            clock,
        }
    }

    /// Create a notification from a template.
    #[instrument(
        skip(self, ctx, req),
        fields(subsystem = "dispatch", op = "send_with_template", user_id = %req.user_id, template = %req.template_code)
    )]
    pub async fn send_with_template(
        &self,
        ctx: &CallContext,
        req: SendWithTemplateRequest,
    ) -> Result<Notification> {
        ctx.run(self.send_with_template_inner(req)).await
    }

    async fn send_with_template_inner(&self, req: SendWithTemplateRequest) -> Result<Notification> {
        let start = Instant::now();
        let template = self.templates.get_active(&req.template_code).await?;
        check_variables(&template, &req.data)?;

        let key = idempotency_key(
            &template.code,
            req.reference.as_ref(),
            req.idempotency_nonce.as_deref(),
            req.user_id,
        );
        if let Some(existing) = self.find_live(key.as_deref()).await? {
            debug!(notification_id = %existing.id, "Idempotent replay");
            return Ok(existing);
        }

        let requested =
            dedup_channels(req.channels.as_deref().unwrap_or(&template.default_channels));
        let allowed = self
            .allowed_channels(req.user_id, &template.notification_type, &requested)
            .await?;

        let mut rendered: BTreeMap<Channel, RenderedContent> = BTreeMap::new();
        for channel in &allowed {
            match render_channel(&template, *channel, &req.data) {
                Ok(content) => {
                    rendered.insert(*channel, content);
                }
                Err(e) => warn!(
                    channel = %channel,
                    error = %e,
                    "Dropping channel that failed to render"
                ),
            }
        }
        let channels: Vec<Channel> = allowed
            .into_iter()
            .filter(|c| rendered.contains_key(c))
            .collect();
        let Some(primary) = channels
            .iter()
            .find(|c| **c == Channel::InApp)
            .or_else(|| channels.first())
            .and_then(|c| rendered.get(c))
            .cloned()
        else {
            return Err(Error::NoChannels);
        };

        self.limiter
            .check_and_increment(req.user_id, &template.notification_type)
            .await?;

        let now = self.clock.now();
        let new = NewNotification {
            user_id: req.user_id,
            notification_type: template.notification_type.clone(),
            title: primary.title,
            message: primary.body,
            payload: req.data.clone(),
            channels,
            rendered,
            reference: req.reference,
            idempotency_key: key,
            priority: req
                .priority
                .or(template.default_priority)
                .unwrap_or_default(),
            expires_at: template.expiry_from(now),
            template_code: Some(template.code.clone()),
            template_version: Some(template.version),
            template_data: Some(req.data),
        };
        let notification = self.persist(new, now).await?;

        info!(
            notification_id = %notification.id,
            channels = ?notification.channels,
            version = template.version,
            duration_ms = start.elapsed().as_millis() as u64,
            "Notification queued"
        );
        Ok(notification)
    }

    /// Create a notification from literal content.
    #[instrument(
        skip(self, ctx, req),
        fields(subsystem = "dispatch", op = "create_raw", user_id = %req.user_id, notification_type = %req.notification_type)
    )]
    pub async fn create_raw(
        &self,
        ctx: &CallContext,
        req: CreateNotificationRequest,
    ) -> Result<Notification> {
        ctx.run(self.create_raw_inner(req)).await
    }

    async fn create_raw_inner(&self, req: CreateNotificationRequest) -> Result<Notification> {
        let start = Instant::now();
        validate_type_code(&req.notification_type)?;
        if req.title.trim().is_empty() {
            return Err(Error::InvalidInput("title is required".into()));
        }
        let requested = dedup_channels(&req.channels);
        if requested.is_empty() {
            return Err(Error::NoChannels);
        }

        let key = idempotency_key(
            &req.notification_type,
            req.reference.as_ref(),
            req.idempotency_nonce.as_deref(),
            req.user_id,
        );
        if let Some(existing) = self.find_live(key.as_deref()).await? {
            debug!(notification_id = %existing.id, "Idempotent replay");
            return Ok(existing);
        }

        let channels = self
            .allowed_channels(req.user_id, &req.notification_type, &requested)
            .await?;

        self.limiter
            .check_and_increment(req.user_id, &req.notification_type)
            .await?;

        let now = self.clock.now();
        let new = NewNotification {
            user_id: req.user_id,
            notification_type: req.notification_type,
            title: req.title,
            message: req.message,
            payload: req.payload.unwrap_or_default(),
            channels,
            rendered: BTreeMap::new(),
            reference: req.reference,
            idempotency_key: key,
            priority: req.priority.unwrap_or_default(),
            expires_at: req.expires_at,
            template_code: req.template_code,
            template_version: None,
            template_data: req.template_data,
        };
        let notification = self.persist(new, now).await?;

        info!(
            notification_id = %notification.id,
            channels = ?notification.channels,
            duration_ms = start.elapsed().as_millis() as u64,
            "Notification queued"
        );
        Ok(notification)
    }

    async fn find_live(&self, key: Option<&str>) -> Result<Option<Notification>> {
        match key {
            Some(key) => {
                self.notifications
                    .get_by_idempotency_key(key, self.clock.now())
                    .await
            }
            None => Ok(None),
        }
    }

    /// Channels the gate admits, in request order; `NoChannels` when none.
    async fn allowed_channels(
        &self,
        user_id: Uuid,
        notification_type: &str,
        requested: &[Channel],
    ) -> Result<Vec<Channel>> {
        let mut allowed = Vec::with_capacity(requested.len());
        for (channel, decision) in self.gate.evaluate(user_id, notification_type, requested).await {
            match decision.reason {
                None => allowed.push(channel),
                Some(reason) => debug!(
                    channel = %channel,
                    reason = reason.as_str(),
                    "Channel refused by preferences"
                ),
            }
        }
        if allowed.is_empty() {
            return Err(Error::NoChannels);
        }
        Ok(allowed)
    }

    /// Insert; a lost race on the idempotency key returns the winner.
    async fn persist(
        &self,
        new: NewNotification,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Notification> {
        let key = new.idempotency_key.clone();
        match self.notifications.create(new, now).await {
            Err(Error::Duplicate(what)) => match self.find_live(key.as_deref()).await? {
                Some(existing) => Ok(existing),
                None => Err(Error::Duplicate(what)),
            },
            other => other,
        }
    }
}
