//! In-process store with the same semantics as the PostgreSQL repositories.
//!
//! Used by the service and worker test suites and by embedders that want
//! the subsystem without a database. Every repository trait is implemented
//! on [`MemoryStore`]; [`StaticDirectory`] is a fixed user directory.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use courier_core::{
    defaults, AttemptUpdate, CallContext, Campaign, CampaignProgress, CampaignRepository,
    CampaignStatus, CampaignTarget, Channel, CreateCampaignRequest, CreateTemplateRequest,
    DeliveryAttempt, DeliveryLogRepository, DeliveryRate, DeliveryStatus, Error, JsonMap,
    NewDeliveryAttempt, NewNotification, Notification, NotificationFilter,
    NotificationPreferences, NotificationRepository, NotificationTemplate, Page,
    PreferenceRepository, RateLimitRepository, RateScope, RateWindow, Result, SortField,
    SortOrder, TemplateRepository, UpdateCampaignRequest, UpdateTemplateRequest, UserContact,
    UserDirectory,
};

#[derive(Default)]
struct State {
    notifications: HashMap<Uuid, Notification>,
    attempts: HashMap<Uuid, DeliveryAttempt>,
    templates: HashMap<Uuid, NotificationTemplate>,
    preferences: HashMap<Uuid, NotificationPreferences>,
    rate_windows: HashMap<(RateScope, String, i32), RateWindow>,
    campaigns: HashMap<Uuid, Campaign>,
}

/// Shared in-memory store. Clones see the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a store error until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(self.state.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Number of stored notifications, expired or not.
    pub fn notification_count(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.notifications.len())
            .unwrap_or_default()
    }

    /// Every stored attempt, ordered by queue time.
    pub fn all_attempts(&self) -> Vec<DeliveryAttempt> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut attempts: Vec<_> = state.attempts.values().cloned().collect();
        attempts.sort_by_key(|a| (a.queued_at, a.id));
        attempts
    }
}

// =============================================================================
// NOTIFICATIONS
// =============================================================================

#[async_trait]
impl NotificationRepository for MemoryStore {
    async fn create(&self, new: NewNotification, now: DateTime<Utc>) -> Result<Notification> {
        if new.channels.is_empty() {
            return Err(Error::NoChannels);
        }
        let mut state = self.lock()?;

        if let Some(key) = &new.idempotency_key {
            let mut live_holder = false;
            for n in state.notifications.values_mut() {
                if n.idempotency_key.as_deref() == Some(key.as_str()) {
                    if n.is_expired(now) {
                        n.idempotency_key = None;
                        n.updated_at = now;
                    } else {
                        live_holder = true;
                    }
                }
            }
            if live_holder {
                return Err(Error::Duplicate(format!("idempotency key {key}")));
            }
        }

        let notification = Notification {
            id: Uuid::now_v7(),
            user_id: new.user_id,
            notification_type: new.notification_type,
            title: new.title,
            message: new.message,
            payload: new.payload,
            channels: new.channels,
            delivery_status: BTreeMap::new(),
            rendered: new.rendered,
            reference: new.reference,
            idempotency_key: new.idempotency_key,
            priority: new.priority,
            expires_at: new.expires_at,
            template_code: new.template_code,
            template_version: new.template_version,
            template_data: new.template_data,
            is_read: false,
            read_at: None,
            is_sent: false,
            sent_at: None,
            created_at: now,
            updated_at: now,
        };
        state
            .notifications
            .insert(notification.id, notification.clone());
        Ok(notification)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Notification>> {
        Ok(self.lock()?.notifications.get(&id).cloned())
    }

    async fn get_by_idempotency_key(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Notification>> {
        Ok(self
            .lock()?
            .notifications
            .values()
            .find(|n| n.idempotency_key.as_deref() == Some(key) && !n.is_expired(now))
            .cloned())
    }

    async fn list(
        &self,
        user_id: Uuid,
        filter: &NotificationFilter,
        now: DateTime<Utc>,
    ) -> Result<Page<Notification>> {
        let filter = filter.normalized();
        let state = self.lock()?;
        let mut items: Vec<Notification> = state
            .notifications
            .values()
            .filter(|n| n.user_id == user_id && !n.is_expired(now) && filter.matches(n))
            .cloned()
            .collect();

        items.sort_by(|a, b| {
            let ord = match filter.sort_by {
                SortField::CreatedAt => a.created_at.cmp(&b.created_at),
                SortField::Priority => a.priority.cmp(&b.priority),
            }
            .then(a.id.cmp(&b.id));
            match filter.sort_order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });

        let total = items.len() as i64;
        let items = items
            .into_iter()
            .skip(filter.offset() as usize)
            .take(filter.size as usize)
            .collect();
        Ok(Page {
            items,
            total,
            page: filter.page,
            size: filter.size,
        })
    }

    async fn list_unsent(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Notification>> {
        let state = self.lock()?;
        let mut items: Vec<Notification> = state
            .notifications
            .values()
            .filter(|n| !n.is_sent && !n.is_expired(now) && !n.pending_channels().is_empty())
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        items.truncate(limit.max(0) as usize);
        Ok(items)
    }

    async fn mark_read(&self, user_id: Uuid, ids: &[Uuid], now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.lock()?;
        let mut changed = 0;
        for id in ids {
            if let Some(n) = state.notifications.get_mut(id) {
                if n.user_id == user_id && !n.is_read {
                    n.is_read = true;
                    n.read_at = Some(now);
                    n.updated_at = now;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn mark_all_read(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.lock()?;
        let mut changed = 0;
        for n in state.notifications.values_mut() {
            if n.user_id == user_id && !n.is_read {
                n.is_read = true;
                n.read_at = Some(now);
                n.updated_at = now;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn mark_sent(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.lock()?;
        match state.notifications.get_mut(&id) {
            Some(n) if !n.is_sent => {
                n.is_sent = true;
                n.sent_at = Some(now);
                n.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_channel_delivery_status(
        &self,
        id: Uuid,
        channel: Channel,
        status: DeliveryStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.lock()?;
        let n = state
            .notifications
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("notification {id}")))?;
        n.delivery_status.insert(channel, status);
        n.updated_at = now;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let mut state = self.lock()?;
        let removed = state.notifications.remove(&id).is_some();
        if removed {
            state.attempts.retain(|_, a| a.notification_id != id);
        }
        Ok(removed)
    }

    async fn delete_expired(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.lock()?;
        let doomed: Vec<Uuid> = state
            .notifications
            .values()
            .filter(|n| matches!(n.expires_at, Some(exp) if exp < before))
            .map(|n| n.id)
            .collect();
        for id in &doomed {
            state.notifications.remove(id);
        }
        state
            .attempts
            .retain(|_, a| !doomed.contains(&a.notification_id));
        Ok(doomed.len() as u64)
    }

    async fn delete_old_read(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.lock()?;
        let doomed: Vec<Uuid> = state
            .notifications
            .values()
            .filter(|n| n.is_read && matches!(n.read_at, Some(at) if at < before))
            .map(|n| n.id)
            .collect();
        for id in &doomed {
            state.notifications.remove(id);
        }
        state
            .attempts
            .retain(|_, a| !doomed.contains(&a.notification_id));
        Ok(doomed.len() as u64)
    }

    async fn unread_count(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<i64> {
        Ok(self
            .lock()?
            .notifications
            .values()
            .filter(|n| n.user_id == user_id && !n.is_read && !n.is_expired(now))
            .count() as i64)
    }
}

// =============================================================================
// DELIVERY ATTEMPTS
// =============================================================================

#[async_trait]
impl DeliveryLogRepository for MemoryStore {
    async fn append(
        &self,
        new: NewDeliveryAttempt,
        now: DateTime<Utc>,
    ) -> Result<DeliveryAttempt> {
        let mut state = self.lock()?;
        if !state.notifications.contains_key(&new.notification_id) {
            return Err(Error::NotFound(format!(
                "notification {}",
                new.notification_id
            )));
        }
        let latest = state
            .attempts
            .values()
            .filter(|a| a.notification_id == new.notification_id && a.channel == new.channel)
            .map(|a| a.attempt_number)
            .max()
            .unwrap_or(0);
        if new.attempt_number != latest + 1 {
            return Err(Error::Duplicate(format!(
                "attempt {} for notification {} on {}",
                new.attempt_number, new.notification_id, new.channel
            )));
        }

        let attempt = DeliveryAttempt {
            id: Uuid::now_v7(),
            notification_id: new.notification_id,
            channel: new.channel,
            attempt_number: new.attempt_number,
            status: DeliveryStatus::Queued,
            recipient: new.recipient,
            provider: new.provider,
            provider_message_id: None,
            provider_response: None,
            error_code: None,
            error_message: None,
            queued_at: now,
            processing_at: None,
            sent_at: None,
            delivered_at: None,
            opened_at: None,
            clicked_at: None,
            failed_at: None,
            retry_after: None,
            max_retries: new.max_retries,
            created_at: now,
            updated_at: now,
        };
        state.attempts.insert(attempt.id, attempt.clone());
        Ok(attempt)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeliveryAttempt>> {
        Ok(self.lock()?.attempts.get(&id).cloned())
    }

    async fn update(
        &self,
        id: Uuid,
        update: AttemptUpdate,
        now: DateTime<Utc>,
    ) -> Result<DeliveryAttempt> {
        let mut state = self.lock()?;
        let attempt = state
            .attempts
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("delivery attempt {id}")))?;
        attempt.apply(&update, now)?;
        Ok(attempt.clone())
    }

    async fn list_retry_eligible(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DeliveryAttempt>> {
        let state = self.lock()?;
        let mut items: Vec<_> = state
            .attempts
            .values()
            .filter(|a| a.is_retry_eligible(now))
            .cloned()
            .collect();
        items.sort_by_key(|a| (a.retry_after, a.id));
        items.truncate(limit.max(0) as usize);
        Ok(items)
    }

    async fn claim_retry(&self, id: Uuid) -> Result<bool> {
        let mut state = self.lock()?;
        match state.attempts.get_mut(&id) {
            Some(a) if a.status == DeliveryStatus::Failed && a.retry_after.is_some() => {
                a.retry_after = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_retry(&self, id: Uuid, retry_after: DateTime<Utc>) -> Result<bool> {
        let mut state = self.lock()?;
        match state.attempts.get_mut(&id) {
            Some(a) if a.status == DeliveryStatus::Failed && a.retry_after.is_none() => {
                a.retry_after = Some(retry_after);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_by_notification(&self, notification_id: Uuid) -> Result<Vec<DeliveryAttempt>> {
        let state = self.lock()?;
        let mut items: Vec<_> = state
            .attempts
            .values()
            .filter(|a| a.notification_id == notification_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            a.channel
                .as_str()
                .cmp(b.channel.as_str())
                .then(a.attempt_number.cmp(&b.attempt_number))
        });
        Ok(items)
    }

    async fn list_stale(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<DeliveryAttempt>> {
        let state = self.lock()?;
        let mut items: Vec<_> = state
            .attempts
            .values()
            .filter(|a| {
                matches!(a.status, DeliveryStatus::Queued | DeliveryStatus::Processing)
                    && a.processing_at.unwrap_or(a.queued_at) < before
            })
            .cloned()
            .collect();
        items.sort_by_key(|a| (a.queued_at, a.id));
        items.truncate(limit.max(0) as usize);
        Ok(items)
    }

    async fn find_by_provider_message_id(
        &self,
        provider: &str,
        provider_message_id: &str,
    ) -> Result<Option<DeliveryAttempt>> {
        Ok(self
            .lock()?
            .attempts
            .values()
            .filter(|a| {
                a.provider.as_deref() == Some(provider)
                    && a.provider_message_id.as_deref() == Some(provider_message_id)
            })
            .max_by_key(|a| (a.created_at, a.id))
            .cloned())
    }

    async fn delivery_rate(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        channel: Option<Channel>,
    ) -> Result<DeliveryRate> {
        let state = self.lock()?;
        let mut rate = DeliveryRate::default();
        for a in state.attempts.values() {
            if a.queued_at >= from && a.queued_at < to && channel.map_or(true, |c| c == a.channel)
            {
                rate.record(a.status, 1);
            }
        }
        Ok(rate.finish())
    }
}

// =============================================================================
// TEMPLATES
// =============================================================================

#[async_trait]
impl TemplateRepository for MemoryStore {
    async fn create(
        &self,
        req: &CreateTemplateRequest,
        now: DateTime<Utc>,
    ) -> Result<NotificationTemplate> {
        let mut state = self.lock()?;
        if state.templates.values().any(|t| t.code == req.code) {
            return Err(Error::Duplicate(format!("template code {}", req.code)));
        }
        let template = NotificationTemplate {
            id: Uuid::now_v7(),
            code: req.code.clone(),
            name: req.name.clone(),
            description: req.description.clone(),
            category: req.category,
            notification_type: req
                .notification_type
                .clone()
                .unwrap_or_else(|| req.code.clone()),
            content: req.content.clone(),
            required_variables: req.required_variables.clone(),
            language: req.language.clone().unwrap_or_else(|| "en".to_string()),
            default_channels: req.default_channels.clone(),
            default_priority: req.default_priority,
            expires_after_hours: req.expires_after_hours,
            version: 1,
            is_active: req.is_active,
            created_by: req.created_by.clone(),
            updated_by: req.created_by.clone(),
            created_at: now,
            updated_at: now,
        };
        state.templates.insert(template.id, template.clone());
        Ok(template)
    }

    async fn get(&self, id: Uuid) -> Result<Option<NotificationTemplate>> {
        Ok(self.lock()?.templates.get(&id).cloned())
    }

    async fn get_by_code(&self, code: &str) -> Result<Option<NotificationTemplate>> {
        Ok(self
            .lock()?
            .templates
            .values()
            .find(|t| t.code == code)
            .cloned())
    }

    async fn list(&self, active_only: bool) -> Result<Vec<NotificationTemplate>> {
        let state = self.lock()?;
        let mut items: Vec<_> = state
            .templates
            .values()
            .filter(|t| !active_only || t.is_active)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(items)
    }

    async fn update(
        &self,
        id: Uuid,
        req: &UpdateTemplateRequest,
        now: DateTime<Utc>,
    ) -> Result<NotificationTemplate> {
        let mut state = self.lock()?;
        let t = state
            .templates
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("template {id}")))?;
        if let Some(name) = &req.name {
            t.name = name.clone();
        }
        if let Some(description) = &req.description {
            t.description = Some(description.clone());
        }
        if let Some(category) = req.category {
            t.category = category;
        }
        if let Some(notification_type) = &req.notification_type {
            t.notification_type = notification_type.clone();
        }
        if let Some(content) = &req.content {
            t.content = content.clone();
        }
        if let Some(required) = &req.required_variables {
            t.required_variables = required.clone();
        }
        if let Some(language) = &req.language {
            t.language = language.clone();
        }
        if let Some(channels) = &req.default_channels {
            t.default_channels = channels.clone();
        }
        if let Some(priority) = req.default_priority {
            t.default_priority = Some(priority);
        }
        if let Some(hours) = req.expires_after_hours {
            t.expires_after_hours = Some(hours);
        }
        if let Some(active) = req.is_active {
            t.is_active = active;
        }
        if let Some(updated_by) = &req.updated_by {
            t.updated_by = Some(updated_by.clone());
        }
        t.updated_at = now;
        Ok(t.clone())
    }

    async fn increment_version(&self, id: Uuid, now: DateTime<Utc>) -> Result<i32> {
        let mut state = self.lock()?;
        let t = state
            .templates
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("template {id}")))?;
        t.version += 1;
        t.updated_at = now;
        Ok(t.version)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.lock()?.templates.remove(&id).is_some())
    }
}

// =============================================================================
// PREFERENCES
// =============================================================================

#[async_trait]
impl PreferenceRepository for MemoryStore {
    async fn get(&self, user_id: Uuid) -> Result<Option<NotificationPreferences>> {
        Ok(self.lock()?.preferences.get(&user_id).cloned())
    }

    async fn upsert(
        &self,
        prefs: &NotificationPreferences,
        now: DateTime<Utc>,
    ) -> Result<NotificationPreferences> {
        let mut state = self.lock()?;
        let created_at = state
            .preferences
            .get(&prefs.user_id)
            .map_or(now, |p| p.created_at);
        let stored = NotificationPreferences {
            created_at,
            updated_at: now,
            ..prefs.clone()
        };
        state.preferences.insert(prefs.user_id, stored.clone());
        Ok(stored)
    }
}

// =============================================================================
// RATE WINDOWS
// =============================================================================

#[async_trait]
impl RateLimitRepository for MemoryStore {
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
        let mut state = self.lock()?;
        let window = state
            .rate_windows
            .entry((scope, scope_id.to_string(), window_minutes))
            .or_insert_with(|| RateWindow {
                scope,
                scope_id: scope_id.to_string(),
                window_minutes,
                count: 0,
                window_start: now,
            });
        if !window.is_open(now) {
            window.count = 0;
            window.window_start = now;
        }
        if window.count >= max {
            return Ok(false);
        }
        window.count += 1;
        Ok(true)
    }

    async fn get_window(
        &self,
        scope: RateScope,
        scope_id: &str,
        window_minutes: i32,
    ) -> Result<Option<RateWindow>> {
        Ok(self
            .lock()?
            .rate_windows
            .get(&(scope, scope_id.to_string(), window_minutes))
            .cloned())
    }

    async fn delete_expired_windows(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.lock()?;
        let len = state.rate_windows.len();
        state.rate_windows.retain(|_, w| w.window_end() >= before);
        Ok((len - state.rate_windows.len()) as u64)
    }
}

// =============================================================================
// CAMPAIGNS
// =============================================================================

#[async_trait]
impl CampaignRepository for MemoryStore {
    async fn create(
        &self,
        req: &CreateCampaignRequest,
        status: CampaignStatus,
        now: DateTime<Utc>,
    ) -> Result<Campaign> {
        let campaign = Campaign {
            id: Uuid::now_v7(),
            name: req.name.clone(),
            description: req.description.clone(),
            template_code: req.template_code.clone(),
            target: req.target.clone(),
            channels: req.channels.clone(),
            template_data: req.template_data.clone(),
            scheduled_at: req.scheduled_at,
            status,
            batch_size: req.batch_size.unwrap_or(defaults::CAMPAIGN_BATCH_SIZE),
            batch_delay_seconds: req
                .batch_delay_seconds
                .unwrap_or(defaults::CAMPAIGN_BATCH_DELAY_SECONDS),
            cursor: 0,
            progress: CampaignProgress::default(),
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            created_by: req.created_by.clone(),
            created_at: now,
            updated_at: now,
        };
        self.lock()?
            .campaigns
            .insert(campaign.id, campaign.clone());
        Ok(campaign)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Campaign>> {
        Ok(self.lock()?.campaigns.get(&id).cloned())
    }

    async fn list(
        &self,
        status: Option<CampaignStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Campaign>> {
        let state = self.lock()?;
        let mut items: Vec<_> = state
            .campaigns
            .values()
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(items
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn update(
        &self,
        id: Uuid,
        req: &UpdateCampaignRequest,
        now: DateTime<Utc>,
    ) -> Result<Campaign> {
        let mut state = self.lock()?;
        let c = state
            .campaigns
            .get_mut(&id)
            .ok_or(Error::CampaignNotFound(id))?;
        if !matches!(c.status, CampaignStatus::Draft | CampaignStatus::Scheduled) {
            return Err(Error::Conflict(format!(
                "campaign {id} is {} and can no longer be edited",
                c.status
            )));
        }
        if let Some(name) = &req.name {
            c.name = name.clone();
        }
        if let Some(description) = &req.description {
            c.description = Some(description.clone());
        }
        if let Some(target) = &req.target {
            c.target = target.clone();
        }
        if let Some(channels) = &req.channels {
            c.channels = Some(channels.clone());
        }
        if let Some(data) = &req.template_data {
            c.template_data = data.clone();
        }
        if let Some(at) = req.scheduled_at {
            c.scheduled_at = Some(at);
        }
        if let Some(size) = req.batch_size {
            c.batch_size = size;
        }
        if let Some(delay) = req.batch_delay_seconds {
            c.batch_delay_seconds = delay;
        }
        c.updated_at = now;
        Ok(c.clone())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.lock()?.campaigns.remove(&id).is_some())
    }

    async fn list_scheduled_due(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        let state = self.lock()?;
        let mut items: Vec<_> = state
            .campaigns
            .values()
            .filter(|c| {
                c.status == CampaignStatus::Scheduled
                    && matches!(c.scheduled_at, Some(at) if at <= now)
            })
            .cloned()
            .collect();
        items.sort_by_key(|c| (c.scheduled_at, c.id));
        Ok(items)
    }

    async fn list_running(&self) -> Result<Vec<Campaign>> {
        let state = self.lock()?;
        let mut items: Vec<_> = state
            .campaigns
            .values()
            .filter(|c| c.status == CampaignStatus::Running)
            .cloned()
            .collect();
        items.sort_by_key(|c| (c.started_at, c.id));
        Ok(items)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[CampaignStatus],
        to: CampaignStatus,
        now: DateTime<Utc>,
    ) -> Result<Campaign> {
        let mut state = self.lock()?;
        let c = state
            .campaigns
            .get_mut(&id)
            .ok_or(Error::CampaignNotFound(id))?;
        if !from.contains(&c.status) {
            return Err(Error::Conflict(format!(
                "campaign {id} cannot move from {} to {to}",
                c.status
            )));
        }
        c.status = to;
        match to {
            CampaignStatus::Running => {
                c.started_at.get_or_insert(now);
            }
            CampaignStatus::Completed => c.completed_at = Some(now),
            CampaignStatus::Cancelled => c.cancelled_at = Some(now),
            _ => {}
        }
        c.updated_at = now;
        Ok(c.clone())
    }

    async fn increment_progress(
        &self,
        id: Uuid,
        expected_cursor: i64,
        advance: i64,
        delta: &CampaignProgress,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.lock()?;
        match state.campaigns.get_mut(&id) {
            Some(c) if c.status == CampaignStatus::Running && c.cursor == expected_cursor => {
                c.cursor += advance;
                c.progress.add(delta);
                c.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment_delivered(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        if let Some(c) = self.lock()?.campaigns.get_mut(&id) {
            c.progress.delivered += 1;
            c.updated_at = now;
        }
        Ok(())
    }
}

// =============================================================================
// USER DIRECTORY
// =============================================================================

#[derive(Debug, Clone, Default)]
struct DirectoryEntry {
    contact: UserContact,
    segments: Vec<String>,
    attributes: JsonMap,
}

/// Fixed user directory keyed by user id.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    users: Arc<Mutex<BTreeMap<Uuid, DirectoryEntry>>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user.
    pub fn insert(&self, contact: UserContact) -> &Self {
        self.insert_with(contact, Vec::new(), JsonMap::new())
    }

    /// Add or replace a user with segment memberships and attributes.
    pub fn insert_with(
        &self,
        contact: UserContact,
        segments: Vec<String>,
        attributes: JsonMap,
    ) -> &Self {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        users.insert(
            contact.user_id,
            DirectoryEntry {
                contact,
                segments,
                attributes,
            },
        );
        self
    }

    pub fn remove(&self, user_id: Uuid) {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        users.remove(&user_id);
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn lookup(&self, ctx: &CallContext, user_id: Uuid) -> Result<Option<UserContact>> {
        ctx.check()?;
        let users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        Ok(users.get(&user_id).map(|e| e.contact.clone()))
    }

    async fn list_audience(
        &self,
        ctx: &CallContext,
        target: &CampaignTarget,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Uuid>> {
        ctx.check()?;
        let ids: Vec<Uuid> = match target {
            CampaignTarget::SpecificUsers { user_ids } => {
                let mut ids = user_ids.clone();
                ids.sort();
                ids.dedup();
                ids
            }
            _ => {
                let users = self.users.lock().unwrap_or_else(|e| e.into_inner());
                users
                    .values()
                    .filter(|e| match target {
                        CampaignTarget::AllUsers => true,
                        CampaignTarget::Segment { segment } => e.segments.contains(segment),
                        CampaignTarget::Filter { filter } => filter
                            .iter()
                            .all(|(k, v)| e.attributes.get(k) == Some(v)),
                        CampaignTarget::SpecificUsers { .. } => false,
                    })
                    .map(|e| e.contact.user_id)
                    .collect()
            }
        };
        Ok(ids
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }
}
