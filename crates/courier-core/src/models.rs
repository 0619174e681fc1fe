//! Domain models for the notification subsystem.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::defaults;
use crate::error::{Error, Result};

/// Opaque string-keyed JSON object (payloads, template data, filters).
pub type JsonMap = serde_json::Map<String, JsonValue>;

// =============================================================================
// CHANNELS & PRIORITY
// =============================================================================

/// Destination medium for a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    InApp,
    Email,
    Push,
    Sms,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::InApp, Channel::Email, Channel::Push, Channel::Sms];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::InApp => "in_app",
            Channel::Email => "email",
            Channel::Push => "push",
            Channel::Sms => "sms",
        }
    }

    /// In-app is pulled by the user and SMS is reserved for urgent traffic,
    /// so neither is held back by quiet hours.
    pub fn bypasses_quiet_hours(&self) -> bool {
        matches!(self, Channel::InApp | Channel::Sms)
    }

    /// Parse a list of channel names, dropping duplicates but keeping order.
    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> Result<Vec<Channel>> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let channel: Channel = name.as_ref().parse()?;
            if !out.contains(&channel) {
                out.push(channel);
            }
        }
        Ok(out)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in_app" => Ok(Channel::InApp),
            "email" => Ok(Channel::Email),
            "push" => Ok(Channel::Push),
            "sms" => Ok(Channel::Sms),
            other => Err(Error::InvalidChannel(other.to_string())),
        }
    }
}

/// Remove duplicate channels while keeping first-seen order.
pub fn dedup_channels(channels: &[Channel]) -> Vec<Channel> {
    let mut out: Vec<Channel> = Vec::with_capacity(channels.len());
    for c in channels {
        if !out.contains(c) {
            out.push(*c);
        }
    }
    out
}

/// Notification priority (higher is processed earlier within a sweep).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i16", into = "i16")]
pub enum Priority {
    Low = 1,
    Medium = 2,
    High = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl TryFrom<i16> for Priority {
    type Error = Error;

    fn try_from(value: i16) -> Result<Self> {
        match value {
            1 => Ok(Priority::Low),
            2 => Ok(Priority::Medium),
            3 => Ok(Priority::High),
            other => Err(Error::InvalidInput(format!(
                "priority must be 1, 2 or 3, got {other}"
            ))),
        }
    }
}

impl From<Priority> for i16 {
    fn from(p: Priority) -> i16 {
        p as i16
    }
}

// =============================================================================
// DELIVERY STATUS
// =============================================================================

/// Status of one delivery attempt, also used in a notification's per-channel map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Queued,
    Processing,
    Sent,
    Delivered,
    Failed,
    Bounced,
    Opened,
    Clicked,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Queued => "queued",
            DeliveryStatus::Processing => "processing",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Bounced => "bounced",
            DeliveryStatus::Opened => "opened",
            DeliveryStatus::Clicked => "clicked",
        }
    }

    /// Delivered and bounced rows never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Bounced)
    }

    /// The gateway accepted the message at some point.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Sent
                | DeliveryStatus::Delivered
                | DeliveryStatus::Opened
                | DeliveryStatus::Clicked
        )
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(DeliveryStatus::Queued),
            "processing" => Ok(DeliveryStatus::Processing),
            "sent" => Ok(DeliveryStatus::Sent),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            "bounced" => Ok(DeliveryStatus::Bounced),
            "opened" => Ok(DeliveryStatus::Opened),
            "clicked" => Ok(DeliveryStatus::Clicked),
            other => Err(Error::Serialization(format!(
                "unknown delivery status: {other}"
            ))),
        }
    }
}

/// Per-channel delivery status of a notification.
pub type DeliveryStatusMap = BTreeMap<Channel, DeliveryStatus>;

// =============================================================================
// NOTIFICATIONS
// =============================================================================

/// Link from a notification to the domain object it is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationReference {
    pub reference_type: String,
    pub reference_id: String,
}

impl NotificationReference {
    pub fn new(reference_type: impl Into<String>, reference_id: impl Into<String>) -> Self {
        Self {
            reference_type: reference_type.into(),
            reference_id: reference_id.into(),
        }
    }

    /// Reference used for every notification produced by a campaign.
    pub fn campaign(campaign_id: Uuid) -> Self {
        Self::new("campaign", campaign_id.to_string())
    }
}

/// Content rendered for one channel at dispatch time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedContent {
    /// Email subject, push title or in-app title. Empty for SMS.
    pub title: String,
    /// Email HTML body, SMS text, push body or in-app body.
    pub body: String,
    /// Plain-text alternative (email only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_body: Option<String>,
    /// Deep link (in-app only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_url: Option<String>,
}

impl RenderedContent {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            text_body: None,
            action_url: None,
        }
    }
}

/// A notification: the unit of work for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub notification_type: String,
    pub title: String,
    pub message: String,
    pub payload: JsonMap,
    pub channels: Vec<Channel>,
    pub delivery_status: DeliveryStatusMap,
    /// Content captured per channel when the notification was created.
    pub rendered: BTreeMap<Channel, RenderedContent>,
    pub reference: Option<NotificationReference>,
    pub idempotency_key: Option<String>,
    pub priority: Priority,
    pub expires_at: Option<DateTime<Utc>>,
    pub template_code: Option<String>,
    pub template_version: Option<i32>,
    pub template_data: Option<JsonMap>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub is_sent: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Notification {
    /// A notification at or past its expiry is not sent or listed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if now >= exp)
    }

    /// Channels that have never been attempted or skipped.
    pub fn pending_channels(&self) -> Vec<Channel> {
        self.channels
            .iter()
            .copied()
            .filter(|c| !self.delivery_status.contains_key(c))
            .collect()
    }

    /// At least one channel has been accepted by its gateway.
    pub fn has_successful_channel(&self) -> bool {
        self.delivery_status.values().any(|s| s.is_success())
    }

    /// Content to deliver on `channel`, falling back to the stored title/message.
    pub fn content_for(&self, channel: Channel) -> RenderedContent {
        self.rendered
            .get(&channel)
            .cloned()
            .unwrap_or_else(|| RenderedContent::new(&self.title, &self.message))
    }

    /// Campaign id when this notification was produced by a campaign.
    pub fn campaign_id(&self) -> Option<Uuid> {
        self.reference
            .as_ref()
            .filter(|r| r.reference_type == "campaign")
            .and_then(|r| Uuid::parse_str(&r.reference_id).ok())
    }
}

/// Store input for a new notification.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: Uuid,
    pub notification_type: String,
    pub title: String,
    pub message: String,
    pub payload: JsonMap,
    pub channels: Vec<Channel>,
    pub rendered: BTreeMap<Channel, RenderedContent>,
    pub reference: Option<NotificationReference>,
    pub idempotency_key: Option<String>,
    pub priority: Priority,
    pub expires_at: Option<DateTime<Utc>>,
    pub template_code: Option<String>,
    pub template_version: Option<i32>,
    pub template_data: Option<JsonMap>,
}

/// Request to send a templated notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendWithTemplateRequest {
    pub user_id: Uuid,
    pub template_code: String,
    /// Overrides the template's default channels.
    #[serde(default)]
    pub channels: Option<Vec<Channel>>,
    #[serde(default)]
    pub data: JsonMap,
    #[serde(default)]
    pub reference: Option<NotificationReference>,
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Caller-chosen deduplication token used when there is no reference.
    #[serde(default)]
    pub idempotency_nonce: Option<String>,
}

impl SendWithTemplateRequest {
    pub fn new(user_id: Uuid, template_code: impl Into<String>) -> Self {
        Self {
            user_id,
            template_code: template_code.into(),
            channels: None,
            data: JsonMap::new(),
            reference: None,
            priority: None,
            idempotency_nonce: None,
        }
    }

    pub fn with_data(mut self, data: JsonMap) -> Self {
        self.data = data;
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_channels(mut self, channels: Vec<Channel>) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn with_reference(mut self, reference: NotificationReference) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.idempotency_nonce = Some(nonce.into());
        self
    }
}

/// Request to create a notification from literal content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNotificationRequest {
    pub user_id: Uuid,
    pub notification_type: String,
    pub title: String,
    pub message: String,
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub payload: Option<JsonMap>,
    #[serde(default)]
    pub reference: Option<NotificationReference>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub template_code: Option<String>,
    #[serde(default)]
    pub template_data: Option<JsonMap>,
    #[serde(default)]
    pub idempotency_nonce: Option<String>,
}

impl CreateNotificationRequest {
    pub fn new(
        user_id: Uuid,
        notification_type: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
        channels: Vec<Channel>,
    ) -> Self {
        Self {
            user_id,
            notification_type: notification_type.into(),
            title: title.into(),
            message: message.into(),
            channels,
            payload: None,
            reference: None,
            priority: None,
            expires_at: None,
            template_code: None,
            template_data: None,
            idempotency_nonce: None,
        }
    }
}

/// Sort column for inbox listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    CreatedAt,
    Priority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Inbox listing filters. `page` is 1-based.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationFilter {
    #[serde(default)]
    pub notification_type: Option<String>,
    #[serde(default)]
    pub is_read: Option<bool>,
    #[serde(default)]
    pub channel: Option<Channel>,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub size: i64,
    #[serde(default)]
    pub sort_by: SortField,
    #[serde(default)]
    pub sort_order: SortOrder,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    defaults::PAGE_SIZE
}

impl Default for NotificationFilter {
    fn default() -> Self {
        Self {
            notification_type: None,
            is_read: None,
            channel: None,
            page: default_page(),
            size: default_page_size(),
            sort_by: SortField::default(),
            sort_order: SortOrder::default(),
        }
    }
}

impl NotificationFilter {
    /// Clamp page and size into their accepted ranges.
    pub fn normalized(&self) -> Self {
        let mut f = self.clone();
        f.page = f.page.max(1);
        f.size = f.size.clamp(1, defaults::PAGE_SIZE_MAX);
        f
    }

    pub fn offset(&self) -> i64 {
        (self.page.max(1) - 1) * self.size.max(1)
    }

    /// Whether `n` passes the type/read/channel filters.
    pub fn matches(&self, n: &Notification) -> bool {
        if let Some(t) = &self.notification_type {
            if &n.notification_type != t {
                return false;
            }
        }
        if let Some(read) = self.is_read {
            if n.is_read != read {
                return false;
            }
        }
        if let Some(ch) = self.channel {
            if !n.channels.contains(&ch) {
                return false;
            }
        }
        true
    }
}

/// One page of results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub size: i64,
}

// =============================================================================
// DELIVERY ATTEMPTS
// =============================================================================

/// One delivery try for (notification, channel).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub channel: Channel,
    pub attempt_number: i32,
    pub status: DeliveryStatus,
    pub recipient: String,
    pub provider: Option<String>,
    pub provider_message_id: Option<String>,
    pub provider_response: Option<JsonValue>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub processing_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub retry_after: Option<DateTime<Utc>>,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    /// Failed, backoff elapsed, and under the attempt cap.
    pub fn is_retry_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Failed
            && self.attempt_number < self.max_retries
            && matches!(self.retry_after, Some(at) if at <= now)
    }

    /// Apply a status change in memory, enforcing terminal finality.
    pub fn apply(&mut self, update: &AttemptUpdate, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() && !update.is_engagement() {
            return Err(Error::Conflict(format!(
                "attempt {} is {} and cannot change",
                self.id, self.status
            )));
        }
        match update {
            AttemptUpdate::Processing => {
                self.status = DeliveryStatus::Processing;
                self.processing_at = Some(now);
            }
            AttemptUpdate::Sent {
                provider_message_id,
                response,
            } => {
                self.status = DeliveryStatus::Sent;
                self.sent_at = Some(now);
                self.provider_message_id = provider_message_id.clone();
                self.provider_response = response.clone();
                self.retry_after = None;
            }
            AttemptUpdate::Failed {
                error_code,
                error_message,
                retry_after,
            } => {
                self.status = DeliveryStatus::Failed;
                self.failed_at = Some(now);
                self.error_code = Some(error_code.clone());
                self.error_message = Some(error_message.clone());
                self.retry_after = *retry_after;
            }
            AttemptUpdate::Delivered => {
                self.status = DeliveryStatus::Delivered;
                self.delivered_at = Some(now);
            }
            AttemptUpdate::Bounced {
                error_code,
                error_message,
            } => {
                self.status = DeliveryStatus::Bounced;
                self.failed_at = Some(now);
                self.error_code = Some(error_code.clone());
                self.error_message = Some(error_message.clone());
                self.retry_after = None;
            }
            AttemptUpdate::Opened => {
                self.opened_at.get_or_insert(now);
                if !self.status.is_terminal() {
                    self.status = DeliveryStatus::Opened;
                }
            }
            AttemptUpdate::Clicked => {
                self.clicked_at.get_or_insert(now);
                if !self.status.is_terminal() {
                    self.status = DeliveryStatus::Clicked;
                }
            }
        }
        self.updated_at = now;
        Ok(())
    }
}

/// Store input for a new attempt. The row starts as `queued`.
#[derive(Debug, Clone)]
pub struct NewDeliveryAttempt {
    pub notification_id: Uuid,
    pub channel: Channel,
    /// Must be exactly one more than the latest attempt for the pair.
    pub attempt_number: i32,
    pub recipient: String,
    pub provider: Option<String>,
    pub max_retries: i32,
}

/// A status change on an existing attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptUpdate {
    Processing,
    Sent {
        provider_message_id: Option<String>,
        response: Option<JsonValue>,
    },
    Failed {
        error_code: String,
        error_message: String,
        retry_after: Option<DateTime<Utc>>,
    },
    Delivered,
    Bounced {
        error_code: String,
        error_message: String,
    },
    Opened,
    Clicked,
}

impl AttemptUpdate {
    /// Engagement events stamp timestamps even on terminal rows.
    pub fn is_engagement(&self) -> bool {
        matches!(self, AttemptUpdate::Opened | AttemptUpdate::Clicked)
    }

    /// Status the attempt ends up in (ignoring terminal preservation).
    pub fn status(&self) -> DeliveryStatus {
        match self {
            AttemptUpdate::Processing => DeliveryStatus::Processing,
            AttemptUpdate::Sent { .. } => DeliveryStatus::Sent,
            AttemptUpdate::Failed { .. } => DeliveryStatus::Failed,
            AttemptUpdate::Delivered => DeliveryStatus::Delivered,
            AttemptUpdate::Bounced { .. } => DeliveryStatus::Bounced,
            AttemptUpdate::Opened => DeliveryStatus::Opened,
            AttemptUpdate::Clicked => DeliveryStatus::Clicked,
        }
    }
}

/// What a driver hands back after the gateway accepted a message.
#[derive(Debug, Clone, PartialEq)]
pub struct SendReceipt {
    pub provider_message_id: String,
    pub response: Option<JsonValue>,
}

impl SendReceipt {
    pub fn new(provider_message_id: impl Into<String>) -> Self {
        Self {
            provider_message_id: provider_message_id.into(),
            response: None,
        }
    }
}

/// Attempt outcome totals over a time range.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRate {
    pub total: i64,
    pub pending: i64,
    pub sent: i64,
    pub delivered: i64,
    pub failed: i64,
    pub bounced: i64,
    /// `(sent + delivered) / total`, 0 when there are no attempts.
    pub success_rate: f64,
}

impl DeliveryRate {
    /// Tally `count` attempts with `status` into the totals.
    pub fn record(&mut self, status: DeliveryStatus, count: i64) {
        self.total += count;
        match status {
            DeliveryStatus::Queued | DeliveryStatus::Processing => self.pending += count,
            DeliveryStatus::Sent => self.sent += count,
            DeliveryStatus::Delivered | DeliveryStatus::Opened | DeliveryStatus::Clicked => {
                self.delivered += count
            }
            DeliveryStatus::Failed => self.failed += count,
            DeliveryStatus::Bounced => self.bounced += count,
        }
    }

    pub fn finish(mut self) -> Self {
        self.success_rate = if self.total == 0 {
            0.0
        } else {
            (self.sent + self.delivered) as f64 / self.total as f64
        };
        self
    }
}

// =============================================================================
// TEMPLATES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateCategory {
    Transactional,
    Marketing,
    System,
}

impl TemplateCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateCategory::Transactional => "transactional",
            TemplateCategory::Marketing => "marketing",
            TemplateCategory::System => "system",
        }
    }
}

impl FromStr for TemplateCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "transactional" => Ok(TemplateCategory::Transactional),
            "marketing" => Ok(TemplateCategory::Marketing),
            "system" => Ok(TemplateCategory::System),
            other => Err(Error::InvalidInput(format!(
                "unknown template category: {other}"
            ))),
        }
    }
}

/// Per-channel content slots of a template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateContent {
    #[serde(default)]
    pub email_subject: Option<String>,
    #[serde(default)]
    pub email_html: Option<String>,
    #[serde(default)]
    pub email_text: Option<String>,
    #[serde(default)]
    pub sms_body: Option<String>,
    #[serde(default)]
    pub push_title: Option<String>,
    #[serde(default)]
    pub push_body: Option<String>,
    #[serde(default)]
    pub in_app_title: Option<String>,
    #[serde(default)]
    pub in_app_body: Option<String>,
    #[serde(default)]
    pub in_app_action_url: Option<String>,
}

fn slot_filled(slot: &Option<String>) -> bool {
    slot.as_deref().is_some_and(|s| !s.trim().is_empty())
}

impl TemplateContent {
    /// Names of the slots `channel` needs that are empty.
    pub fn missing_slots(&self, channel: Channel) -> Vec<&'static str> {
        let required: Vec<(&'static str, &Option<String>)> = match channel {
            Channel::Email => vec![("email_subject", &self.email_subject)],
            Channel::Sms => vec![("sms_body", &self.sms_body)],
            Channel::Push => vec![
                ("push_title", &self.push_title),
                ("push_body", &self.push_body),
            ],
            Channel::InApp => vec![
                ("in_app_title", &self.in_app_title),
                ("in_app_body", &self.in_app_body),
            ],
        };
        let mut missing: Vec<&'static str> = required
            .into_iter()
            .filter(|(_, slot)| !slot_filled(slot))
            .map(|(name, _)| name)
            .collect();
        if channel == Channel::Email
            && !slot_filled(&self.email_html)
            && !slot_filled(&self.email_text)
        {
            missing.push("email_html");
        }
        missing
    }
}

/// A versioned content definition addressed by `code`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationTemplate {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub category: TemplateCategory,
    /// Notification type used for preference lookups.
    pub notification_type: String,
    #[serde(flatten)]
    pub content: TemplateContent,
    pub required_variables: Vec<String>,
    pub language: String,
    pub default_channels: Vec<Channel>,
    pub default_priority: Option<Priority>,
    pub expires_after_hours: Option<i32>,
    pub version: i32,
    pub is_active: bool,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationTemplate {
    /// Expiry for a notification created from this template at `now`.
    pub fn expiry_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expires_after_hours
            .filter(|h| *h > 0)
            .map(|h| now + Duration::hours(i64::from(h)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTemplateRequest {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub category: TemplateCategory,
    /// Defaults to `code`.
    #[serde(default)]
    pub notification_type: Option<String>,
    #[serde(default)]
    pub content: TemplateContent,
    #[serde(default)]
    pub required_variables: Vec<String>,
    #[serde(default)]
    pub language: Option<String>,
    pub default_channels: Vec<Channel>,
    #[serde(default)]
    pub default_priority: Option<Priority>,
    #[serde(default)]
    pub expires_after_hours: Option<i32>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub created_by: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Partial template update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateTemplateRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<TemplateCategory>,
    #[serde(default)]
    pub notification_type: Option<String>,
    #[serde(default)]
    pub content: Option<TemplateContent>,
    #[serde(default)]
    pub required_variables: Option<Vec<String>>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub default_channels: Option<Vec<Channel>>,
    #[serde(default)]
    pub default_priority: Option<Priority>,
    #[serde(default)]
    pub expires_after_hours: Option<i32>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub updated_by: Option<String>,
}

impl UpdateTemplateRequest {
    /// Whether applying this update to `current` changes rendered output.
    pub fn changes_content(&self, current: &NotificationTemplate) -> bool {
        self.content.as_ref().is_some_and(|c| c != &current.content)
            || self
                .required_variables
                .as_ref()
                .is_some_and(|r| r != &current.required_variables)
    }
}

// =============================================================================
// PREFERENCES
// =============================================================================

/// Channel switches for one notification type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelToggles {
    #[serde(default = "default_true")]
    pub in_app: bool,
    #[serde(default = "default_true")]
    pub email: bool,
    #[serde(default = "default_true")]
    pub push: bool,
    /// Absent means allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sms: Option<bool>,
}

impl Default for ChannelToggles {
    fn default() -> Self {
        Self {
            in_app: true,
            email: true,
            push: true,
            sms: None,
        }
    }
}

impl ChannelToggles {
    pub fn new(in_app: bool, email: bool, push: bool) -> Self {
        Self {
            in_app,
            email,
            push,
            sms: None,
        }
    }

    pub fn allows(&self, channel: Channel) -> bool {
        match channel {
            Channel::InApp => self.in_app,
            Channel::Email => self.email,
            Channel::Push => self.push,
            Channel::Sms => self.sms.unwrap_or(true),
        }
    }
}

/// A user's notification settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPreferences {
    pub user_id: Uuid,
    pub preferences: BTreeMap<String, ChannelToggles>,
    pub do_not_disturb: bool,
    pub quiet_hours_start: Option<NaiveTime>,
    pub quiet_hours_end: Option<NaiveTime>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationPreferences {
    /// The seed used for users who never saved preferences.
    pub fn default_for(user_id: Uuid, now: DateTime<Utc>) -> Self {
        let mut preferences = BTreeMap::new();
        for t in defaults::TRANSACTIONAL_TYPES {
            preferences.insert((*t).to_string(), ChannelToggles::new(true, true, false));
        }
        for t in defaults::IN_APP_ONLY_TYPES {
            preferences.insert((*t).to_string(), ChannelToggles::new(true, false, false));
        }
        Self {
            user_id,
            preferences,
            do_not_disturb: false,
            quiet_hours_start: NaiveTime::parse_from_str(defaults::QUIET_HOURS_START, "%H:%M")
                .ok(),
            quiet_hours_end: NaiveTime::parse_from_str(defaults::QUIET_HOURS_END, "%H:%M").ok(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Unknown types and unknown channels are allowed.
    pub fn channel_enabled(&self, notification_type: &str, channel: Channel) -> bool {
        self.preferences
            .get(notification_type)
            .map_or(true, |t| t.allows(channel))
    }

    pub fn in_quiet_hours(&self, now: DateTime<Utc>) -> bool {
        match (self.quiet_hours_start, self.quiet_hours_end) {
            (Some(start), Some(end)) => crate::schedule::in_quiet_window(start, end, now.time()),
            _ => false,
        }
    }
}

/// Partial preferences update. Times are `HH:MM`; an empty string clears.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdatePreferencesRequest {
    #[serde(default)]
    pub preferences: Option<BTreeMap<String, ChannelToggles>>,
    #[serde(default)]
    pub do_not_disturb: Option<bool>,
    #[serde(default)]
    pub quiet_hours_start: Option<String>,
    #[serde(default)]
    pub quiet_hours_end: Option<String>,
}

// =============================================================================
// RATE WINDOWS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateScope {
    Global,
    User,
    NotificationType,
}

impl RateScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateScope::Global => "global",
            RateScope::User => "user",
            RateScope::NotificationType => "notification_type",
        }
    }
}

impl FromStr for RateScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "global" => Ok(RateScope::Global),
            "user" => Ok(RateScope::User),
            "notification_type" => Ok(RateScope::NotificationType),
            other => Err(Error::Serialization(format!("unknown rate scope: {other}"))),
        }
    }
}

/// A fixed-window counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateWindow {
    pub scope: RateScope,
    pub scope_id: String,
    pub window_minutes: i32,
    pub count: i32,
    pub window_start: DateTime<Utc>,
}

impl RateWindow {
    pub fn window_end(&self) -> DateTime<Utc> {
        self.window_start + Duration::minutes(i64::from(self.window_minutes))
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        now < self.window_end()
    }
}

// =============================================================================
// CAMPAIGNS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Completed,
    Cancelled,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Running => "running",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Cancelled)
    }

    /// Edges of the campaign state machine.
    pub fn can_transition_to(&self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        match (self, next) {
            (Draft, Scheduled) | (Draft, Running) | (Scheduled, Running) => true,
            (Running, Paused) | (Paused, Running) | (Running, Completed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "running" => Ok(CampaignStatus::Running),
            "paused" => Ok(CampaignStatus::Paused),
            "completed" => Ok(CampaignStatus::Completed),
            "cancelled" => Ok(CampaignStatus::Cancelled),
            other => Err(Error::Serialization(format!(
                "unknown campaign status: {other}"
            ))),
        }
    }
}

/// Audience selector of a campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "target_type", rename_all = "snake_case")]
pub enum CampaignTarget {
    AllUsers,
    Segment { segment: String },
    SpecificUsers { user_ids: Vec<Uuid> },
    Filter { filter: JsonMap },
}

impl CampaignTarget {
    pub fn target_type(&self) -> &'static str {
        match self {
            CampaignTarget::AllUsers => "all_users",
            CampaignTarget::Segment { .. } => "segment",
            CampaignTarget::SpecificUsers { .. } => "specific_users",
            CampaignTarget::Filter { .. } => "filter",
        }
    }

    /// Selector-specific value as stored alongside `target_type`.
    pub fn target_value(&self) -> JsonValue {
        match self {
            CampaignTarget::AllUsers => JsonValue::Null,
            CampaignTarget::Segment { segment } => JsonValue::String(segment.clone()),
            CampaignTarget::SpecificUsers { user_ids } => JsonValue::Array(
                user_ids
                    .iter()
                    .map(|id| JsonValue::String(id.to_string()))
                    .collect(),
            ),
            CampaignTarget::Filter { filter } => JsonValue::Object(filter.clone()),
        }
    }

    /// Rebuild a selector from its stored parts.
    pub fn from_parts(target_type: &str, value: JsonValue) -> Result<Self> {
        match (target_type, value) {
            ("all_users", _) => Ok(CampaignTarget::AllUsers),
            ("segment", JsonValue::String(segment)) if !segment.is_empty() => {
                Ok(CampaignTarget::Segment { segment })
            }
            ("specific_users", JsonValue::Array(items)) => {
                let user_ids = items
                    .iter()
                    .map(|v| {
                        v.as_str()
                            .and_then(|s| Uuid::parse_str(s).ok())
                            .ok_or_else(|| {
                                Error::InvalidTargetType(format!("bad user id in target: {v}"))
                            })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(CampaignTarget::SpecificUsers { user_ids })
            }
            ("filter", JsonValue::Object(filter)) => Ok(CampaignTarget::Filter { filter }),
            (other, _) => Err(Error::InvalidTargetType(other.to_string())),
        }
    }

    /// Reject selectors that can never produce an audience.
    pub fn validate(&self) -> Result<()> {
        match self {
            CampaignTarget::Segment { segment } if segment.trim().is_empty() => Err(
                Error::InvalidTargetType("segment target needs a segment name".into()),
            ),
            CampaignTarget::SpecificUsers { user_ids } if user_ids.is_empty() => Err(
                Error::InvalidTargetType("specific_users target needs user ids".into()),
            ),
            CampaignTarget::Filter { filter } if filter.is_empty() => Err(
                Error::InvalidTargetType("filter target needs at least one condition".into()),
            ),
            _ => Ok(()),
        }
    }
}

/// Campaign progress counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignProgress {
    pub processed: i64,
    pub sent: i64,
    pub delivered: i64,
    pub failed: i64,
}

impl CampaignProgress {
    pub fn add(&mut self, other: &CampaignProgress) {
        self.processed += other.processed;
        self.sent += other.sent;
        self.delivered += other.delivered;
        self.failed += other.failed;
    }
}

/// Orchestrated fan-out of one template to many users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub template_code: String,
    pub target: CampaignTarget,
    pub channels: Option<Vec<Channel>>,
    pub template_data: JsonMap,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub status: CampaignStatus,
    pub batch_size: i32,
    pub batch_delay_seconds: i32,
    /// Offset into the ordered audience where the next batch starts.
    pub cursor: i64,
    pub progress: CampaignProgress,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCampaignRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub template_code: String,
    pub target: CampaignTarget,
    #[serde(default)]
    pub channels: Option<Vec<Channel>>,
    #[serde(default)]
    pub template_data: JsonMap,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub batch_size: Option<i32>,
    #[serde(default)]
    pub batch_delay_seconds: Option<i32>,
    #[serde(default)]
    pub created_by: Option<String>,
}

/// Partial campaign update; only draft and scheduled campaigns accept one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateCampaignRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub target: Option<CampaignTarget>,
    #[serde(default)]
    pub channels: Option<Vec<Channel>>,
    #[serde(default)]
    pub template_data: Option<JsonMap>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub batch_size: Option<i32>,
    #[serde(default)]
    pub batch_delay_seconds: Option<i32>,
}

// =============================================================================
// USER DIRECTORY
// =============================================================================

/// Contact points of a user as known to the directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContact {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub device_token: Option<String>,
}

impl UserContact {
    /// Address for `channel`; in-app addresses the notification itself.
    pub fn address_for(&self, channel: Channel, notification_id: Uuid) -> Option<String> {
        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.trim().is_empty());
        match channel {
            Channel::InApp => Some(notification_id.to_string()),
            Channel::Email => non_empty(&self.email),
            Channel::Sms => non_empty(&self.phone),
            Channel::Push => non_empty(&self.device_token),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_channel_roundtrip_str() {
        for c in Channel::ALL {
            assert_eq!(c.as_str().parse::<Channel>().unwrap(), c);
        }
        assert!(matches!(
            "fax".parse::<Channel>(),
            Err(Error::InvalidChannel(_))
        ));
    }

    #[test]
    fn test_channel_parse_list_dedups() {
        let parsed = Channel::parse_list(&["email", "in_app", "email"]).unwrap();
        assert_eq!(parsed, vec![Channel::Email, Channel::InApp]);
    }

    #[test]
    fn test_channel_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Channel::InApp).unwrap(), "\"in_app\"");
    }

    #[test]
    fn test_delivery_status_map_serializes_with_channel_keys() {
        let mut map = DeliveryStatusMap::new();
        map.insert(Channel::InApp, DeliveryStatus::Sent);
        let json = serde_json::to_value(&map).unwrap();
        assert_eq!(json["in_app"], "sent");
        let back: DeliveryStatusMap = serde_json::from_value(json).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_priority_bounds() {
        assert_eq!(Priority::try_from(3).unwrap(), Priority::High);
        assert!(Priority::try_from(0).is_err());
        assert!(Priority::try_from(4).is_err());
        assert_eq!(Priority::default(), Priority::Medium);
        assert!(serde_json::from_str::<Priority>("7").is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(DeliveryStatus::Bounced.is_terminal());
        assert!(!DeliveryStatus::Failed.is_terminal());
        assert!(!DeliveryStatus::Sent.is_terminal());
    }

    fn attempt(status: DeliveryStatus) -> DeliveryAttempt {
        DeliveryAttempt {
            id: Uuid::nil(),
            notification_id: Uuid::nil(),
            channel: Channel::Email,
            attempt_number: 1,
            status,
            recipient: "a@example.com".into(),
            provider: None,
            provider_message_id: None,
            provider_response: None,
            error_code: None,
            error_message: None,
            queued_at: ts(0, 0),
            processing_at: None,
            sent_at: None,
            delivered_at: None,
            opened_at: None,
            clicked_at: None,
            failed_at: None,
            retry_after: None,
            max_retries: 3,
            created_at: ts(0, 0),
            updated_at: ts(0, 0),
        }
    }

    #[test]
    fn test_apply_rejects_change_on_terminal_row() {
        let mut a = attempt(DeliveryStatus::Delivered);
        let err = a.apply(&AttemptUpdate::Processing, ts(1, 0)).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        // engagement still stamps the timestamp without leaving delivered
        a.apply(&AttemptUpdate::Opened, ts(1, 0)).unwrap();
        assert_eq!(a.status, DeliveryStatus::Delivered);
        assert_eq!(a.opened_at, Some(ts(1, 0)));
    }

    #[test]
    fn test_retry_eligibility() {
        let mut a = attempt(DeliveryStatus::Failed);
        a.retry_after = Some(ts(0, 5));
        assert!(!a.is_retry_eligible(ts(0, 4)));
        assert!(a.is_retry_eligible(ts(0, 5)));
        a.attempt_number = 3;
        assert!(!a.is_retry_eligible(ts(1, 0)));
    }

    #[test]
    fn test_missing_slots() {
        let content = TemplateContent {
            email_subject: Some("Hi".into()),
            in_app_title: Some("Hi".into()),
            ..Default::default()
        };
        assert_eq!(content.missing_slots(Channel::Email), vec!["email_html"]);
        assert_eq!(content.missing_slots(Channel::InApp), vec!["in_app_body"]);
        assert_eq!(content.missing_slots(Channel::Sms), vec!["sms_body"]);
    }

    #[test]
    fn test_default_preferences_seed() {
        let prefs = NotificationPreferences::default_for(Uuid::nil(), ts(12, 0));
        assert!(prefs.channel_enabled("order_status", Channel::Email));
        assert!(!prefs.channel_enabled("order_status", Channel::Push));
        assert!(!prefs.channel_enabled("new_promotion", Channel::Email));
        assert!(prefs.channel_enabled("review_response", Channel::InApp));
        assert!(prefs.channel_enabled("unknown_type", Channel::Push));
        assert!(prefs.channel_enabled("order_status", Channel::Sms));
        assert!(prefs.in_quiet_hours(ts(23, 0)));
        assert!(prefs.in_quiet_hours(ts(6, 59)));
        assert!(!prefs.in_quiet_hours(ts(7, 0)));
        assert!(!prefs.do_not_disturb);
    }

    #[test]
    fn test_campaign_transitions() {
        use CampaignStatus::*;
        assert!(Draft.can_transition_to(Running));
        assert!(Scheduled.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Paused.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Running));
        assert!(!Draft.can_transition_to(Completed));
    }

    #[test]
    fn test_campaign_target_parts_roundtrip() {
        let id = Uuid::new_v4();
        let target = CampaignTarget::SpecificUsers { user_ids: vec![id] };
        let rebuilt =
            CampaignTarget::from_parts(target.target_type(), target.target_value()).unwrap();
        assert_eq!(rebuilt, target);
        assert!(matches!(
            CampaignTarget::from_parts("everyone", JsonValue::Null),
            Err(Error::InvalidTargetType(_))
        ));
    }

    #[test]
    fn test_contact_address_for() {
        let nid = Uuid::new_v4();
        let contact = UserContact {
            user_id: Uuid::nil(),
            email: Some("a@example.com".into()),
            phone: Some("  ".into()),
            device_token: None,
        };
        assert_eq!(contact.address_for(Channel::InApp, nid), Some(nid.to_string()));
        assert_eq!(
            contact.address_for(Channel::Email, nid).as_deref(),
            Some("a@example.com")
        );
        assert_eq!(contact.address_for(Channel::Sms, nid), None);
        assert_eq!(contact.address_for(Channel::Push, nid), None);
    }

    #[test]
    fn test_delivery_rate_tally() {
        let mut rate = DeliveryRate::default();
        rate.record(DeliveryStatus::Sent, 2);
        rate.record(DeliveryStatus::Opened, 1);
        rate.record(DeliveryStatus::Failed, 1);
        let rate = rate.finish();
        assert_eq!(rate.total, 4);
        assert_eq!(rate.delivered, 1);
        assert!((rate.success_rate - 0.75).abs() < f64::EPSILON);
        assert_eq!(DeliveryRate::default().finish().success_rate, 0.0);
    }

    #[test]
    fn test_filter_normalized_clamps() {
        let f = NotificationFilter {
            page: 0,
            size: 10_000,
            ..Default::default()
        }
        .normalized();
        assert_eq!(f.page, 1);
        assert_eq!(f.size, defaults::PAGE_SIZE_MAX);
        assert_eq!(f.offset(), 0);
    }
}
