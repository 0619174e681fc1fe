//! User preferences and the gate that applies them.

use std::sync::Arc;

use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use courier_core::schedule::parse_time_of_day;
use courier_core::{
    Channel, Clock, NotificationPreferences, PreferenceRepository, Result,
    UpdatePreferencesRequest,
};

/// Why the gate refused a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// Do-not-disturb is on.
    Dnd,
    /// Email or push inside the user's quiet window.
    QuietHours,
    /// The user switched the channel off for this type.
    Disabled,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Dnd => "dnd",
            DenyReason::QuietHours => "quiet_hours",
            DenyReason::Disabled => "disabled",
        }
    }
}

/// Outcome of [`PreferencesGate::can_send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateDecision {
    pub allowed: bool,
    pub reason: Option<DenyReason>,
}

impl GateDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: DenyReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Decide a channel against loaded preferences at `now`.
pub fn decide(
    prefs: &NotificationPreferences,
    notification_type: &str,
    channel: Channel,
    now: chrono::DateTime<chrono::Utc>,
) -> GateDecision {
    if prefs.do_not_disturb {
        return GateDecision::deny(DenyReason::Dnd);
    }
    if !channel.bypasses_quiet_hours() && prefs.in_quiet_hours(now) {
        return GateDecision::deny(DenyReason::QuietHours);
    }
    if !prefs.channel_enabled(notification_type, channel) {
        return GateDecision::deny(DenyReason::Disabled);
    }
    GateDecision::allow()
}

/// Per (user, type, channel) admission check.
///
/// Users without stored preferences are gated against the default seed.
/// A failed lookup allows every channel.
#[derive(Clone)]
pub struct PreferencesGate {
    repo: Arc<dyn PreferenceRepository>,
    clock: Arc<dyn Clock>,
}

impl PreferencesGate {
    pub fn new(repo: Arc<dyn PreferenceRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    async fn load(&self, user_id: Uuid) -> Option<NotificationPreferences> {
        let now = self.clock.now();
        match self.repo.get(user_id).await {
            Ok(Some(p)) => Some(p),
            Ok(None) => Some(NotificationPreferences::default_for(user_id, now)),
            Err(e) => {
                warn!(
                    subsystem = "dispatch",
                    component = "gate",
                    user_id = %user_id,
                    error = %e,
                    "Preference lookup failed, allowing channels"
                );
                None
            }
        }
    }

    pub async fn can_send(
        &self,
        user_id: Uuid,
        notification_type: &str,
        channel: Channel,
    ) -> GateDecision {
        match self.load(user_id).await {
            Some(prefs) => decide(&prefs, notification_type, channel, self.clock.now()),
            None => GateDecision::allow(),
        }
    }

    /// Decision for every channel from a single preferences read.
    pub async fn evaluate(
        &self,
        user_id: Uuid,
        notification_type: &str,
        channels: &[Channel],
    ) -> Vec<(Channel, GateDecision)> {
        let prefs = self.load(user_id).await;
        let now = self.clock.now();
        channels
            .iter()
            .map(|c| {
                let decision = prefs
                    .as_ref()
                    .map_or_else(GateDecision::allow, |p| {
                        decide(p, notification_type, *c, now)
                    });
                (*c, decision)
            })
            .collect()
    }
}

/// Read and edit a user's preferences.
#[derive(Clone)]
pub struct PreferenceService {
    repo: Arc<dyn PreferenceRepository>,
    clock: Arc<dyn Clock>,
}

impl PreferenceService {
    pub fn new(repo: Arc<dyn PreferenceRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    /// Stored preferences, persisting the default seed on first read.
    pub async fn get(&self, user_id: Uuid) -> Result<NotificationPreferences> {
        if let Some(prefs) = self.repo.get(user_id).await? {
            return Ok(prefs);
        }
        let now = self.clock.now();
        self.repo
            .upsert(&NotificationPreferences::default_for(user_id, now), now)
            .await
    }

    /// Merge `req` into the current preferences. Type entries are replaced
    /// one by one; types not named keep their switches.
    pub async fn update(
        &self,
        user_id: Uuid,
        req: UpdatePreferencesRequest,
    ) -> Result<NotificationPreferences> {
        let mut prefs = self.get(user_id).await?;

        if let Some(map) = req.preferences {
            for (notification_type, toggles) in map {
                prefs.preferences.insert(notification_type, toggles);
            }
        }
        if let Some(dnd) = req.do_not_disturb {
            prefs.do_not_disturb = dnd;
        }
        if let Some(start) = req.quiet_hours_start {
            prefs.quiet_hours_start = parse_optional_time(&start)?;
        }
        if let Some(end) = req.quiet_hours_end {
            prefs.quiet_hours_end = parse_optional_time(&end)?;
        }

        self.repo.upsert(&prefs, self.clock.now()).await
    }
}

fn parse_optional_time(value: &str) -> Result<Option<chrono::NaiveTime>> {
    if value.trim().is_empty() {
        Ok(None)
    } else {
        parse_time_of_day(value).map(Some)
    }
}
