//! # courier-dispatch
//!
//! The decision side of the courier notification subsystem.
//!
//! This crate provides:
//! - The template engine and template administration
//! - The preferences gate and the preferences API
//! - Fixed-window rate limiting per user, per type and globally
//! - The dispatcher that turns send requests into persisted notifications
//! - Inbox operations, provider receipts and campaign administration
//!
//! Nothing here talks to a gateway; delivery is done by `courier-jobs`.
//!
//! ## Example
//!
//! ```ignore
//! use courier_dispatch::{DispatchConfig, DispatchServices};
//! use courier_db::{Database, Repositories, SendWithTemplateRequest, SystemClock};
//!
//! let db = Database::connect("postgres://...").await?;
//! let services = DispatchServices::new(
//!     &Repositories::from(&db),
//!     Arc::new(SystemClock),
//!     DispatchConfig::from_env(),
//! );
//!
//! let ctx = CallContext::with_timeout(Duration::from_secs(5));
//! let req = SendWithTemplateRequest::new(user_id, "order_shipped").with_var("order_number", "A-100");
//! let notification = services.dispatcher.send_with_template(&ctx, req).await?;
//! ```

pub mod campaigns;
pub mod config;
pub mod dispatcher;
pub mod inbox;
pub mod preferences;
pub mod rate_limit;
pub mod receipts;
pub mod templates;

use std::sync::Arc;

pub use courier_core::*;

pub use campaigns::CampaignService;
pub use config::{DispatchConfig, RateLimit};
pub use dispatcher::Dispatcher;
pub use inbox::Inbox;
pub use preferences::{decide, DenyReason, GateDecision, PreferenceService, PreferencesGate};
pub use rate_limit::RateLimiter;
pub use receipts::{DeliveryReceipts, ReceiptEvent};
pub use templates::{render_channel, TemplateService};

use courier_db::Repositories;

/// Every dispatch-side service wired over one set of repositories.
#[derive(Clone)]
pub struct DispatchServices {
    pub templates: TemplateService,
    pub preferences: PreferenceService,
    pub gate: PreferencesGate,
    pub limiter: RateLimiter,
    pub dispatcher: Dispatcher,
    pub inbox: Inbox,
    pub receipts: DeliveryReceipts,
    pub campaigns: CampaignService,
    pub config: DispatchConfig,
}

impl DispatchServices {
    pub fn new(repos: &Repositories, clock: Arc<dyn Clock>, config: DispatchConfig) -> Self {
        let templates = TemplateService::new(repos.templates.clone(), clock.clone());
        let gate = PreferencesGate::new(repos.preferences.clone(), clock.clone());
        let limiter = RateLimiter::new(repos.rate_limits.clone(), clock.clone(), config.clone());
        let dispatcher = Dispatcher::new(
            repos.notifications.clone(),
            templates.clone(),
            gate.clone(),
            limiter.clone(),
            clock.clone(),
        );

        Self {
            preferences: PreferenceService::new(repos.preferences.clone(), clock.clone()),
            inbox: Inbox::new(
                repos.notifications.clone(),
                repos.delivery_logs.clone(),
                clock.clone(),
            ),
            receipts: DeliveryReceipts::new(
                repos.delivery_logs.clone(),
                repos.notifications.clone(),
                clock.clone(),
            ),
            campaigns: CampaignService::new(repos.campaigns.clone(), templates.clone(), clock),
            templates,
            gate,
            limiter,
            dispatcher,
            config,
        }
    }
}
