//! Channel to driver lookup.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use courier_core::{Channel, ChannelDriver, Result};

use crate::email::{EmailConfig, EmailDriver};
use crate::in_app::InAppDriver;
use crate::push::{PushConfig, PushDriver};
use crate::sms::{SmsConfig, SmsDriver};

/// Drivers keyed by the channel they serve. A channel without a driver is
/// reported as provider-unavailable by the delivery worker.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<Channel, Arc<dyn ChannelDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with only the in-app driver.
    pub fn in_app_only() -> Self {
        Self::new().with_driver(Arc::new(InAppDriver))
    }

    /// Register `driver` for its channel, replacing any previous one.
    pub fn register(&mut self, driver: Arc<dyn ChannelDriver>) {
        self.drivers.insert(driver.channel(), driver);
    }

    pub fn with_driver(mut self, driver: Arc<dyn ChannelDriver>) -> Self {
        self.register(driver);
        self
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelDriver>> {
        self.drivers.get(&channel).cloned()
    }

    pub fn contains(&self, channel: Channel) -> bool {
        self.drivers.contains_key(&channel)
    }

    /// Registered channels in canonical order.
    pub fn channels(&self) -> Vec<Channel> {
        Channel::ALL
            .into_iter()
            .filter(|c| self.drivers.contains_key(c))
            .collect()
    }

    /// In-app always, plus every gateway whose configuration is present.
    pub fn from_env() -> Result<Self> {
        let mut registry = Self::in_app_only();

        match EmailConfig::from_env() {
            Some(cfg) => registry.register(Arc::new(EmailDriver::new(cfg)?)),
            None => warn!(
                subsystem = "channels",
                "SMTP_HOST not set, email channel has no driver"
            ),
        }
        match SmsConfig::from_env() {
            Some(cfg) => registry.register(Arc::new(SmsDriver::new(cfg))),
            None => warn!(
                subsystem = "channels",
                "SMS_GATEWAY_URL not set, sms channel has no driver"
            ),
        }
        match PushConfig::from_env() {
            Some(cfg) => registry.register(Arc::new(PushDriver::new(cfg))),
            None => warn!(
                subsystem = "channels",
                "PUSH_GATEWAY_URL not set, push channel has no driver"
            ),
        }

        info!(
            subsystem = "channels",
            channels = ?registry.channels(),
            "Channel drivers registered"
        );
        Ok(registry)
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("channels", &self.channels())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDriver;

    #[test]
    fn test_register_replaces_by_channel() {
        let mut registry = DriverRegistry::in_app_only();
        assert_eq!(registry.channels(), vec![Channel::InApp]);

        registry.register(Arc::new(MockDriver::new(Channel::Sms)));
        registry.register(Arc::new(MockDriver::new(Channel::InApp)));
        assert_eq!(registry.channels(), vec![Channel::InApp, Channel::Sms]);
        assert_eq!(
            registry.get(Channel::InApp).unwrap().provider(),
            "mock_in_app"
        );
        assert!(registry.get(Channel::Email).is_none());
        assert!(!registry.contains(Channel::Push));
    }
}
