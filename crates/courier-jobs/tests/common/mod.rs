//! Shared wiring for job tests: in-memory store, manual clock, mock drivers.

#![allow(dead_code)]

use std::sync::Arc;

use courier_channels::{DriverRegistry, MockDriver};
use courier_db::test_fixtures::{base_time, order_shipped_template, reachable_user};
use courier_db::{
    Channel, CreateTemplateRequest, JsonMap, ManualClock, MemoryStore, Repositories,
    StaticDirectory,
};
use courier_dispatch::{DispatchConfig, DispatchServices};
use courier_jobs::{JobRunner, WorkerConfig};
use uuid::Uuid;

pub struct Harness {
    pub store: MemoryStore,
    pub clock: ManualClock,
    pub directory: StaticDirectory,
    pub email: MockDriver,
    pub push: MockDriver,
    pub dispatch: DispatchServices,
    pub runner: JobRunner,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(WorkerConfig::default())
    }

    pub fn with_config(config: WorkerConfig) -> Self {
        let store = MemoryStore::new();
        let clock = ManualClock::new(base_time());
        let directory = StaticDirectory::new();
        let email = MockDriver::new(Channel::Email);
        let push = MockDriver::new(Channel::Push);

        let repos = Repositories::from(&store);
        let dispatch =
            DispatchServices::new(&repos, Arc::new(clock.clone()), DispatchConfig::default());
        let drivers = DriverRegistry::in_app_only()
            .with_driver(Arc::new(email.clone()))
            .with_driver(Arc::new(push.clone()));
        let runner = JobRunner::new(
            &repos,
            &dispatch,
            drivers,
            Arc::new(directory.clone()),
            Arc::new(clock.clone()),
            config,
        );

        Self {
            store,
            clock,
            directory,
            email,
            push,
            dispatch,
            runner,
        }
    }

    /// A user known to the directory with every address.
    pub fn user(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.directory.insert(reachable_user(id));
        id
    }

    pub async fn template(&self, channels: Vec<Channel>) {
        let mut template = order_shipped_template();
        template.default_channels = channels;
        self.dispatch.templates.create(template).await.unwrap();
    }
}

/// `promo_week`: in-app only, needs a discount.
pub fn promo_week_template() -> CreateTemplateRequest {
    let mut t = order_shipped_template();
    t.code = "promo_week".into();
    t.name = "Promo week".into();
    t.notification_type = Some("system_alert".into());
    t.category = courier_db::TemplateCategory::Marketing;
    t.content = courier_db::TemplateContent {
        in_app_title: Some("{{discount}} off this week".into()),
        in_app_body: Some("Use it before Sunday.".into()),
        ..Default::default()
    };
    t.required_variables = vec!["discount".into()];
    t.default_channels = vec![Channel::InApp];
    t
}

pub fn data(key: &str, value: &str) -> JsonMap {
    let mut map = JsonMap::new();
    map.insert(key.into(), value.into());
    map
}
