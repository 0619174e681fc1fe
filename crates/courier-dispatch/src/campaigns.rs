//! Campaign administration.
//!
//! Execution belongs to the orchestrator in `courier-jobs`; this service
//! owns creation, edits and every user-initiated state change.

use std::sync::Arc;

use tracing::{info, instrument};
use uuid::Uuid;

use courier_core::{
    defaults, dedup_channels, Campaign, CampaignRepository, CampaignStatus, Channel, Clock,
    CreateCampaignRequest, Error, Result, UpdateCampaignRequest,
};

use crate::templates::{check_variables, TemplateService};

const DELETABLE: &[CampaignStatus] = &[
    CampaignStatus::Draft,
    CampaignStatus::Cancelled,
    CampaignStatus::Completed,
];

const CANCELLABLE: &[CampaignStatus] = &[
    CampaignStatus::Draft,
    CampaignStatus::Scheduled,
    CampaignStatus::Running,
    CampaignStatus::Paused,
];

#[derive(Clone)]
pub struct CampaignService {
    repo: Arc<dyn CampaignRepository>,
    templates: TemplateService,
    clock: Arc<dyn Clock>,
}

impl CampaignService {
    pub fn new(
        repo: Arc<dyn CampaignRepository>,
        templates: TemplateService,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            templates,
            clock,
        }
    }

    /// Create a campaign; `scheduled` when `scheduled_at` is in the future,
    /// otherwise `draft`.
    #[instrument(skip(self, req), fields(subsystem = "campaign", op = "create", name = %req.name))]
    pub async fn create(&self, req: CreateCampaignRequest) -> Result<Campaign> {
        let mut req = req;
        if req.name.trim().is_empty() {
            return Err(Error::InvalidInput("campaign name is required".into()));
        }
        let template = self.templates.get_active(&req.template_code).await?;
        check_variables(&template, &req.template_data)?;
        req.target.validate()?;
        req.channels = normalize_channels(req.channels.as_deref())?;
        validate_batching(req.batch_size, req.batch_delay_seconds)?;

        let now = self.clock.now();
        let status = match req.scheduled_at {
            Some(at) if at > now => CampaignStatus::Scheduled,
            _ => CampaignStatus::Draft,
        };
        let campaign = self.repo.create(&req, status, now).await?;
        info!(
            campaign_id = %campaign.id,
            status = %campaign.status,
            target = campaign.target.target_type(),
            "Campaign created"
        );
        Ok(campaign)
    }

    pub async fn get(&self, id: Uuid) -> Result<Campaign> {
        self.repo
            .get(id)
            .await?
            .ok_or(Error::CampaignNotFound(id))
    }

    /// Page of campaigns, newest first.
    pub async fn list(
        &self,
        status: Option<CampaignStatus>,
        page: i64,
        size: i64,
    ) -> Result<Vec<Campaign>> {
        let size = if size <= 0 {
            defaults::PAGE_SIZE
        } else {
            size.min(defaults::PAGE_SIZE_MAX)
        };
        let offset = (page.max(1) - 1) * size;
        self.repo.list(status, size, offset).await
    }

    /// Edit a draft or scheduled campaign.
    ///
    /// Moving `scheduled_at` into the future schedules a draft.
    #[instrument(skip(self, req), fields(subsystem = "campaign", op = "update", campaign_id = %id))]
    pub async fn update(&self, id: Uuid, req: UpdateCampaignRequest) -> Result<Campaign> {
        let mut req = req;
        let current = self.get(id).await?;
        if let Some(target) = &req.target {
            target.validate()?;
        }
        if req.channels.is_some() {
            req.channels = normalize_channels(req.channels.as_deref())?;
        }
        validate_batching(req.batch_size, req.batch_delay_seconds)?;
        if let Some(data) = &req.template_data {
            let template = self.templates.get_active(&current.template_code).await?;
            check_variables(&template, data)?;
        }

        let now = self.clock.now();
        let updated = self.repo.update(id, &req, now).await?;
        match updated.scheduled_at {
            Some(at) if at > now && updated.status == CampaignStatus::Draft => {
                self.repo
                    .transition(id, &[CampaignStatus::Draft], CampaignStatus::Scheduled, now)
                    .await
            }
            _ => Ok(updated),
        }
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let campaign = self.get(id).await?;
        if !DELETABLE.contains(&campaign.status) {
            return Err(Error::Conflict(format!(
                "campaign {id} is {} and cannot be deleted",
                campaign.status
            )));
        }
        if !self.repo.delete(id).await? {
            return Err(Error::CampaignNotFound(id));
        }
        info!(subsystem = "campaign", campaign_id = %id, "Campaign deleted");
        Ok(())
    }

    /// Draft or scheduled to running.
    pub async fn start(&self, id: Uuid) -> Result<Campaign> {
        self.move_to(
            id,
            &[CampaignStatus::Draft, CampaignStatus::Scheduled],
            CampaignStatus::Running,
        )
        .await
    }

    /// Any non-terminal state to cancelled. In-flight batches finish.
    pub async fn cancel(&self, id: Uuid) -> Result<Campaign> {
        self.move_to(id, CANCELLABLE, CampaignStatus::Cancelled).await
    }

    pub async fn pause(&self, id: Uuid) -> Result<Campaign> {
        self.move_to(id, &[CampaignStatus::Running], CampaignStatus::Paused)
            .await
    }

    pub async fn resume(&self, id: Uuid) -> Result<Campaign> {
        self.move_to(id, &[CampaignStatus::Paused], CampaignStatus::Running)
            .await
    }

    async fn move_to(
        &self,
        id: Uuid,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<Campaign> {
        let campaign = self
            .repo
            .transition(id, from, to, self.clock.now())
            .await?;
        info!(
            subsystem = "campaign",
            campaign_id = %id,
            status = %campaign.status,
            "Campaign status changed"
        );
        Ok(campaign)
    }
}

fn normalize_channels(channels: Option<&[Channel]>) -> Result<Option<Vec<Channel>>> {
    match channels {
        None => Ok(None),
        Some(list) => {
            let list = dedup_channels(list);
            if list.is_empty() {
                return Err(Error::NoChannels);
            }
            Ok(Some(list))
        }
    }
}

fn validate_batching(batch_size: Option<i32>, batch_delay_seconds: Option<i32>) -> Result<()> {
    if matches!(batch_size, Some(n) if n <= 0) {
        return Err(Error::InvalidInput("batch_size must be positive".into()));
    }
    if matches!(batch_delay_seconds, Some(n) if n < 0) {
        return Err(Error::InvalidInput(
            "batch_delay_seconds cannot be negative".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use courier_core::{CampaignTarget, JsonMap, ManualClock};
    use courier_db::test_fixtures::{base_time, order_shipped_template};
    use courier_db::MemoryStore;

    async fn service() -> (CampaignService, ManualClock) {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(base_time());
        let templates = TemplateService::new(store.clone(), Arc::new(clock.clone()));
        templates.create(order_shipped_template()).await.unwrap();
        (
            CampaignService::new(store, templates, Arc::new(clock.clone())),
            clock,
        )
    }

    fn request(users: Vec<Uuid>) -> CreateCampaignRequest {
        let mut data = JsonMap::new();
        data.insert("order_number".into(), "ALL".into());
        CreateCampaignRequest {
            name: "Shipping week".into(),
            description: None,
            template_code: "order_shipped".into(),
            target: CampaignTarget::SpecificUsers { user_ids: users },
            channels: None,
            template_data: data,
            scheduled_at: None,
            batch_size: Some(2),
            batch_delay_seconds: Some(0),
            created_by: None,
        }
    }

    #[tokio::test]
    async fn test_create_draft_or_scheduled() {
        let (svc, clock) = service().await;
        let draft = svc.create(request(vec![Uuid::new_v4()])).await.unwrap();
        assert_eq!(draft.status, CampaignStatus::Draft);

        let mut req = request(vec![Uuid::new_v4()]);
        req.scheduled_at = Some(clock.now() + Duration::hours(1));
        let scheduled = svc.create(req).await.unwrap();
        assert_eq!(scheduled.status, CampaignStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_create_validates_inputs() {
        let (svc, _) = service().await;

        let err = svc.create(request(vec![])).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_TARGET_TYPE");

        let mut req = request(vec![Uuid::new_v4()]);
        req.template_data = JsonMap::new();
        assert_eq!(svc.create(req).await.unwrap_err().code(), "MISSING_VARIABLES");

        let mut req = request(vec![Uuid::new_v4()]);
        req.template_code = "missing".into();
        assert_eq!(svc.create(req).await.unwrap_err().code(), "TEMPLATE_NOT_FOUND");

        let mut req = request(vec![Uuid::new_v4()]);
        req.batch_size = Some(0);
        assert_eq!(svc.create(req).await.unwrap_err().code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_state_machine() {
        let (svc, _) = service().await;
        let c = svc.create(request(vec![Uuid::new_v4()])).await.unwrap();

        assert_eq!(svc.pause(c.id).await.unwrap_err().code(), "CONFLICT");
        let running = svc.start(c.id).await.unwrap();
        assert_eq!(running.status, CampaignStatus::Running);
        assert!(running.started_at.is_some());
        assert_eq!(svc.start(c.id).await.unwrap_err().code(), "CONFLICT");

        assert_eq!(svc.pause(c.id).await.unwrap().status, CampaignStatus::Paused);
        assert_eq!(svc.resume(c.id).await.unwrap().status, CampaignStatus::Running);
        assert_eq!(
            svc.update(c.id, UpdateCampaignRequest::default())
                .await
                .unwrap_err()
                .code(),
            "CONFLICT"
        );
        assert_eq!(svc.delete(c.id).await.unwrap_err().code(), "CONFLICT");

        let cancelled = svc.cancel(c.id).await.unwrap();
        assert!(cancelled.cancelled_at.is_some());
        assert_eq!(svc.cancel(c.id).await.unwrap_err().code(), "CONFLICT");

        svc.delete(c.id).await.unwrap();
        assert_eq!(svc.get(c.id).await.unwrap_err().code(), "CAMPAIGN_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_update_schedules_draft() {
        let (svc, clock) = service().await;
        let c = svc.create(request(vec![Uuid::new_v4()])).await.unwrap();
        let updated = svc
            .update(
                c.id,
                UpdateCampaignRequest {
                    name: Some("Later".into()),
                    scheduled_at: Some(clock.now() + Duration::days(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Later");
        assert_eq!(updated.status, CampaignStatus::Scheduled);
    }
}
