//! Campaign orchestrator: fans a running campaign out through the dispatcher
//! in paced batches.
//!
//! The audience is read from a persisted cursor. A batch records its totals
//! only if the cursor is still where the batch read it, so two orchestrators
//! never double count. Every send carries the campaign as its reference,
//! which makes a re-run batch idempotent per user.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use courier_core::{
    CallContext, Campaign, CampaignProgress, CampaignRepository, CampaignStatus, CampaignTarget,
    Clock, Error, NotificationReference, Result, SendWithTemplateRequest, UserDirectory,
};
use courier_dispatch::Dispatcher;

/// What one call to [`CampaignOrchestrator::run_batch`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// A batch was sent and recorded.
    Processed(CampaignProgress),
    /// The audience was exhausted and the campaign completed.
    Completed,
    /// The campaign left `running`, or another orchestrator moved the cursor.
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CampaignPass {
    pub promoted: usize,
    pub batches: usize,
    pub completed: usize,
    /// Campaigns whose run errored; they stay running for the next pass.
    pub errors: usize,
}

#[derive(Clone)]
pub struct CampaignOrchestrator {
    campaigns: Arc<dyn CampaignRepository>,
    dispatcher: Dispatcher,
    directory: Arc<dyn UserDirectory>,
    clock: Arc<dyn Clock>,
    dispatch_timeout: Duration,
}

impl CampaignOrchestrator {
    pub fn new(
        campaigns: Arc<dyn CampaignRepository>,
        dispatcher: Dispatcher,
        directory: Arc<dyn UserDirectory>,
        clock: Arc<dyn Clock>,
        dispatch_timeout: Duration,
    ) -> Self {
        Self {
            campaigns,
            dispatcher,
            directory,
            clock,
            dispatch_timeout,
        }
    }

    /// Move scheduled campaigns whose time has come to running.
    pub async fn promote_due(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut promoted = 0;
        for campaign in self.campaigns.list_scheduled_due(now).await? {
            match self
                .campaigns
                .transition(
                    campaign.id,
                    &[CampaignStatus::Scheduled],
                    CampaignStatus::Running,
                    now,
                )
                .await
            {
                Ok(_) => {
                    promoted += 1;
                    info!(subsystem = "campaign", campaign_id = %campaign.id, "Scheduled campaign started");
                }
                Err(Error::Conflict(_)) => {}
                Err(e) => {
                    warn!(
                        subsystem = "campaign",
                        campaign_id = %campaign.id,
                        error = %e,
                        "Could not start scheduled campaign"
                    );
                }
            }
        }
        Ok(promoted)
    }

    /// Promote due campaigns, then run every running campaign to its end or
    /// until it is stopped. A campaign that errors is logged and counted; the
    /// rest still run.
    #[instrument(skip(self, ctx), fields(subsystem = "campaign", op = "campaign_pass"))]
    pub async fn run_pass(&self, ctx: &CallContext) -> Result<CampaignPass> {
        let mut pass = CampaignPass {
            promoted: self.promote_due().await?,
            ..CampaignPass::default()
        };
        for campaign in self.campaigns.list_running().await? {
            if ctx.is_cancelled() {
                break;
            }
            match self.run_campaign(ctx, campaign.id).await {
                Ok((batches, completed)) => {
                    pass.batches += batches;
                    if completed {
                        pass.completed += 1;
                    }
                }
                Err(Error::Cancelled) if ctx.is_cancelled() => return Err(Error::Cancelled),
                Err(e) => {
                    pass.errors += 1;
                    warn!(campaign_id = %campaign.id, error = %e, "Campaign run failed, continuing");
                }
            }
        }
        Ok(pass)
    }

    /// Run batches until the audience is exhausted or the campaign stops.
    /// Returns the number of batches and whether the campaign completed.
    pub async fn run_campaign(&self, ctx: &CallContext, id: Uuid) -> Result<(usize, bool)> {
        let mut batches = 0;
        loop {
            match self.run_batch(ctx, id).await? {
                BatchOutcome::Processed(_) => {
                    batches += 1;
                    let delay = self.get(id).await?.batch_delay_seconds;
                    if delay > 0 {
                        tokio::select! {
                            _ = ctx.token().cancelled() => return Err(Error::Cancelled),
                            _ = tokio::time::sleep(Duration::from_secs(delay as u64)) => {}
                        }
                    }
                }
                BatchOutcome::Completed => return Ok((batches, true)),
                BatchOutcome::Stopped => return Ok((batches, false)),
            }
        }
    }

    /// Send the next batch of a running campaign.
    #[instrument(skip(self, ctx), fields(subsystem = "campaign", campaign_id = %id))]
    pub async fn run_batch(&self, ctx: &CallContext, id: Uuid) -> Result<BatchOutcome> {
        let start = Instant::now();
        let campaign = self.get(id).await?;
        if campaign.status != CampaignStatus::Running {
            debug!(status = %campaign.status, "Campaign not running, stopping");
            return Ok(BatchOutcome::Stopped);
        }

        let users = self
            .audience(ctx, &campaign, campaign.cursor, campaign.batch_size.max(1) as i64)
            .await?;
        if users.is_empty() {
            return match self
                .campaigns
                .transition(
                    id,
                    &[CampaignStatus::Running],
                    CampaignStatus::Completed,
                    self.clock.now(),
                )
                .await
            {
                Ok(c) => {
                    info!(
                        processed = c.progress.processed,
                        sent = c.progress.sent,
                        failed = c.progress.failed,
                        "Campaign completed"
                    );
                    Ok(BatchOutcome::Completed)
                }
                Err(Error::Conflict(_)) => Ok(BatchOutcome::Stopped),
                Err(e) => Err(e),
            };
        }

        let mut delta = CampaignProgress::default();
        for user_id in &users {
            ctx.check()?;
            let req = SendWithTemplateRequest {
                user_id: *user_id,
                template_code: campaign.template_code.clone(),
                channels: campaign.channels.clone(),
                data: campaign.template_data.clone(),
                reference: Some(NotificationReference::campaign(id)),
                priority: None,
                idempotency_nonce: None,
            };
            let send_ctx = ctx.child(self.dispatch_timeout);
            match self.dispatcher.send_with_template(&send_ctx, req).await {
                Ok(_) => delta.sent += 1,
                Err(Error::Cancelled) if ctx.is_cancelled() => return Err(Error::Cancelled),
                Err(e) => {
                    delta.failed += 1;
                    debug!(user_id = %user_id, error_code = e.code(), "Campaign send refused");
                }
            }
        }
        delta.processed = users.len() as i64;

        let recorded = self
            .campaigns
            .increment_progress(
                id,
                campaign.cursor,
                users.len() as i64,
                &delta,
                self.clock.now(),
            )
            .await?;
        if !recorded {
            warn!(cursor = campaign.cursor, "Campaign moved under this batch, not recording");
            return Ok(BatchOutcome::Stopped);
        }

        info!(
            cursor = campaign.cursor,
            processed = delta.processed,
            sent = delta.sent,
            failed = delta.failed,
            duration_ms = start.elapsed().as_millis() as u64,
            "Campaign batch finished"
        );
        Ok(BatchOutcome::Processed(delta))
    }

    async fn get(&self, id: Uuid) -> Result<Campaign> {
        self.campaigns
            .get(id)
            .await?
            .ok_or(Error::CampaignNotFound(id))
    }

    /// Page of the campaign's audience starting at `offset`.
    async fn audience(
        &self,
        ctx: &CallContext,
        campaign: &Campaign,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Uuid>> {
        match &campaign.target {
            CampaignTarget::SpecificUsers { user_ids } => {
                let from = (offset.max(0) as usize).min(user_ids.len());
                let to = from.saturating_add(limit.max(0) as usize).min(user_ids.len());
                Ok(user_ids[from..to].to_vec())
            }
            target => {
                let page_ctx = ctx.child(self.dispatch_timeout);
                self.directory
                    .list_audience(&page_ctx, target, offset, limit)
                    .await
            }
        }
    }
}
