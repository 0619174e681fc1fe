//! Runs every background role as an independent recurring task.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use courier_channels::DriverRegistry;
use courier_core::{defaults, CallContext, Clock, Error, Result, UserDirectory};
use courier_db::Repositories;
use courier_dispatch::DispatchServices;

use crate::campaign::{CampaignOrchestrator, CampaignPass};
use crate::cleanup::{Cleanup, CleanupPass};
use crate::config::WorkerConfig;
use crate::delivery::{DeliveryPass, DeliveryWorker};
use crate::retry::{RetryPass, RetryScheduler};

/// Event emitted by the job runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Runner started.
    WorkerStarted,
    /// Runner stopped after every role finished.
    WorkerStopped,
    /// An unsent sweep finished.
    DeliveryPassCompleted(DeliveryPass),
    /// A retry sweep finished, including the stale reaper.
    RetryPassCompleted { retry: RetryPass, reaped: usize },
    /// A cleanup sweep finished.
    CleanupCompleted(CleanupPass),
    /// Campaign promotion and batches finished.
    CampaignPassCompleted(CampaignPass),
    /// A role's pass returned an error; the role keeps running.
    PassFailed { role: &'static str, error: String },
}

/// Handle for controlling a running job runner.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the runner to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Get a receiver for runner events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }

    /// Wait until every role has stopped.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("job runner task failed: {e}")))
    }
}

/// Owns the delivery worker, retry scheduler, cleanup and campaign
/// orchestrator, and runs each on its own interval.
pub struct JobRunner {
    delivery: DeliveryWorker,
    retry: RetryScheduler,
    cleanup: Cleanup,
    campaigns: CampaignOrchestrator,
    config: WorkerConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobRunner {
    pub fn new(
        repos: &Repositories,
        dispatch: &DispatchServices,
        drivers: DriverRegistry,
        directory: Arc<dyn UserDirectory>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        let delivery = DeliveryWorker::new(
            repos,
            drivers,
            directory.clone(),
            clock.clone(),
            config.clone(),
        );
        let retry = RetryScheduler::new(delivery.clone(), repos, clock.clone(), config.clone());
        let cleanup = Cleanup::new(repos, clock.clone(), config.clone());
        let campaigns = CampaignOrchestrator::new(
            repos.campaigns.clone(),
            dispatch.dispatcher.clone(),
            directory,
            clock,
            dispatch.config.dispatch_timeout,
        );
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);

        Self {
            delivery,
            retry,
            cleanup,
            campaigns,
            config,
            event_tx,
        }
    }

    pub fn delivery(&self) -> &DeliveryWorker {
        &self.delivery
    }

    pub fn retry(&self) -> &RetryScheduler {
        &self.retry
    }

    pub fn cleanup(&self) -> &Cleanup {
        &self.cleanup
    }

    pub fn campaigns(&self) -> &CampaignOrchestrator {
        &self.campaigns
    }

    /// Get a receiver for runner events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Run each role once, in order: campaigns, unsent, retries, cleanup.
    /// A failing role does not stop the ones after it; the first error is
    /// returned.
    pub async fn run_once(&self, ctx: &CallContext) -> Result<()> {
        let campaign = self.campaign_tick(ctx).await;
        let delivery = self.delivery_tick(ctx).await;
        let retry = self.retry_tick(ctx).await;
        self.cleanup_tick().await;
        campaign.and(delivery).and(retry)
    }

    async fn delivery_tick(&self, ctx: &CallContext) -> Result<()> {
        let pass = self.delivery.run_pass(ctx).await?;
        let _ = self.event_tx.send(WorkerEvent::DeliveryPassCompleted(pass));
        Ok(())
    }

    async fn retry_tick(&self, ctx: &CallContext) -> Result<()> {
        let reaped = match self.retry.reap_stale(self.config.retry_batch_size).await {
            Ok(reaped) => reaped,
            Err(e) => {
                self.report("retry", Err(e));
                0
            }
        };
        let retry = self
            .retry
            .retry_failed(ctx, self.config.retry_batch_size)
            .await?;
        let _ = self
            .event_tx
            .send(WorkerEvent::RetryPassCompleted { retry, reaped });
        Ok(())
    }

    async fn cleanup_tick(&self) {
        let pass = self.cleanup.run_pass().await;
        let _ = self.event_tx.send(WorkerEvent::CleanupCompleted(pass));
    }

    async fn campaign_tick(&self, ctx: &CallContext) -> Result<()> {
        let pass = self.campaigns.run_pass(ctx).await?;
        let _ = self.event_tx.send(WorkerEvent::CampaignPassCompleted(pass));
        if pass.errors > 0 {
            return Err(Error::Internal(format!(
                "{} campaign(s) failed this pass",
                pass.errors
            )));
        }
        Ok(())
    }

    /// Start every role and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let runner = Arc::new(self);
        let task = tokio::spawn(async move {
            runner.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
            task,
        }
    }

    #[instrument(skip(self, shutdown_rx), fields(subsystem = "worker"))]
    async fn run(self: &Arc<Self>, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Job runner is disabled, not starting");
            return;
        }

        info!(
            delivery_interval_ms = self.config.delivery_interval.as_millis() as u64,
            retry_interval_ms = self.config.retry_interval.as_millis() as u64,
            cleanup_interval_ms = self.config.cleanup_interval.as_millis() as u64,
            campaign_interval_ms = self.config.campaign_interval.as_millis() as u64,
            "Job runner started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let token = CancellationToken::new();
        let ctx = CallContext::from_token(token.clone());
        let mut roles = tokio::task::JoinSet::new();

        let r = self.clone();
        let c = ctx.clone();
        roles.spawn(every(
            "delivery",
            self.config.delivery_interval,
            token.clone(),
            move || {
                let (r, c) = (r.clone(), c.clone());
                async move { r.report("delivery", r.delivery_tick(&c).await) }
            },
        ));

        let r = self.clone();
        let c = ctx.clone();
        roles.spawn(every(
            "retry",
            self.config.retry_interval,
            token.clone(),
            move || {
                let (r, c) = (r.clone(), c.clone());
                async move { r.report("retry", r.retry_tick(&c).await) }
            },
        ));

        let r = self.clone();
        roles.spawn(every(
            "cleanup",
            self.config.cleanup_interval,
            token.clone(),
            move || {
                let r = r.clone();
                async move { r.cleanup_tick().await }
            },
        ));

        let r = self.clone();
        let c = ctx.clone();
        roles.spawn(every(
            "campaign",
            self.config.campaign_interval,
            token.clone(),
            move || {
                let (r, c) = (r.clone(), c.clone());
                async move { r.report("campaign", r.campaign_tick(&c).await) }
            },
        ));

        let _ = shutdown_rx.recv().await;
        info!("Job runner received shutdown signal");
        token.cancel();
        while let Some(result) = roles.join_next().await {
            if let Err(e) = result {
                error!(error = ?e, "Job role panicked");
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Job runner stopped");
    }

    fn report(&self, role: &'static str, result: Result<()>) {
        if let Err(e) = result {
            if matches!(e, Error::Cancelled) {
                return;
            }
            error!(role, error = %e, "Job pass failed");
            let _ = self.event_tx.send(WorkerEvent::PassFailed {
                role,
                error: e.to_string(),
            });
        }
    }
}

/// Call `tick` immediately, then every `interval` until `token` is cancelled.
async fn every<F, Fut>(role: &'static str, interval: Duration, token: CancellationToken, tick: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        if token.is_cancelled() {
            break;
        }
        tick().await;
        tokio::select! {
            _ = token.cancelled() => break,
            _ = sleep(interval) => {}
        }
    }
    info!(subsystem = "worker", role, "Job role stopped");
}
