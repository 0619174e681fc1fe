//! Maintenance sweeps: expired notifications, old read notifications and
//! closed rate windows.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use courier_core::{Clock, NotificationRepository, RateLimitRepository, Result};
use courier_db::Repositories;

use crate::config::WorkerConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupPass {
    pub expired: u64,
    pub old_read: u64,
    pub rate_windows: u64,
}

#[derive(Clone)]
pub struct Cleanup {
    notifications: Arc<dyn NotificationRepository>,
    rate_limits: Arc<dyn RateLimitRepository>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
}

impl Cleanup {
    pub fn new(repos: &Repositories, clock: Arc<dyn Clock>, config: WorkerConfig) -> Self {
        Self {
            notifications: repos.notifications.clone(),
            rate_limits: repos.rate_limits.clone(),
            clock,
            config,
        }
    }

    pub async fn delete_expired(&self) -> Result<u64> {
        self.notifications.delete_expired(self.clock.now()).await
    }

    pub async fn delete_old_read(&self) -> Result<u64> {
        self.notifications
            .delete_old_read(self.clock.now() - self.config.read_retention)
            .await
    }

    pub async fn delete_closed_windows(&self) -> Result<u64> {
        self.rate_limits
            .delete_expired_windows(self.clock.now())
            .await
    }

    /// Run every sweep; one failing sweep does not stop the others.
    #[instrument(skip(self), fields(subsystem = "sweep", op = "cleanup"))]
    pub async fn run_pass(&self) -> CleanupPass {
        let pass = CleanupPass {
            expired: log_sweep("expired", self.delete_expired().await),
            old_read: log_sweep("old_read", self.delete_old_read().await),
            rate_windows: log_sweep("rate_windows", self.delete_closed_windows().await),
        };
        if pass != CleanupPass::default() {
            info!(
                expired = pass.expired,
                old_read = pass.old_read,
                rate_windows = pass.rate_windows,
                "Cleanup finished"
            );
        }
        pass
    }
}

fn log_sweep(sweep: &str, result: Result<u64>) -> u64 {
    result.unwrap_or_else(|e| {
        warn!(sweep, error = %e, "Cleanup sweep failed");
        0
    })
}
