//! # courier-jobs
//!
//! Background processing for the courier notification subsystem.
//!
//! This crate provides:
//! - The delivery worker that sends unsent notifications through channel drivers
//! - The retry scheduler with exponential backoff and the stale attempt reaper
//! - The campaign orchestrator that fans campaigns out in paced batches
//! - Cleanup of expired notifications, old read notifications and rate windows
//! - A `JobRunner` that runs every role on its own interval with graceful shutdown
//!
//! ## Example
//!
//! ```ignore
//! use courier_jobs::{JobRunner, WorkerConfig};
//!
//! let runner = JobRunner::new(
//!     &repos,
//!     &dispatch,
//!     DriverRegistry::from_env()?,
//!     Arc::new(db.directory.clone()),
//!     Arc::new(SystemClock),
//!     WorkerConfig::from_env(),
//! );
//! let handle = runner.start();
//!
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//!
//! handle.shutdown().await?;
//! handle.join().await?;
//! ```

pub mod campaign;
pub mod cleanup;
pub mod config;
pub mod delivery;
pub mod retry;
pub mod runner;

pub use campaign::{BatchOutcome, CampaignOrchestrator, CampaignPass};
pub use cleanup::{Cleanup, CleanupPass};
pub use config::WorkerConfig;
pub use delivery::{ChannelOutcome, DeliveryPass, DeliveryReport, DeliveryWorker};
pub use retry::{RetryPass, RetryScheduler};
pub use runner::{JobRunner, WorkerEvent, WorkerHandle};
