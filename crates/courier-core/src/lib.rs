//! # courier-core
//!
//! Core types, traits, and abstractions for the courier notification
//! subsystem.
//!
//! This crate provides:
//! - Domain models (notifications, delivery attempts, templates, preferences,
//!   rate windows, campaigns)
//! - Repository traits implemented by `courier-db`
//! - Outbound ports for channel drivers and the user directory
//! - The error taxonomy shared by every crate
//! - Pure helpers for rendering, quiet hours, backoff, and idempotency keys

pub mod context;
pub mod defaults;
pub mod error;
pub mod keys;
pub mod models;
pub mod render;
pub mod schedule;
pub mod traits;

pub use context::{CallContext, Clock, ManualClock, SystemClock};
pub use error::{DriverError, Error, Result};
pub use models::*;
pub use traits::*;
