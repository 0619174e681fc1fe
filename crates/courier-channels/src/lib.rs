//! # courier-channels
//!
//! Channel drivers for the courier notification subsystem.
//!
//! Every driver implements [`courier_core::ChannelDriver`]: it sends one
//! rendered message within the caller's deadline and reports failures as
//! transient (retried with backoff) or permanent (never retried).
//!
//! - [`EmailDriver`]: SMTP via `lettre`
//! - [`SmsDriver`] and [`PushDriver`]: JSON over HTTP via `reqwest`
//! - [`InAppDriver`]: no-op, the stored notification is the delivery
//! - `MockDriver`: scripted outcomes for tests (feature `mock`)

pub mod email;
pub mod gateway;
pub mod in_app;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod push;
pub mod registry;
pub mod sms;

pub use email::{EmailConfig, EmailDriver};
pub use gateway::{GatewayAuth, GatewayClient, SIGNATURE_HEADER};
pub use in_app::InAppDriver;
#[cfg(any(test, feature = "mock"))]
pub use mock::{MockCall, MockDriver};
pub use push::{PushConfig, PushDriver};
pub use registry::DriverRegistry;
pub use sms::{SmsConfig, SmsDriver};
